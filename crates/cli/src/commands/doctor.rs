use expensa_core::config::{AppConfig, LoadOptions};
use expensa_db::connect;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> (bool, String) {
    let report = build_report();
    let healthy = report.overall_status != CheckStatus::Fail;

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        });
        return (healthy, output);
    }

    (healthy, render_human(&report))
}

fn build_report() -> DoctorReport {
    let checks = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => vec![
            DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            },
            check_currency(&config),
            check_database(&config),
        ],
        Err(error) => {
            let skipped = |name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            };
            vec![
                DoctorCheck {
                    name: "config_validation",
                    status: CheckStatus::Fail,
                    details: error.to_string(),
                },
                skipped("currency_conversion"),
                skipped("expense_store"),
            ]
        }
    };

    let failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let (overall_status, summary) = if failed {
        (CheckStatus::Fail, "doctor: one or more readiness checks failed")
    } else {
        (CheckStatus::Pass, "doctor: all readiness checks passed")
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

/// Conversion being off is legal but worth surfacing: multi-currency
/// expenses will be routed on their unconverted amounts.
fn check_currency(config: &AppConfig) -> DoctorCheck {
    if config.currency.enabled {
        DoctorCheck {
            name: "currency_conversion",
            status: CheckStatus::Pass,
            details: format!(
                "rates fetched from `{}` with a {}s timeout",
                config.currency.base_url, config.currency.timeout_secs
            ),
        }
    } else {
        DoctorCheck {
            name: "currency_conversion",
            status: CheckStatus::Warn,
            details: "disabled; foreign-currency expenses keep their original amounts".to_string(),
        }
    }
}

fn check_database(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "expense_store",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        pool.close().await;
        Ok::<(), String>(())
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "expense_store",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        },
        Err(details) => DoctorCheck { name: "expense_store", status: CheckStatus::Fail, details },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];
    lines.extend(report.checks.iter().map(|check| {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        format!("- [{marker}] {}: {}", check.name, check.details)
    }));
    lines.join("\n")
}
