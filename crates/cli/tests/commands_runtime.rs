use std::env;
use std::sync::{Mutex, OnceLock};

use expensa_cli::commands::{config, doctor, migrate, seed};
use serde_json::Value;

const MEMORY_DB: (&str, &str) = ("EXPENSA_DATABASE_URL", "sqlite::memory:");

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[MEMORY_DB], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("EXPENSA_DATABASE_URL", "postgres://localhost/expensa")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn seed_lists_each_demo_expense() {
    with_env(&[MEMORY_DB], || {
        let result = seed::run(false);
        assert_eq!(result.exit_code, 0, "expected seed success: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "seed");
        assert_eq!(payload["status"], "ok");

        let message = payload["message"].as_str().unwrap_or_default();
        assert!(message.contains("  - exp-demo-001 [pending_approval]:"));
        assert!(message.contains("  - exp-demo-002 [approved]:"));
    });
}

#[test]
fn seed_is_repeatable_with_and_without_reset() {
    with_env(&[MEMORY_DB], || {
        let first = seed::run(false);
        let second = seed::run(true);
        assert_eq!(first.exit_code, 0, "first seed failed: {}", first.output);
        assert_eq!(second.exit_code, 0, "reset seed failed: {}", second.output);

        assert_eq!(parse_payload(&first.output)["message"], parse_payload(&second.output)["message"]);
    });
}

#[test]
fn config_attributes_env_overrides() {
    with_env(&[MEMORY_DB, ("EXPENSA_APPROVALS_NO_RULE_POLICY", "reject")], || {
        let output = config::run();

        assert!(output.contains("- database.url = sqlite::memory: (source: env (EXPENSA_DATABASE_URL))"));
        assert!(output.contains(
            "- approvals.no_rule_policy = reject (source: env (EXPENSA_APPROVALS_NO_RULE_POLICY))"
        ));
        assert!(output.contains("- currency.api_key = <unset>"));
    });
}

#[test]
fn doctor_reports_json_checks() {
    with_env(&[MEMORY_DB], || {
        let (healthy, output) = doctor::run(true);
        assert!(healthy, "doctor should pass: {output}");

        let payload = parse_payload(&output);
        assert_eq!(payload["overall_status"], "pass");
        let names = payload["checks"]
            .as_array()
            .map(|checks| checks.iter().filter_map(|c| c["name"].as_str()).collect::<Vec<_>>())
            .unwrap_or_default();
        assert_eq!(names, ["config_validation", "currency_conversion", "expense_store"]);
    });
}

#[test]
fn doctor_fails_and_skips_when_config_is_invalid() {
    with_env(&[("EXPENSA_DATABASE_MAX_CONNECTIONS", "0")], || {
        let (healthy, output) = doctor::run(false);
        assert!(!healthy);
        assert!(output.starts_with("doctor: one or more readiness checks failed"));
        assert!(output.contains("- [skip] expense_store:"));
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "EXPENSA_DATABASE_URL",
        "EXPENSA_DATABASE_MAX_CONNECTIONS",
        "EXPENSA_DATABASE_TIMEOUT_SECS",
        "EXPENSA_SERVER_BIND_ADDRESS",
        "EXPENSA_SERVER_PORT",
        "EXPENSA_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "EXPENSA_CURRENCY_ENABLED",
        "EXPENSA_CURRENCY_BASE_URL",
        "EXPENSA_CURRENCY_API_KEY",
        "EXPENSA_CURRENCY_TIMEOUT_SECS",
        "EXPENSA_APPROVALS_NO_RULE_POLICY",
        "EXPENSA_LOGGING_LEVEL",
        "EXPENSA_LOGGING_FORMAT",
        "EXPENSA_LOG_LEVEL",
        "EXPENSA_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
