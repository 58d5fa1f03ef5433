use expensa_db::{DemoSeedDataset, ExpenseSeedInfo};

use crate::commands::{
    migrated_pool, prepare, CommandResult, StepFailure, EXIT_MIGRATION, EXIT_SEED_VERIFICATION,
};

/// Loads the demo company. With `reset`, previously seeded rows are removed
/// first so decided expenses return to their seeded state.
pub fn run(reset: bool) -> CommandResult {
    let (config, runtime) = match prepare("seed") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;
        let outcome = load(&pool, reset).await;
        pool.close().await;
        outcome
    });

    match result {
        Ok(expenses) => CommandResult::success("seed", summary(&expenses)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

async fn load(pool: &expensa_db::DbPool, reset: bool) -> Result<Vec<ExpenseSeedInfo>, StepFailure> {
    if reset {
        DemoSeedDataset::clean(pool)
            .await
            .map_err(|error| ("seed_reset", error.to_string(), EXIT_MIGRATION))?;
    }

    let seeded = DemoSeedDataset::load(pool)
        .await
        .map_err(|error| ("seed_execution", error.to_string(), EXIT_MIGRATION))?;

    let verification = DemoSeedDataset::verify(pool)
        .await
        .map_err(|error| ("seed_verification", error.to_string(), EXIT_SEED_VERIFICATION))?;
    if !verification.all_present {
        return Err(("seed_verification", failed_checks_message(&verification.checks), EXIT_SEED_VERIFICATION));
    }

    Ok(seeded.expenses_seeded)
}

fn summary(expenses: &[ExpenseSeedInfo]) -> String {
    let lines = expenses
        .iter()
        .map(|expense| format!("  - {} [{}]: {}", expense.expense_id, expense.status, expense.description))
        .collect::<Vec<_>>();
    format!("demo company seeded with {} expenses:\n{}", expenses.len(), lines.join("\n"))
}

fn failed_checks_message(checks: &[(&'static str, bool)]) -> String {
    let failed = checks.iter().filter_map(|(check, passed)| (!passed).then_some(*check)).collect::<Vec<_>>();
    if failed.is_empty() {
        "some seed data failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use expensa_db::ExpenseSeedInfo;

    use super::{failed_checks_message, summary};

    #[test]
    fn verification_message_names_failed_checks() {
        let checks = [("company", true), ("exp-demo-001", false), ("exp-demo-002-trail", false)];

        assert_eq!(
            failed_checks_message(&checks),
            "seed verification failed for checks: exp-demo-001, exp-demo-002-trail"
        );
    }

    #[test]
    fn verification_message_falls_back_when_nothing_is_labelled() {
        assert_eq!(failed_checks_message(&[("users", true)]), "some seed data failed to load");
    }

    #[test]
    fn summary_lists_each_expense_with_its_state() {
        let expenses = [ExpenseSeedInfo {
            expense_id: "exp-demo-001",
            status: "pending_approval",
            description: "Travel awaiting approval",
        }];

        assert_eq!(
            summary(&expenses),
            "demo company seeded with 1 expenses:\n  - exp-demo-001 [pending_approval]: Travel awaiting approval"
        );
    }
}
