use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::expense::{Expense, ExpenseCategory, ExpenseStatus};
use crate::domain::user::UserId;

const HIGH_AVERAGE_THRESHOLD: i64 = 1_000;
const HIGH_VOLUME_THRESHOLD: usize = 100;
const LARGE_EXPENSE_THRESHOLD: i64 = 5_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    ExpenseSummary,
    CategoryAnalysis,
    UserExpenses,
    ApprovalAnalysis,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpenseSummary => "expense_summary",
            Self::CategoryAnalysis => "category_analysis",
            Self::UserExpenses => "user_expenses",
            Self::ApprovalAnalysis => "approval_analysis",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "expense_summary" | "summary" => Some(Self::ExpenseSummary),
            "category_analysis" => Some(Self::CategoryAnalysis),
            "user_expenses" => Some(Self::UserExpenses),
            "approval_analysis" => Some(Self::ApprovalAnalysis),
            _ => None,
        }
    }
}

/// Narrows the expense set a report covers. Dates compare against
/// `expense_date` and are inclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFilter {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    /// When set, only expenses owned by these users count.
    pub owners: Option<BTreeSet<UserId>>,
}

impl ReportFilter {
    pub fn matches(&self, expense: &Expense) -> bool {
        self.start.map_or(true, |start| expense.expense_date >= start)
            && self.end.map_or(true, |end| expense.expense_date <= end)
            && self.owners.as_ref().map_or(true, |owners| owners.contains(&expense.owner_id))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub total: Decimal,
    pub average: Decimal,
    pub min: Decimal,
    pub max: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryBreakdown {
    pub category: ExpenseCategory,
    pub count: usize,
    pub total: Decimal,
    pub average: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBreakdown {
    pub status: ExpenseStatus,
    pub count: usize,
    pub total: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyTotal {
    /// `YYYY-MM`
    pub month: String,
    pub count: usize,
    pub total: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBreakdown {
    pub owner_id: UserId,
    pub count: usize,
    pub total: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRate {
    pub approved: usize,
    pub rejected: usize,
    pub pending: usize,
    /// approved / (approved + rejected) as a percentage; zero when nothing
    /// has been decided.
    pub rate: Decimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    HighAverage,
    HighVolume,
    LargeExpense,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insight {
    pub kind: InsightKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub report_type: ReportType,
    pub generated_at: DateTime<Utc>,
    pub filter: ReportFilter,
    pub summary: Summary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<CategoryBreakdown>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<StatusBreakdown>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_trend: Option<Vec<MonthlyTotal>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_user: Option<Vec<UserBreakdown>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_rate: Option<ApprovalRate>,
    pub insights: Vec<Insight>,
}

pub fn build_report(
    report_type: ReportType,
    expenses: &[Expense],
    filter: ReportFilter,
    now: DateTime<Utc>,
) -> Report {
    let selected: Vec<&Expense> = expenses.iter().filter(|expense| filter.matches(expense)).collect();
    let summary = summarize(&selected);
    let insights = insights(&summary);

    let mut report = Report {
        report_type,
        generated_at: now,
        filter,
        summary,
        categories: None,
        statuses: None,
        monthly_trend: None,
        by_user: None,
        approval_rate: None,
        insights,
    };

    match report_type {
        ReportType::ExpenseSummary => {
            report.categories = Some(category_breakdown(&selected));
            report.statuses = Some(status_breakdown(&selected));
            report.monthly_trend = Some(monthly_trend(&selected));
        }
        ReportType::CategoryAnalysis => {
            report.categories = Some(category_breakdown(&selected));
        }
        ReportType::UserExpenses => {
            report.by_user = Some(user_breakdown(&selected));
            report.monthly_trend = Some(monthly_trend(&selected));
        }
        ReportType::ApprovalAnalysis => {
            report.statuses = Some(status_breakdown(&selected));
            report.approval_rate = Some(approval_rate(&selected));
        }
    }

    report
}

pub fn summarize(expenses: &[&Expense]) -> Summary {
    let amounts: Vec<Decimal> = expenses.iter().map(|e| e.amount_in_base_currency).collect();
    let Some(min) = amounts.iter().copied().min() else {
        return Summary::default();
    };
    let max = amounts.iter().copied().max().unwrap_or(min);
    let total: Decimal = amounts.iter().copied().sum();

    Summary { count: amounts.len(), total, average: average(total, amounts.len()), min, max }
}

pub fn category_breakdown(expenses: &[&Expense]) -> Vec<CategoryBreakdown> {
    let mut groups: BTreeMap<ExpenseCategory, (usize, Decimal)> = BTreeMap::new();
    for expense in expenses {
        let entry = groups.entry(expense.category).or_insert((0, Decimal::ZERO));
        entry.0 += 1;
        entry.1 += expense.amount_in_base_currency;
    }

    let mut breakdown: Vec<CategoryBreakdown> = groups
        .into_iter()
        .map(|(category, (count, total))| CategoryBreakdown {
            category,
            count,
            total,
            average: average(total, count),
        })
        .collect();
    breakdown.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.category.cmp(&b.category)));
    breakdown
}

/// Per-status count and base-currency total, one row per status present.
pub fn status_breakdown(expenses: &[&Expense]) -> Vec<StatusBreakdown> {
    let mut groups: BTreeMap<ExpenseStatus, (usize, Decimal)> = BTreeMap::new();
    for expense in expenses {
        let entry = groups.entry(expense.status).or_insert((0, Decimal::ZERO));
        entry.0 += 1;
        entry.1 += expense.amount_in_base_currency;
    }
    groups
        .into_iter()
        .map(|(status, (count, total))| StatusBreakdown { status, count, total })
        .collect()
}

pub fn monthly_trend(expenses: &[&Expense]) -> Vec<MonthlyTotal> {
    let mut groups: BTreeMap<(i32, u32), (usize, Decimal)> = BTreeMap::new();
    for expense in expenses {
        let key = (expense.expense_date.year(), expense.expense_date.month());
        let entry = groups.entry(key).or_insert((0, Decimal::ZERO));
        entry.0 += 1;
        entry.1 += expense.amount_in_base_currency;
    }
    groups
        .into_iter()
        .map(|((year, month), (count, total))| MonthlyTotal {
            month: format!("{year:04}-{month:02}"),
            count,
            total,
        })
        .collect()
}

pub fn user_breakdown(expenses: &[&Expense]) -> Vec<UserBreakdown> {
    let mut groups: BTreeMap<UserId, (usize, Decimal)> = BTreeMap::new();
    for expense in expenses {
        let entry = groups.entry(expense.owner_id.clone()).or_insert((0, Decimal::ZERO));
        entry.0 += 1;
        entry.1 += expense.amount_in_base_currency;
    }
    let mut breakdown: Vec<UserBreakdown> = groups
        .into_iter()
        .map(|(owner_id, (count, total))| UserBreakdown { owner_id, count, total })
        .collect();
    breakdown.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.owner_id.cmp(&b.owner_id)));
    breakdown
}

pub fn approval_rate(expenses: &[&Expense]) -> ApprovalRate {
    let count = |wanted: &[ExpenseStatus]| {
        expenses.iter().filter(|expense| wanted.contains(&expense.status)).count()
    };
    // Paid expenses were approved first.
    let approved = count(&[ExpenseStatus::Approved, ExpenseStatus::Paid]);
    let rejected = count(&[ExpenseStatus::Rejected]);
    let pending = count(&[ExpenseStatus::PendingApproval]);

    let decided = approved + rejected;
    let rate = if decided == 0 {
        Decimal::ZERO
    } else {
        (Decimal::from(approved as u64) * Decimal::ONE_HUNDRED / Decimal::from(decided as u64))
            .round_dp(2)
    };

    ApprovalRate { approved, rejected, pending, rate }
}

pub fn insights(summary: &Summary) -> Vec<Insight> {
    let mut insights = Vec::new();
    if summary.average > Decimal::from(HIGH_AVERAGE_THRESHOLD) {
        insights.push(Insight {
            kind: InsightKind::HighAverage,
            message: format!(
                "Average expense of {} is above {HIGH_AVERAGE_THRESHOLD}; review spending policy",
                summary.average
            ),
        });
    }
    if summary.count > HIGH_VOLUME_THRESHOLD {
        insights.push(Insight {
            kind: InsightKind::HighVolume,
            message: format!(
                "{} expenses in the period; consider batching approvals",
                summary.count
            ),
        });
    }
    if summary.max > Decimal::from(LARGE_EXPENSE_THRESHOLD) {
        insights.push(Insight {
            kind: InsightKind::LargeExpense,
            message: format!(
                "Largest expense of {} exceeds {LARGE_EXPENSE_THRESHOLD}; confirm it was reviewed",
                summary.max
            ),
        });
    }
    insights
}

fn average(total: Decimal, count: usize) -> Decimal {
    if count == 0 {
        return Decimal::ZERO;
    }
    (total / Decimal::from(count as u64)).round_dp(2)
}
