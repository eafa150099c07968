//! Statistics data model: keys, rollup rows, typed distributions and views

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Stat key used for the per-organization system rollup.
pub const SYSTEM_STAT_KEY: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatType {
    System,
    Questionnaire,
    Testee,
    Plan,
    Screening,
}

impl StatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatType::System => "system",
            StatType::Questionnaire => "questionnaire",
            StatType::Testee => "testee",
            StatType::Plan => "plan",
            StatType::Screening => "screening",
        }
    }

    /// Whether counters for this type are written by the event path.
    /// System and plan statistics are always recomputed from source tables.
    pub fn is_counter_backed(&self) -> bool {
        matches!(
            self,
            StatType::Questionnaire | StatType::Testee | StatType::Screening
        )
    }
}

impl std::fmt::Display for StatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StatType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(StatType::System),
            "questionnaire" => Ok(StatType::Questionnaire),
            "testee" => Ok(StatType::Testee),
            "plan" => Ok(StatType::Plan),
            "screening" => Ok(StatType::Screening),
            _ => Err(format!("unknown stat type: {s}")),
        }
    }
}

/// Identifies one statistical subject within an organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatKey {
    pub org_id: i64,
    pub stat_type: StatType,
    pub stat_key: String,
}

impl StatKey {
    pub fn new(org_id: i64, stat_type: StatType, stat_key: impl Into<String>) -> Self {
        Self {
            org_id,
            stat_type,
            stat_key: stat_key.into(),
        }
    }

    pub fn system(org_id: i64) -> Self {
        Self::new(org_id, StatType::System, SYSTEM_STAT_KEY)
    }
}

/// One bucket of a daily time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: i64,
}

/// Stored daily rollup row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStatistics {
    pub key: StatKey,
    pub date: NaiveDate,
    pub submission_count: i64,
    pub completion_count: i64,
}

/// Stored accumulated rollup row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatedStatistics {
    pub key: StatKey,
    pub total_submissions: i64,
    pub total_completions: i64,
    pub distribution: Distribution,
    pub first_occurred_at: Option<DateTime<Utc>>,
    pub last_occurred_at: Option<DateTime<Utc>>,
}

impl AccumulatedStatistics {
    pub fn empty(key: StatKey) -> Self {
        Self {
            key,
            total_submissions: 0,
            total_completions: 0,
            distribution: Distribution::default(),
            first_occurred_at: None,
            last_occurred_at: None,
        }
    }

    /// Set both totals, keeping completions within submissions.
    pub fn set_totals(&mut self, submissions: i64, completions: i64) {
        self.total_submissions = submissions.max(0);
        self.total_completions = completions.clamp(0, self.total_submissions);
    }
}

/// Assessment counts by how the assessment was started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginDistribution {
    pub adhoc: i64,
    pub plan: i64,
    pub screening: i64,
}

impl OriginDistribution {
    /// Add `count` to the bucket named by an `assessment.origin_type` value.
    /// Unknown origins are reported back so callers can log them.
    pub fn record(&mut self, origin: &str, count: i64) -> bool {
        match origin {
            "adhoc" => self.adhoc += count,
            "plan" => self.plan += count,
            "screening" => self.screening += count,
            _ => return false,
        }
        true
    }
}

/// Interpreted assessment counts by risk level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskDistribution {
    pub none: i64,
    pub low: i64,
    pub medium: i64,
    pub high: i64,
    pub severe: i64,
}

impl RiskDistribution {
    pub fn record(&mut self, level: &str, count: i64) -> bool {
        match level {
            "none" => self.none += count,
            "low" => self.low += count,
            "medium" => self.medium += count,
            "high" => self.high += count,
            "severe" => self.severe += count,
            _ => return false,
        }
        true
    }
}

/// Assessment counts by lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusDistribution {
    pub pending: i64,
    pub submitted: i64,
    pub interpreted: i64,
    pub failed: i64,
}

impl StatusDistribution {
    pub fn record(&mut self, status: &str, count: i64) -> bool {
        match status {
            "pending" => self.pending += count,
            "submitted" => self.submitted += count,
            "interpreted" => self.interpreted += count,
            "failed" => self.failed += count,
            _ => return false,
        }
        true
    }

    pub fn total(&self) -> i64 {
        self.pending + self.submitted + self.interpreted + self.failed
    }
}

/// Organization-wide totals stored alongside the system rollup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemTotals {
    pub questionnaire_count: i64,
    pub testee_count: i64,
    pub today_new_assessments: i64,
    pub today_new_testees: i64,
    pub today_completed_assessments: i64,
}

/// Dimensional breakdown stored in the accumulated rollup as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginDistribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskDistribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusDistribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemTotals>,
}

impl Distribution {
    /// Overlay the dimensions present in `other`, keeping ours where it has none.
    pub fn merge(&mut self, other: Distribution) {
        if other.origin.is_some() {
            self.origin = other.origin;
        }
        if other.risk.is_some() {
            self.risk = other.risk;
        }
        if other.status.is_some() {
            self.status = other.status;
        }
        if other.system.is_some() {
            self.system = other.system;
        }
    }
}

/// Stored per-plan task rollup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRollup {
    pub org_id: i64,
    pub plan_id: i64,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub pending_tasks: i64,
    pub expired_tasks: i64,
    pub enrolled_testees: i64,
    pub active_testees: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatistics {
    pub org_id: i64,
    pub questionnaire_count: i64,
    pub testee_count: i64,
    pub assessment_count: i64,
    pub assessment_status: StatusDistribution,
    pub today_new_assessments: i64,
    pub today_new_testees: i64,
    pub today_completed_assessments: i64,
    pub completion_rate: f64,
    pub assessment_trend: Vec<DailyCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionnaireStatistics {
    pub org_id: i64,
    pub questionnaire_code: String,
    pub total_submissions: i64,
    pub total_completions: i64,
    pub completion_rate: f64,
    pub last_7_days: i64,
    pub last_15_days: i64,
    pub last_30_days: i64,
    pub origin: OriginDistribution,
    pub daily_trend: Vec<DailyCount>,
    pub trend_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TesteeStatistics {
    pub org_id: i64,
    pub testee_id: i64,
    pub total_assessments: i64,
    pub completed_assessments: i64,
    pub pending_assessments: i64,
    pub completion_rate: f64,
    pub risk: RiskDistribution,
    pub first_assessment_at: Option<DateTime<Utc>>,
    pub last_assessment_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatistics {
    pub org_id: i64,
    pub plan_id: i64,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub pending_tasks: i64,
    pub expired_tasks: i64,
    pub completion_rate: f64,
    pub enrolled_testees: i64,
    pub active_testees: i64,
    pub participation_rate: f64,
}
