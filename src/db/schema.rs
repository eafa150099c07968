//! Database schema definitions

// === ROLLUP TABLES (written by the sync and validation jobs) ===

pub const CREATE_STATISTICS_ACCUMULATED_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS statistics_accumulated (
    org_id INTEGER NOT NULL,
    stat_type TEXT NOT NULL,
    stat_key TEXT NOT NULL,
    total_submissions INTEGER NOT NULL DEFAULT 0,
    total_completions INTEGER NOT NULL DEFAULT 0,
    distribution TEXT NOT NULL DEFAULT '{}',  -- JSON: {"origin": {"adhoc": 3, ...}, "risk": {...}}
    first_occurred_at BIGINT,                 -- Unix millis
    last_occurred_at BIGINT,
    updated_at BIGINT NOT NULL,
    UNIQUE (org_id, stat_type, stat_key)
)
"#;

pub const CREATE_STATISTICS_DAILY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS statistics_daily (
    org_id INTEGER NOT NULL,
    stat_type TEXT NOT NULL,
    stat_key TEXT NOT NULL,
    stat_date TEXT NOT NULL,  -- YYYY-MM-DD
    submission_count INTEGER NOT NULL DEFAULT 0,
    completion_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE (org_id, stat_type, stat_key, stat_date)
)
"#;

pub const CREATE_STATISTICS_PLAN_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS statistics_plan (
    org_id INTEGER NOT NULL,
    plan_id INTEGER NOT NULL,
    total_tasks INTEGER NOT NULL DEFAULT 0,
    completed_tasks INTEGER NOT NULL DEFAULT 0,
    pending_tasks INTEGER NOT NULL DEFAULT 0,
    expired_tasks INTEGER NOT NULL DEFAULT 0,
    enrolled_testees INTEGER NOT NULL DEFAULT 0,
    active_testees INTEGER NOT NULL DEFAULT 0,
    updated_at BIGINT NOT NULL,
    UNIQUE (org_id, plan_id)
)
"#;

// === TRANSACTIONAL TABLES (owned by the platform, read-only here) ===

pub const CREATE_QUESTIONNAIRE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS questionnaire (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    code TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    created_at BIGINT NOT NULL,
    deleted_at BIGINT
)
"#;

pub const CREATE_TESTEE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS testee (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    created_at BIGINT NOT NULL,
    deleted_at BIGINT
)
"#;

pub const CREATE_ASSESSMENT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS assessment (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    testee_id INTEGER NOT NULL,
    questionnaire_code TEXT NOT NULL,
    origin_type TEXT NOT NULL DEFAULT 'adhoc',  -- adhoc | plan | screening
    status TEXT NOT NULL DEFAULT 'pending',     -- pending | submitted | interpreted | failed
    risk_level TEXT,                            -- none | low | medium | high | severe
    created_at BIGINT NOT NULL,
    submitted_at BIGINT,
    interpreted_at BIGINT,
    deleted_at BIGINT
)
"#;

pub const CREATE_ASSESSMENT_TASK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS assessment_task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    plan_id INTEGER NOT NULL,
    testee_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',  -- pending | opened | completed | expired | cancelled
    planned_at BIGINT NOT NULL,
    completed_at BIGINT,
    deleted_at BIGINT
)
"#;

pub const CREATE_ASSESSMENT_PLAN_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS assessment_plan (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    scale_code TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'active',
    created_at BIGINT NOT NULL,
    deleted_at BIGINT
)
"#;

// === INDEXES ===

// For per-questionnaire counts and origin breakdown
pub const CREATE_INDEX_ASSESSMENT_QUESTIONNAIRE: &str =
    "CREATE INDEX IF NOT EXISTS idx_assessment_org_questionnaire ON assessment(org_id, questionnaire_code)";

// For per-testee counts and risk breakdown
pub const CREATE_INDEX_ASSESSMENT_TESTEE: &str =
    "CREATE INDEX IF NOT EXISTS idx_assessment_org_testee ON assessment(org_id, testee_id)";

// For today's deltas and the 30-day trend
pub const CREATE_INDEX_ASSESSMENT_CREATED: &str =
    "CREATE INDEX IF NOT EXISTS idx_assessment_org_created ON assessment(org_id, created_at)";

// For plan task rollups
pub const CREATE_INDEX_TASK_PLAN: &str =
    "CREATE INDEX IF NOT EXISTS idx_task_org_plan ON assessment_task(org_id, plan_id, status)";

pub const MIGRATIONS: &[&str] = &[
    CREATE_STATISTICS_ACCUMULATED_TABLE,
    CREATE_STATISTICS_DAILY_TABLE,
    CREATE_STATISTICS_PLAN_TABLE,
    CREATE_QUESTIONNAIRE_TABLE,
    CREATE_TESTEE_TABLE,
    CREATE_ASSESSMENT_TABLE,
    CREATE_ASSESSMENT_TASK_TABLE,
    CREATE_ASSESSMENT_PLAN_TABLE,
    CREATE_INDEX_ASSESSMENT_QUESTIONNAIRE,
    CREATE_INDEX_ASSESSMENT_TESTEE,
    CREATE_INDEX_ASSESSMENT_CREATED,
    CREATE_INDEX_TASK_PLAN,
];
