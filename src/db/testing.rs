use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{to_millis, Database};

pub async fn test_database() -> Database {
    let db = Database::in_memory().await.unwrap();
    db.run_migrations().await.unwrap();
    db
}

pub async fn insert_questionnaire(pool: &SqlitePool, org_id: i64, code: &str) {
    sqlx::query("INSERT INTO questionnaire (org_id, code, created_at) VALUES (?, ?, ?)")
        .bind(org_id)
        .bind(code)
        .bind(to_millis(Utc::now()))
        .execute(pool)
        .await
        .unwrap();
}

pub async fn insert_testee(pool: &SqlitePool, org_id: i64, created_at: DateTime<Utc>) -> i64 {
    sqlx::query("INSERT INTO testee (org_id, created_at) VALUES (?, ?)")
        .bind(org_id)
        .bind(to_millis(created_at))
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

pub struct AssessmentFixture<'a> {
    pub org_id: i64,
    pub testee_id: i64,
    pub questionnaire_code: &'a str,
    pub origin_type: &'a str,
    pub status: &'a str,
    pub risk_level: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

impl<'a> AssessmentFixture<'a> {
    pub fn new(org_id: i64, testee_id: i64, questionnaire_code: &'a str) -> Self {
        Self {
            org_id,
            testee_id,
            questionnaire_code,
            origin_type: "adhoc",
            status: "interpreted",
            risk_level: None,
            created_at: Utc::now(),
        }
    }
}

pub async fn insert_assessment(pool: &SqlitePool, a: &AssessmentFixture<'_>) -> i64 {
    let created = to_millis(a.created_at);
    let submitted = (a.status != "pending").then_some(created);
    let interpreted = (a.status == "interpreted").then_some(created);
    sqlx::query(
        r#"
        INSERT INTO assessment
            (org_id, testee_id, questionnaire_code, origin_type, status, risk_level, created_at, submitted_at, interpreted_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(a.org_id)
    .bind(a.testee_id)
    .bind(a.questionnaire_code)
    .bind(a.origin_type)
    .bind(a.status)
    .bind(a.risk_level)
    .bind(created)
    .bind(submitted)
    .bind(interpreted)
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

pub async fn insert_plan(pool: &SqlitePool, org_id: i64) -> i64 {
    sqlx::query("INSERT INTO assessment_plan (org_id, created_at) VALUES (?, ?)")
        .bind(org_id)
        .bind(to_millis(Utc::now()))
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

pub async fn insert_task(pool: &SqlitePool, org_id: i64, plan_id: i64, testee_id: i64, status: &str) {
    sqlx::query(
        "INSERT INTO assessment_task (org_id, plan_id, testee_id, status, planned_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(org_id)
    .bind(plan_id)
    .bind(testee_id)
    .bind(status)
    .bind(to_millis(Utc::now()))
    .execute(pool)
    .await
    .unwrap();
}

pub async fn soft_delete(pool: &SqlitePool, table: &str, id: i64) {
    sqlx::query(&format!("UPDATE {table} SET deleted_at = ? WHERE id = ?"))
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}
