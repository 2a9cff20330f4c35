use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

use arbiter_core::domain::budget::BudgetSession;
use arbiter_core::domain::hold::Hold;
use arbiter_core::domain::intent::{Decision, DecisionAction, Intent};
use arbiter_core::engine::{DecisionLog, DecisionLogError};

use crate::DbPool;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for DecisionLogError {
    fn from(value: RepositoryError) -> Self {
        DecisionLogError::Unavailable(value.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecentDecision {
    pub intent_type: String,
    pub resource: String,
    pub action: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecisionMetrics {
    /// Decision counts by action over the trailing hour.
    pub decision_counts: BTreeMap<String, i64>,
    pub recent_decisions: Vec<RecentDecision>,
}

/// Durable decision log: one row per decision, queried back for frequency
/// caps, per-resource history, and service metrics.
pub struct SqlDecisionLog {
    pool: DbPool,
}

impl SqlDecisionLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        intent: &Intent,
        decision: &Decision,
    ) -> Result<(), RepositoryError> {
        let intent_json = serde_json::to_string(intent)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        let decision_json = serde_json::to_string(decision)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO decisions \
             (id, intent_type, resource, author, action, reason, intent_json, decision_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&intent.intent_type)
        .bind(&intent.resource)
        .bind(&intent.author)
        .bind(decision.action.as_str())
        .bind(&decision.reason)
        .bind(intent_json)
        .bind(decision_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn admitted_count_since(
        &self,
        intent_type: &str,
        resource: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM decisions \
             WHERE intent_type = ? AND resource = ? AND action = ? AND created_at >= ?",
        )
        .bind(intent_type)
        .bind(resource)
        .bind(DecisionAction::Accept.as_str())
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    pub async fn history_for_resource(
        &self,
        resource: &str,
        limit: u32,
    ) -> Result<Vec<RecentDecision>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT intent_type, resource, action, reason, created_at FROM decisions \
             WHERE resource = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(resource)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_recent_decision).collect()
    }

    pub async fn metrics(&self) -> Result<DecisionMetrics, RepositoryError> {
        let hour_ago = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();

        let count_rows = sqlx::query(
            "SELECT action, COUNT(*) AS count FROM decisions \
             WHERE created_at >= ? GROUP BY action",
        )
        .bind(&hour_ago)
        .fetch_all(&self.pool)
        .await?;

        let mut decision_counts = BTreeMap::new();
        for row in &count_rows {
            let action: String =
                row.try_get("action").map_err(|e| RepositoryError::Decode(e.to_string()))?;
            let count: i64 =
                row.try_get("count").map_err(|e| RepositoryError::Decode(e.to_string()))?;
            decision_counts.insert(action, count);
        }

        let recent_rows = sqlx::query(
            "SELECT intent_type, resource, action, reason, created_at FROM decisions \
             ORDER BY created_at DESC LIMIT 10",
        )
        .fetch_all(&self.pool)
        .await?;
        let recent_decisions =
            recent_rows.iter().map(row_to_recent_decision).collect::<Result<Vec<_>, _>>()?;

        Ok(DecisionMetrics { decision_counts, recent_decisions })
    }
}

fn row_to_recent_decision(row: &sqlx::sqlite::SqliteRow) -> Result<RecentDecision, RepositoryError> {
    let intent_type: String =
        row.try_get("intent_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let resource: String =
        row.try_get("resource").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let action: String =
        row.try_get("action").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let reason: String =
        row.try_get("reason").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_raw: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let created_at = DateTime::parse_from_rfc3339(&created_at_raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(RecentDecision { intent_type, resource, action, reason, created_at })
}

#[async_trait]
impl DecisionLog for SqlDecisionLog {
    async fn record(&self, intent: &Intent, decision: &Decision) -> Result<(), DecisionLogError> {
        self.insert(intent, decision).await.map_err(DecisionLogError::from)
    }

    async fn count_admitted_since(
        &self,
        intent_type: &str,
        resource: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DecisionLogError> {
        self.admitted_count_since(intent_type, resource, since)
            .await
            .map_err(DecisionLogError::from)
    }
}

/// Upserts the latest observed state of each hold.
pub struct HoldAuditRepository {
    pool: DbPool,
}

impl HoldAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, hold: &Hold) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO holds (token, resource, holder, ttl_s, state, correlation, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (token) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
        )
        .bind(&hold.token.0)
        .bind(&hold.resource)
        .bind(&hold.holder)
        .bind(i64::from(hold.ttl_s))
        .bind(hold.state.as_str())
        .bind(&hold.correlation)
        .bind(hold.requested_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_in_state(&self, state: &str) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM holds WHERE state = ?")
            .bind(state)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Upserts the latest observed state of each budget session.
pub struct BudgetAuditRepository {
    pool: DbPool,
}

impl BudgetAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, session: &BudgetSession) -> Result<(), RepositoryError> {
        let tags_json = serde_json::to_string(&session.tags)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO budgets (session_id, usd_cap, rpm, spent_usd, state, tags_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (session_id) DO UPDATE SET \
             spent_usd = excluded.spent_usd, state = excluded.state, updated_at = excluded.updated_at",
        )
        .bind(&session.id.0)
        .bind(session.usd_cap.to_string())
        .bind(i64::from(session.rpm))
        .bind(session.spent_usd.to_string())
        .bind(session.state.as_str())
        .bind(tags_json)
        .bind(session.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_in_state(&self, state: &str) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM budgets WHERE state = ?")
            .bind(state)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::VecDeque;

    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use arbiter_core::domain::budget::{BudgetSession, BudgetSessionId, BudgetState};
    use arbiter_core::domain::hold::{Hold, HoldState, HoldToken};
    use arbiter_core::domain::intent::{Decision, DecisionAction, Intent, IntentScope};

    use crate::connect_with_settings;
    use crate::migrations::run_pending;

    use super::{BudgetAuditRepository, HoldAuditRepository, SqlDecisionLog};

    async fn test_pool() -> crate::DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        run_pending(&pool).await.expect("migrate");
        pool
    }

    fn sample_intent(intent_type: &str, resource: &str) -> Intent {
        Intent {
            intent_type: intent_type.to_string(),
            resource: resource.to_string(),
            action: "send".to_string(),
            author: "agent-a".to_string(),
            scope: IntentScope::Write,
            ttl_s: 90,
            meta: BTreeMap::new(),
        }
    }

    fn decision(action: DecisionAction, reason: &str) -> Decision {
        Decision::new(action, reason, "test decision")
    }

    #[tokio::test]
    async fn admitted_count_ignores_denials_and_other_keys() {
        let pool = test_pool().await;
        let log = SqlDecisionLog::new(pool);
        let intent = sample_intent("contact.email", "contact:42/email");

        log.insert(&intent, &decision(DecisionAction::Accept, "admitted")).await.expect("insert");
        log.insert(&intent, &decision(DecisionAction::Deny, "frequency_cap_exceeded"))
            .await
            .expect("insert");
        log.insert(&sample_intent("contact.email", "contact:7/email"), &decision(DecisionAction::Accept, "admitted"))
            .await
            .expect("insert");

        let since = Utc::now() - Duration::hours(1);
        let count = log
            .admitted_count_since("contact.email", "contact:42/email", since)
            .await
            .expect("count");

        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn history_returns_latest_decisions_for_a_resource() {
        let pool = test_pool().await;
        let log = SqlDecisionLog::new(pool);
        let intent = sample_intent("doc.edit", "doc:7");

        log.insert(&intent, &decision(DecisionAction::Accept, "admitted")).await.expect("insert");
        log.insert(&intent, &decision(DecisionAction::Hold, "resource_locked"))
            .await
            .expect("insert");

        let history = log.history_for_resource("doc:7", 10).await.expect("history");
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|entry| entry.reason == "resource_locked"));
    }

    #[tokio::test]
    async fn metrics_count_decisions_by_action() {
        let pool = test_pool().await;
        let log = SqlDecisionLog::new(pool);

        log.insert(&sample_intent("a.b", "r:1"), &decision(DecisionAction::Accept, "admitted"))
            .await
            .expect("insert");
        log.insert(&sample_intent("a.b", "r:2"), &decision(DecisionAction::Deny, "incident_suppressed"))
            .await
            .expect("insert");

        let metrics = log.metrics().await.expect("metrics");
        assert_eq!(metrics.decision_counts.get("accept"), Some(&1));
        assert_eq!(metrics.decision_counts.get("deny"), Some(&1));
        assert_eq!(metrics.recent_decisions.len(), 2);
    }

    #[tokio::test]
    async fn hold_audit_upsert_tracks_state_transitions() {
        let pool = test_pool().await;
        let repo = HoldAuditRepository::new(pool);
        let now = Utc::now();
        let mut hold = Hold {
            token: HoldToken("h_audit".to_string()),
            resource: "ticket:1".to_string(),
            holder: "agent-a".to_string(),
            ttl_s: 120,
            state: HoldState::Active,
            correlation: None,
            arrival_seq: 1,
            requested_at: now,
            deadline: now + Duration::seconds(120),
            confirmed: false,
        };

        repo.upsert(&hold).await.expect("insert");
        assert_eq!(repo.count_in_state("active").await.expect("count"), 1);

        hold.state = HoldState::Released;
        repo.upsert(&hold).await.expect("update");
        assert_eq!(repo.count_in_state("active").await.expect("count"), 0);
        assert_eq!(repo.count_in_state("released").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn budget_audit_upsert_tracks_spend_and_state() {
        let pool = test_pool().await;
        let repo = BudgetAuditRepository::new(pool);
        let mut session = BudgetSession {
            id: BudgetSessionId("b_audit".to_string()),
            usd_cap: Decimal::new(500, 2),
            rpm: 10,
            spent_usd: Decimal::ZERO,
            request_timestamps: VecDeque::new(),
            tags: BTreeMap::from([("team".to_string(), "support".to_string())]),
            state: BudgetState::Active,
            stop_cause: None,
            created_at: Utc::now(),
            last_consumed_at: None,
        };

        repo.upsert(&session).await.expect("insert");
        assert_eq!(repo.count_in_state("active").await.expect("count"), 1);

        session.spent_usd = Decimal::new(300, 2);
        session.state = BudgetState::Stopped;
        repo.upsert(&session).await.expect("update");
        assert_eq!(repo.count_in_state("stopped").await.expect("count"), 1);
    }
}
