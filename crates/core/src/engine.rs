use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::budget::BudgetGuard;
use crate::domain::hold::HoldState;
use crate::domain::intent::{reason, Decision, DecisionAction, Intent, IntentScope, META_CORRELATION};
use crate::holds::{HoldError, HoldManager};
use crate::policy::PolicyDocument;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecisionLogError {
    #[error("decision store unavailable: {0}")]
    Unavailable(String),
}

/// Store abstraction behind the decision audit trail and the rolling
/// frequency-cap counter. The engine never touches storage directly.
#[async_trait]
pub trait DecisionLog: Send + Sync {
    async fn record(&self, intent: &Intent, decision: &Decision) -> Result<(), DecisionLogError>;

    /// Admitted intents of this type for this resource since `since`.
    async fn count_admitted_since(
        &self,
        intent_type: &str,
        resource: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DecisionLogError>;
}

#[derive(Clone, Debug)]
struct RecordedDecision {
    intent_type: String,
    resource: String,
    action: DecisionAction,
    recorded_at: DateTime<Utc>,
}

/// Process-local decision log, used by tests and ghost-runs.
#[derive(Default)]
pub struct InMemoryDecisionLog {
    entries: Mutex<Vec<RecordedDecision>>,
}

#[async_trait]
impl DecisionLog for InMemoryDecisionLog {
    async fn record(&self, intent: &Intent, decision: &Decision) -> Result<(), DecisionLogError> {
        let mut entries = self.entries.lock().await;
        entries.push(RecordedDecision {
            intent_type: intent.intent_type.clone(),
            resource: intent.resource.clone(),
            action: decision.action,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn count_admitted_since(
        &self,
        intent_type: &str,
        resource: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DecisionLogError> {
        let entries = self.entries.lock().await;
        let count = entries
            .iter()
            .filter(|entry| {
                entry.action == DecisionAction::Accept
                    && entry.intent_type == intent_type
                    && entry.resource == resource
                    && entry.recorded_at >= since
            })
            .count();
        Ok(count as u64)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid intent ttl {ttl_s}s (expected 1..={max_ttl_s}s)")]
    InvalidTtl { ttl_s: u32, max_ttl_s: u32 },
    #[error("decision store unavailable: {0}")]
    Unavailable(String),
}

impl From<DecisionLogError> for EngineError {
    fn from(value: DecisionLogError) -> Self {
        match value {
            DecisionLogError::Unavailable(detail) => Self::Unavailable(detail),
        }
    }
}

/// Evaluates one intent against an immutable policy snapshot, consulting the
/// hold manager and budget guard through their contracts only. Never retries
/// internally; callers re-submit.
pub struct DecisionEngine {
    policy: Arc<PolicyDocument>,
    holds: Arc<HoldManager>,
    budget: Arc<BudgetGuard>,
    log: Arc<dyn DecisionLog>,
}

impl DecisionEngine {
    pub fn new(
        policy: Arc<PolicyDocument>,
        holds: Arc<HoldManager>,
        budget: Arc<BudgetGuard>,
        log: Arc<dyn DecisionLog>,
    ) -> Self {
        Self { policy, holds, budget, log }
    }

    pub fn policy(&self) -> &PolicyDocument {
        &self.policy
    }

    pub async fn decide(&self, intent: &Intent) -> Result<Decision, EngineError> {
        let max_ttl_s = self.policy.limits.max_hold_ttl_s;
        if intent.ttl_s == 0 || intent.ttl_s > max_ttl_s {
            return Err(EngineError::InvalidTtl { ttl_s: intent.ttl_s, max_ttl_s });
        }

        let decision = self.evaluate(intent).await?;
        self.log.record(intent, &decision).await?;
        Ok(decision)
    }

    async fn evaluate(&self, intent: &Intent) -> Result<Decision, EngineError> {
        let limits = &self.policy.limits;

        let replan_count = intent.replan_count();
        if replan_count >= limits.replan_limit {
            return Ok(Decision::new(
                DecisionAction::Deny,
                reason::REPLAN_LIMIT_EXCEEDED,
                format!("replan limit of {} exceeded", limits.replan_limit),
            )
            .with_evidence("replan_count", replan_count.to_string()));
        }

        if self.policy.is_suppressed(&intent.intent_type) {
            return Ok(Decision::new(
                DecisionAction::Deny,
                reason::INCIDENT_SUPPRESSED,
                "intent type is suppressed by the current incident posture",
            )
            .with_evidence("suppressed_type", intent.intent_type.clone()));
        }

        if let Some(cap) = self.policy.frequency_cap(&intent.intent_type) {
            let since = Utc::now() - Duration::hours(i64::from(cap.window_hours));
            let recent = self
                .log
                .count_admitted_since(&intent.intent_type, &intent.resource, since)
                .await?;
            if recent >= u64::from(cap.max_count) {
                return Ok(Decision::new(
                    DecisionAction::Deny,
                    reason::FREQUENCY_CAP_EXCEEDED,
                    format!("frequency cap exceeded for {}", intent.intent_type),
                )
                .with_evidence("recent_count", recent.to_string())
                .with_evidence("max_count", cap.max_count.to_string())
                .with_evidence("window_hours", cap.window_hours.to_string()));
            }
        }

        if let Some(rule) = self.policy.required_approval(intent) {
            if intent.approval_ref().is_none() {
                return Ok(Decision::new(
                    DecisionAction::Hold,
                    reason::APPROVAL_REQUIRED,
                    format!("approval rule `{rule}` requires a prior approval"),
                )
                .with_evidence("approval_rule", rule.to_string()));
            }
        }

        match intent.scope {
            IntentScope::Read => {
                if let Some(denied) = self.denied_by_budget(intent).await {
                    return Ok(denied);
                }
                Ok(Decision::new(
                    DecisionAction::Accept,
                    reason::READ_OPERATION,
                    "read operation allowed",
                )
                .with_ttl(intent.ttl_s))
            }
            IntentScope::Write => self.evaluate_contention(intent).await,
        }
    }

    async fn evaluate_contention(&self, intent: &Intent) -> Result<Decision, EngineError> {
        let correlation = intent.meta_value(META_CORRELATION).map(str::to_string);
        let grant = self
            .holds
            .request(&intent.resource, &intent.author, intent.ttl_s, correlation)
            .await
            .map_err(|error| match error {
                HoldError::InvalidTtl { ttl_s, max_ttl_s } => {
                    EngineError::InvalidTtl { ttl_s, max_ttl_s }
                }
                other => EngineError::Unavailable(other.to_string()),
            })?;

        if grant.hold.state == HoldState::Active {
            if let Some(denied) = self.denied_by_budget(intent).await {
                // Do not keep a lease the denied intent can never use.
                if grant.newly_granted {
                    let _ = self.holds.release(&grant.hold.token.0).await;
                }
                return Ok(denied);
            }

            let accept_reason =
                if grant.newly_granted { reason::ADMITTED } else { reason::ALREADY_HOLDER };
            return Ok(Decision::new(
                DecisionAction::Accept,
                accept_reason,
                "write admitted under an exclusive hold",
            )
            .with_hold_token(grant.hold.token.0.clone())
            .with_ttl(intent.ttl_s));
        }

        let position = grant.queue_position;
        if position > self.policy.limits.replan_queue_depth {
            let suggested = suggest_alternatives(&intent.resource);
            if !suggested.is_empty() {
                // Waiting out a deep queue rarely fits inside the intent TTL;
                // withdraw the request and point the caller elsewhere.
                let _ = self.holds.release(&grant.hold.token.0).await;
                return Ok(Decision::new(
                    DecisionAction::Replan,
                    reason::RESOURCE_CONTENDED,
                    "resource queue is deep; alternative slots suggested",
                )
                .with_queue_position(position)
                .with_suggested(suggested)
                .with_evidence("queue_depth_limit", self.policy.limits.replan_queue_depth.to_string()));
            }
        }

        Ok(Decision::new(
            DecisionAction::Hold,
            reason::RESOURCE_LOCKED,
            "resource is held by another author; request queued",
        )
        .with_hold_token(grant.hold.token.0.clone())
        .with_queue_position(position)
        .with_ttl(intent.ttl_s))
    }

    async fn denied_by_budget(&self, intent: &Intent) -> Option<Decision> {
        let budget_id = intent.budget_id()?;
        match self.budget.is_stopped(budget_id).await {
            Some(true) => Some(
                Decision::new(
                    DecisionAction::Deny,
                    reason::BUDGET_EXHAUSTED,
                    "referenced budget session is stopped",
                )
                .with_evidence("budget_id", budget_id.to_string()),
            ),
            _ => None,
        }
    }
}

/// Alternative slots for calendar-style resources (`base@timestamp`).
pub fn suggest_alternatives(resource: &str) -> Vec<String> {
    match resource.split_once('@') {
        Some((base, slot)) if !slot.is_empty() => {
            [30, 60, 90].iter().map(|offset| format!("{base}@{slot}+{offset}m")).collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use crate::budget::BudgetGuard;
    use crate::domain::intent::{reason, DecisionAction, Intent, IntentScope};
    use crate::holds::HoldManager;
    use crate::policy::PolicyDocument;

    use super::{suggest_alternatives, DecisionEngine, EngineError, InMemoryDecisionLog};

    const POLICY: &str = r#"
        version = 1

        [frequency_caps."contact.email"]
        window_hours = 48
        max_count = 1

        [incidents]
        suppressed_types = ["contact.sms"]

        [approvals.high_value]
        amount_above = 1000.0

        [limits]
        replan_limit = 2
        max_hold_ttl_s = 3600
        default_hold_ttl_s = 120
        replan_queue_depth = 1
    "#;

    fn build_engine() -> (DecisionEngine, Arc<HoldManager>, Arc<BudgetGuard>) {
        let policy = Arc::new(PolicyDocument::from_toml(POLICY).expect("valid policy"));
        let holds = Arc::new(HoldManager::new(policy.limits.max_hold_ttl_s));
        let budget = Arc::new(BudgetGuard::new());
        let log = Arc::new(InMemoryDecisionLog::default());
        let engine =
            DecisionEngine::new(policy, Arc::clone(&holds), Arc::clone(&budget), log);
        (engine, holds, budget)
    }

    fn intent(intent_type: &str, resource: &str, author: &str) -> Intent {
        Intent {
            intent_type: intent_type.to_string(),
            resource: resource.to_string(),
            action: "execute".to_string(),
            author: author.to_string(),
            scope: IntentScope::Write,
            ttl_s: 120,
            meta: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn suppressed_type_is_denied() {
        let (engine, _, _) = build_engine();
        let decision =
            engine.decide(&intent("contact.sms", "contact:1/sms", "agent-a")).await.expect("decide");

        assert_eq!(decision.action, DecisionAction::Deny);
        assert_eq!(decision.reason, reason::INCIDENT_SUPPRESSED);
    }

    #[tokio::test]
    async fn replan_ceiling_is_denied_before_anything_else() {
        let (engine, _, _) = build_engine();
        let mut submitted = intent("contact.sms", "contact:1/sms", "agent-a");
        submitted.meta.insert("replan_count".to_string(), "2".to_string());

        let decision = engine.decide(&submitted).await.expect("decide");

        assert_eq!(decision.action, DecisionAction::Deny);
        assert_eq!(decision.reason, reason::REPLAN_LIMIT_EXCEEDED);
    }

    #[tokio::test]
    async fn frequency_cap_denies_after_an_admitted_intent() {
        let (engine, holds, _) = build_engine();
        let first = engine
            .decide(&intent("contact.email", "contact:42/email", "agent-a"))
            .await
            .expect("decide");
        assert_eq!(first.action, DecisionAction::Accept);

        // Release so the second evaluation reaches the cap check, not the queue.
        holds.release(first.hold_token.as_deref().expect("token")).await.expect("release");

        let second = engine
            .decide(&intent("contact.email", "contact:42/email", "agent-a"))
            .await
            .expect("decide");

        assert_eq!(second.action, DecisionAction::Deny);
        assert_eq!(second.reason, reason::FREQUENCY_CAP_EXCEEDED);
        assert_eq!(second.evidence.get("recent_count").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn denied_intents_do_not_count_toward_the_cap() {
        let (engine, _, _) = build_engine();
        let mut suppressed = intent("contact.sms", "contact:9/sms", "agent-a");
        for _ in 0..3 {
            let decision = engine.decide(&suppressed).await.expect("decide");
            assert_eq!(decision.action, DecisionAction::Deny);
        }

        // The sms denials must not poison an unrelated resource+type counter.
        suppressed.intent_type = "contact.email".to_string();
        let decision = engine.decide(&suppressed).await.expect("decide");
        assert_eq!(decision.action, DecisionAction::Accept);
    }

    #[tokio::test]
    async fn high_value_intent_holds_for_approval_until_referenced() {
        let (engine, _, _) = build_engine();
        let mut submitted = intent("payment.send", "invoice:7", "agent-a");
        submitted.meta.insert("amount_usd".to_string(), "1500".to_string());

        let held = engine.decide(&submitted).await.expect("decide");
        assert_eq!(held.action, DecisionAction::Hold);
        assert_eq!(held.reason, reason::APPROVAL_REQUIRED);
        assert!(held.hold_token.is_none());

        submitted.meta.insert("approval_ref".to_string(), "apr-1".to_string());
        let approved = engine.decide(&submitted).await.expect("decide");
        assert_eq!(approved.action, DecisionAction::Accept);
    }

    #[tokio::test]
    async fn contended_write_holds_with_queue_position() {
        let (engine, _, _) = build_engine();
        let first = engine.decide(&intent("doc.edit", "doc:7", "agent-a")).await.expect("decide");
        assert_eq!(first.action, DecisionAction::Accept);
        assert!(first.hold_token.is_some());

        let second = engine.decide(&intent("doc.edit", "doc:7", "agent-b")).await.expect("decide");
        assert_eq!(second.action, DecisionAction::Hold);
        assert_eq!(second.reason, reason::RESOURCE_LOCKED);
        assert_eq!(second.queue_position, Some(1));
        assert!(second.hold_token.is_some());
    }

    #[tokio::test]
    async fn reentrant_write_accepts_with_the_existing_hold() {
        let (engine, _, _) = build_engine();
        let first = engine.decide(&intent("doc.edit", "doc:7", "agent-a")).await.expect("decide");
        let again = engine.decide(&intent("doc.edit", "doc:7", "agent-a")).await.expect("decide");

        assert_eq!(again.action, DecisionAction::Accept);
        assert_eq!(again.reason, reason::ALREADY_HOLDER);
        assert_eq!(again.hold_token, first.hold_token);
    }

    #[tokio::test]
    async fn deep_calendar_queue_replans_with_suggestions() {
        let (engine, _, _) = build_engine();
        let slot = "calendar:doctor.lee@2026-09-01T10:00:00-04:00";

        engine.decide(&intent("calendar.book", slot, "agent-a")).await.expect("decide");
        let second = engine.decide(&intent("calendar.book", slot, "agent-b")).await.expect("decide");
        assert_eq!(second.action, DecisionAction::Hold);

        // Queue position 2 exceeds the configured depth of 1.
        let third = engine.decide(&intent("calendar.book", slot, "agent-c")).await.expect("decide");
        assert_eq!(third.action, DecisionAction::Replan);
        assert_eq!(third.reason, reason::RESOURCE_CONTENDED);
        assert_eq!(third.suggested.len(), 3);
        assert!(third.suggested[0].ends_with("+30m"));
    }

    #[tokio::test]
    async fn stopped_budget_denies_and_frees_the_acquired_hold() {
        let (engine, holds, budget) = build_engine();
        let session = budget
            .start(Decimal::new(500, 2), 10, BTreeMap::new())
            .await
            .expect("start budget");
        budget.stop(&session.id.0).await.expect("stop budget");

        let mut submitted = intent("doc.edit", "doc:7", "agent-a");
        submitted.meta.insert("budget_id".to_string(), session.id.0.clone());

        let decision = engine.decide(&submitted).await.expect("decide");
        assert_eq!(decision.action, DecisionAction::Deny);
        assert_eq!(decision.reason, reason::BUDGET_EXHAUSTED);

        // The lease acquired during evaluation was handed back.
        assert_eq!(holds.active_count().await, 0);
    }

    #[tokio::test]
    async fn reads_accept_without_taking_a_hold() {
        let (engine, holds, _) = build_engine();
        let mut submitted = intent("doc.view", "doc:7", "agent-a");
        submitted.scope = IntentScope::Read;

        let decision = engine.decide(&submitted).await.expect("decide");

        assert_eq!(decision.action, DecisionAction::Accept);
        assert_eq!(decision.reason, reason::READ_OPERATION);
        assert!(decision.hold_token.is_none());
        assert_eq!(holds.active_count().await, 0);
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_an_invalid_intent() {
        let (engine, _, _) = build_engine();
        let mut submitted = intent("doc.edit", "doc:7", "agent-a");
        submitted.ttl_s = 0;

        let error = engine.decide(&submitted).await.expect_err("invalid ttl");
        assert!(matches!(error, EngineError::InvalidTtl { .. }));
    }

    #[test]
    fn suggestions_only_apply_to_slotted_resources() {
        assert_eq!(suggest_alternatives("doc:7"), Vec::<String>::new());
        let suggested = suggest_alternatives("calendar:lee@2026-09-01T10:00:00-04:00");
        assert_eq!(suggested.len(), 3);
        assert!(suggested[2].ends_with("+90m"));
    }
}
