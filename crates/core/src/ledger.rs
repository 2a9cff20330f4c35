use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::effect::{ClaimState, EffectRecord};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("invalid ttl {0}s (must be positive)")]
    InvalidTtl(u32),
    #[error("no claim exists for idempotency key `{0}`")]
    NotFound(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimStatus {
    /// No live record existed; the caller is authorized to perform the
    /// effect exactly once.
    New,
    /// A committed record exists; the caller must skip re-execution.
    Duplicate,
    /// A concurrent duplicate holds the claim; wait and retry, or treat as
    /// duplicate-pending.
    InFlight,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClaimOutcome {
    pub status: ClaimStatus,
    pub record: EffectRecord,
}

/// Records claims and results per idempotency key so admitted side effects
/// happen at most once inside the deduplication window.
pub struct IdempotencyLedger {
    records: Mutex<HashMap<String, EffectRecord>>,
}

impl Default for IdempotencyLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyLedger {
    pub fn new() -> Self {
        Self { records: Mutex::new(HashMap::new()) }
    }

    pub async fn claim(
        &self,
        key: &str,
        ttl_s: u32,
        payload_hash: Option<String>,
    ) -> Result<ClaimOutcome, LedgerError> {
        self.claim_at(key, ttl_s, payload_hash, Utc::now()).await
    }

    async fn claim_at(
        &self,
        key: &str,
        ttl_s: u32,
        payload_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, LedgerError> {
        if ttl_s == 0 {
            return Err(LedgerError::InvalidTtl(ttl_s));
        }

        let mut records = self.records.lock().await;

        if let Some(existing) = records.get(key) {
            if existing.is_expired(now) {
                records.remove(key);
            } else {
                let status = match existing.claim_state {
                    ClaimState::Claimed => ClaimStatus::InFlight,
                    ClaimState::Committed => ClaimStatus::Duplicate,
                    // A failed claim is deleted on `fail`; a lingering one
                    // behaves like an in-flight duplicate until it expires.
                    ClaimState::Failed => ClaimStatus::InFlight,
                };
                return Ok(ClaimOutcome { status, record: existing.clone() });
            }
        }

        let record = EffectRecord {
            idempotency_key: key.to_string(),
            claim_state: ClaimState::Claimed,
            result: None,
            payload_hash,
            created_at: now,
            ttl_s,
        };
        records.insert(key.to_string(), record.clone());
        Ok(ClaimOutcome { status: ClaimStatus::New, record })
    }

    /// Store the effect result. Committing an already-committed key keeps
    /// the original result.
    pub async fn commit(&self, key: &str, result: serde_json::Value) -> Result<EffectRecord, LedgerError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(key).ok_or_else(|| LedgerError::NotFound(key.to_string()))?;

        if record.claim_state != ClaimState::Committed {
            record.claim_state = ClaimState::Committed;
            record.result = Some(result);
        }
        Ok(record.clone())
    }

    /// Drop the claim after a failed execution so a future retry can
    /// re-attempt the effect.
    pub async fn fail(&self, key: &str) -> Result<EffectRecord, LedgerError> {
        let mut records = self.records.lock().await;
        let mut record =
            records.remove(key).ok_or_else(|| LedgerError::NotFound(key.to_string()))?;
        record.claim_state = ClaimState::Failed;
        Ok(record)
    }

    pub async fn get(&self, key: &str) -> Option<EffectRecord> {
        let records = self.records.lock().await;
        records.get(key).cloned()
    }

    /// Optional memory bound; records also expire lazily on access.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        before - records.len()
    }

    pub async fn len(&self) -> usize {
        let records = self.records.lock().await;
        records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Debug, Error)]
pub enum EffectError<E> {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("effect execution failed")]
    Effect(#[source] E),
}

#[derive(Clone, Debug, PartialEq)]
pub enum EffectOutcome {
    /// The effect ran in this call; the result is now recorded.
    Executed { result: serde_json::Value },
    /// A previous execution already committed; its result is returned.
    Deduplicated { result: serde_json::Value },
    /// A concurrent execution holds the claim; nothing was run.
    InFlight,
}

/// Two-phase wrapper around an external effect: evaluate the ledger, then
/// invoke the underlying step only when this call won the claim.
pub struct EffectRunner {
    ledger: Arc<IdempotencyLedger>,
}

impl EffectRunner {
    pub fn new(ledger: Arc<IdempotencyLedger>) -> Self {
        Self { ledger }
    }

    pub async fn run<F, Fut, E>(
        &self,
        key: &str,
        ttl_s: u32,
        payload: &serde_json::Value,
        effect: F,
    ) -> Result<EffectOutcome, EffectError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
    {
        let hash = crate::domain::effect::payload_hash(payload);
        let claim = self.ledger.claim(key, ttl_s, Some(hash)).await?;

        match claim.status {
            ClaimStatus::Duplicate => {
                let result = claim.record.result.unwrap_or(serde_json::Value::Null);
                Ok(EffectOutcome::Deduplicated { result })
            }
            ClaimStatus::InFlight => Ok(EffectOutcome::InFlight),
            ClaimStatus::New => match effect().await {
                Ok(result) => {
                    self.ledger.commit(key, result.clone()).await?;
                    Ok(EffectOutcome::Executed { result })
                }
                Err(error) => {
                    self.ledger.fail(key).await?;
                    Err(EffectError::Effect(error))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{ClaimStatus, EffectOutcome, EffectRunner, IdempotencyLedger, LedgerError};

    #[tokio::test]
    async fn committed_key_deduplicates_with_the_original_result() {
        let ledger = IdempotencyLedger::new();

        let first = ledger.claim("email:42", 60, None).await.expect("claim");
        assert_eq!(first.status, ClaimStatus::New);

        ledger.commit("email:42", json!({"email_id": "e-1"})).await.expect("commit");

        let second = ledger.claim("email:42", 60, None).await.expect("claim");
        assert_eq!(second.status, ClaimStatus::Duplicate);
        assert_eq!(second.record.result, Some(json!({"email_id": "e-1"})));
    }

    #[tokio::test]
    async fn exactly_one_concurrent_claim_wins() {
        let ledger = Arc::new(IdempotencyLedger::new());
        let (a, b, c) = tokio::join!(
            ledger.claim("post:1", 60, None),
            ledger.claim("post:1", 60, None),
            ledger.claim("post:1", 60, None),
        );

        let outcomes = [a.expect("a"), b.expect("b"), c.expect("c")];
        let winners =
            outcomes.iter().filter(|outcome| outcome.status == ClaimStatus::New).count();
        let pending =
            outcomes.iter().filter(|outcome| outcome.status == ClaimStatus::InFlight).count();

        assert_eq!(winners, 1);
        assert_eq!(pending, 2);
    }

    #[tokio::test]
    async fn failed_claim_is_deleted_so_a_retry_can_reattempt() {
        let ledger = IdempotencyLedger::new();

        ledger.claim("sms:9", 60, None).await.expect("claim");
        ledger.fail("sms:9").await.expect("fail");

        let retry = ledger.claim("sms:9", 60, None).await.expect("claim");
        assert_eq!(retry.status, ClaimStatus::New);
    }

    #[tokio::test]
    async fn records_expire_lazily_after_their_ttl() {
        let ledger = IdempotencyLedger::new();

        ledger.claim("call:3", 1, None).await.expect("claim");
        ledger.commit("call:3", json!("done")).await.expect("commit");

        let later = Utc::now() + Duration::seconds(2);
        let reclaimed = ledger.claim_at("call:3", 1, None, later).await.expect("claim");
        assert_eq!(reclaimed.status, ClaimStatus::New);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired_records() {
        let ledger = IdempotencyLedger::new();
        ledger.claim("short", 1, None).await.expect("claim");
        ledger.claim("long", 600, None).await.expect("claim");

        let removed = ledger.sweep_expired(Utc::now() + Duration::seconds(2)).await;

        assert_eq!(removed, 1);
        assert!(ledger.get("short").await.is_none());
        assert!(ledger.get("long").await.is_some());
    }

    #[tokio::test]
    async fn commit_without_a_claim_is_an_error() {
        let ledger = IdempotencyLedger::new();
        let error = ledger.commit("ghost", json!(1)).await.expect_err("no claim");
        assert!(matches!(error, LedgerError::NotFound(_)));

        let error = ledger.claim("ghost", 0, None).await.expect_err("zero ttl");
        assert!(matches!(error, LedgerError::InvalidTtl(0)));
    }

    #[tokio::test]
    async fn runner_executes_once_and_replays_the_result() {
        let ledger = Arc::new(IdempotencyLedger::new());
        let runner = EffectRunner::new(ledger);
        let executions = Arc::new(AtomicUsize::new(0));

        for attempt in 0..3 {
            let executions = Arc::clone(&executions);
            let outcome = runner
                .run::<_, _, String>("email:42", 60, &json!({"to": "contact:42"}), move || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"email_id": "e-1"}))
                })
                .await
                .expect("run effect");

            match (attempt, outcome) {
                (0, EffectOutcome::Executed { result }) => {
                    assert_eq!(result, json!({"email_id": "e-1"}));
                }
                (_, EffectOutcome::Deduplicated { result }) => {
                    assert_eq!(result, json!({"email_id": "e-1"}));
                }
                (_, other) => panic!("unexpected outcome: {other:?}"),
            }
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn runner_failure_releases_the_claim_for_retry() {
        let ledger = Arc::new(IdempotencyLedger::new());
        let runner = EffectRunner::new(Arc::clone(&ledger));

        let failed = runner
            .run("http:1", 60, &json!({}), || async { Err::<serde_json::Value, _>("boom") })
            .await;
        assert!(failed.is_err());
        assert!(ledger.get("http:1").await.is_none());

        let outcome = runner
            .run::<_, _, &str>("http:1", 60, &json!({}), || async { Ok(json!("ok")) })
            .await
            .expect("retry succeeds");
        assert_eq!(outcome, EffectOutcome::Executed { result: json!("ok") });
    }
}
