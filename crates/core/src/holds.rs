use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::hold::{Hold, HoldState, HoldToken};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HoldError {
    #[error("invalid ttl {ttl_s}s (expected 1..={max_ttl_s}s)")]
    InvalidTtl { ttl_s: u32, max_ttl_s: u32 },
    #[error("hold not found: {0}")]
    NotFound(String),
    #[error("hold expired: {0}")]
    Expired(String),
    #[error("hold is still pending: {0}")]
    StillPending(String),
    #[error("token is not the current holder: {0}")]
    NotHolder(String),
}

/// Result of a `request` call: the hold as recorded plus its position in
/// the resource's wait structure (0 means the hold is active).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HoldGrant {
    pub hold: Hold,
    pub queue_position: usize,
    pub newly_granted: bool,
}

/// Holds expired and promoted by one reaper cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub expired: Vec<Hold>,
    pub promoted: Vec<Hold>,
}

#[derive(Default)]
struct ResourceQueue {
    active: Option<String>,
    pending: VecDeque<String>,
}

#[derive(Default)]
struct ManagerState {
    resources: HashMap<String, ResourceQueue>,
    /// Authoritative record per token, terminal states included so late
    /// confirm/release calls can be answered precisely.
    holds: HashMap<String, Hold>,
    next_seq: u64,
}

/// Fairness-ordered lease manager. One hold may be `Active` per resource at
/// any instant; grants are strictly FIFO by arrival sequence, and a retry
/// carrying the same author and correlation keeps its original position.
pub struct HoldManager {
    max_ttl_s: u32,
    state: Mutex<ManagerState>,
}

impl HoldManager {
    pub fn new(max_ttl_s: u32) -> Self {
        Self { max_ttl_s, state: Mutex::new(ManagerState::default()) }
    }

    pub async fn request(
        &self,
        resource: &str,
        author: &str,
        ttl_s: u32,
        correlation: Option<String>,
    ) -> Result<HoldGrant, HoldError> {
        if ttl_s == 0 || ttl_s > self.max_ttl_s {
            return Err(HoldError::InvalidTtl { ttl_s, max_ttl_s: self.max_ttl_s });
        }

        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        expire_due(state, resource, now);

        let active_token =
            state.resources.get(resource).and_then(|queue| queue.active.clone());

        if let Some(active_token) = active_token {
            let active = state.holds.get(&active_token).cloned();
            if let Some(active) = active {
                if active.holder == author {
                    return Ok(HoldGrant { hold: active, queue_position: 0, newly_granted: false });
                }

                // A retry re-joins its original queue slot instead of a new one.
                let pending_tokens: Vec<String> = state
                    .resources
                    .get(resource)
                    .map(|queue| queue.pending.iter().cloned().collect())
                    .unwrap_or_default();
                for (index, token) in pending_tokens.iter().enumerate() {
                    if let Some(existing) = state.holds.get(token) {
                        if existing.holder == author && existing.correlation == correlation {
                            return Ok(HoldGrant {
                                hold: existing.clone(),
                                queue_position: index + 1,
                                newly_granted: false,
                            });
                        }
                    }
                }

                let hold = new_hold(state, resource, author, ttl_s, correlation, now, false);
                let queue = state.resources.entry(resource.to_string()).or_default();
                queue.pending.push_back(hold.token.0.clone());
                let position = queue.pending.len();
                return Ok(HoldGrant { hold, queue_position: position, newly_granted: true });
            }
        }

        let hold = new_hold(state, resource, author, ttl_s, correlation, now, true);
        let queue = state.resources.entry(resource.to_string()).or_default();
        queue.active = Some(hold.token.0.clone());
        Ok(HoldGrant { hold, queue_position: 0, newly_granted: true })
    }

    /// Acknowledge an active hold, renewing its deadline for another TTL.
    pub async fn confirm(&self, token: &str) -> Result<Hold, HoldError> {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let resource = match state.holds.get(token) {
            Some(hold) => hold.resource.clone(),
            None => return Err(HoldError::NotFound(token.to_string())),
        };
        expire_due(state, &resource, now);

        let hold =
            state.holds.get_mut(token).ok_or_else(|| HoldError::NotFound(token.to_string()))?;
        match hold.state {
            HoldState::Active => {
                hold.confirmed = true;
                hold.deadline = now + Duration::seconds(i64::from(hold.ttl_s));
                Ok(hold.clone())
            }
            HoldState::Pending => Err(HoldError::StillPending(token.to_string())),
            HoldState::Expired => Err(HoldError::Expired(token.to_string())),
            HoldState::Released => Err(HoldError::NotFound(token.to_string())),
        }
    }

    /// Release an active hold (promoting the next pending requester) or
    /// withdraw an own pending request. Any other token is `not_holder`.
    pub async fn release(&self, token: &str) -> Result<(), HoldError> {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let resource = match state.holds.get(token) {
            Some(hold) => hold.resource.clone(),
            None => return Err(HoldError::NotHolder(token.to_string())),
        };
        expire_due(state, &resource, now);

        let hold_state = match state.holds.get(token) {
            Some(hold) => hold.state,
            None => return Err(HoldError::NotHolder(token.to_string())),
        };

        match hold_state {
            HoldState::Active => {
                if let Some(hold) = state.holds.get_mut(token) {
                    hold.state = HoldState::Released;
                }
                if let Some(queue) = state.resources.get_mut(&resource) {
                    queue.active = None;
                }
                promote_next(state, &resource, now);
                drop_empty_queue(state, &resource);
                Ok(())
            }
            HoldState::Pending => {
                if let Some(queue) = state.resources.get_mut(&resource) {
                    queue.pending.retain(|candidate| candidate != token);
                }
                if let Some(hold) = state.holds.get_mut(token) {
                    hold.state = HoldState::Released;
                }
                drop_empty_queue(state, &resource);
                Ok(())
            }
            HoldState::Released | HoldState::Expired => {
                Err(HoldError::NotHolder(token.to_string()))
            }
        }
    }

    pub async fn info(&self, token: &str) -> Option<Hold> {
        let guard = self.state.lock().await;
        guard.holds.get(token).cloned()
    }

    /// 0 for the active holder, 1-based slot for pending requesters.
    pub async fn queue_position(&self, token: &str) -> Option<usize> {
        let guard = self.state.lock().await;
        let hold = guard.holds.get(token)?;
        let queue = guard.resources.get(&hold.resource)?;
        if queue.active.as_deref() == Some(token) {
            return Some(0);
        }
        queue.pending.iter().position(|candidate| candidate == token).map(|index| index + 1)
    }

    /// One reaper cycle: expire every overdue hold, promote the next queued
    /// requester per resource, and prune terminal records past retention.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let resources: Vec<String> = state.resources.keys().cloned().collect();

        let mut outcome = SweepOutcome::default();
        for resource in resources {
            let (expired, promoted) = expire_due(state, &resource, now);
            outcome.expired.extend(expired);
            outcome.promoted.extend(promoted);
            drop_empty_queue(state, &resource);
        }

        // Terminal records are kept for one extra TTL so stragglers get a
        // precise error, then dropped to bound memory.
        state.holds.retain(|_, hold| match hold.state {
            HoldState::Active | HoldState::Pending => true,
            HoldState::Released | HoldState::Expired => {
                now < hold.deadline + Duration::seconds(i64::from(hold.ttl_s))
            }
        });

        outcome
    }

    pub async fn active_count(&self) -> usize {
        let guard = self.state.lock().await;
        guard.resources.values().filter(|queue| queue.active.is_some()).count()
    }

    pub async fn pending_count(&self) -> usize {
        let guard = self.state.lock().await;
        guard.resources.values().map(|queue| queue.pending.len()).sum()
    }
}

fn new_hold(
    state: &mut ManagerState,
    resource: &str,
    author: &str,
    ttl_s: u32,
    correlation: Option<String>,
    now: DateTime<Utc>,
    active: bool,
) -> Hold {
    state.next_seq += 1;
    let hold = Hold {
        token: HoldToken(format!("h_{}", Uuid::new_v4().simple())),
        resource: resource.to_string(),
        holder: author.to_string(),
        ttl_s,
        state: if active { HoldState::Active } else { HoldState::Pending },
        correlation,
        arrival_seq: state.next_seq,
        requested_at: now,
        deadline: now + Duration::seconds(i64::from(ttl_s)),
        confirmed: false,
    };
    state.holds.insert(hold.token.0.clone(), hold.clone());
    hold
}

fn expire_due(
    state: &mut ManagerState,
    resource: &str,
    now: DateTime<Utc>,
) -> (Vec<Hold>, Vec<Hold>) {
    let mut expired = Vec::new();

    let active_token = match state.resources.get(resource) {
        Some(queue) => queue.active.clone(),
        None => return (expired, Vec::new()),
    };

    if let Some(active_token) = active_token {
        let overdue = state
            .holds
            .get(&active_token)
            .map(|hold| now >= hold.deadline)
            .unwrap_or(true);
        if overdue {
            if let Some(hold) = state.holds.get_mut(&active_token) {
                hold.state = HoldState::Expired;
                expired.push(hold.clone());
            }
            if let Some(queue) = state.resources.get_mut(resource) {
                queue.active = None;
            }
        }
    }

    // Pending requests are bounded by their own TTL too.
    let pending_tokens: Vec<String> = state
        .resources
        .get(resource)
        .map(|queue| queue.pending.iter().cloned().collect())
        .unwrap_or_default();
    for token in pending_tokens {
        let overdue =
            state.holds.get(&token).map(|hold| now >= hold.deadline).unwrap_or(true);
        if overdue {
            if let Some(hold) = state.holds.get_mut(&token) {
                hold.state = HoldState::Expired;
                expired.push(hold.clone());
            }
            if let Some(queue) = state.resources.get_mut(resource) {
                queue.pending.retain(|candidate| candidate != &token);
            }
        }
    }

    let promoted = promote_next(state, resource, now);
    (expired, promoted)
}

fn promote_next(state: &mut ManagerState, resource: &str, now: DateTime<Utc>) -> Vec<Hold> {
    let mut promoted = Vec::new();

    let next_token = match state.resources.get_mut(resource) {
        Some(queue) => {
            if queue.active.is_some() {
                return promoted;
            }
            queue.pending.pop_front()
        }
        None => return promoted,
    };

    if let Some(next_token) = next_token {
        if let Some(queue) = state.resources.get_mut(resource) {
            queue.active = Some(next_token.clone());
        }
        if let Some(hold) = state.holds.get_mut(&next_token) {
            hold.state = HoldState::Active;
            hold.confirmed = false;
            hold.deadline = now + Duration::seconds(i64::from(hold.ttl_s));
            promoted.push(hold.clone());
        }
    }

    promoted
}

fn drop_empty_queue(state: &mut ManagerState, resource: &str) {
    if let Some(queue) = state.resources.get(resource) {
        if queue.active.is_none() && queue.pending.is_empty() {
            state.resources.remove(resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::domain::hold::HoldState;

    use super::{HoldError, HoldManager};

    #[tokio::test]
    async fn free_resource_grants_immediately() {
        let manager = HoldManager::new(3_600);
        let grant = manager.request("ticket:1", "agent-a", 120, None).await.expect("grant");

        assert_eq!(grant.hold.state, HoldState::Active);
        assert_eq!(grant.queue_position, 0);
        assert!(grant.newly_granted);
    }

    #[tokio::test]
    async fn second_author_queues_and_is_promoted_on_release() {
        let manager = HoldManager::new(3_600);
        let first = manager.request("ticket:1", "agent-a", 120, None).await.expect("grant a");
        let second = manager.request("ticket:1", "agent-b", 120, None).await.expect("queue b");

        assert_eq!(first.hold.state, HoldState::Active);
        assert_eq!(second.hold.state, HoldState::Pending);
        assert_eq!(second.queue_position, 1);

        manager.release(&first.hold.token.0).await.expect("release a");

        let promoted = manager.info(&second.hold.token.0).await.expect("b exists");
        assert_eq!(promoted.state, HoldState::Active);
        assert_eq!(manager.queue_position(&second.hold.token.0).await, Some(0));
    }

    #[tokio::test]
    async fn at_most_one_active_hold_per_resource() {
        let manager = HoldManager::new(3_600);
        let (a, b, c) = tokio::join!(
            manager.request("doc:7", "agent-a", 120, None),
            manager.request("doc:7", "agent-b", 120, None),
            manager.request("doc:7", "agent-c", 120, None),
        );

        let grants = [a.expect("a"), b.expect("b"), c.expect("c")];
        let active = grants.iter().filter(|grant| grant.hold.state == HoldState::Active).count();

        assert_eq!(active, 1);
        assert_eq!(manager.active_count().await, 1);
        assert_eq!(manager.pending_count().await, 2);
    }

    #[tokio::test]
    async fn retry_keeps_original_queue_position() {
        let manager = HoldManager::new(3_600);
        manager.request("ticket:1", "agent-a", 120, None).await.expect("grant a");
        let b = manager
            .request("ticket:1", "agent-b", 120, Some("corr-b".to_string()))
            .await
            .expect("queue b");
        manager
            .request("ticket:1", "agent-c", 120, Some("corr-c".to_string()))
            .await
            .expect("queue c");

        let retry = manager
            .request("ticket:1", "agent-b", 120, Some("corr-b".to_string()))
            .await
            .expect("retry b");

        assert_eq!(retry.hold.token, b.hold.token);
        assert_eq!(retry.queue_position, 1);
        assert!(!retry.newly_granted);
        assert_eq!(manager.pending_count().await, 2);
    }

    #[tokio::test]
    async fn same_author_request_on_own_active_hold_is_reentrant() {
        let manager = HoldManager::new(3_600);
        let first = manager.request("ticket:1", "agent-a", 120, None).await.expect("grant");
        let again = manager.request("ticket:1", "agent-a", 120, None).await.expect("reentrant");

        assert_eq!(again.hold.token, first.hold.token);
        assert_eq!(again.queue_position, 0);
        assert!(!again.newly_granted);
    }

    #[tokio::test]
    async fn unconfirmed_hold_expires_and_next_is_promoted_in_one_sweep() {
        let manager = HoldManager::new(3_600);
        let first = manager.request("cal:lee", "agent-a", 1, None).await.expect("grant a");
        let second = manager.request("cal:lee", "agent-b", 300, None).await.expect("queue b");

        let outcome = manager.sweep_expired(Utc::now() + Duration::seconds(2)).await;

        assert_eq!(outcome.expired.len(), 1);
        assert_eq!(outcome.expired[0].token, first.hold.token);
        assert_eq!(outcome.promoted.len(), 1);
        assert_eq!(outcome.promoted[0].token, second.hold.token);

        let error = manager.confirm(&first.hold.token.0).await.expect_err("expired");
        assert!(matches!(error, HoldError::Expired(_)));
    }

    #[tokio::test]
    async fn confirm_renews_the_active_deadline() {
        let manager = HoldManager::new(3_600);
        let grant = manager.request("ticket:1", "agent-a", 120, None).await.expect("grant");

        let confirmed = manager.confirm(&grant.hold.token.0).await.expect("confirm");

        assert!(confirmed.confirmed);
        assert!(confirmed.deadline >= grant.hold.deadline);
    }

    #[tokio::test]
    async fn confirm_on_pending_hold_is_rejected() {
        let manager = HoldManager::new(3_600);
        manager.request("ticket:1", "agent-a", 120, None).await.expect("grant a");
        let pending = manager.request("ticket:1", "agent-b", 120, None).await.expect("queue b");

        let error = manager.confirm(&pending.hold.token.0).await.expect_err("pending");
        assert!(matches!(error, HoldError::StillPending(_)));
    }

    #[tokio::test]
    async fn releasing_a_finished_token_reports_not_holder() {
        let manager = HoldManager::new(3_600);
        let grant = manager.request("ticket:1", "agent-a", 120, None).await.expect("grant");
        manager.release(&grant.hold.token.0).await.expect("release");

        let error = manager.release(&grant.hold.token.0).await.expect_err("double release");
        assert!(matches!(error, HoldError::NotHolder(_)));

        let error = manager.release("h_missing").await.expect_err("unknown token");
        assert!(matches!(error, HoldError::NotHolder(_)));
    }

    #[tokio::test]
    async fn withdrawing_a_pending_request_shifts_later_positions() {
        let manager = HoldManager::new(3_600);
        manager.request("ticket:1", "agent-a", 120, None).await.expect("grant a");
        let b = manager.request("ticket:1", "agent-b", 120, None).await.expect("queue b");
        let c = manager.request("ticket:1", "agent-c", 120, None).await.expect("queue c");

        assert_eq!(c.queue_position, 2);
        manager.release(&b.hold.token.0).await.expect("withdraw b");
        assert_eq!(manager.queue_position(&c.hold.token.0).await, Some(1));
    }

    #[tokio::test]
    async fn zero_or_oversized_ttl_is_rejected() {
        let manager = HoldManager::new(600);

        let error = manager.request("ticket:1", "agent-a", 0, None).await.expect_err("zero ttl");
        assert!(matches!(error, HoldError::InvalidTtl { .. }));

        let error =
            manager.request("ticket:1", "agent-a", 601, None).await.expect_err("oversized ttl");
        assert!(matches!(error, HoldError::InvalidTtl { .. }));
    }
}
