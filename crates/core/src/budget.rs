use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::budget::{
    consume_reason, BudgetSession, BudgetSessionId, BudgetState, ConsumeOutcome, StopCause,
};

/// Width of the request-rate window.
const RATE_WINDOW_SECS: i64 = 60;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("invalid cap {0} (must be positive)")]
    InvalidCap(Decimal),
    #[error("invalid rpm {0} (must be positive)")]
    InvalidRpm(u32),
    #[error("invalid amount {0} (must not be negative)")]
    InvalidAmount(Decimal),
    #[error("budget session not found: {0}")]
    NotFound(String),
}

/// Spend/rate stop-loss accounting. `consume` calls on one session are
/// applied as if totally ordered; once a session stops, no further spend is
/// ever recorded against it.
pub struct BudgetGuard {
    sessions: Mutex<HashMap<String, BudgetSession>>,
}

impl Default for BudgetGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetGuard {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    pub async fn start(
        &self,
        usd_cap: Decimal,
        rpm: u32,
        tags: BTreeMap<String, String>,
    ) -> Result<BudgetSession, BudgetError> {
        if usd_cap <= Decimal::ZERO {
            return Err(BudgetError::InvalidCap(usd_cap));
        }
        if rpm == 0 {
            return Err(BudgetError::InvalidRpm(rpm));
        }

        let session = BudgetSession {
            id: BudgetSessionId(format!("b_{}", Uuid::new_v4().simple())),
            usd_cap,
            rpm,
            spent_usd: Decimal::ZERO,
            request_timestamps: VecDeque::new(),
            tags,
            state: BudgetState::Active,
            stop_cause: None,
            created_at: Utc::now(),
            last_consumed_at: None,
        };

        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id.0.clone(), session.clone());
        Ok(session)
    }

    pub async fn consume(
        &self,
        session_id: &str,
        usd_amount: Decimal,
    ) -> Result<ConsumeOutcome, BudgetError> {
        self.consume_at(session_id, usd_amount, Utc::now()).await
    }

    async fn consume_at(
        &self,
        session_id: &str,
        usd_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, BudgetError> {
        if usd_amount < Decimal::ZERO {
            return Err(BudgetError::InvalidAmount(usd_amount));
        }

        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| BudgetError::NotFound(session_id.to_string()))?;

        if session.state == BudgetState::Stopped {
            return Ok(denied(session, consume_reason::SESSION_STOPPED));
        }

        // Every attempt counts as an observed request, allowed or not.
        session.request_timestamps.push_back(now);
        let window_start = now - Duration::seconds(RATE_WINDOW_SECS);
        while session
            .request_timestamps
            .front()
            .map(|stamp| *stamp <= window_start)
            .unwrap_or(false)
        {
            session.request_timestamps.pop_front();
        }

        if session.request_timestamps.len() as u64 > u64::from(session.rpm) {
            return Ok(denied(session, consume_reason::RPM_EXCEEDED));
        }

        if session.spent_usd + usd_amount > session.usd_cap {
            session.state = BudgetState::Stopped;
            session.stop_cause = Some(StopCause::CapBreached);
            return Ok(denied(session, consume_reason::CAP_EXCEEDED));
        }

        session.spent_usd += usd_amount;
        session.last_consumed_at = Some(now);

        Ok(ConsumeOutcome {
            session_id: session.id.clone(),
            allowed: true,
            reason: None,
            spent_usd: session.spent_usd,
            remaining_usd: session.remaining_usd(),
        })
    }

    pub async fn stop(&self, session_id: &str) -> Result<BudgetSession, BudgetError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| BudgetError::NotFound(session_id.to_string()))?;

        if session.state == BudgetState::Active {
            session.state = BudgetState::Stopped;
            session.stop_cause = Some(StopCause::Explicit);
        }
        Ok(session.clone())
    }

    pub async fn info(&self, session_id: &str) -> Option<BudgetSession> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).cloned()
    }

    pub async fn is_stopped(&self, session_id: &str) -> Option<bool> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(|session| session.state == BudgetState::Stopped)
    }

    pub async fn active_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().filter(|session| session.state == BudgetState::Active).count()
    }
}

fn denied(session: &BudgetSession, reason: &str) -> ConsumeOutcome {
    ConsumeOutcome {
        session_id: session.id.clone(),
        allowed: false,
        reason: Some(reason.to_string()),
        spent_usd: session.spent_usd,
        remaining_usd: session.remaining_usd(),
    }
}
