use std::collections::BTreeMap;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BudgetSessionId(pub String);

impl std::fmt::Display for BudgetSessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Active,
    Stopped,
}

impl BudgetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    CapBreached,
    Explicit,
}

/// A bounded spend/rate accounting scope.
///
/// `spent_usd` is monotonic non-decreasing; once the session is `Stopped`
/// no consume call mutates it again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSession {
    pub id: BudgetSessionId,
    pub usd_cap: Decimal,
    pub rpm: u32,
    pub spent_usd: Decimal,
    #[serde(skip)]
    pub request_timestamps: VecDeque<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
    pub state: BudgetState,
    pub stop_cause: Option<StopCause>,
    pub created_at: DateTime<Utc>,
    pub last_consumed_at: Option<DateTime<Utc>>,
}

impl BudgetSession {
    pub fn remaining_usd(&self) -> Decimal {
        (self.usd_cap - self.spent_usd).max(Decimal::ZERO)
    }
}

/// Consume reason codes returned alongside `allowed = false`.
pub mod consume_reason {
    pub const SESSION_STOPPED: &str = "session_stopped";
    pub const RPM_EXCEEDED: &str = "rpm_exceeded";
    pub const CAP_EXCEEDED: &str = "cap_exceeded";
}

/// Result of one `consume` call against a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeOutcome {
    pub session_id: BudgetSessionId,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub spent_usd: Decimal,
    pub remaining_usd: Decimal,
}
