use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Meta key referencing the budget session an intent spends against.
pub const META_BUDGET_ID: &str = "budget_id";
/// Meta key referencing an approval granted out of band.
pub const META_APPROVAL_REF: &str = "approval_ref";
/// Meta key carrying how many times this intent has been re-planned.
pub const META_REPLAN_COUNT: &str = "replan_count";
/// Meta key carrying the monetary amount an intent would spend, in USD.
pub const META_AMOUNT_USD: &str = "amount_usd";
/// Meta key grouping queued hold requests issued for the same work.
pub const META_CORRELATION: &str = "correlation";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentScope {
    Read,
    Write,
}

impl IntentScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            _ => None,
        }
    }
}

/// A proposed agent action submitted for admission control.
///
/// Immutable once submitted; it exists only for the duration of one
/// decision call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub intent_type: String,
    pub resource: String,
    pub action: String,
    pub author: String,
    pub scope: IntentScope,
    pub ttl_s: u32,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Intent {
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn replan_count(&self) -> u32 {
        self.meta_value(META_REPLAN_COUNT).and_then(|raw| raw.parse().ok()).unwrap_or(0)
    }

    pub fn budget_id(&self) -> Option<&str> {
        self.meta_value(META_BUDGET_ID)
    }

    pub fn approval_ref(&self) -> Option<&str> {
        self.meta_value(META_APPROVAL_REF).filter(|value| !value.trim().is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Accept,
    Replan,
    Hold,
    Deny,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Replan => "replan",
            Self::Hold => "hold",
            Self::Deny => "deny",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "accept" => Some(Self::Accept),
            "replan" => Some(Self::Replan),
            "hold" => Some(Self::Hold),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable decision reason codes.
pub mod reason {
    pub const ADMITTED: &str = "admitted";
    pub const READ_OPERATION: &str = "read_operation";
    pub const ALREADY_HOLDER: &str = "already_holder";
    pub const INCIDENT_SUPPRESSED: &str = "incident_suppressed";
    pub const FREQUENCY_CAP_EXCEEDED: &str = "frequency_cap_exceeded";
    pub const APPROVAL_REQUIRED: &str = "approval_required";
    pub const RESOURCE_LOCKED: &str = "resource_locked";
    pub const RESOURCE_CONTENDED: &str = "resource_contended";
    pub const BUDGET_EXHAUSTED: &str = "budget_exhausted";
    pub const REPLAN_LIMIT_EXCEEDED: &str = "replan_limit_exceeded";
}

/// The outcome of one intent evaluation. Produced once; never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub reason: String,
    pub why: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub evidence: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_s: Option<u32>,
}

impl Decision {
    pub fn new(action: DecisionAction, reason: impl Into<String>, why: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
            why: why.into(),
            evidence: BTreeMap::new(),
            hold_token: None,
            queue_position: None,
            suggested: Vec::new(),
            ttl_s: None,
        }
    }

    pub fn with_evidence(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.evidence.insert(key.into(), value.into());
        self
    }

    pub fn with_hold_token(mut self, token: impl Into<String>) -> Self {
        self.hold_token = Some(token.into());
        self
    }

    pub fn with_queue_position(mut self, position: usize) -> Self {
        self.queue_position = Some(position);
        self
    }

    pub fn with_suggested(mut self, suggested: Vec<String>) -> Self {
        self.suggested = suggested;
        self
    }

    pub fn with_ttl(mut self, ttl_s: u32) -> Self {
        self.ttl_s = Some(ttl_s);
        self
    }

    pub fn is_admitted(&self) -> bool {
        self.action == DecisionAction::Accept
    }
}
