use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::intent::{Intent, META_AMOUNT_USD};

/// Intent-type family treated as outreach for incident suppression.
const OUTREACH_PREFIX: &str = "contact.";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrequencyCap {
    pub window_hours: u32,
    pub max_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IncidentPolicy {
    pub suppress_outreach: bool,
    pub suppressed_types: Vec<String>,
}

/// A named approval rule. The rule requires approval when any of its
/// predicates matches the intent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApprovalRule {
    /// Intent types the rule applies to; empty applies to all types.
    pub intent_types: Vec<String>,
    /// Matches when `meta.amount_usd` parses above this threshold.
    pub amount_above: Option<f64>,
    /// Matches when any listed meta key is present and truthy.
    pub meta_flags: Vec<String>,
}

impl ApprovalRule {
    fn applies_to(&self, intent_type: &str) -> bool {
        self.intent_types.is_empty()
            || self.intent_types.iter().any(|candidate| candidate == intent_type)
    }

    fn matches(&self, intent: &Intent) -> bool {
        if !self.applies_to(&intent.intent_type) {
            return false;
        }

        if let Some(threshold) = self.amount_above {
            let amount = intent
                .meta_value(META_AMOUNT_USD)
                .and_then(|raw| raw.parse::<Decimal>().ok());
            let threshold = Decimal::try_from(threshold).unwrap_or(Decimal::MAX);
            if matches!(amount, Some(amount) if amount > threshold) {
                return true;
            }
        }

        self.meta_flags.iter().any(|flag| {
            intent
                .meta_value(flag)
                .map(|raw| {
                    let normalized = raw.trim().to_ascii_lowercase();
                    !normalized.is_empty() && normalized != "false" && normalized != "0"
                })
                .unwrap_or(false)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyLimits {
    /// Replan attempts tolerated before an intent is denied outright.
    pub replan_limit: u32,
    /// Upper bound accepted for any hold or intent TTL, seconds.
    pub max_hold_ttl_s: u32,
    /// TTL applied when a hold request supplies none.
    pub default_hold_ttl_s: u32,
    /// Pending queue depth beyond which waiting is replanned instead.
    pub replan_queue_depth: usize,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            replan_limit: 2,
            max_hold_ttl_s: 3_600,
            default_hold_ttl_s: 120,
            replan_queue_depth: 3,
        }
    }
}

/// A validated, versioned policy snapshot. Loaded once per policy version;
/// the decision engine treats it as immutable per evaluation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyDocument {
    pub version: u32,
    pub frequency_caps: BTreeMap<String, FrequencyCap>,
    pub incidents: IncidentPolicy,
    pub approvals: BTreeMap<String, ApprovalRule>,
    pub limits: PolicyLimits,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("could not read policy file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse policy file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("could not parse policy document: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("policy validation failed: {0}")]
    Validation(String),
}

impl PolicyDocument {
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| PolicyError::ReadFile { path: path.to_path_buf(), source })?;
        let document = toml::from_str::<Self>(&raw)
            .map_err(|source| PolicyError::ParseFile { path: path.to_path_buf(), source })?;
        document.validate()?;
        Ok(document)
    }

    pub fn from_toml(raw: &str) -> Result<Self, PolicyError> {
        let document = toml::from_str::<Self>(raw)?;
        document.validate()?;
        Ok(document)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        for (intent_type, cap) in &self.frequency_caps {
            if cap.window_hours == 0 {
                return Err(PolicyError::Validation(format!(
                    "frequency cap for `{intent_type}` has a zero-hour window"
                )));
            }
            if cap.max_count == 0 {
                return Err(PolicyError::Validation(format!(
                    "frequency cap for `{intent_type}` allows zero occurrences; use incident \
                     suppression to block a type outright"
                )));
            }
        }

        for (name, rule) in &self.approvals {
            if rule.amount_above.is_none() && rule.meta_flags.is_empty() {
                return Err(PolicyError::Validation(format!(
                    "approval rule `{name}` declares no predicate"
                )));
            }
            if let Some(threshold) = rule.amount_above {
                if !threshold.is_finite() || threshold < 0.0 {
                    return Err(PolicyError::Validation(format!(
                        "approval rule `{name}` has an invalid amount threshold `{threshold}`"
                    )));
                }
            }
        }

        if self.limits.max_hold_ttl_s == 0 || self.limits.default_hold_ttl_s == 0 {
            return Err(PolicyError::Validation("hold TTL limits must be positive".to_string()));
        }
        if self.limits.default_hold_ttl_s > self.limits.max_hold_ttl_s {
            return Err(PolicyError::Validation(
                "default hold TTL exceeds the maximum hold TTL".to_string(),
            ));
        }

        Ok(())
    }

    /// Intent types blocked by the current incident posture.
    pub fn suppressed_types(&self) -> BTreeSet<&str> {
        let mut suppressed: BTreeSet<&str> =
            self.incidents.suppressed_types.iter().map(String::as_str).collect();
        if self.incidents.suppress_outreach {
            suppressed.extend(
                self.frequency_caps
                    .keys()
                    .map(String::as_str)
                    .filter(|intent_type| intent_type.starts_with(OUTREACH_PREFIX)),
            );
        }
        suppressed
    }

    pub fn is_suppressed(&self, intent_type: &str) -> bool {
        if self.incidents.suppressed_types.iter().any(|candidate| candidate == intent_type) {
            return true;
        }
        self.incidents.suppress_outreach && intent_type.starts_with(OUTREACH_PREFIX)
    }

    pub fn frequency_cap(&self, intent_type: &str) -> Option<&FrequencyCap> {
        self.frequency_caps.get(intent_type)
    }

    /// First approval rule matching the intent, if any.
    pub fn required_approval(&self, intent: &Intent) -> Option<&str> {
        self.approvals
            .iter()
            .find(|(_, rule)| rule.matches(intent))
            .map(|(name, _)| name.as_str())
    }
}
