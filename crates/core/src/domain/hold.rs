use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoldToken(pub String);

impl std::fmt::Display for HoldToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldState {
    Pending,
    Active,
    Released,
    Expired,
}

impl HoldState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "released" => Some(Self::Released),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A time-bounded exclusive lease on a resource key.
///
/// `arrival_seq` is assigned once at request time and never changes; queue
/// order for a resource is the order of arrival sequences, so retries cannot
/// improve a requester's position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub token: HoldToken,
    pub resource: String,
    pub holder: String,
    pub ttl_s: u32,
    pub state: HoldState,
    pub correlation: Option<String>,
    pub arrival_seq: u64,
    pub requested_at: DateTime<Utc>,
    /// Instant after which the hold expires unless confirmed or released.
    pub deadline: DateTime<Utc>,
    pub confirmed: bool,
}
