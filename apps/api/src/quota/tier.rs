//! Value types shared across the quota subsystem: who is metered (`Subject`),
//! what is metered (`ActionKind`) and at which subscription level (`Tier`).

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Subscription tier. Ordered from least to most generous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Pro, Tier::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Parses a tier stored on an account record. Unrecognised values are
    /// treated as `Free` so a corrupt record can never widen a quota.
    pub fn from_account_field(raw: &str) -> Tier {
        raw.parse().unwrap_or_else(|_| {
            warn!("Unknown subscription tier '{raw}', applying free-tier limits");
            Tier::Free
        })
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier '{0}'")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

/// A metered category of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Any `/api` request, keyed by network origin.
    ApiRequest,
    /// Login / credential attempts. Only failures are counted.
    AuthAttempt,
    AiChat,
    AiSuggestion,
    AiGenerate,
    AtsScore,
    DocxExport,
    ResumeCreate,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::ApiRequest,
        ActionKind::AuthAttempt,
        ActionKind::AiChat,
        ActionKind::AiSuggestion,
        ActionKind::AiGenerate,
        ActionKind::AtsScore,
        ActionKind::DocxExport,
        ActionKind::ResumeCreate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ApiRequest => "api_request",
            ActionKind::AuthAttempt => "auth_attempt",
            ActionKind::AiChat => "ai_chat",
            ActionKind::AiSuggestion => "ai_suggestion",
            ActionKind::AiGenerate => "ai_generate",
            ActionKind::AtsScore => "ats_score",
            ActionKind::DocxExport => "docx_export",
            ActionKind::ResumeCreate => "resume_create",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action '{s}'"))
    }
}

/// The identity a quota is tracked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Account(Uuid),
    Origin(IpAddr),
}

impl Subject {
    /// Authenticated requests are metered per account, everything else per
    /// network origin.
    pub fn for_request(account: Option<Uuid>, origin: IpAddr) -> Subject {
        match account {
            Some(id) => Subject::Account(id),
            None => Subject::Origin(origin),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Account(id) => write!(f, "account:{id}"),
            Subject::Origin(ip) => write!(f, "ip:{ip}"),
        }
    }
}

/// Identifies one counter: a subject has at most one per action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub subject: Subject,
    pub action: ActionKind,
}

impl CounterKey {
    pub fn new(subject: Subject, action: ActionKind) -> Self {
        Self { subject, action }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action, self.subject)
    }
}
