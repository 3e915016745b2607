//! Static mapping from (action, tier) to quota parameters.
//!
//! Built once at start-up from the built-in defaults, optionally replaced per
//! action by a JSON policy file, and read-only afterwards.

use std::collections::HashMap;
use std::path::Path;

use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

use crate::quota::tier::{ActionKind, Tier};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid policy file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid policy for '{action}': {reason}")]
    Invalid { action: String, reason: String },
}

/// How many requests a tier may make inside one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowance {
    /// `Limited(0)` means the action is disabled for the tier.
    Limited(u64),
    Unlimited,
}

impl Allowance {
    pub fn is_disabled(&self) -> bool {
        matches!(self, Allowance::Limited(0))
    }

    fn rank(&self) -> u128 {
        match self {
            Allowance::Limited(n) => u128::from(*n),
            Allowance::Unlimited => u128::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Fixed-then-renewed window starting at the first request after expiry.
    Rolling(Duration),
    /// Resets when the UTC (year, month) changes.
    CalendarMonth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimit {
    pub allowance: Allowance,
    pub window: WindowKind,
}

impl TierLimit {
    pub const fn rolling(max_requests: u64, window: Duration) -> Self {
        Self {
            allowance: Allowance::Limited(max_requests),
            window: WindowKind::Rolling(window),
        }
    }

    pub const fn unlimited(window: WindowKind) -> Self {
        Self {
            allowance: Allowance::Unlimited,
            window,
        }
    }
}

/// The resolved policy for one (action, tier) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub action: ActionKind,
    pub tier: Tier,
    pub limit: TierLimit,
    /// Only failed attempts are charged (increment on reserve, refund on success).
    pub count_only_failures: bool,
    /// The counter caps a live resource, so destroying one gives its unit back.
    pub refundable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPolicy {
    pub count_only_failures: bool,
    pub refundable: bool,
    pub tiers: HashMap<Tier, TierLimit>,
}

impl ActionPolicy {
    fn uniform(limit: TierLimit) -> Self {
        Self {
            count_only_failures: false,
            refundable: false,
            tiers: Tier::ALL.into_iter().map(|t| (t, limit)).collect(),
        }
    }

    fn per_tier(free: TierLimit, pro: TierLimit, enterprise: TierLimit) -> Self {
        Self {
            count_only_failures: false,
            refundable: false,
            tiers: HashMap::from([
                (Tier::Free, free),
                (Tier::Pro, pro),
                (Tier::Enterprise, enterprise),
            ]),
        }
    }

    /// The least generous limit this action defines, used for tiers the
    /// configuration does not mention.
    fn most_restrictive(&self) -> Option<TierLimit> {
        self.tiers
            .iter()
            .min_by_key(|(tier, limit)| (limit.allowance.rank(), **tier))
            .map(|(_, limit)| *limit)
    }
}

#[derive(Debug, Clone)]
pub struct PolicyTable {
    actions: HashMap<ActionKind, ActionPolicy>,
}

fn disabled() -> TierLimit {
    TierLimit::rolling(0, Duration::days(1))
}

impl PolicyTable {
    pub fn new(actions: HashMap<ActionKind, ActionPolicy>) -> Self {
        Self { actions }
    }

    /// The limits the service ships with.
    pub fn defaults() -> Self {
        let fifteen_min = Duration::minutes(15);
        let day = Duration::hours(24);
        let hour = Duration::hours(1);
        let per_day_unlimited = TierLimit::unlimited(WindowKind::Rolling(day));

        let mut actions = HashMap::new();
        actions.insert(
            ActionKind::ApiRequest,
            ActionPolicy::uniform(TierLimit::rolling(100, fifteen_min)),
        );
        actions.insert(
            ActionKind::AuthAttempt,
            ActionPolicy {
                count_only_failures: true,
                ..ActionPolicy::uniform(TierLimit::rolling(5, fifteen_min))
            },
        );
        actions.insert(
            ActionKind::AiChat,
            ActionPolicy::per_tier(
                TierLimit::rolling(5, day),
                TierLimit::rolling(100, day),
                TierLimit::rolling(1000, day),
            ),
        );
        actions.insert(
            ActionKind::AiSuggestion,
            ActionPolicy::per_tier(
                TierLimit {
                    allowance: Allowance::Limited(0),
                    window: WindowKind::CalendarMonth,
                },
                TierLimit {
                    allowance: Allowance::Limited(100),
                    window: WindowKind::CalendarMonth,
                },
                TierLimit::unlimited(WindowKind::CalendarMonth),
            ),
        );
        actions.insert(
            ActionKind::AiGenerate,
            ActionPolicy::per_tier(
                TierLimit::rolling(0, hour),
                TierLimit::rolling(50, hour),
                TierLimit::rolling(500, hour),
            ),
        );
        actions.insert(
            ActionKind::AtsScore,
            ActionPolicy::per_tier(
                TierLimit::rolling(0, day),
                per_day_unlimited,
                per_day_unlimited,
            ),
        );
        actions.insert(
            ActionKind::DocxExport,
            ActionPolicy::per_tier(
                TierLimit::rolling(0, day),
                per_day_unlimited,
                per_day_unlimited,
            ),
        );
        // Counts resumes currently owned: deletion refunds the slot.
        let resume_window = WindowKind::Rolling(Duration::days(3650));
        actions.insert(
            ActionKind::ResumeCreate,
            ActionPolicy {
                refundable: true,
                ..ActionPolicy::per_tier(
                    TierLimit {
                        allowance: Allowance::Limited(1),
                        window: resume_window,
                    },
                    TierLimit::unlimited(resume_window),
                    TierLimit::unlimited(resume_window),
                )
            },
        );

        Self::new(actions)
    }

    /// Defaults, with every action named in the file replaced wholesale.
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path)?;
        Self::defaults().with_overrides_json(&raw)
    }

    pub fn with_overrides_json(mut self, raw: &str) -> Result<Self, PolicyError> {
        let file: HashMap<ActionKind, ActionPolicyFile> = serde_json::from_str(raw)?;
        for (action, entry) in file {
            self.actions.insert(action, entry.into_policy(action)?);
        }
        Ok(self)
    }

    /// Looks up the limit for `(action, tier)`. A tier the table has no entry
    /// for gets the action's most restrictive limit; an action with no entries
    /// at all is disabled.
    pub fn limit_for(&self, action: ActionKind, tier: Tier) -> ResolvedPolicy {
        let Some(policy) = self.actions.get(&action) else {
            return ResolvedPolicy {
                action,
                tier,
                limit: disabled(),
                count_only_failures: false,
                refundable: false,
            };
        };
        let limit = policy
            .tiers
            .get(&tier)
            .copied()
            .or_else(|| policy.most_restrictive())
            .unwrap_or_else(disabled);
        ResolvedPolicy {
            action,
            tier,
            limit,
            count_only_failures: policy.count_only_failures,
            refundable: policy.refundable,
        }
    }

    /// Lowest tier with a non-zero allowance for `action`, if any.
    pub fn required_tier(&self, action: ActionKind) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|tier| !self.limit_for(action, *tier).limit.allowance.is_disabled())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Policy file format
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActionPolicyFile {
    #[serde(default)]
    count_only_failures: bool,
    #[serde(default)]
    refundable: bool,
    tiers: HashMap<Tier, TierLimitFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TierLimitFile {
    max_requests: MaxRequestsFile,
    window: WindowFile,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MaxRequestsFile {
    Count(u64),
    Keyword(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WindowFile {
    Rolling { window_ms: u64 },
    CalendarMonth,
}

impl ActionPolicyFile {
    fn into_policy(self, action: ActionKind) -> Result<ActionPolicy, PolicyError> {
        let invalid = |reason: String| PolicyError::Invalid {
            action: action.to_string(),
            reason,
        };
        if self.tiers.is_empty() {
            return Err(invalid("at least one tier must be configured".into()));
        }

        let mut tiers = HashMap::with_capacity(self.tiers.len());
        for (tier, entry) in self.tiers {
            let allowance = match entry.max_requests {
                MaxRequestsFile::Count(n) => Allowance::Limited(n),
                MaxRequestsFile::Keyword(k) if k == "unlimited" => Allowance::Unlimited,
                MaxRequestsFile::Keyword(k) => {
                    return Err(invalid(format!("max_requests '{k}' for tier {tier}")))
                }
            };
            let window = match entry.window {
                WindowFile::CalendarMonth => WindowKind::CalendarMonth,
                WindowFile::Rolling { window_ms: 0 } => {
                    return Err(invalid(format!("zero-length window for tier {tier}")))
                }
                WindowFile::Rolling { window_ms } => {
                    let ms = i64::try_from(window_ms)
                        .map_err(|_| invalid(format!("window_ms too large for tier {tier}")))?;
                    WindowKind::Rolling(Duration::milliseconds(ms))
                }
            };
            tiers.insert(tier, TierLimit { allowance, window });
        }

        Ok(ActionPolicy {
            count_only_failures: self.count_only_failures,
            refundable: self.refundable,
            tiers,
        })
    }
}
