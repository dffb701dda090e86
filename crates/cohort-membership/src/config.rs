//! Membership configuration.
//!
//! Loaded from TOML with kebab-case keys. Durations are written as
//! human-readable strings ("500ms", "10s", "2m", "1h"); settings that can
//! be disabled also accept "off".

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MembershipError, Result};
use crate::message::{MAX_COLLECTION_COUNT, MAX_STRING_LEN};
use crate::reachability::ReachabilityPolicy;

/// Parses a duration string such as "250ms", "5s", "2m" or "1h".
///
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration string".into());
    }
    let lower = input.to_ascii_lowercase();

    let (num_str, unit_ms) = if let Some(n) = lower.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = lower.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = lower.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (lower.as_str(), 1_000)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: '{input}'"))?;
    num.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration overflow: '{input}'"))
}

/// Like [`parse_duration`], but "off" (or "0") disables the setting.
pub fn parse_optional_duration(input: &str) -> std::result::Result<Option<Duration>, String> {
    match input.trim().to_ascii_lowercase().as_str() {
        "off" | "none" => Ok(None),
        _ => {
            let d = parse_duration(input)?;
            Ok((!d.is_zero()).then_some(d))
        }
    }
}

/// Formats a duration with the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms != 0 && ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms != 0 && ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

/// Tunables of the membership protocol on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MembershipConfig {
    /// Addresses tried, in order, when joining.
    pub seed_nodes: Vec<SocketAddr>,
    pub roles: BTreeSet<String>,

    #[serde(with = "duration")]
    pub gossip_interval: Duration,
    #[serde(with = "duration")]
    pub leader_actions_interval: Duration,
    /// Delay before the first gossip, leader and stats ticks.
    #[serde(with = "duration")]
    pub periodic_tasks_initial_delay: Duration,
    #[serde(with = "optional_duration")]
    pub publish_stats_interval: Option<Duration>,

    #[serde(with = "optional_duration")]
    pub auto_down_unreachable_after: Option<Duration>,
    #[serde(with = "on_off")]
    pub run_coordinated_shutdown_when_down: bool,

    /// How long convergence may be missing before joining members are
    /// moved to `WeaklyUp`.
    #[serde(with = "optional_duration")]
    pub allow_weakly_up_members: Option<Duration>,
    pub min_nr_of_members: usize,
    #[serde(with = "optional_duration")]
    pub retry_unsuccessful_join_after: Option<Duration>,
    #[serde(with = "duration")]
    pub prune_gossip_tombstones_after: Duration,
    pub reachability_policy: ReachabilityPolicy,

    /// Interval of heartbeats to other members; "off" leaves failure
    /// detection to external reachability reports.
    #[serde(with = "optional_duration")]
    pub heartbeat_interval: Option<Duration>,
    #[serde(with = "duration")]
    pub acceptable_heartbeat_pause: Duration,

    /// Upper bound for each coordinated shutdown phase, including waiting
    /// for the local leave to complete.
    #[serde(with = "duration")]
    pub leave_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            seed_nodes: Vec::new(),
            roles: BTreeSet::new(),
            gossip_interval: Duration::from_secs(1),
            leader_actions_interval: Duration::from_secs(1),
            periodic_tasks_initial_delay: Duration::from_secs(1),
            publish_stats_interval: None,
            auto_down_unreachable_after: None,
            run_coordinated_shutdown_when_down: true,
            allow_weakly_up_members: Some(Duration::from_secs(7)),
            min_nr_of_members: 1,
            retry_unsuccessful_join_after: Some(Duration::from_secs(10)),
            prune_gossip_tombstones_after: Duration::from_secs(24 * 3600),
            reachability_policy: ReachabilityPolicy::AnyObserver,
            heartbeat_interval: Some(Duration::from_secs(1)),
            acceptable_heartbeat_pause: Duration::from_secs(3),
            leave_timeout: Duration::from_secs(10),
        }
    }
}

impl MembershipConfig {
    /// Parses and validates a TOML document. Missing keys keep their
    /// defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s).map_err(|e| MembershipError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MembershipError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| MembershipError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.gossip_interval.is_zero() {
            return Err(MembershipError::Config("gossip-interval must be positive".into()));
        }
        if self.leader_actions_interval.is_zero() {
            return Err(MembershipError::Config(
                "leader-actions-interval must be positive".into(),
            ));
        }
        if self.min_nr_of_members == 0 {
            return Err(MembershipError::Config(
                "min-nr-of-members must be at least 1".into(),
            ));
        }
        if self.leave_timeout.is_zero() {
            return Err(MembershipError::Config("leave-timeout must be positive".into()));
        }
        if self.roles.len() > MAX_COLLECTION_COUNT {
            return Err(MembershipError::Config(format!(
                "at most {MAX_COLLECTION_COUNT} roles are supported"
            )));
        }
        if let Some(role) = self.roles.iter().find(|r| r.len() > MAX_STRING_LEN) {
            return Err(MembershipError::Config(format!(
                "role {role:?} is longer than {MAX_STRING_LEN} bytes"
            )));
        }
        Ok(())
    }
}

mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod optional_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&super::format_duration(*d)),
            None => s.serialize_str("off"),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_optional_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Accepts `true`/`false` as well as "on"/"off".
mod on_off {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Str(String),
    }

    pub fn serialize<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(if *v { "on" } else { "off" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Bool(b) => Ok(b),
            Raw::Str(s) => match s.to_ascii_lowercase().as_str() {
                "on" | "true" | "yes" => Ok(true),
                "off" | "false" | "no" => Ok(false),
                _ => Err(serde::de::Error::custom(format!(
                    "expected on or off, got '{s}'"
                ))),
            },
        }
    }
}
