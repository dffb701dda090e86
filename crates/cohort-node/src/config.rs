//! Node configuration file.
//!
//! Resolution order is defaults, then the TOML file, then env vars and
//! CLI flags. Protocol tunables live under `[membership]`.

use std::net::SocketAddr;
use std::path::Path;

use cohort_membership::{MembershipConfig, MembershipError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct NodeConfig {
    pub bind: String,
    pub port: u16,
    pub membership: MembershipConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 2552,
            membership: MembershipConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MembershipError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MembershipError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let cfg: Self = toml::from_str(&raw)
            .map_err(|e| MembershipError::Config(format!("{}: {e}", path.display())))?;
        cfg.membership.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, MembershipError> {
        toml::to_string_pretty(self).map_err(|e| MembershipError::Config(e.to_string()))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| format!("invalid bind address '{}:{}': {e}", self.bind, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn template_parses_back() {
        let cfg = NodeConfig::default();
        let text = cfg.to_toml().unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn file_with_membership_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port = 2600

[membership]
seed-nodes = ["127.0.0.1:2600"]
gossip-interval = "200ms"
auto-down-unreachable-after = "5s"
"#
        )
        .unwrap();

        let cfg = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.port, 2600);
        assert_eq!(cfg.bind, "127.0.0.1");
        assert_eq!(cfg.membership.gossip_interval, Duration::from_millis(200));
        assert_eq!(
            cfg.membership.auto_down_unreachable_after,
            Some(Duration::from_secs(5))
        );
        assert_eq!(cfg.bind_addr().unwrap(), "127.0.0.1:2600".parse().unwrap());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prot = 1").unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn bad_bind_address() {
        let cfg = NodeConfig {
            bind: "not an address".into(),
            ..NodeConfig::default()
        };
        assert!(cfg.bind_addr().is_err());
    }
}
