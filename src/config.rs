use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

/// Per-replica configuration, loaded from a TOML file.
///
/// `peers` holds the Raft addresses of the other replicas and `peer_routers`
/// their client-service addresses (used when forwarding writes to the
/// leader). Both maps exclude the local node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub node_id: String,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    #[serde(default = "default_status_port")]
    pub status_port: u16,

    #[serde(default)]
    pub peers: HashMap<String, String>,
    #[serde(default)]
    pub peer_routers: HashMap<String, String>,

    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min: f64,
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max: f64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout: f64,

    pub assist_addr: Option<String>,

    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_client_port() -> u16 {
    50051
}
fn default_peer_port() -> u16 {
    50061
}
fn default_status_port() -> u16 {
    8080
}
fn default_election_timeout_min() -> f64 {
    5.0
}
fn default_election_timeout_max() -> f64 {
    10.0
}
fn default_heartbeat_interval() -> f64 {
    1.0
}
fn default_submit_timeout() -> f64 {
    10.0
}
fn default_jwt_secret() -> String {
    "your-secret-key-change-in-production".to_string()
}
fn default_token_ttl_hours() -> u64 {
    24
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            bail!("node_id must not be empty");
        }
        if self.election_timeout_min >= self.election_timeout_max {
            bail!(
                "election_timeout_min ({}) must be below election_timeout_max ({})",
                self.election_timeout_min,
                self.election_timeout_max
            );
        }
        // Heartbeats must land well inside the shortest election timeout or
        // healthy followers will start spurious elections.
        if self.heartbeat_interval >= self.election_timeout_min / 2.0 {
            bail!(
                "heartbeat_interval ({}) must be below half of election_timeout_min ({})",
                self.heartbeat_interval,
                self.election_timeout_min
            );
        }
        if self.peers.contains_key(&self.node_id) {
            bail!("peers must not include the local node {}", self.node_id);
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval)
    }

    pub fn submit_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.submit_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: "node1".to_string(),
            bind_address: default_bind_address(),
            client_port: default_client_port(),
            peer_port: default_peer_port(),
            status_port: default_status_port(),
            peers: HashMap::new(),
            peer_routers: HashMap::new(),
            election_timeout_min: default_election_timeout_min(),
            election_timeout_max: default_election_timeout_max(),
            heartbeat_interval: default_heartbeat_interval(),
            submit_timeout: default_submit_timeout(),
            assist_addr: None,
            jwt_secret: default_jwt_secret(),
            token_ttl_hours: default_token_ttl_hours(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_slow_heartbeat() {
        let config = Config {
            heartbeat_interval: 3.0,
            election_timeout_min: 5.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_election_window() {
        let config = Config {
            election_timeout_min: 10.0,
            election_timeout_max: 5.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_self_in_peers() {
        let mut config = Config::default();
        config
            .peers
            .insert("node1".to_string(), "localhost:50061".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            node_id = "node2"

            [peers]
            node1 = "localhost:50061"
            node3 = "localhost:50063"
            "#,
        )
        .unwrap();
        assert_eq!(config.node_id, "node2");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.election_timeout_min, 5.0);
        config.validate().unwrap();
    }
}
