//! Configuration system for the mesh.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/mesh/config.toml
//!   3. ~/.config/mesh/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::PeerIdentity;

/// Top-level configuration. Shared by `meshd` and `mesh-rendezvous`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub rendezvous: RendezvousConfig,
    pub node: NodeConfig,
    pub timing: TimingConfig,
    pub gossip: GossipConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Host nodes dial to reach the rendezvous service.
    pub host: String,
    /// Rendezvous TCP port.
    pub port: u16,
    /// Address the rendezvous service binds to.
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// TCP port for inbound mesh connections. 0 = OS-assigned.
    pub listen_port: u16,
    /// Host advertised to the rendezvous service. Empty = local hostname.
    pub advertise_host: String,
    /// Stay registered (and heartbeat) after discovery.
    pub join_bootstrap: bool,
    /// Parent of the per-node `Workspace_<host>_<port>` directory.
    pub workspace_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Registry entries older than this are swept.
    pub peer_timeout_secs: u64,
    /// Period of the registry sweep.
    pub sweep_interval_secs: u64,
    /// Period of node heartbeats.
    pub heartbeat_interval_secs: u64,
    /// How long a sender waits for `ready`/`busy`.
    pub ready_timeout_ms: u64,
    /// An inbound transfer silent for this long is abandoned.
    pub transfer_stall_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Max remembered ids per seen cache.
    pub seen_capacity: usize,
    /// Ids older than this are forgotten.
    pub seen_window_secs: u64,
    /// Delivered messages kept per originator; older ones are dropped.
    pub inbox_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Payload bytes per data frame.
    pub chunk_size: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            bind: "0.0.0.0".to_string(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            advertise_host: String::new(),
            join_bootstrap: true,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            peer_timeout_secs: 15,
            sweep_interval_secs: 10,
            heartbeat_interval_secs: 10,
            ready_timeout_ms: 5_000,
            transfer_stall_secs: 30,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            seen_capacity: 65_536,
            seen_window_secs: 600,
            inbox_history: 256,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { chunk_size: 1024 }
    }
}

impl TimingConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn transfer_stall(&self) -> Duration {
        Duration::from_secs(self.transfer_stall_secs)
    }
}

impl GossipConfig {
    pub fn seen_window(&self) -> Duration {
        Duration::from_secs(self.seen_window_secs)
    }
}

impl NodeConfig {
    /// Host to advertise: the configured one, else the local hostname.
    pub fn resolved_host(&self) -> String {
        if !self.advertise_host.is_empty() {
            return self.advertise_host.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Directory received files are written into for `me`.
    pub fn workspace_dir(&self, me: &PeerIdentity) -> PathBuf {
        self.workspace_root
            .join(format!("Workspace_{}_{}", me.host, me.port))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("mesh")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MESH_* overrides. `lookup` stands in for the process environment.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MESH_RENDEZVOUS__HOST") {
            self.rendezvous.host = v;
        }
        if let Some(p) = lookup("MESH_RENDEZVOUS__PORT").and_then(|v| v.parse().ok()) {
            self.rendezvous.port = p;
        }
        if let Some(p) = lookup("MESH_NODE__LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.node.listen_port = p;
        }
        if let Some(v) = lookup("MESH_NODE__ADVERTISE_HOST") {
            self.node.advertise_host = v;
        }
        if let Some(v) = lookup("MESH_NODE__JOIN_BOOTSTRAP") {
            self.node.join_bootstrap = v == "true" || v == "1";
        }
        if let Some(v) = lookup("MESH_NODE__WORKSPACE_ROOT") {
            self.node.workspace_root = PathBuf::from(v);
        }
        if let Some(s) = lookup("MESH_TIMING__PEER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.timing.peer_timeout_secs = s;
        }
        if let Some(s) = lookup("MESH_TIMING__SWEEP_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.timing.sweep_interval_secs = s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = MeshConfig::default();
        assert_eq!(config.timing.peer_timeout(), Duration::from_secs(15));
        assert_eq!(config.timing.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.timing.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.transfer.chunk_size, 1024);
        assert!(config.node.join_bootstrap);
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            ("MESH_RENDEZVOUS__PORT", "7000"),
            ("MESH_NODE__JOIN_BOOTSTRAP", "false"),
            ("MESH_NODE__ADVERTISE_HOST", "node-7"),
            ("MESH_TIMING__PEER_TIMEOUT_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = MeshConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.rendezvous.port, 7000);
        assert!(!config.node.join_bootstrap);
        assert_eq!(config.node.advertise_host, "node-7");
        // Unparseable values leave the default alone.
        assert_eq!(config.timing.peer_timeout_secs, 15);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let config: MeshConfig = toml::from_str(
            r#"
            [node]
            listen_port = 6000
            "#,
        )
        .unwrap();
        assert_eq!(config.node.listen_port, 6000);
        assert!(config.node.join_bootstrap);
        assert_eq!(config.rendezvous.port, 9999);
    }

    #[test]
    fn workspace_dir_is_keyed_by_identity() {
        let node = NodeConfig {
            workspace_root: PathBuf::from("/srv"),
            ..NodeConfig::default()
        };
        let dir = node.workspace_dir(&PeerIdentity::new("host-b", 6001));
        assert_eq!(dir, PathBuf::from("/srv/Workspace_host-b_6001"));
    }

    #[test]
    fn configured_host_wins_over_hostname() {
        let node = NodeConfig {
            advertise_host: "10.0.0.5".into(),
            ..NodeConfig::default()
        };
        assert_eq!(node.resolved_host(), "10.0.0.5");
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("mesh-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("MESH_CONFIG", config_path.to_str().unwrap());
        }

        let path = MeshConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = MeshConfig::load().expect("load should succeed");
        assert_eq!(config.rendezvous.port, 9999);

        unsafe {
            std::env::remove_var("MESH_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
