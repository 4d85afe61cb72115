//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use pneuma_core::discovery::DiscoveryConfig;
use pneuma_core::GuardianProfile;
use serde::Deserialize;

/// Which half of the protocol this node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Moderator,
    Guardian,
}

/// Daemon configuration. File: ~/.config/pneuma/config.toml or /etc/pneuma/config.toml.
/// Env overrides: PNEUMA_NODE_ID, PNEUMA_MESH_PORT, PNEUMA_NETWORK_KEY, PNEUMA_CORTEX_URL,
/// PNEUMA_LOG_LEVEL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Mesh identity (default: random `!node_xxxxxxxx`).
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub role: NodeRole,
    /// Multicast UDP port (default 47100).
    #[serde(default = "default_mesh_port")]
    pub mesh_port: u16,
    /// Backbone relay. Backbone traffic goes to the multicast group when unset.
    #[serde(default)]
    pub backbone_addr: Option<SocketAddr>,
    /// Shared network key, hex (16, 24 or 32 bytes).
    #[serde(default)]
    pub network_key: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    /// OpenAI-compatible endpoint base, e.g. http://127.0.0.1:8080.
    #[serde(default)]
    pub cortex_url: Option<String>,
    #[serde(default = "default_cortex_model")]
    pub cortex_model: String,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub guardian: Option<GuardianProfile>,
}

fn default_node_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("!node_{}", &id[..8])
}
fn default_mesh_port() -> u16 {
    47100
}
fn default_log_level() -> String {
    "info".to_owned()
}
fn default_cortex_model() -> String {
    "default".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            role: NodeRole::default(),
            mesh_port: default_mesh_port(),
            backbone_addr: None,
            network_key: None,
            log_level: default_log_level(),
            log_json: false,
            cortex_url: None,
            cortex_model: default_cortex_model(),
            discovery: DiscoveryConfig::default(),
            guardian: None,
        }
    }
}

impl Config {
    /// Apply env-style overrides; `var` returns the value for a variable name.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("PNEUMA_NODE_ID") {
            self.node_id = s;
        }
        if let Some(s) = var("PNEUMA_MESH_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.mesh_port = p,
                Err(_) => tracing::warn!(value = %s, "ignoring invalid PNEUMA_MESH_PORT"),
            }
        }
        if let Some(s) = var("PNEUMA_NETWORK_KEY") {
            self.network_key = Some(s);
        }
        if let Some(s) = var("PNEUMA_CORTEX_URL") {
            self.cortex_url = Some(s);
        }
        if let Some(s) = var("PNEUMA_LOG_LEVEL") {
            self.log_level = s;
        }
    }

    /// Check cross-field requirements and fill the guardian's node id.
    fn validate(&mut self) -> anyhow::Result<()> {
        if self.node_id.trim().is_empty() {
            bail!("node_id must not be empty");
        }
        self.network_key()?;
        if self.role == NodeRole::Guardian {
            let Some(profile) = self.guardian.as_mut() else {
                bail!("role = \"guardian\" requires a [guardian] section");
            };
            if profile.capabilities.is_empty() {
                bail!("[guardian] capabilities must not be empty");
            }
            if profile.est_latency_ms == 0 {
                bail!("[guardian] est_latency_ms must be positive");
            }
            if !(profile.cost.is_finite() && profile.cost >= 0.0) {
                bail!("[guardian] cost must be a non-negative number (got {})", profile.cost);
            }
            if profile.max_concurrent == 0 {
                bail!("[guardian] max_concurrent must be at least 1");
            }
            if profile.node_id.is_empty() {
                profile.node_id = self.node_id.clone();
            }
            if self.cortex_url.is_none() {
                bail!("role = \"guardian\" requires cortex_url");
            }
        }
        Ok(())
    }

    /// Decoded network key.
    pub fn network_key(&self) -> anyhow::Result<Vec<u8>> {
        let hex_key = self
            .network_key
            .as_deref()
            .context("network_key is required (hex, 16/24/32 bytes)")?;
        let key = hex::decode(hex_key.trim()).context("network_key is not valid hex")?;
        if !matches!(key.len(), 16 | 24 | 32) {
            bail!("network_key must be 16, 24 or 32 bytes (got {})", key.len());
        }
        Ok(key)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = load_file()?.unwrap_or_default();
    c.apply_overrides(|name| std::env::var(name).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pneuma/config.toml"));
    }
    out.push(PathBuf::from("/etc/pneuma/config.toml"));
    out
}

fn load_file() -> anyhow::Result<Option<Config>> {
    let Some(path) = config_paths().into_iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.role, NodeRole::Moderator);
        assert_eq!(c.mesh_port, 47100);
        assert_eq!(c.log_level, "info");
        assert!(c.node_id.starts_with("!node_"));
        assert!(c.node_id.len() <= 16);
        assert_eq!(c.discovery, DiscoveryConfig::default());
    }

    #[test]
    fn full_guardian_file() {
        let mut c: Config = toml::from_str(&format!(
            r#"
            node_id = "!gpu_box"
            role = "guardian"
            mesh_port = 47200
            backbone_addr = "10.0.0.1:47300"
            network_key = "{KEY}"
            cortex_url = "http://127.0.0.1:8080"
            log_json = true

            [discovery]
            local_timeout_ms = 300
            min_offers = 2

            [guardian]
            expert_type = "qwen-2.5-coder-7b"
            capabilities = ["code", "python"]
            cost = 0.05
            est_latency_ms = 700
            "#
        ))
        .unwrap();
        c.validate().unwrap();
        assert_eq!(c.role, NodeRole::Guardian);
        assert_eq!(c.backbone_addr, Some("10.0.0.1:47300".parse().unwrap()));
        assert_eq!(c.discovery.local_timeout_ms, 300);
        assert_eq!(c.discovery.backbone_timeout_ms, 2000);
        let g = c.guardian.as_ref().unwrap();
        assert_eq!(g.node_id, "!gpu_box");
        assert_eq!(g.est_latency_ms, 700);
        assert_eq!(c.network_key().unwrap().len(), 16);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
        assert!(toml::from_str::<Config>("[discovery]\nbogus = 1").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        c.apply_overrides(|name| match name {
            "PNEUMA_NODE_ID" => Some("!from_env".into()),
            "PNEUMA_MESH_PORT" => Some("not a port".into()),
            "PNEUMA_NETWORK_KEY" => Some(KEY.into()),
            "PNEUMA_LOG_LEVEL" => Some("debug".into()),
            _ => None,
        });
        assert_eq!(c.node_id, "!from_env");
        assert_eq!(c.mesh_port, 47100);
        assert_eq!(c.network_key.as_deref(), Some(KEY));
        assert_eq!(c.log_level, "debug");
        assert!(c.cortex_url.is_none());

        c.apply_overrides(|name| (name == "PNEUMA_MESH_PORT").then(|| "47999".into()));
        assert_eq!(c.mesh_port, 47999);
    }

    #[test]
    fn validation() {
        let mut c = Config::default();
        assert!(c.validate().is_err());

        c.network_key = Some("abcd".into());
        assert!(c.validate().is_err());
        c.network_key = Some("zz".repeat(16));
        assert!(c.validate().is_err());
        c.network_key = Some(KEY.repeat(2));
        assert!(c.validate().is_ok());

        c.role = NodeRole::Guardian;
        assert!(c.validate().is_err());
        c.guardian = Some(GuardianProfile {
            node_id: String::new(),
            expert_type: "m".into(),
            capabilities: vec!["code".into()],
            cost: 0.0,
            est_latency_ms: 100,
            max_concurrent: 1,
        });
        assert!(c.validate().is_err());
        c.cortex_url = Some("http://localhost:8080".into());
        c.validate().unwrap();
        assert_eq!(c.guardian.as_ref().unwrap().node_id, c.node_id);
    }

    #[test]
    fn guardian_profile_values_checked() {
        let base = Config {
            role: NodeRole::Guardian,
            network_key: Some(KEY.into()),
            cortex_url: Some("http://localhost:8080".into()),
            guardian: Some(GuardianProfile {
                node_id: String::new(),
                expert_type: "m".into(),
                capabilities: vec!["code".into()],
                cost: 0.0,
                est_latency_ms: 100,
                max_concurrent: 2,
            }),
            ..Config::default()
        };
        base.clone().validate().unwrap();

        let broken: [fn(&mut GuardianProfile); 5] = [
            |p| p.est_latency_ms = 0,
            |p| p.cost = -0.5,
            |p| p.cost = f64::NAN,
            |p| p.cost = f64::INFINITY,
            |p| p.max_concurrent = 0,
        ];
        for (i, breaks) in broken.iter().enumerate() {
            let mut c = base.clone();
            breaks(c.guardian.as_mut().unwrap());
            assert!(c.validate().is_err(), "case {i} accepted");
        }
    }
}
