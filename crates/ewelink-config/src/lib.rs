//! Configuration for eWeLink device nodes.
//!
//! TOML file + `EWELINK_` environment overrides, validated and translated
//! into `ewelink_core` types. Also owns tracing setup for embedding hosts.
//! Credential material is never read here; nodes only name the host's
//! credentials node through `auth`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use ewelink_core::{BridgeConfig, DeviceNodeConfig, ParamSource};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no device node named '{name}'")]
    UnknownNode { name: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,

    /// Device nodes by name.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeSettings>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Seconds before a connection attempt is abandoned. Unset or `0`
    /// waits indefinitely.
    #[serde(default)]
    pub connect_timeout: Option<u64>,

    /// `EnvFilter` directive used when neither `RUST_LOG` nor `-v` is given.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".into()
}

/// A device node as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeSettings {
    /// Name of the host credentials node.
    pub auth: String,

    /// Fixed device id. Omit to take it from each event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Fixed method name. Omit to take it from `payload.method`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Static arguments. Omit to take them from `payload.params`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
}

/// Everything needed to call `Bridge::initialize_device_node` for one
/// configured node.
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    pub config: DeviceNodeConfig,
    pub method: Option<String>,
    pub params: Option<ParamSource>,
}

impl NodeSettings {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.auth.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: format!("nodes.{name}.auth"),
                reason: "credentials node reference must not be blank".into(),
            });
        }
        if self.method.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(ConfigError::Validation {
                field: format!("nodes.{name}.method"),
                reason: "method must not be blank; omit it to read payload.method".into(),
            });
        }
        Ok(())
    }

    fn to_definition(&self) -> NodeDefinition {
        let mut config = DeviceNodeConfig::new(self.auth.trim());
        config.device_id.clone_from(&self.device_id);
        NodeDefinition {
            config,
            method: self.method.as_ref().map(|m| m.trim().to_owned()),
            params: self.params.clone().map(ParamSource::Static),
        }
    }
}

impl Config {
    /// Check the log directive and every node definition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        EnvFilter::try_new(&self.defaults.log_level).map_err(|e| ConfigError::Validation {
            field: "defaults.log_level".into(),
            reason: e.to_string(),
        })?;
        self.nodes
            .iter()
            .try_for_each(|(name, node)| node.validate(name))
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            connect_timeout: self
                .defaults
                .connect_timeout
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    /// Look up and validate one device node.
    pub fn device_node(&self, name: &str) -> Result<NodeDefinition, ConfigError> {
        let settings = self.nodes.get(name).ok_or_else(|| ConfigError::UnknownNode {
            name: name.into(),
        })?;
        settings.validate(name)?;
        Ok(settings.to_definition())
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "ewelink", "ewelink-flow").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("ewelink-flow");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load config from `path` + environment, then validate it.
///
/// Environment overrides use `__` between levels, e.g.
/// `EWELINK_DEFAULTS__CONNECT_TIMEOUT=20`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("EWELINK_").split("__"));

    let config: Config = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Load config from the canonical path.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load config, returning a default if it is missing or invalid.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Tracing ─────────────────────────────────────────────────────────

/// Map a `-v` count onto a filter directive.
pub fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

impl Config {
    /// Filter directive for a `-v` count: non-zero verbosity wins over
    /// `defaults.log_level`.
    pub fn log_directive(&self, verbosity: u8) -> &str {
        if verbosity > 0 {
            verbosity_filter(verbosity)
        } else {
            &self.defaults.log_level
        }
    }

    /// Install the global fmt subscriber. `RUST_LOG` overrides everything.
    ///
    /// An already installed global subscriber is kept.
    pub fn init_tracing(&self, verbosity: u8) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_directive(verbosity)));
        if let Err(e) = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
        {
            debug!(error = %e, "global subscriber already installed, keeping it");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    const SAMPLE: &str = r#"
[defaults]
connect_timeout = 15

[nodes.lamp]
auth = "home-account"
device_id = " 1000abcdef "
method = "setDevicePowerState"
params = ["on"]

[nodes.generic]
auth = "home-account"
"#;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_nodes_and_defaults() {
        let (_dir, path) = write_config(SAMPLE);
        let cfg = load_config_from(&path).unwrap();

        assert_eq!(cfg.defaults.log_level, "warn");
        assert_eq!(
            cfg.bridge_config(),
            BridgeConfig {
                connect_timeout: Some(Duration::from_secs(15))
            }
        );

        let lamp = cfg.device_node("lamp").unwrap();
        assert_eq!(lamp.config.auth.as_str(), "home-account");
        assert_eq!(lamp.config.device_id.as_deref(), Some(" 1000abcdef "));
        assert_eq!(lamp.method.as_deref(), Some("setDevicePowerState"));
        assert!(matches!(lamp.params, Some(ParamSource::Static(ref p)) if *p == vec![json!("on")]));

        let generic = cfg.device_node("generic").unwrap();
        assert_eq!(generic.method, None);
        assert!(generic.params.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert!(cfg.nodes.is_empty());
        assert_eq!(cfg.bridge_config(), BridgeConfig::default());
    }

    #[test]
    fn zero_timeout_means_wait_forever() {
        let (_dir, path) = write_config("[defaults]\nconnect_timeout = 0\n");
        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg.bridge_config().connect_timeout, None);
    }

    #[test]
    fn blank_auth_is_rejected() {
        let (_dir, path) = write_config("[nodes.bad]\nauth = \"  \"\n");
        let err = load_config_from(&path).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid nodes.bad.auth: credentials node reference must not be blank"
        );
    }

    #[test]
    fn blank_method_is_rejected() {
        let mut cfg = Config::default();
        cfg.nodes.insert(
            "n".into(),
            NodeSettings {
                auth: "a".into(),
                device_id: None,
                method: Some(String::new()),
                params: None,
            },
        );
        assert!(matches!(
            cfg.device_node("n"),
            Err(ConfigError::Validation { ref field, .. }) if field == "nodes.n.method"
        ));
    }

    #[test]
    fn unknown_node_is_an_error() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.device_node("nope"),
            Err(ConfigError::UnknownNode { ref name }) if name == "nope"
        ));
    }

    #[test]
    fn saved_config_loads_back() {
        let (_dir, path) = write_config(SAMPLE);
        let cfg = load_config_from(&path).unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let out = out_dir.path().join("nested").join("config.toml");
        save_config_to(&out, &cfg).unwrap();
        let reloaded = load_config_from(&out).unwrap();

        assert_eq!(
            reloaded.nodes.keys().collect::<Vec<_>>(),
            vec!["generic", "lamp"]
        );
        assert_eq!(reloaded.defaults.connect_timeout, Some(15));
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(verbosity_filter(0), "warn");
        assert_eq!(verbosity_filter(2), "debug");
        assert_eq!(verbosity_filter(9), "trace");
    }

    #[test]
    fn configured_log_level_reaches_filter() {
        let (_dir, path) = write_config("[defaults]\nlog_level = \"debug\"\n");
        let cfg = load_config_from(&path).unwrap();

        assert_eq!(cfg.log_directive(0), "debug");
        assert!(EnvFilter::new(cfg.log_directive(0)).to_string().contains("debug"));
    }

    #[test]
    fn verbose_flag_overrides_configured_level() {
        let cfg = Config::default();
        assert_eq!(cfg.log_directive(0), "warn");
        assert_eq!(cfg.log_directive(1), "info");
        assert_eq!(cfg.log_directive(3), "trace");
    }

    #[test]
    fn unparsable_log_level_is_rejected() {
        let (_dir, path) = write_config("[defaults]\nlog_level = \"ewelink=loud\"\n");
        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::Validation { ref field, .. }) if field == "defaults.log_level"
        ));
    }

    #[test]
    fn second_tracing_init_keeps_existing_subscriber() {
        let cfg = Config::default();
        cfg.init_tracing(0);
        cfg.init_tracing(2);
    }
}
