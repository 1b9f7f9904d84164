//! Configuration for modelmux.
//!
//! The config document is YAML. Model commands are templates: `${PORT}` and
//! user-defined macros are expanded textually at load time, before the
//! shell-free argv split at spawn time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Maximum request body buffered for model extraction (32 MiB).
pub const MAX_BUFFERED_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("model {model}: {reason}")]
    InvalidModel { model: String, reason: String },

    #[error("group {group}: {reason}")]
    InvalidGroup { group: String, reason: String },

    #[error("alias {alias} is declared by both {first} and {second}")]
    DuplicateAlias {
        alias: String,
        first: String,
        second: String,
    },

    #[error("startPort {start} leaves no room for {count} models")]
    PortRange { start: u16, count: usize },
}

/// Which log streams are echoed at info level instead of debug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStdout {
    Off,
    Proxy,
    Upstream,
    #[default]
    Both,
}

impl LogStdout {
    pub fn upstream_enabled(self) -> bool {
        matches!(self, LogStdout::Upstream | LogStdout::Both)
    }

    pub fn proxy_enabled(self) -> bool {
        matches!(self, LogStdout::Proxy | LogStdout::Both)
    }
}

/// Per-model placement strategy, parsed from the free-form `fitPolicy` string.
/// Unrecognized values behave as `None` (no GPU placement reasoning).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitPolicy {
    EvictToFit,
    Spill,
    CpuMoe,
    None,
}

impl FitPolicy {
    pub fn parse(raw: &str) -> FitPolicy {
        match raw.trim().to_ascii_lowercase().as_str() {
            "evict_to_fit" => FitPolicy::EvictToFit,
            "spill" => FitPolicy::Spill,
            "cpu_moe" => FitPolicy::CpuMoe,
            _ => FitPolicy::None,
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Seconds a starting process gets to pass its health check.
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,

    /// First port handed out for `${PORT}` expansion; models get sequential
    /// ports in sorted id order.
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    /// Address the proxy listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// error | warn | info | debug
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_to_stdout: LogStdout,

    /// Prometheus metrics port; 0 disables the exporter listener.
    #[serde(default)]
    pub metrics_port: u16,

    /// Global per-GPU VRAM cap in MB; 0 = uncapped.
    #[serde(rename = "gpuVramCapMB", default)]
    pub gpu_vram_cap_mb: u64,

    /// Per-GPU VRAM caps in MB, indexed by GPU; overrides the global cap.
    #[serde(rename = "gpuVramCapsMB", default)]
    pub gpu_vram_caps_mb: Vec<u64>,

    /// Host RAM budget in MB for non-spill models; 0 disables admission.
    #[serde(rename = "hostRamCapMB", default)]
    pub host_ram_cap_mb: u64,

    /// User-defined macros available in every model's `cmd`.
    #[serde(default)]
    pub macros: HashMap<String, String>,

    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            health_check_timeout: default_health_check_timeout(),
            start_port: default_start_port(),
            listen: default_listen(),
            log_level: default_log_level(),
            log_to_stdout: LogStdout::default(),
            metrics_port: 0,
            gpu_vram_cap_mb: 0,
            gpu_vram_caps_mb: Vec::new(),
            host_ram_cap_mb: 0,
            macros: HashMap::new(),
            models: HashMap::new(),
            groups: HashMap::new(),
        }
    }
}

/// Configuration for a single model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Command template producing the upstream process. `${PORT}`,
    /// `${MODEL_PATH}` and user macros are expanded before the argv split.
    #[serde(default)]
    pub cmd: String,

    /// Optional command run for graceful stop instead of SIGTERM.
    /// `${PID}` expands to the child's process id.
    #[serde(default)]
    pub cmd_stop: String,

    /// Upstream base URL the child serves on.
    #[serde(default = "default_proxy_url", rename = "proxy")]
    pub proxy_url: String,

    /// Relative path polled for readiness.
    #[serde(default = "default_check_endpoint")]
    pub check_endpoint: String,

    /// Idle seconds before automatic unload; 0 disables.
    #[serde(default, alias = "unloadAfterSeconds")]
    pub ttl: u64,

    /// Maximum simultaneous in-flight requests; 0 = unlimited.
    #[serde(default)]
    pub concurrency_limit: usize,

    /// evict_to_fit | spill | cpu_moe | unset
    #[serde(default)]
    pub fit_policy: String,

    /// Seed VRAM hint in MB, used until the first live measurement.
    #[serde(rename = "initialVramMB", default)]
    pub initial_vram_mb: u64,

    /// Seed host-RAM hint in MB.
    #[serde(rename = "initialCpuMB", default)]
    pub initial_cpu_mb: u64,

    /// Model file path, substituted for `${MODEL_PATH}`.
    #[serde(default)]
    pub path: String,

    /// Extra KEY=VALUE environment entries for the child.
    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default)]
    pub aliases: Vec<String>,

    #[serde(default)]
    pub unlisted: bool,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Model-level macros; override top-level macros of the same name.
    #[serde(default)]
    pub macros: HashMap<String, String>,

    /// Port assigned from `startPort` at load time.
    #[serde(skip)]
    pub port: u16,
}

impl ModelConfig {
    pub fn fit_policy(&self) -> FitPolicy {
        FitPolicy::parse(&self.fit_policy)
    }
}

/// A named swap domain of models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    /// Only one member may be ready at a time.
    #[serde(default = "default_true")]
    pub swap: bool,

    /// Participates in the cross-group exclusivity domain.
    #[serde(default = "default_true")]
    pub exclusive: bool,

    #[serde(default)]
    pub members: Vec<String>,
}

fn default_health_check_timeout() -> u64 {
    120
}

fn default_start_port() -> u16 {
    5800
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_proxy_url() -> String {
    "http://localhost:${PORT}".to_string()
}

fn default_check_endpoint() -> String {
    "/health".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and finalize a configuration from a YAML file.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&contents)
    }

    /// Parse, assign ports, expand macros, and validate.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(contents)?;
        config.finalize()?;
        Ok(config)
    }

    fn finalize(&mut self) -> Result<(), ConfigError> {
        let ids = self.model_ids_sorted();

        if (self.start_port as usize) + ids.len() > u16::MAX as usize {
            return Err(ConfigError::PortRange {
                start: self.start_port,
                count: ids.len(),
            });
        }

        let global_macros = self.macros.clone();
        for (offset, id) in ids.iter().enumerate() {
            let port = self.start_port + offset as u16;
            let model = self.models.get_mut(id).expect("id from models map");
            model.port = port;

            let mut macros = global_macros.clone();
            macros.extend(model.macros.clone());
            macros.insert("PORT".to_string(), port.to_string());
            macros.insert("MODEL_PATH".to_string(), model.path.clone());

            model.cmd =
                expand_macros(&model.cmd, &macros).map_err(|reason| ConfigError::InvalidModel {
                    model: id.clone(),
                    reason,
                })?;
            model.proxy_url = expand_macros(&model.proxy_url, &macros).map_err(|reason| {
                ConfigError::InvalidModel {
                    model: id.clone(),
                    reason,
                }
            })?;
            // cmd_stop keeps ${PID} for stop time, when the child pid exists.
            model.cmd_stop = expand_macros_unchecked(&model.cmd_stop, &macros);

            if model.cmd.trim().is_empty() {
                return Err(ConfigError::InvalidModel {
                    model: id.clone(),
                    reason: "cmd is required".to_string(),
                });
            }
            if !model.check_endpoint.starts_with('/') {
                return Err(ConfigError::InvalidModel {
                    model: id.clone(),
                    reason: format!(
                        "checkEndpoint {:?} must start with '/'",
                        model.check_endpoint
                    ),
                });
            }
        }

        self.validate_aliases()?;
        self.validate_groups()?;
        Ok(())
    }

    fn validate_aliases(&self) -> Result<(), ConfigError> {
        let mut seen: HashMap<String, String> = HashMap::new();
        for (id, model) in &self.models {
            for alias in &model.aliases {
                if self.models.contains_key(alias) {
                    return Err(ConfigError::InvalidModel {
                        model: id.clone(),
                        reason: format!("alias {alias} collides with a model id"),
                    });
                }
                if let Some(first) = seen.get(alias) {
                    // HashMap iteration order is arbitrary; normalize for a stable message
                    let (first, second) = if first < id {
                        (first.clone(), id.clone())
                    } else {
                        (id.clone(), first.clone())
                    };
                    return Err(ConfigError::DuplicateAlias {
                        alias: alias.clone(),
                        first,
                        second,
                    });
                }
                seen.insert(alias.clone(), id.clone());
            }
        }
        Ok(())
    }

    fn validate_groups(&self) -> Result<(), ConfigError> {
        let mut member_of: HashMap<&str, &str> = HashMap::new();
        for (group_id, group) in &self.groups {
            if group.members.is_empty() {
                return Err(ConfigError::InvalidGroup {
                    group: group_id.clone(),
                    reason: "group has no members".to_string(),
                });
            }
            for member in &group.members {
                if !self.models.contains_key(member) {
                    return Err(ConfigError::InvalidGroup {
                        group: group_id.clone(),
                        reason: format!("member {member} is not a configured model"),
                    });
                }
                if let Some(other) = member_of.insert(member.as_str(), group_id.as_str()) {
                    return Err(ConfigError::InvalidGroup {
                        group: group_id.clone(),
                        reason: format!("member {member} already belongs to group {other}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Model ids in deterministic (sorted) order.
    pub fn model_ids_sorted(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve a requested name (model id or alias) to the concrete model id.
    pub fn real_model_name(&self, requested: &str) -> Option<String> {
        if self.models.contains_key(requested) {
            return Some(requested.to_string());
        }
        for (id, model) in &self.models {
            if model.aliases.iter().any(|a| a == requested) {
                return Some(id.clone());
            }
        }
        None
    }

    /// The effective group layout: configured groups plus an implicit
    /// single-member swap group for every model no group names.
    pub fn effective_groups(&self) -> Vec<(String, GroupConfig)> {
        let mut grouped: Vec<(String, GroupConfig)> = Vec::new();
        let mut covered: Vec<&String> = Vec::new();

        let mut group_ids: Vec<&String> = self.groups.keys().collect();
        group_ids.sort();
        for id in group_ids {
            let group = &self.groups[id];
            covered.extend(group.members.iter());
            grouped.push((id.clone(), group.clone()));
        }

        for id in self.model_ids_sorted() {
            if covered.iter().any(|m| **m == id) {
                continue;
            }
            grouped.push((
                id.clone(),
                GroupConfig {
                    swap: true,
                    exclusive: true,
                    members: vec![id.clone()],
                },
            ));
        }
        grouped
    }
}

/// Literal `${NAME}` substitution. Errors on macros that remain unexpanded.
pub fn expand_macros(template: &str, macros: &HashMap<String, String>) -> Result<String, String> {
    let out = expand_macros_unchecked(template, macros);
    if let Some(start) = out.find("${") {
        let rest = &out[start..];
        let end = rest.find('}').map(|i| start + i + 1).unwrap_or(out.len());
        return Err(format!("unknown macro {}", &out[start..end]));
    }
    Ok(out)
}

/// Substitution without the leftover-macro check, for templates holding
/// placeholders that only resolve at runtime (e.g. `${PID}`).
pub fn expand_macros_unchecked(template: &str, macros: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in macros {
        out = out.replace(&format!("${{{name}}}"), value);
    }
    out
}
