use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use warden_protocol::FolderPolicy;
use warden_protocol::SandboxKind;

use crate::error::Result;
use crate::error::WardenErr;

/// Whether the command validator admits by allowlist or rejects by denylist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandPolicyMode {
    Whitelist,
    #[default]
    Blacklist,
}

fn default_sandbox_kind() -> SandboxKind {
    if cfg!(windows) {
        SandboxKind::AppContainer
    } else if cfg!(target_os = "linux") {
        SandboxKind::Bubblewrap
    } else {
        SandboxKind::Container
    }
}

fn default_container_name() -> String {
    "warden".to_string()
}

fn default_container_image() -> String {
    "alpine:latest".to_string()
}

fn default_timeout_s() -> u64 {
    30
}

fn default_allowed_domains() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Backend selection; defaults to the native backend for this platform.
    pub kind: SandboxKind,

    /// Windows AppContainer profile name. Sessions sharing a name share the
    /// derived SID, so distinct agent instances wanting isolation from each
    /// other must use distinct names.
    pub container_name: String,

    /// Base image for the container backend.
    pub container_image: String,

    /// AppContainer capability names (`internet-client`, ...) or raw
    /// `S-1-15-3-*` SID strings.
    pub capabilities: Vec<String>,

    /// Container runtime binary; auto-detected (`docker`, then `podman`)
    /// when unset.
    pub runtime: Option<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            kind: default_sandbox_kind(),
            container_name: default_container_name(),
            container_image: default_container_image(),
            capabilities: Vec::new(),
            runtime: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub mode: CommandPolicyMode,
    pub allowed: BTreeSet<String>,
    pub denied: BTreeSet<String>,

    /// Per-execution wall-clock ceiling in seconds.
    pub timeout_s: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            mode: CommandPolicyMode::default(),
            allowed: BTreeSet::new(),
            denied: BTreeSet::new(),
            timeout_s: default_timeout_s(),
        }
    }
}

impl CommandSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FsSettings {
    /// Fallback per-file size ceiling (MiB) applied when no folder policy
    /// sets one; 0 means unlimited.
    pub max_file_size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlSettings {
    /// Host patterns admitted by the URL validator; `*` wildcards supported.
    pub allowed_domains: Vec<String>,
    /// Host patterns rejected even when an allowed pattern also matches.
    pub denied_domains: Vec<String>,
}

impl Default for UrlSettings {
    fn default() -> Self {
        Self {
            allowed_domains: default_allowed_domains(),
            denied_domains: Vec::new(),
        }
    }
}

/// Root configuration of the sandbox substrate. Loaded once at startup;
/// every subsystem receives a borrow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sandbox: SandboxSettings,
    pub command: CommandSettings,
    pub fs: FsSettings,
    pub url: UrlSettings,
    pub folder_policies: Vec<FolderPolicy>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            WardenErr::Configuration(format!(
                "failed to read config file {}: {err}",
                path.display()
            ))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|err| WardenErr::Configuration(format!("malformed config: {err}")))
    }
}
