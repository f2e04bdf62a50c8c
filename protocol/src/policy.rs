use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

/// Scope path that applies a policy to every location not covered by a more
/// specific declaration.
pub const GLOBAL_SCOPE: &str = "*";

/// Filesystem permission granted to a scope.
///
/// Variants are ordered from most to least restrictive so callers can compare
/// levels directly when deciding whether a descendant scope widened access.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum AccessLevel {
    /// No access of any kind.
    Deny,
    /// Reads allowed, writes and deletes rejected.
    ReadOnly,
    /// Reads and writes allowed.
    #[default]
    ReadWrite,
    /// Reads, writes, deletes, and permission changes allowed.
    FullControl,
}

impl AccessLevel {
    pub fn allows_read(self) -> bool {
        self != AccessLevel::Deny
    }

    pub fn allows_write(self) -> bool {
        matches!(self, AccessLevel::ReadWrite | AccessLevel::FullControl)
    }
}

/// Tri-state rule for concerns that cascade down the folder hierarchy.
///
/// `Inherit` defers to the nearest ancestor scope carrying a concrete value,
/// falling back to the global default when no ancestor sets one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InheritableRule {
    #[default]
    Inherit,
    Allow,
    Deny,
}

/// A declarative folder policy, authored in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderPolicy {
    /// Absolute filesystem path this rule scopes to, or `"*"` for the global
    /// default.
    pub path: String,

    /// Filesystem permission for the scope.
    #[serde(default)]
    pub access: AccessLevel,

    /// Whether processes touching this scope may reach the network.
    #[serde(default)]
    pub network: InheritableRule,

    /// Whether processes may be spawned from this scope.
    #[serde(default)]
    pub execute: InheritableRule,

    /// Extension allowlist; empty means every extension is admitted.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_extensions: BTreeSet<String>,

    /// Extension denylist; always consulted before the allowlist.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub denied_extensions: BTreeSet<String>,

    /// Per-file write ceiling in mebibytes; 0 means unlimited.
    #[serde(default)]
    pub max_file_size_mb: u64,

    /// Log every access decision affecting this scope.
    #[serde(default)]
    pub enable_audit: bool,
}

impl FolderPolicy {
    /// A permissive policy for `path` with every other field at its default.
    pub fn new(path: impl Into<String>, access: AccessLevel) -> Self {
        Self {
            path: path.into(),
            access,
            network: InheritableRule::Inherit,
            execute: InheritableRule::Inherit,
            allowed_extensions: BTreeSet::new(),
            denied_extensions: BTreeSet::new(),
            max_file_size_mb: 0,
            enable_audit: false,
        }
    }

    pub fn is_global(&self) -> bool {
        self.path == GLOBAL_SCOPE
    }
}

/// The fully resolved permission set for a concrete path after hierarchical
/// inheritance. Unlike [`FolderPolicy`], every field is materialized: the
/// tri-state rules have collapsed to booleans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub access: AccessLevel,
    pub network_allowed: bool,
    pub execute_allowed: bool,
    pub allowed_extensions: BTreeSet<String>,
    pub denied_extensions: BTreeSet<String>,
    pub max_file_size_mb: u64,
    pub enable_audit: bool,
    /// The most specific declared scope that contributed to this result;
    /// `"*"` when only the global default applied. Used in audit messages.
    pub scope: String,
}
