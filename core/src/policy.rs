use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;
use tracing::info;
use warden_protocol::AccessLevel;
use warden_protocol::EffectivePolicy;
use warden_protocol::FolderPolicy;
use warden_protocol::InheritableRule;
use warden_protocol::ValidationResult;
use warden_protocol::policy::GLOBAL_SCOPE;

use crate::config::Config;
use crate::path_utils::canonicalize_best_effort;
use crate::path_utils::comparison_path;
use crate::path_utils::is_ancestor_or_equal;
use crate::path_utils::normalize_scope;

const MIB: u64 = 1024 * 1024;

/// Hierarchical folder-policy resolver.
///
/// Pure data, no I/O beyond an optional file-size stat in
/// [`check_file_access`]. Declared policies live in a vector ordered
/// most-specific-first; resolved results are memoized in a cache that every
/// mutation invalidates.
#[derive(Debug, Default)]
pub struct FolderPolicyEngine {
    policies: Mutex<Vec<FolderPolicy>>,
    cache: Mutex<HashMap<PathBuf, EffectivePolicy>>,
}

impl FolderPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine pre-loaded with the configuration's declared policies.
    pub fn from_config(config: &Config) -> Self {
        let engine = Self::new();
        engine.add_policies(config.folder_policies.iter().cloned());
        engine
    }

    /// Register a policy. The path is normalized, any prior entry with the
    /// same normalized path is replaced (last declaration wins), and the
    /// resolver cache is invalidated.
    pub fn add_policy(&self, mut policy: FolderPolicy) {
        if !policy.is_global() {
            policy.path = normalize_scope(&policy.path);
            if policy.path.is_empty() {
                debug!("ignoring folder policy with empty path");
                return;
            }
        }

        let mut policies = self.policies.lock().unwrap_or_else(|e| e.into_inner());
        policies.retain(|existing| !same_scope(&existing.path, &policy.path));
        policies.push(policy);
        // Most-specific-first ordering; resolution re-sorts the matching
        // subset ancestor-first.
        policies.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        drop(policies);

        self.invalidate_cache();
    }

    pub fn add_policies(&self, policies: impl IntoIterator<Item = FolderPolicy>) {
        for policy in policies {
            self.add_policy(policy);
        }
    }

    pub fn policies(&self) -> Vec<FolderPolicy> {
        self.policies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether `path` falls under any declared scope. Vacuously true when no
    /// policies are declared at all (the built-in default covers everything)
    /// or when a global `"*"` policy exists.
    pub fn covers(&self, path: &Path) -> bool {
        let policies = self.policies.lock().unwrap_or_else(|e| e.into_inner());
        if policies.is_empty() || policies.iter().any(FolderPolicy::is_global) {
            return true;
        }
        let resolved = canonicalize_best_effort(path);
        policies
            .iter()
            .any(|p| is_ancestor_or_equal(Path::new(&p.path), &resolved))
    }

    /// Resolve the effective policy for a concrete path. Cached; any policy
    /// mutation invalidates the cache.
    pub fn effective(&self, path: &Path) -> EffectivePolicy {
        let resolved = canonicalize_best_effort(path);
        let key = comparison_path(&resolved);

        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return hit.clone();
        }

        let computed = self.compute_effective(&resolved);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, computed.clone());
        computed
    }

    /// Combined access decision for one file operation: access level, then
    /// extension rules, then the per-file write ceiling. First failure wins
    /// and the reason names the rule that fired.
    pub fn check_file_access(&self, file_path: &Path, write: bool) -> ValidationResult {
        let effective = self.effective(file_path);
        let verdict = file_access_verdict(&effective, file_path, write);

        if effective.enable_audit {
            info!(
                path = %file_path.display(),
                scope = %effective.scope,
                write,
                allowed = verdict.allowed,
                reason = verdict.reason.as_deref().unwrap_or(""),
                "file access audit"
            );
        }

        verdict
    }

    pub fn is_network_allowed(&self, path: &Path) -> bool {
        self.effective(path).network_allowed
    }

    pub fn is_execute_allowed(&self, path: &Path) -> bool {
        self.effective(path).execute_allowed
    }

    fn invalidate_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn compute_effective(&self, resolved: &Path) -> EffectivePolicy {
        let policies = self.policies.lock().unwrap_or_else(|e| e.into_inner());

        let mut effective = policies
            .iter()
            .find(|p| p.is_global())
            .map(seed_from_global)
            .unwrap_or_else(builtin_default);

        // Ancestor → descendant so the most specific scope applies last.
        let mut matching: Vec<&FolderPolicy> = policies
            .iter()
            .filter(|p| !p.is_global() && is_ancestor_or_equal(Path::new(&p.path), resolved))
            .collect();
        matching.sort_by_key(|p| p.path.len());

        for policy in matching {
            apply_scope(&mut effective, policy);
        }

        effective
    }
}

fn same_scope(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// The permissive baseline used when no `"*"` policy is declared: the policy
/// layer only narrows, confinement itself is the sandbox's job.
fn builtin_default() -> EffectivePolicy {
    EffectivePolicy {
        access: AccessLevel::ReadWrite,
        network_allowed: true,
        execute_allowed: true,
        allowed_extensions: BTreeSet::new(),
        denied_extensions: BTreeSet::new(),
        max_file_size_mb: 0,
        enable_audit: false,
        scope: GLOBAL_SCOPE.to_string(),
    }
}

fn seed_from_global(global: &FolderPolicy) -> EffectivePolicy {
    EffectivePolicy {
        access: global.access,
        // At the root there is no ancestor to defer to; Inherit falls back
        // to the built-in allow.
        network_allowed: global.network != InheritableRule::Deny,
        execute_allowed: global.execute != InheritableRule::Deny,
        allowed_extensions: global.allowed_extensions.clone(),
        denied_extensions: global.denied_extensions.clone(),
        max_file_size_mb: global.max_file_size_mb,
        enable_audit: global.enable_audit,
        scope: GLOBAL_SCOPE.to_string(),
    }
}

fn apply_scope(effective: &mut EffectivePolicy, policy: &FolderPolicy) {
    effective.access = policy.access;

    if policy.network != InheritableRule::Inherit {
        effective.network_allowed = policy.network == InheritableRule::Allow;
    }
    if policy.execute != InheritableRule::Inherit {
        effective.execute_allowed = policy.execute == InheritableRule::Allow;
    }
    if !policy.allowed_extensions.is_empty() {
        effective.allowed_extensions = policy.allowed_extensions.clone();
    }
    if !policy.denied_extensions.is_empty() {
        effective.denied_extensions = policy.denied_extensions.clone();
    }
    // The tighter positive ceiling wins regardless of scope depth.
    if policy.max_file_size_mb > 0
        && (effective.max_file_size_mb == 0 || policy.max_file_size_mb < effective.max_file_size_mb)
    {
        effective.max_file_size_mb = policy.max_file_size_mb;
    }
    // Audit latches sticky-on: a parent that wants visibility keeps it even
    // when a child scope does not re-declare it.
    effective.enable_audit |= policy.enable_audit;
    effective.scope = policy.path.clone();
}

fn file_access_verdict(
    effective: &EffectivePolicy,
    file_path: &Path,
    write: bool,
) -> ValidationResult {
    if effective.access == AccessLevel::Deny {
        return ValidationResult::deny(format!(
            "access to '{}' is denied by policy",
            file_path.display()
        ));
    }

    let extension = file_path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase());

    if let Some(ext) = extension.as_deref() {
        if effective
            .denied_extensions
            .iter()
            .any(|denied| denied.eq_ignore_ascii_case(ext))
        {
            return ValidationResult::deny(format!("extension '{ext}' is denied"));
        }
    }

    if !effective.allowed_extensions.is_empty() {
        let admitted = extension.as_deref().is_some_and(|ext| {
            effective
                .allowed_extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        });
        if !admitted {
            return ValidationResult::deny(format!(
                "extension '{}' not in allowed list",
                extension.as_deref().unwrap_or("")
            ));
        }
    }

    if write && !effective.access.allows_write() {
        return ValidationResult::deny(format!("path '{}' is read-only", file_path.display()));
    }

    if write && effective.max_file_size_mb > 0 {
        if let Ok(metadata) = std::fs::metadata(file_path) {
            if metadata.is_file() && metadata.len() > effective.max_file_size_mb * MIB {
                return ValidationResult::deny(format!(
                    "file '{}' exceeds the {} MiB size limit",
                    file_path.display(),
                    effective.max_file_size_mb
                ));
            }
        }
    }

    ValidationResult::allow()
}
