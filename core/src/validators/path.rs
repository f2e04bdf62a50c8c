use std::path::Path;

use warden_protocol::ValidationResult;

use crate::config::Config;
use crate::path_utils::canonicalize_best_effort;
use crate::policy::FolderPolicyEngine;

const MIB: u64 = 1024 * 1024;

/// The filesystem operation being gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Delete,
}

impl FileMode {
    fn mutates(self) -> bool {
        matches!(self, FileMode::Write | FileMode::Delete)
    }
}

/// Gate one filesystem operation. Canonicalizes the path, rejects anything
/// outside every declared policy root, then forwards to the policy engine's
/// access check. Reads additionally enforce the at-rest size ceiling; this
/// is the only place file sizes are checked before a read.
pub fn validate_path(
    path: &Path,
    mode: FileMode,
    engine: &FolderPolicyEngine,
    config: &Config,
) -> ValidationResult {
    let resolved = canonicalize_best_effort(path);

    if !engine.covers(&resolved) {
        return ValidationResult::deny(format!(
            "path '{}' outside allowed directories",
            resolved.display()
        ));
    }

    let verdict = engine.check_file_access(&resolved, mode.mutates());
    if !verdict.allowed {
        return verdict;
    }

    if mode == FileMode::Read {
        let effective = engine.effective(&resolved);
        let ceiling_mb = if effective.max_file_size_mb > 0 {
            effective.max_file_size_mb
        } else {
            config.fs.max_file_size_mb
        };
        if ceiling_mb > 0 {
            if let Ok(metadata) = std::fs::metadata(&resolved) {
                if metadata.is_file() && metadata.len() > ceiling_mb * MIB {
                    return ValidationResult::deny(format!(
                        "file '{}' exceeds the {ceiling_mb} MiB size limit",
                        resolved.display()
                    ));
                }
            }
        }
    }

    ValidationResult::allow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use warden_protocol::AccessLevel;
    use warden_protocol::FolderPolicy;

    fn engine_with(policies: Vec<FolderPolicy>) -> FolderPolicyEngine {
        let engine = FolderPolicyEngine::new();
        engine.add_policies(policies);
        engine
    }

    #[test]
    fn rejects_paths_escaping_all_declared_roots() {
        let engine = engine_with(vec![FolderPolicy::new("/work", AccessLevel::ReadWrite)]);
        let config = Config::default();

        let verdict = validate_path(
            Path::new("/etc/shadow"),
            FileMode::Read,
            &engine,
            &config,
        );
        assert!(!verdict.allowed);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("path '/etc/shadow' outside allowed directories")
        );

        let inside = validate_path(
            Path::new("/work/notes.txt"),
            FileMode::Write,
            &engine,
            &config,
        );
        assert!(inside.allowed);
    }

    #[test]
    fn traversal_cannot_escape_a_declared_root() {
        let engine = engine_with(vec![FolderPolicy::new("/work", AccessLevel::ReadWrite)]);
        let config = Config::default();

        let verdict = validate_path(
            Path::new("/work/../etc/passwd"),
            FileMode::Read,
            &engine,
            &config,
        );
        assert!(!verdict.allowed);
    }

    #[test]
    fn delete_requires_write_access() {
        let engine = engine_with(vec![FolderPolicy::new("/ro", AccessLevel::ReadOnly)]);
        let config = Config::default();

        let verdict = validate_path(Path::new("/ro/file"), FileMode::Delete, &engine, &config);
        assert!(!verdict.allowed);
    }

    #[test]
    fn read_applies_the_config_fallback_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("dump.bin");
        std::fs::write(&big, vec![0u8; 3 * MIB as usize]).unwrap();

        let engine = engine_with(vec![FolderPolicy::new(
            dir.path().to_str().unwrap(),
            AccessLevel::ReadWrite,
        )]);
        let mut config = Config::default();
        config.fs.max_file_size_mb = 2;

        let verdict = validate_path(&big, FileMode::Read, &engine, &config);
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("2 MiB"));

        // A policy-level ceiling takes precedence over the fallback.
        let mut tighter = FolderPolicy::new(dir.path().to_str().unwrap(), AccessLevel::ReadWrite);
        tighter.max_file_size_mb = 1;
        engine.add_policy(tighter);
        let verdict = validate_path(&big, FileMode::Read, &engine, &config);
        assert!(verdict.reason.unwrap().contains("1 MiB"));
    }

    #[test]
    fn everything_allowed_with_no_declared_policies() {
        let engine = FolderPolicyEngine::new();
        let config = Config::default();
        assert!(validate_path(Path::new("/anywhere"), FileMode::Write, &engine, &config).allowed);
    }
}
