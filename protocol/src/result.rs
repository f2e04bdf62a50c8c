use serde::Deserialize;
use serde::Serialize;

/// Exit code reported when the sandbox itself refused the operation or the
/// child exceeded its wall-clock budget. Never produced by a real child.
pub const EXIT_CODE_SANDBOX_REFUSED: i32 = -1;

/// Exit code reported when a validator rejected the operation before any
/// process was spawned.
pub const EXIT_CODE_VALIDATION_REJECTED: i32 = -2;

/// Captured outcome of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The uniform shape a timed-out or cancelled execution degrades to.
    pub fn timed_out() -> Self {
        Self {
            exit_code: EXIT_CODE_SANDBOX_REFUSED,
            stdout: String::new(),
            stderr: "operation timed out".to_string(),
        }
    }
}

/// Allow/deny decision produced by a validator. Decisions are values, not
/// errors: callers must inspect `allowed` before performing any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}
