use thiserror::Error;

pub type Result<T> = std::result::Result<T, WardenErr>;

/// Error taxonomy of the sandbox substrate.
///
/// Validation outcomes and timeouts are deliberately absent: the former are
/// returned as [`warden_protocol::ValidationResult`] values, the latter
/// degrade to a [`warden_protocol::CommandResult`] with the reserved exit
/// code after the child tree has been killed.
#[derive(Debug, Error)]
pub enum WardenErr {
    /// The configuration asked for something this host cannot provide, or a
    /// configured value is malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A system call failed. Carries the API name so operators can correlate
    /// with OS-level tracing; the raw error number stays out of user-facing
    /// messages.
    #[error("{api} failed: {source}")]
    Os {
        api: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The sandbox backend reported a failure that is not a plain OS error,
    /// e.g. a container runtime exiting non-zero during setup or teardown.
    #[error("sandbox failure: {0}")]
    Sandbox(String),

    /// `execute*` called before `initialize` or after `dispose`.
    #[error("invalid session state: {0}")]
    State(String),
}

impl WardenErr {
    pub fn os(api: &'static str, source: std::io::Error) -> Self {
        WardenErr::Os { api, source }
    }
}
