//! Policy-consuming validators gating every tool operation.
//!
//! Decisions are values: each validator returns a
//! [`warden_protocol::ValidationResult`] the caller must inspect before
//! performing any side effect. Apart from audit logging on scopes that
//! request it, validators have no side effects.

mod command;
mod path;
mod url;

pub use command::validate_command;
pub use path::FileMode;
pub use path::validate_path;
pub use url::validate_url;
