#![deny(unreachable_pub)]

// Public modules that make up the shared data model of the sandbox substrate.
pub mod policy;
pub mod result;
pub mod sandbox;

pub use policy::AccessLevel;
pub use policy::EffectivePolicy;
pub use policy::FolderPolicy;
pub use policy::InheritableRule;
pub use result::CommandResult;
pub use result::EXIT_CODE_SANDBOX_REFUSED;
pub use result::EXIT_CODE_VALIDATION_REJECTED;
pub use result::ValidationResult;
pub use sandbox::SandboxKind;
