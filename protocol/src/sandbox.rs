use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The OS isolation backend confining spawned commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxKind {
    /// Windows AppContainer profile with capability SIDs.
    AppContainer,
    /// Linux `bwrap` namespace sandbox.
    Bubblewrap,
    /// Long-lived container managed through a container runtime.
    Container,
}

impl SandboxKind {
    /// Whether the current build target can host this backend at all.
    /// The factory performs this check before constructing a provider.
    pub fn supported_on_this_platform(self) -> bool {
        match self {
            SandboxKind::AppContainer => cfg!(windows),
            SandboxKind::Bubblewrap => cfg!(target_os = "linux"),
            SandboxKind::Container => true,
        }
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxKind::AppContainer => "app-container",
            SandboxKind::Bubblewrap => "bubblewrap",
            SandboxKind::Container => "container",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_kebab_case() {
        let kind: SandboxKind = serde_json::from_str(r#""app-container""#).unwrap();
        assert_eq!(kind, SandboxKind::AppContainer);
        assert_eq!(serde_json::to_string(&kind).unwrap(), r#""app-container""#);
        assert_eq!(kind.to_string(), "app-container");
    }

    #[test]
    fn container_backend_is_always_available() {
        assert!(SandboxKind::Container.supported_on_this_platform());
    }
}
