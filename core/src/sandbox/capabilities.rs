use crate::error::Result;
use crate::error::WardenErr;

/// Well-known AppContainer capability SIDs, keyed by their configuration
/// names. Raw `S-1-15-3-*` strings pass through untouched.
const WELL_KNOWN_CAPABILITIES: &[(&str, &str)] = &[
    ("internetclient", "S-1-15-3-1"),
    ("internetclientserver", "S-1-15-3-2"),
    ("privatenetworkclientserver", "S-1-15-3-3"),
    ("pictureslibrary", "S-1-15-3-4"),
    ("videoslibrary", "S-1-15-3-5"),
    ("musiclibrary", "S-1-15-3-6"),
    ("documentslibrary", "S-1-15-3-7"),
    ("enterpriseauthentication", "S-1-15-3-8"),
    ("sharedusercertificates", "S-1-15-3-9"),
    ("removablestorage", "S-1-15-3-10"),
];

/// Map one configured capability name to its SID string form.
/// Names are accepted in kebab-case, snake_case, or CamelCase.
pub fn capability_sid_string(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.to_ascii_uppercase().starts_with("S-1-15-3-") {
        return Some(trimmed.to_string());
    }

    let key: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    WELL_KNOWN_CAPABILITIES
        .iter()
        .find(|(known, _)| *known == key)
        .map(|(_, sid)| sid.to_string())
}

/// Resolve every configured capability, failing fast on the first unknown
/// name so a typo cannot silently widen or narrow the sandbox.
pub fn resolve_capabilities(names: &[String]) -> Result<Vec<String>> {
    names
        .iter()
        .map(|name| {
            capability_sid_string(name)
                .ok_or_else(|| WardenErr::Configuration(format!("unknown capability '{name}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn maps_well_known_names() {
        assert_eq!(
            capability_sid_string("internet-client").as_deref(),
            Some("S-1-15-3-1")
        );
        assert_eq!(
            capability_sid_string("InternetClientServer").as_deref(),
            Some("S-1-15-3-2")
        );
        assert_eq!(
            capability_sid_string("private_network_client_server").as_deref(),
            Some("S-1-15-3-3")
        );
        assert_eq!(
            capability_sid_string("documents-library").as_deref(),
            Some("S-1-15-3-7")
        );
    }

    #[test]
    fn raw_sid_strings_pass_through() {
        assert_eq!(
            capability_sid_string("S-1-15-3-42").as_deref(),
            Some("S-1-15-3-42")
        );
    }

    #[test]
    fn unknown_names_fail_resolution() {
        assert!(capability_sid_string("quantum-entanglement").is_none());
        let err = resolve_capabilities(&["internet-client".into(), "nope".into()]).unwrap_err();
        assert!(matches!(err, WardenErr::Configuration(_)));
    }
}
