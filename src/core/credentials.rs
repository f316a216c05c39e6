use std::sync::OnceLock;

pub const DEFAULT_API_KEY_ENV: &[&str] = &["API_KEY", "GEMINI_API_KEY"];

/// Where the generation client looks for its API credential.
#[derive(Clone, Debug)]
pub enum CredentialSource {
    /// First non-empty value among these environment variables.
    Env(Vec<String>),
    /// A value supplied by the embedding program; `None` means "no credential".
    Fixed(Option<String>),
}

impl Default for CredentialSource {
    fn default() -> Self {
        CredentialSource::Env(DEFAULT_API_KEY_ENV.iter().map(|s| s.to_string()).collect())
    }
}

impl CredentialSource {
    fn resolve(&self) -> Option<String> {
        match self {
            CredentialSource::Env(names) => names.iter().find_map(|name| {
                std::env::var(name)
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            }),
            CredentialSource::Fixed(value) => value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        }
    }

    /// Human-readable hint naming where a credential was expected.
    pub fn describe(&self) -> String {
        match self {
            CredentialSource::Env(names) if names.is_empty() => {
                "no environment variable configured".to_string()
            }
            CredentialSource::Env(names) => format!("environment variable {}", names.join(" or ")),
            CredentialSource::Fixed(_) => "embedded credential".to_string(),
        }
    }
}

/// A credential resolved lazily on first use and then kept for the owner's
/// lifetime. A missing credential is cached too.
#[derive(Debug)]
pub struct CachedCredential {
    source: CredentialSource,
    resolved: OnceLock<Option<String>>,
}

impl CachedCredential {
    pub fn new(source: CredentialSource) -> Self {
        Self {
            source,
            resolved: OnceLock::new(),
        }
    }

    pub fn get(&self) -> Option<&str> {
        self.resolved
            .get_or_init(|| {
                let value = self.source.resolve();
                if value.is_none() {
                    tracing::debug!(source = %self.source.describe(), "no API credential found");
                }
                value
            })
            .as_deref()
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_blank_credentials_count_as_missing() {
        let cached = CachedCredential::new(CredentialSource::Fixed(Some("   ".into())));
        assert_eq!(cached.get(), None);
    }

    #[test]
    fn fixed_credentials_are_trimmed() {
        let cached = CachedCredential::new(CredentialSource::Fixed(Some(" key-1 \n".into())));
        assert_eq!(cached.get(), Some("key-1"));
    }

    #[test]
    fn env_lookup_takes_first_non_empty_variable() {
        let empty = "CAUSERIE_TEST_CRED_EMPTY_71";
        let set = "CAUSERIE_TEST_CRED_SET_71";
        std::env::set_var(empty, "");
        std::env::set_var(set, "from-env");

        let cached = CachedCredential::new(CredentialSource::Env(vec![
            "CAUSERIE_TEST_CRED_UNSET_71".into(),
            empty.into(),
            set.into(),
        ]));
        assert_eq!(cached.get(), Some("from-env"));

        std::env::remove_var(empty);
        std::env::remove_var(set);
    }

    #[test]
    fn resolution_is_cached_for_the_owner_lifetime() {
        let name = "CAUSERIE_TEST_CRED_LATE_72";
        std::env::remove_var(name);
        let cached = CachedCredential::new(CredentialSource::Env(vec![name.into()]));
        assert_eq!(cached.get(), None);

        std::env::set_var(name, "too-late");
        assert_eq!(cached.get(), None);
        std::env::remove_var(name);
    }

    #[test]
    fn describe_names_the_variables() {
        let source = CredentialSource::default();
        assert_eq!(
            source.describe(),
            "environment variable API_KEY or GEMINI_API_KEY"
        );
    }
}
