//! Gateway credential store
//!
//! Credentials map an opaque access key to the shared secret and the entity
//! (principal, usually an email address) the key belongs to. They are loaded
//! once at startup from a multi-document YAML stream and are immutable for
//! the life of the process:
//!
//! ```yaml
//! ---
//! name: example@example.com
//! key: Nj4jT6JyEgMtDUgU
//! secret: yPhnQEuB9CkksqXb6RaggqTkNEBEdpJC
//! ---
//! name: example2@example.com
//! key: us6LJYaJqag67C9G
//! secret: ph99WLvGy9jPvvWW6L3ELncfXCNzQlHr
//! ```

use crate::config::ConfigError;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// One access key and the entity it authenticates.
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    /// Principal identifier (e.g. an email address).
    #[serde(rename = "name")]
    pub entity: String,
    /// Public access key carried in `AWSAccessKeyId`.
    pub key: String,
    /// Shared signing secret.
    pub secret: String,
}

/// Read-only access-key → credential map.
#[derive(Debug, Default)]
pub struct CredentialStore {
    by_key: HashMap<String, Credential>,
}

impl CredentialStore {
    /// Build a store from already-parsed credentials. Duplicate keys keep
    /// the last entry here; [`CredentialStore::load`] rejects them instead.
    pub fn from_credentials(credentials: Vec<Credential>) -> Self {
        let by_key = credentials
            .into_iter()
            .map(|c| (c.key.clone(), c))
            .collect();
        Self { by_key }
    }

    /// Load a multi-document YAML credentials file. Duplicate keys are a
    /// configuration error: silently resolving them would make authentication
    /// outcomes depend on file order.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Credentials(format!("unable to read {}: {}", path.display(), e))
        })?;

        let mut by_key: HashMap<String, Credential> = HashMap::new();
        for document in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(document).map_err(|e| {
                ConfigError::Credentials(format!("malformed {}: {}", path.display(), e))
            })?;
            if value.is_null() {
                continue;
            }
            let credential: Credential = serde_yaml::from_value(value).map_err(|e| {
                ConfigError::Credentials(format!("malformed {}: {}", path.display(), e))
            })?;
            if by_key.contains_key(&credential.key) {
                return Err(ConfigError::Credentials(format!(
                    "duplicate access key {:?} in {}",
                    credential.key,
                    path.display()
                )));
            }
            by_key.insert(credential.key.clone(), credential);
        }

        if by_key.is_empty() {
            return Err(ConfigError::Credentials(format!(
                "no credentials found in {}",
                path.display()
            )));
        }
        Ok(Self { by_key })
    }

    /// Look up a credential by access key. Total: a missing key is `None`,
    /// never a failure.
    pub fn for_key(&self, key: &str) -> Option<&Credential> {
        self.by_key.get(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Alphabet for generated credentials. Ambiguous glyphs (0/O, 1/I/l) are
/// left out so keys survive being read over the phone.
const TOKEN_ALPHABET: &[u8] = b"abcdefghjklmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Random token drawn from [`TOKEN_ALPHABET`].
pub fn random_token(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Freshly generated access key and secret, ready to paste into a
/// credentials file. Key is 16 characters, secret 32.
pub fn generate_credentials() -> (String, String) {
    (random_token(16), random_token(32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_creds(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_multi_document() {
        let file = write_creds(
            "---\nname: a@example.com\nkey: KEYA\nsecret: SECA\n\
             ---\nname: b@example.com\nkey: KEYB\nsecret: SECB\n",
        );
        let store = CredentialStore::load(file.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.for_key("KEYA").unwrap().entity, "a@example.com");
        assert_eq!(store.for_key("KEYB").unwrap().secret, "SECB");
        assert!(store.for_key("KEYC").is_none());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let file = write_creds(
            "---\nname: a@example.com\nkey: KEY\nsecret: one\n\
             ---\nname: b@example.com\nkey: KEY\nsecret: two\n",
        );
        let err = CredentialStore::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate access key"));
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = write_creds("");
        assert!(CredentialStore::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        assert!(CredentialStore::load(Path::new("/no/such/file.yaml")).is_err());
    }

    #[test]
    fn test_generated_credentials_shape() {
        let (key, secret) = generate_credentials();
        assert_eq!(key.len(), 16);
        assert_eq!(secret.len(), 32);
        assert!(key.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
        assert!(secret.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
    }
}
