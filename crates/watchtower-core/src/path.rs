//! Slash-separated config paths.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Suffix appended to a secret's leaf name for its ciphertext sibling.
pub const CIPHER_SUFFIX: &str = "_SEC";

/// Suffix appended to a secret's leaf name for its IV sibling.
pub const IV_SUFFIX: &str = "_SEC_IV";

/// A validated config path such as `/icmp-ka/services`.
///
/// A path must start with `/` and must not end with `/`. Empty interior
/// segments (`/a//b`) are kept as empty keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigPath {
    raw: String,
    transit: Vec<String>,
    leaf: String,
}

impl ConfigPath {
    /// Parse and validate `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PathFormat`] if `raw` does not start with `/`,
    /// ends with `/`, or is just `/`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let malformed = || ConfigError::PathFormat {
            path: raw.to_owned(),
        };

        let rest = raw.strip_prefix('/').ok_or_else(malformed)?;
        let mut segments: Vec<String> = rest.split('/').map(str::to_owned).collect();
        let leaf = segments.pop().filter(|s| !s.is_empty()).ok_or_else(malformed)?;

        Ok(Self {
            raw: raw.to_owned(),
            transit: segments,
            leaf,
        })
    }

    /// The segments that must be walked to reach the leaf's parent.
    #[must_use]
    pub fn transit(&self) -> &[String] {
        &self.transit
    }

    /// The final segment.
    #[must_use]
    pub fn leaf(&self) -> &str {
        &self.leaf
    }

    /// Key of the ciphertext sibling for a secret at this path.
    #[must_use]
    pub fn cipher_leaf(&self) -> String {
        format!("{}{CIPHER_SUFFIX}", self.leaf)
    }

    /// Key of the IV sibling for a secret at this path.
    #[must_use]
    pub fn iv_leaf(&self) -> String {
        format!("{}{IV_SUFFIX}", self.leaf)
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ConfigPath {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_path() {
        let path = ConfigPath::parse("/icmp-ka/services").unwrap();
        assert_eq!(path.transit(), ["icmp-ka".to_owned()]);
        assert_eq!(path.leaf(), "services");
        assert_eq!(path.to_string(), "/icmp-ka/services");
    }

    #[test]
    fn single_segment_has_no_transit() {
        let path = ConfigPath::parse("/version").unwrap();
        assert!(path.transit().is_empty());
        assert_eq!(path.leaf(), "version");
    }

    #[test]
    fn empty_interior_segments_are_kept() {
        let path = ConfigPath::parse("/a//b").unwrap();
        assert_eq!(path.transit(), ["a".to_owned(), String::new()]);
        assert_eq!(path.leaf(), "b");
    }

    #[test]
    fn malformed_paths_are_rejected() {
        for raw in ["", "/", "a/b", "/a/", "//", "relative"] {
            let result = ConfigPath::parse(raw);
            assert!(
                matches!(result, Err(ConfigError::PathFormat { .. })),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn secret_sibling_names() {
        let path = ConfigPath::parse("/smtp/password").unwrap();
        assert_eq!(path.cipher_leaf(), "password_SEC");
        assert_eq!(path.iv_leaf(), "password_SEC_IV");
    }
}
