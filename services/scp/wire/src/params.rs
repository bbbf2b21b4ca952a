//! Ordered key/value maps used for RFI parameters and Signal tags.

use crate::error::WireError;
use indexmap::IndexMap;
use std::fmt;

/// Client identity, sent on SUBSCRIBE
pub const CID: &str = "CID";
/// Server identity, stamped on every server-originated RFI
pub const SID: &str = "SID";
/// Outcome of a reply/conductor call
pub const STATUS: &str = "STATUS";
/// `STATUS` value for a successful call
pub const STATUS_OK: &str = "OK";
/// `STATUS` value for a failed call
pub const STATUS_ERROR: &str = "ERROR";

/// Insertion-ordered string map.
///
/// Encodes as `KEY=VALUE&KEY2=VALUE2`. Parsing keeps the position of the first
/// occurrence of a key while later occurrences overwrite its value.
///
/// Keys must be non-empty and free of `&` and `=`; values must be free of `&`.
/// Anything else survives the text form unchanged. Maps holding other entries
/// can be built but are refused by [`Parameters::validate`] and therefore by
/// frame encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    entries: IndexMap<String, String>,
}

impl Parameters {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Insert or overwrite a value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Builder-style [`Parameters::set`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Remove a key, keeping the order of the remaining entries
    pub fn delete(&mut self, key: &str) -> Option<String> {
        self.entries.shift_remove(key)
    }

    /// Whether the key is present
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Values in insertion order
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(String::as_str)
    }

    /// Entries in insertion order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that one entry survives the text form
    pub fn validate_entry(key: &str, value: &str) -> Result<(), WireError> {
        if key.is_empty() {
            return Err(WireError::Reserved("empty key".to_string()));
        }
        if key.contains(['&', '=']) {
            return Err(WireError::Reserved(format!("key {:?}", key)));
        }
        if value.contains('&') {
            return Err(WireError::Reserved(format!("value {:?} of {}", value, key)));
        }
        Ok(())
    }

    /// Check every entry with [`Parameters::validate_entry`]
    pub fn validate(&self) -> Result<(), WireError> {
        self.entries()
            .try_for_each(|(key, value)| Self::validate_entry(key, value))
    }

    /// Parse `KEY=VALUE&...`; `None` when an entry is malformed
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let mut params = Self::new();
        if text.is_empty() {
            return Some(params);
        }
        for entry in text.split('&') {
            let (key, value) = entry.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            params.set(key, value);
        }
        Some(params)
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (key, value) in iter {
            params.set(key, value);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_operations() {
        let mut params = Parameters::new();
        params.set("b", "2").set("a", "1").set("c", "3");
        assert_eq!(params.keys().collect::<Vec<_>>(), vec!["b", "a", "c"]);

        params.set("b", "20");
        assert_eq!(params.get("b"), Some("20"));
        assert_eq!(params.values().collect::<Vec<_>>(), vec!["20", "1", "3"]);

        assert_eq!(params.delete("a"), Some("1".to_string()));
        assert!(!params.has("a"));
        assert_eq!(params.len(), 2);
        assert_eq!(params.to_string(), "b=20&c=3");
    }

    #[test]
    fn test_parse_duplicates_overwrite() {
        let params = Parameters::parse("x=1&y=2&x=3").unwrap();
        assert_eq!(params.entries().collect::<Vec<_>>(), vec![("x", "3"), ("y", "2")]);
    }

    #[test]
    fn test_validate_entries() {
        assert!(Parameters::validate_entry("CID", "shop:eu#1%=x").is_ok());
        assert!(Parameters::validate_entry("CID", "").is_ok());
        assert!(matches!(
            Parameters::validate_entry("CID", "shop&eu"),
            Err(WireError::Reserved(_))
        ));
        assert!(Parameters::validate_entry("a=b", "1").is_err());
        assert!(Parameters::validate_entry("a&b", "1").is_err());
        assert!(Parameters::validate_entry("", "1").is_err());

        assert!(Parameters::new().with("k", "a=b").validate().is_ok());
        assert!(Parameters::new().with("k", "1").with("j", "x&y").validate().is_err());
    }

    #[test]
    fn test_parse_malformed() {
        assert!(Parameters::parse("novalue").is_none());
        assert!(Parameters::parse("a=1&&b=2").is_none());
        assert!(Parameters::parse("=1").is_none());
        assert!(Parameters::parse("").unwrap().is_empty());
        assert_eq!(Parameters::parse("k=").unwrap().get("k"), Some(""));
    }
}
