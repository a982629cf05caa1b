//! Header and trailer metadata.
//!
//! This module provides [`Metadata`], the map of header/trailer names to
//! ordered lists of values exchanged at stream start and stream end.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

/// Metadata received at the start of a call or stream.
pub type Headers = Metadata;

/// Metadata received at the end of a call or stream.
pub type Trailers = Metadata;

/// Ordered, case-insensitive, multi-value metadata map.
///
/// Wraps [`http::HeaderMap`]: names are case-insensitive and the append order
/// of values within a name is preserved. Absence of a name is distinct from a
/// name with an empty value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    headers: HeaderMap,
}

impl Metadata {
    /// Create new metadata from an existing header map.
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// Create empty metadata.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get the first value for a name.
    ///
    /// Returns `None` if the name is not present or the value is not valid UTF-8.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// Get all values for a name, in append order.
    pub fn get_all(&self, key: &str) -> impl Iterator<Item = &str> {
        self.headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
    }

    /// Check if a name exists.
    pub fn contains(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    /// Set a name to a single value, replacing any existing values.
    ///
    /// # Panics
    ///
    /// Panics if the name or value is invalid.
    pub fn insert<K, V>(&mut self, key: K, value: V)
    where
        K: TryInto<HeaderName>,
        K::Error: std::fmt::Debug,
        V: TryInto<HeaderValue>,
        V::Error: std::fmt::Debug,
    {
        let key = key.try_into().expect("invalid header name");
        let value = value.try_into().expect("invalid header value");
        self.headers.insert(key, value);
    }

    /// Append a value to a name, preserving existing values.
    ///
    /// # Panics
    ///
    /// Panics if the name or value is invalid.
    pub fn append<K, V>(&mut self, key: K, value: V)
    where
        K: TryInto<HeaderName>,
        K::Error: std::fmt::Debug,
        V: TryInto<HeaderValue>,
        V::Error: std::fmt::Debug,
    {
        let key = key.try_into().expect("invalid header name");
        let value = value.try_into().expect("invalid header value");
        self.headers.append(key, value);
    }

    /// Remove all values for a name.
    pub fn remove(&mut self, key: &str) {
        self.headers.remove(key);
    }

    /// Get the underlying header map.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the underlying header map.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Consume self and return the underlying header map.
    pub fn into_headers(self) -> HeaderMap {
        self.headers
    }

    /// Iterate over all name/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.headers.iter()
    }

    /// Returns true if there is no metadata.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.headers.len()
    }
}

impl From<HeaderMap> for Metadata {
    fn from(headers: HeaderMap) -> Self {
        Self::new(headers)
    }
}

impl From<Metadata> for HeaderMap {
    fn from(metadata: Metadata) -> Self {
        metadata.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_get() {
        let mut metadata = Metadata::empty();
        metadata.insert("x-custom", "value");

        assert_eq!(metadata.get("x-custom"), Some("value"));
        assert_eq!(metadata.get("missing"), None);
    }

    #[test]
    fn test_metadata_names_are_case_insensitive() {
        let mut metadata = Metadata::empty();
        metadata.insert("X-Custom", "value");

        assert_eq!(metadata.get("x-custom"), Some("value"));
        assert!(metadata.contains("x-CUSTOM"));
    }

    #[test]
    fn test_metadata_append_preserves_order() {
        let mut metadata = Metadata::empty();
        metadata.append("x-multi", "first");
        metadata.append("x-multi", "second");
        metadata.append("x-multi", "third");

        let values: Vec<&str> = metadata.get_all("x-multi").collect();
        assert_eq!(values, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_metadata_insert_replaces() {
        let mut metadata = Metadata::empty();
        metadata.append("x-multi", "first");
        metadata.append("x-multi", "second");
        metadata.insert("x-multi", "only");

        let values: Vec<&str> = metadata.get_all("x-multi").collect();
        assert_eq!(values, vec!["only"]);
    }

    #[test]
    fn test_metadata_absence_distinct_from_empty_value() {
        let mut metadata = Metadata::empty();
        metadata.insert("x-empty", "");

        assert!(metadata.contains("x-empty"));
        assert_eq!(metadata.get("x-empty"), Some(""));
        assert!(!metadata.contains("x-absent"));
        assert_eq!(metadata.get("x-absent"), None);
    }

    #[test]
    fn test_metadata_remove() {
        let mut metadata = Metadata::empty();
        metadata.insert("x-custom", "value");
        metadata.remove("x-custom");

        assert!(!metadata.contains("x-custom"));
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_metadata_equality() {
        let mut a = Metadata::empty();
        a.insert("x-one", "1");
        let mut b = Metadata::empty();
        b.insert("X-One", "1");

        assert_eq!(a, b);

        b.append("x-one", "2");
        assert_ne!(a, b);
    }
}
