//! Cache key definitions.
//!
//! A `CacheKey` is an ordered sequence of primitive segments. Keys are compared
//! structurally, so two keys assembled at different call sites address the
//! same entry whenever their segments match.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One component of a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Int(i64),
    Text(String),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeySegment {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<Uuid> for KeySegment {
    fn from(value: Uuid) -> Self {
        Self::Text(value.to_string())
    }
}

/// Structural address of one cached entity or query result.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CacheKey(Vec<KeySegment>);

impl CacheKey {
    /// Build a key from any sequence of segment-convertible values.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<KeySegment>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// A single-segment key, e.g. `["articles"]`.
    pub fn root(segment: impl Into<KeySegment>) -> Self {
        Self(vec![segment.into()])
    }

    /// Append a segment.
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true when every segment of `self` leads `other`.
    ///
    /// A key is a prefix of itself.
    pub fn is_prefix_of(&self, other: &CacheKey) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            if !first {
                f.write_str("/")?;
            }
            first = false;
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl From<Vec<KeySegment>> for CacheKey {
    fn from(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn structurally_equal_keys_match() {
        let a = CacheKey::new(["like", "a1"]);
        let b = CacheKey::root("like").with(String::from("a1"));
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn segment_types_are_distinct() {
        let text = CacheKey::root("articles").with("2");
        let int = CacheKey::root("articles").with(2);
        assert_ne!(text, int);
    }

    #[test]
    fn prefix_matching() {
        let listing = CacheKey::root("articles");
        let page = CacheKey::root("articles").with("page").with(2);
        let other = CacheKey::root("article").with("a1");

        assert!(listing.is_prefix_of(&listing));
        assert!(listing.is_prefix_of(&page));
        assert!(!page.is_prefix_of(&listing));
        assert!(!listing.is_prefix_of(&other));
    }

    #[test]
    fn display_joins_segments() {
        let key = CacheKey::root("comments").with("a1").with(3);
        assert_eq!(key.to_string(), "comments/a1/3");
        assert_eq!(CacheKey::default().to_string(), "");
    }

    #[test]
    fn serde_uses_plain_arrays() {
        let key = CacheKey::root("articles").with(2);
        let json = serde_json::to_string(&key).expect("serialize key");
        assert_eq!(json, r#"["articles",2]"#);

        let parsed: CacheKey = serde_json::from_str(&json).expect("deserialize key");
        assert_eq!(parsed, key);
    }
}
