// ============================================================================
// spark-reactive - Query Keys
// Canonical string encoding of structured cache keys
// ============================================================================
//
// Keys go through `serde_json::Value` before being printed. Object maps in
// `Value` are ordered, so two keys that differ only in map insertion order
// encode to the same string.
// ============================================================================

use std::fmt;

use serde::Serialize;

use crate::core::error::ReactiveError;

/// An encoded cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
    /// Encode any serializable key.
    ///
    /// ```
    /// use spark_reactive::query::QueryKey;
    ///
    /// let key = QueryKey::encode(&("user", 42)).unwrap();
    /// assert_eq!(key.as_str(), r#"["user",42]"#);
    /// ```
    pub fn encode<K: Serialize + ?Sized>(key: &K) -> Result<Self, ReactiveError> {
        let value =
            serde_json::to_value(key).map_err(|e| ReactiveError::KeyEncoding(e.to_string()))?;
        Ok(QueryKey(value.to_string()))
    }

    /// Wrap an already-encoded string as-is.
    pub fn raw(encoded: impl Into<String>) -> Self {
        QueryKey(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueryKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use std::collections::HashMap;

    #[test]
    fn map_order_does_not_matter() {
        let mut a = HashMap::new();
        a.insert("page", 1);
        a.insert("limit", 20);
        a.insert("offset", 0);

        let mut b = HashMap::new();
        b.insert("offset", 0);
        b.insert("limit", 20);
        b.insert("page", 1);

        let ka = QueryKey::encode(&a).unwrap();
        let kb = QueryKey::encode(&b).unwrap();
        assert_eq!(ka, kb);
        assert_eq!(ka.as_str(), r#"{"limit":20,"offset":0,"page":1}"#);
    }

    #[test]
    fn structs_and_tuples_encode() {
        #[derive(Serialize)]
        struct Todos<'a> {
            owner: &'a str,
            done: bool,
        }

        let key = QueryKey::encode(&("todos", Todos { owner: "ada", done: false })).unwrap();
        assert_eq!(key.to_string(), r#"["todos",{"done":false,"owner":"ada"}]"#);
        assert_ne!(key, QueryKey::encode(&("todos", 1)).unwrap());
    }

    #[test]
    fn unserializable_key_is_an_error() {
        struct Broken;

        impl Serialize for Broken {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(S::Error::custom("no encoding"))
            }
        }

        let err = QueryKey::encode(&Broken).unwrap_err();
        assert!(matches!(err, ReactiveError::KeyEncoding(ref m) if m.contains("no encoding")));
    }
}
