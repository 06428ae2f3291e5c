//! Mapping between logical keys and object keys.

/// Suffix appended to an object key to name its lock record.
pub const LOCK_SUFFIX: &str = ".lock";

/// Maps host keys onto object keys under a fixed prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyNamer {
    prefix: String,
}

impl KeyNamer {
    /// Create a namer for the given prefix.
    ///
    /// Trailing slashes are dropped so `"acme"` and `"acme/"` behave alike.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        Self { prefix }
    }

    /// The normalized prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Object key holding the data for `key`.
    pub fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    /// Object key holding the lock record for `key`.
    pub fn lock_key(&self, key: &str) -> String {
        let mut name = self.object_key(key);
        name.push_str(LOCK_SUFFIX);
        name
    }

    /// Logical key for an object key, or `None` if it lies outside the prefix.
    pub fn logical_key<'a>(&self, object_key: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            return Some(object_key);
        }
        object_key
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}
