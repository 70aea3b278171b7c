//! Bucket key generation and handling.

use serde::{Deserialize, Serialize};

/// A key that uniquely identifies one client's bucket for one operation.
///
/// The client key (typically `<client-address>.<operation-name>`) is placed
/// under a namespace prefix so that bucket entries cannot collide with other
/// data sharing the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    /// Namespace prefix, e.g. `rate-limit:`
    pub namespace: String,
    /// Caller-supplied key within the namespace
    pub client_key: String,
}

impl BucketKey {
    /// Create a new bucket key from a namespace and a client key.
    pub fn new(namespace: &str, client_key: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            client_key: client_key.to_string(),
        }
    }

    /// The key under which this bucket is stored.
    pub fn to_store_key(&self) -> String {
        format!("{}{}", self.namespace, self.client_key)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.namespace, self.client_key)
    }
}
