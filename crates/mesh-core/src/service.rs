//! Mesh service naming.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A namespaced service participating in the mesh.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshService {
    /// Service namespace.
    pub namespace: String,
    /// Service name.
    pub name: String,
}

impl MeshService {
    /// Create a mesh service reference.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MeshService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_namespace_slash_name() {
        let svc = MeshService::new("bookstore", "bookstore-v1");
        assert_eq!(svc.to_string(), "bookstore/bookstore-v1");
    }
}
