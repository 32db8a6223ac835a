//! Proxy identity derived from certificate common names.
//!
//! Workload certificates carry a common name of the form
//! `<service-account>.<namespace>.<trust-domain>`; the first two
//! dot-separated components identify the workload.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MeshError;

/// Separator between common-name components.
const DOMAIN_DELIMITER: char = '.';

/// An X.509 certificate common name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommonName(String);

impl CommonName {
    /// Wrap a common-name string.
    #[must_use]
    pub fn new(cn: impl Into<String>) -> Self {
        Self(cn.into())
    }

    /// The common name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the workload identity encoded in this common name.
    ///
    /// Fails unless the name has at least three dot-separated components.
    pub fn identity(&self) -> Result<ServiceIdentity, MeshError> {
        let mut chunks = self.0.split(DOMAIN_DELIMITER);
        match (chunks.next(), chunks.next(), chunks.next()) {
            (Some(account), Some(namespace), Some(_trust_domain))
                if !account.is_empty() && !namespace.is_empty() =>
            {
                Ok(ServiceIdentity {
                    service_account: account.to_string(),
                    namespace: namespace.to_string(),
                })
            }
            _ => Err(MeshError::InvalidCertificateCommonName {
                common_name: self.0.clone(),
            }),
        }
    }
}

impl fmt::Display for CommonName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommonName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CommonName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A certificate serial number, opaque to the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SerialNumber(String);

impl SerialNumber {
    /// Wrap a serial-number string.
    #[must_use]
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    /// The serial number as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SerialNumber {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A workload identity: service account plus namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Kubernetes service-account name.
    pub service_account: String,
    /// Namespace the service account lives in.
    pub namespace: String,
}

impl ServiceIdentity {
    /// Create an identity from its components.
    #[must_use]
    pub fn new(service_account: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            service_account: service_account.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.service_account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_from_common_name() {
        let cn = CommonName::from("bookstore-sa.bookstore.cluster.local");
        let id = cn.identity().unwrap();
        assert_eq!(id, ServiceIdentity::new("bookstore-sa", "bookstore"));
    }

    #[test]
    fn identity_requires_three_components() {
        let cn = CommonName::from("bookstore-sa.bookstore");
        assert!(matches!(
            cn.identity(),
            Err(MeshError::InvalidCertificateCommonName { .. })
        ));
    }

    #[test]
    fn identity_rejects_empty_components() {
        let cn = CommonName::from(".bookstore.cluster.local");
        assert!(cn.identity().is_err());
    }

    #[test]
    fn identity_display() {
        let id = ServiceIdentity::new("default", "bookbuyer");
        assert_eq!(id.to_string(), "bookbuyer/default");
    }
}
