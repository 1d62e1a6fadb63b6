//! Canonical actor identifiers: `"<namespace>.<serviceName>.<apiVersion>"`.

use std::fmt;

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_API_VERSION: &str = "v1";

/// Canonical, already-validated actor identifier. Only ever constructed
/// through [`ActorId::new`], which applies the namespace/version defaults.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(String);

impl ActorId {
    /// Builds the canonical id, defaulting an empty `namespace` to
    /// `"default"` and an empty `api_version` to `"v1"`. `service_name` must
    /// be non-empty; callers are expected to have already validated this at
    /// the [`crate::schema::ServicePackage`] boundary.
    #[must_use]
    pub fn new(namespace: &str, service_name: &str, api_version: &str) -> Self {
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            namespace
        };
        let api_version = if api_version.is_empty() {
            DEFAULT_API_VERSION
        } else {
            api_version
        };
        Self(format!("{namespace}.{service_name}.{api_version}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ActorId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_specified() {
        let id = ActorId::new("prod", "MyService", "v2");
        assert_eq!(id.as_str(), "prod.MyService.v2");
    }

    #[test]
    fn defaults_namespace() {
        let id = ActorId::new("", "MyService", "v2");
        assert_eq!(id.as_str(), "default.MyService.v2");
    }

    #[test]
    fn defaults_api_version() {
        let id = ActorId::new("prod", "MyService", "");
        assert_eq!(id.as_str(), "prod.MyService.v1");
    }

    #[test]
    fn defaults_both() {
        let id = ActorId::new("", "MyService", "");
        assert_eq!(id.as_str(), "default.MyService.v1");
    }
}
