//! Workload identities and per-restart outcomes

use std::fmt;

use thiserror::Error;

/// Kind of restartable workload
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Deployment,
    StatefulSet,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceRefError {
    #[error("Malformed {kind} entry {entry:?}, expected namespace/name")]
    Malformed { kind: ResourceKind, entry: String },
}

/// Identifies one workload in the cluster
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a static `namespace/name` entry.
    ///
    /// Exactly two non-empty components are required; anything else is rejected.
    pub fn parse(kind: ResourceKind, entry: &str) -> Result<Self, ResourceRefError> {
        let malformed = || ResourceRefError::Malformed {
            kind,
            entry: entry.to_string(),
        };

        let mut parts = entry.trim().split('/');
        let (Some(namespace), Some(name), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };

        if namespace.is_empty() || name.is_empty() {
            return Err(malformed());
        }

        Ok(Self::new(kind, namespace, name))
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartStatus {
    Success,
    NotFound,
    Failed,
}

/// Result of restarting a single workload; only ever logged
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartOutcome {
    pub target: ResourceRef,
    pub status: RestartStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_entry() {
        let parsed = ResourceRef::parse(ResourceKind::Deployment, "prod/api").unwrap();
        assert_eq!(parsed, ResourceRef::new(ResourceKind::Deployment, "prod", "api"));
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let parsed = ResourceRef::parse(ResourceKind::StatefulSet, " prod/worker ").unwrap();
        assert_eq!(parsed.namespace, "prod");
        assert_eq!(parsed.name, "worker");
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        let err = ResourceRef::parse(ResourceKind::Deployment, "badentry").unwrap_err();
        assert!(err.to_string().contains("badentry"));
    }

    #[test]
    fn test_parse_rejects_empty_components() {
        assert!(ResourceRef::parse(ResourceKind::Deployment, "/api").is_err());
        assert!(ResourceRef::parse(ResourceKind::Deployment, "prod/").is_err());
        assert!(ResourceRef::parse(ResourceKind::Deployment, "").is_err());
    }

    #[test]
    fn test_parse_rejects_extra_components() {
        assert!(ResourceRef::parse(ResourceKind::Deployment, "prod/api/extra").is_err());
    }

    #[test]
    fn test_equality_includes_kind() {
        let deployment = ResourceRef::new(ResourceKind::Deployment, "prod", "api");
        let statefulset = ResourceRef::new(ResourceKind::StatefulSet, "prod", "api");
        assert_ne!(deployment, statefulset);
    }

    #[test]
    fn test_display() {
        let r = ResourceRef::new(ResourceKind::StatefulSet, "prod", "worker");
        assert_eq!(r.to_string(), "StatefulSet prod/worker");
    }
}
