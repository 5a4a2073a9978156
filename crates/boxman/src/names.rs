//! Scoped resource names.
//!
//! A network reference inside a cluster is one of:
//!
//! - `name` - a network of the same cluster,
//! - `cluster::name` - a network of a sibling cluster in the same project,
//! - `project::cluster::name` - a network of any project,
//!
//! or a global name (flagged `is_global` in the configuration) that is used
//! verbatim. Global names let VMs attach to host networks that this tool
//! does not manage, such as libvirt's `default` network.

use std::fmt;

use thiserror::Error;

/// Separator between project, cluster and resource name.
pub const SCOPE_SEPARATOR: &str = "::";

/// Separator used when a scoped name is turned into a control-plane name.
const CONTROL_SEPARATOR: char = '_';

/// A reference that cannot be resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    /// More than two `::` separators.
    #[error("reference '{0}' has more than two '::' separators")]
    TooManySegments(String),

    /// One of the segments is empty (e.g. `::net` or `a::::b`).
    #[error("reference '{0}' has an empty segment")]
    EmptySegment(String),
}

/// A fully-qualified resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedName {
    /// Owned by `project::cluster`.
    Scoped {
        project: String,
        cluster: String,
        name: String,
    },
    /// Used as-is, never prefixed.
    Global(String),
}

impl ResolvedName {
    /// The name under which the resource is known to the control plane.
    #[must_use]
    pub fn control_name(&self) -> String {
        match self {
            Self::Scoped {
                project,
                cluster,
                name,
            } => control_name(project, cluster, name),
            Self::Global(raw) => raw.clone(),
        }
    }

    /// Whether this reference escapes project/cluster scoping.
    #[must_use]
    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global(_))
    }

    /// The owning project, if scoped.
    #[must_use]
    pub fn project(&self) -> Option<&str> {
        match self {
            Self::Scoped { project, .. } => Some(project),
            Self::Global(_) => None,
        }
    }
}

impl fmt::Display for ResolvedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scoped {
                project,
                cluster,
                name,
            } => write!(f, "{project}{SCOPE_SEPARATOR}{cluster}{SCOPE_SEPARATOR}{name}"),
            Self::Global(raw) => f.write_str(raw),
        }
    }
}

/// Resolve a raw reference in the scope of `project` and `cluster`.
///
/// # Errors
///
/// Returns [`NameError`] if the reference has more than two separators or
/// an empty segment. Global references are never rejected.
pub fn resolve(
    raw: &str,
    project: &str,
    cluster: &str,
    is_global: bool,
) -> Result<ResolvedName, NameError> {
    if is_global {
        return Ok(ResolvedName::Global(raw.to_string()));
    }

    let segments: Vec<&str> = raw.split(SCOPE_SEPARATOR).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(NameError::EmptySegment(raw.to_string()));
    }

    let (project, cluster, name) = match segments.as_slice() {
        [name] => (project, cluster, *name),
        [cluster, name] => (project, *cluster, *name),
        [project, cluster, name] => (*project, *cluster, *name),
        _ => return Err(NameError::TooManySegments(raw.to_string())),
    };

    Ok(ResolvedName::Scoped {
        project: project.to_string(),
        cluster: cluster.to_string(),
        name: name.to_string(),
    })
}

/// Control-plane name of a resource owned by `project::cluster`.
#[must_use]
pub fn control_name(project: &str, cluster: &str, name: &str) -> String {
    format!("{project}{CONTROL_SEPARATOR}{cluster}{CONTROL_SEPARATOR}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_gets_project_and_cluster() {
        let resolved = resolve("net1", "p", "c", false).unwrap();
        assert_eq!(resolved.to_string(), "p::c::net1");
        assert_eq!(resolved.control_name(), "p_c_net1");
    }

    #[test]
    fn test_cluster_scoped_name_gets_project() {
        let resolved = resolve("c2::net1", "p", "c", false).unwrap();
        assert_eq!(resolved.to_string(), "p::c2::net1");
    }

    #[test]
    fn test_fully_qualified_name_is_kept() {
        let resolved = resolve("p2::c2::net1", "p", "c", false).unwrap();
        assert_eq!(resolved.to_string(), "p2::c2::net1");
        assert_eq!(resolved.project(), Some("p2"));
    }

    #[test]
    fn test_global_name_is_returned_unchanged() {
        let resolved = resolve("default", "p", "c", true).unwrap();
        assert_eq!(resolved, ResolvedName::Global("default".to_string()));
        assert_eq!(resolved.control_name(), "default");

        // Even something that would be invalid when scoped.
        let odd = resolve("a::b::c::d", "p", "c", true).unwrap();
        assert_eq!(odd.to_string(), "a::b::c::d");
    }

    #[test]
    fn test_too_many_separators_rejected() {
        assert_eq!(
            resolve("a::b::c::d", "p", "c", false),
            Err(NameError::TooManySegments("a::b::c::d".to_string()))
        );
    }

    #[test]
    fn test_empty_segment_rejected() {
        assert!(matches!(
            resolve("::net", "p", "c", false),
            Err(NameError::EmptySegment(_))
        ));
        assert!(matches!(
            resolve("", "p", "c", false),
            Err(NameError::EmptySegment(_))
        ));
    }
}
