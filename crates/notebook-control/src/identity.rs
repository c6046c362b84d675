use std::collections::BTreeSet;

use async_trait::async_trait;
use notebook_core::is_safe_name;
use thiserror::Error;

/// Separator between project and caller in project-scoped system user names.
pub const USER_SEPARATOR: &str = "__";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("caller identity missing")]
    Missing,

    #[error("invalid identity: {0}")]
    Invalid(String),

    #[error("caller {caller} may not use notebooks in project {project}")]
    NotAllowed { project: String, caller: String },
}

/// Maps an authenticated caller to the system user its notebook server runs as.
///
/// Consumed by the HTTP boundary only; the controller works with resolved owners.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_system_user(&self, project: &str, caller: &str)
    -> Result<String, IdentityError>;
}

/// Resolves `caller` in `project` to `<project>__<caller>`, optionally
/// restricted to an allowlist of callers.
#[derive(Debug, Clone, Default)]
pub struct ProjectUserResolver {
    allowed: Option<BTreeSet<String>>,
}

impl ProjectUserResolver {
    pub fn new(allowed: Option<BTreeSet<String>>) -> Self {
        Self { allowed }
    }
}

#[async_trait]
impl IdentityResolver for ProjectUserResolver {
    async fn resolve_system_user(
        &self,
        project: &str,
        caller: &str,
    ) -> Result<String, IdentityError> {
        let caller = caller.trim();
        if caller.is_empty() {
            return Err(IdentityError::Missing);
        }
        if !is_safe_name(project) {
            return Err(IdentityError::Invalid(format!("project {project:?}")));
        }
        if !is_safe_name(caller) || caller.contains(USER_SEPARATOR) {
            return Err(IdentityError::Invalid(format!("caller {caller:?}")));
        }
        if let Some(allowed) = &self.allowed
            && !allowed.contains(caller)
        {
            return Err(IdentityError::NotAllowed {
                project: project.to_string(),
                caller: caller.to_string(),
            });
        }
        Ok(format!("{project}{USER_SEPARATOR}{caller}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_project_scoped_name() {
        let r = ProjectUserResolver::default();
        assert_eq!(r.resolve_system_user("p1", " alice ").await.unwrap(), "p1__alice");
    }

    #[tokio::test]
    async fn rejects_missing_and_malformed_callers() {
        let r = ProjectUserResolver::default();
        assert!(matches!(
            r.resolve_system_user("p1", "  ").await,
            Err(IdentityError::Missing)
        ));
        assert!(matches!(
            r.resolve_system_user("p1", "a__b").await,
            Err(IdentityError::Invalid(_))
        ));
        assert!(matches!(
            r.resolve_system_user("../p", "alice").await,
            Err(IdentityError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn allowlist_is_enforced() {
        let r = ProjectUserResolver::new(Some(BTreeSet::from(["alice".to_string()])));
        assert!(r.resolve_system_user("p1", "alice").await.is_ok());
        assert!(matches!(
            r.resolve_system_user("p1", "mallory").await,
            Err(IdentityError::NotAllowed { .. })
        ));
    }
}
