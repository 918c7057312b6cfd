//! Access policy.
//!
//! A policy maps rule names such as `project:raise` to a list of grants.
//! A grant applies if the caller holds one of its roles, the caller's
//! credentials are scoped to the target domain or project when the grant
//! demands it, and the target service is listed (if the grant lists any).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

use limes_core::error::ConfigError;
use limes_core::names::{ResourceName, ServiceType};
use limes_core::updater::quota::QuotaPermissions;
use limes_core::updater::rates::RateLimitPermissions;

use crate::error::ApiError;
use crate::middleware::Identity;

const DEFAULT_POLICY: &str = r"
rules:
  cluster:show:
    - roles: [cloud_admin, cloud_viewer]
  cluster:show_subcapacity:
    - roles: [cloud_admin]
  cluster:show_errors:
    - roles: [cloud_admin, cloud_viewer]
  domain:list:
    - roles: [cloud_admin, cloud_viewer]
  domain:show:
    - roles: [cloud_admin, cloud_viewer]
    - roles: [admin, viewer]
      scope: domain
  domain:raise:
    - roles: [cloud_admin]
  domain:raise_lowpriv:
    - roles: [cloud_admin]
  domain:lower:
    - roles: [cloud_admin]
  domain:lower_lowpriv:
    - roles: [cloud_admin]
  project:list:
    - roles: [cloud_admin, cloud_viewer]
    - roles: [admin, viewer]
      scope: domain
  project:show:
    - roles: [cloud_admin, cloud_viewer]
    - roles: [admin, viewer]
      scope: domain
    - roles: [admin, member, viewer]
      scope: project
  project:raise:
    - roles: [cloud_admin]
    - roles: [admin]
      scope: domain
  project:raise_lowpriv:
    - roles: [admin]
      scope: project
  project:lower:
    - roles: [cloud_admin]
    - roles: [admin]
      scope: domain
  project:lower_lowpriv:
    - roles: [admin]
      scope: project
  project:set_rate_limit:
    - roles: [cloud_admin]
";

/// Where the caller's credentials must point for a grant to apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeCondition {
    #[default]
    Any,
    Domain,
    Project,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Grant {
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub scope: ScopeCondition,
    /// API service types; empty means all.
    #[serde(default)]
    pub services: BTreeSet<ServiceType>,
}

/// The object an operation acts on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Target<'a> {
    pub domain_uuid: Option<&'a str>,
    pub project_uuid: Option<&'a str>,
    pub service_type: Option<&'a ServiceType>,
}

impl<'a> Target<'a> {
    #[must_use]
    pub fn cluster() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn domain(domain_uuid: &'a str) -> Self {
        Self {
            domain_uuid: Some(domain_uuid),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn project(domain_uuid: &'a str, project_uuid: &'a str) -> Self {
        Self {
            domain_uuid: Some(domain_uuid),
            project_uuid: Some(project_uuid),
            service_type: None,
        }
    }

    #[must_use]
    pub fn with_service(mut self, service_type: &'a ServiceType) -> Self {
        self.service_type = Some(service_type);
        self
    }
}

impl Grant {
    fn applies(&self, identity: &Identity, target: Target<'_>) -> bool {
        if !self.roles.iter().any(|role| identity.has_role(role)) {
            return false;
        }
        let scope_ok = match self.scope {
            ScopeCondition::Any => true,
            ScopeCondition::Domain => {
                target.domain_uuid.is_some() && identity.domain_id.as_deref() == target.domain_uuid
            }
            ScopeCondition::Project => {
                target.project_uuid.is_some() && identity.project_id.as_deref() == target.project_uuid
            }
        };
        let service_ok = self.services.is_empty() || target.service_type.is_some_and(|s| self.services.contains(s));
        scope_ok && service_ok
    }
}

/// Rule names mapped to grants. Unknown rules deny.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    rules: BTreeMap<String, Vec<Grant>>,
}

impl Policy {
    /// Parses a policy document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is malformed.
    pub fn from_yaml(source_name: &str, yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: source_name.to_owned(),
            reason: e.to_string(),
        })
    }

    /// The built-in policy.
    ///
    /// # Errors
    ///
    /// Only fails if the embedded document is broken.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml("built-in policy", DEFAULT_POLICY)
    }

    /// Reads a policy file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::from_yaml(&path.display().to_string(), &yaml)
    }

    #[must_use]
    pub fn check(&self, rule: &str, identity: &Identity, target: Target<'_>) -> bool {
        self.rules
            .get(rule)
            .is_some_and(|grants| grants.iter().any(|g| g.applies(identity, target)))
    }

    /// Like [`Self::check`], but fails with 403.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Forbidden`] if the rule does not grant access.
    pub fn require(&self, rule: &str, identity: &Identity, target: Target<'_>) -> Result<(), ApiError> {
        if self.check(rule, identity, target) {
            Ok(())
        } else {
            tracing::debug!(rule, user = %identity.user_id, "policy check failed");
            Err(ApiError::Forbidden(format!("not allowed: {rule}")))
        }
    }

    /// Quota permissions of `identity` within `target`, evaluated per
    /// service with the `<scope>:raise`-style rules.
    #[must_use]
    pub fn quota_permissions<'a>(
        &'a self,
        identity: &'a Identity,
        scope: &'static str,
        target: Target<'a>,
    ) -> PolicyPermissions<'a> {
        PolicyPermissions {
            policy: self,
            identity,
            scope,
            target,
        }
    }
}

/// Quota and rate-limit permissions backed by a [`Policy`].
#[derive(Debug, Clone, Copy)]
pub struct PolicyPermissions<'a> {
    policy: &'a Policy,
    identity: &'a Identity,
    scope: &'static str,
    target: Target<'a>,
}

impl PolicyPermissions<'_> {
    fn check(&self, action: &str, service_type: &ServiceType) -> bool {
        let rule = format!("{}:{action}", self.scope);
        self.policy
            .check(&rule, self.identity, self.target.with_service(service_type))
    }
}

impl QuotaPermissions for PolicyPermissions<'_> {
    fn can_raise(&self, service_type: &ServiceType, _: &ResourceName) -> bool {
        self.check("raise", service_type)
    }
    fn can_raise_lowpriv(&self, service_type: &ServiceType, _: &ResourceName) -> bool {
        self.check("raise_lowpriv", service_type)
    }
    fn can_lower(&self, service_type: &ServiceType, _: &ResourceName) -> bool {
        self.check("lower", service_type)
    }
    fn can_lower_lowpriv(&self, service_type: &ServiceType, _: &ResourceName) -> bool {
        self.check("lower_lowpriv", service_type)
    }
}

impl RateLimitPermissions for PolicyPermissions<'_> {
    fn can_set_rate_limit(&self, service_type: &ServiceType) -> bool {
        self.check("set_rate_limit", service_type)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn identity(roles: &[&str], domain: Option<&str>, project: Option<&str>) -> Identity {
        Identity {
            user_id: "uid".to_owned(),
            user_name: "user".to_owned(),
            roles: roles.iter().map(|r| (*r).to_owned()).collect(),
            domain_id: domain.map(str::to_owned),
            project_id: project.map(str::to_owned),
            ..Identity::default()
        }
    }

    #[test]
    fn builtin_policy_parses() {
        let policy = Policy::builtin().unwrap();
        let admin = identity(&["cloud_admin"], None, None);
        assert!(policy.check("cluster:show", &admin, Target::cluster()));
        assert!(!policy.check("no:such_rule", &admin, Target::cluster()));
    }

    #[test]
    fn scope_conditions_must_match_the_target() {
        let policy = Policy::builtin().unwrap();
        let domain_admin = identity(&["admin"], Some("uuid-germany"), None);
        assert!(policy.check("domain:show", &domain_admin, Target::domain("uuid-germany")));
        assert!(!policy.check("domain:show", &domain_admin, Target::domain("uuid-france")));
        assert!(!policy.check("domain:list", &domain_admin, Target::cluster()));

        let member = identity(&["member"], None, Some("uuid-berlin"));
        let berlin = Target::project("uuid-germany", "uuid-berlin");
        assert!(policy.check("project:show", &member, berlin));
        assert!(!policy.check("project:show", &member, Target::project("uuid-germany", "uuid-dresden")));
        assert!(!policy.check("project:raise", &member, berlin));
    }

    #[test]
    fn quota_permissions_split_by_privilege() {
        let policy = Policy::builtin().unwrap();
        let project_admin = identity(&["admin"], None, Some("uuid-berlin"));
        let perms = policy.quota_permissions(&project_admin, "project", Target::project("uuid-germany", "uuid-berlin"));
        let svc = ServiceType::new("shared");
        let res = ResourceName::new("things");
        assert!(!perms.can_raise(&svc, &res));
        assert!(perms.can_raise_lowpriv(&svc, &res));
        assert!(!perms.can_lower(&svc, &res));
        assert!(perms.can_lower_lowpriv(&svc, &res));
        assert!(!perms.can_set_rate_limit(&svc));
    }

    #[test]
    fn grants_can_be_limited_to_services() {
        let policy = Policy::from_yaml(
            "test",
            r"
rules:
  project:raise:
    - roles: [shared_admin]
      services: [shared]
",
        )
        .unwrap();
        let user = identity(&["shared_admin"], None, None);
        let perms = policy.quota_permissions(&user, "project", Target::project("d", "p"));
        let res = ResourceName::new("things");
        assert!(perms.can_raise(&ServiceType::new("shared"), &res));
        assert!(!perms.can_raise(&ServiceType::new("unshared"), &res));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Policy::from_yaml("test", "rules: {}\nextra: 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
