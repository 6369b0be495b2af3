use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// Scopes attached to verified tokens. The public-read scope is implicitly
// granted to unauthenticated callers of the public endpoints.
pub const SCOPE_PUBLIC_READ: &str = "registry:read:public";
pub const SCOPE_READ: &str = "registry:read";
pub const SCOPE_WRITE: &str = "registry:write";
pub const SCOPE_ADMIN: &str = "registry:admin";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
pub enum Role {
    Administrator,
    CatalogManager,
    User,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PrincipalKind {
    User,
    Service,
}

/// Authenticated caller, resolved from a verified bearer token.
/// Never persisted; the tenant binding is authoritative for every request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    pub tenant: String,
    pub kind: PrincipalKind,
    #[serde(default)]
    pub roles: HashSet<Role>,
    #[serde(default)]
    pub scopes: HashSet<String>,
    /// Consumer group the principal belongs to, if any. Entitlements can
    /// target it in addition to the principal itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer: Option<String>,
    /// Organization the issuer vouches for; publishes land under this
    /// publisher name and the card's provider must agree with it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

impl Principal {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_administrator(&self) -> bool {
        self.has_role(Role::Administrator)
    }

    /// Publishing requires CatalogManager or above.
    pub fn can_publish(&self) -> bool {
        self.has_role(Role::CatalogManager) || self.has_role(Role::Administrator)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Publisher display name this principal publishes under.
    pub fn publisher_name(&self) -> &str {
        self.organization.as_deref().unwrap_or(&self.id)
    }

    /// Subjects an entitlement may match for this principal.
    pub fn entitlement_subjects(&self) -> Vec<String> {
        let mut subjects = Vec::with_capacity(2 + self.roles.len());
        subjects.push(self.id.clone());
        if let Some(consumer) = &self.consumer {
            subjects.push(consumer.clone());
        }
        for role in &self.roles {
            subjects.push(role.to_string());
        }
        subjects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(roles: &[Role]) -> Principal {
        Principal {
            id: "user-1".to_string(),
            tenant: "tenant-a".to_string(),
            kind: PrincipalKind::User,
            roles: roles.iter().copied().collect(),
            scopes: HashSet::new(),
            consumer: Some("team-search".to_string()),
            organization: Some("Example Kitchen".to_string()),
        }
    }

    #[test]
    fn catalog_manager_can_publish() {
        assert!(principal(&[Role::CatalogManager]).can_publish());
        assert!(principal(&[Role::Administrator]).can_publish());
        assert!(!principal(&[Role::User]).can_publish());
    }

    #[test]
    fn entitlement_subjects_include_consumer_and_roles() {
        let subjects = principal(&[Role::User]).entitlement_subjects();
        assert!(subjects.contains(&"user-1".to_string()));
        assert!(subjects.contains(&"team-search".to_string()));
        assert!(subjects.contains(&"User".to_string()));
    }
}
