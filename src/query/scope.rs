//! Non-overridable scope predicate.

use crate::types::{ScopeType, TenantRef};

/// A bound SQL predicate fragment plus its positional parameters. Always
/// the first `WHERE` clause appended to a query, ahead of time bounds and
/// the user filter.
#[derive(Clone)]
pub struct ScopePredicate {
    pub clause: &'static str,
    pub params: Vec<String>,
}

pub fn scope_predicate(tenant: &TenantRef) -> ScopePredicate {
    match tenant.scope_type {
        ScopeType::Platform => ScopePredicate {
            clause: "1=1",
            params: vec![],
        },
        ScopeType::Organization => ScopePredicate {
            clause: "scope_type = 'Organization' AND scope_name = ?",
            params: vec![tenant.name.clone()],
        },
        ScopeType::Project => ScopePredicate {
            clause: "scope_type = 'Project' AND scope_name = ?",
            params: vec![tenant.name.clone()],
        },
        ScopeType::User => ScopePredicate {
            clause: "user_uid = ?",
            params: vec![tenant.name.clone()],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_scope_has_no_predicate() {
        let p = scope_predicate(&TenantRef::platform());
        assert_eq!(p.clause, "1=1");
        assert!(p.params.is_empty());
    }

    #[test]
    fn project_scope_binds_name() {
        let tenant = TenantRef {
            scope_type: ScopeType::Project,
            name: "proj-1".into(),
        };
        let p = scope_predicate(&tenant);
        assert!(p.clause.contains("scope_type = 'Project'"));
        assert_eq!(p.params, vec!["proj-1".to_string()]);
    }

    #[test]
    fn user_scope_binds_uid_predicate() {
        let tenant = TenantRef {
            scope_type: ScopeType::User,
            name: "uid-123".into(),
        };
        let p = scope_predicate(&tenant);
        assert_eq!(p.clause, "user_uid = ?");
        assert_eq!(p.params, vec!["uid-123".to_string()]);
    }
}
