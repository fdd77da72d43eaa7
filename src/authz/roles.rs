//! Role implication graph.
//!
//! An implication `a implies b` is an edge `a -> b`: holders of `a` are treated
//! as holders of `b`. The roles relevant to a permission are the roles that
//! grant it directly plus every role that reaches one of them along
//! implication edges, i.e. a reverse-reachability closure.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::authz::errors::AuthzError;
use crate::authz::types::{Permission, Role};

/// Validated, acyclic implication graph over one role set.
#[derive(Debug)]
pub struct RoleGraph<'a> {
    roles: &'a BTreeMap<String, Role>,
    /// implied role -> roles implying it
    implied_by: BTreeMap<&'a str, Vec<&'a str>>,
    /// permission -> roles granting it directly
    granted_by: BTreeMap<&'a Permission, Vec<&'a str>>,
}

impl<'a> RoleGraph<'a> {
    /// Build the graph, rejecting implications of undeclared roles and cycles.
    pub fn new(roles: &'a BTreeMap<String, Role>) -> Result<Self, AuthzError> {
        let mut implied_by: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut granted_by: BTreeMap<&Permission, Vec<&str>> = BTreeMap::new();

        for (name, role) in roles {
            for implied in &role.implies {
                if !roles.contains_key(implied) {
                    return Err(AuthzError::PolicySchema(format!(
                        "role `{name}` implies undeclared role `{implied}`"
                    )));
                }
                implied_by
                    .entry(implied.as_str())
                    .or_default()
                    .push(name.as_str());
            }
            for permission in &role.permissions {
                granted_by.entry(permission).or_default().push(name.as_str());
            }
        }

        check_implication_cycles(roles)?;

        Ok(Self {
            roles,
            implied_by,
            granted_by,
        })
    }

    /// Roles granting `permission` directly or through implication.
    pub fn relevant_roles(&self, permission: &Permission) -> BTreeSet<String> {
        let mut relevant: BTreeSet<&str> = BTreeSet::new();
        let mut frontier: VecDeque<&str> = VecDeque::new();

        if let Some(direct) = self.granted_by.get(permission) {
            for role in direct {
                if relevant.insert(*role) {
                    frontier.push_back(*role);
                }
            }
        }

        while let Some(role) = frontier.pop_front() {
            let Some(implying) = self.implied_by.get(role) else {
                continue;
            };
            for candidate in implying {
                if relevant.insert(*candidate) {
                    frontier.push_back(*candidate);
                }
            }
        }

        relevant.into_iter().map(str::to_string).collect()
    }

    /// Every role `role` implies, transitively, excluding itself.
    pub fn implied_closure(&self, role: &str) -> BTreeSet<String> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut frontier: Vec<&str> = vec![role];

        while let Some(current) = frontier.pop() {
            let Some(def) = self.roles.get(current) else {
                continue;
            };
            for implied in &def.implies {
                if seen.insert(implied.as_str()) {
                    frontier.push(implied.as_str());
                }
            }
        }

        seen.into_iter().map(str::to_string).collect()
    }

    /// Precompute the relevant roles for every permission in `permissions`.
    pub fn permission_index<'p>(
        &self,
        permissions: impl IntoIterator<Item = &'p Permission>,
    ) -> BTreeMap<Permission, BTreeSet<String>> {
        permissions
            .into_iter()
            .map(|p| (p.clone(), self.relevant_roles(p)))
            .collect()
    }
}

/// Check for cycles in role implication using DFS.
fn check_implication_cycles(roles: &BTreeMap<String, Role>) -> Result<(), AuthzError> {
    let mut visited = BTreeSet::new();
    let mut path = Vec::new();

    for name in roles.keys() {
        if !visited.contains(name.as_str()) {
            dfs_cycle_check(name, roles, &mut visited, &mut path)?;
        }
    }
    Ok(())
}

fn dfs_cycle_check<'a>(
    name: &'a str,
    roles: &'a BTreeMap<String, Role>,
    visited: &mut BTreeSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Result<(), AuthzError> {
    visited.insert(name);
    path.push(name);

    if let Some(role) = roles.get(name) {
        for implied in &role.implies {
            if let Some(start) = path.iter().position(|r| *r == implied.as_str()) {
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(implied.as_str());
                return Err(AuthzError::ImplicationCycle(cycle.join(" -> ")));
            }
            if !visited.contains(implied.as_str()) {
                dfs_cycle_check(implied, roles, visited, path)?;
            }
        }
    }

    path.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(name: &str, resource_type: &str, perms: &[(&str, &str)], implies: &[&str]) -> Role {
        Role {
            name: name.into(),
            resource_type: resource_type.into(),
            permissions: perms.iter().map(|(t, a)| Permission::new(*t, *a)).collect(),
            implies: implies.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn roles(list: Vec<Role>) -> BTreeMap<String, Role> {
        list.into_iter().map(|r| (r.name.clone(), r)).collect()
    }

    fn names(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_direct_grant() {
        let roles = roles(vec![
            role("reader", "Repo", &[("Repo", "read")], &[]),
            role("writer", "Repo", &[("Repo", "write")], &[]),
        ]);
        let graph = RoleGraph::new(&roles).unwrap();
        let relevant = graph.relevant_roles(&Permission::new("Repo", "read"));
        assert_eq!(names(&relevant), vec!["reader"]);
    }

    #[test]
    fn test_transitive_implication() {
        let roles = roles(vec![
            role("reader", "Repo", &[("Repo", "read")], &[]),
            role("writer", "Repo", &[("Repo", "write")], &["reader"]),
            role("admin", "Repo", &[], &["writer"]),
            role("owner", "Org", &[("Org", "manage")], &["admin"]),
        ]);
        let graph = RoleGraph::new(&roles).unwrap();

        let read = graph.relevant_roles(&Permission::new("Repo", "read"));
        assert_eq!(names(&read), vec!["admin", "owner", "reader", "writer"]);

        let write = graph.relevant_roles(&Permission::new("Repo", "write"));
        assert_eq!(names(&write), vec!["admin", "owner", "writer"]);

        let manage = graph.relevant_roles(&Permission::new("Org", "manage"));
        assert_eq!(names(&manage), vec!["owner"]);
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let roles = roles(vec![
            role("base", "Repo", &[("Repo", "read")], &[]),
            role("left", "Repo", &[], &["base"]),
            role("right", "Repo", &[], &["base"]),
            role("top", "Repo", &[], &["left", "right"]),
        ]);
        let graph = RoleGraph::new(&roles).unwrap();
        let relevant = graph.relevant_roles(&Permission::new("Repo", "read"));
        assert_eq!(relevant.len(), 4);
    }

    #[test]
    fn test_unknown_permission_resolves_to_nothing() {
        let roles = roles(vec![role("reader", "Repo", &[("Repo", "read")], &[])]);
        let graph = RoleGraph::new(&roles).unwrap();
        assert!(graph
            .relevant_roles(&Permission::new("Repo", "delete"))
            .is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let roles = roles(vec![
            role("a", "Repo", &[("Repo", "read")], &["b"]),
            role("b", "Repo", &[], &["a"]),
        ]);
        let err = RoleGraph::new(&roles).unwrap_err();
        match err {
            AuthzError::ImplicationCycle(path) => assert_eq!(path, "a -> b -> a"),
            other => panic!("expected implication cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_implication_is_a_cycle() {
        let roles = roles(vec![role("a", "Repo", &[("Repo", "read")], &["a"])]);
        let err = RoleGraph::new(&roles).unwrap_err();
        assert!(matches!(err, AuthzError::ImplicationCycle(_)));
    }

    #[test]
    fn test_implying_undeclared_role() {
        let roles = roles(vec![role("a", "Repo", &[("Repo", "read")], &["ghost"])]);
        let err = RoleGraph::new(&roles).unwrap_err();
        assert!(matches!(err, AuthzError::PolicySchema(_)));
    }

    #[test]
    fn test_implication_monotonicity() {
        let roles = roles(vec![
            role("reader", "Repo", &[("Repo", "read")], &[]),
            role("triager", "Repo", &[("Repo", "triage")], &["reader"]),
            role("maintainer", "Repo", &[("Repo", "push")], &["triager"]),
        ]);
        let graph = RoleGraph::new(&roles).unwrap();
        let all_perms: BTreeSet<&Permission> =
            roles.values().flat_map(|r| r.permissions.iter()).collect();

        // Whatever an implied role grants, the implying role is relevant for too.
        for name in roles.keys() {
            for implied in graph.implied_closure(name) {
                for perm in &all_perms {
                    let relevant = graph.relevant_roles(perm);
                    if relevant.contains(&implied) {
                        assert!(relevant.contains(name), "{name} should be relevant for {perm}");
                    }
                }
            }
        }
        assert_eq!(
            names(&graph.implied_closure("maintainer")),
            vec!["reader", "triager"]
        );
    }

    #[test]
    fn test_permission_index() {
        let roles = roles(vec![
            role("reader", "Repo", &[("Repo", "read")], &[]),
            role("owner", "Org", &[("Repo", "read")], &[]),
        ]);
        let graph = RoleGraph::new(&roles).unwrap();
        let perms = [Permission::new("Repo", "read"), Permission::new("Org", "read")];
        let index = graph.permission_index(perms.iter());
        assert_eq!(
            names(&index[&Permission::new("Repo", "read")]),
            vec!["owner", "reader"]
        );
        assert!(index[&Permission::new("Org", "read")].is_empty());
    }
}
