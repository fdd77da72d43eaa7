use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::authz::errors::AuthzError;
use crate::authz::policy::parse_kdl_document;
use crate::authz::query::{AncestorWalk, BulkFilter, FilterTarget, PointCheck};
use crate::authz::roles::RoleGraph;
use crate::authz::types::*;
use crate::authz::PolicySnapshot;

/// Supplies the fact tuples for one compilation pass.
pub trait FactSource: Send + Sync {
    fn load_facts(&self) -> Result<PolicyFacts, AuthzError>;
}

/// Facts held in memory, e.g. produced by an embedding application.
impl FactSource for PolicyFacts {
    fn load_facts(&self) -> Result<PolicyFacts, AuthzError> {
        Ok(self.clone())
    }
}

/// Reads every `.kdl` file in a directory.
#[derive(Debug, Clone)]
pub struct KdlDirectory {
    dir: PathBuf,
}

impl KdlDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FactSource for KdlDirectory {
    fn load_facts(&self) -> Result<PolicyFacts, AuthzError> {
        load_policies(&self.dir)
    }
}

/// Load all `.kdl` policy files from the given directory, in path order, and
/// merge their facts.
pub fn load_policies(dir: &Path) -> Result<PolicyFacts, AuthzError> {
    if !dir.is_dir() {
        return Err(AuthzError::PolicySchema(format!(
            "policies directory `{}` does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut facts = PolicyFacts::default();
    let mut file_count = 0;

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AuthzError::PolicyLoadError {
                path: path.display().to_string(),
                source,
            })?;
        facts.extend(parse_kdl_document(&contents)?);
        file_count += 1;
    }

    tracing::debug!(
        files = file_count,
        resources = facts.resources.len(),
        relationships = facts.relationships.len(),
        "Read policy facts"
    );

    Ok(facts)
}

/// Turn fact tuples into a validated policy model.
pub fn build_model(facts: PolicyFacts) -> Result<PolicyModel, AuthzError> {
    let mut resources: BTreeMap<String, ResourceType> = BTreeMap::new();
    // Types whose actions were listed explicitly; permissions on them must name a declared action.
    let mut constrained: HashSet<String> = HashSet::new();
    let mut role_defs: Vec<(String, RoleDefinition)> = Vec::new();

    for fact in facts.resources {
        check_type_tag(&fact.resource_type)?;
        check_identifier(&fact.table, &fact.resource_type)?;
        check_identifier(&fact.id_column, &fact.resource_type)?;
        if resources.contains_key(&fact.resource_type) {
            return Err(AuthzError::PolicySchema(format!(
                "duplicate resource type `{}`",
                fact.resource_type
            )));
        }

        if matches!(fact.actions, Declared::Listed(_)) {
            constrained.insert(fact.resource_type.clone());
        }
        let mut actions = BTreeSet::new();
        for action in fact.actions.into_vec() {
            if !actions.insert(action.clone()) {
                return Err(AuthzError::PolicySchema(format!(
                    "duplicate action `{action}` for `{}`",
                    fact.resource_type
                )));
            }
        }

        let mut role_names = BTreeSet::new();
        for def in fact.roles.into_vec() {
            role_names.insert(def.name.clone());
            role_defs.push((fact.resource_type.clone(), def));
        }

        resources.insert(
            fact.resource_type.clone(),
            ResourceType {
                name: fact.resource_type,
                table: fact.table,
                id_column: fact.id_column,
                actions,
                roles: role_names,
            },
        );
    }

    let mut permissions: BTreeSet<Permission> = resources
        .values()
        .flat_map(|r| r.actions.iter().map(|a| Permission::new(&r.name, a)))
        .collect();

    // Second pass: roles may reference resource types declared after them.
    let mut roles: BTreeMap<String, Role> = BTreeMap::new();
    for (resource_type, def) in role_defs {
        if roles.contains_key(&def.name) {
            return Err(AuthzError::PolicySchema(format!(
                "duplicate role name `{}`",
                def.name
            )));
        }

        let mut granted: Vec<Permission> = Vec::new();
        for raw in def.permissions.unwrap_or_default() {
            let permission = parse_permission(&raw, &resource_type, &def.name)?;
            let Some(target) = resources.get(&permission.resource_type) else {
                return Err(AuthzError::PolicySchema(format!(
                    "role `{}` grants `{raw}` on undeclared resource type `{}`",
                    def.name, permission.resource_type
                )));
            };
            if constrained.contains(&target.name) && !target.actions.contains(&permission.action)
            {
                return Err(AuthzError::PolicySchema(format!(
                    "role `{}` grants undeclared action `{}` on `{}`",
                    def.name, permission.action, permission.resource_type
                )));
            }
            if !granted.contains(&permission) {
                permissions.insert(permission.clone());
                granted.push(permission);
            }
        }

        roles.insert(
            def.name.clone(),
            Role {
                name: def.name,
                resource_type,
                permissions: granted,
                implies: def.implies.unwrap_or_default().into_iter().collect(),
            },
        );
    }

    for role in roles.values() {
        for implied in &role.implies {
            if !roles.contains_key(implied) {
                return Err(AuthzError::PolicySchema(format!(
                    "role `{}` implies undeclared role `{implied}`",
                    role.name
                )));
            }
        }
    }

    let relationships = build_relationships(facts.relationships, &resources)?;

    Ok(PolicyModel {
        resources,
        permissions,
        roles,
        relationships,
    })
}

fn build_relationships(
    facts: Vec<RelationshipFact>,
    resources: &BTreeMap<String, ResourceType>,
) -> Result<BTreeMap<String, Relationship>, AuthzError> {
    let mut relationships: BTreeMap<String, Relationship> = BTreeMap::new();

    for fact in facts {
        let lookup = |name: &str| {
            resources.get(name).ok_or_else(|| {
                AuthzError::PolicySchema(format!(
                    "relationship `{}` -> `{}` references undeclared resource type `{name}`",
                    fact.child_type, fact.parent_type
                ))
            })
        };
        let child = lookup(&fact.child_type)?;
        let parent = lookup(&fact.parent_type)?;

        if relationships.contains_key(&child.name) {
            return Err(AuthzError::PolicySchema(format!(
                "ambiguous hierarchy: resource type `{}` declares more than one parent",
                child.name
            )));
        }

        check_identifier(&fact.parent_field, &child.name)?;
        let references = fact.references.unwrap_or_else(|| parent.id_column.clone());
        check_identifier(&references, &parent.name)?;

        relationships.insert(
            child.name.clone(),
            Relationship {
                child_type: child.name.clone(),
                child_table: child.table.clone(),
                child_id: child.id_column.clone(),
                parent_type: parent.name.clone(),
                parent_table: parent.table.clone(),
                parent_id: parent.id_column.clone(),
                parent_field: fact.parent_field,
                references,
            },
        );
    }

    check_hierarchy_cycles(&relationships)?;
    Ok(relationships)
}

/// Each type has at most one parent, so following parents from any type must
/// reach a root without revisiting a type.
fn check_hierarchy_cycles(relationships: &BTreeMap<String, Relationship>) -> Result<(), AuthzError> {
    for start in relationships.keys() {
        let mut path = vec![start.as_str()];
        let mut current = start.as_str();
        while let Some(rel) = relationships.get(current) {
            current = rel.parent_type.as_str();
            let revisit = path.contains(&current);
            path.push(current);
            if revisit {
                return Err(AuthzError::PolicySchema(format!(
                    "resource hierarchy cycle: {}",
                    path.join(" -> ")
                )));
            }
        }
    }
    Ok(())
}

/// "action" grants on the role's own type; "Type:action" on the named type.
/// Type tags may contain `:` themselves, so the action is the last segment.
fn parse_permission(raw: &str, own_type: &str, role: &str) -> Result<Permission, AuthzError> {
    let (resource_type, action) = match raw.rsplit_once(':') {
        Some((t, a)) => (t, a),
        None => (own_type, raw),
    };
    if resource_type.is_empty() || action.is_empty() {
        return Err(AuthzError::PolicySchema(format!(
            "invalid permission `{raw}` in role `{role}` (expected \"action\" or \"Type:action\")"
        )));
    }
    Ok(Permission::new(resource_type, action))
}

fn check_identifier(name: &str, context: &str) -> Result<(), AuthzError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AuthzError::PolicySchema(format!(
            "`{name}` in `{context}` is not a valid table or column name"
        )))
    }
}

fn check_type_tag(name: &str) -> Result<(), AuthzError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(AuthzError::PolicySchema(format!(
            "invalid resource type name `{name}`"
        )))
    }
}

/// Build, resolve and compile facts into an immutable snapshot.
pub fn compile_policies(facts: PolicyFacts, version: u64) -> Result<PolicySnapshot, AuthzError> {
    let model = build_model(facts)?;

    let permission_roles = {
        let graph = RoleGraph::new(&model.roles)?;
        graph.permission_index(model.permissions.iter())
    };

    let walk = Arc::new(AncestorWalk::from_relationships(&model.relationships));
    let point_check = PointCheck::new(walk.clone());
    let filters = model
        .resources
        .values()
        .map(|res| {
            (
                res.name.clone(),
                BulkFilter::new(walk.clone(), FilterTarget::from(res)),
            )
        })
        .collect();

    tracing::debug!(
        version,
        resources = model.resources.len(),
        roles = model.roles.len(),
        permissions = model.permissions.len(),
        "Compiled policy snapshot"
    );

    Ok(PolicySnapshot {
        version,
        model,
        permission_roles,
        walk,
        point_check,
        filters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(name: &str, table: &str, actions: &[&str], roles: Vec<RoleDefinition>) -> ResourceFact {
        ResourceFact {
            resource_type: name.into(),
            table: table.into(),
            id_column: "id".into(),
            actions: Declared::Listed(actions.iter().map(|s| s.to_string()).collect()),
            roles: Declared::Listed(roles),
        }
    }

    fn role_def(name: &str, perms: &[&str], implies: &[&str]) -> RoleDefinition {
        RoleDefinition {
            name: name.into(),
            permissions: Some(perms.iter().map(|s| s.to_string()).collect()),
            implies: Some(implies.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn relationship(child: &str, parent: &str, field: &str) -> RelationshipFact {
        RelationshipFact {
            child_type: child.into(),
            parent_type: parent.into(),
            parent_field: field.into(),
            references: None,
        }
    }

    fn make_org_repo_facts() -> PolicyFacts {
        PolicyFacts {
            resources: vec![
                resource(
                    "Org",
                    "orgs",
                    &["read", "manage"],
                    vec![
                        role_def("owner", &["manage", "Repo:read"], &["member"]),
                        role_def("member", &["read"], &[]),
                    ],
                ),
                resource(
                    "Repo",
                    "repos",
                    &["read", "write"],
                    vec![role_def("reader", &["read"], &[])],
                ),
            ],
            relationships: vec![relationship("Repo", "Org", "org_id")],
        }
    }

    #[test]
    fn test_build_basic() {
        let model = build_model(make_org_repo_facts()).unwrap();
        assert_eq!(model.resources.len(), 2);
        assert_eq!(model.roles.len(), 3);
        assert_eq!(model.permissions.len(), 4);

        let owner = &model.roles["owner"];
        assert_eq!(owner.resource_type, "Org");
        assert_eq!(
            owner.permissions,
            vec![Permission::new("Org", "manage"), Permission::new("Repo", "read")]
        );
        assert!(owner.implies.contains("member"));

        let org = &model.resources["Org"];
        assert_eq!(
            org.roles.iter().collect::<Vec<_>>(),
            vec!["member", "owner"]
        );

        let rel = &model.relationships["Repo"];
        assert_eq!(rel.parent_type, "Org");
        assert_eq!(rel.child_table, "repos");
        assert_eq!(rel.parent_table, "orgs");
        assert_eq!(rel.references, "id");
    }

    #[test]
    fn test_unconstrained_sets_are_empty() {
        let facts = PolicyFacts {
            resources: vec![
                ResourceFact {
                    resource_type: "Org".into(),
                    table: "orgs".into(),
                    id_column: "id".into(),
                    actions: Declared::Unconstrained,
                    roles: Declared::Listed(vec![role_def("admin", &["anything"], &[])]),
                },
                ResourceFact {
                    resource_type: "Tag".into(),
                    table: "tags".into(),
                    id_column: "id".into(),
                    actions: Declared::Unconstrained,
                    roles: Declared::Unconstrained,
                },
            ],
            relationships: vec![],
        };
        let model = build_model(facts).unwrap();
        assert!(model.resources["Tag"].actions.is_empty());
        assert!(model.resources["Tag"].roles.is_empty());
        // Unconstrained actions accept any action a role grants.
        assert!(model.permissions.contains(&Permission::new("Org", "anything")));
    }

    #[test]
    fn test_duplicate_role_name() {
        let mut facts = make_org_repo_facts();
        if let Declared::Listed(roles) = &mut facts.resources[1].roles {
            roles.push(role_def("owner", &["read"], &[]));
        }
        let err = build_model(facts).unwrap_err();
        assert!(err.to_string().contains("duplicate role name `owner`"));
    }

    #[test]
    fn test_duplicate_resource_type() {
        let mut facts = make_org_repo_facts();
        facts.resources.push(resource("Org", "orgs2", &[], vec![]));
        let err = build_model(facts).unwrap_err();
        assert!(matches!(err, AuthzError::PolicySchema(_)));
    }

    #[test]
    fn test_cross_resource_permission_on_undeclared_type() {
        let mut facts = make_org_repo_facts();
        if let Declared::Listed(roles) = &mut facts.resources[0].roles {
            roles.push(role_def("auditor", &["Ledger:read"], &[]));
        }
        let err = build_model(facts).unwrap_err();
        assert!(err.to_string().contains("undeclared resource type `Ledger`"));
    }

    #[test]
    fn test_permission_on_undeclared_action() {
        let mut facts = make_org_repo_facts();
        if let Declared::Listed(roles) = &mut facts.resources[1].roles {
            roles.push(role_def("deleter", &["delete"], &[]));
        }
        let err = build_model(facts).unwrap_err();
        assert!(err.to_string().contains("undeclared action `delete`"));
    }

    #[test]
    fn test_malformed_permission_string() {
        let mut facts = make_org_repo_facts();
        if let Declared::Listed(roles) = &mut facts.resources[1].roles {
            roles.push(role_def("broken", &["Repo:"], &[]));
        }
        let err = build_model(facts).unwrap_err();
        assert!(err.to_string().contains("invalid permission"));
    }

    #[test]
    fn test_namespaced_type_as_grant_target() {
        let mut facts = make_org_repo_facts();
        facts
            .resources
            .push(resource("app:Doc", "docs", &["read"], vec![role_def("viewer", &["read"], &[])]));
        if let Declared::Listed(roles) = &mut facts.resources[0].roles {
            roles.push(role_def("librarian", &["app:Doc:read"], &[]));
        }

        let model = build_model(facts).unwrap();
        assert_eq!(
            model.roles["librarian"].permissions,
            vec![Permission::new("app:Doc", "read")]
        );
        assert_eq!(
            model.roles["viewer"].permissions,
            vec![Permission::new("app:Doc", "read")]
        );
    }

    #[test]
    fn test_implies_undeclared_role() {
        let mut facts = make_org_repo_facts();
        if let Declared::Listed(roles) = &mut facts.resources[1].roles {
            roles.push(role_def("writer", &["write"], &["ghost"]));
        }
        let err = build_model(facts).unwrap_err();
        assert!(err.to_string().contains("implies undeclared role `ghost`"));
    }

    #[test]
    fn test_ambiguous_relationship() {
        let mut facts = make_org_repo_facts();
        facts.resources.push(resource("Team", "teams", &[], vec![]));
        facts.relationships.push(relationship("Repo", "Team", "team_id"));
        let err = build_model(facts).unwrap_err();
        assert!(err.to_string().contains("ambiguous hierarchy"));
    }

    #[test]
    fn test_relationship_to_undeclared_type() {
        let mut facts = make_org_repo_facts();
        facts.relationships.push(relationship("Issue", "Repo", "repo_id"));
        let err = build_model(facts).unwrap_err();
        assert!(err.to_string().contains("undeclared resource type `Issue`"));
    }

    #[test]
    fn test_hierarchy_cycle() {
        let mut facts = make_org_repo_facts();
        facts.relationships.push(relationship("Org", "Repo", "repo_id"));
        let err = build_model(facts).unwrap_err();
        assert!(err.to_string().contains("hierarchy cycle"));
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let mut facts = make_org_repo_facts();
        facts.resources[0].table = "orgs; DROP TABLE user_roles".into();
        let err = build_model(facts).unwrap_err();
        assert!(err.to_string().contains("not a valid table or column name"));
    }

    #[test]
    fn test_invalid_type_tag_rejected() {
        let mut facts = make_org_repo_facts();
        facts.resources.push(resource("Bad'Type", "bad", &[], vec![]));
        let err = build_model(facts).unwrap_err();
        assert!(err.to_string().contains("invalid resource type name"));
    }

    #[test]
    fn test_compile_implication_cycle() {
        let facts = PolicyFacts {
            resources: vec![resource(
                "Repo",
                "repos",
                &["read"],
                vec![
                    role_def("a", &["read"], &["b"]),
                    role_def("b", &[], &["a"]),
                ],
            )],
            relationships: vec![],
        };
        let err = compile_policies(facts, 1).unwrap_err();
        assert!(matches!(err, AuthzError::ImplicationCycle(_)));
    }

    #[test]
    fn test_compile_precomputes_relevant_roles() {
        let snapshot = compile_policies(make_org_repo_facts(), 7).unwrap();
        assert_eq!(snapshot.version, 7);

        let read = snapshot.relevant_roles("Repo", "read").unwrap();
        assert_eq!(
            read.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["owner", "reader"]
        );
        let org_read = snapshot.relevant_roles("Org", "read").unwrap();
        assert_eq!(
            org_read.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["member", "owner"]
        );
        assert!(snapshot.relevant_roles("Repo", "delete").is_none());
        assert_eq!(snapshot.filters.len(), 2);
        assert_eq!(snapshot.walk.steps().len(), 1);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let a = compile_policies(make_org_repo_facts(), 1).unwrap();
        let b = compile_policies(make_org_repo_facts(), 1).unwrap();
        assert_eq!(a.model, b.model);
        assert_eq!(a.permission_roles, b.permission_roles);
        assert_eq!(*a.walk, *b.walk);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();

        std::fs::write(
            dir.path().join("10_org.kdl"),
            r#"
resource "Org" table="orgs" {
    actions {
        - "manage"
    }
    roles {
        role "owner" {
            permissions {
                - "manage"
                - "Repo:read"
            }
        }
    }
}
"#,
        )
        .unwrap();

        std::fs::write(
            dir.path().join("20_repo.kdl"),
            r#"
resource "Repo" table="repos" {
    actions {
        - "read"
    }
}

relationship child="Repo" parent="Org" field="org_id"
"#,
        )
        .unwrap();

        // Also write a non-KDL file that should be ignored
        std::fs::write(dir.path().join("README.md"), "not a policy").unwrap();

        let facts = KdlDirectory::new(dir.path()).load_facts().unwrap();
        assert_eq!(facts.resources.len(), 2);
        assert_eq!(facts.relationships.len(), 1);

        // Org is declared before Repo but grants on it; the second pass resolves it.
        let model = build_model(facts).unwrap();
        assert!(model.permissions.contains(&Permission::new("Repo", "read")));
    }

    #[test]
    fn test_load_nonexistent_directory() {
        let err = load_policies(Path::new("/nonexistent/path")).unwrap_err();
        assert!(matches!(err, AuthzError::PolicySchema(_)));
    }
}
