use std::collections::HashSet;

use crate::authz::errors::AuthzError;
use crate::authz::types::*;
use kdl::KdlDocument;

/// Parse a KDL document string into fact tuples.
///
/// Only the shape of each node is checked here; cross-references between
/// facts are resolved by [`crate::authz::loader::build_model`].
pub fn parse_kdl_document(source: &str) -> Result<PolicyFacts, AuthzError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AuthzError::KdlParse(e.to_string()))?;

    let mut facts = PolicyFacts::default();

    for node in doc.nodes() {
        match node.name().value() {
            "resource" => facts.resources.push(parse_resource(node)?),
            "relationship" => {
                let child_type = string_prop(node, "child")?;
                let parent_type = string_prop(node, "parent")?;
                let parent_field = string_prop(node, "field")?;
                let references = node
                    .get("references")
                    .and_then(|v| v.as_string())
                    .map(|s| s.to_string());

                facts.relationships.push(RelationshipFact {
                    child_type,
                    parent_type,
                    parent_field,
                    references,
                });
            }
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(facts)
}

fn parse_resource(node: &kdl::KdlNode) -> Result<ResourceFact, AuthzError> {
    let resource_type = first_string_arg(node).ok_or_else(|| {
        AuthzError::PolicySchema(
            "resource node requires a string argument (e.g. resource \"Repo\" table=\"repos\")"
                .into(),
        )
    })?;

    let table = node
        .get("table")
        .and_then(|v| v.as_string())
        .ok_or_else(|| {
            AuthzError::PolicySchema(format!(
                "resource `{resource_type}` missing `table` property"
            ))
        })?
        .to_string();

    let id_column = node
        .get("id")
        .and_then(|v| v.as_string())
        .unwrap_or("id")
        .to_string();

    let mut actions = Declared::Unconstrained;
    let mut roles = Declared::Unconstrained;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "actions" => {
                    let listed = dash_list(child);
                    let mut seen = HashSet::new();
                    for action in &listed {
                        if !seen.insert(action.as_str()) {
                            return Err(AuthzError::PolicySchema(format!(
                                "duplicate action `{action}` for `{resource_type}`"
                            )));
                        }
                    }
                    actions = Declared::Listed(listed);
                }
                "roles" => {
                    let mut defs = Vec::new();
                    if let Some(role_nodes) = child.children() {
                        for role_node in role_nodes.nodes() {
                            defs.push(parse_role(&resource_type, role_node)?);
                        }
                    }
                    roles = Declared::Listed(defs);
                }
                other => {
                    return Err(AuthzError::PolicySchema(format!(
                        "unexpected child `{other}` in resource `{resource_type}` (expected `actions` or `roles`)"
                    )));
                }
            }
        }
    }

    Ok(ResourceFact {
        resource_type,
        table,
        id_column,
        actions,
        roles,
    })
}

fn parse_role(resource_type: &str, node: &kdl::KdlNode) -> Result<RoleDefinition, AuthzError> {
    if node.name().value() != "role" {
        return Err(AuthzError::PolicySchema(format!(
            "unexpected child `{}` in roles of `{resource_type}` (expected `role`)",
            node.name().value()
        )));
    }
    let name = first_string_arg(node).ok_or_else(|| {
        AuthzError::PolicySchema(format!(
            "role in `{resource_type}` requires a name (e.g. role \"owner\")"
        ))
    })?;

    let mut permissions = None;
    let mut implies = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "permissions" => permissions = Some(dash_list(child)),
                "implies" => implies = Some(dash_list(child)),
                other => {
                    return Err(AuthzError::PolicySchema(format!(
                        "role definition `{name}` contains invalid key `{other}`"
                    )));
                }
            }
        }
    }

    let is_empty = |list: &Option<Vec<String>>| list.as_ref().map_or(true, |l| l.is_empty());
    if is_empty(&permissions) && is_empty(&implies) {
        return Err(AuthzError::PolicySchema(format!(
            "role `{name}` must define permissions or implications"
        )));
    }

    Ok(RoleDefinition {
        name,
        permissions,
        implies,
    })
}

fn string_prop(node: &kdl::KdlNode, key: &str) -> Result<String, AuthzError> {
    node.get(key)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            AuthzError::PolicySchema(format!(
                "relationship missing `{key}` property (e.g. relationship child=\"Repo\" parent=\"Org\" field=\"org_id\")"
            ))
        })
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &kdl::KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
/// Example KDL:
/// ```kdl
/// actions {
///     - "read"
///     - "write"
/// }
/// ```
fn dash_list(node: &kdl::KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}
