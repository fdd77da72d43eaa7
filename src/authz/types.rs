use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ---------- Fact contract ----------

/// A set the policy may leave open. `Unconstrained` means "nothing declared",
/// which is recorded as an empty set rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declared<T> {
    Unconstrained,
    Listed(Vec<T>),
}

impl<T> Declared<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Declared::Unconstrained => Vec::new(),
            Declared::Listed(items) => items,
        }
    }
}

impl<T> Default for Declared<T> {
    fn default() -> Self {
        Declared::Unconstrained
    }
}

/// `child_type` instances point at their parent through `parent_field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipFact {
    pub child_type: String,
    pub parent_type: String,
    /// Column on the child table holding the parent reference
    pub parent_field: String,
    /// Parent column `parent_field` joins to; defaults to the parent's id column
    pub references: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDefinition {
    pub name: String,
    /// Bare actions ("read") or cross-resource permissions ("Repo:read")
    pub permissions: Option<Vec<String>>,
    pub implies: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFact {
    pub resource_type: String,
    /// Table holding instances of this type
    pub table: String,
    pub id_column: String,
    pub actions: Declared<String>,
    pub roles: Declared<RoleDefinition>,
}

/// Everything the fact source produced for one compilation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyFacts {
    pub resources: Vec<ResourceFact>,
    pub relationships: Vec<RelationshipFact>,
}

impl PolicyFacts {
    pub fn extend(&mut self, other: PolicyFacts) {
        self.resources.extend(other.resources);
        self.relationships.extend(other.relationships);
    }
}

// ---------- Policy model ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceType {
    pub name: String,
    pub table: String,
    pub id_column: String,
    pub actions: BTreeSet<String>,
    pub roles: BTreeSet<String>,
}

/// An (action, resource type) pair, displayed as "type:action".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource_type: String,
    pub action: String,
}

impl Permission {
    pub fn new(resource_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            action: action.into(),
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub resource_type: String,
    /// Granted permissions in declaration order, without duplicates
    pub permissions: Vec<Permission>,
    pub implies: BTreeSet<String>,
}

/// Resolved parent link for one child resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub child_type: String,
    pub child_table: String,
    pub child_id: String,
    pub parent_type: String,
    pub parent_table: String,
    pub parent_id: String,
    pub parent_field: String,
    pub references: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyModel {
    pub resources: BTreeMap<String, ResourceType>,
    pub permissions: BTreeSet<Permission>,
    pub roles: BTreeMap<String, Role>,
    /// child type -> relationship
    pub relationships: BTreeMap<String, Relationship>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserRoleAssignment {
    pub user_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub role: String,
}

// ---------- API request/response types ----------

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub user_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    /// Overrides the configured query deadline
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
}

#[derive(Debug, Deserialize)]
pub struct FilterRequest {
    pub user_id: String,
    pub action: String,
    pub resource_type: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FilterResponse {
    pub resource_ids: Vec<String>,
}

/// Body of both `POST` and `DELETE /v1/assignments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRequest {
    pub user_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub role: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssignResponse {
    /// False when the same assignment already existed
    pub created: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub removed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssignmentsResponse {
    pub assignments: Vec<UserRoleAssignment>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompileResponse {
    pub version: u64,
    pub resources: usize,
    pub roles: usize,
    pub permissions: usize,
    pub relationships: usize,
}

/// One row of the persisted role index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSummary {
    pub name: String,
    pub resource_type: String,
    /// "type:action" strings, sorted
    pub permissions: Vec<String>,
    pub implies: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RolesResponse {
    pub roles: Vec<RoleSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AncestorsResponse {
    /// The resource itself first, then each parent up to the root
    pub chain: Vec<ResourceRef>,
}
