pub mod engine;
pub mod errors;
pub mod loader;
pub mod policy;
pub mod query;
pub mod roles;
pub mod sync;
pub mod types;
pub mod web;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use query::{AncestorWalk, BulkFilter, PointCheck};
use types::{Permission, PolicyModel};

/// One fully compiled policy version. Immutable once published; a recompile
/// produces a new snapshot and swaps it in whole.
#[derive(Debug)]
pub struct PolicySnapshot {
    /// Increases by one with every successful compile
    pub version: u64,
    pub model: PolicyModel,
    /// permission -> roles granting it, including through implication
    pub permission_roles: BTreeMap<Permission, BTreeSet<String>>,
    pub walk: Arc<AncestorWalk>,
    pub point_check: PointCheck,
    /// resource type -> bulk filter over that type's table
    pub filters: BTreeMap<String, BulkFilter>,
}

impl PolicySnapshot {
    /// Relevant roles for `resource_type:action`, or `None` when no
    /// permission by that name exists.
    pub fn relevant_roles(&self, resource_type: &str, action: &str) -> Option<&BTreeSet<String>> {
        self.permission_roles.get(&Permission::new(resource_type, action))
    }
}
