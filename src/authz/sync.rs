//! Persist the derived role tables for a compiled model.
//!
//! `roles`, `permissions`, `role_permissions` and `role_implications` are
//! fully replaced in one transaction. `user_roles` is never rewritten, but its
//! rows must keep naming roles of the right resource type, which
//! [`OrphanPolicy`] governs.

use std::collections::BTreeMap;

use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};

use crate::authz::errors::AuthzError;
use crate::authz::types::{Permission, PolicyModel};
use crate::entities;

/// What to do with assignments whose role no longer exists on their
/// resource type after a recompile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Fail the compile and keep the previous state
    #[default]
    Reject,
    /// Delete the orphaned assignments inside the same transaction
    Prune,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub roles: usize,
    pub permissions: usize,
    pub role_permissions: usize,
    pub implications: usize,
    pub pruned_assignments: u64,
}

/// Replace the derived tables with `model`, all or nothing.
pub async fn replace_derived_tables(
    db: &DatabaseConnection,
    model: &PolicyModel,
    orphans: OrphanPolicy,
) -> Result<SyncReport, AuthzError> {
    let txn = db.begin().await?;

    let pruned_assignments = reconcile_assignments(&txn, model, orphans).await?;

    entities::RolePermission::delete_many().exec(&txn).await?;
    entities::RoleImplication::delete_many().exec(&txn).await?;
    entities::Role::delete_many().exec(&txn).await?;
    entities::Permission::delete_many().exec(&txn).await?;

    let permission_ids: BTreeMap<&Permission, i32> = model
        .permissions
        .iter()
        .zip(1..)
        .collect();

    let permission_rows: Vec<_> = permission_ids
        .iter()
        .map(|(perm, id)| entities::permission::ActiveModel {
            id: Set(*id),
            resource_type: Set(perm.resource_type.clone()),
            name: Set(perm.action.clone()),
        })
        .collect();

    let role_rows: Vec<_> = model
        .roles
        .values()
        .map(|role| entities::role::ActiveModel {
            name: Set(role.name.clone()),
            resource_type: Set(role.resource_type.clone()),
        })
        .collect();

    let mut grant_rows = Vec::new();
    let mut implication_rows = Vec::new();
    for role in model.roles.values() {
        for perm in &role.permissions {
            let Some(permission_id) = permission_ids.get(perm) else {
                return Err(AuthzError::PolicySchema(format!(
                    "role `{}` grants unknown permission `{perm}`",
                    role.name
                )));
            };
            grant_rows.push(entities::role_permission::ActiveModel {
                id: Set(grant_rows.len() as i32 + 1),
                role: Set(role.name.clone()),
                permission_id: Set(*permission_id),
            });
        }
        for implied in &role.implies {
            implication_rows.push(entities::role_implication::ActiveModel {
                id: Set(implication_rows.len() as i32 + 1),
                from_role: Set(role.name.clone()),
                to_role: Set(implied.clone()),
            });
        }
    }

    let report = SyncReport {
        roles: role_rows.len(),
        permissions: permission_rows.len(),
        role_permissions: grant_rows.len(),
        implications: implication_rows.len(),
        pruned_assignments,
    };

    // insert_many rejects an empty batch
    if !permission_rows.is_empty() {
        entities::Permission::insert_many(permission_rows)
            .exec_without_returning(&txn)
            .await?;
    }
    if !role_rows.is_empty() {
        entities::Role::insert_many(role_rows)
            .exec_without_returning(&txn)
            .await?;
    }
    if !grant_rows.is_empty() {
        entities::RolePermission::insert_many(grant_rows)
            .exec_without_returning(&txn)
            .await?;
    }
    if !implication_rows.is_empty() {
        entities::RoleImplication::insert_many(implication_rows)
            .exec_without_returning(&txn)
            .await?;
    }

    txn.commit().await?;

    tracing::debug!(
        roles = report.roles,
        permissions = report.permissions,
        grants = report.role_permissions,
        implications = report.implications,
        "Replaced derived role tables"
    );

    Ok(report)
}

/// Find assignments naming a role that is missing, or declared on another
/// resource type, in `model`. Returns the number of rows pruned.
async fn reconcile_assignments<C: ConnectionTrait>(
    conn: &C,
    model: &PolicyModel,
    orphans: OrphanPolicy,
) -> Result<u64, AuthzError> {
    use entities::user_role::{Column, Entity};

    let in_use: Vec<(String, String)> = Entity::find()
        .select_only()
        .column(Column::Role)
        .column(Column::ResourceType)
        .distinct()
        .into_tuple()
        .all(conn)
        .await?;

    let orphaned: Vec<(String, String)> = in_use
        .into_iter()
        .filter(|(role, resource_type)| {
            model
                .roles
                .get(role)
                .map_or(true, |r| r.resource_type != *resource_type)
        })
        .collect();

    if orphaned.is_empty() {
        return Ok(0);
    }

    match orphans {
        OrphanPolicy::Reject => {
            let listed: Vec<String> = orphaned
                .iter()
                .map(|(role, resource_type)| format!("{role} on {resource_type}"))
                .collect();
            Err(AuthzError::OrphanedAssignments(listed.join(", ")))
        }
        OrphanPolicy::Prune => {
            let mut pruned = 0;
            for (role, resource_type) in &orphaned {
                let result = Entity::delete_many()
                    .filter(Column::Role.eq(role.as_str()))
                    .filter(Column::ResourceType.eq(resource_type.as_str()))
                    .exec(conn)
                    .await?;
                tracing::warn!(
                    role = %role,
                    resource_type = %resource_type,
                    rows = result.rows_affected,
                    "Pruned assignments of a role no longer declared on this resource type"
                );
                pruned += result.rows_affected;
            }
            Ok(pruned)
        }
    }
}
