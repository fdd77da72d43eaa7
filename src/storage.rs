use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use migration::MigratorTrait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};

use crate::authz::errors::AuthzError;
use crate::authz::types::{RoleSummary, UserRoleAssignment};
use crate::entities;
use crate::errors::ServiceError;
use crate::settings::Database as DbCfg;

/// Connect and bring the schema up to date.
pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, ServiceError> {
    let db = Database::connect(&cfg.url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

/// Insert an assignment unless the identical row already exists.
/// Returns whether a row was written.
pub async fn insert_assignment<C: ConnectionTrait>(
    db: &C,
    assignment: &UserRoleAssignment,
) -> Result<bool, AuthzError> {
    use entities::user_role::{ActiveModel, Column, Entity};

    let row = ActiveModel {
        user_id: Set(assignment.user_id.clone()),
        resource_type: Set(assignment.resource_type.clone()),
        resource_id: Set(assignment.resource_id.clone()),
        role: Set(assignment.role.clone()),
        created_at: Set(Utc::now().timestamp()),
        ..Default::default()
    };

    let written = Entity::insert(row)
        .on_conflict(
            OnConflict::columns([
                Column::UserId,
                Column::ResourceType,
                Column::ResourceId,
                Column::Role,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(written > 0)
}

/// Returns whether a row was removed.
pub async fn delete_assignment<C: ConnectionTrait>(
    db: &C,
    assignment: &UserRoleAssignment,
) -> Result<bool, AuthzError> {
    use entities::user_role::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::UserId.eq(assignment.user_id.as_str()))
        .filter(Column::ResourceType.eq(assignment.resource_type.as_str()))
        .filter(Column::ResourceId.eq(assignment.resource_id.as_str()))
        .filter(Column::Role.eq(assignment.role.as_str()))
        .exec(db)
        .await?;

    Ok(result.rows_affected > 0)
}

pub async fn list_assignments<C: ConnectionTrait>(
    db: &C,
    user_id: &str,
) -> Result<Vec<UserRoleAssignment>, AuthzError> {
    use entities::user_role::{Column, Entity};

    let rows = Entity::find()
        .filter(Column::UserId.eq(user_id))
        .order_by_asc(Column::ResourceType)
        .order_by_asc(Column::ResourceId)
        .order_by_asc(Column::Role)
        .all(db)
        .await?;

    Ok(rows
        .into_iter()
        .map(|m| UserRoleAssignment {
            user_id: m.user_id,
            resource_type: m.resource_type,
            resource_id: m.resource_id,
            role: m.role,
        })
        .collect())
}

/// Read the persisted role tables back, one summary per role, ordered by name.
pub async fn load_role_index<C: ConnectionTrait>(db: &C) -> Result<Vec<RoleSummary>, AuthzError> {
    let roles = entities::Role::find()
        .order_by_asc(entities::role::Column::Name)
        .all(db)
        .await?;

    let permission_names: BTreeMap<i32, String> = entities::Permission::find()
        .all(db)
        .await?
        .into_iter()
        .map(|p| (p.id, format!("{}:{}", p.resource_type, p.name)))
        .collect();

    let mut grants: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for edge in entities::RolePermission::find().all(db).await? {
        if let Some(name) = permission_names.get(&edge.permission_id) {
            grants.entry(edge.role).or_default().insert(name.clone());
        }
    }

    let mut implies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for edge in entities::RoleImplication::find().all(db).await? {
        implies.entry(edge.from_role).or_default().insert(edge.to_role);
    }

    Ok(roles
        .into_iter()
        .map(|role| RoleSummary {
            permissions: grants
                .remove(&role.name)
                .unwrap_or_default()
                .into_iter()
                .collect(),
            implies: implies
                .remove(&role.name)
                .unwrap_or_default()
                .into_iter()
                .collect(),
            name: role.name,
            resource_type: role.resource_type,
        })
        .collect())
}
