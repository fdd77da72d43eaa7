use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::authz::errors::AuthzError;
use crate::authz::loader::{compile_policies, FactSource};
use crate::authz::query::{FilterParams, PointParams};
use crate::authz::sync::{replace_derived_tables, OrphanPolicy};
use crate::authz::types::{PolicyFacts, ResourceRef, RoleSummary, UserRoleAssignment};
use crate::authz::PolicySnapshot;
use crate::storage;

#[derive(Debug, Clone)]
pub struct AuthorizerOptions {
    /// Deadline for `check`/`filter` when the caller supplies none
    pub query_timeout: Duration,
    pub orphans: OrphanPolicy,
}

impl Default for AuthorizerOptions {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_millis(5000),
            orphans: OrphanPolicy::Reject,
        }
    }
}

/// Evaluates authorization requests against the current policy snapshot and
/// the live `user_roles` rows.
pub struct Authorizer {
    db: DatabaseConnection,
    source: Arc<dyn FactSource>,
    options: AuthorizerOptions,
    snapshot: ArcSwapOption<PolicySnapshot>,
    /// Held for the whole compile; guards the last published version.
    compile_lock: Mutex<u64>,
}

impl Authorizer {
    pub fn new(
        db: DatabaseConnection,
        source: Arc<dyn FactSource>,
        options: AuthorizerOptions,
    ) -> Self {
        Self {
            db,
            source,
            options,
            snapshot: ArcSwapOption::empty(),
            compile_lock: Mutex::new(0),
        }
    }

    /// Current snapshot, or `NotConfigured` before the first successful compile.
    pub fn snapshot(&self) -> Result<Arc<PolicySnapshot>, AuthzError> {
        self.snapshot.load_full().ok_or(AuthzError::NotConfigured)
    }

    /// Read facts from the configured source and compile them.
    pub async fn compile(&self) -> Result<Arc<PolicySnapshot>, AuthzError> {
        let source = self.source.clone();
        let facts = tokio::task::spawn_blocking(move || source.load_facts())
            .await
            .map_err(|err| AuthzError::Io(std::io::Error::other(err)))??;
        self.compile_facts(facts).await
    }

    /// Build, persist and publish a new snapshot. On any error the previous
    /// snapshot and derived tables stay in place.
    pub async fn compile_facts(&self, facts: PolicyFacts) -> Result<Arc<PolicySnapshot>, AuthzError> {
        let mut version = self.compile_lock.lock().await;

        let snapshot = compile_policies(facts, *version + 1)?;
        let report = replace_derived_tables(&self.db, &snapshot.model, self.options.orphans).await?;

        // Publish only after the transaction committed.
        let snapshot = Arc::new(snapshot);
        self.snapshot.store(Some(snapshot.clone()));
        *version = snapshot.version;

        info!(
            version = snapshot.version,
            resources = snapshot.model.resources.len(),
            roles = report.roles,
            permissions = report.permissions,
            relationships = snapshot.model.relationships.len(),
            pruned = report.pruned_assignments,
            "Compiled authorization policy"
        );

        Ok(snapshot)
    }

    /// Does `user_id` hold a role granting `action` on the instance or any of
    /// its ancestors? Access denied is `Ok(false)`, never an error.
    pub async fn check(
        &self,
        user_id: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        deadline: Option<Duration>,
    ) -> Result<bool, AuthzError> {
        let snapshot = self.snapshot()?;
        if !snapshot.model.resources.contains_key(resource_type) {
            return Err(AuthzError::UnknownResourceType(resource_type.to_string()));
        }

        let Some(roles) = relevant(&snapshot, resource_type, action) else {
            debug!(user_id, action, resource_type, resource_id, "No role grants this permission");
            return Ok(false);
        };

        let stmt = snapshot.point_check.render(
            self.db.get_database_backend(),
            &PointParams {
                user_id,
                resource_type,
                resource_id,
                roles,
            },
        );
        let row = self
            .with_deadline(deadline, self.db.query_one(stmt))
            .await?;
        let allowed = row.is_some();

        debug!(
            user_id,
            action,
            resource_type,
            resource_id,
            allowed,
            version = snapshot.version,
            "Authorization check"
        );
        Ok(allowed)
    }

    /// Ids of every `resource_type` instance `user_id` may perform `action` on.
    pub async fn filter(
        &self,
        user_id: &str,
        action: &str,
        resource_type: &str,
        deadline: Option<Duration>,
    ) -> Result<BTreeSet<String>, AuthzError> {
        let snapshot = self.snapshot()?;
        let Some(bulk) = snapshot.filters.get(resource_type) else {
            return Err(AuthzError::UnknownResourceType(resource_type.to_string()));
        };

        let Some(roles) = relevant(&snapshot, resource_type, action) else {
            return Ok(BTreeSet::new());
        };

        let stmt = bulk.render(
            self.db.get_database_backend(),
            &FilterParams { user_id, roles },
        );
        let rows = self
            .with_deadline(deadline, self.db.query_all(stmt))
            .await?;

        let ids = rows
            .iter()
            .map(|row| row.try_get::<String>("", "resource_id"))
            .collect::<Result<BTreeSet<_>, _>>()?;

        debug!(
            user_id,
            action,
            resource_type,
            matched = ids.len(),
            version = snapshot.version,
            "Authorization filter"
        );
        Ok(ids)
    }

    /// Grant `role` on one instance. Returns `false` when the identical
    /// assignment already existed.
    pub async fn assign_role(
        &self,
        user_id: &str,
        resource_type: &str,
        resource_id: &str,
        role: &str,
    ) -> Result<bool, AuthzError> {
        let snapshot = self.snapshot()?;
        if !snapshot.model.resources.contains_key(resource_type) {
            return Err(AuthzError::UnknownResourceType(resource_type.to_string()));
        }
        let Some(def) = snapshot.model.roles.get(role) else {
            return Err(AuthzError::UnknownRole(role.to_string()));
        };
        if def.resource_type != resource_type {
            return Err(AuthzError::RoleMismatch {
                role: role.to_string(),
                role_type: def.resource_type.clone(),
                resource_type: resource_type.to_string(),
            });
        }

        let created = storage::insert_assignment(
            &self.db,
            &assignment(user_id, resource_type, resource_id, role),
        )
        .await?;
        info!(user_id, resource_type, resource_id, role, created, "Assigned role");
        Ok(created)
    }

    /// Remove one assignment. Returns whether it existed.
    pub async fn revoke_role(
        &self,
        user_id: &str,
        resource_type: &str,
        resource_id: &str,
        role: &str,
    ) -> Result<bool, AuthzError> {
        let removed = storage::delete_assignment(
            &self.db,
            &assignment(user_id, resource_type, resource_id, role),
        )
        .await?;
        info!(user_id, resource_type, resource_id, role, removed, "Revoked role");
        Ok(removed)
    }

    pub async fn list_assignments(&self, user_id: &str) -> Result<Vec<UserRoleAssignment>, AuthzError> {
        storage::list_assignments(&self.db, user_id).await
    }

    /// The persisted role tables as last written by a compile.
    pub async fn role_index(&self) -> Result<Vec<RoleSummary>, AuthzError> {
        storage::load_role_index(&self.db).await
    }

    /// The instance followed by each of its ancestors, nearest first.
    pub async fn ancestors(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<ResourceRef>, AuthzError> {
        let snapshot = self.snapshot()?;
        if !snapshot.model.resources.contains_key(resource_type) {
            return Err(AuthzError::UnknownResourceType(resource_type.to_string()));
        }

        let backend = self.db.get_database_backend();
        let stmt = snapshot.walk.render_chain(backend, resource_type, resource_id);
        let rows = self
            .with_deadline(None, self.db.query_all(stmt))
            .await?;

        rows.iter()
            .map(|row| -> Result<ResourceRef, AuthzError> {
                Ok(ResourceRef {
                    resource_type: row.try_get("", "resource_type")?,
                    resource_id: row.try_get("", "resource_id")?,
                })
            })
            .collect()
    }

    async fn with_deadline<T>(
        &self,
        deadline: Option<Duration>,
        query: impl Future<Output = Result<T, DbErr>>,
    ) -> Result<T, AuthzError> {
        let limit = deadline.unwrap_or(self.options.query_timeout);
        // A zero budget cannot be met by any query.
        if limit.is_zero() {
            return Err(AuthzError::DeadlineExceeded(limit));
        }
        match tokio::time::timeout(limit, query).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(AuthzError::DeadlineExceeded(limit)),
        }
    }
}

/// Relevant roles, or `None` when nothing could satisfy the permission.
fn relevant<'s>(
    snapshot: &'s PolicySnapshot,
    resource_type: &str,
    action: &str,
) -> Option<&'s BTreeSet<String>> {
    snapshot
        .relevant_roles(resource_type, action)
        .filter(|roles| !roles.is_empty())
}

fn assignment(user_id: &str, resource_type: &str, resource_id: &str, role: &str) -> UserRoleAssignment {
    UserRoleAssignment {
        user_id: user_id.to_string(),
        resource_type: resource_type.to_string(),
        resource_id: resource_id.to_string(),
        role: role.to_string(),
    }
}
