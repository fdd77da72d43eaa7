use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::authz::engine::Authorizer;
use crate::authz::types::{
    AncestorsResponse, AssignResponse, AssignmentRequest, AssignmentsResponse, CheckRequest,
    CheckResponse, CompileResponse, FilterRequest, FilterResponse, RevokeResponse, RolesResponse,
};

pub fn router(authz: Arc<Authorizer>) -> Router {
    Router::new()
        .route("/v1/check", post(handle_check))
        .route("/v1/filter", post(handle_filter))
        .route(
            "/v1/assignments",
            post(handle_assign).delete(handle_revoke),
        )
        .route("/v1/assignments/{user_id}", get(handle_list_assignments))
        .route("/v1/compile", post(handle_compile))
        .route("/v1/roles", get(handle_roles))
        .route(
            "/v1/ancestors/{resource_type}/{resource_id}",
            get(handle_ancestors),
        )
        .route("/healthz", get(health))
        .with_state(authz)
}

async fn handle_check(
    State(authz): State<Arc<Authorizer>>,
    Json(req): Json<CheckRequest>,
) -> impl IntoResponse {
    match authz
        .check(
            &req.user_id,
            &req.action,
            &req.resource_type,
            &req.resource_id,
            req.timeout_ms.map(Duration::from_millis),
        )
        .await
    {
        Ok(allowed) => Json(CheckResponse { allowed }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_filter(
    State(authz): State<Arc<Authorizer>>,
    Json(req): Json<FilterRequest>,
) -> impl IntoResponse {
    match authz
        .filter(
            &req.user_id,
            &req.action,
            &req.resource_type,
            req.timeout_ms.map(Duration::from_millis),
        )
        .await
    {
        Ok(ids) => Json(FilterResponse {
            resource_ids: ids.into_iter().collect(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_assign(
    State(authz): State<Arc<Authorizer>>,
    Json(req): Json<AssignmentRequest>,
) -> impl IntoResponse {
    match authz
        .assign_role(&req.user_id, &req.resource_type, &req.resource_id, &req.role)
        .await
    {
        Ok(true) => (StatusCode::CREATED, Json(AssignResponse { created: true })).into_response(),
        Ok(false) => Json(AssignResponse { created: false }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_revoke(
    State(authz): State<Arc<Authorizer>>,
    Json(req): Json<AssignmentRequest>,
) -> impl IntoResponse {
    match authz
        .revoke_role(&req.user_id, &req.resource_type, &req.resource_id, &req.role)
        .await
    {
        Ok(removed) => Json(RevokeResponse { removed }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_list_assignments(
    State(authz): State<Arc<Authorizer>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match authz.list_assignments(&user_id).await {
        Ok(assignments) => Json(AssignmentsResponse { assignments }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_compile(State(authz): State<Arc<Authorizer>>) -> impl IntoResponse {
    match authz.compile().await {
        Ok(snapshot) => Json(CompileResponse {
            version: snapshot.version,
            resources: snapshot.model.resources.len(),
            roles: snapshot.model.roles.len(),
            permissions: snapshot.model.permissions.len(),
            relationships: snapshot.model.relationships.len(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_roles(State(authz): State<Arc<Authorizer>>) -> impl IntoResponse {
    match authz.role_index().await {
        Ok(roles) => Json(RolesResponse { roles }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_ancestors(
    State(authz): State<Arc<Authorizer>>,
    Path((resource_type, resource_id)): Path<(String, String)>,
) -> impl IntoResponse {
    match authz.ancestors(&resource_type, &resource_id).await {
        Ok(chain) => Json(AncestorsResponse { chain }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
