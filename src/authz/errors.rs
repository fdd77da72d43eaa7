use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(arbor::authz::policy_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    PolicyLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(arbor::authz::kdl_parse),
        help("Check your KDL file syntax (see https://kdl.dev)")
    )]
    KdlParse(String),

    #[error("Invalid policy schema: {0}")]
    #[diagnostic(
        code(arbor::authz::policy_schema),
        help("Policy files may contain `resource` and `relationship` nodes; every role, resource type and relationship they reference must be declared")
    )]
    PolicySchema(String),

    #[error("Cyclic role implication detected: {0}")]
    #[diagnostic(
        code(arbor::authz::implication_cycle),
        help("Check the `implies` lists in your role definitions for circular references")
    )]
    ImplicationCycle(String),

    #[error("Role assignments reference roles missing from the new policy: {0}")]
    #[diagnostic(
        code(arbor::authz::orphaned_assignments),
        help("Revoke the listed assignments first, or set `authz.orphaned_assignments = \"prune\"` to delete them during compilation")
    )]
    OrphanedAssignments(String),

    #[error("Authorization policy has not been compiled yet")]
    #[diagnostic(
        code(arbor::authz::not_configured),
        help("Call `compile` (or POST /v1/compile) before checking permissions")
    )]
    NotConfigured,

    #[error("Undefined resource type `{0}`")]
    #[diagnostic(code(arbor::authz::unknown_resource_type))]
    UnknownResourceType(String),

    #[error("Undefined role `{0}`")]
    #[diagnostic(code(arbor::authz::unknown_role))]
    UnknownRole(String),

    #[error("Role `{role}` is declared on `{role_type}` and cannot be assigned on `{resource_type}`")]
    #[diagnostic(code(arbor::authz::role_mismatch))]
    RoleMismatch {
        role: String,
        role_type: String,
        resource_type: String,
    },

    #[error("Backing store error: {0}")]
    #[diagnostic(code(arbor::authz::backing_store))]
    BackingStore(#[from] sea_orm::DbErr),

    #[error("Authorization query exceeded its deadline of {0:?}")]
    #[diagnostic(
        code(arbor::authz::deadline_exceeded),
        help("The query is safe to retry; consider raising `authz.query_timeout_ms`")
    )]
    DeadlineExceeded(Duration),

    #[error("I/O error: {0}")]
    #[diagnostic(code(arbor::authz::io))]
    Io(#[from] std::io::Error),
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthzError::KdlParse(_)
            | AuthzError::PolicySchema(_)
            | AuthzError::ImplicationCycle(_)
            | AuthzError::OrphanedAssignments(_)
            | AuthzError::UnknownResourceType(_)
            | AuthzError::UnknownRole(_)
            | AuthzError::RoleMismatch { .. } => StatusCode::BAD_REQUEST,
            AuthzError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            AuthzError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
