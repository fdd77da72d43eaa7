use std::net::SocketAddr;
use std::sync::Arc;

use miette::{IntoDiagnostic, Result};

use crate::authz::engine::Authorizer;
use crate::settings::Settings;

/// Serve the authorization API until the listener fails.
pub async fn serve(settings: Settings, authz: Arc<Authorizer>) -> Result<()> {
    let addr: SocketAddr = settings
        .bind_addr()
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let router = crate::authz::web::router(authz);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%addr, "Authorization API listening");
    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}
