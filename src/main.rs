use std::sync::Arc;

use arbor::authz::engine::Authorizer;
use arbor::authz::loader::KdlDirectory;
use arbor::{settings, storage, web};
use clap::Parser;
use miette::Result;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "arbor",
    version,
    about = "Hierarchical role-based authorization service"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database + migrations)
    let db = storage::init(&settings.database).await?;

    let source = Arc::new(KdlDirectory::new(&settings.authz.policies_dir));
    let authz = Arc::new(Authorizer::new(db, source, settings.authz.options()));

    // compile once at startup; later recompiles go through POST /v1/compile
    if settings.authz.policies_dir.is_dir() {
        authz.compile().await?;
    } else {
        tracing::warn!(
            dir = %settings.authz.policies_dir.display(),
            "Policies directory not found; authorization stays unconfigured until a compile succeeds"
        );
    }

    web::serve(settings, authz).await?;
    Ok(())
}
