use miette::Diagnostic;
use thiserror::Error;

/// Failures while loading settings or opening the database.
#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(arbor::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(arbor::config))]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    #[diagnostic(code(arbor::db))]
    Db(#[from] sea_orm::DbErr),
}
