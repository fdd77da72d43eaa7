use sea_orm::{ConnectionTrait, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        // Connect to database
        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        // Run migrations
        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Test database that also holds the application tables the policy
    /// fixture points at, seeded with a small org/repo/issue tree.
    pub async fn with_app_tables() -> Self {
        let db = Self::new().await;
        create_app_tables(db.connection()).await;
        seed_app_rows(db.connection()).await;
        db
    }

    /// Same tree shape as `with_app_tables`, keyed by INTEGER columns.
    pub async fn with_integer_app_tables() -> Self {
        let db = Self::new().await;
        for sql in [
            "CREATE TABLE orgs (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            "CREATE TABLE repos (id INTEGER PRIMARY KEY, org_id INTEGER REFERENCES orgs(id), name TEXT NOT NULL)",
            "CREATE TABLE issues (id INTEGER PRIMARY KEY, repo_id INTEGER REFERENCES repos(id), title TEXT NOT NULL)",
            "INSERT INTO orgs (id, name) VALUES (1, 'Acme'), (2, 'Globex')",
            "INSERT INTO repos (id, org_id, name) VALUES (10, 1, 'api'), (11, 1, 'web'), (12, 2, 'infra'), (13, NULL, 'scratch')",
            "INSERT INTO issues (id, repo_id, title) VALUES (100, 10, 'crash on start'), (101, 11, 'slow login'), (102, 12, 'flaky deploy')",
        ] {
            db.connection()
                .execute_unprepared(sql)
                .await
                .expect("Failed to prepare integer-keyed tables");
        }
        db
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

async fn create_app_tables(db: &DatabaseConnection) {
    for ddl in [
        "CREATE TABLE orgs (id TEXT PRIMARY KEY, name TEXT NOT NULL)",
        "CREATE TABLE repos (id TEXT PRIMARY KEY, org_id TEXT REFERENCES orgs(id), name TEXT NOT NULL)",
        "CREATE TABLE issues (id TEXT PRIMARY KEY, repo_id TEXT REFERENCES repos(id), title TEXT NOT NULL)",
    ] {
        db.execute_unprepared(ddl)
            .await
            .expect("Failed to create application table");
    }
}

/// ```text
/// o1 ── r1 ── i1
///   └── r2
/// o2 ── r3 ── i2
/// (no org) r4
/// ```
async fn seed_app_rows(db: &DatabaseConnection) {
    for dml in [
        "INSERT INTO orgs (id, name) VALUES ('o1', 'Acme'), ('o2', 'Globex')",
        "INSERT INTO repos (id, org_id, name) VALUES ('r1', 'o1', 'api'), ('r2', 'o1', 'web'), ('r3', 'o2', 'infra'), ('r4', NULL, 'scratch')",
        "INSERT INTO issues (id, repo_id, title) VALUES ('i1', 'r1', 'crash on start'), ('i2', 'r3', 'flaky deploy')",
    ] {
        db.execute_unprepared(dml)
            .await
            .expect("Failed to seed application rows");
    }
}
