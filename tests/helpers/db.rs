use portcullis::audit::AuditSink;
use portcullis::authz::engine::AuthorizationChecker;
use portcullis::authz::store::PolicyStore;
use portcullis::authz::sync::Synchronizer;
use portcullis::settings::Settings;
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let connection = connect(&temp_file).await;

        // Run migrations
        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// A second, independent connection to the same file, as a restarted
    /// process would open it.
    pub async fn reconnect(&self) -> DatabaseConnection {
        connect(&self.temp_file).await
    }
}

async fn connect(temp_file: &NamedTempFile) -> DatabaseConnection {
    let db_path = temp_file.path().to_str().expect("Invalid temp file path");
    let db_url = format!("sqlite://{}?mode=rwc", db_path);
    Database::connect(&db_url)
        .await
        .expect("Failed to connect to test database")
}

/// Write and read paths sharing one policy store
pub struct Engine {
    pub store: Arc<PolicyStore>,
    pub sync: Arc<Synchronizer>,
    pub checker: Arc<AuthorizationChecker>,
}

/// Load the store from `db`, bootstrap the super-admin and wire a checker.
pub async fn engine(db: &DatabaseConnection, settings: &Settings) -> Engine {
    let store = Arc::new(
        PolicyStore::load(db.clone())
            .await
            .expect("Failed to load policy store"),
    );
    let sync = Arc::new(Synchronizer::new(
        db.clone(),
        store.clone(),
        AuditSink::disabled(),
        settings,
    ));
    sync.bootstrap().await.expect("Failed to bootstrap");
    let checker = Arc::new(AuthorizationChecker::new(store.clone(), AuditSink::disabled(), settings));
    Engine {
        store,
        sync,
        checker,
    }
}
