use crate::entities::scans;
use crate::services::scan_store::SeaOrmScanStore;
use anyhow::Context;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Schema};
use std::env;
use std::time::Duration;
use tracing::info;

pub fn database_url() -> anyhow::Result<String> {
    env::var("DATABASE_URL").context("DATABASE_URL must be set")
}

pub async fn setup_database(db_url: &str) -> anyhow::Result<DatabaseConnection> {
    info!("📂 Database: {}", db_url);

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(10)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    info!("✅ Database connected successfully");

    run_migrations(&db).await?;

    Ok(db)
}

pub async fn run_migrations(db: &DatabaseConnection) -> anyhow::Result<()> {
    let builder = db.get_database_backend();

    if builder == DbBackend::Postgres {
        info!("🔄 Running SQLx migrations for PostgreSQL...");
        sqlx::migrate!("./migrations")
            .run(db.get_postgres_connection_pool())
            .await
            .context("PostgreSQL migrations failed")?;
        return Ok(());
    }

    // No triggers here, so SQLite has no change feed
    info!("🔄 Running SeaORM auto-migrations for SQLite/Other...");
    let schema = Schema::new(builder);
    let stmt = schema
        .create_table_from_entity(scans::Entity)
        .if_not_exists()
        .to_owned();
    db.execute(builder.build(&stmt)).await?;

    db.execute(sea_orm::Statement::from_string(
        builder,
        "CREATE INDEX IF NOT EXISTS idx_scans_user_created ON scans(user_id, created_at DESC);"
            .to_string(),
    ))
    .await?;

    Ok(())
}

/// Scan store over `db`, with the change feed attached when the database can provide one
pub fn scan_store(db: DatabaseConnection, db_url: &str) -> SeaOrmScanStore {
    let store = SeaOrmScanStore::new(db);
    if db_url.starts_with("postgres") {
        store.with_change_feed(db_url)
    } else {
        store
    }
}
