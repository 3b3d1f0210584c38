use crate::config::ClientConfig;
use crate::error::AppError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::info;

fn resolve_db_path(config: &ClientConfig) -> Result<PathBuf, AppError> {
    std::fs::create_dir_all(&config.data_dir)?;
    Ok(config.db_path())
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn initialize_pool(config: &ClientConfig) -> Result<SqlitePool, AppError> {
    let db_path = resolve_db_path(config)?;
    let pool = initialize_pool_from_path(&db_path).await?;
    info!(path = %db_path.display(), "auction database ready");
    Ok(pool)
}
