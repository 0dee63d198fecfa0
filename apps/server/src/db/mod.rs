//! Access to importer-produced SQLite stores.
//!
//! Importers build one SQLite file per vocabulary; the server opens them
//! read-only at startup and treats the schemas as owned by the importer.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Open a vocabulary store read-only.
pub async fn open_store(path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
        .map_err(sqlx::Error::from)?
        .read_only(true)
        .create_if_missing(false);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    Ok(pool)
}
