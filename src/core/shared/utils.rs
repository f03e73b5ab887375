use chrono::{DateTime, SecondsFormat, Utc};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;

use crate::core::config::AppConfig;
use crate::core::error::{CoreError, CoreResult};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn(config: &AppConfig) -> CoreResult<DbPool> {
    let database_url = config
        .database_url()
        .ok_or_else(|| CoreError::validation("DATABASE_URL is not set"))?;
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .max_size(config.database.pool_size)
        .build(manager)
        .map_err(CoreError::from)
}

/// Run database migrations
pub fn run_migrations(pool: &DbPool) -> CoreResult<()> {
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| CoreError::Internal(format!("Migration error: {e}")))?;
    Ok(())
}

/// Runs a blocking diesel closure on the blocking pool with a pooled connection.
pub async fn with_conn<F, T>(pool: &DbPool, f: F) -> CoreResult<T>
where
    F: FnOnce(&mut PgConnection) -> CoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await?
}

/// Truncates to at most `max` characters, never splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// ISO-8601 UTC with an explicit `+00:00` offset.
pub fn iso_utc(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, false)
}
