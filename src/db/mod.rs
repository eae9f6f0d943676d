pub mod notify;
pub mod queries;
pub mod store;

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Connection pool shared by the queue store and the ops routes.
///
/// The push strategy's LISTEN connection is checked out of this pool and held for
/// the life of the subscription, so it counts against `max_connections`.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Apply the queue schema and its notify trigger.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}
