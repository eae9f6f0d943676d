use sqlx::PgPool;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::{self, queries::PgJobStore};
use crate::services::{
    delivery::{DeliveryError, HttpSender, Sender, SimSender},
    dispatcher::DispatchContext,
    storage::{ObjectStore, StorageError},
};

/// Long-lived shared resources: the database pool, the object store and the
/// outbound HTTP client. Route handlers and the dispatcher both borrow from here.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub storage: Arc<ObjectStore>,
    pub jobs: Arc<PgJobStore>,
    pub sender: Arc<dyn Sender>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: ObjectStore,
        jobs: PgJobStore,
        sender: Arc<dyn Sender>,
    ) -> Self {
        Self {
            db,
            storage: Arc::new(storage),
            jobs: Arc::new(jobs),
            sender,
        }
    }

    /// Connect the pool and build every client named in the configuration.
    pub async fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        tracing::info!("Connecting to PostgreSQL database");
        let db_pool = db::init_pool(&config.database_url).await?;

        tracing::info!(bucket = %config.s3_bucket, "Initializing object storage client");
        let storage = ObjectStore::new(
            &config.s3_bucket,
            &config.s3_endpoint,
            &config.s3_region,
            &config.s3_access_key,
            &config.s3_secret_key,
        )?;

        let sender: Arc<dyn Sender> = if config.alert_simulate {
            tracing::warn!("ALERT_SIMULATE is set, plate hits will only be logged");
            Arc::new(SimSender {
                fail_odd_reads: config.alert_simulate_fail_odd,
            })
        } else {
            tracing::info!(url = %config.alert_url, "Initializing alert sender");
            Arc::new(HttpSender::new(&config.sender_settings())?)
        };

        let jobs = PgJobStore::new(db_pool.clone(), config.retry_policy(), config.lease());

        Ok(Self::new(db_pool, storage, jobs, sender))
    }

    pub fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            store: self.jobs.clone(),
            presigner: self.storage.clone(),
            sender: self.sender.clone(),
        }
    }

    /// Close the pool once every user has stopped; the HTTP client's pool is
    /// released when the last sender handle drops.
    pub async fn shutdown(self) {
        self.db.close().await;
        tracing::info!("Database pool closed");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}
