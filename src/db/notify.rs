use async_trait::async_trait;
use sqlx::postgres::PgListener;

use crate::db::queries::PgJobStore;
use crate::db::store::{PushSource, StoreError, WakeEvent, WakeSubscription};

/// Channel the `alert_jobs_notify` trigger publishes on.
pub const ALERT_CHANNEL: &str = "alert_jobs";
/// Payload of the liveness heartbeat sent by [`PushSource::heartbeat`].
pub const HEARTBEAT_PAYLOAD: &str = "heartbeat";

/// Dedicated LISTEN connection; dropped (and the connection closed) on resubscribe.
struct PgWakeSubscription {
    listener: PgListener,
}

#[async_trait]
impl WakeSubscription for PgWakeSubscription {
    async fn recv(&mut self) -> Result<Option<WakeEvent>, StoreError> {
        let Some(notification) = self.listener.try_recv().await? else {
            return Ok(None);
        };

        Ok(Some(match notification.payload() {
            HEARTBEAT_PAYLOAD => WakeEvent::Heartbeat,
            payload => WakeEvent::Job(payload.to_string()),
        }))
    }
}

#[async_trait]
impl PushSource for PgJobStore {
    async fn subscribe(&self) -> Result<Box<dyn WakeSubscription>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(ALERT_CHANNEL).await?;
        tracing::debug!(channel = ALERT_CHANNEL, "Listening for alert job notifications");
        Ok(Box::new(PgWakeSubscription { listener }))
    }

    async fn heartbeat(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(ALERT_CHANNEL)
            .bind(HEARTBEAT_PAYLOAD)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
