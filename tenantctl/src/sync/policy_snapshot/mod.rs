//! Keeps the in-memory policy snapshot in step with the policy tables.
//!
//! Triggers on `model_policies`, `credential_groups` and `credentials` notify
//! [`POLICY_CHANGED_CHANNEL`] with a `table:epoch_micros` payload. The sync task listens on that
//! channel and reloads the whole snapshot on every notification, plus on a fallback timer so
//! that a missed notification is eventually picked up. Readers never block on a reload: the
//! new snapshot is swapped in atomically once it is fully built.

use std::sync::Arc;
use std::time::Duration;

use metrics::histogram;
use sqlx::{PgPool, postgres::PgListener};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::POLICY_CHANGED_CHANNEL;
use crate::policy::{PolicySnapshot, SnapshotPolicyStore};


const MIN_RELOAD_INTERVAL: Duration = Duration::from_millis(100);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Listener lifecycle events, for tests and observability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

pub struct SyncConfig {
    pub status_tx: Option<mpsc::Sender<SyncStatus>>,
    /// Periodic full reload independent of notifications. `None` disables it.
    pub fallback_interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            status_tx: None,
            fallback_interval: Some(Duration::from_secs(10)),
        }
    }
}

/// Split a `table:epoch_micros` payload into the table name and how long ago it was sent.
fn parse_notify_payload(payload: &str) -> Option<(&str, Duration)> {
    let (table_name, micros) = payload.split_once(':')?;
    let epoch_micros: i64 = micros.parse().ok()?;
    let now_micros = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_micros() as i64;
    let lag_micros = now_micros.saturating_sub(epoch_micros).max(0);
    Some((table_name, Duration::from_micros(lag_micros as u64)))
}

fn is_fatal(message: &str) -> bool {
    message.contains("closed pool") || message.contains("connection closed")
}

/// Reloads policy snapshots into a [`SnapshotPolicyStore`].
pub struct PolicySnapshotSync {
    db: PgPool,
    store: Arc<SnapshotPolicyStore>,
}

impl PolicySnapshotSync {
    pub fn new(db: PgPool, store: Arc<SnapshotPolicyStore>) -> Self {
        Self { db, store }
    }

    /// Load a fresh snapshot and swap it into the store.
    #[instrument(skip(self), err)]
    pub async fn reload(&self) -> anyhow::Result<()> {
        let mut conn = self.db.acquire().await?;
        let snapshot = PolicySnapshot::load(&mut conn).await?;
        debug!(
            models = snapshot.model_policy_count(),
            credentials = snapshot.credential_count(),
            "Swapping in reloaded policy snapshot"
        );
        self.store.store(snapshot);
        Ok(())
    }

    async fn send_status(config: &SyncConfig, status: SyncStatus) -> anyhow::Result<()> {
        if let Some(tx) = &config.status_tx {
            tx.send(status).await?;
        }
        Ok(())
    }

    async fn reload_counted(&self, source: &'static str) -> anyhow::Result<()> {
        match self.reload().await {
            Ok(()) => {
                metrics::counter!("tenantctl_policy_sync_total", "source" => source).increment(1);
                Ok(())
            }
            Err(e) => {
                error!("Failed to reload policy snapshot ({}): {}", source, e);
                metrics::counter!("tenantctl_policy_sync_errors_total", "source" => source).increment(1);
                Err(e)
            }
        }
    }

    /// Run until `shutdown_token` is cancelled or the pool is closed.
    ///
    /// Reloads are at least 100ms apart. A change that arrives sooner is
    /// marked pending and reloaded once the interval has passed, never dropped.
    #[instrument(skip(self, config, shutdown_token), err)]
    pub async fn start(self, config: SyncConfig, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        'outer: loop {
            Self::send_status(&config, SyncStatus::Connecting).await?;
            let mut listener = match PgListener::connect_with(&self.db).await {
                Ok(listener) => listener,
                Err(e) if is_fatal(&e.to_string()) => return Err(e.into()),
                Err(e) => {
                    warn!("Failed to connect policy listener, retrying: {}", e);
                    tokio::select! {
                        _ = shutdown_token.cancelled() => break 'outer,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue 'outer,
                    }
                }
            };
            listener.listen(POLICY_CHANGED_CHANNEL).await?;
            Self::send_status(&config, SyncStatus::Connected).await?;
            info!("Started policy snapshot listener");

            // Changes made while we were disconnected produced no notification we could see
            let mut last_reload = Instant::now();
            let mut pending = false;
            if let Err(e) = self.reload().await {
                error!("Failed to reload policy snapshot after connecting: {}", e);
            }

            let mut fallback_timer = config.fallback_interval.map(|interval| {
                let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                timer
            });

            loop {
                let debounce_deadline = last_reload + MIN_RELOAD_INTERVAL;

                tokio::select! {
                    _ = shutdown_token.cancelled() => {
                        info!("Received shutdown signal, stopping policy snapshot listener");
                        break 'outer;
                    }

                    notification = listener.try_recv() => {
                        match notification {
                            Ok(None) => {
                                info!("Policy listener connection lost, reconnecting");
                                Self::send_status(&config, SyncStatus::Disconnected).await?;
                                Self::send_status(&config, SyncStatus::Reconnecting).await?;
                                break;
                            }
                            Ok(Some(notification)) => {
                                debug!("Received notification on {} with payload {:?}", notification.channel(), notification.payload());
                                if let Some((table_name, lag)) = parse_notify_payload(notification.payload()) {
                                    histogram!("tenantctl_policy_sync_lag_seconds", "table" => table_name.to_string())
                                        .record(lag.as_secs_f64());
                                }
                                if last_reload.elapsed() < MIN_RELOAD_INTERVAL {
                                    debug!("Last reload was under {:?} ago, deferring", MIN_RELOAD_INTERVAL);
                                    pending = true;
                                    continue;
                                }

                                last_reload = Instant::now();
                                pending = false;
                                match self.reload_counted("listen_notify").await {
                                    Ok(()) => info!("Reloaded policy snapshot after {:?}", notification.payload()),
                                    Err(e) if is_fatal(&e.to_string()) => {
                                        error!("Database pool closed, exiting policy sync task");
                                        return Err(e);
                                    }
                                    Err(_) => {}
                                }
                            }
                            Err(e) => {
                                error!("Error receiving policy notification: {}", e);
                                Self::send_status(&config, SyncStatus::Disconnected).await?;
                                if is_fatal(&e.to_string()) {
                                    error!("Database connection closed, exiting policy sync task");
                                    return Err(e.into());
                                }
                                Self::send_status(&config, SyncStatus::Reconnecting).await?;
                                break;
                            }
                        }
                    }

                    _ = tokio::time::sleep_until(debounce_deadline), if pending => {
                        last_reload = Instant::now();
                        pending = false;
                        if self.reload_counted("deferred").await.is_ok() {
                            debug!("Deferred reload of policy snapshot succeeded");
                        }
                    }

                    _ = async {
                        match &mut fallback_timer {
                            Some(timer) => timer.tick().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        if last_reload.elapsed() < MIN_RELOAD_INTERVAL {
                            pending = true;
                            continue;
                        }

                        last_reload = Instant::now();
                        pending = false;
                        if self.reload_counted("fallback").await.is_ok() {
                            debug!("Fallback reload of policy snapshot succeeded");
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown_token.cancelled() => break 'outer,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }

        info!("Policy snapshot listener stopped gracefully");
        Ok(())
    }
}
