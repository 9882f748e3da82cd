//! # tenantctl: group-scoped credential selection and quota deduction
//!
//! `tenantctl` is the billing core of a multi-tenant API proxy. For every proxied request it
//! answers two questions that must agree with each other:
//!
//! 1. **Which upstream credential may this caller use?** The [`selector`] resolves the caller's
//!    access and billing groups, rejects models the caller's groups may not request, and picks
//!    the first candidate credential whose credential group admits the caller and whose rate
//!    limit has room. It records the group the request is billed against in the request's
//!    [`AccessMetadata`](selector::AccessMetadata).
//! 2. **Which balance pays for it?** After the upstream call, the [`quota`] engine charges the
//!    computed cost to a subscription bill or prepaid card belonging to exactly that billing
//!    group, with a single conditional update per attempt so concurrent requests can never
//!    overdraft a balance.
//!
//! ## Architecture
//!
//! PostgreSQL (via sqlx) holds memberships, policies and balances. Access policies are read from
//! an in-memory [`PolicySnapshot`](policy::PolicySnapshot) that the [`sync`] task reloads on
//! LISTEN/NOTIFY, so selection never waits on policy queries. Membership is looked up per
//! request through [`MembershipResolver`](membership::MembershipResolver). Rate limiting is an
//! in-process sliding window per credential group ([`limits`]).
//!
//! HTTP routing is left to the embedding proxy; [`AppState`] carries everything a handler needs
//! and [`errors::Error`] converts into axum responses.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use tenantctl::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = tenantctl::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     tenantctl::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Database Setup
//!
//! Migrations are embedded and run by [`Application::new`]. To run them yourself:
//!
//! ```no_run
//! # use sqlx::PgPool;
//! # async fn example(pool: PgPool) -> Result<(), sqlx::migrate::MigrateError> {
//! tenantctl::migrator().run(&pool).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod errors;
pub mod limits;
pub mod membership;
pub mod policy;
pub mod quota;
pub mod selector;
pub mod sync;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::Arc;

use bon::Builder;
use sqlx::PgPool;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

pub use config::Config;
pub use errors::{Error, Result};
pub use types::{BillId, CredentialGroupId, GroupId, PrepaidCardId, UserId};

use crate::limits::CredentialGroupRateLimiter;
use crate::membership::PgMembershipResolver;
use crate::policy::{PolicySnapshot, SnapshotPolicyStore};
use crate::quota::QuotaEngine;
use crate::selector::Selector;
use crate::sync::{PolicySnapshotSync, SyncConfig};

/// Shared state for an embedding request handler.
///
/// ```ignore
/// let state = AppState::builder()
///     .db(pool)
///     .config(config)
///     .policies(store)
///     .selector(selector)
///     .quota(QuotaEngine::new(pool.clone()))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub policies: Arc<SnapshotPolicyStore>,
    pub selector: Selector,
    pub quota: QuotaEngine,
    pub rate_limiter: Option<Arc<CredentialGroupRateLimiter>>,
}

/// Get the tenantctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Background tasks started alongside the application.
///
/// Dropping this cancels the shutdown token through `drop_guard`, signalling every task to stop.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }

    pub fn task_count(&self) -> usize {
        self.background_tasks.len()
    }
}

fn setup_background_services(
    pool: PgPool,
    store: Arc<SnapshotPolicyStore>,
    config: &Config,
    shutdown_token: CancellationToken,
) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if config.policy_sync.enabled {
        let sync = PolicySnapshotSync::new(pool, store);
        let sync_config = SyncConfig {
            status_tx: None,
            fallback_interval: Some(config.policy_sync.fallback_interval),
        };
        let token = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            if let Err(e) = sync.start(sync_config, token).await {
                error!("Policy snapshot sync stopped with error: {}", e);
            }
        }));
        info!("Started policy snapshot sync");
    } else {
        info!("Policy snapshot sync disabled, policies are loaded once at startup");
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Main application: database pool, loaded policies, selector, quota engine and the tasks
/// keeping them fresh.
///
/// 1. **Create**: [`Application::new`] connects, runs migrations, loads the policy snapshot and
///    starts background services
/// 2. **Serve**: [`Application::serve`] runs until the shutdown future resolves
/// 3. **Shutdown**: background tasks are stopped, the pool closed and telemetry flushed
pub struct Application {
    app_state: AppState,
    pool: PgPool,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::new_with_pool(config, None).await
    }

    /// Like [`new`](Self::new), reusing `pool` when given instead of connecting.
    pub async fn new_with_pool(config: Config, pool: Option<PgPool>) -> anyhow::Result<Self> {
        debug!("Starting tenantctl with configuration: {:#?}", config);

        let pool = match pool {
            Some(pool) => pool,
            None => config.database.pool.pool_options().connect(&config.database.url).await?,
        };
        migrator().run(&pool).await?;

        let snapshot = {
            let mut conn = pool.acquire().await?;
            PolicySnapshot::load(&mut conn).await?
        };
        info!(
            models = snapshot.model_policy_count(),
            credentials = snapshot.credential_count(),
            "Loaded initial policy snapshot"
        );
        let store = Arc::new(SnapshotPolicyStore::new(snapshot));

        let rate_limiter = CredentialGroupRateLimiter::from_config(&config.rate_limit).map(Arc::new);
        let selector = Selector::builder()
            .resolver(Arc::new(PgMembershipResolver::new(pool.clone())))
            .policies(store.clone())
            .maybe_rate_limiter(rate_limiter.clone())
            .build();

        let shutdown_token = CancellationToken::new();
        let bg_services = setup_background_services(pool.clone(), store.clone(), &config, shutdown_token);

        let app_state = AppState::builder()
            .db(pool.clone())
            .config(config)
            .policies(store)
            .selector(selector)
            .quota(QuotaEngine::new(pool.clone()))
            .maybe_rate_limiter(rate_limiter)
            .build();

        Ok(Self {
            app_state,
            pool,
            bg_services,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    pub fn background_services(&self) -> &BackgroundServices {
        &self.bg_services
    }

    /// Run until `shutdown` resolves, then stop background tasks and release resources.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("tenantctl running");
        shutdown.await;

        info!("Stopping background services...");
        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.pool.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
