//! Composition root and HTTP server.

use crate::api::{self, AppContext};
use crate::config::ServerConfig;
use crate::Result;
use anyhow::Context;
use cronwork::repository::PostgresRepository;
use cronwork::{
    migrations, JobRepository, ResponseCache, Scheduler, SchedulerConfig, SimulatedExecutor,
    Store, StoreConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use warp::{Filter, Rejection, Reply};

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Connect the store, migrate, start the scheduler, and serve the API
    /// until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let store = Store::connect(
            StoreConfig::new(&self.config.database_url)
                .with_max_connections(self.config.pool_size),
        )
        .await
        .context("failed to connect to the database")?;

        migrations::run(&store)
            .await
            .context("failed to apply schema migrations")?;

        let repository: Arc<dyn JobRepository> =
            Arc::new(PostgresRepository::new(store.clone()));
        let cache = Arc::new(ResponseCache::new());
        let scheduler = Scheduler::new(
            repository.clone(),
            Arc::new(SimulatedExecutor::new()),
            SchedulerConfig::default(),
        );
        scheduler
            .start()
            .await
            .context("failed to start the scheduler")?;

        let ctx = AppContext {
            repository,
            scheduler: scheduler.clone(),
            cache,
            store,
            config: Arc::new(self.config.clone()),
        };
        let routes = build_routes(ctx);

        let addr: SocketAddr = self
            .config
            .bind_addr()
            .parse()
            .context("invalid bind address")?;
        info!(%addr, "control plane listening");

        let (_, serving) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        });
        serving.await;

        scheduler.stop().await;
        Ok(())
    }
}

/// Compose all routes with CORS, request logging, and error recovery.
pub fn build_routes(
    ctx: AppContext,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let production = ctx.config.is_production();

    let mut cors = warp::cors()
        .allow_headers(vec!["content-type", "authorization"])
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"]);
    if ctx.config.allowed_origins.is_empty() {
        cors = cors.allow_any_origin();
    } else {
        for origin in &ctx.config.allowed_origins {
            cors = cors.allow_origin(origin.as_str());
        }
    }

    api::jobs::routes(ctx.clone())
        .or(api::system::routes(ctx))
        .recover(move |err| api::handle_rejection(err, production))
        .with(cors)
        .with(warp::log("cronwork_web"))
}
