pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;

use std::sync::Arc;

use config::AppConfig;
use db::DbPool;
use engine::adapter::HttpStepAdapter;
use engine::dedup::ErrorDeduplicationService;
use engine::runner::{RunnerConfig, ScenarioRunner};
use engine::scenario::ScenarioCatalog;
use error::AppError;

/// Process-wide services, built once at startup and shared by reference.
pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    /// Owns the background queue used for deferred similarity searches.
    pub dedup: ErrorDeduplicationService,
    pub runner: Arc<ScenarioRunner>,
}

impl AppState {
    /// Open the database and wire the runner, dedup service and queue together.
    pub fn init(config: AppConfig, catalog: ScenarioCatalog) -> Result<Self, AppError> {
        let db = db::init_db(&config.database_path)?;
        Self::with_pool(db, config, catalog)
    }

    pub fn with_pool(db: DbPool, config: AppConfig, catalog: ScenarioCatalog) -> Result<Self, AppError> {
        let scenarios = catalog.len();
        let dedup = ErrorDeduplicationService::with_background_queue(db.clone());
        let adapter = Arc::new(HttpStepAdapter::new()?);
        let runner = ScenarioRunner::new(db.clone(), adapter, RunnerConfig::from(&config))
            .with_dedup(dedup.clone())
            .with_catalog(catalog);

        tracing::debug!(
            project = %config.project_name,
            scenarios,
            "Application state ready",
        );

        Ok(Self {
            db,
            config,
            dedup,
            runner: Arc::new(runner),
        })
    }
}
