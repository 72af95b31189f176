//! Vega Library
//!
//! Core modules of the Vega natural-language-to-SQL orchestration engine.

use sqlx::SqlitePool;
use std::sync::Arc;

pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use services::{
    AgentFlow, AgentRepository, CacheHandle, EventHub, MetadataProvider, PromptAssembler,
    RelevanceService, SchemaService, SqlValidator, WarehousePool,
};
pub use utils::JwtUtil;

/// Application shared state
///
/// Design Philosophy: Keep it simple - Rust's type system IS our DI container.
/// All services are wrapped in Arc for cheap cloning and thread safety.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Arc<Config>,

    pub jwt_util: Arc<JwtUtil>,
    pub repository: Arc<AgentRepository>,
    pub warehouses: Arc<WarehousePool>,
    pub events: Arc<EventHub>,
    pub provider: Arc<MetadataProvider>,
}
