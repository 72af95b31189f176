pub mod agent;
pub mod cache;
pub mod dialect;
pub mod events;
pub mod prompt;
pub mod provider;
pub mod schema;
pub mod sqlcheck;
pub mod vector;
pub mod warehouse;

pub use agent::{AgentFlow, AgentRepository, LlmClient, OpenAiCompatClient, StaleRequestMonitor};
pub use cache::{CacheHandle, CacheStore, MemoryCache, SqliteCache};
pub use dialect::Dialect;
pub use events::{AgentPhase, EventHub, SessionEvent};
pub use prompt::{AssembledPrompt, PromptAssembler};
pub use provider::{MetadataProvider, PromptBundle, ProviderInfo};
pub use schema::{SchemaDescriptor, SchemaService};
pub use sqlcheck::{SortOrder, SqlValidation, SqlValidator};
pub use vector::{EmbeddingClient, QueryExample, RelevanceService};
pub use warehouse::{Warehouse, WarehousePool};
