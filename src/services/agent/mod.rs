//! The agentic query-generation subsystem: LLM contract, persistence, the
//! repair-loop state machine, and queue workers.

pub mod flow;
pub mod llm;
pub mod repository;
pub mod worker;

pub use flow::{AgentFlow, FlowOutcome, FlowState, StepFailure};
pub use llm::{ChatMessage, LlmClient, LlmError, OpenAiCompatClient};
pub use repository::AgentRepository;
pub use worker::{QueueWorker, StaleRequestMonitor, spawn_workers};
