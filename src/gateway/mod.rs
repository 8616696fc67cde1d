//! Gateway server for memproxy
//!
//! Serves the OpenAI-compatible proxy endpoint and owns the lifecycle of
//! the memory store and background ingestion workers.

mod handler;
pub mod orchestrator;
mod server;
pub mod stream;

pub use handler::{proxy_router, ProxyState, MEMORIES_HEADER};
pub use orchestrator::{Orchestrator, ProxyRequest, ProxyStage, CONVERSATION_HEADER};
pub use server::{Gateway, GatewayBuilder, GatewayState, GatewayStatus};
