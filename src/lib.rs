//! llmgate: a local WebSocket gateway in front of hosted LLM APIs.
//!
//! A client connects to `ws://127.0.0.1:7562`, loads one provider with its
//! API key, then issues generations. Each request carries a client-chosen
//! `unique_request_id`; every acknowledgement, stream chunk and terminal
//! event for it echoes that id, so many operations can share the socket.
//!
//! ```text
//! src/
//! ├── lib.rs          # Re-exports
//! ├── error.rs        # Wire error kinds and the crate error
//! ├── config.rs       # Gateway and per-provider settings
//! ├── envelope.rs     # Request and response frames
//! ├── supervisor.rs   # Ack timeout, completion timeout, interrupts
//! ├── providers/      # Provider trait, registry and backends
//! ├── dispatcher.rs   # Server-side routing
//! ├── server.rs       # WebSocket listener
//! └── client.rs       # Client with request correlation
//! ```

pub mod error;
pub mod config;
pub mod envelope;
pub mod supervisor;
pub mod providers;
pub mod dispatcher;
pub mod server;
pub mod client;

pub use client::GatewayClient;
pub use config::{GatewayConfig, ProviderConfig, DEFAULT_PORT};
pub use envelope::{
  GenerationParameters, LoadParams, Message, Request, Response, Role,
  StopTokens,
};
pub use error::{Error, ErrorKind};
pub use providers::{Provider, Registry};
pub use server::Server;
