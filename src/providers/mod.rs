//! LLM provider implementations
//!
//! Every backend implements [`Provider`]. The contract is uniform whether or
//! not a backend streams natively: `generate` always returns the whole text,
//! `generate_stream` always ends with exactly one terminal [`StreamChunk`].

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, error};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::envelope::{GenerationParameters, LoadParams, Message};
use crate::error::ErrorKind;
use crate::supervisor::{ChunkSender, ChunkSink};

pub mod registry;
pub mod openai_compat;
pub mod openai;
pub mod groq;
pub mod mistral;
pub mod novelai;

// Re-export for convenience
pub use registry::{ActiveProvider, ProviderFactory, Registry};

/// One streamed fragment, or the terminal marker when `done`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk
{   pub done: bool
  , pub chunk: String
}

impl StreamChunk
{   pub fn fragment(chunk: impl Into<String>) -> Self
    {   StreamChunk
        {   done: false
          , chunk: chunk.into()
        }
    }

    pub fn end() -> Self
    {   StreamChunk
        {   done: true
          , chunk: String::new()
        }
    }
}

pub type GenerateReply = Result<String, ErrorKind>;

/// Bound on the non-generating backend calls (credential check, model
/// listing) when the provider config sets no `timeout_secs`
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability contract of a backend adapter.
///
/// Expected failures are returned as [`ErrorKind`], never raised.
///
/// A generation's interrupt token is taken with [`Provider::begin_generation`]
/// when the request is accepted, before any later `interrupt` is handled,
/// and handed to `generate` or `generate_stream`.
#[async_trait]
pub trait Provider: Send + Sync
{   /// Validate the credential with one cheap backend call
    async fn init(&self, params: &LoadParams) -> ErrorKind;

    /// Release backend resources. Idempotent.
    async fn free(&self);

    /// Interrupt token for a generation about to be accepted
    async fn begin_generation(&self) -> CancellationToken;

    /// Wait for the complete response
    async fn generate(
      &self
    , messages: &[Message]
    , params: &GenerationParameters
    , cancel: CancellationToken
    ) -> GenerateReply;

    /// Send fragments as they arrive, then exactly one terminal chunk
    async fn generate_stream(
      &self
    , messages: &[Message]
    , params: &GenerationParameters
    , cancel: CancellationToken
    , chunks: ChunkSender
    ) -> ErrorKind;

    /// Fire the token of every generation begun since the last interrupt
    async fn interrupt(&self);

    async fn get_models(&self) -> Vec<String>;
}

/// Serve a streaming request from a backend that only answers whole:
/// one fragment with the full text, then the terminal marker.
pub async fn stream_whole<P>(
  provider: &P
, messages: &[Message]
, params: &GenerationParameters
, cancel: CancellationToken
, chunks: ChunkSender
) -> ErrorKind
where
  P: Provider + ?Sized
{   let sink = ChunkSink::new(chunks);
    match provider.generate(messages, params, cancel).await
    {   Ok(text) => {
          sink.push(text);
          sink.finish(ErrorKind::Success)
        }
      , Err(kind) => sink.finish(kind)
    }
}

/// Credential and HTTP handle of an initialized adapter
#[derive(Debug, Clone)]
pub struct Session
{   pub api_key: String
  , pub http: reqwest::Client
  , pub default_model: Option<String>
  , /// Applied per request to calls that do not generate
    pub request_timeout: Duration
}

impl Session
{   /// `timeout` bounds connecting, and the whole of each non-generating
    /// request. Generations are bounded by their own `timeout_ms`.
    pub fn new(
      api_key: String
    , default_model: Option<String>
    , timeout: Option<Duration>
    ) -> Self
    {   let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout
        {   builder = builder.connect_timeout(timeout);
        }
        let http = builder.build().unwrap_or_else(|e| {
          error!("Failed to build HTTP client, using defaults: {}", e);
          reqwest::Client::new()
        });
        Session
        {   api_key
          , http
          , default_model
          , request_timeout: timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT)
        }
    }

    /// Requested model, or the one preloaded at `load` time
    pub fn model_for(&self, params: &GenerationParameters) -> String
    {   if params.model_id.is_empty()
        {   self.default_model.clone().unwrap_or_default()
        } else
        {   params.model_id.clone()
        }
    }
}

/// Connection state slot, empty until `init` succeeds
#[derive(Debug, Default)]
pub struct SessionSlot
{   inner: RwLock<Option<Session>>
}

impl SessionSlot
{   pub async fn get(&self) -> Result<Session, ErrorKind>
    {   self.inner.read().await.clone().ok_or_else(|| {
          error!("Provider used before a successful init");
          ErrorKind::Unexpected
        })
    }

    pub async fn set(&self, session: Session)
    {   *self.inner.write().await = Some(session);
    }

    pub async fn clear(&self)
    {   if self.inner.write().await.take().is_some()
        {   debug!("Session released");
        }
    }
}

/// Credential from a load request, logged when absent
pub fn require_api_key(
  provider: &str
, params: &LoadParams
) -> Result<String, ErrorKind>
{   match &params.api_key
    {   Some(key) if !key.is_empty() => Ok(key.clone())
      , _ => {
          error!(
            "Request to load {} failed, missing field \"api_key\"",
            provider
          );
          Err(ErrorKind::Authorization)
        }
    }
}

pub type SharedProvider = Arc<dyn Provider>;
