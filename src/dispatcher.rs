//! Server-side request routing
//!
//! Validated requests are matched to the active provider. `interrupt`,
//! `close` and `get_providers` are answered inline. `load`, `get_models` and
//! each `generate` run as tasks, so the reader keeps handling frames while a
//! backend is slow. A generation's interrupt token is taken before its task
//! is spawned, so an `interrupt` read right after it always reaches it.

use std::collections::HashSet;
use std::sync::Arc;
use log::{debug, error, info, trace};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::envelope::{
  parse_request, GenerationParameters, LoadParams, Message, Request, Response,
};
use crate::error::ErrorKind;
use crate::providers::{ActiveProvider, Registry, SharedProvider};

/// Outbound frame queue of one connection, drained by a single writer
pub type Outbox = mpsc::UnboundedSender<Response>;

/// What the connection loop does after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow
{   Continue
  , Close
}

fn send(outbox: &Outbox, response: Response)
{   trace!(
      "Queueing {:?} for {}",
      response.kind(),
      response.request_id()
    );
    if outbox.send(response).is_err()
    {   debug!("Outbox closed, response dropped");
    }
}

/// Routes requests of the current connection to the loaded provider.
///
/// The loaded provider outlives connections; in-flight requests do not.
pub struct Dispatcher
{   registry: Arc<Registry>
  , active: Arc<ActiveProvider>
  , in_flight: Arc<Mutex<HashSet<String>>>
  , tasks: JoinSet<()>
}

impl Dispatcher
{   pub fn new(registry: Registry) -> Self
    {   Dispatcher
        {   registry: Arc::new(registry)
          , active: Arc::new(ActiveProvider::new())
          , in_flight: Arc::new(Mutex::new(HashSet::new()))
          , tasks: JoinSet::new()
        }
    }

    pub async fn active_provider(&self) -> Option<String>
    {   self.active.name().await
    }

    /// Parse one text frame and route it. Malformed frames are dropped.
    pub async fn handle_frame(&mut self, text: &str, outbox: &Outbox) -> Flow
    {   match parse_request(text)
        {   Ok(request) => self.handle(request, outbox).await
          , Err(e) => {
              error!("{}", e);
              Flow::Continue
            }
        }
    }

    pub async fn handle(&mut self, request: Request, outbox: &Outbox) -> Flow
    {   debug!(
          "Handling {} request {}",
          request.type_name(),
          request.request_id()
        );
        match request
        {   Request::Load
            {   unique_request_id
              , provider
              , api_key
              , preload_model_id
            } => {
              send(outbox, Response::LoadAck
              {   unique_request_id: unique_request_id.clone()
                , provider: provider.clone()
              });
              let params = LoadParams
              {   api_key
                , preload_model_id
              };
              let registry = self.registry.clone();
              let active = self.active.clone();
              let outbox = outbox.clone();
              self.tasks.spawn(async move {
                let outcome = registry
                  .load_provider(&active, &provider, &params)
                  .await;
                send(&outbox, Response::load_done(&unique_request_id, &provider, outcome));
              });
            }
          , Request::Generate
            {   unique_request_id
              , messages
              , params
              , stream
            } => {
              self.start_generation(unique_request_id, messages, params, stream, outbox)
                .await;
            }
          , Request::Interrupt { unique_request_id } => {
              send(outbox, Response::InterruptAck { unique_request_id });
              match self.active.adapter().await
              {   Some(adapter) => adapter.interrupt().await
                , None => debug!("Interrupt with no provider loaded")
              }
            }
          , Request::Close { unique_request_id } => {
              info!("Close requested");
              send(outbox, Response::CloseAck { unique_request_id });
              return Flow::Close;
            }
          , Request::GetProviders { unique_request_id } => {
              send(outbox, Response::GetProvidersDone
              {   unique_request_id
                , providers: self.registry.provider_names()
              });
            }
          , Request::GetModels { unique_request_id } => {
              let adapter = self.active.adapter().await;
              let outbox = outbox.clone();
              self.tasks.spawn(async move {
                let models = match adapter
                {   Some(adapter) => adapter.get_models().await
                  , None => vec![]
                };
                send(&outbox, Response::GetModelsDone
                {   unique_request_id
                  , models
                });
              });
            }
        }
        Flow::Continue
    }

    async fn start_generation(
      &mut self
    , id: String
    , messages: Vec<Message>
    , params: GenerationParameters
    , stream: bool
    , outbox: &Outbox
    )
    {   let Some(adapter) = self.active.adapter().await else
        {   error!("Generate request {} received with no provider loaded", id);
            return;
        };
        if !self.in_flight.lock().await.insert(id.clone())
        {   error!("Generate request {} is already in flight, dropping", id);
            return;
        }

        let cancel = adapter.begin_generation().await;
        send(outbox, Response::GenerateAck { unique_request_id: id.clone() });

        let in_flight = self.in_flight.clone();
        let outbox = outbox.clone();
        self.tasks.spawn(async move {
          let done = generation(adapter, &id, messages, params, stream, cancel, &outbox)
            .await;
          in_flight.lock().await.remove(&id);
          send(&outbox, done);
        });
    }

    /// Abort the requests of a connection that went away
    pub async fn disconnect(&mut self)
    {   if !self.tasks.is_empty()
        {   debug!("Aborting {} in-flight request(s)", self.tasks.len());
        }
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.in_flight.lock().await.clear();
    }

    /// Abort everything and free the loaded provider
    pub async fn shutdown(&mut self)
    {   self.disconnect().await;
        self.registry.unload(&self.active).await;
    }
}

/// Run one generation and build its terminal envelope
async fn generation(
  adapter: SharedProvider
, id: &str
, messages: Vec<Message>
, params: GenerationParameters
, stream: bool
, cancel: CancellationToken
, outbox: &Outbox
) -> Response
{   if messages.is_empty()
    {   error!("Generate request {} has no messages", id);
        return if stream
        {   Response::generate_stream_done(id, ErrorKind::InvalidPrompt)
        } else
        {   Response::generate_done(id, Err(ErrorKind::InvalidPrompt))
        };
    }

    if !stream
    {   let result = adapter.generate(&messages, &params, cancel).await;
        return Response::generate_done(id, result);
    }

    let (chunks_tx, mut chunks_rx) = mpsc::unbounded_channel();
    let produce = adapter.generate_stream(&messages, &params, cancel, chunks_tx);
    let forward = async {
      while let Some(chunk) = chunks_rx.recv().await
      {   if chunk.done
          {   break;
          }
          send(outbox, Response::GenerateStreamChunk
          {   unique_request_id: id.to_string()
            , chunk: chunk.chunk
          });
      }
    };
    let (outcome, ()) = tokio::join!(produce, forward);
    Response::generate_stream_done(id, outcome)
}

#[cfg(test)]
mod tests
{   use super::*;
    use async_trait::async_trait;
    use crate::config::GatewayConfig;
    use crate::envelope::ResponseKind;
    use std::time::Duration;
    use crate::providers::{GenerateReply, Provider};
    use crate::supervisor::{Cancellation, ChunkSender, ChunkSink, InterruptSignal, Watch};

    /// Echoes the prompt back. Messages reading `wait` park the generation
    /// until it is interrupted, or one minute passes.
    #[derive(Default)]
    struct Echo
    {   signal: InterruptSignal
    }

    #[async_trait]
    impl Provider for Echo
    {   async fn init(&self, params: &LoadParams) -> ErrorKind
        {   match params.api_key
            {   Some(_) => ErrorKind::Success
              , None => ErrorKind::Authorization
            }
        }

        async fn free(&self) {}

        async fn begin_generation(&self) -> CancellationToken
        {   self.signal.begin().await
        }

        async fn generate(
          &self
        , messages: &[Message]
        , _params: &GenerationParameters
        , cancel: CancellationToken
        ) -> GenerateReply
        {   if messages.iter().any(|m| m.content == "wait")
            {   let watch = Watch::new(cancel, Cancellation::Abortable, Some(60_000));
                watch.call(std::future::pending::<()>()).await?;
            }
            Ok(messages.iter().map(|m| m.content.as_str()).collect())
        }

        async fn generate_stream(
          &self
        , messages: &[Message]
        , _params: &GenerationParameters
        , _cancel: CancellationToken
        , chunks: ChunkSender
        ) -> ErrorKind
        {   let sink = ChunkSink::new(chunks);
            for message in messages
            {   sink.push(message.content.clone());
            }
            sink.finish(ErrorKind::Success)
        }

        async fn interrupt(&self)
        {   self.signal.interrupt().await;
        }

        async fn get_models(&self) -> Vec<String>
        {   vec!["echo-1".to_string()]
        }
    }

    /// Never answers `get_models`, nor `init` when `hang_init` is set
    struct Stuck
    {   hang_init: bool
    }

    #[async_trait]
    impl Provider for Stuck
    {   async fn init(&self, _params: &LoadParams) -> ErrorKind
        {   if self.hang_init
            {   std::future::pending::<()>().await;
            }
            ErrorKind::Success
        }

        async fn free(&self) {}

        async fn begin_generation(&self) -> CancellationToken
        {   CancellationToken::new()
        }

        async fn generate(
          &self
        , _messages: &[Message]
        , _params: &GenerationParameters
        , _cancel: CancellationToken
        ) -> GenerateReply
        {   std::future::pending().await
        }

        async fn generate_stream(
          &self
        , _messages: &[Message]
        , _params: &GenerationParameters
        , _cancel: CancellationToken
        , _chunks: ChunkSender
        ) -> ErrorKind
        {   std::future::pending().await
        }

        async fn interrupt(&self) {}

        async fn get_models(&self) -> Vec<String>
        {   std::future::pending().await
        }
    }

    fn dispatcher() -> Dispatcher
    {   let mut registry = Registry::new(GatewayConfig::default());
        registry.register("echo", |_| Arc::new(Echo::default()));
        registry.register("stuck", |_| Arc::new(Stuck { hang_init: false }));
        registry.register("unreachable", |_| Arc::new(Stuck { hang_init: true }));
        Dispatcher::new(registry)
    }

    async fn load(dispatcher: &mut Dispatcher, outbox: &Outbox)
    {   dispatcher.handle_frame(
          r#"{"type":"load","unique_request_id":"l","provider":"echo","api_key":"k"}"#,
          outbox
        ).await;
    }

    fn generate_frame(id: &str, stream: bool, messages: &str) -> String
    {   format!(
          r#"{{"type":"generate","unique_request_id":"{}","stream":{},"messages":{},
              "params":{{"model_id":"","character_name":"AI","temperature":1.0,
              "max_output_length":10,"stop_tokens":null,"timeout_ms":null}}}}"#,
          id, stream, messages
        )
    }

    async fn collect_until(
      rx: &mut mpsc::UnboundedReceiver<Response>
    , last: ResponseKind
    ) -> Vec<Response>
    {   let mut out = vec![];
        while let Some(response) = rx.recv().await
        {   let kind = response.kind();
            out.push(response);
            if kind == last
            {   break;
            }
        }
        out
    }

    #[tokio::test]
    async fn load_is_acked_then_done()
    {   let (outbox, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = dispatcher();
        load(&mut dispatcher, &outbox).await;
        let responses = collect_until(&mut rx, ResponseKind::LoadDone).await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].kind(), ResponseKind::LoadAck);
        assert_eq!(responses[1].error(), Some(ErrorKind::Success));
        assert_eq!(dispatcher.active_provider().await.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn stream_chunks_precede_done()
    {   let (outbox, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = dispatcher();
        load(&mut dispatcher, &outbox).await;
        collect_until(&mut rx, ResponseKind::LoadDone).await;

        let frame = generate_frame(
          "g",
          true,
          r#"[{"role":"user","content":"a"},{"role":"user","content":"b"}]"#
        );
        dispatcher.handle_frame(&frame, &outbox).await;
        let responses = collect_until(&mut rx, ResponseKind::GenerateStreamDone).await;
        let kinds: Vec<_> = responses.iter().map(Response::kind).collect();
        assert_eq!(kinds, vec![
          ResponseKind::GenerateAck
        , ResponseKind::GenerateStreamChunk
        , ResponseKind::GenerateStreamChunk
        , ResponseKind::GenerateStreamDone
        ]);
        assert_eq!(responses[3].error(), Some(ErrorKind::Success));
    }

    #[tokio::test]
    async fn empty_prompt_is_acked_and_rejected()
    {   let (outbox, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = dispatcher();
        load(&mut dispatcher, &outbox).await;
        collect_until(&mut rx, ResponseKind::LoadDone).await;

        dispatcher.handle_frame(&generate_frame("e", false, "[]"), &outbox).await;
        let responses = collect_until(&mut rx, ResponseKind::GenerateDone).await;
        assert_eq!(responses[0].kind(), ResponseKind::GenerateAck);
        assert_eq!(responses[1].error(), Some(ErrorKind::InvalidPrompt));
    }

    #[tokio::test]
    async fn generate_without_provider_is_silent()
    {   let (outbox, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = dispatcher();
        let frame = generate_frame("g", false, r#"[{"role":"user","content":"a"}]"#);
        assert_eq!(dispatcher.handle_frame(&frame, &outbox).await, Flow::Continue);
        dispatcher.handle_frame(
          r#"{"type":"get_models","unique_request_id":"m"}"#,
          &outbox
        ).await;
        match rx.recv().await
        {   Some(Response::GetModelsDone { unique_request_id, models }) => {
              assert_eq!(unique_request_id, "m");
              assert!(models.is_empty());
            }
          , other => panic!("unexpected response: {:?}", other)
        }
    }

    #[tokio::test]
    async fn interrupt_right_after_generate_reaches_it()
    {   let (outbox, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = dispatcher();
        load(&mut dispatcher, &outbox).await;
        collect_until(&mut rx, ResponseKind::LoadDone).await;

        let frame = generate_frame("w", false, r#"[{"role":"user","content":"wait"}]"#);
        dispatcher.handle_frame(&frame, &outbox).await;
        dispatcher.handle_frame(
          r#"{"type":"interrupt","unique_request_id":"i"}"#,
          &outbox
        ).await;

        let responses = collect_until(&mut rx, ResponseKind::GenerateDone).await;
        let kinds: Vec<_> = responses.iter().map(Response::kind).collect();
        assert_eq!(kinds, vec![
          ResponseKind::GenerateAck
        , ResponseKind::InterruptAck
        , ResponseKind::GenerateDone
        ]);
        assert_eq!(responses[2].error(), Some(ErrorKind::Interrupt));

        dispatcher.handle_frame(
          &generate_frame("n", false, r#"[{"role":"user","content":"next"}]"#),
          &outbox
        ).await;
        let responses = collect_until(&mut rx, ResponseKind::GenerateDone).await;
        assert_eq!(responses[1].error(), Some(ErrorKind::Success));
    }

    async fn frame_each(dispatcher: &mut Dispatcher, outbox: &Outbox, frames: &[&str]) -> Flow
    {   let mut flow = Flow::Continue;
        for frame in frames
        {   flow = dispatcher.handle_frame(frame, outbox).await;
        }
        flow
    }

    const WHILE_BUSY: [&str; 3] = [
      r#"{"type":"get_providers","unique_request_id":"p"}"#
    , r#"{"type":"interrupt","unique_request_id":"i"}"#
    , r#"{"type":"close","unique_request_id":"c"}"#
    ];

    #[tokio::test(start_paused = true)]
    async fn hanging_load_does_not_block_other_requests()
    {   let (outbox, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = dispatcher();
        dispatcher.handle_frame(
          r#"{"type":"load","unique_request_id":"l","provider":"unreachable","api_key":"k"}"#,
          &outbox
        ).await;
        assert_eq!(frame_each(&mut dispatcher, &outbox, &WHILE_BUSY).await, Flow::Close);

        let responses = collect_until(&mut rx, ResponseKind::CloseAck).await;
        let kinds: Vec<_> = responses.iter().map(Response::kind).collect();
        assert_eq!(kinds, vec![
          ResponseKind::LoadAck
        , ResponseKind::GetProvidersDone
        , ResponseKind::InterruptAck
        , ResponseKind::CloseAck
        ]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        dispatcher.shutdown().await;
        assert_eq!(dispatcher.active_provider().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_model_listing_does_not_block_other_requests()
    {   let (outbox, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = dispatcher();
        dispatcher.handle_frame(
          r#"{"type":"load","unique_request_id":"l","provider":"stuck","api_key":"k"}"#,
          &outbox
        ).await;
        let loaded = collect_until(&mut rx, ResponseKind::LoadDone).await;
        assert_eq!(loaded[1].error(), Some(ErrorKind::Success));

        dispatcher.handle_frame(
          r#"{"type":"get_models","unique_request_id":"m"}"#,
          &outbox
        ).await;
        assert_eq!(frame_each(&mut dispatcher, &outbox, &WHILE_BUSY).await, Flow::Close);

        let responses = collect_until(&mut rx, ResponseKind::CloseAck).await;
        let kinds: Vec<_> = responses.iter().map(Response::kind).collect();
        assert_eq!(kinds, vec![
          ResponseKind::GetProvidersDone
        , ResponseKind::InterruptAck
        , ResponseKind::CloseAck
        ]);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_frames_get_no_response()
    {   let (outbox, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = dispatcher();
        for frame in [
          "not json"
        , "[1, 2]"
        , r#"{"type":"load"}"#
        , r#"{"type":"load","unique_request_id":"x"}"#
        , r#"{"type":"dance","unique_request_id":"x"}"#
        ]
        {   assert_eq!(dispatcher.handle_frame(frame, &outbox).await, Flow::Continue);
        }
        drop(outbox);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_is_acked_and_ends_the_connection()
    {   let (outbox, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = dispatcher();
        let flow = dispatcher.handle_frame(
          r#"{"type":"close","unique_request_id":"c"}"#,
          &outbox
        ).await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(
          rx.recv().await.map(|r| r.kind()),
          Some(ResponseKind::CloseAck)
        );
    }
}
