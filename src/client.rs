use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, trace};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::envelope::{
  GenerationParameters, Message, Request, Response, ResponseKind,
};
use crate::error::Error;
use crate::supervisor::{race_ack, ACK_TIMEOUT};

/// How long `connect` keeps retrying
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Waiters for responses that have not arrived yet
#[derive(Default)]
pub struct PendingTable
{   waiters: HashMap<(ResponseKind, String), oneshot::Sender<Response>>
  , streams: HashMap<String, mpsc::UnboundedSender<String>>
}

impl PendingTable
{   /// Register a one-shot waiter for `kind` on `id`
    pub fn register(
      &mut self
    , kind: ResponseKind
    , id: &str
    ) -> oneshot::Receiver<Response>
    {   let (tx, rx) = oneshot::channel();
        self.waiters.insert((kind, id.to_string()), tx);
        rx
    }

    /// Register the chunk handler of a streaming generation
    pub fn register_stream(&mut self, id: &str) -> mpsc::UnboundedReceiver<String>
    {   let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(id.to_string(), tx);
        rx
    }

    pub fn remove_stream(&mut self, id: &str)
    {   self.streams.remove(id);
    }

    /// Forget every waiter registered for `id`
    pub fn remove_all(&mut self, id: &str)
    {   self.waiters.retain(|(_, waiter_id), _| waiter_id != id);
        self.streams.remove(id);
    }

    pub fn is_empty(&self) -> bool
    {   self.waiters.is_empty() && self.streams.is_empty()
    }

    /// Hand a response to its waiter, consuming the waiter.
    ///
    /// Returns false when nobody waits for it.
    pub fn route(&mut self, response: Response) -> bool
    {   if let Response::GenerateStreamChunk { unique_request_id, chunk } = &response
        {   return match self.streams.get(unique_request_id)
            {   Some(handler) => handler.send(chunk.clone()).is_ok()
              , None => false
            };
        }

        let key = (response.kind(), response.request_id().to_string());
        match self.waiters.remove(&key)
        {   Some(waiter) => waiter.send(response).is_ok()
          , None => false
        }
    }

    /// Drop everything, waking all waiters with a closed channel
    pub fn clear(&mut self)
    {   self.waiters.clear();
        self.streams.clear();
    }
}

/// Client side of the gateway socket.
///
/// Any number of operations may be in flight at once; responses are
/// matched back to them by request id.
pub struct GatewayClient
{   sink: Mutex<SplitSink<Socket, Frame>>
  , pending: Arc<Mutex<PendingTable>>
  , reader_handle: tokio::task::JoinHandle<()>
}

impl GatewayClient
{   /// Connect to a gateway, retrying until [`CONNECT_TIMEOUT`]
    pub async fn connect(url: &str) -> Result<Self, Error>
    {   debug!("Connecting to gateway at {}", url);
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        let socket = loop
        {   match tokio_tungstenite::connect_async(url).await
            {   Ok((socket, _)) => break socket
              , Err(e) => {
                  if tokio::time::Instant::now() >= deadline
                  {   error!("Could not connect to gateway: {}", e);
                      return Err(Error::Transport(format!(
                        "Timeout during connection to gateway at {}",
                        url
                      )));
                  }
                  trace!("Gateway not reachable yet: {}", e);
                  tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        };
        info!("Connected to gateway at {}", url);

        let (sink, stream) = socket.split();
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let reader_handle = tokio::spawn(
          run_reader_loop(stream, pending.clone())
        );

        Ok(GatewayClient
        {   sink: Mutex::new(sink)
          , pending
          , reader_handle
        })
    }

    async fn send(&self, request: &Request) -> Result<(), Error>
    {   let text = serde_json::to_string(request)?;
        trace!("Sending {} {}", request.type_name(), request.request_id());
        self.sink.lock().await
          .send(Frame::Text(text))
          .await
          .map_err(Error::from)
    }

    /// Send a request whose waiters are already registered.
    async fn submit(&self, request: &Request) -> Result<(), Error>
    {   if let Err(e) = self.send(request).await
        {   self.pending.lock().await.remove_all(request.request_id());
            return Err(e);
        }
        Ok(())
    }

    /// Race an ack against [`ACK_TIMEOUT`], discarding the operation's
    /// waiters when the gateway stays silent.
    async fn await_ack(
      &self
    , operation: &str
    , id: &str
    , ack: oneshot::Receiver<Response>
    ) -> Result<Response, Error>
    {   match race_ack(ack, ACK_TIMEOUT).await
        {   Some(response) => Ok(response)
          , None => {
              self.pending.lock().await.remove_all(id);
              error!("{} {} was not acknowledged", operation, id);
              Err(Error::AckTimeout(operation.to_string()))
            }
        }
    }

    async fn await_done(
      done: oneshot::Receiver<Response>
    ) -> Result<Response, Error>
    {   let response = done.await.map_err(|_| Error::ConnectionClosed)?;
        match response.error()
        {   Some(kind) if kind.is_error() => Err(Error::Generation(kind))
          , _ => Ok(response)
        }
    }

    /// Ack then done, the shape of `load` and non-streamed `generate`
    async fn acked_operation(
      &self
    , request: Request
    , ack: ResponseKind
    , done: ResponseKind
    ) -> Result<Response, Error>
    {   let id = request.request_id().to_string();
        let (ack_rx, done_rx) =
        {   let mut pending = self.pending.lock().await;
            (pending.register(ack, &id), pending.register(done, &id))
        };
        self.submit(&request).await?;
        self.await_ack(request.type_name(), &id, ack_rx).await?;
        GatewayClient::await_done(done_rx).await
    }

    /// Load a provider, failing with the gateway's error kind
    pub async fn load_provider(
      &self
    , provider: &str
    , api_key: Option<&str>
    , preload_model_id: Option<&str>
    ) -> Result<(), Error>
    {   debug!("load_provider {}", provider);
        let request = Request::Load
        {   unique_request_id: new_request_id()
          , provider: provider.to_string()
          , api_key: api_key.map(str::to_string)
          , preload_model_id: preload_model_id.map(str::to_string)
        };
        self.acked_operation(request, ResponseKind::LoadAck, ResponseKind::LoadDone)
          .await?;
        Ok(())
    }

    /// Generate the whole response
    pub async fn generate(
      &self
    , messages: Vec<Message>
    , params: GenerationParameters
    ) -> Result<String, Error>
    {   debug!("generate for model \"{}\"", params.model_id);
        let request = Request::Generate
        {   unique_request_id: new_request_id()
          , messages
          , params
          , stream: false
        };
        let done = self
          .acked_operation(request, ResponseKind::GenerateAck, ResponseKind::GenerateDone)
          .await?;
        match done
        {   Response::GenerateDone { response, .. } => Ok(response)
          , other => Err(Error::Other(format!("Unexpected response {:?}", other.kind())))
        }
    }

    /// Generate with every fragment handed to `on_chunk` as it arrives
    pub async fn generate_stream<F>(
      &self
    , messages: Vec<Message>
    , params: GenerationParameters
    , mut on_chunk: F
    ) -> Result<(), Error>
    where
      F: FnMut(&str)
    {   debug!("generate_stream for model \"{}\"", params.model_id);
        let request = Request::Generate
        {   unique_request_id: new_request_id()
          , messages
          , params
          , stream: true
        };
        let id = request.request_id().to_string();
        let (ack_rx, mut done_rx, mut chunks) =
        {   let mut pending = self.pending.lock().await;
            ( pending.register(ResponseKind::GenerateAck, &id)
            , pending.register(ResponseKind::GenerateStreamDone, &id)
            , pending.register_stream(&id)
            )
        };
        self.submit(&request).await?;
        self.await_ack("generate_stream", &id, ack_rx).await?;

        let done = loop
        {   tokio::select!
            { biased;
              Some(chunk) = chunks.recv() => on_chunk(&chunk)
            , done = &mut done_rx => break done
            }
        };
        while let Ok(chunk) = chunks.try_recv()
        {   on_chunk(&chunk);
        }
        self.pending.lock().await.remove_stream(&id);

        let done = done.map_err(|_| Error::ConnectionClosed)?;
        match done.error()
        {   Some(kind) if kind.is_error() => Err(Error::Generation(kind))
          , _ => Ok(())
        }
    }

    /// Whether any operation still waits for a response
    pub async fn has_pending(&self) -> bool
    {   !self.pending.lock().await.is_empty()
    }

    /// Ask the gateway to interrupt in-flight generations.
    ///
    /// Interrupted operations still resolve through their own done event.
    pub async fn interrupt(&self) -> Result<(), Error>
    {   debug!("interrupt");
        let id = new_request_id();
        let ack = self.pending.lock().await.register(ResponseKind::InterruptAck, &id);
        self.submit(&Request::Interrupt { unique_request_id: id.clone() }).await?;
        self.await_ack("interrupt", &id, ack).await?;
        Ok(())
    }

    /// Ask the gateway to exit. A silent gateway is treated as already gone.
    pub async fn close(&self) -> Result<(), Error>
    {   debug!("close");
        let id = new_request_id();
        let ack = self.pending.lock().await.register(ResponseKind::CloseAck, &id);
        match self.submit(&Request::Close { unique_request_id: id.clone() }).await
        {   Ok(()) => {}
          , Err(Error::ConnectionClosed) => return Ok(())
          , Err(e) => return Err(e)
        }
        if race_ack(ack, ACK_TIMEOUT).await.is_none()
        {   debug!("No close_ack, gateway is likely already closed");
            self.pending.lock().await.remove_all(&id);
        }
        Ok(())
    }

    /// Backend names the gateway can load
    pub async fn get_providers(&self) -> Result<Vec<String>, Error>
    {   let id = new_request_id();
        let done = self.pending.lock().await.register(ResponseKind::GetProvidersDone, &id);
        self.submit(&Request::GetProviders { unique_request_id: id.clone() }).await?;
        match self.await_ack("get_providers", &id, done).await?
        {   Response::GetProvidersDone { providers, .. } => Ok(providers)
          , other => Err(Error::Other(format!("Unexpected response {:?}", other.kind())))
        }
    }

    /// Models of the loaded backend, empty when none is loaded
    pub async fn get_models(&self) -> Result<Vec<String>, Error>
    {   let id = new_request_id();
        let done = self.pending.lock().await.register(ResponseKind::GetModelsDone, &id);
        self.submit(&Request::GetModels { unique_request_id: id.clone() }).await?;
        match self.await_ack("get_models", &id, done).await?
        {   Response::GetModelsDone { models, .. } => Ok(models)
          , other => Err(Error::Other(format!("Unexpected response {:?}", other.kind())))
        }
    }
}

impl Drop for GatewayClient
{   fn drop(&mut self)
    {   self.reader_handle.abort();
    }
}

fn new_request_id() -> String
{   Uuid::new_v4().to_string()
}

/// Route inbound frames to their waiters until the socket closes
async fn run_reader_loop(
  mut stream: SplitStream<Socket>
, pending: Arc<Mutex<PendingTable>>
)
{   debug!("Starting gateway reader loop");
    while let Some(frame) = stream.next().await
    {   let text = match frame
        {   Ok(Frame::Text(text)) => text
          , Ok(Frame::Close(_)) => break
          , Ok(_) => continue
          , Err(e) => {
              error!("Gateway connection error: {}", e);
              break;
            }
        };
        let response: Response = match serde_json::from_str(&text)
        {   Ok(response) => response
          , Err(e) => {
              error!("Received unreadable message from gateway: {} ({})", text, e);
              continue;
            }
        };
        if !pending.lock().await.route(response)
        {   error!("Received unhandled message from gateway: {}", text);
        }
    }
    debug!("Gateway reader loop ended");
    pending.lock().await.clear();
}
