//! WebSocket listener of the gateway
//!
//! One client connection is served at a time. Each connection gets a writer
//! task that drains the [`Outbox`], so frames produced by concurrent
//! generations are never interleaved.

use std::net::SocketAddr;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, trace};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::config::GatewayConfig;
use crate::dispatcher::{Dispatcher, Flow, Outbox};
use crate::envelope::Response;
use crate::error::Error;
use crate::providers::Registry;

pub struct Server
{   listener: TcpListener
  , dispatcher: Dispatcher
}

impl Server
{   /// Bind the listening socket
    pub async fn bind(
      config: &GatewayConfig
    , registry: Registry
    ) -> Result<Self, Error>
    {   let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).await
          .map_err(|e| {
            Error::Transport(format!("Failed to bind {}: {}", address, e))
          })?;
        info!("Gateway listening on ws://{}", address);
        debug!("Registered providers: {:?}", registry.provider_names());
        Ok(Server
        {   listener
          , dispatcher: Dispatcher::new(registry)
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error>
    {   self.listener
          .local_addr()
          .map_err(|e| Error::Transport(e.to_string()))
    }

    /// Serve connections until a client sends `close`.
    ///
    /// Returns an error only when the listener itself fails.
    pub async fn run(mut self) -> Result<(), Error>
    {   loop
        {   let (stream, peer) = self.listener.accept().await
              .map_err(|e| Error::Transport(format!("Accept failed: {}", e)))?;
            info!("Client connected from {}", peer);

            match serve_connection(&mut self.dispatcher, stream).await
            {   Ok(Flow::Close) => {
                  self.dispatcher.shutdown().await;
                  info!("Gateway closed by client");
                  return Ok(());
                }
              , Ok(Flow::Continue) => info!("Client {} disconnected", peer)
              , Err(e) => error!("Connection with {} failed: {}", peer, e)
            }
        }
    }
}

async fn serve_connection(
  dispatcher: &mut Dispatcher
, stream: TcpStream
) -> Result<Flow, Error>
{   let socket = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = socket.split();

    let (outbox, mut outbound): (Outbox, _) = mpsc::unbounded_channel::<Response>();
    let writer = tokio::spawn(async move {
      while let Some(response) = outbound.recv().await
      {   let text = match serde_json::to_string(&response)
          {   Ok(text) => text
            , Err(e) => {
                error!("Failed to serialize response: {}", e);
                continue;
              }
          };
          trace!("Sending: {}", text);
          if let Err(e) = write.send(Message::Text(text)).await
          {   error!("Failed to send frame: {}", e);
              break;
          }
      }
      let _ = write.close().await;
    });

    let mut flow = Flow::Continue;
    while let Some(frame) = read.next().await
    {   match frame
        {   Ok(Message::Text(text)) => {
              flow = dispatcher.handle_frame(&text, &outbox).await;
              if flow == Flow::Close
              {   break;
              }
            }
          , Ok(Message::Binary(bytes)) => {
              debug!("Ignoring binary frame of {} bytes", bytes.len());
            }
          , Ok(Message::Close(_)) => break
          , Ok(_) => {}
          , Err(e) => {
              error!("WebSocket read error: {}", e);
              break;
            }
        }
    }

    // in-flight generations hold outbox clones, the writer only ends once
    // they are gone
    dispatcher.disconnect().await;
    drop(outbox);
    if let Err(e) = writer.await
    {   error!("Writer task failed: {}", e);
    }
    Ok(flow)
}
