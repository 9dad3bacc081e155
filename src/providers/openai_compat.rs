//! Chat-completions backends speaking the OpenAI wire format
//!
//! OpenAI, Groq and Mistral share this client. They differ in their base
//! URL, whether they stream natively, and how an interrupt reaches an
//! in-flight call (see [`Profile`]).

use std::time::Duration;
use async_trait::async_trait;
use eventsource_stream::{Event, Eventsource};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, error, trace};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::envelope::{GenerationParameters, LoadParams, Message};
use crate::error::ErrorKind;
use crate::providers::{
  require_api_key, stream_whole, GenerateReply, Provider, Session, SessionSlot,
};
use crate::supervisor::{
  Cancellation, ChunkSender, ChunkSink, InterruptSignal, Watch,
};

// ===== Message Types =====

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a>
{   pub model: String
  , pub messages: &'a [Message]
  , pub temperature: f32
  , pub max_tokens: u32
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>
  , pub stream: bool
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse
{   pub choices: Vec<Choice>
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice
{   pub message: ChoiceMessage
  , pub finish_reason: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage
{   #[serde(default)]
    pub content: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChunk
{   #[serde(default)]
    pub choices: Vec<ChunkChoice>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice
{   #[serde(default)]
    pub delta: Delta
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta
{   #[serde(default)]
    pub content: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse
{   pub data: Vec<ModelData>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelData
{   pub id: String
  , #[serde(default)]
    pub owned_by: Option<String>
}

// ===== Server-Sent Events =====

/// Decode an HTTP body into SSE events
pub fn event_stream(
  response: reqwest::Response
) -> BoxStream<'static, Result<Event, ErrorKind>>
{   response
      .bytes_stream()
      .eventsource()
      .map(|event| event.map_err(|e| {
        error!("Stream read error: {}", e);
        ErrorKind::Unexpected
      }))
      .boxed()
}

// ===== HTTP =====

/// Map a failed HTTP status onto the error taxonomy
pub fn classify_status(status: reqwest::StatusCode) -> ErrorKind
{   match status.as_u16()
    {   401 | 403 => ErrorKind::Authorization
      , 404 => ErrorKind::InvalidModel
      , 400 | 422 => ErrorKind::InvalidPrompt
      , 408 | 504 => ErrorKind::Timeout
      , _ => ErrorKind::Unexpected
    }
}

async fn check_status(
  name: &str
, response: reqwest::Response
) -> Result<reqwest::Response, ErrorKind>
{   let status = response.status();
    trace!("{} response status: {}", name, status);
    if status.is_success()
    {   return Ok(response);
    }
    let error_text = response.text().await
      .unwrap_or_else(|_| "Unknown error".to_string());
    error!("{} API error {}: {}", name, status, error_text);
    Err(classify_status(status))
}

/// Map a failed send, a timed out one becomes [`ErrorKind::Timeout`]
pub fn classify_send_error(context: &str, e: reqwest::Error) -> ErrorKind
{   error!("{}: {}", context, e);
    if e.is_timeout()
    {   ErrorKind::Timeout
    } else
    {   ErrorKind::Unexpected
    }
}

/// `GET {api_base}/models`, bounded by the session's request timeout
pub async fn list_models(
  name: &str
, api_base: &str
, session: &Session
) -> Result<Vec<String>, ErrorKind>
{   debug!("Listing {} models", name);
    let response = session.http
      .get(format!("{}/models", api_base))
      .bearer_auth(&session.api_key)
      .timeout(session.request_timeout)
      .send()
      .await
      .map_err(|e| classify_send_error("Failed to fetch models", e))?;
    let response = check_status(name, response).await?;

    let models: ModelsResponse = response.json().await
      .map_err(|e| classify_send_error("Parse error", e))?;
    debug!("Retrieved {} models", models.data.len());
    Ok(models.data.into_iter().map(|m| m.id).collect())
}

async fn post_chat(
  name: &str
, api_base: &str
, session: &Session
, request: &ChatRequest<'_>
) -> Result<reqwest::Response, ErrorKind>
{   trace!("{} request: {:?}", name, request);
    let response = session.http
      .post(format!("{}/chat/completions", api_base))
      .bearer_auth(&session.api_key)
      .json(request)
      .send()
      .await
      .map_err(|e| {
        error!("HTTP error: {}", e);
        ErrorKind::Unexpected
      })?;
    check_status(name, response).await
}

pub async fn complete(
  name: &str
, api_base: &str
, session: &Session
, request: &ChatRequest<'_>
) -> GenerateReply
{   let response = post_chat(name, api_base, session, request).await?;
    let chat: ChatResponse = response.json().await
      .map_err(|e| {
        error!("Parse error: {}", e);
        ErrorKind::Unexpected
      })?;
    let choice = chat.choices.into_iter().next()
      .ok_or_else(|| {
        error!("No choices in response");
        ErrorKind::Unexpected
      })?;
    trace!("Finish reason: {:?}", choice.finish_reason);
    Ok(choice.message.content.unwrap_or_default())
}

/// Text carried by one streamed event, `None` at the `[DONE]` sentinel
pub fn chunk_text(event: &Event) -> Option<Result<String, ErrorKind>>
{   let data = event.data.trim();
    if data == "[DONE]"
    {   return None;
    }
    let parsed = serde_json::from_str::<ChatChunk>(data)
      .map(|chunk| {
        chunk.choices
          .into_iter()
          .next()
          .and_then(|c| c.delta.content)
          .unwrap_or_default()
      })
      .map_err(|e| {
        error!("Failed to parse stream chunk: {}", e);
        ErrorKind::Unexpected
      });
    Some(parsed)
}

// ===== Provider =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Streaming
{   Native
  , /// Whole answer sent as one fragment
    Wrapped
}

/// What distinguishes one OpenAI-compatible backend from another
#[derive(Debug, Clone, Copy)]
pub struct Profile
{   pub name: &'static str
  , pub api_base: &'static str
  , pub streaming: Streaming
  , pub cancellation: Cancellation
}

pub struct CompatProvider
{   profile: Profile
  , api_base: String
  , timeout: Option<Duration>
  , session: SessionSlot
  , signal: InterruptSignal
}

impl CompatProvider
{   pub fn new(profile: Profile, config: &ProviderConfig) -> Self
    {   debug!("Creating {} provider", profile.name);
        CompatProvider
        {   profile
          , api_base: config.api_base
              .clone()
              .unwrap_or_else(|| profile.api_base.to_string())
              .trim_end_matches('/')
              .to_string()
          , timeout: config.timeout_secs.map(Duration::from_secs)
          , session: SessionSlot::default()
          , signal: InterruptSignal::new()
        }
    }

    pub fn profile(&self) -> Profile
    {   self.profile
    }

    pub fn api_base(&self) -> &str
    {   &self.api_base
    }

    fn request<'a>(
      &self
    , session: &Session
    , messages: &'a [Message]
    , params: &GenerationParameters
    , stream: bool
    ) -> ChatRequest<'a>
    {   ChatRequest
        {   model: session.model_for(params)
          , messages
          , temperature: params.temperature
          , max_tokens: params.max_output_length
          , stop: params.stop_strings()
          , stream
        }
    }

    async fn stream_native(
      &self
    , messages: &[Message]
    , params: &GenerationParameters
    , cancel: CancellationToken
    , sink: &ChunkSink
    ) -> ErrorKind
    {   let session = match self.session.get().await
        {   Ok(session) => session
          , Err(kind) => return kind
        };
        let mut watch = Watch::new(
          cancel,
          self.profile.cancellation,
          params.timeout_ms
        );
        let request = self.request(&session, messages, params, true);

        let opened = watch
          .call(post_chat(self.profile.name, &self.api_base, &session, &request))
          .await;
        let response = match opened
        {   Ok(Ok(response)) => response
          , Ok(Err(kind)) | Err(kind) => return kind
        };
        watch.refresh();

        let mut events = event_stream(response);
        loop
        {   match watch.next(&mut events).await
            {   Ok(Some(Ok(event))) => match chunk_text(&event)
                {   Some(Ok(text)) => {
                      if !text.is_empty()
                      {   sink.push(text);
                      }
                    }
                  , Some(Err(kind)) => return kind
                  , None => break
                }
              , Ok(Some(Err(kind))) => return kind
              , Ok(None) => break
              , Err(kind) => return kind
            }
        }

        if watch.is_interrupted()
        {   ErrorKind::Interrupt
        } else
        {   ErrorKind::Success
        }
    }
}

#[async_trait]
impl Provider for CompatProvider
{   async fn init(&self, params: &LoadParams) -> ErrorKind
    {   let api_key = match require_api_key(self.profile.name, params)
        {   Ok(key) => key
          , Err(kind) => return kind
        };
        let session = Session::new(
          api_key,
          params.preload_model_id.clone(),
          self.timeout
        );

        match list_models(self.profile.name, &self.api_base, &session).await
        {   Ok(_) => {}
          , Err(ErrorKind::Timeout) => {
              error!("Test request to {} timed out", self.profile.name);
              return ErrorKind::Timeout;
            }
          , Err(kind) => {
              error!(
                "Test request to {} failed ({}), assuming invalid API key",
                self.profile.name, kind
              );
              return ErrorKind::Authorization;
            }
        }

        self.session.set(session).await;
        ErrorKind::Success
    }

    async fn free(&self)
    {   self.session.clear().await;
    }

    async fn begin_generation(&self) -> CancellationToken
    {   self.signal.begin().await
    }

    async fn generate(
      &self
    , messages: &[Message]
    , params: &GenerationParameters
    , cancel: CancellationToken
    ) -> GenerateReply
    {   let session = self.session.get().await?;
        let watch = Watch::new(
          cancel,
          self.profile.cancellation,
          params.timeout_ms
        );
        let request = self.request(&session, messages, params, false);
        watch
          .call(complete(self.profile.name, &self.api_base, &session, &request))
          .await?
    }

    async fn generate_stream(
      &self
    , messages: &[Message]
    , params: &GenerationParameters
    , cancel: CancellationToken
    , chunks: ChunkSender
    ) -> ErrorKind
    {   match self.profile.streaming
        {   Streaming::Wrapped => {
              stream_whole(self, messages, params, cancel, chunks).await
            }
          , Streaming::Native => {
              let sink = ChunkSink::new(chunks);
              let outcome = self
                .stream_native(messages, params, cancel, &sink)
                .await;
              if outcome.is_error()
              {   error!("Error during streamed generation: {}", outcome);
              }
              sink.finish(outcome)
            }
        }
    }

    async fn interrupt(&self)
    {   self.signal.interrupt().await;
    }

    async fn get_models(&self) -> Vec<String>
    {   let session = match self.session.get().await
        {   Ok(session) => session
          , Err(_) => return vec![]
        };
        list_models(self.profile.name, &self.api_base, &session)
          .await
          .unwrap_or_else(|kind| {
            error!("Failed to get {} models: {}", self.profile.name, kind);
            vec![]
          })
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn data_event(data: &str) -> Event
    {   Event
        {   event: "message".to_string()
          , data: data.to_string()
          , id: String::new()
          , retry: None
        }
    }

    #[tokio::test]
    async fn sse_body_decodes_into_events()
    {   let server = MockServer::start().await;
        let body = concat!(
          "data: {\"a\":1}\r\n\r\n",
          ": keep-alive\n\n",
          "event: newToken\nid: 3\ndata: {\"token\":\"\u{2603}\"}\n\n",
          "data: [DONE]\n\n",
        );
        Mock::given(method("GET"))
          .and(path("/events"))
          .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
          .mount(&server)
          .await;

        let response = reqwest::get(format!("{}/events", server.uri())).await.unwrap();
        let events: Vec<Event> = event_stream(response)
          .map(|event| event.unwrap())
          .collect()
          .await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].event, "newToken");
        assert_eq!(events[1].data, "{\"token\":\"\u{2603}\"}");
        assert_eq!(chunk_text(&events[2]), None);
    }

    #[tokio::test]
    async fn stalled_listing_is_a_timeout()
    {   let server = MockServer::start().await;
        Mock::given(method("GET"))
          .and(path("/models"))
          .respond_with(
            ResponseTemplate::new(200)
              .set_body_json(serde_json::json!({"data": []}))
              .set_delay(Duration::from_secs(30))
          )
          .mount(&server)
          .await;

        let session = Session::new(
          "k".to_string(),
          None,
          Some(Duration::from_millis(200))
        );
        let started = std::time::Instant::now();
        let listed = list_models("openai", &server.uri(), &session).await;
        assert_eq!(listed, Err(ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn chunk_text_reads_deltas_and_sentinel()
    {   let event = data_event(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#);
        assert_eq!(chunk_text(&event), Some(Ok("Hel".to_string())));

        let role_only = data_event(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#);
        assert_eq!(chunk_text(&role_only), Some(Ok(String::new())));

        assert_eq!(chunk_text(&data_event("[DONE]")), None);
        assert_eq!(chunk_text(&data_event("{")), Some(Err(ErrorKind::Unexpected)));
    }

    #[test]
    fn statuses_map_to_kinds()
    {   use reqwest::StatusCode;
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ErrorKind::Authorization);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorKind::InvalidModel);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT), ErrorKind::Timeout);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), ErrorKind::Unexpected);
    }

    #[test]
    fn request_omits_token_id_stops()
    {   let messages = vec![Message::user("hi")];
        let session = Session::new("k".to_string(), None, None);
        let provider = CompatProvider::new(
          crate::providers::openai::PROFILE,
          &ProviderConfig::default()
        );
        let params = GenerationParameters
        {   stop_tokens: Some(crate::envelope::StopTokens::Ids(vec![1]))
          , ..GenerationParameters::default().with_model("gpt-4o-mini")
        };
        let body = serde_json::to_value(
          provider.request(&session, &messages, &params, true)
        ).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 200);
        assert!(body.get("stop").is_none());
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn configured_base_wins_and_loses_trailing_slash()
    {   let config = ProviderConfig
        {   name: "groq".to_string()
          , api_base: Some("http://127.0.0.1:9/v1/".to_string())
          , timeout_secs: Some(2)
        };
        let provider = CompatProvider::new(crate::providers::groq::PROFILE, &config);
        assert_eq!(provider.api_base(), "http://127.0.0.1:9/v1");
        assert_eq!(provider.profile().cancellation, Cancellation::Abortable);
    }
}
