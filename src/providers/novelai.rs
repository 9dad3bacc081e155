//! NovelAI text generation
//!
//! The backend completes raw text, so chat turns are rendered into a
//! Llama 3 style prompt with the requested character as the assistant
//! persona. Output is produced through the SSE endpoint only; `generate`
//! buffers that stream until its final token. Interrupts are polled at
//! every received token.

use std::time::Duration;
use async_trait::async_trait;
use log::{debug, error, trace};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::envelope::{GenerationParameters, LoadParams, Message, Role, StopTokens};
use crate::error::ErrorKind;
use crate::providers::openai_compat::{
  classify_send_error, classify_status, event_stream,
};
use crate::providers::{
  require_api_key, GenerateReply, Provider, Session, SessionSlot,
};
use crate::supervisor::{
  Cancellation, ChunkSender, ChunkSink, InterruptSignal, Watch,
};

pub const NAME: &str = "novelai";

const NOVELAI_API_BASE: &str = "https://text.novelai.net";

pub const AVAILABLE_MODELS: [&str; 2] = ["kayra-v1", "llama-3-erato-v1"];

const CREDENTIAL_CHECK_MODEL: &str = "llama-3-erato-v1";

/// Longest completion requested per call
const MAX_CHAT_LENGTH: u32 = 250;

const CHAT_STOP_SEQUENCES: [&[i64]; 5] = [
  &[91, 78694, 851, 91]
, &[91, 7413, 3659, 4424, 91]
, &[91, 408, 3659, 4424, 91]
, &[128006, 198]
, &[128007, 198]
];

const CHAT_BANNED_TOKENS: [&[i64]; 1] = [&[32352]];

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant";

// ===== Message Types =====

#[derive(Debug, Clone, Serialize)]
pub struct TextGenParameters
{   pub max_length: u32
  , pub min_length: u32
  , pub temperature: f32
  , pub top_p: f32
  , pub repetition_penalty: f32
  , pub stop_sequences: Vec<Vec<i64>>
  , pub bad_words_ids: Vec<Vec<i64>>
  , pub generate_until_sentence: bool
  , pub use_cache: bool
  , pub use_string: bool
  , pub return_full_text: bool
  , pub prefix: String
  , pub bracket_ban: bool
}

impl TextGenParameters
{   fn chat(params: &GenerationParameters) -> Self
    {   let mut stop_sequences: Vec<Vec<i64>> = CHAT_STOP_SEQUENCES
          .iter()
          .map(|s| s.to_vec())
          .collect();
        match &params.stop_tokens
        {   Some(StopTokens::Ids(ids)) => {
              stop_sequences.extend(ids.iter().map(|id| vec![*id]));
            }
          , Some(StopTokens::Text(_)) => {
              debug!("NovelAI only accepts token id stop sequences, ignoring text stops");
            }
          , None => {}
        }
        TextGenParameters
        {   max_length: params.max_output_length.clamp(1, MAX_CHAT_LENGTH)
          , min_length: 1
          , temperature: params.temperature
          , top_p: 0.995
          , repetition_penalty: 1.5
          , stop_sequences
          , bad_words_ids: CHAT_BANNED_TOKENS.iter().map(|s| s.to_vec()).collect()
          , generate_until_sentence: true
          , use_cache: false
          , use_string: true
          , return_full_text: false
          , prefix: "vanilla".to_string()
          , bracket_ban: false
        }
    }

    /// Shortest request that still proves the key works
    fn credential_check() -> Self
    {   TextGenParameters
        {   max_length: 10
          , ..TextGenParameters::chat(&GenerationParameters::default())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateBody
{   pub input: String
  , pub model: String
  , pub parameters: TextGenParameters
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextResponse
{   #[serde(default)]
    pub output: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEvent
{   #[serde(default)]
    pub token: String
  , #[serde(default)]
    pub r#final: bool
}

// ===== Prompt =====

/// Renders chat turns into a single completion prompt
#[derive(Debug, Clone)]
pub struct ChatPromptBuilder
{   assistant_name: String
  , system_prompt: String
}

impl ChatPromptBuilder
{   pub fn new(assistant_name: &str, system_prompt: Option<&str>) -> Self
    {   ChatPromptBuilder
        {   assistant_name: if assistant_name.is_empty()
            {   "assistant".to_string()
            } else
            {   assistant_name.to_string()
            }
          , system_prompt: system_prompt
              .unwrap_or(DEFAULT_SYSTEM_PROMPT)
              .to_string()
        }
    }

    fn turn(header: &str, content: &str) -> String
    {   format!(
          "<|start_header_id|>{}<|end_header_id|>\n\n{}\n<|eot_id|>",
          header, content
        )
    }

    pub fn build(&self, messages: &[Message]) -> String
    {   let mut builder = vec!["<|begin_of_text|>".to_string()];
        if !self.system_prompt.is_empty()
        {   builder.push(ChatPromptBuilder::turn("system", &self.system_prompt));
        }
        for message in messages
        {   match message.role
            {   Role::Assistant => {
                  builder.push(ChatPromptBuilder::turn(
                    &self.assistant_name,
                    &message.content
                  ));
                }
              , Role::User => {
                  builder.push(ChatPromptBuilder::turn(
                    message.name.as_deref().unwrap_or("user"),
                    &message.content
                  ));
                }
              , Role::System => {
                  builder.push(ChatPromptBuilder::turn("system", &message.content));
                }
              , Role::Tool | Role::Function => {
                  debug!("Skipping {} message in NovelAI prompt", message.role.as_str());
                }
            }
        }
        builder.push(format!(
          "<|start_header_id|>{}<|end_header_id|>\n\n",
          self.assistant_name
        ));
        builder.join("\n")
    }
}

/// Remove `<|...|>` control markers, including a cut-off one at the end
pub fn strip_control_markers(text: &str) -> String
{   let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<|")
    {   out.push_str(&rest[..start]);
        let marker = &rest[start + 2..];
        match marker.find("|>")
        {   Some(end) => rest = &marker[end + 2..]
          , None => {
              rest = match marker.find('|')
              {   Some(end) => &marker[end + 1..]
                , None => marker.trim_start_matches(|c: char| c.is_alphanumeric() || c == '_')
              };
            }
        }
    }
    out.push_str(rest);
    out
}

// ===== Provider =====

pub struct NovelAiProvider
{   api_base: String
  , timeout: Option<Duration>
  , session: SessionSlot
  , signal: InterruptSignal
}

impl NovelAiProvider
{   pub fn new(config: &ProviderConfig) -> Self
    {   debug!("Creating NovelAI provider");
        NovelAiProvider
        {   api_base: config.api_base
              .clone()
              .unwrap_or_else(|| NOVELAI_API_BASE.to_string())
              .trim_end_matches('/')
              .to_string()
          , timeout: config.timeout_secs.map(Duration::from_secs)
          , session: SessionSlot::default()
          , signal: InterruptSignal::new()
        }
    }

    async fn post(
      &self
    , session: &Session
    , path: &str
    , body: &GenerateBody
    , timeout: Option<Duration>
    ) -> Result<reqwest::Response, ErrorKind>
    {   trace!("NovelAI request to {}: model {}", path, body.model);
        let mut request = session.http
          .post(format!("{}{}", self.api_base, path))
          .bearer_auth(&session.api_key)
          .json(body);
        if let Some(timeout) = timeout
        {   request = request.timeout(timeout);
        }
        let response = request
          .send()
          .await
          .map_err(|e| classify_send_error("HTTP error", e))?;
        let status = response.status();
        if !status.is_success()
        {   let error_text = response.text().await
              .unwrap_or_else(|_| "Unknown error".to_string());
            error!("NovelAI error {}: {}", status, error_text);
            return Err(classify_status(status));
        }
        Ok(response)
    }

    /// Whole-text generation, bounded by the session's request timeout
    async fn generate_text(
      &self
    , session: &Session
    , body: &GenerateBody
    ) -> GenerateReply
    {   let response = self
          .post(session, "/ai/generate", body, Some(session.request_timeout))
          .await?;
        let text: TextResponse = response.json().await
          .map_err(|e| classify_send_error("Parse error", e))?;
        text.output.ok_or_else(|| {
          error!("Failed to get valid response from NovelAI");
          ErrorKind::Unexpected
        })
    }

    fn chat_body(
      &self
    , session: &Session
    , messages: &[Message]
    , params: &GenerationParameters
    ) -> Result<GenerateBody, ErrorKind>
    {   let model = session.model_for(params);
        if !AVAILABLE_MODELS.contains(&model.as_str())
        {   error!(
              "Model \"{}\" is not a valid NovelAI model, valid models are: {}",
              model,
              AVAILABLE_MODELS.join(", ")
            );
            return Err(ErrorKind::InvalidModel);
        }
        let prompt = ChatPromptBuilder::new(&params.character_name, None);
        Ok(GenerateBody
        {   input: prompt.build(messages)
          , model
          , parameters: TextGenParameters::chat(params)
        })
    }

    /// Drive the token stream, handing each raw token to `on_token`
    async fn run_stream(
      &self
    , messages: &[Message]
    , params: &GenerationParameters
    , cancel: CancellationToken
    , on_token: &mut (dyn FnMut(&str) + Send)
    ) -> ErrorKind
    {   let session = match self.session.get().await
        {   Ok(session) => session
          , Err(kind) => return kind
        };
        let body = match self.chat_body(&session, messages, params)
        {   Ok(body) => body
          , Err(kind) => return kind
        };
        let mut watch = Watch::new(
          cancel,
          Cancellation::Cooperative,
          params.timeout_ms
        );

        let response = match watch
          .call(self.post(&session, "/ai/generate-stream", &body, None))
          .await
        {   Ok(Ok(response)) => response
          , Ok(Err(kind)) | Err(kind) => return kind
        };
        watch.refresh();

        let mut events = event_stream(response);
        loop
        {   match watch.next(&mut events).await
            {   Ok(Some(Ok(event))) => {
                  if event.event != "newToken"
                  {   continue;
                  }
                  let token: TokenEvent = match serde_json::from_str(&event.data)
                  {   Ok(token) => token
                    , Err(e) => {
                        error!("Failed to parse NovelAI token: {}", e);
                        return ErrorKind::Unexpected;
                      }
                  };
                  if token.r#final
                  {   break;
                  }
                  on_token(&token.token);
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
impl Provider for NovelAiProvider
{   async fn init(&self, params: &LoadParams) -> ErrorKind
    {   let api_key = match require_api_key(NAME, params)
        {   Ok(key) => key
          , Err(kind) => return kind
        };
        let session = Session::new(
          api_key,
          params.preload_model_id.clone(),
          self.timeout
        );

        let check = GenerateBody
        {   input: "test".to_string()
          , model: CREDENTIAL_CHECK_MODEL.to_string()
          , parameters: TextGenParameters::credential_check()
        };
        match self.generate_text(&session, &check).await
        {   Ok(_) => {}
          , Err(ErrorKind::Timeout) => {
              error!("Test request to novelai timed out");
              return ErrorKind::Timeout;
            }
          , Err(kind) => {
              error!(
                "Test request to novelai failed ({}), assuming invalid API key",
                kind
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
    {   let mut buffer = String::new();
        let outcome = self
          .run_stream(messages, params, cancel, &mut |token: &str| buffer.push_str(token))
          .await;
        if outcome.is_error()
        {   error!("Error during generation: {}", outcome);
            return Err(outcome);
        }
        Ok(strip_control_markers(&buffer).trim().to_string())
    }

    async fn generate_stream(
      &self
    , messages: &[Message]
    , params: &GenerationParameters
    , cancel: CancellationToken
    , chunks: ChunkSender
    ) -> ErrorKind
    {   let sink = ChunkSink::new(chunks);
        let outcome = self
          .run_stream(messages, params, cancel, &mut |token: &str| {
            let clean = strip_control_markers(token);
            if !clean.is_empty()
            {   sink.push(clean);
            }
          })
          .await;
        if outcome.is_error()
        {   error!("Error during streamed generation: {}", outcome);
        }
        sink.finish(outcome)
    }

    async fn interrupt(&self)
    {   self.signal.interrupt().await;
    }

    async fn get_models(&self) -> Vec<String>
    {   AVAILABLE_MODELS.iter().map(|m| m.to_string()).collect()
    }
}

#[cfg(test)]
mod tests
{   use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn prompt_uses_persona_and_speaker_names()
    {   let builder = ChatPromptBuilder::new("Mia", None);
        let mut user = Message::user("hello");
        user.name = Some("DEV".to_string());
        let prompt = builder.build(&[
          Message::system("Be brief.")
        , user
        , Message::assistant("hi!")
        ]);

        assert!(prompt.starts_with("<|begin_of_text|>\n<|start_header_id|>system<|end_header_id|>\n\nYou are a helpful assistant\n<|eot_id|>"));
        assert!(prompt.contains("<|start_header_id|>DEV<|end_header_id|>\n\nhello\n<|eot_id|>"));
        assert!(prompt.contains("<|start_header_id|>Mia<|end_header_id|>\n\nhi!\n<|eot_id|>"));
        assert!(prompt.ends_with("<|start_header_id|>Mia<|end_header_id|>\n\n"));
    }

    #[test]
    fn empty_persona_falls_back_to_assistant()
    {   let prompt = ChatPromptBuilder::new("", Some("")).build(&[Message::user("x")]);
        assert!(!prompt.contains("system"));
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn control_markers_are_stripped()
    {   assert_eq!(strip_control_markers("Hi<|eot_id|> there"), "Hi there");
        assert_eq!(strip_control_markers("done<|eot_id|"), "done");
        assert_eq!(strip_control_markers("cut <|start"), "cut ");
        assert_eq!(strip_control_markers("plain | text"), "plain | text");
    }

    #[test]
    fn chat_parameters_merge_stop_ids_and_clamp_length()
    {   let params = GenerationParameters
        {   max_output_length: 10_000
          , stop_tokens: Some(StopTokens::Ids(vec![198]))
          , ..GenerationParameters::default()
        };
        let gen = TextGenParameters::chat(&params);
        assert_eq!(gen.max_length, MAX_CHAT_LENGTH);
        assert_eq!(gen.stop_sequences.len(), CHAT_STOP_SEQUENCES.len() + 1);
        assert_eq!(gen.stop_sequences.last(), Some(&vec![198]));
        assert_eq!(TextGenParameters::credential_check().max_length, 10);
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_before_any_request()
    {   let provider = NovelAiProvider::new(&ProviderConfig::default());
        provider.session.set(Session::new("k".to_string(), None, None)).await;
        let params = GenerationParameters::default().with_model("gpt-4o");
        assert_eq!(
          provider
            .generate(&[Message::user("hi")], &params, CancellationToken::new())
            .await,
          Err(ErrorKind::InvalidModel)
        );
        assert_eq!(provider.get_models().await, vec!["kayra-v1", "llama-3-erato-v1"]);
    }

    async fn token_backend() -> MockServer
    {   let server = MockServer::start().await;
        let body = concat!(
          "event: newToken\nid: 1\ndata: {\"token\":\"Hel\",\"final\":false}\n\n",
          "event: ping\ndata: {}\n\n",
          "event: newToken\nid: 2\ndata: {\"token\":\"lo<|eot_id|>\",\"final\":false}\n\n",
          "event: newToken\nid: 3\ndata: {\"token\":\"\",\"final\":true}\n\n",
        );
        Mock::given(method("POST"))
          .and(path("/ai/generate-stream"))
          .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
          .mount(&server)
          .await;
        server
    }

    async fn provider_for(server: &MockServer) -> NovelAiProvider
    {   let config = ProviderConfig
        {   name: NAME.to_string()
          , api_base: Some(server.uri())
          , timeout_secs: None
        };
        let provider = NovelAiProvider::new(&config);
        provider.session
          .set(Session::new("k".to_string(), Some("llama-3-erato-v1".to_string()), None))
          .await;
        provider
    }

    #[tokio::test]
    async fn token_events_are_buffered_and_cleaned()
    {   let server = token_backend().await;
        let provider = provider_for(&server).await;
        let reply = provider
          .generate(
            &[Message::user("hi")],
            &GenerationParameters::default(),
            provider.begin_generation().await
          )
          .await;
        assert_eq!(reply, Ok("Hello".to_string()));
    }

    #[tokio::test]
    async fn interrupted_token_stream_reports_interrupt()
    {   let server = token_backend().await;
        let provider = provider_for(&server).await;
        let cancel = provider.begin_generation().await;
        provider.interrupt().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let outcome = provider
          .generate_stream(&[Message::user("hi")], &GenerationParameters::default(), cancel, tx)
          .await;
        assert_eq!(outcome, ErrorKind::Interrupt);
        assert_eq!(rx.recv().await, Some(crate::providers::StreamChunk::end()));
        assert_eq!(rx.recv().await, None);
    }
}
