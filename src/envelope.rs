//! Wire envelopes exchanged over the gateway socket
//!
//! Every frame is one JSON object carrying a `type` discriminant and the
//! client-generated `unique_request_id`. Requests are validated field by
//! field before being typed, so a diagnostic can name the missing field.

use std::fmt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use log::trace;

use crate::error::ErrorKind;

// ===== Prompt Types =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role
{   System
  , User
  , Assistant
  , Tool
  , Function
}

impl Role
{   pub fn as_str(self) -> &'static str
    {   match self
        {   Role::System => "system"
          , Role::User => "user"
          , Role::Assistant => "assistant"
          , Role::Tool => "tool"
          , Role::Function => "function"
        }
    }
}

/// One chat turn of a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message
{   pub role: Role
  , pub content: String
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>
}

impl Message
{   pub fn new(role: Role, content: impl Into<String>) -> Self
    {   Message
        {   role
          , content: content.into()
          , name: None
        }
    }

    pub fn system(content: impl Into<String>) -> Self
    {   Message::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self
    {   Message::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self
    {   Message::new(Role::Assistant, content)
    }
}

/// Stop sequences, either as text or as backend token ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopTokens
{   Text(Vec<String>)
  , Ids(Vec<i64>)
}

/// Parameters of one generation
///
/// `stop_tokens` and `timeout_ms` serialize as `null` when unset, the
/// gateway requires every field to be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters
{   pub model_id: String
  , pub character_name: String
  , pub temperature: f32
  , pub max_output_length: u32
  , pub stop_tokens: Option<StopTokens>
  , /// `None` disables the completion timeout
    pub timeout_ms: Option<u64>
}

impl Default for GenerationParameters
{   fn default() -> Self
    {   GenerationParameters
        {   model_id: String::new()
          , character_name: "AI".to_string()
          , temperature: 1.0
          , max_output_length: 200
          , stop_tokens: Some(StopTokens::Text(vec![
              "\r".to_string()
            , "\n".to_string()
            ]))
          , timeout_ms: Some(60_000)
        }
    }
}

impl GenerationParameters
{   pub fn with_model(mut self, model_id: impl Into<String>) -> Self
    {   self.model_id = model_id.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self
    {   self.timeout_ms = timeout_ms;
        self
    }

    /// Text stop sequences, token ids are dropped
    pub fn stop_strings(&self) -> Option<Vec<String>>
    {   match &self.stop_tokens
        {   Some(StopTokens::Text(stops)) if !stops.is_empty() => {
              Some(stops.clone())
            }
          , _ => None
        }
    }
}

/// Fields of a `load` request forwarded to the adapter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadParams
{   pub api_key: Option<String>
  , pub preload_model_id: Option<String>
}

// ===== Requests =====

pub const REQUEST_TYPES: [&str; 6] = [
  "load"
, "generate"
, "interrupt"
, "close"
, "get_providers"
, "get_models"
];

const GENERATE_PARAMS: [&str; 6] = [
  "model_id"
, "character_name"
, "temperature"
, "max_output_length"
, "stop_tokens"
, "timeout_ms"
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request
{   Load
    {   unique_request_id: String
      , provider: String
      , #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>
      , #[serde(default, skip_serializing_if = "Option::is_none")]
        preload_model_id: Option<String>
    }
  , Generate
    {   unique_request_id: String
      , messages: Vec<Message>
      , params: GenerationParameters
      , stream: bool
    }
  , Interrupt
    {   unique_request_id: String
    }
  , Close
    {   unique_request_id: String
    }
  , GetProviders
    {   unique_request_id: String
    }
  , GetModels
    {   unique_request_id: String
    }
}

impl Request
{   pub fn request_id(&self) -> &str
    {   match self
        {   Request::Load { unique_request_id, .. }
          | Request::Generate { unique_request_id, .. }
          | Request::Interrupt { unique_request_id }
          | Request::Close { unique_request_id }
          | Request::GetProviders { unique_request_id }
          | Request::GetModels { unique_request_id } => unique_request_id
        }
    }

    pub fn type_name(&self) -> &'static str
    {   match self
        {   Request::Load { .. } => "load"
          , Request::Generate { .. } => "generate"
          , Request::Interrupt { .. } => "interrupt"
          , Request::Close { .. } => "close"
          , Request::GetProviders { .. } => "get_providers"
          , Request::GetModels { .. } => "get_models"
        }
    }
}

/// Why an inbound frame was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError
{   MalformedJson(String)
  , NotAnObject
  , MissingField
    {   request_type: Option<String>
      , field: String
    }
  , UnknownType(String)
  , InvalidField(String)
}

impl fmt::Display for EnvelopeError
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   match self
        {   EnvelopeError::MalformedJson(msg) => {
              write!(f, "Failed to parse incoming message as JSON: {}", msg)
            }
          , EnvelopeError::NotAnObject => {
              write!(f, "Parsed message is not a JSON object")
            }
          , EnvelopeError::MissingField { request_type: None, field } => {
              write!(f,
                "Incoming message does not have the required field \"{}\"",
                field
              )
            }
          , EnvelopeError::MissingField {
              request_type: Some(kind), field
            } => {
              write!(f,
                "Incoming {} message does not have the required field \"{}\"",
                kind, field
              )
            }
          , EnvelopeError::UnknownType(kind) => {
              write!(f,
                "Incoming message has invalid type \"{}\", valid types are: {}",
                kind,
                REQUEST_TYPES.join(", ")
              )
            }
          , EnvelopeError::InvalidField(msg) => {
              write!(f, "Incoming message has an invalid field: {}", msg)
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

fn require(
  object: &serde_json::Map<String, Value>
, request_type: Option<&str>
, field: &str
) -> Result<(), EnvelopeError>
{   if object.contains_key(field)
    {   Ok(())
    } else
    {   Err(EnvelopeError::MissingField
        {   request_type: request_type.map(str::to_string)
          , field: field.to_string()
        })
    }
}

/// Copy of a raw envelope that is safe to log
pub fn redacted(value: &Value) -> Value
{   let mut copy = value.clone();
    if let Some(object) = copy.as_object_mut()
    {   if object.contains_key("api_key")
        {   object.insert(
              "api_key".to_string(),
              Value::String("hidden".to_string())
            );
        }
    }
    copy
}

/// Validate and type one inbound text frame
pub fn parse_request(text: &str) -> Result<Request, EnvelopeError>
{   let value: Value = serde_json::from_str(text)
      .map_err(|e| EnvelopeError::MalformedJson(e.to_string()))?;
    trace!("Received: {}", redacted(&value));

    let object = value.as_object()
      .ok_or(EnvelopeError::NotAnObject)?;
    require(object, None, "type")?;
    require(object, None, "unique_request_id")?;

    let kind = object.get("type")
      .and_then(Value::as_str)
      .ok_or_else(|| EnvelopeError::InvalidField(
        "\"type\" must be a string".to_string()
      ))?;

    match kind
    {   "load" => {
          require(object, Some(kind), "provider")?;
        }
      , "generate" => {
          for field in ["messages", "params", "stream"]
          {   require(object, Some(kind), field)?;
          }
          let params = object.get("params")
            .and_then(Value::as_object)
            .ok_or_else(|| EnvelopeError::InvalidField(
              "\"params\" must be an object".to_string()
            ))?;
          // null is allowed, absence is not
          if let Some(field) = GENERATE_PARAMS
            .iter()
            .find(|field| !params.contains_key(**field))
          {   return Err(EnvelopeError::MissingField
              {   request_type: Some(kind.to_string())
                , field: format!("params.{}", field)
              });
          }
        }
      , "interrupt" | "close" | "get_providers" | "get_models" => {}
      , other => {
          return Err(EnvelopeError::UnknownType(other.to_string()));
        }
    }

    serde_json::from_value(value)
      .map_err(|e| EnvelopeError::InvalidField(e.to_string()))
}

// ===== Responses =====

/// Discriminant of a response, used to key waiters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind
{   LoadAck
  , LoadDone
  , GenerateAck
  , GenerateDone
  , GenerateStreamChunk
  , GenerateStreamDone
  , InterruptAck
  , CloseAck
  , GetProvidersDone
  , GetModelsDone
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response
{   LoadAck
    {   unique_request_id: String
      , provider: String
    }
  , LoadDone
    {   unique_request_id: String
      , provider: String
      , is_error: bool
      , error: ErrorKind
    }
  , GenerateAck
    {   unique_request_id: String
    }
  , GenerateDone
    {   unique_request_id: String
      , is_error: bool
      , error: ErrorKind
      , response: String
    }
  , GenerateStreamChunk
    {   unique_request_id: String
      , chunk: String
    }
  , GenerateStreamDone
    {   unique_request_id: String
      , is_error: bool
      , error: ErrorKind
    }
  , InterruptAck
    {   unique_request_id: String
    }
  , CloseAck
    {   unique_request_id: String
    }
  , GetProvidersDone
    {   unique_request_id: String
      , providers: Vec<String>
    }
  , GetModelsDone
    {   unique_request_id: String
      , models: Vec<String>
    }
}

impl Response
{   pub fn load_done(id: &str, provider: &str, error: ErrorKind) -> Self
    {   Response::LoadDone
        {   unique_request_id: id.to_string()
          , provider: provider.to_string()
          , is_error: error.is_error()
          , error
        }
    }

    pub fn generate_done(
      id: &str
    , result: Result<String, ErrorKind>
    ) -> Self
    {   let error = ErrorKind::of(&result);
        Response::GenerateDone
        {   unique_request_id: id.to_string()
          , is_error: error.is_error()
          , error
          , response: result.unwrap_or_default()
        }
    }

    pub fn generate_stream_done(id: &str, error: ErrorKind) -> Self
    {   Response::GenerateStreamDone
        {   unique_request_id: id.to_string()
          , is_error: error.is_error()
          , error
        }
    }

    pub fn kind(&self) -> ResponseKind
    {   match self
        {   Response::LoadAck { .. } => ResponseKind::LoadAck
          , Response::LoadDone { .. } => ResponseKind::LoadDone
          , Response::GenerateAck { .. } => ResponseKind::GenerateAck
          , Response::GenerateDone { .. } => ResponseKind::GenerateDone
          , Response::GenerateStreamChunk { .. } => {
              ResponseKind::GenerateStreamChunk
            }
          , Response::GenerateStreamDone { .. } => {
              ResponseKind::GenerateStreamDone
            }
          , Response::InterruptAck { .. } => ResponseKind::InterruptAck
          , Response::CloseAck { .. } => ResponseKind::CloseAck
          , Response::GetProvidersDone { .. } => ResponseKind::GetProvidersDone
          , Response::GetModelsDone { .. } => ResponseKind::GetModelsDone
        }
    }

    pub fn request_id(&self) -> &str
    {   match self
        {   Response::LoadAck { unique_request_id, .. }
          | Response::LoadDone { unique_request_id, .. }
          | Response::GenerateAck { unique_request_id }
          | Response::GenerateDone { unique_request_id, .. }
          | Response::GenerateStreamChunk { unique_request_id, .. }
          | Response::GenerateStreamDone { unique_request_id, .. }
          | Response::InterruptAck { unique_request_id }
          | Response::CloseAck { unique_request_id }
          | Response::GetProvidersDone { unique_request_id, .. }
          | Response::GetModelsDone { unique_request_id, .. } => {
              unique_request_id
            }
        }
    }

    /// Error kind carried by a terminal envelope
    pub fn error(&self) -> Option<ErrorKind>
    {   match self
        {   Response::LoadDone { error, .. }
          | Response::GenerateDone { error, .. }
          | Response::GenerateStreamDone { error, .. } => Some(*error)
          , _ => None
        }
    }
}
