//! Groq, OpenAI-compatible endpoint
//!
//! Streams natively and supports a true abort: an interrupt drops the
//! in-flight HTTP request instead of waiting for the next chunk.

use crate::config::ProviderConfig;
use crate::providers::openai_compat::{CompatProvider, Profile, Streaming};
use crate::supervisor::Cancellation;

pub const NAME: &str = "groq";

pub const PROFILE: Profile = Profile
{   name: NAME
  , api_base: "https://api.groq.com/openai/v1"
  , streaming: Streaming::Native
  , cancellation: Cancellation::Abortable
};

pub fn new(config: &ProviderConfig) -> CompatProvider
{   CompatProvider::new(PROFILE, config)
}
