//! OpenAI chat completions
//!
//! Streams natively. Interrupts are cooperative: the flag is checked at
//! every received chunk and once a sync call returns.

use crate::config::ProviderConfig;
use crate::providers::openai_compat::{CompatProvider, Profile, Streaming};
use crate::supervisor::Cancellation;

pub const NAME: &str = "openai";

pub const PROFILE: Profile = Profile
{   name: NAME
  , api_base: "https://api.openai.com/v1"
  , streaming: Streaming::Native
  , cancellation: Cancellation::Cooperative
};

pub fn new(config: &ProviderConfig) -> CompatProvider
{   CompatProvider::new(PROFILE, config)
}
