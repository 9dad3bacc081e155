//! Mistral AI chat completions
//!
//! Used without streaming; a stream request is answered with the whole
//! response as a single fragment.

use crate::config::ProviderConfig;
use crate::providers::openai_compat::{CompatProvider, Profile, Streaming};
use crate::supervisor::Cancellation;

pub const NAME: &str = "mistral";

const MISTRAL_API_BASE: &str
  = "https://api.mistral.ai/v1";

pub const PROFILE: Profile = Profile
{   name: NAME
  , api_base: MISTRAL_API_BASE
  , streaming: Streaming::Wrapped
  , cancellation: Cancellation::Cooperative
};

pub fn new(config: &ProviderConfig) -> CompatProvider
{   CompatProvider::new(PROFILE, config)
}
