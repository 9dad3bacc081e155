//! Configuration for the gateway process and its providers

use std::path::Path;
use serde::{Deserialize, Serialize};
use log::debug;

/// Default port the gateway listens on
pub const DEFAULT_PORT: u16 = 7562;

/// Default bind address, the gateway is local-only
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Provider configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig
{   /// Provider name
    pub name: String
  , /// API base URL (if custom)
    pub api_base: Option<String>
  , /// HTTP connect timeout in seconds
    pub timeout_secs: Option<u64>
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig
{   /// Address to bind the socket server to
    pub host: String
  , /// Port to bind the socket server to
    pub port: u16
  , /// Provider configurations
    pub providers: Vec<ProviderConfig>
}

impl Default for GatewayConfig
{   fn default() -> Self
    {   GatewayConfig
        {   host: DEFAULT_HOST.to_string()
          , port: DEFAULT_PORT
          , providers: vec![]
        }
    }
}

impl GatewayConfig
{   /// Load configuration from a JSON file
    pub fn from_file(path: &Path)
      -> Result<Self, crate::error::Error>
    {   debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)
          .map_err(|e| {
            crate::error::Error::InvalidConfiguration(
              format!("{}: {}", path.display(), e)
            )
          })?;
        let config: GatewayConfig = serde_json::from_str(&text)
          .map_err(|e| {
            crate::error::Error::InvalidConfiguration(
              format!("{}: {}", path.display(), e)
            )
          })?;
        Ok(config)
    }

    /// Settings for one provider, defaulted when not configured
    pub fn provider(&self, name: &str) -> ProviderConfig
    {   self.providers
          .iter()
          .find(|p| p.name == name)
          .cloned()
          .unwrap_or_else(|| ProviderConfig
          {   name: name.to_string()
            , ..ProviderConfig::default()
          })
    }

    /// Override the API base of one provider
    pub fn with_api_base(
      mut self
    , name: &str
    , api_base: impl Into<String>
    ) -> Self
    {   let api_base = Some(api_base.into());
        match self.providers.iter_mut().find(|p| p.name == name)
        {   Some(existing) => existing.api_base = api_base
          , None => self.providers.push(ProviderConfig
            {   name: name.to_string()
              , api_base
              , timeout_secs: None
            })
        }
        self
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    #[test]
    fn partial_json_keeps_defaults()
    {   let config: GatewayConfig = serde_json::from_str(
          r#"{ "providers": [ { "name": "groq", "api_base": "http://localhost:9000" } ] }"#
        ).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(
          config.provider("groq").api_base.as_deref(),
          Some("http://localhost:9000")
        );
        assert_eq!(config.provider("openai").api_base, None);
    }

    #[test]
    fn api_base_override_replaces_existing_entry()
    {   let config = GatewayConfig::default()
          .with_api_base("openai", "http://a")
          .with_api_base("openai", "http://b");
        assert_eq!(config.providers.len(), 1);
        assert_eq!(
          config.provider("openai").api_base.as_deref(),
          Some("http://b")
        );
    }

    #[test]
    fn missing_file_is_a_configuration_error()
    {   let err = GatewayConfig::from_file(Path::new("/nonexistent/llmgate.json"))
          .unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidConfiguration(_)));
    }
}
