use std::path::PathBuf;
use clap::Parser;
use log::{error, info};

use llmgate::{GatewayConfig, Registry, Server};

/// Local WebSocket gateway to hosted LLM providers
#[derive(Parser, Debug)]
#[command(name = "llmgate", version, about)]
struct Args
{   /// Port to listen on [default: 7562]
    port: Option<u16>

  , /// Address to bind to [default: 127.0.0.1]
    #[arg(long, value_name = "HOST")]
    host: Option<String>

  , /// JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>
}

async fn run(args: Args) -> Result<(), llmgate::Error>
{   let mut config = match &args.config
    {   Some(path) => GatewayConfig::from_file(path)?
      , None => GatewayConfig::default()
    };
    if let Some(port) = args.port
    {   config.port = port;
    }
    if let Some(host) = args.host
    {   config.host = host;
    }

    let registry = Registry::with_builtin(config.clone());
    Server::bind(&config, registry).await?.run().await
}

#[tokio::main]
async fn main()
{   env_logger::Builder::from_env(
      env_logger::Env::default().default_filter_or("info")
    ).init();

    let args = match Args::try_parse()
    {   Ok(args) => args
      , Err(e) => {
          use clap::error::ErrorKind;
          if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion)
          {   e.exit();
          }
          let _ = e.print();
          std::process::exit(1);
        }
    };

    match run(args).await
    {   Ok(()) => {
          info!("Exiting");
          std::process::exit(0);
        }
      , Err(e) => {
          error!("{}", e);
          std::process::exit(1);
        }
    }
}
