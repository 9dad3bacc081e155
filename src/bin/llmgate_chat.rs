//! Small demo client: loads OpenAI, asks one question, streams one story.
//!
//! The API key is read from `OPENAI_API_KEY`, or prompted for on stdin.

use std::io::{self, BufRead, Write};
use log::error;

use llmgate::{GatewayClient, GenerationParameters, Message, DEFAULT_PORT};

const MODEL: &str = "gpt-4o-mini";

fn read_api_key() -> io::Result<String>
{   if let Ok(key) = std::env::var("OPENAI_API_KEY")
    {   return Ok(key);
    }
    print!("[INPUT] OpenAI API Key: ");
    io::stdout().flush()?;
    let mut key = String::new();
    io::stdin().lock().read_line(&mut key)?;
    Ok(key.trim().to_string())
}

async fn chat(url: &str) -> Result<(), llmgate::Error>
{   let api_key = read_api_key()
      .map_err(|e| llmgate::Error::Other(e.to_string()))?;
    let client = GatewayClient::connect(url).await?;
    client.load_provider("openai", Some(&api_key), None).await?;

    let params = GenerationParameters
    {   max_output_length: 250
      , stop_tokens: None
      , timeout_ms: Some(5_000)
      , ..GenerationParameters::default()
    }.with_model(MODEL);

    let question = "What is 9 + 10 equal to?";
    println!("[INP] User: {}", question);
    let answer = client
      .generate(vec![Message::user(question)], params.clone())
      .await?;
    println!("[OUT] AI: {}", answer);

    let request = "Write me a very long story, as long as possible.";
    println!("[INP] User: {}", request);
    print!("[OUT] AI: ");
    let _ = io::stdout().flush();
    client
      .generate_stream(
        vec![Message::user(request)],
        GenerationParameters
        {   max_output_length: 500
          , ..params
        },
        |chunk| {
          print!("{}", chunk);
          let _ = io::stdout().flush();
        }
      )
      .await?;
    println!();
    println!("[LOG] Done.");
    Ok(())
}

#[tokio::main]
async fn main()
{   env_logger::Builder::from_env(
      env_logger::Env::default().default_filter_or("info")
    ).init();

    let url = std::env::args()
      .nth(1)
      .unwrap_or_else(|| format!("ws://127.0.0.1:{}", DEFAULT_PORT));
    if let Err(e) = chat(&url).await
    {   error!("{}", e);
        std::process::exit(1);
    }
}
