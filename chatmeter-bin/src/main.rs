use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, bail};
use chatmeter_core::{
    CallOptions, Completion,
    config::Config,
    factory::{self, MeteredOpenAi},
    model::RequestPayload,
};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "chatmeter CLI smoke tool", long_about = None)]
struct Cli {
    /// JSON or TOML config file; environment variables are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CallArgs {
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,
    #[arg(short, long, help = "Message from the user")]
    message: String,
    /// Consult the cache before calling the API
    #[arg(long)]
    cache: bool,
    /// Tag forwarded with the call report, as key=value (repeatable)
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a chat completion request
    Chat {
        #[command(flatten)]
        call: CallArgs,
        /// Use the blocking client instead of the async one
        #[arg(long)]
        blocking: bool,
    },
    /// Stream a chat completion (prints deltas live)
    ChatStream {
        #[command(flatten)]
        call: CallArgs,
    },
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

impl CallArgs {
    fn into_request(self, stream: bool) -> anyhow::Result<(RequestPayload, CallOptions)> {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": self.message}],
        });
        if stream {
            body["stream"] = json!(true);
        }
        let payload = RequestPayload::from_value(body)?;
        let options = CallOptions {
            cache: self.cache,
            tags: self.tags.into_iter().collect(),
            fingerprint: None,
        };
        Ok((payload, options))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env(),
    };
    let client = factory::from_config(&cfg)?;

    match cli.command {
        Commands::Chat { call, blocking } => {
            let (payload, options) = call.into_request(false)?;
            let resp = if blocking {
                tokio::task::spawn_blocking(move || client.create(payload, Some(options)))
                    .await??
                    .into_direct()
            } else {
                client.create_async(payload, Some(options)).await?.into_direct()
            };
            match resp {
                Some(resp) => println!("{}", resp.text().unwrap_or_default()),
                None => bail!("expected a direct completion, got a stream"),
            }
        }
        Commands::ChatStream { call } => {
            let (payload, options) = call.into_request(true)?;
            stream_to_stdout(&client, payload, options).await?;
        }
    }

    Ok(())
}

async fn stream_to_stdout(
    client: &MeteredOpenAi,
    payload: RequestPayload,
    options: CallOptions,
) -> anyhow::Result<()> {
    let mut stream = match client.create_async(payload, Some(options)).await? {
        Completion::Stream(stream) => stream,
        // Cache hits come back whole even for streaming requests.
        Completion::Direct(resp) => {
            println!("{}", resp.text().unwrap_or_default());
            return Ok(());
        }
    };

    let mut stdout = io::stdout();
    let mut finish = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for choice in chunk.choices.iter().filter(|c| c.index == 0) {
            if let Some(text) = &choice.delta.content {
                print!("{text}");
                stdout.flush().ok();
            }
            if choice.finish_reason.is_some() {
                finish = choice.finish_reason.clone();
            }
        }
    }
    println!();
    if let Some(reason) = finish {
        eprintln!("[stop: {reason}]");
    }
    Ok(())
}
