use std::io::Write;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;

use chatrace_core::config;
use chatrace_core::provider;
use chatrace_core::sse::{delta_text, FrameSplitter, ReplyExtractor};
use chatrace_core::types::Message;
use chatrace_core::util::http;

#[derive(Parser)]
#[command(
    name = "chatrace",
    about = "chatrace - race LLM providers, stream the first live answer",
    version = chatrace_core::VERSION,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show configured providers and race settings
    Status,
    /// Chat through a running chatrace server
    Chat {
        /// Message to send (or omit for interactive mode)
        message: Vec<String>,
        /// API endpoint
        #[arg(long, default_value = "http://localhost:3000/api/v1/chat")]
        api: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.command {
        Commands::Serve { verbose: true, .. } => "chatrace=debug",
        _ => "chatrace=info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?),
        )
        .init();

    match cli.command {
        Commands::Serve { host, port, .. } => cmd_serve(host, port).await?,
        Commands::Status => cmd_status()?,
        Commands::Chat { message, api } => cmd_chat(message, api).await?,
    }

    Ok(())
}

// ====== Commands ======

#[cfg(feature = "http-api")]
async fn cmd_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    use std::sync::Arc;

    use chatrace_core::service::http::{serve, AppState};

    let mut cfg = config::load_config_from_env();
    if let Some(host) = host {
        cfg.gateway.host = host;
    }
    if let Some(port) = port {
        cfg.gateway.port = port;
    }

    let addr = cfg.gateway.addr();
    let state = Arc::new(AppState::new(cfg)?);
    if state.providers.is_empty() {
        tracing::warn!("No complete provider configured; chat requests will get 503");
    }

    println!(
        "Starting chatrace on {} with {} provider(s)...",
        addr,
        state.providers.len()
    );
    serve(&addr, state).await
}

#[cfg(not(feature = "http-api"))]
async fn cmd_serve(_host: Option<String>, _port: Option<u16>) -> Result<()> {
    anyhow::bail!("chatrace was built without the http-api feature")
}

fn cmd_status() -> Result<()> {
    let config_path = config::get_config_path();
    let cfg = config::load_config_from_env();
    let providers = provider::load_providers(&cfg);

    println!("chatrace Status\n");
    println!(
        "Config: {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗" }
    );

    println!("\nProviders ({}/{}):", providers.len(), provider::MAX_PROVIDERS);
    if providers.is_empty() {
        println!("  none configured (set PROVIDER_1_BASE_URL, PROVIDER_1_API_KEY, PROVIDER_1_MODEL)");
    }
    for p in &providers {
        println!("  ✓ {} [{}] {} @ {}", p.display_name, p.id, p.model, p.base_endpoint);
    }

    println!("\nRace:");
    println!("  Deadline: {:?}", cfg.race.deadline());
    println!(
        "  Attempts: {} ({:?} apart)",
        cfg.race.max_attempts,
        cfg.race.retry_delay()
    );
    println!("  Temperature: {}", cfg.sampling.temperature);
    println!(
        "  First-turn prompt: {}",
        if cfg.prompt.first_turn.is_some() { "✓" } else { "not set" }
    );
    println!("\nListen: {}", cfg.gateway.addr());

    Ok(())
}

/// Chat against a chatrace server, keeping the conversation locally.
async fn cmd_chat(message: Vec<String>, api_url: String) -> Result<()> {
    let client = http::client();
    let mut history: Vec<Message> = Vec::new();

    if !message.is_empty() {
        history.push(Message::user(message.join(" ")));
        chat_api(client, &api_url, &history, true).await?;
        return Ok(());
    }

    println!("chatrace CLI (Ctrl+C to exit)");
    println!("  API: {}\n", api_url);

    loop {
        print!("You: ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        let is_first = history.is_empty();
        history.push(Message::user(input));
        match chat_api(client, &api_url, &history, is_first).await {
            Ok(raw) => history.push(Message::assistant(raw)),
            Err(e) => {
                history.pop();
                eprintln!("Error: {}", e);
            }
        }
        println!();
    }

    Ok(())
}

/// Post the conversation and print the `reply` field as it streams in.
/// Returns the raw model output for the history.
async fn chat_api(
    client: &reqwest::Client,
    api_url: &str,
    history: &[Message],
    is_first: bool,
) -> Result<String> {
    let resp = client
        .post(api_url)
        .json(&serde_json::json!({ "messages": history, "isFirst": is_first }))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        anyhow::bail!(
            "{} ({})",
            body["error"].as_str().unwrap_or("request failed"),
            status
        );
    }
    let winner = resp
        .headers()
        .get("x-chat-provider")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    tracing::debug!("Answer streamed by {}", winner);

    let mut splitter = FrameSplitter::new();
    let mut reply = ReplyExtractor::new("reply");
    let mut raw = String::new();
    let mut stdout = std::io::stdout();
    print!("\nAI: ");

    let mut body = resp.bytes_stream();
    let mut frames = Vec::new();
    loop {
        let done = match body.next().await {
            Some(chunk) => {
                frames.extend(splitter.push_bytes(&chunk?));
                false
            }
            None => {
                frames.extend(splitter.finish());
                true
            }
        };
        for frame in frames.drain(..) {
            if let Some(text) = delta_text(&frame) {
                raw.push_str(&text);
                print!("{}", reply.push(&text));
                stdout.flush()?;
            }
        }
        if done {
            break;
        }
    }

    // Model ignored the JSON format: show what it said.
    if reply.value().is_empty() {
        print!("{}", raw.trim());
    }
    println!();
    Ok(raw)
}
