use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use switchyard_agent::cache::plan_cache;
use switchyard_agent::{AgentEvent, Orchestrator, TurnRequest};
use switchyard_core::config::Config;
use switchyard_core::protocol::{BlockDelta, LineBuffer, MessageAssembler, StreamEvent, decode_line};
use switchyard_core::types::Message;
use switchyard_gateway::GatewayState;

mod logging;

#[derive(Parser)]
#[command(
    name = "switchyard",
    about = "LLM inference orchestration: agent turns, guardrails, metering and an NDJSON gateway",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 8686)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a single turn and stream the reply to stdout
    Chat {
        /// Message to send
        #[arg(short, long)]
        message: String,

        /// Model to use
        #[arg(long)]
        model: Option<String>,

        /// User the turn is billed to
        #[arg(long, default_value = "local")]
        user: String,

        /// System prompt override
        #[arg(long)]
        system: Option<String>,

        /// Use a buffered backend call instead of streaming
        #[arg(long)]
        no_stream: bool,
    },

    /// Replay an NDJSON stream capture through the message assembler
    Decode {
        /// Capture file, one stream event per line
        file: PathBuf,
    },

    /// Print the prompt-cache plan for a JSON array of messages
    PlanCache {
        /// Messages file
        file: PathBuf,

        /// Model to plan for (default: agent.model)
        #[arg(long)]
        model: Option<String>,
    },

    /// Budget management
    Budget {
        #[command(subcommand)]
        action: BudgetAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BudgetAction {
    /// Show a user's budget and remaining balance
    Show { user: String },
    /// Set a user's budget (omit the amount for unlimited)
    Set { user: String, amount: Option<f64> },
    /// Restore a user's balance to the full budget
    Reset { user: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value by dotted path
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    logging::init(config.logging.as_ref(), cli.verbose)?;
    let config = Arc::new(config);

    match cli.command {
        Commands::Serve { port, bind } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            let bind = bind.unwrap_or_else(|| config.gateway_bind());
            tracing::info!(config = %config_path.display(), "Starting Switchyard gateway");
            let state = Arc::new(GatewayState::from_config(config).await?);
            switchyard_gateway::start_gateway(state, &bind, port).await?;
        }
        Commands::Chat {
            message,
            model,
            user,
            system,
            no_stream,
        } => {
            let orchestrator = Orchestrator::from_config(config).await?;
            chat(orchestrator, message, model, user, system, no_stream).await?;
        }
        Commands::Decode { file } => decode(&file).await?,
        Commands::PlanCache { file, model } => plan(&config, &file, model).await?,
        Commands::Budget { action } => budget(&config, action).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(config.as_ref())?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("no config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    bail!("configuration has {} error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}

async fn chat(
    orchestrator: Orchestrator,
    message: String,
    model: Option<String>,
    user: String,
    system: Option<String>,
    no_stream: bool,
) -> anyhow::Result<()> {
    // Local users start unlimited unless the store already knows them.
    orchestrator.meter().store().ensure_user(&user, None).await?;

    let mut request = TurnRequest::new(user, message);
    request.model = model;
    request.system = system;
    if no_stream {
        request.stream = Some(false);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let turn = tokio::spawn(async move { orchestrator.run_turn(request, tx, cancel).await });

    let mut stdout = std::io::stdout();
    let mut streamed = false;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::RoundStart { .. } => streamed = false,
            AgentEvent::Stream {
                event:
                    StreamEvent::ContentBlockDelta {
                        delta: BlockDelta::Text(text),
                        ..
                    },
            } => {
                streamed = true;
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            AgentEvent::Message { message } if !streamed => {
                let text = message.text();
                if !text.is_empty() {
                    write!(stdout, "{text}")?;
                }
            }
            AgentEvent::ToolCall { tool, input, .. } => {
                eprintln!("\n[tool] {tool} {input}");
            }
            AgentEvent::ToolResult { tool, is_error, .. } if is_error => {
                eprintln!("[tool] {tool} failed");
            }
            _ => {}
        }
    }
    writeln!(stdout)?;

    let outcome = turn.await??;
    let remaining = outcome
        .remaining
        .map(|r| format!("{r:.4}"))
        .unwrap_or_else(|| "unlimited".into());
    eprintln!(
        "[{} round(s), {} in / {} out tokens, cost {:.4}, remaining {remaining}]",
        outcome.rounds, outcome.usage.input_tokens, outcome.usage.output_tokens, outcome.cost
    );
    Ok(())
}

async fn decode(file: &Path) -> anyhow::Result<()> {
    let raw = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut lines = LineBuffer::new();
    let mut pending = lines.push(&raw);
    pending.extend(lines.finish());

    let mut assembler = MessageAssembler::new();
    for (number, line) in pending.iter().enumerate() {
        if let Some(event) = decode_line(line) {
            assembler
                .apply(&event)
                .with_context(|| format!("line {}", number + 1))?;
        }
    }

    let assembled = assembler.finish();
    let output = json!({
        "message": assembled.message,
        "stop_reason": assembled.stop_reason,
        "usage": assembled.usage,
        "trace": assembled.trace,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn plan(config: &Config, file: &Path, model: Option<String>) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let messages: Vec<Message> = serde_json::from_str(&raw).context("expected a JSON array of messages")?;

    let Some(model_id) = model.or_else(|| config.default_model()) else {
        bail!("no model given and no default model is configured");
    };
    let (tier, supports_cache) = match config.model(&model_id) {
        Some(model) => (model.tier, model.supports_cache),
        None => {
            tracing::warn!(model = %model_id, "Model not in catalog; inferring tier from its id");
            (None, true)
        }
    };

    let plan = plan_cache(&messages, &model_id, tier, supports_cache, &config.cache());
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn budget(config: &Config, action: BudgetAction) -> anyhow::Result<()> {
    let store = switchyard_metering::store_from_config(config).await?;
    let budget = match action {
        BudgetAction::Show { user } => store
            .budget(&user)
            .await?
            .with_context(|| format!("unknown user '{user}'"))?,
        BudgetAction::Set { user, amount } => {
            if matches!(amount, Some(a) if a < 0.0 || !a.is_finite()) {
                bail!("budget must be a non-negative number");
            }
            store.set_budget(&user, amount).await?
        }
        BudgetAction::Reset { user } => store.reset(&user).await?,
    };
    println!("{}", serde_json::to_string_pretty(&budget)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_budget_set() {
        let cli = Cli::try_parse_from(["switchyard", "budget", "set", "alice", "2.5"]).unwrap();
        match cli.command {
            Commands::Budget {
                action: BudgetAction::Set { user, amount },
            } => {
                assert_eq!(user, "alice");
                assert_eq!(amount, Some(2.5));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_cli_chat_defaults_to_local_user() {
        let cli = Cli::try_parse_from(["switchyard", "chat", "-m", "hi"]).unwrap();
        match cli.command {
            Commands::Chat { user, no_stream, .. } => {
                assert_eq!(user, "local");
                assert!(!no_stream);
            }
            _ => panic!("wrong command"),
        }
    }

    #[tokio::test]
    async fn test_plan_cache_reads_messages_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        std::fs::write(
            &path,
            r#"[{"role": "user", "content": [{"type": "text", "text": "hello"}]}]"#,
        )
        .unwrap();
        let config = Config::parse(r#"{ agent: { model: "claude-sonnet" } }"#).unwrap();
        plan(&config, &path, None).await.unwrap();
        assert!(plan(&Config::default(), &path, None).await.is_err());
    }

    #[tokio::test]
    async fn test_decode_rejects_out_of_order_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.ndjson");
        let lines = [
            r#"{"messageStart":{"role":"assistant"}}"#,
            r#"{"contentBlockDelta":{"delta":{"text":"hi"},"contentBlockIndex":3}}"#,
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();
        assert!(decode(&path).await.is_err());
    }
}
