use anyhow::{Context, Result, anyhow, bail};
use bq_analyst::app::{self, LlmOverride};
use bq_analyst::config::Config;
use bq_analyst::llm::Provider;
use bq_analyst::server::{self, AppState};
use bq_analyst::tools::{self, ToolContext};
use clap::Parser;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "bq-analyst",
    about = "Conversational BigQuery analyst: ask questions in plain language, get SQL and results"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// LLM provider override: vertex, gemini
    #[arg(long, global = true)]
    provider: Option<String>,

    /// LLM model override
    #[arg(long, global = true)]
    model: Option<String>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Serve the HTTP API (and the web frontend, if built)
    Serve {
        /// Bind address override
        #[arg(long)]
        host: Option<String>,

        /// Port override
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Interactive conversation on stdin
    Chat,

    /// Ask one question and print the answer
    Ask {
        /// The question, in plain language
        question: String,
    },

    /// Call a single tool directly, bypassing the model
    Tool {
        /// Tool name, e.g. list_datasets or dry_run_query
        name: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

fn make_llm_override(provider: Option<String>, model: Option<String>) -> Result<LlmOverride> {
    let provider = provider
        .map(|p| {
            Provider::parse(&p)
                .ok_or_else(|| anyhow!("unknown provider '{p}': expected vertex or gemini"))
        })
        .transpose()?;
    Ok(LlmOverride { provider, model })
}

fn load_config(path: &Path, llm_override: &LlmOverride) -> Result<Config> {
    let mut config = Config::load_or_default(path)?;
    llm_override.apply(&mut config);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::from_path("../.env").ok();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_filter = match cli.command {
        Command::Serve { .. } => "bq_analyst=info,tower_http=info",
        _ => "bq_analyst=info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let llm_override = make_llm_override(cli.provider, cli.model)?;
    let mut config = load_config(&cli.config, &llm_override)?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let runner = app::build_runner(&config).await?;
            let state = Arc::new(AppState::new(config.agent.app_name.clone(), runner));
            server::serve(state, &config.server).await
        }
        Command::Chat => chat(&config).await,
        Command::Ask { question } => {
            let runner = app::build_runner(&config).await?;
            let mut state = Map::new();
            let outcome = runner
                .run_turn("cli", &[], &mut state, &question, None)
                .await?;
            let answer = match outcome.events.last() {
                Some(last) if outcome.final_text.is_empty() => last.text(),
                _ => outcome.final_text,
            };
            println!("{answer}");
            info!(
                turns = outcome.stats.turns,
                tool_calls = outcome.stats.tool_calls,
                cost = format!("${:.4}", outcome.stats.cost_usd),
                "done"
            );
            Ok(())
        }
        Command::Tool { name, args } => {
            let input: Value = serde_json::from_str(&args).context("--args must be valid JSON")?;
            if !input.is_object() {
                bail!("--args must be a JSON object");
            }
            let conn = app::connect(&config).await?;
            let ctx = ToolContext {
                warehouse: conn.warehouse.as_ref(),
                config: &config.agent,
            };
            let (output, is_error) = tools::dispatch(&ctx, &name, &input).await;
            if is_error {
                bail!("{output}");
            }
            println!("{output}");
            Ok(())
        }
    }
}

/// Read questions from stdin until EOF or `exit`, keeping one conversation.
async fn chat(config: &Config) -> Result<()> {
    let runner = app::build_runner(config).await?;
    let session_id = uuid::Uuid::new_v4().to_string();
    let mut history = Vec::new();
    let mut state = Map::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Ask a question about your data (type 'exit' to quit).");
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        match runner
            .run_turn(&session_id, &history, &mut state, question, None)
            .await
        {
            Ok(outcome) => {
                for event in &outcome.events {
                    for call in &event.function_calls {
                        println!("  [tool] {}", call.name);
                    }
                }
                match outcome.events.last() {
                    Some(last) if outcome.final_text.is_empty() => println!("{}", last.text()),
                    _ => println!("{}", outcome.final_text),
                }
                history.extend(bq_analyst::agent::history_from_events(&outcome.events));
            }
            Err(e) => eprintln!("error: {e:#}"),
        }
    }
    Ok(())
}
