//! notes-relay - AI prompt relay for note taking
//!
//! Runs the relay pipeline in process: a Controller dispatches prompts to a
//! page's bridge, the page's Session Host prompts the language model, and the
//! normalized result travels back by request id.
//!
//! The language model here is scripted: `prompt` replies with the contents of
//! `--response-file`, which makes the whole pipeline reproducible from a shell.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser as ClapParser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notes_relay::{
    assistant::{Assistant, MemoryNoteStore, PageContext},
    config::RelayConfig,
    controller::Controller,
    fallback::FallbackChain,
    model::ScriptedModel,
    page::{check_eligible, ActivePage, Page, PageId, TargetPage},
    response::parse_model_output,
    transport::LocalTransport,
};

/// notes-relay - AI prompt relay for note taking
#[derive(ClapParser, Debug)]
#[command(name = "notes-relay", version, about, long_about = None)]
struct Cli {
    /// Path to the config file
    #[arg(long, env = "NOTES_RELAY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Normalize raw model output into a result (reads stdin without FILE)
    Parse {
        file: Option<PathBuf>,
    },

    /// Check whether prompts can be relayed to a page
    CheckPage {
        url: String,
    },

    /// Relay one prompt through the full pipeline
    Prompt {
        /// Address of the page to relay through
        #[arg(long)]
        page: String,

        /// File whose contents the language model replies with
        #[arg(long)]
        response_file: PathBuf,

        /// System prompt for the session (overrides the config)
        #[arg(long)]
        system_prompt: Option<String>,

        /// The request text
        text: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = RelayConfig::load_or_default(cli.config.as_deref())
        .context("loading configuration")?;

    match cli.command {
        Commands::Parse { file } => run_parse(file.as_deref()).await,
        Commands::CheckPage { url } => run_check_page(&config, url),
        Commands::Prompt {
            page,
            response_file,
            system_prompt,
            text,
        } => run_prompt(&config, page, &response_file, system_prompt, &text).await,
    }
}

/// Logs go to stderr; stdout carries the JSON results.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "notes_relay=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_parse(file: Option<&Path>) -> anyhow::Result<()> {
    let raw = match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("reading stdin")?;
            raw
        }
    };
    println!("{}", serde_json::to_string_pretty(&parse_model_output(&raw))?);
    Ok(())
}

fn run_check_page(config: &RelayConfig, url: String) -> anyhow::Result<()> {
    let target = TargetPage {
        id: PageId::new(),
        url,
    };
    match check_eligible(Some(target), &config.relay.allowed_schemes) {
        Ok(page) => {
            println!("eligible: {}", page.url);
            Ok(())
        }
        Err(e) => bail!("{e}"),
    }
}

async fn run_prompt(
    config: &RelayConfig,
    url: String,
    response_file: &Path,
    system_prompt: Option<String>,
    text: &str,
) -> anyhow::Result<()> {
    let reply = tokio::fs::read_to_string(response_file)
        .await
        .with_context(|| format!("reading {}", response_file.display()))?;
    let model = ScriptedModel::replying(reply);

    let active = ActivePage::new();
    let transport = LocalTransport::new();
    let controller = Controller::spawn(
        Arc::new(active.clone()),
        Arc::new(transport.clone()),
        &config.relay,
    );

    let page = Page::open(url, Some(Arc::new(model)), controller.result_sink());
    transport.register(page.bridge());
    active.set(page.target());

    let store = MemoryNoteStore::new();
    let mut assistant = Assistant::new(
        FallbackChain::standard(None, None, controller.clone()),
        Arc::new(store.clone()),
    );
    if let Some(prompt) = system_prompt.or_else(|| config.assistant.system_prompt.clone()) {
        assistant = assistant.with_system_prompt(prompt);
    }

    let context = PageContext {
        source_url: page.target().url,
        page_title: String::new(),
    };
    let outcome = assistant.generate(text, None, Some(&context)).await;

    transport.unregister(page.id());
    page.close().await;
    controller.shutdown();

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            for note in store.notes() {
                tracing::info!(note = note.id.as_str(), title = %note.title, "note created");
            }
            Ok(())
        }
        Err(message) => bail!("{message}"),
    }
}
