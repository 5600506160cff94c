//! Callosum CLI - summarise, explain, rewrite and chat about web pages with a
//! local LLM server.
//!
//! The application logic is contained in lib.rs, and this file is responsible
//! for parsing arguments and handling top-level errors.

use anyhow::Context;
use callosum::extractor::{self, ExtractedContext};
use callosum::storage::{self, HistoryStore};
use callosum::{
    Action, AgentError, Assistant, CallOptions, CancellationToken, InferenceClient, Role,
    Settings, TextSource,
};
use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use dialoguer::Confirm;
use scraper::Html;
use std::io::{self, Read, Write};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "callosum")]
#[command(author, version, about = "Summarise, explain, rewrite and chat about web pages with a local LLM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarise a webpage by URL
    Summarise {
        /// URL to summarise
        url: String,
        /// Show raw extracted text instead of summary
        #[arg(long)]
        raw: bool,
    },
    /// Explain a piece of text (read from stdin when omitted)
    Explain { text: Option<String> },
    /// Rewrite a piece of text for clarity and tone (read from stdin when omitted)
    Rewrite { text: Option<String> },
    /// Ask a question about a webpage, keeping per-site history
    Chat {
        /// Page the conversation belongs to
        url: String,
        /// Your message
        message: String,
        /// Do not send the page content along with the message
        #[arg(long)]
        no_context: bool,
        /// Text selected on the page
        #[arg(long)]
        selection: Option<String>,
    },
    /// Show or clear the chat history for a site
    History {
        url: String,
        /// Start a new chat by clearing the stored history
        #[arg(long)]
        clear: bool,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// Check that the local model server is reachable
    Status,
    /// Print the effective configuration
    Config {
        /// Write the defaults to the user config file if it does not exist
        #[arg(long)]
        init: bool,
    },
    /// Generate shell completions
    Completions { shell: clap_complete::Shell },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("callosum=warn")),
        )
        .with_writer(io::stderr)
        .init();

    if !atty::is(atty::Stream::Stdout) {
        colored::control::set_override(false);
    }

    let settings = Settings::load()?;
    let client = InferenceClient::new()?;
    let assistant = Assistant::new(&client, &settings);

    match cli.command {
        Commands::Summarise { url, raw } => {
            eprintln!("Fetching: {}", url);

            if raw {
                let document = fetch_document(&url).await?;
                let text = extractor::page_text(&document);
                println!("\n=== {} ===\n", extractor::page_title(&document));
                println!("{}", text);
                println!("\n--- Extracted {} characters ---", text.chars().count());
            } else {
                let page = fetch_context(&url, None, settings.max_context_chars).await?;
                eprintln!("Summarising {} characters...\n", page.content.chars().count());
                let cancel = cancel_on_ctrl_c();
                let result = assistant
                    .summarize_page(&page, streaming_options(&cancel))
                    .await;
                finish(result)?;
            }
        }
        Commands::Explain { text } => {
            run_text_action(&assistant, Action::Explain, text).await?;
        }
        Commands::Rewrite { text } => {
            run_text_action(&assistant, Action::Rewrite, text).await?;
        }
        Commands::Chat {
            url,
            message,
            no_context,
            selection,
        } => {
            let origin = storage::origin_of(&url)?;
            let page = if settings.include_page_context && !no_context {
                Some(fetch_context(&url, selection.as_deref(), settings.max_context_chars).await?)
            } else {
                None
            };
            let store = HistoryStore::open(&settings.storage.path)?;

            let cancel = cancel_on_ctrl_c();
            let result = assistant
                .chat(
                    &store,
                    &origin,
                    &message,
                    page.as_ref(),
                    streaming_options(&cancel),
                )
                .await;
            finish(result)?;
        }
        Commands::History { url, clear, yes } => {
            let origin = storage::origin_of(&url)?;
            let store = HistoryStore::open(&settings.storage.path)?;

            if clear {
                let confirmed = yes
                    || Confirm::new()
                        .with_prompt("Start a new chat? This will clear the current conversation.")
                        .default(false)
                        .interact()?;
                if confirmed && store.clear(&origin)? {
                    println!("Cleared chat history for {}", origin);
                }
            } else {
                let history = store.load(&origin)?;
                if history.is_empty() {
                    println!("No chat history for {}", origin);
                }
                for message in history {
                    let role = match message.role {
                        Role::User => "you".cyan().bold(),
                        Role::Assistant => "callosum".green().bold(),
                        Role::System => "system".dimmed(),
                    };
                    println!("{}: {}\n", role, message.content);
                }
            }
        }
        Commands::Status => {
            let config = settings.request_config()?;
            if client.check_connection(&config).await {
                println!("{} {}", "✓ connected to".green(), config.endpoint);
                match client.list_models(&config).await {
                    Ok(models) if models.is_empty() => println!("  no models installed"),
                    Ok(models) => {
                        for model in models {
                            let marker = if model.starts_with(&config.model) { "*" } else { " " };
                            println!("  {} {}", marker, model);
                        }
                    }
                    Err(e) => eprintln!("  could not list models: {}", e),
                }
            } else {
                println!(
                    "{} {}. Please make sure it's running.",
                    "✗ cannot connect to".red(),
                    config.endpoint
                );
            }
        }
        Commands::Config { init } => {
            if init {
                let path = Settings::default_path();
                if path.exists() {
                    eprintln!("Config already exists at {}", path.display());
                } else {
                    Settings::default().save_to(&path)?;
                    eprintln!("Wrote {}", path.display());
                }
            }
            print!("{}", settings.to_toml()?);
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "callosum", &mut io::stdout());
        }
    }

    Ok(())
}

/// Fetch and parse a page.
async fn fetch_document(url: &str) -> anyhow::Result<Html> {
    let html = extractor::fetch_html(url)
        .await
        .with_context(|| format!("could not load {}", url))?;
    Ok(Html::parse_document(&html))
}

/// Fetch a page and extract its context.
async fn fetch_context(
    url: &str,
    selection: Option<&str>,
    max_chars: usize,
) -> anyhow::Result<ExtractedContext> {
    let document = fetch_document(url).await?;
    Ok(extractor::extract_page_context(
        &document, url, selection, max_chars,
    ))
}

async fn run_text_action(
    assistant: &Assistant<'_>,
    action: Action,
    text: Option<String>,
) -> anyhow::Result<()> {
    let text = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let cancel = cancel_on_ctrl_c();
    let result = assistant
        .run_action(action, TextSource::Free(&text), streaming_options(&cancel))
        .await;
    finish(result)
}

/// Token that fires when the user presses Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

/// Print tokens as they arrive.
fn streaming_options(cancel: &CancellationToken) -> CallOptions<'static> {
    CallOptions::new()
        .on_token(|token| {
            let mut stdout = io::stdout();
            let _ = stdout.write_all(token.as_bytes());
            let _ = stdout.flush();
        })
        .cancel_token(cancel.clone())
}

fn finish(result: Result<String, AgentError>) -> anyhow::Result<()> {
    match result {
        Ok(_) => {
            println!();
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            eprintln!("\n{}", "Request was cancelled".yellow());
            Ok(())
        }
        Err(e) if e.is_timeout() => {
            Err(anyhow::Error::new(e).context("the local model server did not answer in time"))
        }
        Err(e) => Err(e.into()),
    }
}
