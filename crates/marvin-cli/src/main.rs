use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use colored::*;
use dialoguer::{theme::ColorfulTheme, Input};

use marvin_core::context::build_project_context;
use marvin_core::{
    watcher, AskError, Config, ContextAssembler, History, HistoryStore, Session, UnexpectedRolePolicy, WalkOptions,
};

#[derive(Parser)]
#[command(name = "marvin")]
#[command(about = "Ask questions about the code in your workspace")]
struct Cli {
    /// Workspace folder to scan (repeatable, defaults to the current directory)
    #[arg(short, long, global = true)]
    root: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a single question about the workspace
    Ask {
        /// Your question
        question: String,
        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,
        /// Model to use for this question
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Interactive session; the project context follows file changes
    Chat {
        /// Print answers as they are generated
        #[arg(long)]
        stream: bool,
    },
    /// Show previous questions and answers
    History {
        /// Maximum number of entries
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Delete the stored history
        #[arg(long)]
        clear: bool,
    },
    /// Show the project context that is sent with each question
    Context {
        /// Print the full text instead of a summary
        #[arg(long)]
        full: bool,
    },
    /// Update stored settings
    Config {
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
        /// empty_answer or error
        #[arg(long)]
        unexpected_role: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = Config::load().unwrap_or_else(|err| {
        log::warn!("Could not load config, using defaults: {}", err);
        Config::new()
    });
    let roots = if cli.root.is_empty() {
        vec![std::env::current_dir()?]
    } else {
        cli.root
    };

    match cli.command {
        Commands::Ask { question, stream, model } => {
            let mut config = config;
            if let Some(model) = model {
                config.model = model;
            }
            let session = Arc::new(Session::open(&config, roots).await?);
            let code = exit_code(&ask(&session, &question, stream || config.stream).await);
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Chat { stream } => chat(&config, roots, stream || config.stream).await?,
        Commands::History { limit, clear } => show_history(limit, clear).await?,
        Commands::Context { full } => show_context(&config, &roots, full).await?,
        Commands::Config { api_key, model, endpoint, unexpected_role } => {
            update_config(config, api_key, model, endpoint, unexpected_role)?
        }
    }

    Ok(())
}

/// Ask one question and report the outcome. The error is returned after it
/// has been printed.
async fn ask(session: &Arc<Session>, question: &str, stream: bool) -> Result<(), AskError> {
    // Ctrl-C cancels the request rather than killing the process
    let canceller = {
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                session.cancel_current_query();
            }
        })
    };

    println!("🤖 Asking {}...\n", "the model".bold().magenta());

    let result = if stream {
        let result = session
            .ask_streaming(question, |fragment| {
                print!("{}", fragment);
                let _ = std::io::stdout().flush();
            })
            .await;
        println!();
        result.map(|_| ())
    } else {
        session.ask(question).await.map(|answer| {
            println!("{}", "Response:".bold().green());
            println!("{}", answer);
        })
    };
    canceller.abort();

    match &result {
        Ok(_) => {}
        Err(AskError::Cancelled) => println!("{}", "Query cancelled".yellow()),
        Err(AskError::Busy) => println!("{}", "A query is already running".yellow()),
        Err(AskError::Failed(err)) => {
            eprintln!("{}: {}", "Error querying the model".red(), err);
        }
    }

    result
}

fn exit_code(result: &Result<(), AskError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(AskError::Cancelled) => 130,
        Err(_) => 1,
    }
}

async fn chat(config: &Config, roots: Vec<PathBuf>, stream: bool) -> Result<()> {
    let session = Arc::new(Session::open(config, roots).await?);
    let _watcher = watcher::watch(session.context_store())?;

    println!("\n{}", "💬 Marvin".bold().blue());
    println!(
        "{}",
        "Ask about your project. /history, /clear, /rebuild and /quit are available.".dimmed()
    );

    loop {
        let line = tokio::task::spawn_blocking(|| {
            Input::<String>::with_theme(&ColorfulTheme::default())
                .with_prompt("Question")
                .allow_empty(true)
                .interact_text()
        })
        .await??;

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/history" => print_entries(&session.history(), 10),
            "/clear" => {
                session.clear_history().await;
                println!("{}", "History cleared".green());
            }
            "/rebuild" => {
                session.trigger_context_rebuild().await?;
                println!("{}", "Project context rebuilt".green());
            }
            question => {
                if let Err(err) = ask(&session, question, stream).await {
                    log::debug!("Question not answered: {}", err);
                }
            }
        }
    }

    Ok(())
}

async fn show_history(limit: usize, clear: bool) -> Result<()> {
    let store = HistoryStore::new(Config::history_path()?);

    if clear {
        store.save(&History::new()).await?;
        println!("{}", "History cleared".green());
        return Ok(());
    }

    let history = store.load().await?;
    if history.is_empty() {
        println!("{}", "No questions asked yet".yellow());
        return Ok(());
    }

    print_entries(history.entries(), limit);
    Ok(())
}

fn print_entries(entries: &[marvin_core::HistoryEntry], limit: usize) {
    println!("\n{}", "📜 History".bold().blue());
    println!("{}", "=".repeat(40).dimmed());

    for (i, entry) in entries.iter().take(limit).enumerate() {
        println!(
            "\n{}. {}",
            (i + 1).to_string().bold().blue(),
            entry.question.bold().yellow()
        );
        println!("{}", entry.response);
    }
}

async fn show_context(config: &Config, roots: &[PathBuf], full: bool) -> Result<()> {
    let walk_options = WalkOptions::default().with_ignored_names(config.ignored_names.clone());
    let assembler = ContextAssembler::new(config.extensions.clone());
    let context = build_project_context(roots, &walk_options, &assembler).await?;

    if full {
        print!("{}", context);
        return Ok(());
    }

    println!("\n{}", "📚 Project Context".bold().blue());
    println!("{}", "=".repeat(40).dimmed());
    for line in context.lines().filter(|line| line.starts_with("File: ")) {
        println!("  • {}", line.trim_start_matches("File: "));
    }
    println!(
        "\n{} files, {} bytes",
        context.matches("File: ").count().to_string().bold(),
        context.len().to_string().bold()
    );
    Ok(())
}

fn update_config(
    mut config: Config,
    api_key: Option<String>,
    model: Option<String>,
    endpoint: Option<String>,
    unexpected_role: Option<String>,
) -> Result<()> {
    if let Some(api_key) = api_key {
        config.api_key = Some(api_key);
    }
    if let Some(model) = model {
        config.model = model;
    }
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    if let Some(policy) = unexpected_role {
        config.unexpected_role = UnexpectedRolePolicy::from_str(&policy).ok_or_else(|| {
            let known: Vec<&str> = UnexpectedRolePolicy::all().iter().map(|p| p.as_str()).collect();
            anyhow!("Unknown policy '{}', expected one of: {}", policy, known.join(", "))
        })?;
    }

    config.save()?;
    println!("{}", "✓ Settings saved".green());
    println!("  model:           {}", config.model.cyan());
    println!("  endpoint:        {}", config.endpoint.cyan());
    println!("  unexpected role: {}", config.unexpected_role.as_str().cyan());
    println!(
        "  api key:         {}",
        if config.api_key.is_some() { "set".green() } else { "not set".red() }
    );
    Ok(())
}
