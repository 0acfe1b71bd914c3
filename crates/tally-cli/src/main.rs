//! Tally CLI - Command-line interface for the tally task index.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tally_core::config::CONFIG_DIR;
use tally_core::{SyncConfig, Task, TaskId};
use tally_daemon::SyncEngine;
use tally_index::{DocumentStore, FsDocumentStore, IndexEvent, LiveDocument, Reconciler, TaskIndex};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Tally - Keeps checklist tasks in a vault of notes indexed", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Vault root (defaults to the nearest directory holding .tally)
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a vault
    Init {
        /// Path to initialize (defaults to current directory)
        path: Option<String>,
    },

    /// Scan the vault once, assigning identifiers to new tasks
    Scan,

    /// List tasks without modifying any document
    List {
        /// Only open tasks
        #[arg(long, conflicts_with = "done")]
        open: bool,

        /// Only completed tasks
        #[arg(long)]
        done: bool,

        /// Only tasks appearing in this document
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Print the index as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one task and every place it appears
    Show {
        /// Task identifier (`42`, `t42` or `^t42`)
        id: String,
    },

    /// Watch the vault and keep documents in sync until Ctrl+C
    Watch {
        /// Treat this document as focused; changes elsewhere wait for it
        #[arg(short, long)]
        active: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

/// Find the vault root by walking up from the current directory to the
/// first directory holding `.tally`.
fn find_vault_root() -> Result<PathBuf> {
    let mut current = env::current_dir()?;

    loop {
        if current.join(CONFIG_DIR).is_dir() {
            return Ok(current);
        }

        // Try parent directory
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => {
                return Err(anyhow::anyhow!(
                    "No {} directory found. Run 'tally init' to initialize a vault.",
                    CONFIG_DIR
                ));
            }
        }
    }
}

fn open_store(vault: Option<PathBuf>) -> Result<(Arc<FsDocumentStore>, SyncConfig)> {
    let root = match vault {
        Some(root) => root,
        None => find_vault_root()?,
    };
    let config = SyncConfig::load_or_default(&root)?;
    let store = FsDocumentStore::new(&root, config.clone())?;
    Ok((Arc::new(store), config))
}

/// Builds an index from the documents as they are, writing nothing. Also
/// returns how many tasks still lack an identifier.
async fn load_index(store: &FsDocumentStore, config: &SyncConfig) -> Result<(TaskIndex, usize)> {
    let reconciler = Reconciler::new(config);
    let mut instances = Vec::new();

    for path in store.list_documents().await? {
        let text = store.read(&path).await?;
        let items = store.structure(&path, &text);
        let doc = LiveDocument::new(&path, &text).with_items(items.as_deref());
        match reconciler.scan(&doc) {
            Ok(found) => instances.extend(found),
            Err(e) => {
                warn!("{}; falling back to a line scan", e);
                instances.extend(reconciler.scan(&doc.with_items(None))?);
            }
        }
    }

    let anonymous = instances.iter().filter(|i| i.is_anonymous()).count();
    let mut index = TaskIndex::new();
    index.initialize_with_owners(instances, |path| config.is_task_file(path));
    Ok((index, anonymous))
}

fn parse_task_id(raw: &str, prefix: &str) -> Result<TaskId> {
    let raw = raw.trim().trim_start_matches('^');
    TaskId::from_block_id(raw, prefix)
        .map(Ok)
        .unwrap_or_else(|| raw.parse::<TaskId>())
        .map_err(|e| anyhow::anyhow!("{}", e))
}

fn checkbox(task: &Task) -> colored::ColoredString {
    if task.complete {
        "[x]".bright_black()
    } else {
        "[ ]".green()
    }
}

fn print_event(event: &IndexEvent) {
    match event {
        IndexEvent::TaskSetInitialized { tasks, instances } => {
            println!(
                "{} {} tasks, {} instances",
                "indexed".green().bold(),
                tasks,
                instances
            );
        }
        IndexEvent::InstancesModified {
            path,
            upserted,
            removed,
        } => {
            println!(
                "{} {} (+{} -{})",
                "updated".cyan(),
                path.display(),
                upserted.len(),
                removed.len()
            );
        }
        IndexEvent::FileDeleted {
            path,
            removed_tasks,
        } => {
            println!(
                "{} {} ({} tasks removed)",
                "deleted".red(),
                path.display(),
                removed_tasks.len()
            );
        }
        IndexEvent::FileRenamed { from, to } => {
            println!("{} {} -> {}", "renamed".yellow(), from.display(), to.display());
        }
        IndexEvent::SettingsUpdated => println!("{}", "settings updated".yellow()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Tally CLI starting");

    match cli.command {
        Commands::Init { path } => {
            let target = path.unwrap_or_else(|| ".".to_string());
            let target_path = Path::new(&target);
            let config_path = target_path.join(CONFIG_DIR).join("config.toml");

            if config_path.exists() {
                println!(
                    "{}",
                    format!("Vault already initialized: {}", config_path.display()).yellow()
                );
                return Ok(());
            }

            SyncConfig::write_default(target_path)?;

            println!("{}", "✓ Initialized tally vault".green().bold());
            println!("  Config: {}", config_path.display());
            println!("  Run 'tally scan' to index existing tasks.");

            Ok(())
        }

        Commands::Scan => {
            let (store, config) = open_store(cli.vault)?;
            println!(
                "{}",
                format!("Scanning {}...", store.root().display()).cyan()
            );

            let engine = SyncEngine::new(store, config);
            let stats = engine.full_scan().await?;

            println!("{}", "✓ Scan complete".green().bold());
            println!("  Documents:         {}", stats.documents);
            println!("  Tasks:             {}", stats.tasks.to_string().bright_green());
            println!("  Instances:         {}", stats.instances);
            println!("  Rewritten:         {}", stats.rewritten.to_string().bright_yellow());

            if stats.failed > 0 {
                println!("{}", "⚠ Some documents failed:".yellow().bold());
                println!("  Failed:            {}", stats.failed.to_string().bright_red());
            }

            Ok(())
        }

        Commands::List {
            open,
            done,
            file,
            json,
        } => {
            let (store, config) = open_store(cli.vault)?;
            let (index, anonymous) = load_index(&store, &config).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&index.snapshot())?);
                return Ok(());
            }

            let in_file: Option<Vec<TaskId>> = file.map(|f| {
                index
                    .query_by_path(&f)
                    .into_iter()
                    .filter_map(|i| i.id)
                    .collect()
            });

            let mut tasks: Vec<&Task> = index
                .tasks()
                .filter(|t| !(open && t.complete) && !(done && !t.complete))
                .filter(|t| in_file.as_ref().map_or(true, |ids| ids.contains(&t.id)))
                .collect();
            tasks.sort_by_key(|t| t.id);

            if tasks.is_empty() {
                println!("{}", "No tasks found".yellow());
                return Ok(());
            }

            // Print header
            println!(
                "{:<8} {:<5} {:<30} {}",
                "ID".bold(),
                "".bold(),
                "OWNER".bold(),
                "TEXT".bold()
            );
            println!("{}", "─".repeat(80));

            for task in tasks {
                let owner = task
                    .origin
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                println!(
                    "{:<8} {:<5} {:<30} {}",
                    task.id.to_block_id(&config.id_prefix).bright_cyan(),
                    checkbox(task),
                    owner,
                    task.text
                );
            }

            if anonymous > 0 {
                println!();
                println!(
                    "{}",
                    format!("{} tasks have no identifier yet; run 'tally scan'", anonymous)
                        .yellow()
                );
            }

            Ok(())
        }

        Commands::Show { id } => {
            let (store, config) = open_store(cli.vault)?;
            let id = parse_task_id(&id, &config.id_prefix)?;
            let (index, _) = load_index(&store, &config).await?;

            let task = index
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("Task not found: {}", id))?;
            let block_id = id.to_block_id(&config.id_prefix);

            println!("{}", "━".repeat(80));
            println!("{} {}", "Task:".bold(), block_id.bright_cyan());
            println!("{}", "━".repeat(80));
            println!();
            println!("{:<15} {} {}", "Text:".bold(), checkbox(task), task.text);

            if let Some(origin) = &task.origin {
                println!("{:<15} {}", "Owner:".bold(), origin.display());
            }

            if let Some(parent) = task.parent {
                let label = index
                    .get(parent)
                    .map(|p| p.text.as_str())
                    .unwrap_or_default();
                println!(
                    "{:<15} {} {}",
                    "Parent:".bold(),
                    parent.to_block_id(&config.id_prefix).bright_cyan(),
                    label
                );
            }

            if !task.children.is_empty() {
                println!();
                println!("{}", "Subtasks:".bold());
                for child in &task.children {
                    if let Some(c) = index.get(*child) {
                        println!(
                            "  {} {} {}",
                            child.to_block_id(&config.id_prefix).bright_cyan(),
                            checkbox(c),
                            c.text
                        );
                    }
                }
            }

            println!();
            println!("{}", "Appears in:".bold());
            for location in index.instances_of(id) {
                println!("  {}:{}", location.path.display(), location.line + 1);
            }

            println!();
            println!("{}", "━".repeat(80));

            Ok(())
        }

        Commands::Watch { active } => {
            let (store, config) = open_store(cli.vault)?;
            if active.is_some() {
                store.set_active(active.clone());
            }

            println!("{}", "Watching vault...".green());
            println!("  Vault:  {}", store.root().display());
            if let Some(active) = &active {
                println!("  Active: {}", active.display());
            }
            println!("  Press Ctrl+C to stop");
            println!();

            let engine = Arc::new(SyncEngine::new(store, config));
            engine.subscribe(print_event).await;

            let runner = engine.clone();
            let mut handle = tokio::spawn(async move { runner.run().await });

            // Set up graceful shutdown with Ctrl+C
            tokio::select! {
                result = &mut handle => {
                    result??;
                    return Ok(());
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("\n{}", "Shutting down...".yellow());
                    engine.stop().await?;
                }
            }

            handle.await??;
            engine.shutdown().await;

            println!("{}", "✓ Stopped".green());
            Ok(())
        }

        Commands::Version => {
            println!("tally {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
