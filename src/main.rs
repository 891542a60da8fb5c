//! databind CLI - evaluate binding expressions and check binding files

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use tokio::task::LocalSet;
use tracing::warn;
use walkdir::WalkDir;

use databind::events::listener;
use databind::{
    BindError, BindValue, BindingFile, BindingRegistry, EngineConfig, EventKind,
    FixSuggestion, JsonModel, Progress,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "databind")]
#[command(about = "databind - asynchronous data-binding engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a binding expression against a JSON document
    Eval {
        /// Binding expression, e.g. "data.motor.speed * 2"
        expr: String,

        /// JSON document backing the model
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Model id of the document
        #[arg(short, long, default_value = "data")]
        model: String,

        /// Write a value before evaluating (name=value, value parsed as JSON)
        #[arg(short, long = "set", value_name = "NAME=VALUE")]
        sets: Vec<String>,
    },

    /// Validate binding files (a file or every .json/.yaml file under a directory)
    Check {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let local = LocalSet::new();
    let result = local
        .run_until(async move {
            match cli.command {
                Commands::Eval {
                    expr,
                    data,
                    model,
                    sets,
                } => eval(&expr, data.as_deref(), &model, &sets).await,
                Commands::Check { path } => check(&path),
            }
        })
        .await;

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.downcast_ref::<BindError>().and_then(|e| e.fix_suggestion()) {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn load_config() -> EngineConfig {
    match EngineConfig::load_default() {
        Ok(config) => config.with_env(),
        Err(e) => {
            warn!(error = %e, "Using default configuration");
            EngineConfig::default().with_env()
        }
    }
}

fn parse_assignment(text: &str) -> anyhow::Result<(&str, Value)> {
    let (name, raw) = text
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected NAME=VALUE, got '{}'", text))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.trim(), value))
}

/// Wait until `bind` has no unconfirmed change, giving up after `SETTLE_TIMEOUT`.
async fn settle(bind: &dyn BindValue) -> anyhow::Result<()> {
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while bind.is_stale() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("Timed out waiting for '{}' to settle", bind.name()))
}

async fn eval(expr: &str, data: Option<&Path>, model_id: &str, sets: &[String]) -> anyhow::Result<()> {
    let config = load_config();
    let document: Value = match data {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?
        }
        None => Value::Object(Default::default()),
    };

    let registry = BindingRegistry::with_config(config.clone());
    let model = Rc::new(
        JsonModel::new(model_id, document, registry.context())
            .with_ignore_writes_when_disconnected(config.ignore_writes_when_disconnected),
    );
    model.connect();
    registry.register_model(model.clone(), true, None);

    for assignment in sets {
        let (name, value) = parse_assignment(assignment)?;
        let bind = registry
            .get_binding(name)?
            .ok_or_else(|| BindError::BindingNotFound { name: name.to_string() })?;
        let progress = Progress::new();
        bind.set_value(value, &progress, true);
        progress.done(1);
        progress.finished().await;
    }

    let bind = registry
        .get_binding(expr)?
        .ok_or_else(|| BindError::BindingNotFound { name: expr.to_string() })?;
    // listening starts the initial reads
    let on_change = listener(|_| {});
    bind.add_listener(EventKind::ValueChanged, Rc::clone(&on_change));
    settle(bind.as_ref()).await?;
    bind.remove_listener(EventKind::ValueChanged, &on_change);

    if let Some(status) = bind.status() {
        if status.is_error() {
            bail!("{}", status.message);
        }
        eprintln!("{} {}", "!".yellow(), status);
    }
    println!("{}", serde_json::to_string_pretty(&bind.value())?);

    if !sets.is_empty() {
        eprintln!("{} {}", "Document:".cyan().bold(), model.snapshot());
    }
    registry.dispose();
    Ok(())
}

fn binding_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("json") | Some("yaml") | Some("yml")
            )
        })
        .collect()
}

/// Problems in one binding file: unreadable file, or expressions that do not parse.
fn check_file(registry: &BindingRegistry, path: &Path) -> Vec<String> {
    let file = match BindingFile::read(path) {
        Ok(file) => file,
        Err(e) => return vec![e.plain_message()],
    };
    file.widget_bindings
        .iter()
        .filter(|entry| !entry.server_bind_name.is_empty())
        .filter_map(|entry| match registry.get_binding(&entry.server_bind_name) {
            Ok(_) => None,
            Err(e) => Some(format!("{}: {}", entry.server_bind_name, e.plain_message())),
        })
        .collect()
}

fn check(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        bail!("{} does not exist", path.display());
    }
    // the widget model accepts any name, so only syntax is checked
    let registry = BindingRegistry::new();
    let files = binding_files(path);
    let mut failed = 0;
    for file in &files {
        let problems = check_file(&registry, file);
        if problems.is_empty() {
            println!("{} {}", "✓".green(), file.display());
        } else {
            failed += 1;
            println!("{} {}", "✗".red(), file.display());
            for problem in problems {
                println!("    {}", problem);
            }
        }
    }
    registry.dispose();

    println!("  Files: {}", files.len());
    if failed > 0 {
        bail!("{} of {} binding files are invalid", failed, files.len());
    }
    Ok(())
}
