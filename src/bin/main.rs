use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tsunagi::config::{self, DEFAULT_WORKER_PROGRAM, ServiceConfig};
use tsunagi::{Service, Value};

/// Host for an out-of-process build service worker
#[derive(Parser)]
#[command(name = "tsunagi")]
#[command(version)]
#[command(about = "Host for an out-of-process build service worker")]
struct Cli {
    /// Configuration file (default: <config dir>/tsunagi/tsunagi.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Worker executable, overriding the configuration
    #[arg(long, global = true)]
    worker: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request to the worker and print the result as JSON
    Call {
        /// The command name (e.g., echo, build, transform)
        command: String,

        /// Arguments as a JSON document
        #[arg(long, default_value = "null")]
        args: String,

        /// Give up waiting after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Use a worker that exits after this one request
        #[arg(long, conflicts_with = "timeout_ms")]
        once: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = resolve_config(cli.config, cli.worker).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    match cli.command {
        Commands::Call {
            command,
            args,
            timeout_ms,
            once,
        } => {
            let args = parse_args(&args).unwrap_or_else(|e| {
                eprintln!("Error: invalid --args: {}", e);
                std::process::exit(2);
            });

            let service = Service::new(config);
            let result = if once {
                service.run_once(&command, args).await
            } else {
                service
                    .call_with_timeout(&command, args, timeout_ms.map(Duration::from_millis))
                    .await
            };
            service.stop().await;

            match result {
                Ok(value) => {
                    let json = serde_json::Value::from(value);
                    match serde_json::to_string_pretty(&json) {
                        Ok(text) => println!("{}", text),
                        Err(e) => {
                            eprintln!("Error: {}", e);
                            std::process::exit(1);
                        }
                    }
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Config => match toml::to_string_pretty(&config) {
            Ok(text) => print!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
    }
}

/// Explicit file, else user config, else defaults; then `--worker`.
fn resolve_config(
    path: Option<PathBuf>,
    worker: Option<PathBuf>,
) -> Result<ServiceConfig, config::ConfigError> {
    let mut config = match path {
        Some(path) => config::load_config(&path)?,
        None => match config::load_user_config()? {
            Some(config) => config,
            None => ServiceConfig::default().with_env_overrides(),
        },
    };

    if let Some(worker) = worker {
        config.worker.program = worker;
    } else if config.worker.program == PathBuf::from(DEFAULT_WORKER_PROGRAM) {
        // Prefer the worker installed next to this binary over a PATH lookup.
        if let Some(sibling) = sibling_worker() {
            config.worker.program = sibling;
        }
    }
    Ok(config)
}

fn sibling_worker() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe
        .parent()?
        .join(format!("{}{}", DEFAULT_WORKER_PROGRAM, std::env::consts::EXE_SUFFIX));
    candidate.is_file().then_some(candidate)
}

fn parse_args(text: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    Ok(Value::try_from(json)?)
}
