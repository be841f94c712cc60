use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tsunagi::Value;
use tsunagi::worker::{Handler, HandlerResult, Host, WorkerOptions, serve};

/// Reference worker speaking the tsunagi service protocol on stdin/stdout
#[derive(Parser)]
#[command(name = "tsunagi-echo-worker")]
#[command(version)]
#[command(about = "Reference worker speaking the tsunagi service protocol on stdin/stdout")]
struct Cli {
    /// Protocol version requested by the host
    #[arg(long, value_name = "VERSION")]
    service: String,

    /// Answer the host's handshake ping (always enabled)
    #[arg(long)]
    ping: bool,

    /// Report this version in the handshake instead of the requested one
    #[arg(long, value_name = "VERSION")]
    report_version: Option<String>,
}

struct EchoHandler;

impl Handler for EchoHandler {
    async fn handle(&self, command: &str, args: Value, host: Host) -> HandlerResult {
        match command {
            "echo" => Ok(args),
            // {command, args}: ask the host and return its answer
            "relay" => {
                let Some(target) = args.get("command").and_then(Value::as_str) else {
                    return Err("relay requires a string command".to_string());
                };
                let forwarded = args.get("args").cloned().unwrap_or(Value::Null);
                host.call(target, forwarded)
                    .await
                    .map_err(|e| e.to_string())
            }
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_i32).unwrap_or(0).max(0);
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                Ok(args)
            }
            "fail" => Err(args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("failed")
                .to_string()),
            "exit" => {
                let code = args.get("code").and_then(Value::as_i32).unwrap_or(1);
                log::debug!(target: "tsunagi::worker", "Exiting with code {}", code);
                std::process::exit(code);
            }
            "build" => Ok(Value::object([
                ("errors", Value::Array(Vec::new())),
                ("warnings", Value::Array(Vec::new())),
                ("options", args),
            ])),
            "transform" => {
                let Some(input) = args.get("input").and_then(Value::as_str) else {
                    return Err("transform requires a string input".to_string());
                };
                Ok(Value::object([
                    ("code", Value::from(input)),
                    ("map", Value::from("")),
                    ("warnings", Value::Array(Vec::new())),
                ]))
            }
            other => Err(format!("unknown command: {other}")),
        }
    }
}

#[tokio::main]
async fn main() {
    // stdout carries frames; logs go to stderr only.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let version = cli.report_version.unwrap_or(cli.service);
    log::debug!(
        target: "tsunagi::worker",
        "Worker starting (version {}, ping {})",
        version,
        cli.ping
    );

    let options = WorkerOptions::new(version);
    if let Err(e) = serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        Arc::new(EchoHandler),
        options,
    )
    .await
    {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
