mod calc;
mod db;
mod ipc;
mod roomlog;

use clap::Parser;
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// Live-room attendance sidecar speaking newline-delimited JSON on stdin/stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace directory to open at startup.
    #[arg(short, long)]
    workspace: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the protocol; logs go to stderr. RUST_LOG wins over the info default.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_writer(io::stderr).with_env_filter(filter).init();

    let mut state = ipc::AppState::default();
    if let Some(path) = args.workspace {
        if let Err(e) = ipc::select_workspace(&mut state, path.clone()) {
            tracing::error!(workspace = %path.display(), error = %e, "could not open workspace at startup");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "liveroomd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                // Can't reply without id.
                tracing::warn!(error = %e, "bad request line");
                json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                })
            }
        };

        writeln!(stdout, "{}", resp)?;
        stdout.flush()?;
    }

    tracing::info!("stdin closed; exiting");
    Ok(())
}
