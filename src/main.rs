// Interactive shell: one query per line, answers on stdout, diagnostics on
// stderr and in the log file.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use mcp_host::agent_core::{tool_call_trace, FailureKind, Orchestrator};
use mcp_host::config::{find_config_path, load_host_config};
use mcp_host::inference::InferenceClient;
use mcp_host::mcp_client::McpClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => find_config_path(&std::env::current_dir()?)?,
    };

    let log_path = mcp_host::init_tracing().context("failed to initialize logging")?;
    let config = load_host_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let gateway =
        InferenceClient::from_config(config.model.clone()).context("invalid model configuration")?;
    eprintln!(
        "mcp-host {} | model {} at {} | log {}",
        env!("CARGO_PKG_VERSION"),
        gateway.model_name(),
        gateway.endpoint(),
        log_path.display()
    );

    let mut mcp = McpClient::new(config.active_servers(), config.agent.session_options());
    for (name, err) in mcp.start_all().await {
        eprintln!("warning: server '{name}' failed to start: {err}");
    }
    eprintln!("{}", mcp.registry().capability_summary());
    tracing::info!(
        running_servers = mcp.running_server_count(),
        total_tools = mcp.tool_count(),
        "MCP client initialized"
    );

    let mut orchestrator = Orchestrator::new(Arc::new(gateway), mcp, config.agent.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        std::io::stderr().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query == "quit" || query == "exit" {
            break;
        }

        // Ctrl-C during a query cancels it instead of exiting.
        let cancel = CancellationToken::new();
        let seen = orchestrator.transcript().len();
        let outcome = {
            let answer = orchestrator.answer_with_cancel(query, &cancel);
            tokio::pin!(answer);
            loop {
                tokio::select! {
                    outcome = &mut answer => break outcome,
                    _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                        eprintln!("cancelling...");
                        cancel.cancel();
                    }
                }
            }
        };

        let this_query = match &outcome {
            Ok(_) => orchestrator.transcript().messages(),
            Err(failure) => failure.transcript.as_slice(),
        };
        for line in tool_call_trace(this_query.get(seen..).unwrap_or(&[])) {
            eprintln!("{line}");
        }

        match outcome {
            Ok(answer) => println!("{}", answer.text),
            Err(failure) => {
                eprintln!("error [{}]: {}", failure.kind, failure.message);
                match failure.kind {
                    FailureKind::Auth => {
                        eprintln!("check the model credentials and restart");
                        break;
                    }
                    FailureKind::Handshake => {
                        eprintln!("restarting tool servers...");
                        for (name, err) in orchestrator.reestablish(None).await {
                            eprintln!("warning: server '{name}' is still unavailable: {err}");
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    orchestrator.shutdown().await;
    tracing::info!("mcp-host exiting");
    Ok(())
}
