// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The opsplane stdio server.
//!
//! stdout carries only JSON-RPC frames; all logging goes to stderr. Each
//! request runs on its own task; responses are serialized through one
//! writer so frames never interleave. Stdin closing is a normal exit.

use anyhow::{Context, Result};
use osp_server::{dispatch, build_state, AppState};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry();

    let state = Arc::new(build_state().context("initialize control plane")?);

    let (tx, mut rx) = mpsc::channel::<String>(64);

    // Single writer task: responses leave in completion order, one frame
    // per line.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match osp_protocol::LineCodec::decode(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(target: "osp.server", %err, "dropping malformed frame");
                continue;
            }
        };
        let state = Arc::clone(&state);
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = dispatch::handle_request(&state, request).await {
                if tx.send(response).await.is_err() {
                    error!(target: "osp.server", "stdout writer gone; dropping response");
                }
            }
        });
    }

    info!(target: "osp.server", "stdin closed; shutting down");
    drop(tx);
    let _ = writer.await;
    teardown(&state);
    Ok(())
}

fn init_telemetry() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(format!("osp={level}"))
        .unwrap_or_else(|_| EnvFilter::new("osp=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn teardown(state: &AppState) {
    state.teardown();
}
