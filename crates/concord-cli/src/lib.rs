#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! **concord-cli** – Developer command-line interface for the Concord
//! coordination and storage substrate.
//!
//! Starts a single-tab [`concord_runtime::ConcordRuntime`] rooted at a data
//! directory, exercises the session and queue APIs against it, and prints
//! the result as JSON. Not a daemon: each invocation starts the runtime,
//! runs one command, and shuts down.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use concord_queue::EnqueueOptions;
use concord_runtime::ConcordRuntime;
use concord_types::{Priority, TabId};
use serde_json::json;

/// Root CLI parser.
#[derive(Parser, Debug)]
#[command(name = "concord", version, about = "Concord coordination and storage substrate")]
pub struct Cli {
    /// Directory the `sled` database lives in.
    #[arg(long, default_value = "./concord-data")]
    pub data_dir: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// High-level commands understood by the CLI.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Append a message to the active session and print the resulting record.
    Append {
        /// Free-text content to append as a `{"text": ...}` message.
        text: String,
    },
    /// Print the active session record.
    Show,
    /// Enqueue a no-op operation through the operation queue and print its outcome.
    Enqueue {
        /// Name used for both the operation and the lock it serializes on.
        name: String,
    },
}

/// Run a single command against a freshly started runtime, returning the
/// pretty-printed JSON the CLI prints to stdout.
pub async fn run(cli: Cli) -> Result<String> {
    let runtime = ConcordRuntime::start(&cli.data_dir, TabId::from("cli"), None).await?;

    let output = match cli.command {
        Commands::Append { text } => {
            let record = runtime
                .session()
                .append(json!({ "text": text }))
                .await?;
            serde_json::to_string_pretty(&record)?
        }
        Commands::Show => {
            let record = runtime.session().current().await;
            serde_json::to_string_pretty(&record)?
        }
        Commands::Enqueue { name } => {
            let queue = runtime.queue();
            let opts = EnqueueOptions {
                lock_name: name.clone(),
                max_attempts: 1,
                retry_delay: Duration::from_millis(50),
                claim_timeout: Duration::from_secs(5),
                precheck_retry_cap: 5,
            };
            let (_id, rx) = queue.enqueue(name, Priority::Normal, opts, || {
                Box::pin(async { Ok(json!({ "ran": true })) })
            });
            let settled = rx.await?.map_err(|e| anyhow::anyhow!(e.to_string()))?;
            serde_json::to_string_pretty(&settled)?
        }
    };

    runtime.shutdown(Duration::from_secs(5)).await;
    Ok(output)
}
