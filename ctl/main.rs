#![forbid(unsafe_code)]

//! `vault-intercom-ctl` — command-line front-end for `vault-intercom`.
//!
//! Connects to the local socket, sends one request, and prints the response.
//! `watch` streams broadcasts until the service goes away.

use std::time::Duration;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use vault_intercom::confirmation::{ConfirmationWatcher, WatcherUpdate};
use vault_intercom::dispatch::IntercomRequest;
use vault_intercom::intercom::IntercomClient;
use vault_intercom::{AppError, Result};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(
    name = "vault-intercom-ctl",
    about = "Local front-end for the vault-intercom service",
    version,
    long_about = None
)]
struct Cli {
    /// Local socket name (must match the service's `ipc_name`).
    #[arg(long, default_value = "vault-intercom")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the service answers.
    Ping,

    /// Print the service state.
    State,

    /// Print broadcasts as they arrive.
    Watch,

    /// Approve a pending confirmation.
    Confirm {
        /// Confirmation id.
        id: String,
        /// Password handed to the key store.
        #[arg(long)]
        password: Option<String>,
    },

    /// Deny a pending confirmation.
    Deny {
        /// Confirmation id.
        id: String,
    },

    /// Send a raw request payload, e.g. `{"type":"sign","source":"tz1..","bytes":"05.."}`.
    Request {
        /// JSON request payload.
        payload: String,
    },

    /// Wait until an operation is applied.
    AwaitOp {
        /// Operation hash.
        hash: String,
        /// First block level to scan.
        #[arg(long)]
        from_level: Option<u64>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Cli::parse();

    let client = match connect(&args.ipc_name).await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("Failed to connect to service: {err}");
            eprintln!("Is vault-intercom running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    };

    let outcome = match args.command {
        Command::Ping => client
            .request_with_timeout(json!({ "type": "ping" }), PING_TIMEOUT)
            .await
            .map(Some),
        Command::State => client.request(json!({ "type": "get_state" })).await.map(Some),
        Command::Watch => watch(&client).await.map(|()| None),
        Command::Confirm { id, password } => client
            .request_as::<_, Value>(&IntercomRequest::Confirmation {
                id,
                confirm: true,
                password,
            })
            .await
            .map(Some),
        Command::Deny { id } => client
            .request_as::<_, Value>(&IntercomRequest::Confirmation {
                id,
                confirm: false,
                password: None,
            })
            .await
            .map(Some),
        Command::Request { payload } => send_raw(&client, &payload).await.map(Some),
        Command::AwaitOp { hash, from_level } => client
            .request_as::<_, Value>(&IntercomRequest::AwaitOperation {
                hash,
                from_block_level: from_level,
            })
            .await
            .map(Some),
    };

    match outcome {
        Ok(Some(data)) => println!("{}", pretty(&data)),
        Ok(None) => {}
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

async fn connect(ipc_name: &str) -> Result<IntercomClient> {
    let name = ipc_name
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{ipc_name}': {err}")))?;
    let stream = LocalSocketStream::connect(name).await?;
    let (reader, writer) = stream.split();
    Ok(IntercomClient::from_split(reader, writer))
}

/// Send a raw payload; gated requests print confirmation prompts while pending.
async fn send_raw(client: &IntercomClient, payload: &str) -> Result<Value> {
    let payload: Value = serde_json::from_str(payload)
        .map_err(|err| AppError::Protocol(format!("payload is not json: {err}")))?;
    let gated = serde_json::from_value::<IntercomRequest>(payload.clone())
        .is_ok_and(|request| request.requires_confirmation());
    if !gated {
        return client.request(payload).await;
    }

    let mut broadcasts = client.subscribe();
    let mut watcher = ConfirmationWatcher::new();
    watcher.expect_confirmation();

    let request = client.request(payload);
    tokio::pin!(request);

    loop {
        tokio::select! {
            biased;

            outcome = &mut request => {
                watcher.finish();
                return outcome;
            }
            () = client.closed() => {
                return Err(AppError::Disconnected("service closed the channel".into()));
            }
            received = broadcasts.recv() => match received {
                Ok(data) => match watcher.observe_value(&data) {
                    WatcherUpdate::Prompt(id) => {
                        eprintln!("confirmation {id} requested; run `vault-intercom-ctl confirm {id}` or `deny {id}`");
                    }
                    WatcherUpdate::Cleared(id) => eprintln!("confirmation {id} expired"),
                    WatcherUpdate::Ignored => {}
                },
                Err(RecvError::Lagged(skipped)) => eprintln!("missed {skipped} broadcasts"),
                Err(RecvError::Closed) => return (&mut request).await,
            },
        }
    }
}

async fn watch(client: &IntercomClient) -> Result<()> {
    let mut broadcasts = client.subscribe();
    loop {
        tokio::select! {
            () = client.closed() => {
                return Err(AppError::Disconnected("service closed the channel".into()));
            }
            received = broadcasts.recv() => match received {
                Ok(data) => {
                    println!("{}", pretty(&data));
                    if data.get("type").and_then(Value::as_str) == Some("confirmation_requested") {
                        if let Some(id) = data.get("id").and_then(Value::as_str) {
                            match client.request(json!({ "type": "get_confirmation", "id": id })).await {
                                Ok(summary) => println!("{}", pretty(&summary)),
                                Err(err) => eprintln!("could not fetch confirmation {id}: {err}"),
                            }
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => eprintln!("missed {skipped} broadcasts"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
