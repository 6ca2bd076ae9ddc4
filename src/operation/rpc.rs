//! Node RPC client backing the block-scanning poll.
//!
//! Uses two read-only endpoints of a Tezos-style node:
//! `GET /chains/{chain}/blocks/head/header` for the head level and
//! `GET /chains/{chain}/blocks/{level}/operations` for a block's operations.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::OperationsConfig;
use crate::operation::{NetworkQueries, OperationRecord, OperationStatus};
use crate::{AppError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct BlockHeader {
    level: u64,
}

/// `reqwest`-backed [`NetworkQueries`] implementation.
pub struct RpcNetwork {
    http: reqwest::Client,
    base_url: String,
    chain: String,
}

impl RpcNetwork {
    /// Build a client for the node configured in `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Network` if the HTTP client cannot be built.
    pub fn from_config(config: &OperationsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AppError::Network(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            base_url: config.rpc_url.trim_end_matches('/').to_owned(),
            chain: config.chain.clone(),
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}/chains/{}/{path}", self.base_url, self.chain);
        debug!(%url, "rpc get");
        let value = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        Ok(value)
    }
}

impl NetworkQueries for RpcNetwork {
    fn head_level(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let header = self.get_json("blocks/head/header").await?;
            let header: BlockHeader = serde_json::from_value(header)
                .map_err(|err| AppError::Network(format!("unexpected head header: {err}")))?;
            Ok(header.level)
        })
    }

    fn block_operations(&self, level: u64) -> BoxFuture<'_, Result<Vec<OperationRecord>>> {
        Box::pin(async move {
            let body = self.get_json(&format!("blocks/{level}/operations")).await?;
            parse_block_operations(level, &body)
        })
    }
}

/// Flatten a block's operation passes into records.
///
/// An operation's status is `applied` only if every content that carries an
/// `operation_result` is applied; the first other status wins. Contents with
/// no result (consensus operations) count as applied once included.
///
/// # Errors
///
/// Returns `AppError::Network` if the body is not a list of lists.
pub fn parse_block_operations(level: u64, body: &Value) -> Result<Vec<OperationRecord>> {
    let passes = body
        .as_array()
        .ok_or_else(|| AppError::Network(format!("block {level}: operations is not a list")))?;

    let mut records = Vec::new();
    for pass in passes {
        let Some(operations) = pass.as_array() else {
            return Err(AppError::Network(format!(
                "block {level}: validation pass is not a list"
            )));
        };
        for operation in operations {
            let Some(hash) = operation.get("hash").and_then(Value::as_str) else {
                continue;
            };
            records.push(OperationRecord {
                hash: hash.to_owned(),
                status: combined_status(operation),
                level: Some(level),
                data: operation.clone(),
            });
        }
    }
    Ok(records)
}

fn combined_status(operation: &Value) -> OperationStatus {
    let contents = operation
        .get("contents")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    contents
        .iter()
        .filter_map(|content| {
            content
                .pointer("/metadata/operation_result/status")
                .and_then(Value::as_str)
        })
        .map(OperationStatus::parse)
        .find(|status| !status.is_applied())
        .unwrap_or(OperationStatus::Applied)
}
