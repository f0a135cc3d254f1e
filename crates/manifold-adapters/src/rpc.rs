//! JSON-RPC code source (`eth_getCode`).
//!
//! Retries transport failures and 5xx responses with capped exponential backoff. JSON-RPC
//! error objects and 4xx responses are final.

use manifold_core::config::{RpcConfig, MAX_RPC_RETRIES};
use manifold_core::{Address, CodeSource, ManifoldError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum total retry delay in milliseconds (5 seconds).
const MAX_TOTAL_RETRY_DELAY_MS: u64 = 5000;

/// Base delay for exponential backoff in milliseconds.
const BASE_RETRY_DELAY_MS: u64 = 100;

/// Maximum single retry delay in milliseconds (2 seconds).
const MAX_SINGLE_RETRY_DELAY_MS: u64 = 2000;

/// Delays slept between attempts for `retry_count` retries, honouring both caps.
pub fn backoff_schedule(retry_count: u32) -> Vec<u64> {
    let mut delays = Vec::new();
    let mut total = 0u64;
    for attempt in 0..retry_count.min(MAX_RPC_RETRIES) {
        let delay = std::cmp::min(
            BASE_RETRY_DELAY_MS * (1u64 << attempt),
            MAX_SINGLE_RETRY_DELAY_MS,
        );
        if total + delay > MAX_TOTAL_RETRY_DELAY_MS {
            break;
        }
        total += delay;
        delays.push(delay);
    }
    delays
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: [&'a str; 2],
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Decode an `eth_getCode` response body into runtime bytes.
pub fn decode_get_code(body: &str) -> Result<Vec<u8>> {
    let resp: RpcResponse = serde_json::from_str(body)
        .map_err(|e| ManifoldError::Network(format!("invalid JSON-RPC response: {}", e)))?;
    if let Some(err) = resp.error {
        return Err(ManifoldError::Network(format!(
            "JSON-RPC error {}: {}",
            err.code, err.message
        )));
    }
    let result = resp
        .result
        .ok_or_else(|| ManifoldError::Network("JSON-RPC response has no result".into()))?;
    let digits = result.strip_prefix("0x").unwrap_or(&result);
    hex::decode(digits)
        .map_err(|e| ManifoldError::Network(format!("eth_getCode returned bad hex: {}", e)))
}

/// Reads deployed code over JSON-RPC.
pub struct JsonRpcCodeSource {
    url: String,
    block_tag: String,
    retry_count: u32,
    client: reqwest::blocking::Client,
}

impl JsonRpcCodeSource {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| ManifoldError::ConfigError("rpc.url is required".into()))?;
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| ManifoldError::ConfigError(format!("invalid rpc.url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ManifoldError::ConfigError(
                "rpc.url must use http or https".into(),
            ));
        }
        if config.timeout_ms == 0 {
            return Err(ManifoldError::ConfigError("timeout_ms must be > 0".into()));
        }
        if config.retry_count > MAX_RPC_RETRIES {
            return Err(ManifoldError::ConfigError(
                "retry_count must be <= 3 for bounded retries".into(),
            ));
        }

        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ManifoldError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url,
            block_tag: config.block_tag.clone(),
            retry_count: config.retry_count,
            client,
        })
    }
}

impl CodeSource for JsonRpcCodeSource {
    fn code_at(&self, address: &Address) -> Result<Vec<u8>> {
        let address_hex = address.to_hex();
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "eth_getCode",
            params: [&address_hex, &self.block_tag],
        };

        let mut delays = backoff_schedule(self.retry_count).into_iter();
        let mut last_error;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.client.post(&self.url).json(&request).send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response.text().map_err(|e| {
                            ManifoldError::Network(format!("Failed to read response: {}", e))
                        })?;
                        let code = decode_get_code(&body)?;
                        debug!(%address, bytes = code.len(), attempt, "eth_getCode");
                        return Ok(code);
                    } else if status.is_client_error() {
                        return Err(ManifoldError::Network(format!(
                            "HTTP client error (non-retryable): {}",
                            status
                        )));
                    } else if status.is_server_error() {
                        last_error = format!("HTTP server error: {}", status);
                    } else {
                        return Err(ManifoldError::Network(format!(
                            "HTTP non-retryable response: {}",
                            status
                        )));
                    }
                }
                Err(e) => {
                    last_error = format!("Network error: {}", e);
                }
            }

            match delays.next() {
                Some(delay) => {
                    warn!(%address, attempt, delay_ms = delay, error = %last_error, "Retrying eth_getCode");
                    std::thread::sleep(Duration::from_millis(delay));
                }
                None => break,
            }
        }

        Err(ManifoldError::Network(format!(
            "eth_getCode {} failed after {} attempts: {}",
            address, attempt, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded() {
        assert_eq!(backoff_schedule(0), Vec::<u64>::new());
        assert_eq!(backoff_schedule(3), vec![100, 200, 400]);
        assert_eq!(backoff_schedule(10), vec![100, 200, 400]);
    }

    #[test]
    fn decodes_code_result() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":"0x6080"}"#;
        assert_eq!(decode_get_code(body).unwrap(), vec![0x60, 0x80]);

        let empty = r#"{"jsonrpc":"2.0","id":1,"result":"0x"}"#;
        assert!(decode_get_code(empty).unwrap().is_empty());
    }

    #[test]
    fn rpc_error_is_surfaced() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"invalid address"}}"#;
        let err = decode_get_code(body).unwrap_err();
        assert!(err.to_string().contains("invalid address"));
    }

    #[test]
    fn rejects_bad_urls() {
        let mut config = RpcConfig::default();
        assert!(JsonRpcCodeSource::new(&config).is_err());

        config.url = Some("ftp://node".into());
        assert!(JsonRpcCodeSource::new(&config).is_err());

        config.url = Some("http://127.0.0.1:8545".into());
        assert!(JsonRpcCodeSource::new(&config).is_ok());
    }

    #[test]
    fn rejects_unbounded_retries() {
        let config = RpcConfig {
            url: Some("http://127.0.0.1:8545".into()),
            retry_count: 4,
            ..RpcConfig::default()
        };
        assert!(JsonRpcCodeSource::new(&config).is_err());
    }
}
