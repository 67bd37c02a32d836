//! JSON-RPC client for reading the chain tip from the upstream provider.

use std::{collections::HashMap, time::Duration};

use log::*;
use rand::Rng;
use serde_json::{json, Value};
use stable_payment_engine::{
    db_types::Chain,
    traits::{ChainProvider, ChainProviderError},
};

use crate::config::ProviderConfig;

/// Reads `eth_blockNumber` from a per-chain JSON-RPC endpoint. Each call has
/// its own timeout; failures are retried a few times with jitter before the
/// error is handed back to the dispatcher's backoff machinery.
#[derive(Clone)]
pub struct RpcChainProvider {
    client: reqwest::Client,
    rpc_urls: HashMap<Chain, String>,
    retries: u32,
}

impl RpcChainProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("spg-provider-client/1.0")
            .build()
            .expect("Failed to create HTTP client");
        Self { client, rpc_urls: config.rpc_urls.clone(), retries: config.retries }
    }

    async fn block_number_once(&self, url: &str) -> Result<i64, ChainProviderError> {
        let request = json!({ "jsonrpc": "2.0", "id": 1, "method": "eth_blockNumber", "params": [] });
        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainProviderError::Transport(e.to_string()))?;
        let body: Value =
            response.json().await.map_err(|e| ChainProviderError::Transport(e.to_string()))?;
        if let Some(err) = body.get("error") {
            return Err(ChainProviderError::Rpc(err.to_string()));
        }
        let hex_height = body
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainProviderError::Rpc("missing result field".into()))?;
        parse_hex_quantity(hex_height)
    }
}

impl ChainProvider for RpcChainProvider {
    async fn block_height(&self, chain: &Chain) -> Result<i64, ChainProviderError> {
        let url = self
            .rpc_urls
            .get(chain)
            .ok_or_else(|| ChainProviderError::UnsupportedChain(chain.to_string()))?;
        let mut last_error = ChainProviderError::Transport("no attempts made".into());
        for attempt in 0..=self.retries {
            match self.block_number_once(url).await {
                Ok(height) => return Ok(height),
                Err(e) => {
                    debug!("🌐️ Provider call for {chain} failed (attempt {attempt}): {e}");
                    last_error = e;
                    if attempt < self.retries {
                        let jitter = rand::thread_rng().gen_range(100..500);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                    }
                },
            }
        }
        Err(last_error)
    }
}

fn parse_hex_quantity(quantity: &str) -> Result<i64, ChainProviderError> {
    let digits = quantity.strip_prefix("0x").unwrap_or(quantity);
    i64::from_str_radix(digits, 16)
        .map_err(|e| ChainProviderError::Rpc(format!("invalid block number {quantity}: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_eth_block_number_quantities() {
        assert_eq!(parse_hex_quantity("0x64").unwrap(), 100);
        assert_eq!(parse_hex_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_hex_quantity("ff").unwrap(), 255);
        assert!(parse_hex_quantity("0xzz").is_err());
    }
}
