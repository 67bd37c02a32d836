use std::future::Future;

use thiserror::Error;

use crate::db_types::Chain;

#[derive(Debug, Clone, Error)]
pub enum ChainProviderError {
    #[error("Transport error talking to the chain provider: {0}")]
    Transport(String),
    #[error("The chain provider returned an error: {0}")]
    Rpc(String),
    #[error("No provider endpoint is configured for chain {0}")]
    UnsupportedChain(String),
}

/// Read access to the upstream blockchain provider. The engine only ever
/// needs the chain tip; everything else arrives as pushed transfer events.
#[allow(async_fn_in_trait)]
pub trait ChainProvider: Clone + Send + Sync {
    /// The current block height (chain tip) for the given chain.
    fn block_height(
        &self,
        chain: &Chain,
    ) -> impl Future<Output = Result<i64, ChainProviderError>> + Send;
}
