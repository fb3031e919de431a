mod explorer;
mod rpc;

pub use explorer::ExplorerSource;
pub use rpc::RpcSource;

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use itertools::Itertools;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    address::{Address, AddressError},
    balance::{Balance, QuantityError},
};

/// What to ask a source for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceQuery {
    /// Native token balance of an account.
    Native { address: Address },
    /// BEP-20 `balanceOf(holder)` on a token contract.
    Token { token: Address, holder: Address },
}

impl BalanceQuery {
    fn holder(&self) -> &Address {
        match self {
            BalanceQuery::Native { address } => address,
            BalanceQuery::Token { holder, .. } => holder,
        }
    }
}

/// Why a single source could not answer.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status: {0}")]
    Status(StatusCode),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Quantity(#[from] QuantityError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Direct chain query against a JSON-RPC node, no credentials needed.
    Rpc,
    /// Indexed explorer API, used as last resort.
    Explorer,
}

#[async_trait]
pub trait BalanceSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn name(&self) -> &str;

    async fn query(&self, query: &BalanceQuery) -> Result<Balance, SourceError>;
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
    #[error("all balance sources exhausted, last error: {0}")]
    AllSourcesExhausted(#[source] SourceError),
}

/// Anything able to resolve the native balance of an address.
#[async_trait]
pub trait BalanceLookup: Send + Sync {
    async fn lookup(&self, address: &Address) -> Result<Balance, OracleError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenContract {
    pub symbol: String,
    pub address: Address,
}

/// Symbol of the chain's native token.
pub const NATIVE_SYMBOL: &str = "BNB";

/// Tokens tracked next to the native balance on BSC.
pub fn default_tokens() -> Vec<TokenContract> {
    [
        ("USDT", "0x55d398326f99059fF775485246999027B3197955"),
        ("USDC", "0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d"),
    ]
    .into_iter()
    .filter_map(|(symbol, address)| {
        address.parse().ok().map(|address| TokenContract {
            symbol: symbol.to_string(),
            address,
        })
    })
    .collect()
}

#[derive(Debug)]
pub struct AssetBalance {
    pub symbol: String,
    pub balance: Result<Balance, OracleError>,
}

#[derive(Debug)]
pub struct AccountBalances {
    pub address: Address,
    pub assets: Vec<AssetBalance>,
}

/// Looks up balances across an ordered list of sources.
///
/// Rpc sources are tried first, each once, starting from a rotating index so
/// load is spread over the nodes across calls. The rotation also advances on
/// every further attempt, so a failing node does not stay first in line.
/// Explorer sources follow in their configured order. The first source to
/// answer wins.
pub struct BalanceOracle {
    rpc_sources: Vec<Box<dyn BalanceSource>>,
    fallback_sources: Vec<Box<dyn BalanceSource>>,
    rotation: AtomicUsize,
    tokens: Vec<TokenContract>,
    asset_delay: Duration,
}

impl BalanceOracle {
    pub fn new(sources: Vec<Box<dyn BalanceSource>>) -> Result<Self> {
        if sources.is_empty() {
            return Err(anyhow!("balance oracle needs at least one source"));
        }

        let (rpc_sources, fallback_sources): (Vec<_>, Vec<_>) = sources
            .into_iter()
            .partition(|source| source.kind() == SourceKind::Rpc);

        Ok(Self {
            rpc_sources,
            fallback_sources,
            rotation: AtomicUsize::new(0),
            tokens: Vec::new(),
            asset_delay: Duration::ZERO,
        })
    }

    pub fn with_tokens(mut self, tokens: Vec<TokenContract>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Pause after each asset of [`BalanceOracle::fetch_all_balances`].
    pub fn with_asset_delay(mut self, delay: Duration) -> Self {
        self.asset_delay = delay;
        self
    }

    pub fn tokens(&self) -> &[TokenContract] {
        &self.tokens
    }

    /// Every rpc source exactly once, starting at the next rotation slot.
    /// The order is fixed when the lookup starts, so concurrent lookups
    /// cannot make each other skip a node.
    fn rotated_rpc_sources(&self) -> impl Iterator<Item = &(dyn BalanceSource + 'static)> + '_ {
        let count = self.rpc_sources.len();
        let start = match count {
            0 => 0,
            _ => self.rotation.fetch_add(1, Ordering::Relaxed) % count,
        };
        (0..count).map(move |offset| self.rpc_sources[(start + offset) % count].as_ref())
    }

    async fn query_sources(&self, query: &BalanceQuery) -> Result<Balance, OracleError> {
        let fallbacks = self.fallback_sources.iter().map(|source| source.as_ref());

        let mut last_error = None;
        for (attempt, source) in self.rotated_rpc_sources().chain(fallbacks).enumerate() {
            if attempt > 0 && source.kind() == SourceKind::Rpc {
                // a failed node should not lead the next lookup
                self.rotation.fetch_add(1, Ordering::Relaxed);
            }
            debug!(source = source.name(), address = %query.holder(), "querying balance");
            match source.query(query).await {
                Ok(balance) => return Ok(balance),
                Err(err) => {
                    warn!(
                        source = source.name(),
                        address = %query.holder(),
                        %err,
                        "balance source failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        // `new` guarantees at least one source, so an error was recorded.
        let last_error = last_error
            .unwrap_or_else(|| SourceError::Malformed("no balance source was tried".to_string()));
        Err(OracleError::AllSourcesExhausted(last_error))
    }

    /// Native balance of `address`. The address is validated before any
    /// source is contacted.
    pub async fn fetch_balance(&self, address: &str) -> Result<Balance, OracleError> {
        let address: Address = address.parse()?;
        self.query_sources(&BalanceQuery::Native { address }).await
    }

    /// Token balance of `holder` on the `token` contract.
    pub async fn fetch_token_balance(
        &self,
        holder: &str,
        token: &str,
    ) -> Result<Balance, OracleError> {
        let holder: Address = holder.parse()?;
        let token: Address = token.parse()?;
        self.query_sources(&BalanceQuery::Token { token, holder }).await
    }

    /// Native balance followed by every configured token. Each asset fails
    /// independently of the others.
    pub async fn fetch_all_balances(&self, address: &str) -> Result<AccountBalances, OracleError> {
        let holder: Address = address.parse()?;

        let native = (
            NATIVE_SYMBOL.to_string(),
            BalanceQuery::Native {
                address: holder.clone(),
            },
        );
        let tokens = self.tokens.iter().map(|token| {
            (
                token.symbol.clone(),
                BalanceQuery::Token {
                    token: token.address.clone(),
                    holder: holder.clone(),
                },
            )
        });

        let mut balances = Vec::with_capacity(self.tokens.len() + 1);
        for (symbol, query) in std::iter::once(native).chain(tokens) {
            let balance = self.query_sources(&query).await;
            sleep(self.asset_delay).await;
            balances.push(AssetBalance { symbol, balance });
        }

        debug!(
            address = %holder,
            assets = %balances.iter().map(|asset| asset.symbol.as_str()).join(","),
            "fetched all balances"
        );

        Ok(AccountBalances {
            address: holder,
            assets: balances,
        })
    }
}

#[async_trait]
impl BalanceLookup for BalanceOracle {
    async fn lookup(&self, address: &Address) -> Result<Balance, OracleError> {
        self.query_sources(&BalanceQuery::Native {
            address: address.clone(),
        })
        .await
    }
}
