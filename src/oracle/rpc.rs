use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::balance::Balance;

use super::{BalanceQuery, BalanceSource, SourceError, SourceKind};

/// `balanceOf(address)`
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// A JSON-RPC node answering `eth_getBalance` and `eth_call`.
pub struct RpcSource {
    client: reqwest::Client,
    name: String,
    url: Url,
}

impl RpcSource {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        let name = url.host_str().unwrap_or("rpc").to_string();
        Self { client, name, url }
    }
}

#[derive(Deserialize)]
struct RpcError {
    code: Option<i64>,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<RpcError>,
}

fn encode_request(query: &BalanceQuery) -> Value {
    let (method, params) = match query {
        BalanceQuery::Native { address } => ("eth_getBalance", json!([address, "latest"])),
        BalanceQuery::Token { token, holder } => (
            "eth_call",
            json!([
                {
                    "to": token,
                    "data": format!("0x{}{}", hex::encode(BALANCE_OF_SELECTOR), holder.abi_word()),
                },
                "latest"
            ]),
        ),
    };

    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    })
}

#[async_trait]
impl BalanceSource for RpcSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Rpc
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, query: &BalanceQuery) -> Result<Balance, SourceError> {
        let payload = encode_request(query);

        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }

        let body = response.text().await?;
        let RpcResponse { result, error } = serde_json::from_str(&body)
            .map_err(|err| SourceError::Malformed(err.to_string()))?;

        match (result, error) {
            (_, Some(RpcError { code, message })) => Err(SourceError::Provider(match code {
                Some(code) => format!("{} ({})", message, code),
                None => message,
            })),
            (Some(result), None) => {
                debug!(source = %self.name, %result, "rpc balance response");
                Balance::from_hex_quantity(&result).map_err(Into::into)
            }
            (None, None) => Err(SourceError::Malformed("missing result".to_string())),
        }
    }
}
