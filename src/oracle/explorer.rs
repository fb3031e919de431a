use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::balance::Balance;

use super::{BalanceQuery, BalanceSource, SourceError, SourceKind};

/// An Etherscan style explorer API (`module=account`). Needs an api key.
pub struct ExplorerSource {
    api_key: String,
    chain_id: Option<u64>,
    client: reqwest::Client,
    name: String,
    url: Url,
}

impl ExplorerSource {
    pub fn new(client: reqwest::Client, url: Url, api_key: String, chain_id: Option<u64>) -> Self {
        let name = url.host_str().unwrap_or("explorer").to_string();
        Self {
            api_key,
            chain_id,
            client,
            name,
            url,
        }
    }

    fn query_params(&self, query: &BalanceQuery) -> Vec<(&'static str, String)> {
        let mut params = match query {
            BalanceQuery::Native { address } => vec![
                ("module", "account".to_string()),
                ("action", "balance".to_string()),
                ("address", address.to_string()),
            ],
            BalanceQuery::Token { token, holder } => vec![
                ("module", "account".to_string()),
                ("action", "tokenbalance".to_string()),
                ("contractaddress", token.to_string()),
                ("address", holder.to_string()),
            ],
        };
        params.push(("tag", "latest".to_string()));
        params.push(("apikey", self.api_key.clone()));
        if let Some(chain_id) = self.chain_id {
            params.push(("chainid", chain_id.to_string()));
        }
        params
    }
}

// `result` is a decimal string on success, and an explanation on failure.
#[derive(Deserialize)]
struct ExplorerResponse {
    status: String,
    message: Option<String>,
    result: Option<Value>,
}

#[async_trait]
impl BalanceSource for ExplorerSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Explorer
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, query: &BalanceQuery) -> Result<Balance, SourceError> {
        let response = self
            .client
            .get(self.url.clone())
            .query(&self.query_params(query))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }

        let body = response.text().await?;
        let ExplorerResponse {
            status,
            message,
            result,
        } = serde_json::from_str(&body).map_err(|err| SourceError::Malformed(err.to_string()))?;

        if status != "1" {
            let message = message.unwrap_or_else(|| "unknown error".to_string());
            let detail = match result {
                Some(Value::String(detail)) => format!("{}: {}", message, detail),
                _ => message,
            };
            return Err(SourceError::Provider(detail));
        }

        match result {
            Some(Value::String(result)) => {
                debug!(source = %self.name, %result, "explorer balance response");
                Balance::from_decimal_quantity(&result).map_err(Into::into)
            }
            Some(other) => Err(SourceError::Malformed(format!(
                "expected a decimal string result, got {}",
                other
            ))),
            None => Err(SourceError::Malformed("missing result".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{method, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const HOLDER: &str = "0xb5d85cbf7cb3ee0d56b3bb207d5fc4b82f43f511";
    const TOKEN: &str = "0x55d398326f99059ff775485246999027b3197955";

    fn source(server: &MockServer, chain_id: Option<u64>) -> ExplorerSource {
        ExplorerSource::new(
            reqwest::Client::new(),
            format!("{}/api", server.uri()).parse().unwrap(),
            "test-key".to_string(),
            chain_id,
        )
    }

    #[tokio::test]
    async fn parses_decimal_balance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("module", "account"))
            .and(query_param("action", "balance"))
            .and(query_param("address", HOLDER))
            .and(query_param("apikey", "test-key"))
            .and(query_param("chainid", "56"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "1",
                "message": "OK",
                "result": "10000000000000000",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let balance = source(&server, Some(56))
            .query(&BalanceQuery::Native {
                address: HOLDER.parse().unwrap(),
            })
            .await
            .unwrap();

        assert_eq!(balance, "0.01".parse().unwrap());
    }

    #[tokio::test]
    async fn queries_token_balance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("action", "tokenbalance"))
            .and(query_param("contractaddress", TOKEN))
            .and(query_param("address", HOLDER))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "1",
                "message": "OK",
                "result": "2500000000000000000",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let balance = source(&server, None)
            .query(&BalanceQuery::Token {
                token: TOKEN.parse().unwrap(),
                holder: HOLDER.parse().unwrap(),
            })
            .await
            .unwrap();

        assert_eq!(balance, "2.5".parse().unwrap());
    }

    #[tokio::test]
    async fn status_flag_zero_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "0",
                "message": "NOTOK",
                "result": "Max rate limit reached",
            })))
            .mount(&server)
            .await;

        let err = source(&server, None)
            .query(&BalanceQuery::Native {
                address: HOLDER.parse().unwrap(),
            })
            .await
            .unwrap_err();

        assert!(
            matches!(err, SourceError::Provider(message) if message == "NOTOK: Max rate limit reached")
        );
    }
}
