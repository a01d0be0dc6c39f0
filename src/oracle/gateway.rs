use super::{PendingTx, SettlementOracle, TxReceipt};
use anyhow::{bail, Context, Result};
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// HTTP client for a settlement gateway that fronts the on-chain market
/// contract and signs transactions on the keeper's behalf.
#[derive(Debug, Clone)]
pub struct GatewayOracle {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
}

#[derive(Debug, Serialize)]
struct PriceBody {
    price: String,
}

#[derive(Debug, Serialize)]
struct ClaimBody<'a> {
    user: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxSubmitted {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentRound {
    round_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoundInfo {
    #[serde(default)]
    lock_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claimable {
    amount: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TxState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxStatus {
    status: TxState,
    #[serde(default)]
    block_number: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

impl GatewayOracle {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build oracle HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: Duration::from_secs(2),
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn submit<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<Box<dyn PendingTx>> {
        let url = format!("{}{}", self.base_url, path);
        let submitted: TxSubmitted = self
            .authed(self.client.post(&url).json(body))
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?
            .error_for_status()
            .with_context(|| format!("POST {path} rejected"))?
            .json()
            .await
            .with_context(|| format!("POST {path} returned bad body"))?;

        debug!(path, tx = %submitted.tx_hash, "oracle transaction submitted");
        Ok(Box::new(GatewayTx {
            oracle: self.clone(),
            hash: submitted.tx_hash,
        }))
    }

    async fn tx_status(&self, hash: &str) -> Result<TxStatus> {
        let url = format!("{}/tx/{}", self.base_url, hash);
        self.authed(self.client.get(&url))
            .send()
            .await
            .context("tx status request failed")?
            .error_for_status()
            .context("tx status rejected")?
            .json()
            .await
            .context("tx status returned bad body")
    }
}

struct GatewayTx {
    oracle: GatewayOracle,
    hash: String,
}

#[async_trait::async_trait]
impl PendingTx for GatewayTx {
    fn hash(&self) -> &str {
        &self.hash
    }

    async fn wait(self: Box<Self>) -> Result<TxReceipt> {
        loop {
            let status = self.oracle.tx_status(&self.hash).await?;
            match status.status {
                TxState::Confirmed => {
                    info!(tx = %self.hash, block = ?status.block_number, "oracle transaction confirmed");
                    return Ok(TxReceipt {
                        hash: self.hash.clone(),
                        block_number: status.block_number,
                    });
                }
                TxState::Failed => bail!(
                    "transaction {} failed: {}",
                    self.hash,
                    status.error.unwrap_or_else(|| "reverted".to_string())
                ),
                TxState::Pending => tokio::time::sleep(self.oracle.poll_interval).await,
            }
        }
    }
}

#[async_trait::async_trait]
impl SettlementOracle for GatewayOracle {
    async fn current_round_id(&self) -> Result<u64> {
        let url = format!("{}/rounds/current", self.base_url);
        let current: CurrentRound = self
            .authed(self.client.get(&url))
            .send()
            .await
            .context("current round request failed")?
            .error_for_status()
            .context("current round rejected")?
            .json()
            .await
            .context("current round returned bad body")?;
        Ok(current.round_id)
    }

    async fn start_round(&self, start_price: Decimal) -> Result<Box<dyn PendingTx>> {
        self.submit(
            "/rounds/start",
            &PriceBody {
                price: start_price.to_string(),
            },
        )
        .await
    }

    async fn lock_round(&self, round_id: u64, lock_price: Decimal) -> Result<Box<dyn PendingTx>> {
        self.submit(
            &format!("/rounds/{round_id}/lock"),
            &PriceBody {
                price: lock_price.to_string(),
            },
        )
        .await
    }

    async fn committed_lock_price(&self, round_id: u64) -> Result<Option<Decimal>> {
        let url = format!("{}/rounds/{}", self.base_url, round_id);
        let info: RoundInfo = self
            .authed(self.client.get(&url))
            .send()
            .await
            .context("round info request failed")?
            .error_for_status()
            .context("round info rejected")?
            .json()
            .await
            .context("round info returned bad body")?;
        info.lock_price
            .map(|raw| {
                raw.parse()
                    .with_context(|| format!("bad lock price {raw:?} for round {round_id}"))
            })
            .transpose()
    }

    async fn resolve_round(
        &self,
        round_id: u64,
        end_price: Decimal,
    ) -> Result<Box<dyn PendingTx>> {
        self.submit(
            &format!("/rounds/{round_id}/resolve"),
            &PriceBody {
                price: end_price.to_string(),
            },
        )
        .await
    }

    async fn claimable_amount(&self, round_id: u64, user: &str) -> Result<Decimal> {
        let url = format!("{}/rounds/{}/claimable/{}", self.base_url, round_id, user);
        let claimable: Claimable = self
            .authed(self.client.get(&url))
            .send()
            .await
            .context("claimable request failed")?
            .error_for_status()
            .context("claimable rejected")?
            .json()
            .await
            .context("claimable returned bad body")?;
        claimable
            .amount
            .parse()
            .with_context(|| format!("bad claimable amount {:?}", claimable.amount))
    }

    async fn claim_reward(&self, round_id: u64, user: &str) -> Result<Box<dyn PendingTx>> {
        self.submit(&format!("/rounds/{round_id}/claim"), &ClaimBody { user })
            .await
    }

    fn name(&self) -> &str {
        "gateway"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_status_decodes() {
        let s: TxStatus =
            serde_json::from_str(r#"{"status":"confirmed","blockNumber":42}"#).unwrap();
        assert!(matches!(s.status, TxState::Confirmed));
        assert_eq!(s.block_number, Some(42));

        let s: TxStatus =
            serde_json::from_str(r#"{"status":"failed","error":"out of gas"}"#).unwrap();
        assert!(matches!(s.status, TxState::Failed));
        assert_eq!(s.error.as_deref(), Some("out of gas"));
    }

    #[test]
    fn test_price_body_keeps_decimal_string() {
        let body = PriceBody {
            price: Decimal::new(170_000_001, 9).to_string(),
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"price":"0.170000001"}"#
        );
    }

    #[test]
    fn test_round_info_lock_price_is_optional() {
        let info: RoundInfo = serde_json::from_str(r#"{"roundId":3}"#).unwrap();
        assert!(info.lock_price.is_none());
        let info: RoundInfo =
            serde_json::from_str(r#"{"roundId":3,"lockPrice":"0.1712"}"#).unwrap();
        assert_eq!(info.lock_price.as_deref(), Some("0.1712"));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let oracle =
            GatewayOracle::new("http://gateway.local/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(oracle.base_url, "http://gateway.local");
    }
}
