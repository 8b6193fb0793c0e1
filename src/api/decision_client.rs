//! HTTP client for the external decision service.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::models::TradeProposal;
use crate::trading::{TradingError, TradingResult};

use super::types::{ClosureProposalsResponse, TradeProposalsResponse};
use super::{DecisionContext, DecisionPipeline};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Posts the cycle context and reads back proposals.
pub struct HttpDecisionPipeline {
    client: Client,
    base_url: String,
}

impl HttpDecisionPipeline {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, context: &DecisionContext) -> TradingResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, cycle = context.cycle, "Requesting proposals");

        let response = self
            .client
            .post(&url)
            .json(context)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TradingError::timeout(path)
                } else {
                    TradingError::Pipeline(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TradingError::Pipeline(format!("{} {} - {}", path, status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| TradingError::Pipeline(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl DecisionPipeline for HttpDecisionPipeline {
    async fn propose_trades(&self, context: &DecisionContext) -> TradingResult<Vec<TradeProposal>> {
        let body: TradeProposalsResponse = self.post("/proposals/trades", context).await?;
        Ok(body.proposals)
    }

    async fn propose_closures(&self, context: &DecisionContext) -> TradingResult<Vec<u64>> {
        let body: ClosureProposalsResponse = self.post("/proposals/closures", context).await?;
        Ok(body.tickets)
    }
}
