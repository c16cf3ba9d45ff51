//! Alpaca REST API client.
//!
//! Implements the broker collaborator traits against Alpaca's trading and
//! market data APIs:
//! - Account, positions and orders (paper or live trading endpoint)
//! - Latest trades and daily bars for underlyings
//! - Option contracts merged with option snapshots for implied volatility

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::types::*;
use crate::broker::traits::{AccountService, MarketDataService, OrderService};
use crate::broker::types::{
    AccountSnapshot, BrokerPosition, DailyBar, ExpiryRange, OptionContract, OrderKind, OrderLeg,
    OrderResult, OrderSide,
};
use crate::config::AlpacaConfig;
use crate::error::{BrokerError, BrokerResult};

const PAPER_TRADING_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_TRADING_URL: &str = "https://api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";

const PAGE_LIMIT: u32 = 1000;

/// Alpaca client for trading and market data.
#[derive(Debug, Clone)]
pub struct AlpacaClient {
    http: Client,
    api_key: String,
    secret_key: String,
    trading_base_url: String,
    data_base_url: String,
}

impl AlpacaClient {
    /// Create a new client from configuration.
    pub fn new(config: &AlpacaConfig) -> anyhow::Result<Self> {
        let trading_url = config.trading_url.clone().unwrap_or_else(|| {
            if config.paper {
                PAPER_TRADING_URL.to_string()
            } else {
                LIVE_TRADING_URL.to_string()
            }
        });
        let data_url = config
            .data_url
            .clone()
            .unwrap_or_else(|| DATA_URL.to_string());

        Self::with_base_urls(config, &trading_url, &data_url)
    }

    /// Create a new client with explicit base URLs.
    pub fn with_base_urls(
        config: &AlpacaConfig,
        trading_url: &str,
        data_url: &str,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            trading_base_url: trading_url.trim_end_matches('/').to_string(),
            data_base_url: data_url.trim_end_matches('/').to_string(),
        })
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    /// GET a data resource; any failure is reported as unavailable data.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> BrokerResult<T> {
        let response = self
            .authed(self.http.get(url).query(query))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::data(format!(
                "Alpaca API error {}: {}",
                status,
                error_message(&body)
            )));
        }

        Ok(response.json().await?)
    }

    /// Fetch one page of option contracts.
    async fn option_contracts_page(
        &self,
        symbol: &str,
        range: ExpiryRange,
        page_token: Option<&str>,
    ) -> BrokerResult<OptionContractsResponse> {
        let url = format!("{}/v2/options/contracts", self.trading_base_url);
        let mut query = vec![
            ("underlying_symbols", symbol.to_string()),
            ("status", "active".to_string()),
            ("expiration_date_gte", range.min.to_string()),
            ("expiration_date_lte", range.max.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("page_token", token.to_string()));
        }
        self.get_json(&url, &query).await
    }

    /// Fetch option snapshots (IV, latest trade) for an underlying.
    #[instrument(skip(self), name = "alpaca_option_snapshots")]
    pub async fn option_snapshots(
        &self,
        underlying: &str,
        range: ExpiryRange,
    ) -> BrokerResult<Vec<(String, OptionSnapshot)>> {
        let url = format!(
            "{}/v1beta1/options/snapshots/{}",
            self.data_base_url,
            urlencoding::encode(underlying)
        );

        let mut snapshots = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("feed", "indicative".to_string()),
                ("expiration_date_gte", range.min.to_string()),
                ("expiration_date_lte", range.max.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }

            let page: OptionSnapshotsResponse = self.get_json(&url, &query).await?;
            snapshots.extend(page.snapshots);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(%underlying, count = snapshots.len(), "Fetched option snapshots");
        Ok(snapshots)
    }

    /// Most recent orders in any status, newest first.
    #[instrument(skip(self))]
    pub async fn recent_orders(&self, limit: u32) -> BrokerResult<Vec<Order>> {
        let url = format!("{}/v2/orders", self.trading_base_url);
        let query = [
            ("status", "all".to_string()),
            ("limit", limit.to_string()),
            ("direction", "desc".to_string()),
            ("nested", "true".to_string()),
        ];
        self.get_json(&url, &query).await
    }

    /// Fetch the trading clock's view of whether the market is open.
    #[instrument(skip(self))]
    pub async fn is_market_open(&self) -> BrokerResult<bool> {
        #[derive(serde::Deserialize)]
        struct Clock {
            is_open: bool,
        }

        let url = format!("{}/v2/clock", self.trading_base_url);
        let clock: Clock = self.get_json(&url, &[]).await?;
        Ok(clock.is_open)
    }
}

/// Extract the `message` field of an Alpaca error body when present.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.to_string())
}

/// Merge snapshot data into contracts by contract symbol.
fn merge_snapshots(
    contracts: &mut [OptionContract],
    snapshots: Vec<(String, OptionSnapshot)>,
) {
    let snapshots: std::collections::HashMap<String, OptionSnapshot> =
        snapshots.into_iter().collect();

    for contract in contracts.iter_mut() {
        if let Some(snapshot) = snapshots.get(&contract.symbol) {
            contract.implied_volatility = snapshot.implied_volatility;
            if let Some(trade) = &snapshot.latest_trade {
                contract.close_price = Some(trade.price);
            }
        }
    }
}

#[async_trait]
impl AccountService for AlpacaClient {
    #[instrument(skip(self), name = "alpaca_account")]
    async fn account(&self) -> BrokerResult<AccountSnapshot> {
        let url = format!("{}/v2/account", self.trading_base_url);
        let account: Account = self.get_json(&url, &[]).await?;
        Ok(account.into())
    }
}

#[async_trait]
impl MarketDataService for AlpacaClient {
    #[instrument(skip(self), name = "alpaca_latest_price")]
    async fn latest_price(&self, symbol: &str) -> BrokerResult<Decimal> {
        let url = format!(
            "{}/v2/stocks/{}/trades/latest",
            self.data_base_url,
            urlencoding::encode(symbol)
        );
        let response: LatestTradeResponse = self.get_json(&url, &[]).await?;
        Ok(response.trade.price)
    }

    #[instrument(skip(self), name = "alpaca_daily_bars")]
    async fn daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BrokerResult<Vec<DailyBar>> {
        let url = format!(
            "{}/v2/stocks/{}/bars",
            self.data_base_url,
            urlencoding::encode(symbol)
        );

        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("timeframe", "1Day".to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("adjustment", "all".to_string()),
                ("limit", "10000".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }

            let page: BarsResponse = self.get_json(&url, &query).await?;
            bars.extend(page.bars.unwrap_or_default().into_iter().map(DailyBar::from));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(%symbol, count = bars.len(), "Fetched daily bars");
        Ok(bars)
    }

    #[instrument(skip(self), name = "alpaca_option_chain")]
    async fn option_chain(
        &self,
        symbol: &str,
        range: ExpiryRange,
    ) -> BrokerResult<Vec<OptionContract>> {
        let mut contracts: Vec<OptionContract> = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .option_contracts_page(symbol, range, page_token.as_deref())
                .await?;
            contracts.extend(
                page.option_contracts
                    .into_iter()
                    .filter(|c| c.tradable.unwrap_or(true))
                    .map(OptionContract::from),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        match self.option_snapshots(symbol, range).await {
            Ok(snapshots) => merge_snapshots(&mut contracts, snapshots),
            Err(e) => {
                // Contracts are still usable for selection, just without IV
                warn!(%symbol, error = %e, "Failed to fetch option snapshots");
            }
        }

        debug!(%symbol, count = contracts.len(), "Fetched option chain");
        Ok(contracts)
    }
}

#[async_trait]
impl OrderService for AlpacaClient {
    #[instrument(skip(self), name = "alpaca_submit_order")]
    async fn submit_order(&self, legs: &[OrderLeg], kind: OrderKind) -> BrokerResult<OrderResult> {
        let request = build_order_request(legs, kind)?;
        let url = format!("{}/v2/orders", self.trading_base_url);

        debug!(?request, "Submitting order");

        let response = self
            .authed(self.http.post(&url).json(&request))
            .send()
            .await
            .map_err(|e| BrokerError::rejected(format!("order submission failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::rejected(format!(
                "Alpaca order error {}: {}",
                status,
                error_message(&body)
            )));
        }

        let order: Order = response.json().await?;
        Ok(order.into())
    }

    #[instrument(skip(self), name = "alpaca_order_status")]
    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderResult> {
        let url = format!(
            "{}/v2/orders/{}",
            self.trading_base_url,
            urlencoding::encode(order_id)
        );
        let order: Order = self.get_json(&url, &[]).await?;
        Ok(order.into())
    }

    #[instrument(skip(self), name = "alpaca_close_position")]
    async fn close_position(&self, symbol: &str) -> BrokerResult<OrderResult> {
        let url = format!(
            "{}/v2/positions/{}",
            self.trading_base_url,
            urlencoding::encode(symbol)
        );

        let response = self
            .authed(self.http.delete(&url))
            .send()
            .await
            .map_err(|e| BrokerError::rejected(format!("close request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BrokerError::PositionNotFound(symbol.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::rejected(format!(
                "Alpaca close error {}: {}",
                status,
                error_message(&body)
            )));
        }

        let order: Order = response.json().await?;
        Ok(order.into())
    }

    #[instrument(skip(self), name = "alpaca_list_positions")]
    async fn list_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let url = format!("{}/v2/positions", self.trading_base_url);
        let positions: Vec<Position> = self.get_json(&url, &[]).await?;
        Ok(positions.into_iter().map(BrokerPosition::from).collect())
    }
}

/// Translate broker-neutral legs into an Alpaca order body.
fn build_order_request(legs: &[OrderLeg], kind: OrderKind) -> BrokerResult<NewOrderRequest> {
    match (kind, legs) {
        (_, []) => Err(BrokerError::rejected("order has no legs")),
        (OrderKind::Single, [leg]) => Ok(NewOrderRequest {
            symbol: Some(leg.symbol.clone()),
            qty: leg.quantity.to_string(),
            side: Some(leg.side),
            order_type: "market".to_string(),
            time_in_force: "day".to_string(),
            order_class: None,
            legs: Vec::new(),
        }),
        (OrderKind::Single, _) => Err(BrokerError::rejected(
            "single orders carry exactly one leg",
        )),
        (OrderKind::MultiLeg, legs) => {
            // mleg orders carry the quantity at the top level and ratios per leg
            let qty = legs[0].quantity;
            if legs.iter().any(|l| l.quantity != qty) {
                return Err(BrokerError::rejected(
                    "multi-leg orders need equal leg quantities",
                ));
            }
            Ok(NewOrderRequest {
                symbol: None,
                qty: qty.to_string(),
                side: None,
                order_type: "market".to_string(),
                time_in_force: "day".to_string(),
                order_class: Some("mleg".to_string()),
                legs: legs
                    .iter()
                    .map(|l| OrderLegRequest {
                        symbol: l.symbol.clone(),
                        side: l.side,
                        ratio_qty: "1".to_string(),
                        position_intent: Some(
                            match l.side {
                                OrderSide::Buy => "buy_to_open",
                                OrderSide::Sell => "sell_to_close",
                            }
                            .to_string(),
                        ),
                    })
                    .collect(),
            })
        }
    }
}
