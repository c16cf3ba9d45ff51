//! Mock broker for paper trading and tests.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::traits::{AccountService, MarketDataService, OrderService};
use super::types::*;
use crate::error::{BrokerError, BrokerResult};

/// Simulated holding in one contract.
#[derive(Debug, Clone)]
pub struct MockPosition {
    pub symbol: String,
    pub quantity: Decimal,
    pub cost_basis: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// Order accepted by the mock broker.
#[derive(Debug, Clone)]
pub struct SubmittedOrder {
    pub id: String,
    pub legs: Vec<OrderLeg>,
    pub kind: OrderKind,
    pub status: OrderStatus,
}

/// Mock account and order book.
#[derive(Debug, Clone)]
pub struct MockBrokerState {
    pub cash: Decimal,
    pub options_buying_power: Decimal,
    pub positions: HashMap<String, MockPosition>,
    pub orders: Vec<SubmittedOrder>,
    /// Symbols liquidated through `close_position`, in call order
    pub closed: Vec<String>,
}

impl Default for MockBrokerState {
    fn default() -> Self {
        Self {
            cash: dec!(100000),
            options_buying_power: dec!(100000),
            positions: HashMap::new(),
            orders: Vec::new(),
            closed: Vec::new(),
        }
    }
}

/// Simulated market data.
#[derive(Debug, Default)]
struct MockMarket {
    prices: HashMap<String, Decimal>,
    bars: HashMap<String, Vec<DailyBar>>,
    chains: HashMap<String, Vec<OptionContract>>,
    /// Per-share marks for option contracts
    marks: HashMap<String, Decimal>,
}

/// Failure injection switches.
#[derive(Debug, Default)]
struct MockFaults {
    reject_orders: bool,
    reject_order_symbols: HashSet<String>,
    reject_closes: HashSet<String>,
    unavailable: HashSet<String>,
    /// Contracts reported without a market value
    unmarked: HashSet<String>,
    /// Accept orders without filling them
    hold_orders: bool,
    latency: Option<Duration>,
}

/// In-memory broker implementing every collaborator trait.
pub struct MockBroker {
    state: Arc<RwLock<MockBrokerState>>,
    market: Arc<RwLock<MockMarket>>,
    faults: Arc<RwLock<MockFaults>>,
    order_id_counter: AtomicU64,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new(dec!(100000))
    }
}

impl MockBroker {
    /// Create a mock broker whose cash and options buying power both start at `balance`.
    pub fn new(balance: Decimal) -> Self {
        let state = MockBrokerState {
            cash: balance,
            options_buying_power: balance,
            ..Default::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            market: Arc::new(RwLock::new(MockMarket::default())),
            faults: Arc::new(RwLock::new(MockFaults::default())),
            order_id_counter: AtomicU64::new(1),
        }
    }

    // ==================== Market data setup ====================

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.market
            .write()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    pub async fn set_bars(&self, symbol: &str, bars: Vec<DailyBar>) {
        self.market
            .write()
            .await
            .bars
            .insert(symbol.to_string(), bars);
    }

    /// Replace the option chain; contract close prices seed the marks.
    pub async fn set_option_chain(&self, symbol: &str, chain: Vec<OptionContract>) {
        let mut market = self.market.write().await;
        for contract in &chain {
            if let Some(price) = contract.close_price {
                market.marks.insert(contract.symbol.clone(), price);
            }
        }
        market.chains.insert(symbol.to_string(), chain);
    }

    /// Move the per-share mark of one option contract.
    pub async fn set_mark(&self, contract_symbol: &str, price: Decimal) {
        self.market
            .write()
            .await
            .marks
            .insert(contract_symbol.to_string(), price);
    }

    // ==================== Fault injection ====================

    pub async fn set_reject_orders(&self, reject: bool) {
        self.faults.write().await.reject_orders = reject;
    }

    /// Reject any order carrying a leg in `symbol`.
    pub async fn set_reject_orders_for(&self, symbol: &str, reject: bool) {
        let mut faults = self.faults.write().await;
        if reject {
            faults.reject_order_symbols.insert(symbol.to_string());
        } else {
            faults.reject_order_symbols.remove(symbol);
        }
    }

    pub async fn set_reject_close(&self, symbol: &str, reject: bool) {
        let mut faults = self.faults.write().await;
        if reject {
            faults.reject_closes.insert(symbol.to_string());
        } else {
            faults.reject_closes.remove(symbol);
        }
    }

    /// Report `contract_symbol` without a market value in position listings.
    pub async fn set_unmarked(&self, contract_symbol: &str, unmarked: bool) {
        let mut faults = self.faults.write().await;
        if unmarked {
            faults.unmarked.insert(contract_symbol.to_string());
        } else {
            faults.unmarked.remove(contract_symbol);
        }
    }

    /// Leave new orders accepted but unfilled until `fill_held_orders`.
    pub async fn set_hold_orders(&self, hold: bool) {
        self.faults.write().await.hold_orders = hold;
    }

    /// Fill every held order; an order that cannot fill ends rejected.
    pub async fn fill_held_orders(&self) {
        let market = self.market.read().await;
        let mut state = self.state.write().await;

        let held: Vec<usize> = state
            .orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.status == OrderStatus::Accepted)
            .map(|(i, _)| i)
            .collect();
        for index in held {
            let legs = state.orders[index].legs.clone();
            let status = match Self::fill(&mut state, &market, &legs) {
                Ok(_) => OrderStatus::Filled,
                Err(e) => {
                    debug!(order_id = %state.orders[index].id, error = %e, "Held order rejected");
                    OrderStatus::Rejected
                }
            };
            state.orders[index].status = status;
        }
    }

    /// Cancel every held order.
    pub async fn cancel_held_orders(&self) {
        for order in self.state.write().await.orders.iter_mut() {
            if order.status == OrderStatus::Accepted {
                order.status = OrderStatus::Canceled;
            }
        }
    }

    /// Make every market data call for `symbol` fail.
    pub async fn set_data_unavailable(&self, symbol: &str, unavailable: bool) {
        let mut faults = self.faults.write().await;
        if unavailable {
            faults.unavailable.insert(symbol.to_string());
        } else {
            faults.unavailable.remove(symbol);
        }
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.faults.write().await.latency = latency;
    }

    // ==================== Direct state access ====================

    /// Insert a holding directly, as if opened by someone else.
    pub async fn insert_position(&self, symbol: &str, quantity: Decimal, cost_basis: Decimal) {
        self.state.write().await.positions.insert(
            symbol.to_string(),
            MockPosition {
                symbol: symbol.to_string(),
                quantity,
                cost_basis,
                opened_at: Utc::now(),
            },
        );
    }

    /// Remove a holding directly, as if closed outside the runner.
    pub async fn remove_position(&self, symbol: &str) {
        self.state.write().await.positions.remove(symbol);
    }

    /// Get a copy of the current state.
    pub async fn get_state(&self) -> MockBrokerState {
        self.state.read().await.clone()
    }

    pub async fn submitted_orders(&self) -> Vec<SubmittedOrder> {
        self.state.read().await.orders.clone()
    }

    fn next_order_id(&self) -> String {
        format!("mock-{}", self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    async fn simulate_latency(&self) {
        let latency = self.faults.read().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn ensure_available(&self, symbol: &str) -> BrokerResult<()> {
        if self.faults.read().await.unavailable.contains(symbol) {
            return Err(BrokerError::data(format!("simulated outage for {symbol}")));
        }
        Ok(())
    }

    /// Apply a fill to the book and return the debit.
    ///
    /// Every leg is priced before state changes so multi-leg orders are
    /// all-or-nothing.
    fn fill(
        state: &mut MockBrokerState,
        market: &MockMarket,
        legs: &[OrderLeg],
    ) -> BrokerResult<Decimal> {
        let mut priced = Vec::with_capacity(legs.len());
        for leg in legs {
            let mark = market
                .marks
                .get(&leg.symbol)
                .copied()
                .ok_or_else(|| BrokerError::rejected(format!("no quote for {}", leg.symbol)))?;
            let notional = mark * CONTRACT_MULTIPLIER * Decimal::from(leg.quantity);
            priced.push((leg, notional));
        }

        let debit: Decimal = priced
            .iter()
            .filter(|(leg, _)| leg.side == OrderSide::Buy)
            .map(|(_, notional)| *notional)
            .sum();
        if debit > state.options_buying_power {
            return Err(BrokerError::rejected(format!(
                "insufficient options buying power: need {debit}, have {}",
                state.options_buying_power
            )));
        }

        for (leg, notional) in priced {
            let quantity = Decimal::from(leg.quantity);
            match leg.side {
                OrderSide::Buy => {
                    let position = state
                        .positions
                        .entry(leg.symbol.clone())
                        .or_insert_with(|| MockPosition {
                            symbol: leg.symbol.clone(),
                            quantity: Decimal::ZERO,
                            cost_basis: Decimal::ZERO,
                            opened_at: Utc::now(),
                        });
                    position.quantity += quantity;
                    position.cost_basis += notional;
                    state.cash -= notional;
                    state.options_buying_power -= notional;
                }
                OrderSide::Sell => {
                    let remove = match state.positions.get_mut(&leg.symbol) {
                        Some(position) if position.quantity >= quantity => {
                            let unit_cost = position.cost_basis / position.quantity;
                            position.quantity -= quantity;
                            position.cost_basis -= unit_cost * quantity;
                            position.quantity.is_zero()
                        }
                        _ => {
                            return Err(BrokerError::rejected(format!(
                                "uncovered sell of {}",
                                leg.symbol
                            )))
                        }
                    };
                    if remove {
                        state.positions.remove(&leg.symbol);
                    }
                    state.cash += notional;
                    state.options_buying_power += notional;
                }
            }
        }

        Ok(debit)
    }

    /// Market value of a holding at the current mark (cost basis when unmarked).
    fn market_value(position: &MockPosition, marks: &HashMap<String, Decimal>) -> Decimal {
        marks
            .get(&position.symbol)
            .map(|mark| *mark * CONTRACT_MULTIPLIER * position.quantity)
            .unwrap_or(position.cost_basis)
    }
}

#[async_trait]
impl AccountService for MockBroker {
    async fn account(&self) -> BrokerResult<AccountSnapshot> {
        self.simulate_latency().await;
        let market = self.market.read().await;
        let state = self.state.read().await;

        let holdings: Decimal = state
            .positions
            .values()
            .map(|p| Self::market_value(p, &market.marks))
            .sum();

        Ok(AccountSnapshot {
            cash: state.cash,
            equity: state.cash + holdings,
            options_buying_power: state.options_buying_power,
        })
    }
}

#[async_trait]
impl MarketDataService for MockBroker {
    async fn latest_price(&self, symbol: &str) -> BrokerResult<Decimal> {
        self.simulate_latency().await;
        self.ensure_available(symbol).await?;

        self.market
            .read()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::data(format!("no price for {symbol}")))
    }

    async fn daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BrokerResult<Vec<DailyBar>> {
        self.simulate_latency().await;
        self.ensure_available(symbol).await?;

        let market = self.market.read().await;
        let bars = market
            .bars
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.date >= start && b.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(bars)
    }

    async fn option_chain(
        &self,
        symbol: &str,
        range: ExpiryRange,
    ) -> BrokerResult<Vec<OptionContract>> {
        self.simulate_latency().await;
        self.ensure_available(symbol).await?;

        let market = self.market.read().await;
        let chain = market
            .chains
            .get(symbol)
            .map(|chain| {
                chain
                    .iter()
                    .filter(|c| range.contains(c.expiration))
                    .map(|c| {
                        let mut contract = c.clone();
                        if let Some(mark) = market.marks.get(&c.symbol) {
                            contract.close_price = Some(*mark);
                        }
                        contract
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(chain)
    }
}

#[async_trait]
impl OrderService for MockBroker {
    async fn submit_order(&self, legs: &[OrderLeg], kind: OrderKind) -> BrokerResult<OrderResult> {
        self.simulate_latency().await;

        {
            let faults = self.faults.read().await;
            if faults.reject_orders {
                return Err(BrokerError::rejected("simulated order rejection"));
            }
            if let Some(leg) = legs
                .iter()
                .find(|leg| faults.reject_order_symbols.contains(&leg.symbol))
            {
                return Err(BrokerError::rejected(format!(
                    "simulated rejection for {}",
                    leg.symbol
                )));
            }
        }
        if legs.is_empty() {
            return Err(BrokerError::rejected("order has no legs"));
        }
        if kind == OrderKind::Single && legs.len() != 1 {
            return Err(BrokerError::rejected("single orders carry exactly one leg"));
        }

        let market = self.market.read().await;
        let mut state = self.state.write().await;

        let (status, debit) = if self.faults.read().await.hold_orders {
            (OrderStatus::Accepted, Decimal::ZERO)
        } else {
            (OrderStatus::Filled, Self::fill(&mut state, &market, legs)?)
        };

        let id = self.next_order_id();
        state.orders.push(SubmittedOrder {
            id: id.clone(),
            legs: legs.to_vec(),
            kind,
            status,
        });

        info!(
            order_id = %id,
            legs = legs.len(),
            kind = ?kind,
            debit = %debit,
            cash = %state.cash,
            status = ?status,
            "Mock order submitted"
        );

        Ok(OrderResult { id, status })
    }

    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderResult> {
        self.simulate_latency().await;
        self.state
            .read()
            .await
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .map(|o| OrderResult {
                id: o.id.clone(),
                status: o.status,
            })
            .ok_or_else(|| BrokerError::data(format!("unknown order {order_id}")))
    }

    async fn close_position(&self, symbol: &str) -> BrokerResult<OrderResult> {
        self.simulate_latency().await;

        if self.faults.read().await.reject_closes.contains(symbol) {
            return Err(BrokerError::rejected(format!(
                "simulated close rejection for {symbol}"
            )));
        }

        let market = self.market.read().await;
        let mut state = self.state.write().await;

        let position = state
            .positions
            .remove(symbol)
            .ok_or_else(|| BrokerError::PositionNotFound(symbol.to_string()))?;

        let proceeds = Self::market_value(&position, &market.marks);
        state.cash += proceeds;
        state.options_buying_power += proceeds;
        state.closed.push(symbol.to_string());

        let id = self.next_order_id();
        debug!(
            order_id = %id,
            %symbol,
            quantity = %position.quantity,
            %proceeds,
            pnl = %(proceeds - position.cost_basis),
            "Mock position closed"
        );

        Ok(OrderResult {
            id,
            status: OrderStatus::Filled,
        })
    }

    async fn list_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        self.simulate_latency().await;
        let unmarked = self.faults.read().await.unmarked.clone();
        let market = self.market.read().await;
        let state = self.state.read().await;

        let mut positions: Vec<BrokerPosition> = state
            .positions
            .values()
            .map(|p| BrokerPosition {
                symbol: p.symbol.clone(),
                quantity: p.quantity,
                cost_basis: p.cost_basis,
                market_value: (!unmarked.contains(&p.symbol))
                    .then(|| Self::market_value(p, &market.marks)),
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }
}
