//! Straddle decision and lifecycle engine.
//!
//! One sequential pass over the symbol universe per cycle:
//! - adopt straddles the broker holds that have no local record
//! - evaluate entries for idle symbols
//! - review open straddles and close them on IV or value thresholds
//!
//! The broker position list is the source of truth. Every collaborator
//! call is bounded by a timeout and every failure becomes a [`SkipReason`]
//! for that symbol only.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::US::Eastern;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::selector::select_straddle;
use super::session::MarketHours;
use super::signal::{entry_signal, iv_exit, value_exit, ExitReason};
use super::sizing::{compute_straddle_quantity, straddle_cost};
use super::volatility::{
    current_implied_volatility, historical_volatility, implied_volatility_from_chain,
    VolatilityEstimate,
};
use crate::broker::{
    position_belongs_to, Broker, BrokerPosition, ExpiryRange, OptionContract, OptionKind,
    OrderKind, OrderLeg, OrderResult,
};
use crate::config::StrategyConfig;
use crate::error::{BrokerError, BrokerResult, SkipReason};

/// Default bound for a single broker call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// An open long straddle managed by this process.
#[derive(Debug, Clone, PartialEq)]
pub struct StraddlePosition {
    pub underlying: String,
    pub call: OptionContract,
    pub put: OptionContract,
    /// IV at entry; `None` for adopted straddles until the first observation
    pub entry_iv: Option<f64>,
    /// Total debit across all straddles
    pub entry_cost: Decimal,
    pub quantity: u32,
    pub opened_at: DateTime<Utc>,
    /// Legs already closed by an exit still in progress
    pub closed_legs: BTreeSet<String>,
    /// Exit decided in an earlier cycle that has not completed yet
    pub pending_exit: Option<ExitReason>,
    /// Orders that opened the straddle; empty for adopted straddles
    pub entry_orders: Vec<String>,
    /// Both legs have been seen at the broker since entry
    pub confirmed: bool,
}

impl StraddlePosition {
    pub fn leg_symbols(&self) -> [&str; 2] {
        [self.call.symbol.as_str(), self.put.symbol.as_str()]
    }

    pub fn is_fully_closed(&self) -> bool {
        self.leg_symbols()
            .iter()
            .all(|leg| self.closed_legs.contains(*leg))
    }
}

/// Lifecycle state of one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolState {
    #[default]
    Idle,
    Evaluating,
    Entering,
    Open,
    Exiting,
}

/// What happened to one symbol during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    Entered {
        quantity: u32,
        entry_cost: Decimal,
        entry_iv: f64,
        order_ids: Vec<String>,
    },
    Exited(ExitReason),
    Held {
        value: Decimal,
        current_iv: Option<f64>,
    },
    NoSignal {
        hv: f64,
        iv: f64,
    },
    /// Entry orders accepted but not yet filled
    Pending {
        order_ids: Vec<String>,
    },
    Skipped(SkipReason),
}

/// Where the entry orders of an unconfirmed straddle stand.
enum EntryProgress {
    Working(Vec<String>),
    /// No order can fill any further; `failed` lists those that died unfilled
    Settled { failed: Vec<String> },
}

/// Summary of one pass over the universe.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<(String, SymbolOutcome)>,
    /// A shutdown request stopped the pass before every symbol was visited
    pub interrupted: bool,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            outcomes: Vec::new(),
            interrupted: false,
        }
    }

    fn record(&mut self, symbol: &str, outcome: SymbolOutcome) {
        self.outcomes.push((symbol.to_string(), outcome));
    }

    pub fn outcome(&self, symbol: &str) -> Option<&SymbolOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, outcome)| outcome)
    }

    pub fn entries(&self) -> usize {
        self.count(|o| matches!(o, SymbolOutcome::Entered { .. }))
    }

    pub fn exits(&self) -> usize {
        self.count(|o| matches!(o, SymbolOutcome::Exited(_)))
    }

    pub fn skips(&self) -> usize {
        self.count(|o| matches!(o, SymbolOutcome::Skipped(_)))
    }

    fn count(&self, pred: impl Fn(&SymbolOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Run a broker call under a deadline.
async fn with_timeout<T>(
    limit: Duration,
    operation: &'static str,
    call: impl Future<Output = BrokerResult<T>>,
) -> BrokerResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, ?limit, "Broker call timed out");
            Err(BrokerError::Timeout {
                operation,
                elapsed: limit,
            })
        }
    }
}

fn accepted(result: OrderResult) -> Result<String, SkipReason> {
    if result.status.is_terminal_failure() {
        Err(SkipReason::BrokerRejected(format!(
            "order {} ended {:?}",
            result.id, result.status
        )))
    } else {
        Ok(result.id)
    }
}

/// Rebuild a straddle from the broker's holdings for one underlying.
///
/// Only a clean pair qualifies: one call and one put, same expiration,
/// same whole-contract quantity.
fn adopt_straddle(
    underlying: &str,
    held: &[&BrokerPosition],
    now: DateTime<Utc>,
) -> Option<StraddlePosition> {
    if held.len() != 2 {
        return None;
    }

    let mut call = None;
    let mut put = None;
    for position in held {
        let contract = OptionContract::from_occ(&position.symbol)?;
        let slot = match contract.kind {
            OptionKind::Call => &mut call,
            OptionKind::Put => &mut put,
        };
        if slot.replace((contract, *position)).is_some() {
            return None;
        }
    }

    let (call, call_position) = call?;
    let (put, put_position) = put?;
    if call.expiration != put.expiration || call_position.quantity != put_position.quantity {
        return None;
    }
    if !call_position.quantity.fract().is_zero() {
        return None;
    }
    let quantity = call_position.quantity.to_u32().filter(|q| *q > 0)?;

    Some(StraddlePosition {
        underlying: underlying.to_string(),
        call,
        put,
        entry_iv: None,
        entry_cost: call_position.cost_basis + put_position.cost_basis,
        quantity,
        opened_at: now,
        closed_legs: BTreeSet::new(),
        pending_exit: None,
        entry_orders: Vec::new(),
        confirmed: true,
    })
}

/// Entry/exit engine over an injected broker.
pub struct StraddleEngine<B: Broker> {
    broker: Arc<B>,
    config: StrategyConfig,
    hours: MarketHours,
    call_timeout: Duration,
    clock: fn() -> DateTime<Utc>,
    registry: HashMap<String, StraddlePosition>,
    states: HashMap<String, SymbolState>,
}

impl<B: Broker> StraddleEngine<B> {
    pub fn new(broker: Arc<B>, config: StrategyConfig) -> Self {
        Self {
            broker,
            config,
            hours: MarketHours::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            clock: Utc::now,
            registry: HashMap::new(),
            states: HashMap::new(),
        }
    }

    pub fn with_market_hours(mut self, hours: MarketHours) -> Self {
        self.hours = hours;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Replace the wall clock (used for session checks and date windows).
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn position(&self, symbol: &str) -> Option<&StraddlePosition> {
        self.registry.get(symbol)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &StraddlePosition> {
        self.registry.values()
    }

    pub fn state(&self, symbol: &str) -> SymbolState {
        self.states.get(symbol).copied().unwrap_or_default()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&Eastern).date_naive()
    }

    fn expiry_range(&self) -> ExpiryRange {
        ExpiryRange::from_days(
            self.today(),
            self.config.expiry_min_days,
            self.config.expiry_max_days,
        )
    }

    fn set_state(&mut self, symbol: &str, state: SymbolState) {
        let previous = self.states.insert(symbol.to_string(), state);
        if previous != Some(state) {
            debug!(%symbol, from = ?previous.unwrap_or_default(), to = ?state, "State transition");
        }
    }

    /// Historical and implied volatility for `symbol`, without trading.
    pub async fn volatility(&self, symbol: &str) -> VolatilityEstimate {
        let today = self.today();
        let broker = self.broker.as_ref();

        let historical = tokio::time::timeout(
            self.call_timeout,
            historical_volatility(
                broker,
                symbol,
                self.config.lookback_days,
                self.config.min_observations,
                today,
            ),
        )
        .await
        .unwrap_or(None);

        let implied = tokio::time::timeout(
            self.call_timeout,
            current_implied_volatility(broker, symbol, self.expiry_range()),
        )
        .await
        .unwrap_or(None);

        VolatilityEstimate {
            historical,
            implied,
        }
    }

    /// Evaluate every symbol once.
    ///
    /// `shutdown` is checked between symbols; a symbol in progress always
    /// finishes.
    #[instrument(skip(self, symbols, shutdown), fields(symbols = symbols.len()))]
    pub async fn run_cycle(
        &mut self,
        symbols: &[String],
        shutdown: &watch::Receiver<bool>,
    ) -> CycleReport {
        let mut report = CycleReport::new(self.now());

        let positions = match with_timeout(
            self.call_timeout,
            "list_positions",
            self.broker.list_positions(),
        )
        .await
        {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "Cannot read broker positions, skipping cycle");
                let reason = SkipReason::from_data_error(&e);
                for symbol in symbols {
                    report.record(symbol, SymbolOutcome::Skipped(reason.clone()));
                }
                return report;
            }
        };

        self.adopt_untracked(symbols, &positions);

        for symbol in symbols {
            if *shutdown.borrow() {
                info!("Shutdown requested, stopping cycle");
                report.interrupted = true;
                break;
            }

            let outcome = self.process_symbol(symbol, &positions).await;
            report.record(symbol, outcome);
        }

        report
    }

    /// Register straddles held at the broker that this process does not know about.
    fn adopt_untracked(&mut self, symbols: &[String], positions: &[BrokerPosition]) {
        for symbol in symbols {
            if self.registry.contains_key(symbol) {
                continue;
            }

            let held: Vec<&BrokerPosition> = positions
                .iter()
                .filter(|p| position_belongs_to(&p.symbol, symbol))
                .collect();
            if held.is_empty() {
                continue;
            }

            match adopt_straddle(symbol, &held, self.now()) {
                Some(straddle) => {
                    info!(
                        %symbol,
                        call = %straddle.call.symbol,
                        put = %straddle.put.symbol,
                        quantity = straddle.quantity,
                        entry_cost = %straddle.entry_cost,
                        "[ADOPT] Tracking straddle found at broker"
                    );
                    self.registry.insert(symbol.clone(), straddle);
                    self.set_state(symbol, SymbolState::Open);
                }
                None => {
                    debug!(%symbol, positions = held.len(), "Held positions do not form a straddle");
                }
            }
        }
    }

    async fn process_symbol(&mut self, symbol: &str, positions: &[BrokerPosition]) -> SymbolOutcome {
        if self.registry.contains_key(symbol) {
            return self.review_position(symbol, positions).await;
        }

        if positions.iter().any(|p| position_belongs_to(&p.symbol, symbol)) {
            info!(%symbol, "[SKIP] Broker holds an unmanaged position for symbol");
            return SymbolOutcome::Skipped(SkipReason::ExternallyHeld);
        }

        self.evaluate_entry(symbol).await
    }

    // ==================== Entry ====================

    #[instrument(skip(self))]
    async fn evaluate_entry(&mut self, symbol: &str) -> SymbolOutcome {
        self.set_state(symbol, SymbolState::Evaluating);

        let outcome = self.try_enter(symbol).await;

        match &outcome {
            SymbolOutcome::Entered { .. } => self.set_state(symbol, SymbolState::Open),
            SymbolOutcome::Skipped(reason) => {
                info!(%symbol, %reason, "[SKIP] No entry this cycle");
                self.set_state(symbol, SymbolState::Idle);
            }
            _ => self.set_state(symbol, SymbolState::Idle),
        }

        outcome
    }

    async fn try_enter(&mut self, symbol: &str) -> SymbolOutcome {
        if !self.hours.is_open_at(self.now()) {
            return SymbolOutcome::Skipped(SkipReason::MarketClosed);
        }

        let broker = Arc::clone(&self.broker);
        let limit = self.call_timeout;

        let price = match with_timeout(limit, "latest_price", broker.latest_price(symbol)).await {
            Ok(price) => price,
            Err(e) => return SymbolOutcome::Skipped(SkipReason::from_data_error(&e)),
        };

        let chain = match with_timeout(
            limit,
            "option_chain",
            broker.option_chain(symbol, self.expiry_range()),
        )
        .await
        {
            Ok(chain) => chain,
            Err(e) => return SymbolOutcome::Skipped(SkipReason::from_data_error(&e)),
        };

        let Some(iv) = implied_volatility_from_chain(&chain, price) else {
            return SymbolOutcome::Skipped(SkipReason::DataUnavailable(format!(
                "no implied volatility among {} contracts",
                chain.len()
            )));
        };

        let hv_call = historical_volatility(
            broker.as_ref(),
            symbol,
            self.config.lookback_days,
            self.config.min_observations,
            self.today(),
        );
        let hv_call = async { Ok::<_, BrokerError>(hv_call.await) };
        let hv = match with_timeout(limit, "daily_bars", hv_call).await {
            Ok(Some(hv)) => hv,
            Ok(None) => {
                return SymbolOutcome::Skipped(SkipReason::DataUnavailable(
                    "historical volatility unavailable".to_string(),
                ))
            }
            Err(e) => return SymbolOutcome::Skipped(SkipReason::from_data_error(&e)),
        };

        if !entry_signal(hv, iv, self.config.entry_multiplier) {
            info!(
                %symbol,
                hv = %format!("{:.4}", hv),
                iv = %format!("{:.4}", iv),
                threshold = %format!("{:.4}", self.config.entry_multiplier * hv),
                "No entry signal"
            );
            return SymbolOutcome::NoSignal { hv, iv };
        }

        info!(
            %symbol,
            %price,
            hv = %format!("{:.4}", hv),
            iv = %format!("{:.4}", iv),
            "[SIGNAL] Implied volatility rich versus realized"
        );

        self.set_state(symbol, SymbolState::Entering);
        self.enter(symbol, price, &chain, iv).await
    }

    async fn enter(
        &mut self,
        symbol: &str,
        price: Decimal,
        chain: &[OptionContract],
        chain_iv: f64,
    ) -> SymbolOutcome {
        let broker = Arc::clone(&self.broker);
        let limit = self.call_timeout;

        let Some((call, put)) = select_straddle(chain, price) else {
            return SymbolOutcome::Skipped(SkipReason::SelectionFailure(format!(
                "no call/put pair around {price}"
            )));
        };

        let Some(per_straddle) = straddle_cost(&call, &put) else {
            return SymbolOutcome::Skipped(SkipReason::SelectionFailure(format!(
                "{} or {} has no price",
                call.symbol, put.symbol
            )));
        };

        let account = match with_timeout(limit, "account", broker.account()).await {
            Ok(account) => account,
            Err(e) => return SymbolOutcome::Skipped(SkipReason::from_data_error(&e)),
        };

        let buying_power = account.options_buying_power * self.config.capital_fraction;
        let quantity =
            compute_straddle_quantity(buying_power, per_straddle, self.config.max_straddles);
        if quantity == 0 {
            debug!(%symbol, %buying_power, %per_straddle, "Cannot afford one straddle");
            return SymbolOutcome::Skipped(SkipReason::InsufficientFunds);
        }

        if !self.hours.is_open_at(self.now()) {
            return SymbolOutcome::Skipped(SkipReason::MarketClosed);
        }

        // Read-verify-act against the live position list
        match with_timeout(limit, "list_positions", broker.list_positions()).await {
            Ok(positions) if positions.iter().any(|p| position_belongs_to(&p.symbol, symbol)) => {
                return SymbolOutcome::Skipped(SkipReason::ExternallyHeld);
            }
            Ok(_) => {}
            Err(e) => return SymbolOutcome::Skipped(SkipReason::from_data_error(&e)),
        }

        info!(
            %symbol,
            call = %call.symbol,
            put = %put.symbol,
            strike = %call.strike,
            expiration = %call.expiration,
            quantity,
            %per_straddle,
            "Submitting straddle"
        );

        let submitted = match self.config.order_kind {
            OrderKind::MultiLeg => self.submit_multi_leg(&call, &put, quantity).await,
            OrderKind::Single => self.submit_single_legs(&call, &put, quantity).await,
        };
        let order_ids = match submitted {
            Ok(ids) => ids,
            Err(reason) => {
                warn!(%symbol, %reason, "Straddle order failed");
                return SymbolOutcome::Skipped(reason);
            }
        };

        let entry_iv = match (call.implied_volatility, put.implied_volatility) {
            (Some(call_iv), Some(put_iv)) => (call_iv + put_iv) / 2.0,
            _ => chain_iv,
        };
        let entry_cost = per_straddle * Decimal::from(quantity);

        info!(
            %symbol,
            quantity,
            %entry_cost,
            entry_iv = %format!("{:.4}", entry_iv),
            orders = ?order_ids,
            "[ENTRY] Straddle opened"
        );

        self.registry.insert(
            symbol.to_string(),
            StraddlePosition {
                underlying: symbol.to_string(),
                call,
                put,
                entry_iv: Some(entry_iv),
                entry_cost,
                quantity,
                opened_at: self.now(),
                closed_legs: BTreeSet::new(),
                pending_exit: None,
                entry_orders: order_ids.clone(),
                confirmed: false,
            },
        );

        SymbolOutcome::Entered {
            quantity,
            entry_cost,
            entry_iv,
            order_ids,
        }
    }

    async fn submit_multi_leg(
        &self,
        call: &OptionContract,
        put: &OptionContract,
        quantity: u32,
    ) -> Result<Vec<String>, SkipReason> {
        let legs = [
            OrderLeg::buy(&call.symbol, quantity),
            OrderLeg::buy(&put.symbol, quantity),
        ];
        let result = with_timeout(
            self.call_timeout,
            "submit_order",
            self.broker.submit_order(&legs, OrderKind::MultiLeg),
        )
        .await
        .map_err(|e| SkipReason::from_order_error(&e))?;

        accepted(result).map(|id| vec![id])
    }

    async fn submit_leg(&self, contract: &OptionContract, quantity: u32) -> Result<String, SkipReason> {
        let legs = [OrderLeg::buy(&contract.symbol, quantity)];
        let result = with_timeout(
            self.call_timeout,
            "submit_order",
            self.broker.submit_order(&legs, OrderKind::Single),
        )
        .await
        .map_err(|e| SkipReason::from_order_error(&e))?;

        accepted(result)
    }

    /// Call first, then put; a failed put unwinds the call.
    async fn submit_single_legs(
        &self,
        call: &OptionContract,
        put: &OptionContract,
        quantity: u32,
    ) -> Result<Vec<String>, SkipReason> {
        let call_id = self.submit_leg(call, quantity).await?;

        match self.submit_leg(put, quantity).await {
            Ok(put_id) => Ok(vec![call_id, put_id]),
            Err(reason) => {
                warn!(call = %call.symbol, %reason, "Put leg failed, unwinding call leg");
                match with_timeout(
                    self.call_timeout,
                    "close_position",
                    self.broker.close_position(&call.symbol),
                )
                .await
                {
                    Ok(_) | Err(BrokerError::PositionNotFound(_)) => {
                        info!(call = %call.symbol, "Call leg unwound");
                    }
                    Err(e) => {
                        error!(
                            call = %call.symbol,
                            error = %e,
                            "Failed to unwind call leg, position left open at broker"
                        );
                    }
                }
                Err(reason)
            }
        }
    }

    // ==================== Review and exit ====================

    #[instrument(skip(self, positions))]
    async fn review_position(&mut self, symbol: &str, positions: &[BrokerPosition]) -> SymbolOutcome {
        let Some(mut straddle) = self.registry.get(symbol).cloned() else {
            return SymbolOutcome::Skipped(SkipReason::DataUnavailable(format!(
                "no straddle recorded for {symbol}"
            )));
        };

        let legs = straddle.leg_symbols();
        let open_legs: Vec<&BrokerPosition> = positions
            .iter()
            .filter(|p| legs.contains(&p.symbol.as_str()) && !straddle.closed_legs.contains(&p.symbol))
            .collect();

        if !straddle.confirmed
            && open_legs.len() < legs.len()
            && !straddle.entry_orders.is_empty()
        {
            match self.entry_progress(symbol, &straddle.entry_orders).await {
                Err(reason) => return SymbolOutcome::Skipped(reason),
                Ok(EntryProgress::Working(order_ids)) => {
                    info!(%symbol, orders = ?order_ids, "[PENDING] Entry order still working");
                    self.set_state(symbol, SymbolState::Entering);
                    return SymbolOutcome::Pending { order_ids };
                }
                Ok(EntryProgress::Settled { failed }) => {
                    if open_legs.is_empty() && failed.len() == straddle.entry_orders.len() {
                        warn!(%symbol, orders = ?failed, "[ENTRY] Entry never filled, dropping record");
                        self.registry.remove(symbol);
                        self.set_state(symbol, SymbolState::Idle);
                        return SymbolOutcome::Skipped(SkipReason::BrokerRejected(format!(
                            "entry order ended unfilled: {}",
                            failed.join(", ")
                        )));
                    }
                }
            }
        }

        if open_legs.is_empty() {
            info!(
                %symbol,
                call = %straddle.call.symbol,
                put = %straddle.put.symbol,
                "[EXIT] Straddle no longer held at broker, dropping record"
            );
            self.registry.remove(symbol);
            self.set_state(symbol, SymbolState::Idle);
            return SymbolOutcome::Exited(ExitReason::ClosedExternally);
        }

        if !straddle.confirmed {
            straddle.confirmed = true;
            self.registry.insert(symbol.to_string(), straddle.clone());
            self.set_state(symbol, SymbolState::Open);
        }

        // Unmarked legs leave the value unknown rather than zero
        let value: Option<Decimal> = open_legs.iter().map(|p| p.market_value).sum();
        let current_iv = self.observe_iv(symbol).await;

        if straddle.entry_iv.is_none() {
            if let Some(iv) = current_iv {
                info!(%symbol, entry_iv = %format!("{:.4}", iv), "Entry IV baselined from current IV");
                straddle.entry_iv = Some(iv);
                self.registry.insert(symbol.to_string(), straddle.clone());
            }
        }

        let reason = straddle
            .pending_exit
            .or_else(|| match (current_iv, straddle.entry_iv) {
                (Some(current), Some(entry)) => {
                    iv_exit(current, entry, self.config.exit_iv_fraction)
                }
                _ => None,
            })
            .or_else(|| {
                value.and_then(|value| {
                    value_exit(
                        value,
                        straddle.entry_cost,
                        self.config.profit_target,
                        self.config.stop_loss,
                    )
                })
            });

        match (reason, value) {
            (Some(reason), _) => self.exit_position(symbol, straddle, reason, positions).await,
            (None, None) => {
                let unmarked: Vec<&str> = open_legs
                    .iter()
                    .filter(|p| p.market_value.is_none())
                    .map(|p| p.symbol.as_str())
                    .collect();
                warn!(%symbol, legs = ?unmarked, "No market value for open legs");
                SymbolOutcome::Skipped(SkipReason::DataUnavailable(format!(
                    "no market value for {}",
                    unmarked.join(", ")
                )))
            }
            (None, Some(value)) => {
                debug!(
                    %symbol,
                    %value,
                    entry_cost = %straddle.entry_cost,
                    current_iv = ?current_iv,
                    entry_iv = ?straddle.entry_iv,
                    "Holding straddle"
                );
                SymbolOutcome::Held { value, current_iv }
            }
        }
    }

    /// Status of the entry orders of a straddle whose legs are not all held yet.
    async fn entry_progress(
        &self,
        symbol: &str,
        order_ids: &[String],
    ) -> Result<EntryProgress, SkipReason> {
        let mut working = Vec::new();
        let mut failed = Vec::new();

        for id in order_ids {
            let result = with_timeout(
                self.call_timeout,
                "order_status",
                self.broker.order_status(id),
            )
            .await
            .map_err(|e| {
                warn!(%symbol, order_id = %id, error = %e, "Cannot read entry order status");
                SkipReason::from_data_error(&e)
            })?;

            if result.status.is_working() {
                working.push(result.id);
            } else if result.status.is_terminal_failure() {
                failed.push(format!("{} {:?}", result.id, result.status));
            }
        }

        if working.is_empty() {
            Ok(EntryProgress::Settled { failed })
        } else {
            Ok(EntryProgress::Working(working))
        }
    }

    /// Current ATM implied volatility; failures are logged and yield `None`.
    async fn observe_iv(&self, symbol: &str) -> Option<f64> {
        let limit = self.call_timeout;

        let price = match with_timeout(limit, "latest_price", self.broker.latest_price(symbol)).await {
            Ok(price) => price,
            Err(e) => {
                warn!(%symbol, error = %e, "Cannot observe IV, price unavailable");
                return None;
            }
        };

        match with_timeout(
            limit,
            "option_chain",
            self.broker.option_chain(symbol, self.expiry_range()),
        )
        .await
        {
            Ok(chain) => implied_volatility_from_chain(&chain, price),
            Err(e) => {
                warn!(%symbol, error = %e, "Cannot observe IV, chain unavailable");
                None
            }
        }
    }

    async fn exit_position(
        &mut self,
        symbol: &str,
        mut straddle: StraddlePosition,
        reason: ExitReason,
        positions: &[BrokerPosition],
    ) -> SymbolOutcome {
        if !self.hours.is_open_at(self.now()) {
            info!(%symbol, %reason, "[DEFER] Exit signal outside market hours");
            return SymbolOutcome::Skipped(SkipReason::MarketClosed);
        }

        self.set_state(symbol, SymbolState::Exiting);
        straddle.pending_exit = Some(reason);
        info!(%symbol, %reason, "[EXIT] Closing straddle");

        let legs: Vec<String> = straddle.leg_symbols().iter().map(|s| s.to_string()).collect();
        let mut failure = None;

        for leg in legs {
            if straddle.closed_legs.contains(&leg) {
                continue;
            }

            if !positions.iter().any(|p| p.symbol == leg) {
                debug!(%symbol, %leg, "Leg already gone at broker");
                straddle.closed_legs.insert(leg);
                continue;
            }

            match with_timeout(
                self.call_timeout,
                "close_position",
                self.broker.close_position(&leg),
            )
            .await
            {
                Ok(result) if result.status.is_terminal_failure() => {
                    error!(%symbol, %leg, order_id = %result.id, status = ?result.status, "Close order failed");
                    failure = Some(SkipReason::BrokerRejected(format!(
                        "close of {leg} ended {:?}",
                        result.status
                    )));
                }
                Ok(result) => {
                    info!(%symbol, %leg, order_id = %result.id, "Leg closed");
                    straddle.closed_legs.insert(leg);
                }
                Err(BrokerError::PositionNotFound(_)) => {
                    debug!(%symbol, %leg, "Leg not found at broker, treating as closed");
                    straddle.closed_legs.insert(leg);
                }
                Err(e) => {
                    error!(%symbol, %leg, error = %e, "Failed to close leg");
                    failure = Some(SkipReason::from_order_error(&e));
                }
            }
        }

        if straddle.is_fully_closed() {
            info!(
                %symbol,
                %reason,
                entry_cost = %straddle.entry_cost,
                quantity = straddle.quantity,
                "[EXIT] Straddle closed"
            );
            self.registry.remove(symbol);
            self.set_state(symbol, SymbolState::Idle);
            SymbolOutcome::Exited(reason)
        } else {
            warn!(
                %symbol,
                closed = ?straddle.closed_legs,
                "Exit incomplete, retrying next cycle"
            );
            self.registry.insert(symbol.to_string(), straddle);
            self.set_state(symbol, SymbolState::Open);
            SymbolOutcome::Skipped(failure.unwrap_or_else(|| {
                SkipReason::BrokerRejected("exit incomplete".to_string())
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DailyBar, MockBroker, OccSymbol, OrderService};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal_macros::dec;

    const CALL: &str = "SPY250131C00450000";
    const PUT: &str = "SPY250131P00450000";

    // =========================================================================
    // Test Helpers
    // =========================================================================

    /// Wednesday 2025-01-15, 10:00 US Eastern.
    fn session_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 15, 0, 0).unwrap()
    }

    /// Saturday 2025-01-18, 12:00 US Eastern.
    fn weekend_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 18, 17, 0, 0).unwrap()
    }

    fn symbols() -> Vec<String> {
        vec!["SPY".to_string()]
    }

    fn contract(strike: Decimal, kind: OptionKind, price: Decimal, iv: f64) -> OptionContract {
        let symbol = OccSymbol {
            root: "SPY".to_string(),
            expiration: NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            kind,
            strike,
        }
        .to_symbol();
        OptionContract::from_occ(&symbol)
            .unwrap()
            .with_close_price(price)
            .with_implied_volatility(iv)
    }

    /// ATM straddle at 450 costs (3.10 + 2.90) * 100 = 600.
    fn chain(atm_iv: f64) -> Vec<OptionContract> {
        vec![
            contract(dec!(445), OptionKind::Call, dec!(5.50), atm_iv),
            contract(dec!(450), OptionKind::Call, dec!(3.10), atm_iv),
            contract(dec!(455), OptionKind::Call, dec!(1.10), atm_iv),
            contract(dec!(445), OptionKind::Put, dec!(1.20), atm_iv),
            contract(dec!(450), OptionKind::Put, dec!(2.90), atm_iv),
            contract(dec!(455), OptionKind::Put, dec!(5.40), atm_iv),
        ]
    }

    /// Closes alternating 100/101 give roughly 16% annualized volatility.
    fn bars() -> Vec<DailyBar> {
        let start = NaiveDate::from_ymd_opt(2024, 12, 6).unwrap();
        (0..40)
            .map(|i| DailyBar {
                date: start + ChronoDuration::days(i),
                close: if i % 2 == 0 { dec!(100) } else { dec!(101) },
            })
            .collect()
    }

    async fn setup_broker(balance: Decimal, atm_iv: f64) -> Arc<MockBroker> {
        let broker = Arc::new(MockBroker::new(balance));
        broker.set_price("SPY", dec!(450.50)).await;
        broker.set_bars("SPY", bars()).await;
        broker.set_option_chain("SPY", chain(atm_iv)).await;
        broker
    }

    fn engine(broker: &Arc<MockBroker>, config: StrategyConfig) -> StraddleEngine<MockBroker> {
        StraddleEngine::new(Arc::clone(broker), config).with_clock(session_clock)
    }

    fn strategy() -> StrategyConfig {
        StrategyConfig {
            symbols: symbols(),
            ..StrategyConfig::default()
        }
    }

    async fn cycle(engine: &mut StraddleEngine<MockBroker>) -> SymbolOutcome {
        let (_tx, rx) = watch::channel(false);
        let report = engine.run_cycle(&symbols(), &rx).await;
        report.outcome("SPY").cloned().unwrap()
    }

    async fn entered() -> (Arc<MockBroker>, StraddleEngine<MockBroker>) {
        let broker = setup_broker(dec!(1000), 0.30).await;
        let mut engine = engine(&broker, strategy());
        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Entered { .. }), "{outcome:?}");
        (broker, engine)
    }

    // =========================================================================
    // Entry Tests
    // =========================================================================

    #[tokio::test]
    async fn test_entry_opens_straddle() {
        let (broker, engine) = entered().await;

        let straddle = engine.position("SPY").unwrap();
        assert_eq!(straddle.call.symbol, CALL);
        assert_eq!(straddle.put.symbol, PUT);
        assert_eq!(straddle.call.expiration, straddle.put.expiration);
        assert_eq!(straddle.quantity, 1);
        assert_eq!(straddle.entry_cost, dec!(600));
        assert!((straddle.entry_iv.unwrap() - 0.30).abs() < 1e-12);
        assert_eq!(engine.state("SPY"), SymbolState::Open);

        let orders = broker.submitted_orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].kind, OrderKind::MultiLeg);
        assert_eq!(orders[0].legs.len(), 2);
        assert_eq!(broker.get_state().await.cash, dec!(400));
    }

    #[tokio::test]
    async fn test_no_second_entry_while_open() {
        let (broker, mut engine) = entered().await;

        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Held { .. }), "{outcome:?}");
        assert_eq!(broker.submitted_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unmanaged_position_blocks_entry() {
        let broker = setup_broker(dec!(100000), 0.30).await;
        broker.insert_position("SPY", dec!(10), dec!(4500)).await;
        let mut engine = engine(&broker, strategy());

        let outcome = cycle(&mut engine).await;
        assert_eq!(outcome, SymbolOutcome::Skipped(SkipReason::ExternallyHeld));
        assert!(broker.submitted_orders().await.is_empty());
        assert_eq!(engine.state("SPY"), SymbolState::Idle);
    }

    #[tokio::test]
    async fn test_cheap_iv_gives_no_signal() {
        let broker = setup_broker(dec!(1000), 0.15).await;
        let mut engine = engine(&broker, strategy());

        let outcome = cycle(&mut engine).await;
        match outcome {
            SymbolOutcome::NoSignal { hv, iv } => {
                assert!(hv > 0.15 && hv < 0.17, "hv={hv}");
                assert!((iv - 0.15).abs() < 1e-12);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(broker.submitted_orders().await.is_empty());
        assert!(engine.position("SPY").is_none());
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let broker = setup_broker(dec!(500), 0.30).await;
        let mut engine = engine(&broker, strategy());

        let outcome = cycle(&mut engine).await;
        assert_eq!(outcome, SymbolOutcome::Skipped(SkipReason::InsufficientFunds));
    }

    #[tokio::test]
    async fn test_capital_fraction_limits_sizing() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        let config = StrategyConfig {
            capital_fraction: dec!(0.5),
            ..strategy()
        };
        let mut engine = engine(&broker, config);

        let outcome = cycle(&mut engine).await;
        assert_eq!(outcome, SymbolOutcome::Skipped(SkipReason::InsufficientFunds));
    }

    #[tokio::test]
    async fn test_rejected_order_stays_idle() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        broker.set_reject_orders(true).await;
        let mut engine = engine(&broker, strategy());

        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Skipped(SkipReason::BrokerRejected(_))));
        assert!(engine.position("SPY").is_none());
        assert_eq!(engine.state("SPY"), SymbolState::Idle);
    }

    #[tokio::test]
    async fn test_market_closed_skips_entry() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        let mut engine = engine(&broker, strategy()).with_clock(weekend_clock);

        let outcome = cycle(&mut engine).await;
        assert_eq!(outcome, SymbolOutcome::Skipped(SkipReason::MarketClosed));
        assert!(broker.submitted_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_data_outage_skips_symbol() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        broker.set_data_unavailable("SPY", true).await;
        let mut engine = engine(&broker, strategy());

        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Skipped(SkipReason::DataUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_history_skips_symbol() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        broker.set_bars("SPY", bars()[..10].to_vec()).await;
        let mut engine = engine(&broker, strategy());

        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Skipped(SkipReason::DataUnavailable(_))));
        assert!(broker.submitted_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_slow_broker_times_out_softly() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        broker.set_latency(Some(Duration::from_millis(200))).await;
        let mut engine =
            engine(&broker, strategy()).with_call_timeout(Duration::from_millis(20));

        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Skipped(SkipReason::DataUnavailable(_))));
        assert!(broker.submitted_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_single_leg_entry() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        let config = StrategyConfig {
            order_kind: OrderKind::Single,
            ..strategy()
        };
        let mut engine = engine(&broker, config);

        match cycle(&mut engine).await {
            SymbolOutcome::Entered { order_ids, .. } => assert_eq!(order_ids.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(broker.list_positions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_working_entry_order_blocks_second_entry() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        broker.set_hold_orders(true).await;
        let mut engine = engine(&broker, strategy());

        assert!(matches!(cycle(&mut engine).await, SymbolOutcome::Entered { .. }));

        let outcome = cycle(&mut engine).await;
        assert_eq!(
            outcome,
            SymbolOutcome::Pending {
                order_ids: vec!["mock-1".to_string()]
            }
        );
        assert_eq!(engine.state("SPY"), SymbolState::Entering);
        assert!(engine.position("SPY").is_some());
        assert_eq!(broker.submitted_orders().await.len(), 1);

        broker.fill_held_orders().await;
        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Held { .. }), "{outcome:?}");
        assert_eq!(engine.state("SPY"), SymbolState::Open);
        assert!(engine.position("SPY").unwrap().confirmed);
        assert_eq!(broker.submitted_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_canceled_entry_order_drops_record() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        broker.set_hold_orders(true).await;
        let mut engine = engine(&broker, strategy());

        assert!(matches!(cycle(&mut engine).await, SymbolOutcome::Entered { .. }));
        broker.cancel_held_orders().await;

        let outcome = cycle(&mut engine).await;
        assert!(
            matches!(outcome, SymbolOutcome::Skipped(SkipReason::BrokerRejected(_))),
            "{outcome:?}"
        );
        assert!(engine.position("SPY").is_none());
        assert_eq!(engine.state("SPY"), SymbolState::Idle);

        // The symbol is free to enter again
        broker.set_hold_orders(false).await;
        assert!(matches!(cycle(&mut engine).await, SymbolOutcome::Entered { .. }));
    }

    #[tokio::test]
    async fn test_single_leg_failure_unwinds_call() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        broker.set_reject_orders_for(PUT, true).await;
        let config = StrategyConfig {
            order_kind: OrderKind::Single,
            ..strategy()
        };
        let mut engine = engine(&broker, config);

        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Skipped(SkipReason::BrokerRejected(_))));

        let state = broker.get_state().await;
        assert_eq!(state.orders.len(), 1);
        assert_eq!(state.closed, vec![CALL.to_string()]);
        assert!(state.positions.is_empty());
        assert!(engine.position("SPY").is_none());
    }

    // =========================================================================
    // Exit Tests
    // =========================================================================

    #[tokio::test]
    async fn test_holds_within_thresholds() {
        let (_broker, mut engine) = entered().await;

        match cycle(&mut engine).await {
            SymbolOutcome::Held { value, current_iv } => {
                assert_eq!(value, dec!(600));
                assert!((current_iv.unwrap() - 0.30).abs() < 1e-12);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_profit_target_exit() {
        let (broker, mut engine) = entered().await;
        broker.set_mark(CALL, dec!(7.00)).await;

        let outcome = cycle(&mut engine).await;
        assert_eq!(
            outcome,
            SymbolOutcome::Exited(ExitReason::ProfitTarget { value: dec!(990) })
        );
        assert!(engine.position("SPY").is_none());
        assert_eq!(engine.state("SPY"), SymbolState::Idle);
        assert_eq!(broker.get_state().await.closed.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_loss_exit() {
        let (broker, mut engine) = entered().await;
        broker.set_mark(CALL, dec!(1.50)).await;
        broker.set_mark(PUT, dec!(1.40)).await;

        let outcome = cycle(&mut engine).await;
        assert_eq!(
            outcome,
            SymbolOutcome::Exited(ExitReason::StopLoss { value: dec!(290) })
        );
    }

    #[tokio::test]
    async fn test_iv_collapse_exit() {
        let (broker, mut engine) = entered().await;
        broker.set_option_chain("SPY", chain(0.20)).await;

        let outcome = cycle(&mut engine).await;
        assert!(
            matches!(outcome, SymbolOutcome::Exited(ExitReason::IvCollapse { .. })),
            "{outcome:?}"
        );
        assert!(broker.list_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_absent_leg_close_is_noop() {
        let (broker, mut engine) = entered().await;
        broker.remove_position(PUT).await;
        broker.set_mark(CALL, dec!(9.00)).await;

        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Exited(ExitReason::ProfitTarget { .. })));
        assert_eq!(broker.get_state().await.closed, vec![CALL.to_string()]);
        assert!(engine.position("SPY").is_none());
    }

    #[tokio::test]
    async fn test_vanished_straddle_is_dropped() {
        let (broker, mut engine) = entered().await;
        broker.remove_position(CALL).await;
        broker.remove_position(PUT).await;

        let outcome = cycle(&mut engine).await;
        assert_eq!(outcome, SymbolOutcome::Exited(ExitReason::ClosedExternally));
        assert!(engine.position("SPY").is_none());
    }

    #[tokio::test]
    async fn test_unmarked_leg_does_not_trigger_exit() {
        let (broker, mut engine) = entered().await;
        broker.set_unmarked(PUT, true).await;

        let outcome = cycle(&mut engine).await;
        assert!(
            matches!(outcome, SymbolOutcome::Skipped(SkipReason::DataUnavailable(ref m)) if m.contains(PUT)),
            "{outcome:?}"
        );
        assert!(engine.position("SPY").is_some());
        assert!(broker.get_state().await.closed.is_empty());

        // The IV rule does not depend on marks
        broker.set_option_chain("SPY", chain(0.20)).await;
        let outcome = cycle(&mut engine).await;
        assert!(
            matches!(outcome, SymbolOutcome::Exited(ExitReason::IvCollapse { .. })),
            "{outcome:?}"
        );
    }

    #[tokio::test]
    async fn test_failed_close_keeps_position_open() {
        let (broker, mut engine) = entered().await;
        broker.set_reject_close(CALL, true).await;
        broker.set_mark(CALL, dec!(7.00)).await;

        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Skipped(SkipReason::BrokerRejected(_))));
        assert_eq!(engine.state("SPY"), SymbolState::Open);
        let straddle = engine.position("SPY").unwrap();
        assert!(straddle.closed_legs.contains(PUT));
        assert!(straddle.pending_exit.is_some());

        // The exit resumes even though the mark has fallen back
        broker.set_reject_close(CALL, false).await;
        broker.set_mark(CALL, dec!(3.10)).await;
        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Exited(ExitReason::ProfitTarget { .. })));
        assert!(engine.position("SPY").is_none());
    }

    #[tokio::test]
    async fn test_exit_deferred_while_market_closed() {
        let (broker, mut engine) = entered().await;
        broker.set_mark(CALL, dec!(7.00)).await;
        engine.clock = weekend_clock;

        let outcome = cycle(&mut engine).await;
        assert_eq!(outcome, SymbolOutcome::Skipped(SkipReason::MarketClosed));
        assert!(engine.position("SPY").is_some());
        assert!(broker.get_state().await.closed.is_empty());
    }

    // =========================================================================
    // Reconciliation Tests
    // =========================================================================

    #[tokio::test]
    async fn test_adopts_straddle_after_restart() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        broker.insert_position(CALL, dec!(1), dec!(310)).await;
        broker.insert_position(PUT, dec!(1), dec!(290)).await;
        let mut engine = engine(&broker, strategy());

        let outcome = cycle(&mut engine).await;
        assert!(matches!(outcome, SymbolOutcome::Held { .. }), "{outcome:?}");

        let straddle = engine.position("SPY").unwrap();
        assert_eq!(straddle.entry_cost, dec!(600));
        assert_eq!(straddle.quantity, 1);
        assert!((straddle.entry_iv.unwrap() - 0.30).abs() < 1e-12);
        assert!(broker.submitted_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_lopsided_holdings_not_adopted() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        broker.insert_position(CALL, dec!(2), dec!(620)).await;
        broker.insert_position(PUT, dec!(1), dec!(290)).await;
        let mut engine = engine(&broker, strategy());

        let outcome = cycle(&mut engine).await;
        assert_eq!(outcome, SymbolOutcome::Skipped(SkipReason::ExternallyHeld));
        assert!(engine.position("SPY").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_between_symbols() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        let mut engine = engine(&broker, strategy());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = engine.run_cycle(&symbols(), &rx).await;
        assert!(report.interrupted);
        assert!(report.outcomes.is_empty());
        assert!(broker.submitted_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_volatility_estimate() {
        let broker = setup_broker(dec!(1000), 0.30).await;
        let engine = engine(&broker, strategy());

        let estimate = engine.volatility("SPY").await;
        let (hv, iv) = estimate.both().unwrap();
        assert!(hv > 0.15 && hv < 0.17);
        assert!((iv - 0.30).abs() < 1e-12);
    }
}
