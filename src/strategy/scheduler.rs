//! Fixed-interval polling loop over the symbol universe.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::engine::{CycleReport, StraddleEngine, SymbolOutcome};
use crate::broker::Broker;

/// Counters accumulated across cycles.
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    pub started_at: DateTime<Utc>,
    pub cycles: u64,
    pub entries: u64,
    pub exits: u64,
    pub skips: u64,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            cycles: 0,
            entries: 0,
            exits: 0,
            skips: 0,
        }
    }
}

impl SchedulerMetrics {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.entries += report.entries() as u64;
        self.exits += report.exits() as u64;
        self.skips += report.skips() as u64;
    }
}

/// Drives the engine every `interval` until shutdown.
pub struct Scheduler<B: Broker> {
    engine: StraddleEngine<B>,
    symbols: Vec<String>,
    interval: Duration,
    max_cycles: Option<u64>,
    metrics: SchedulerMetrics,
}

impl<B: Broker> Scheduler<B> {
    pub fn new(engine: StraddleEngine<B>, symbols: Vec<String>, interval: Duration) -> Self {
        Self {
            engine,
            symbols,
            interval,
            max_cycles: None,
            metrics: SchedulerMetrics::default(),
        }
    }

    /// Stop after `cycles` passes.
    pub fn with_max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    pub fn engine(&self) -> &StraddleEngine<B> {
        &self.engine
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Run until `shutdown` flips to true, its sender is dropped, or the
    /// cycle limit is reached.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerMetrics {
        info!(
            symbols = ?self.symbols,
            interval_secs = self.interval.as_secs(),
            "🚀 Starting straddle loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.engine.run_cycle(&self.symbols, &shutdown).await;
            self.metrics.record(&report);
            log_report(self.metrics.cycles, &report);

            if report.interrupted {
                break;
            }
            if self
                .max_cycles
                .is_some_and(|max| self.metrics.cycles >= max)
            {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed");
                    }
                    break;
                }
            }
        }

        let uptime = Utc::now() - self.metrics.started_at;
        info!(
            cycles = self.metrics.cycles,
            entries = self.metrics.entries,
            exits = self.metrics.exits,
            skips = self.metrics.skips,
            uptime_mins = uptime.num_minutes(),
            "🛑 Straddle loop stopped"
        );

        self.metrics.clone()
    }
}

fn log_report(cycle: u64, report: &CycleReport) {
    info!(
        cycle,
        entries = report.entries(),
        exits = report.exits(),
        skips = report.skips(),
        "📊 [CYCLE] Pass complete"
    );

    for (symbol, outcome) in &report.outcomes {
        match outcome {
            SymbolOutcome::Entered {
                quantity,
                entry_cost,
                ..
            } => info!("   {} ENTERED x{} for ${:.2}", symbol, quantity, entry_cost),
            SymbolOutcome::Exited(reason) => info!("   {} EXITED: {}", symbol, reason),
            SymbolOutcome::Held { value, current_iv } => info!(
                "   {} HELD value=${:.2} iv={}",
                symbol,
                value,
                current_iv.map_or("n/a".to_string(), |iv| format!("{:.4}", iv))
            ),
            SymbolOutcome::NoSignal { hv, iv } => {
                info!("   {} no signal (hv={:.4} iv={:.4})", symbol, hv, iv)
            }
            SymbolOutcome::Pending { order_ids } => {
                info!("   {} PENDING orders {}", symbol, order_ids.join(", "))
            }
            SymbolOutcome::Skipped(reason) => info!("   {} skipped: {}", symbol, reason),
        }
    }
}
