//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the matchforge match lifecycle
//! service using Prometheus metrics.

use crate::error::ErrorCategory;
use crate::matches::state::MatchStateKind;
use crate::types::GameMode;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the match lifecycle service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Queue metrics
    queue_metrics: QueueMetrics,

    /// Match lifecycle metrics
    match_metrics: MatchMetrics,

    /// Wager ledger metrics
    wager_metrics: WagerMetrics,

    /// Performance metrics
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Total AMQP messages processed
    pub amqp_messages_total: IntCounterVec,

    /// AMQP message processing errors
    pub amqp_errors_total: IntCounterVec,

    /// Operation failures by error category
    pub errors_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Queue metrics
#[derive(Clone)]
pub struct QueueMetrics {
    /// Players that joined a queue
    pub joins_total: IntCounterVec,

    /// Players that left a queue
    pub leaves_total: IntCounterVec,

    /// Players currently waiting
    pub players_waiting: IntGaugeVec,

    /// Time from joining to being matched
    pub wait_time_seconds: HistogramVec,
}

/// Match lifecycle metrics
#[derive(Clone)]
pub struct MatchMetrics {
    pub matches_created_total: IntCounterVec,

    /// Transitions by target state
    pub transitions_total: IntCounterVec,

    /// Current matches per state
    pub matches_by_state: IntGaugeVec,

    pub cancellations_total: IntCounterVec,

    /// Provisioning requests by outcome
    pub provisioning_total: IntCounterVec,

    /// Provider polls by status
    pub ingestion_polls_total: IntCounterVec,

    pub settlements_total: IntCounterVec,
}

/// Wager ledger metrics
#[derive(Clone)]
pub struct WagerMetrics {
    /// Ledger postings by transaction kind
    pub postings_total: IntCounterVec,

    /// Amount moved per transaction kind, in minor units
    pub posted_amount_total: IntCounterVec,

    pub wagers_settled_total: IntCounter,

    /// Platform fees collected, in minor units
    pub platform_fees_total: IntCounter,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Public operation durations
    pub operation_duration: HistogramVec,

    /// Rating calculation time
    pub rating_calculation_duration: Histogram,

    /// Game-server provider request durations
    pub provider_request_duration: HistogramVec,

    /// AMQP operation durations
    pub amqp_operation_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let queue_metrics = QueueMetrics::new(&registry)?;
        let match_metrics = MatchMetrics::new(&registry)?;
        let wager_metrics = WagerMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            queue_metrics,
            match_metrics,
            wager_metrics,
            performance_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    pub fn matches(&self) -> &MatchMetrics {
        &self.match_metrics
    }

    pub fn wager(&self) -> &WagerMetrics {
        &self.wager_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Record players entering a queue
    pub fn record_queue_join(&self, mode: GameMode, players: usize) {
        self.queue_metrics
            .joins_total
            .with_label_values(&[mode.as_str()])
            .inc_by(players as u64);
    }

    /// Record players leaving a queue
    pub fn record_queue_leave(&self, mode: GameMode, players: usize) {
        self.queue_metrics
            .leaves_total
            .with_label_values(&[mode.as_str()])
            .inc_by(players as u64);
    }

    pub fn update_queue_depth(&self, mode: GameMode, waiting: usize) {
        self.queue_metrics
            .players_waiting
            .with_label_values(&[mode.as_str()])
            .set(waiting as i64);
    }

    /// Record a match being created and how long its players waited
    pub fn record_match_created(&self, mode: GameMode, waits: &[Duration]) {
        self.match_metrics
            .matches_created_total
            .with_label_values(&[mode.as_str()])
            .inc();
        self.record_transition(MatchStateKind::Confirming);

        for wait in waits {
            self.queue_metrics
                .wait_time_seconds
                .with_label_values(&[mode.as_str()])
                .observe(wait.as_secs_f64());
        }
    }

    pub fn record_transition(&self, target: MatchStateKind) {
        self.match_metrics
            .transitions_total
            .with_label_values(&[target.as_str()])
            .inc();
    }

    pub fn record_cancellation(&self, reason: &str) {
        self.record_transition(MatchStateKind::Cancelled);
        self.match_metrics
            .cancellations_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Record a provisioning decision (`acquired`, `already_provisioning`,
    /// `ready`, `failed`, `released`)
    pub fn record_provisioning(&self, outcome: &str) {
        self.match_metrics
            .provisioning_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_ingestion_poll(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.match_metrics
            .ingestion_polls_total
            .with_label_values(&[status])
            .inc();
    }

    pub fn record_settlement(&self, mode: GameMode, duration: Duration) {
        self.record_transition(MatchStateKind::Finished);
        self.match_metrics
            .settlements_total
            .with_label_values(&[mode.as_str()])
            .inc();
        self.record_operation("settle", duration);
    }

    /// Set the per-state match gauge from a fresh count
    pub fn update_match_states(&self, counts: &HashMap<MatchStateKind, usize>) {
        for state in MatchStateKind::ALL {
            self.match_metrics
                .matches_by_state
                .with_label_values(&[state.as_str()])
                .set(counts.get(&state).copied().unwrap_or(0) as i64);
        }
    }

    /// Record one ledger posting
    pub fn record_ledger_posting(&self, kind: &str, amount: u64) {
        self.wager_metrics
            .postings_total
            .with_label_values(&[kind])
            .inc();
        self.wager_metrics
            .posted_amount_total
            .with_label_values(&[kind])
            .inc_by(amount);
    }

    pub fn record_wager_settled(&self, platform_fee: u64) {
        self.wager_metrics.wagers_settled_total.inc();
        self.wager_metrics.platform_fees_total.inc_by(platform_fee);
    }

    /// Record rating calculation duration
    pub fn record_rating_calculation(&self, duration: Duration) {
        self.performance_metrics
            .rating_calculation_duration
            .observe(duration.as_secs_f64());
    }

    /// Record duration of a public operation
    pub fn record_operation(&self, operation: &str, duration: Duration) {
        self.performance_metrics
            .operation_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    pub fn record_error(&self, category: ErrorCategory) {
        self.service_metrics
            .errors_total
            .with_label_values(&[category.as_str()])
            .inc();
    }

    pub fn record_provider_request(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };
        self.performance_metrics
            .provider_request_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    /// Record AMQP operation
    pub fn record_amqp_operation(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.service_metrics
            .amqp_messages_total
            .with_label_values(&[operation, status])
            .inc();

        if !success {
            self.service_metrics
                .amqp_errors_total
                .with_label_values(&[operation])
                .inc();
        }

        self.performance_metrics
            .amqp_operation_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds = IntGauge::new("matchforge_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let amqp_messages_total = IntCounterVec::new(
            Opts::new(
                "matchforge_amqp_messages_total",
                "Total AMQP messages processed",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_messages_total.clone()))?;

        let amqp_errors_total = IntCounterVec::new(
            Opts::new("matchforge_amqp_errors_total", "Total AMQP errors"),
            &["operation"],
        )?;
        registry.register(Box::new(amqp_errors_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("matchforge_errors_total", "Operation failures by category"),
            &["category"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let health_status = IntGauge::new(
            "matchforge_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("matchforge_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            amqp_messages_total,
            amqp_errors_total,
            errors_total,
            health_status,
            component_health,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let joins_total = IntCounterVec::new(
            Opts::new("matchforge_queue_joins_total", "Players that joined a queue"),
            &["mode"],
        )?;
        registry.register(Box::new(joins_total.clone()))?;

        let leaves_total = IntCounterVec::new(
            Opts::new("matchforge_queue_leaves_total", "Players that left a queue"),
            &["mode"],
        )?;
        registry.register(Box::new(leaves_total.clone()))?;

        let players_waiting = IntGaugeVec::new(
            Opts::new("matchforge_players_waiting", "Players currently queued"),
            &["mode"],
        )?;
        registry.register(Box::new(players_waiting.clone()))?;

        let wait_time_seconds = HistogramVec::new(
            HistogramOpts::new(
                "matchforge_queue_wait_time_seconds",
                "Time from joining the queue to being matched",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["mode"],
        )?;
        registry.register(Box::new(wait_time_seconds.clone()))?;

        Ok(Self {
            joins_total,
            leaves_total,
            players_waiting,
            wait_time_seconds,
        })
    }
}

impl MatchMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let matches_created_total = IntCounterVec::new(
            Opts::new("matchforge_matches_created_total", "Total matches created"),
            &["mode"],
        )?;
        registry.register(Box::new(matches_created_total.clone()))?;

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "matchforge_match_transitions_total",
                "Match state transitions by target state",
            ),
            &["state"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let matches_by_state = IntGaugeVec::new(
            Opts::new("matchforge_matches", "Current matches per state"),
            &["state"],
        )?;
        registry.register(Box::new(matches_by_state.clone()))?;

        let cancellations_total = IntCounterVec::new(
            Opts::new("matchforge_match_cancellations_total", "Cancelled matches"),
            &["reason"],
        )?;
        registry.register(Box::new(cancellations_total.clone()))?;

        let provisioning_total = IntCounterVec::new(
            Opts::new(
                "matchforge_provisioning_total",
                "Provisioning requests by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(provisioning_total.clone()))?;

        let ingestion_polls_total = IntCounterVec::new(
            Opts::new("matchforge_ingestion_polls_total", "Provider match polls"),
            &["status"],
        )?;
        registry.register(Box::new(ingestion_polls_total.clone()))?;

        let settlements_total = IntCounterVec::new(
            Opts::new("matchforge_settlements_total", "Settled matches"),
            &["mode"],
        )?;
        registry.register(Box::new(settlements_total.clone()))?;

        Ok(Self {
            matches_created_total,
            transitions_total,
            matches_by_state,
            cancellations_total,
            provisioning_total,
            ingestion_polls_total,
            settlements_total,
        })
    }
}

impl WagerMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let postings_total = IntCounterVec::new(
            Opts::new("matchforge_ledger_postings_total", "Ledger postings"),
            &["kind"],
        )?;
        registry.register(Box::new(postings_total.clone()))?;

        let posted_amount_total = IntCounterVec::new(
            Opts::new(
                "matchforge_ledger_posted_amount_total",
                "Amount posted to the ledger in minor units",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(posted_amount_total.clone()))?;

        let wagers_settled_total =
            IntCounter::new("matchforge_wagers_settled_total", "Wagers paid out")?;
        registry.register(Box::new(wagers_settled_total.clone()))?;

        let platform_fees_total = IntCounter::new(
            "matchforge_platform_fees_total",
            "Platform fees collected in minor units",
        )?;
        registry.register(Box::new(platform_fees_total.clone()))?;

        Ok(Self {
            postings_total,
            posted_amount_total,
            wagers_settled_total,
            platform_fees_total,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "matchforge_operation_duration_seconds",
                "Public operation duration",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let rating_calculation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "matchforge_rating_calculation_duration_seconds",
                "Rating calculation time",
            )
            .buckets(vec![0.00001, 0.0001, 0.001, 0.005, 0.01]),
        )?;
        registry.register(Box::new(rating_calculation_duration.clone()))?;

        let provider_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "matchforge_provider_request_duration_seconds",
                "Game-server provider request duration",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(provider_request_duration.clone()))?;

        let amqp_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "matchforge_amqp_operation_duration_seconds",
                "AMQP operation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_operation_duration.clone()))?;

        Ok(Self {
            operation_duration,
            rating_calculation_duration,
            provider_request_duration,
            amqp_operation_duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        let _service = collector.service();
        let _queue = collector.queue();
        let _matches = collector.matches();
        let _wager = collector.wager();
        let _performance = collector.performance();
    }

    #[test]
    fn test_lifecycle_recording() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        collector.record_queue_join(GameMode::FiveVsFive, 3);
        collector.record_match_created(GameMode::OneVsOne, &[Duration::from_secs(12)]);
        collector.record_transition(MatchStateKind::Veto);
        collector.record_cancellation("declined");
        collector.record_provisioning("already_provisioning");

        assert_eq!(
            collector
                .queue()
                .joins_total
                .with_label_values(&["5v5"])
                .get(),
            3
        );
        assert_eq!(
            collector
                .matches()
                .transitions_total
                .with_label_values(&["CANCELLED"])
                .get(),
            1
        );
    }

    #[test]
    fn test_match_state_gauge() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");
        let mut counts = HashMap::new();
        counts.insert(MatchStateKind::Live, 4);
        collector.update_match_states(&counts);

        let gauge = &collector.matches().matches_by_state;
        assert_eq!(gauge.with_label_values(&["LIVE"]).get(), 4);
        assert_eq!(gauge.with_label_values(&["VETO"]).get(), 0);
    }

    #[test]
    fn test_ledger_recording() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");
        collector.record_ledger_posting("win", 900);
        collector.record_wager_settled(100);
        assert_eq!(collector.wager().platform_fees_total.get(), 100);
        assert_eq!(
            collector
                .wager()
                .posted_amount_total
                .with_label_values(&["win"])
                .get(),
            900
        );
    }

    #[test]
    fn test_metrics_timer() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");
        let timer = collector.start_timer();

        std::thread::sleep(Duration::from_millis(10));
        let duration = timer.elapsed();

        assert!(duration >= Duration::from_millis(10));

        let final_duration = timer.stop();
        assert!(final_duration >= Duration::from_millis(10));
    }
}
