//! Prometheus metrics exporter.
//!
//! Metric statics register themselves into the shared registry on first
//! touch; the HTTP server in [`server`] exposes them together with the
//! health endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

mod server;

pub use server::start_metrics_server;

pub(crate) static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static COMMANDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "aproxy_commands_total",
            "MySQL commands handled, by command kind.",
        ),
        &["command"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static COMMAND_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "aproxy_command_duration_seconds",
            "Time from command read to response flush, by command kind.",
        ),
        &["command"],
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static REWRITES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "aproxy_rewrites_total",
            "SQL rewrites applied, by transform rule.",
        ),
        &["rule"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static REWRITE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "aproxy_rewrite_errors_total",
            "Statements the rewriter refused, by error kind.",
        ),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static REWRITE_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(HistogramOpts::new(
        "aproxy_rewrite_duration_seconds",
        "Time spent parsing and rewriting a statement.",
    ))
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static POOL_LEASES: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "aproxy_pool_leases_total",
            "Backend connections leased from the pool, by acquire reason.",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static POOL_RELEASES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "aproxy_pool_releases_total",
        "Backend connections returned to the idle stack.",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static POOL_DISCARDS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "aproxy_pool_discards_total",
        "Backend connections discarded instead of pooled (broken or closed).",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static POOL_WAITS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "aproxy_pool_waits_total",
        "Lease attempts, including those that waited on a saturated pool.",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static POOL_EXHAUSTED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "aproxy_pool_exhausted_total",
        "Lease attempts that timed out waiting for a connection.",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static BACKEND_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "aproxy_backend_errors_total",
        "Errors returned by the PostgreSQL backend.",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static GAUGES: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "aproxy_state",
            "Point-in-time counts: open sessions, live and idle backend connections.",
        ),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Refresh gauge values before the registry is scraped.
pub fn update_metrics() {
    GAUGES
        .with_label_values(&["sessions"])
        .set(crate::session::SESSIONS.count() as i64);
    let (live, idle) = crate::pool::get_pool().status();
    GAUGES.with_label_values(&["backend_live"]).set(live as i64);
    GAUGES.with_label_values(&["backend_idle"]).set(idle as i64);
}
