//! Control-plane connection metrics
//!
//! One [`ControlPlaneStats`] is registered per stream manager under its own
//! scope (for example `ads` or `cds`), so managers sharing a registry never
//! write each other's series.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::*;

lazy_static! {
    /// Process-wide registry for callers that do not bring their own
    pub static ref CONTROL_PLANE_REGISTRY: Registry = Registry::new();
}

/// Gauge that stays silent until it first holds a meaningful value
///
/// `set(0)` on a gauge that has never been written is skipped; after the
/// first non-zero write every value, zero included, is recorded. The gauge
/// only joins its registry on that first write, so scrapes never carry a
/// series for a queue that was never used.
pub struct StickyGauge {
    gauge: IntGauge,
    registry: Option<Registry>,
    used: AtomicBool,
}

impl StickyGauge {
    /// Gauge that is never exported
    pub fn new(gauge: IntGauge) -> Self {
        Self {
            gauge,
            registry: None,
            used: AtomicBool::new(false),
        }
    }

    /// Gauge registered in `registry` on its first meaningful write
    pub fn deferred(gauge: IntGauge, registry: &Registry) -> Self {
        Self {
            gauge,
            registry: Some(registry.clone()),
            used: AtomicBool::new(false),
        }
    }

    /// Record `value` if it is non-zero or the gauge is already in use.
    /// Returns whether a write happened.
    pub fn set_if_meaningful(&self, value: i64) -> bool {
        if value == 0 && !self.used() {
            return false;
        }
        if !self.used.swap(true, Ordering::AcqRel) {
            self.register();
        }
        self.gauge.set(value);
        true
    }

    pub fn used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn get(&self) -> i64 {
        self.gauge.get()
    }

    fn register(&self) {
        let Some(registry) = self.registry.as_ref() else {
            return;
        };
        if let Err(e) = registry.register(Box::new(self.gauge.clone())) {
            warn!("Failed to register pending requests gauge: {}", e);
        }
    }
}

impl fmt::Debug for StickyGauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StickyGauge")
            .field("value", &self.get())
            .field("used", &self.used())
            .finish()
    }
}

/// Connection-state metrics for one control-plane stream
#[derive(Debug)]
pub struct ControlPlaneStats {
    /// 1 while a stream to the management server is up, else 0
    pub connected_state: IntGauge,
    /// Discovery requests waiting to be sent
    pub pending_requests: StickyGauge,
    /// Sends deferred by the rate limiter
    pub rate_limit_enforced: IntCounter,
}

impl ControlPlaneStats {
    /// Register the stats for `scope` in the process-wide registry
    pub fn new(scope: &str) -> Result<Self, prometheus::Error> {
        Self::register(&CONTROL_PLANE_REGISTRY, scope)
    }

    /// Register the stats for `scope` in `registry`
    ///
    /// Series are named `<scope>_control_plane_<stat>`. `pending_requests`
    /// appears once it is first set to something meaningful.
    pub fn register(registry: &Registry, scope: &str) -> Result<Self, prometheus::Error> {
        let connected_state = IntGauge::with_opts(
            Opts::new(
                "connected_state",
                "Whether the control-plane stream is connected (0=disconnected, 1=connected)",
            )
            .namespace(scope)
            .subsystem("control_plane"),
        )?;
        let pending_requests = IntGauge::with_opts(
            Opts::new(
                "pending_requests",
                "Discovery requests queued behind the rate limiter",
            )
            .namespace(scope)
            .subsystem("control_plane"),
        )?;
        let rate_limit_enforced = IntCounter::with_opts(
            Opts::new(
                "rate_limit_enforced",
                "Times a discovery request was deferred by rate limiting",
            )
            .namespace(scope)
            .subsystem("control_plane"),
        )?;

        registry.register(Box::new(connected_state.clone()))?;
        registry.register(Box::new(rate_limit_enforced.clone()))?;

        Ok(Self {
            connected_state,
            pending_requests: StickyGauge::deferred(pending_requests, registry),
            rate_limit_enforced,
        })
    }
}
