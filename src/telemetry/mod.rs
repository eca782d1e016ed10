mod metrics;
mod tracing;

pub use self::metrics::{
    counters, AdminSnapshot, AdminState, DependencyStatus, MessageStats, Metrics, WebhookStats,
};
pub use self::tracing::{init_tracing, shutdown_tracing, TracingConfig};
