//! Operator alerting surface.
//!
//! Delivery transports (pager, chat, email) are out of scope; the core
//! ships a tracing-backed implementation and the trait seam for real ones.

use async_trait::async_trait;
use tracing::{error, warn};

/// How urgently an operator should look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Something failed and the pipeline is paused until an operator acts.
    Error,
    /// Degraded but self-recovering.
    Warning,
}

/// Alert sink fired on apply failures and protocol errors.
#[async_trait]
pub trait Alert: Send + Sync {
    /// Emit one alert. Implementations must not fail the caller; delivery
    /// problems are their own to log.
    async fn fire(&self, severity: Severity, summary: &str, detail: &str);
}

/// Alert sink that logs through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingAlert;

#[async_trait]
impl Alert for TracingAlert {
    async fn fire(&self, severity: Severity, summary: &str, detail: &str) {
        match severity {
            Severity::Error => error!(summary, detail, "alert"),
            Severity::Warning => warn!(summary, detail, "alert"),
        }
    }
}
