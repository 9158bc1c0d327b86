//! Tool layer: the [`Tool`] trait, the two-layer registry (static wins,
//! dynamic namespaces replaced wholesale), and the audit-logged executor
//! that gates risky calls behind user confirmations.

pub mod context;
pub mod executor;
pub mod registry;

pub use context::ToolContext;
pub use executor::ToolExecutor;
pub use registry::ToolRegistry;

use async_trait::async_trait;
use serde_json::Value;

use orchard_domain::tool::{RiskLevel, ToolGroup, ToolResult};
use orchard_domain::Result;

/// A tool the agent can invoke. Implementations are opaque to the kernel;
/// it only sees this surface.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> Value;

    fn group(&self) -> ToolGroup;

    /// Risk classification for this specific invocation. Evaluated with the
    /// caller's *current* policy mode on every call — a call re-examined
    /// later (e.g. during rejection processing) may classify differently.
    fn risk_level(&self, args: &Value, ctx: &ToolContext) -> RiskLevel;

    /// Cheap precondition check. An error here is persisted as a failed
    /// result without the tool ever executing or prompting for approval.
    fn can_execute(&self, _args: &Value, _ctx: &ToolContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolResult>;
}
