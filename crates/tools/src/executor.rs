//! Tool executor — the only path through which tools run. Every invocation
//! leaves a `ToolCallRequested` / `ToolCallCompleted` pair in the audit log,
//! and risky calls without a bound approval never reach the tool.

use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use orchard_domain::audit::{AuditEntry, AuditKind, AuditPayload};
use orchard_domain::message::ToolCallRequest;
use orchard_domain::tool::{RiskLevel, ToolResult};
use orchard_domain::Result;
use orchard_store::AuditLog;

use crate::{Tool, ToolContext, ToolRegistry};

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    audit: Arc<AuditLog>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, audit: Arc<AuditLog>) -> Self {
        Self { registry, audit }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Resolve the risk level of a call under the context's current policy.
    /// Unknown tools classify as safe: they cannot execute anything, only
    /// produce an error result.
    pub fn risk_of(&self, call: &ToolCallRequest, ctx: &ToolContext) -> RiskLevel {
        match self.registry.get(&call.tool_name) {
            Some(tool) => tool.risk_level(&call.arguments, ctx),
            None => RiskLevel::Safe,
        }
    }

    /// Execute one call. Never panics or surfaces tool errors as `Err`:
    /// anything the tool does wrong becomes an error [`ToolResult`] inside
    /// the conversation. `Err` is reserved for audit-log write failures.
    pub async fn execute(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolResult> {
        let Some(tool) = self.registry.get(&call.tool_name) else {
            return Ok(ToolResult::error(format!(
                "unknown tool: {}",
                call.tool_name
            )));
        };

        self.append_requested(call, ctx)?;

        if tool.risk_level(&call.arguments, ctx) == RiskLevel::Risky && !ctx.confirms(&call.tool_call_id)
        {
            let result = ToolResult::error("risky tool requires confirmation");
            self.append_completed(call, ctx, &result, 0)?;
            return Ok(result);
        }

        let started = Instant::now();
        let span = tracing::info_span!("tool.call", tool_name = %call.tool_name, task_id = %ctx.task_id);
        let result = match self
            .invoke(tool.as_ref(), call, ctx)
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(e) => ToolResult::error(e.to_string()),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.append_completed(call, ctx, &result, duration_ms)?;
        Ok(result)
    }

    async fn invoke(
        &self,
        tool: &dyn Tool,
        call: &ToolCallRequest,
        ctx: &ToolContext,
    ) -> Result<ToolResult> {
        tool.execute(&call.arguments, ctx).await
    }

    /// Record a user rejection: both audit rows are written, the tool is
    /// never invoked, and the synthetic result closes the call in the
    /// conversation ledger.
    pub fn record_rejection(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolResult> {
        self.append_requested(call, ctx)?;
        let result = ToolResult::error("User rejected the request");
        self.append_completed(call, ctx, &result, 0)?;
        Ok(result)
    }

    fn append_requested(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<()> {
        self.audit.append(vec![AuditEntry::draft(
            AuditKind::ToolCallRequested,
            AuditPayload {
                task_id: ctx.task_id.clone(),
                tool_call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                input: Some(call.arguments.clone()),
                output: None,
                is_error: None,
                duration_ms: None,
                author_actor_id: ctx.author_actor_id.clone(),
                timestamp: chrono::Utc::now(),
            },
        )])?;
        Ok(())
    }

    fn append_completed(
        &self,
        call: &ToolCallRequest,
        ctx: &ToolContext,
        result: &ToolResult,
        duration_ms: u64,
    ) -> Result<()> {
        self.audit.append(vec![AuditEntry::draft(
            AuditKind::ToolCallCompleted,
            AuditPayload {
                task_id: ctx.task_id.clone(),
                tool_call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                input: None,
                output: Some(result.message_content()),
                is_error: Some(result.is_error),
                duration_ms: Some(duration_ms),
                author_actor_id: ctx.author_actor_id.clone(),
                timestamp: chrono::Utc::now(),
            },
        )])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orchard_domain::tool::ToolGroup;
    use serde_json::Value;

    struct Fixed {
        name: &'static str,
        risk: RiskLevel,
        fail: bool,
    }

    #[async_trait]
    impl Tool for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        fn group(&self) -> ToolGroup {
            ToolGroup::Other
        }
        fn risk_level(&self, _args: &Value, _ctx: &ToolContext) -> RiskLevel {
            self.risk
        }
        async fn execute(&self, args: &Value, _ctx: &ToolContext) -> orchard_domain::Result<ToolResult> {
            if self.fail {
                return Err(orchard_domain::Error::Other("tool blew up".into()));
            }
            Ok(ToolResult::ok(format!("ran with {args}")))
        }
    }

    fn fixture(risk: RiskLevel, fail: bool) -> (ToolExecutor, Arc<AuditLog>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).unwrap());
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(Arc::new(Fixed {
                name: "probe",
                risk,
                fail,
            }))
            .unwrap();
        (
            ToolExecutor::new(registry, audit.clone()),
            audit,
            dir,
        )
    }

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            tool_call_id: id.into(),
            tool_name: "probe".into(),
            arguments: serde_json::json!({"x": 1}),
        }
    }

    #[tokio::test]
    async fn safe_call_executes_and_audits() {
        let (executor, audit, _dir) = fixture(RiskLevel::Safe, false);
        let ctx = ToolContext::for_task("t1", "main");

        let result = executor.execute(&call("tc1"), &ctx).await.unwrap();
        assert!(!result.is_error);
        assert!(result.content.contains("ran with"));

        let rows = audit.read_all(0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, AuditKind::ToolCallRequested);
        assert_eq!(rows[0].payload.input, Some(serde_json::json!({"x": 1})));
        assert_eq!(rows[1].kind, AuditKind::ToolCallCompleted);
        assert_eq!(rows[1].payload.is_error, Some(false));
        assert!(rows[1].payload.duration_ms.is_some());
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_result_without_audit() {
        let (executor, audit, _dir) = fixture(RiskLevel::Safe, false);
        let ctx = ToolContext::for_task("t1", "main");

        let mut c = call("tc1");
        c.tool_name = "ghost".into();
        let result = executor.execute(&c, &ctx).await.unwrap();
        assert!(result.is_error);
        assert!(result.error.as_deref().unwrap().contains("unknown tool"));
        assert!(audit.read_all(0).is_empty());
    }

    #[tokio::test]
    async fn risky_without_confirmation_is_blocked() {
        let (executor, audit, _dir) = fixture(RiskLevel::Risky, false);
        let ctx = ToolContext::for_task("t1", "main");

        let result = executor.execute(&call("tc1"), &ctx).await.unwrap();
        assert!(result.is_error);
        assert_eq!(
            result.error.as_deref(),
            Some("risky tool requires confirmation")
        );
        // Both audit rows are still written.
        assert_eq!(audit.read_all(0).len(), 2);
    }

    #[tokio::test]
    async fn risky_with_bound_confirmation_executes() {
        let (executor, _audit, _dir) = fixture(RiskLevel::Risky, false);
        let mut ctx = ToolContext::for_task("t1", "main");
        ctx.confirmed_interaction_id = Some("i1".into());
        ctx.confirmed_tool_call_id = Some("tc1".into());

        let result = executor.execute(&call("tc1"), &ctx).await.unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn confirmation_bound_to_other_call_does_not_authorize() {
        let (executor, _audit, _dir) = fixture(RiskLevel::Risky, false);
        let mut ctx = ToolContext::for_task("t1", "main");
        ctx.confirmed_interaction_id = Some("i1".into());
        ctx.confirmed_tool_call_id = Some("tc_other".into());

        let result = executor.execute(&call("tc1"), &ctx).await.unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn thrown_error_is_wrapped() {
        let (executor, audit, _dir) = fixture(RiskLevel::Safe, true);
        let ctx = ToolContext::for_task("t1", "main");

        let result = executor.execute(&call("tc1"), &ctx).await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.error.as_deref(), Some("tool blew up"));

        let rows = audit.read_all(0);
        assert_eq!(rows[1].payload.is_error, Some(true));
    }

    #[tokio::test]
    async fn record_rejection_writes_both_rows_without_invoking() {
        let (executor, audit, _dir) = fixture(RiskLevel::Risky, false);
        let ctx = ToolContext::for_task("t1", "main");

        let result = executor.record_rejection(&call("tc1"), &ctx).unwrap();
        assert!(result.is_error);
        assert_eq!(result.error.as_deref(), Some("User rejected the request"));

        let rows = audit.read_all(0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, AuditKind::ToolCallRequested);
        assert_eq!(rows[1].kind, AuditKind::ToolCallCompleted);
        assert_eq!(rows[1].payload.is_error, Some(true));
        assert!(rows[1]
            .payload
            .output
            .as_deref()
            .unwrap()
            .contains("User rejected the request"));
    }
}
