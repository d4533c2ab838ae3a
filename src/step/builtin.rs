//! Built-in Steps
//!
//! The minimal catalog that makes the engine runnable on its own:
//! - `Noop`: succeeds immediately (SYNC)
//! - `ShellScript`: runs a script on the execution pool (TASK)
//! - `Approval`: waits for a human decision (ASYNC)

use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use super::{ResumeInput, Step, StepContext, StepOutcome, StepResponse};
use crate::delegate::{ShellTask, TaskParameters, TaskSpec, TaskStatus};
use crate::error::StepError;
use crate::execution::{FailureInfo, Outcome, OutputSpec};
use crate::plan::{
    ApprovalParameters, FacilitationStrategy, FailureType, ShellParameters, StepParameters,
};

/// Does nothing and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStep;

impl Step for NoopStep {
    fn step_type(&self) -> &str {
        "Noop"
    }

    fn facilitation(&self) -> FacilitationStrategy {
        FacilitationStrategy::Sync
    }

    fn parse_parameters(&self, _spec: &Value) -> Result<StepParameters, StepError> {
        Ok(StepParameters::None)
    }

    fn invoke(&self, ctx: &StepContext<'_>) -> Result<StepResponse, StepError> {
        debug!("Noop step '{}'", ctx.node.identifier);
        Ok(StepResponse::Completed(StepOutcome::succeeded()))
    }
}

/// Runs a bash script on a delegate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellScriptStep;

impl ShellScriptStep {
    fn parameters<'a>(ctx: &'a StepContext<'_>) -> Result<&'a ShellParameters, StepError> {
        match ctx.parameters {
            StepParameters::Shell(shell) => Ok(shell),
            _ => Err(StepError::ParameterMismatch("ShellScript".to_string())),
        }
    }
}

impl Step for ShellScriptStep {
    fn step_type(&self) -> &str {
        "ShellScript"
    }

    fn facilitation(&self) -> FacilitationStrategy {
        FacilitationStrategy::Task
    }

    fn parse_parameters(&self, spec: &Value) -> Result<StepParameters, StepError> {
        let shell: ShellParameters = serde_json::from_value(spec.clone())
            .map_err(|e| StepError::ParameterMismatch(format!("ShellScript: {}", e)))?;
        if shell.script.trim().is_empty() {
            return Err(StepError::ParameterMismatch(
                "ShellScript: script must not be empty".to_string(),
            ));
        }
        Ok(StepParameters::Shell(shell))
    }

    fn invoke(&self, ctx: &StepContext<'_>) -> Result<StepResponse, StepError> {
        let shell = Self::parameters(ctx)?;

        Ok(StepResponse::Task(TaskSpec {
            parameters: TaskParameters::Shell(ShellTask {
                script: shell.script.clone(),
                env: shell.env.clone(),
                output_variables: shell.output_variables.clone(),
            }),
            capabilities: shell.delegate_selectors.clone(),
            timeout: ctx.node.timeout_secs.map(Duration::from_secs),
        }))
    }

    fn resume(&self, ctx: &StepContext<'_>, input: ResumeInput<'_>) -> Result<StepOutcome, StepError> {
        let ResumeInput::Task(result) = input else {
            return Err(StepError::Failed(
                "ShellScript expects a task result".to_string(),
            ));
        };
        let shell = Self::parameters(ctx)?;
        let exit_code = result.exit_code.unwrap_or(-1);

        if result.status == TaskStatus::Failure {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| format!("script exited with code {}", exit_code));
            let failure_types = if result.failure_types.is_empty() {
                vec![FailureType::Application]
            } else {
                result.failure_types.clone()
            };
            return Ok(StepOutcome::failed(FailureInfo::new(message, failure_types)));
        }

        let mut outcome = StepOutcome::succeeded().with_outcome(Outcome::Shell {
            exit_code,
            outputs: result.outputs.clone(),
        });

        for name in &shell.output_variables {
            if let Some(value) = result.outputs.get(name) {
                outcome = outcome.with_output(OutputSpec::new(
                    name.clone(),
                    Value::String(value.clone()),
                    shell.output_scope,
                ));
            }
        }

        Ok(outcome)
    }
}

/// Payload posted to resume an approval.
#[derive(Debug, Deserialize)]
struct ApprovalDecision {
    approved: bool,
    #[serde(default)]
    approver: Option<String>,
    #[serde(default)]
    comments: Option<String>,
}

/// Waits until someone approves or rejects.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalStep;

impl Step for ApprovalStep {
    fn step_type(&self) -> &str {
        "Approval"
    }

    fn facilitation(&self) -> FacilitationStrategy {
        FacilitationStrategy::Async
    }

    fn parse_parameters(&self, spec: &Value) -> Result<StepParameters, StepError> {
        let approval: ApprovalParameters = if spec.is_null() {
            ApprovalParameters::default()
        } else {
            serde_json::from_value(spec.clone())
                .map_err(|e| StepError::ParameterMismatch(format!("Approval: {}", e)))?
        };
        Ok(StepParameters::Approval(approval))
    }

    fn invoke(&self, ctx: &StepContext<'_>) -> Result<StepResponse, StepError> {
        if let StepParameters::Approval(approval) = ctx.parameters {
            info!(
                "Approval '{}' waiting: {}",
                ctx.node.identifier, approval.message
            );
        }
        Ok(StepResponse::Async)
    }

    fn resume(&self, ctx: &StepContext<'_>, input: ResumeInput<'_>) -> Result<StepOutcome, StepError> {
        let ResumeInput::Async(payload) = input else {
            return Err(StepError::Failed(
                "Approval expects an async response".to_string(),
            ));
        };

        let decision: ApprovalDecision = serde_json::from_value(payload.clone())
            .map_err(|e| StepError::Failed(format!("invalid approval payload: {}", e)))?;

        if let StepParameters::Approval(approval) = ctx.parameters {
            let approver = decision.approver.as_deref().unwrap_or_default();
            if !approval.approvers.is_empty() && !approval.approvers.iter().any(|a| a == approver) {
                return Ok(StepOutcome::failed(FailureInfo::of(
                    FailureType::Authorization,
                    format!("'{}' is not an allowed approver", approver),
                )));
            }
        }

        let outcome = Outcome::Approval {
            approved: decision.approved,
            approver: decision.approver.clone(),
            comments: decision.comments,
        };

        if decision.approved {
            Ok(StepOutcome::succeeded().with_outcome(outcome))
        } else {
            let by = decision.approver.unwrap_or_else(|| "unknown".to_string());
            Ok(StepOutcome::failed(FailureInfo::of(
                FailureType::Verification,
                format!("rejected by {}", by),
            ))
            .with_outcome(outcome))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Ambiance, TriggerInfo};
    use crate::delegate::TaskResult;
    use crate::execution::{Status, Visibility};
    use crate::plan::PlanNode;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ambiance() -> Ambiance {
        Ambiance::new("pe", "plan", BTreeMap::new(), TriggerInfo::default())
    }

    #[test]
    fn test_shell_parameters_parse() {
        let params = ShellScriptStep
            .parse_parameters(&json!({"script": "echo hi", "delegateSelectors": ["linux"]}))
            .unwrap();
        match params {
            StepParameters::Shell(shell) => {
                assert_eq!(shell.script, "echo hi");
                assert_eq!(shell.delegate_selectors, vec!["linux"]);
            }
            other => panic!("unexpected parameters {:?}", other),
        }
    }

    #[test]
    fn test_shell_rejects_empty_script() {
        assert!(ShellScriptStep.parse_parameters(&json!({"script": "  "})).is_err());
        assert!(ShellScriptStep.parse_parameters(&json!({})).is_err());
    }

    #[test]
    fn test_shell_invoke_builds_task() {
        let node = PlanNode::new("n", "build", "ShellScript", FacilitationStrategy::Task)
            .with_timeout_secs(30);
        let params = ShellScriptStep
            .parse_parameters(&json!({"script": "make", "delegateSelectors": ["gpu"]}))
            .unwrap();
        let amb = ambiance();
        let ctx = StepContext {
            ambiance: &amb,
            node: &node,
            parameters: &params,
        };

        match ShellScriptStep.invoke(&ctx).unwrap() {
            StepResponse::Task(spec) => {
                assert_eq!(spec.capabilities, vec!["gpu"]);
                assert_eq!(spec.timeout, Some(Duration::from_secs(30)));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_shell_resume_exports_outputs() {
        let node = PlanNode::new("n", "build", "ShellScript", FacilitationStrategy::Task);
        let params = ShellScriptStep
            .parse_parameters(&json!({
                "script": "export V=1",
                "outputVariables": ["V"],
                "outputScope": "PIPELINE_GLOBAL"
            }))
            .unwrap();
        let amb = ambiance();
        let ctx = StepContext {
            ambiance: &amb,
            node: &node,
            parameters: &params,
        };

        let mut outputs = BTreeMap::new();
        outputs.insert("V".to_string(), "1".to_string());
        let result = TaskResult::success(0, outputs);

        let outcome = ShellScriptStep.resume(&ctx, ResumeInput::Task(&result)).unwrap();
        assert_eq!(outcome.status, Status::Succeeded);
        assert_eq!(outcome.outputs.len(), 1);
        assert_eq!(outcome.outputs[0].visibility, Visibility::PipelineGlobal);
    }

    #[test]
    fn test_shell_resume_failure() {
        let node = PlanNode::new("n", "build", "ShellScript", FacilitationStrategy::Task);
        let params = ShellScriptStep
            .parse_parameters(&json!({"script": "exit 3"}))
            .unwrap();
        let amb = ambiance();
        let ctx = StepContext {
            ambiance: &amb,
            node: &node,
            parameters: &params,
        };

        let result = TaskResult::failure(Some(3), "script exited with code 3");
        let outcome = ShellScriptStep.resume(&ctx, ResumeInput::Task(&result)).unwrap();
        assert_eq!(outcome.status, Status::Failed);
        assert_eq!(
            outcome.failure.unwrap().failure_types,
            vec![FailureType::Application]
        );
    }

    #[test]
    fn test_approval_flow() {
        let node = PlanNode::new("n", "gate", "Approval", FacilitationStrategy::Async);
        let params = ApprovalStep
            .parse_parameters(&json!({"message": "ship it?", "approvers": ["alice"]}))
            .unwrap();
        let amb = ambiance();
        let ctx = StepContext {
            ambiance: &amb,
            node: &node,
            parameters: &params,
        };

        assert_eq!(ApprovalStep.invoke(&ctx).unwrap(), StepResponse::Async);

        let approved = json!({"approved": true, "approver": "alice"});
        let outcome = ApprovalStep.resume(&ctx, ResumeInput::Async(&approved)).unwrap();
        assert_eq!(outcome.status, Status::Succeeded);

        let stranger = json!({"approved": true, "approver": "mallory"});
        let outcome = ApprovalStep.resume(&ctx, ResumeInput::Async(&stranger)).unwrap();
        assert_eq!(outcome.status, Status::Failed);

        let rejected = json!({"approved": false, "approver": "alice"});
        let outcome = ApprovalStep.resume(&ctx, ResumeInput::Async(&rejected)).unwrap();
        assert_eq!(
            outcome.failure.unwrap().failure_types,
            vec![FailureType::Verification]
        );
    }
}
