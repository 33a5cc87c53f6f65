#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::plan::{PlanId, TenantId};
use crate::{validate_token, ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const TRACE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// The seven decision-path phases, in execution order. No phase is skippable
/// and no phase begins before the previous step record is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionPhase {
    Observe,
    Retrieve,
    Plan,
    Kernel,
    ToolBroker,
    Egress,
    SafetyCase,
}

impl DecisionPhase {
    pub const ORDERED: [DecisionPhase; 7] = [
        DecisionPhase::Observe,
        DecisionPhase::Retrieve,
        DecisionPhase::Plan,
        DecisionPhase::Kernel,
        DecisionPhase::ToolBroker,
        DecisionPhase::Egress,
        DecisionPhase::SafetyCase,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionPhase::Observe => "observe",
            DecisionPhase::Retrieve => "retrieve",
            DecisionPhase::Plan => "plan",
            DecisionPhase::Kernel => "kernel",
            DecisionPhase::ToolBroker => "tool_broker",
            DecisionPhase::Egress => "egress",
            DecisionPhase::SafetyCase => "safety_case",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseStepStatus {
    Completed,
    Failed,
}

impl PhaseStepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStepStatus::Completed => "completed",
            PhaseStepStatus::Failed => "failed",
        }
    }
}

/// One phase's execution record. Finalized exactly once, when the phase
/// completes or fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionPathStep {
    pub id: String,
    pub phase: DecisionPhase,
    pub input_hash: String,
    pub output_hash: Option<String>,
    pub status: PhaseStepStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Validate for DecisionPathStep {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("decision_path_step.id", &self.id, 96)?;
        if self.input_hash.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "decision_path_step.input_hash",
                reason: "must be non-empty",
            });
        }
        match self.status {
            PhaseStepStatus::Completed => {
                if self.output_hash.is_none() || self.error.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "decision_path_step.status",
                        reason: "completed steps carry an output hash and no error",
                    });
                }
            }
            PhaseStepStatus::Failed => {
                if self.error.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "decision_path_step.error",
                        reason: "failed steps must record the error verbatim",
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinalStatus {
    Completed,
    Failed,
    Aborted,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalStatus::Completed => "completed",
            FinalStatus::Failed => "failed",
            FinalStatus::Aborted => "aborted",
        }
    }
}

/// One execution of a plan through the seven phases. Never rolled back: a
/// failed trace keeps every step and every piece of evidence produced before
/// the failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionPathTrace {
    pub schema_version: SchemaVersion,
    pub trace_id: String,
    pub plan_id: PlanId,
    pub tenant: TenantId,
    pub session_id: String,
    pub steps: Vec<DecisionPathStep>,
    pub receipt_ids: Vec<String>,
    pub certificate_ids: Vec<String>,
    pub safety_case_ids: Vec<String>,
    pub final_status: FinalStatus,
    pub started_at: UnixTimeMs,
    pub finished_at: UnixTimeMs,
    pub total_duration_ms: u64,
}

impl Validate for DecisionPathTrace {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != TRACE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "decision_path_trace.schema_version",
                reason: "must match TRACE_CONTRACT_VERSION",
            });
        }
        validate_token("decision_path_trace.trace_id", &self.trace_id, 96)?;
        self.plan_id.validate()?;
        self.tenant.validate()?;
        validate_token("decision_path_trace.session_id", &self.session_id, 96)?;
        if self.steps.len() > DecisionPhase::ORDERED.len() {
            return Err(ContractViolation::InvalidValue {
                field: "decision_path_trace.steps",
                reason: "must contain at most one step per phase",
            });
        }
        for step in &self.steps {
            step.validate()?;
        }
        if self.finished_at < self.started_at {
            return Err(ContractViolation::InvalidValue {
                field: "decision_path_trace.finished_at",
                reason: "must not precede started_at",
            });
        }
        Ok(())
    }
}
