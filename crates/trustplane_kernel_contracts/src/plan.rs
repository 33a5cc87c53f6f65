#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::retrieval::RetrievalQuery;
use crate::{validate_token, ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const PLAN_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_PLAN_STEPS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(value.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for TenantId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("tenant_id", &self.0, 64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlanId(String);

impl PlanId {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(value.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PlanId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("plan_id", &self.0, 96)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlanStepId(String);

impl PlanStepId {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(value.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PlanStepId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("plan_step_id", &self.0, 96)
    }
}

/// Typed step parameter value. Forward-compatible payload goes through the
/// step's `extra` bag, never through untyped maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Text(String),
    Number(f64),
    Flag(bool),
}

impl Validate for ParamValue {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            ParamValue::Text(text) => {
                if text.len() > 4096 {
                    return Err(ContractViolation::InvalidValue {
                        field: "param_value.text",
                        reason: "exceeds max length",
                    });
                }
                Ok(())
            }
            ParamValue::Number(n) => {
                if !n.is_finite() {
                    return Err(ContractViolation::NotFinite {
                        field: "param_value.number",
                    });
                }
                Ok(())
            }
            ParamValue::Flag(_) => Ok(()),
        }
    }
}

impl ParamValue {
    pub fn render(&self) -> String {
        match self {
            ParamValue::Text(text) => text.clone(),
            ParamValue::Number(n) => n.to_string(),
            ParamValue::Flag(flag) => flag.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

/// The four known step kinds. Anything a future adapter adds rides in the
/// step's `extra` bag until it earns a variant of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepKind {
    ToolCall {
        tool: String,
        parameters: BTreeMap<String, ParamValue>,
        capability: Option<String>,
    },
    Decision {
        parameters: BTreeMap<String, ParamValue>,
    },
    Retrieval {
        query: RetrievalQuery,
    },
    Verification {
        parameters: BTreeMap<String, ParamValue>,
    },
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ToolCall { .. } => "tool_call",
            StepKind::Decision { .. } => "decision",
            StepKind::Retrieval { .. } => "retrieval",
            StepKind::Verification { .. } => "verification",
        }
    }
}

impl Validate for StepKind {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            StepKind::ToolCall {
                tool,
                parameters,
                capability,
            } => {
                validate_token("plan_step.tool", tool, 96)?;
                if let Some(capability) = capability {
                    validate_token("plan_step.capability", capability, 128)?;
                }
                validate_parameters(parameters)
            }
            StepKind::Decision { parameters } | StepKind::Verification { parameters } => {
                validate_parameters(parameters)
            }
            StepKind::Retrieval { query } => query.validate(),
        }
    }
}

fn validate_parameters(
    parameters: &BTreeMap<String, ParamValue>,
) -> Result<(), ContractViolation> {
    if parameters.len() > 32 {
        return Err(ContractViolation::InvalidValue {
            field: "plan_step.parameters",
            reason: "must contain <= 32 entries",
        });
    }
    for (key, value) in parameters {
        validate_token("plan_step.parameters.key", key, 64)?;
        value.validate()?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: PlanStepId,
    pub kind: StepKind,
    pub status: StepStatus,
    pub timestamp: UnixTimeMs,
    pub extra: BTreeMap<String, String>,
}

impl PlanStep {
    pub fn v1(
        id: PlanStepId,
        kind: StepKind,
        status: StepStatus,
        timestamp: UnixTimeMs,
        extra: BTreeMap<String, String>,
    ) -> Result<Self, ContractViolation> {
        let step = Self {
            id,
            kind,
            status,
            timestamp,
            extra,
        };
        step.validate()?;
        Ok(step)
    }
}

impl Validate for PlanStep {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.id.validate()?;
        self.kind.validate()?;
        if self.extra.len() > 16 {
            return Err(ContractViolation::InvalidValue {
                field: "plan_step.extra",
                reason: "must contain <= 16 entries",
            });
        }
        for key in self.extra.keys() {
            validate_token("plan_step.extra.key", key, 64)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub schema_version: SchemaVersion,
    pub id: PlanId,
    pub tenant: TenantId,
    pub journey: String,
    pub steps: Vec<PlanStep>,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: UnixTimeMs,
    pub expires_at: UnixTimeMs,
}

impl Plan {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        id: PlanId,
        tenant: TenantId,
        journey: String,
        steps: Vec<PlanStep>,
        metadata: BTreeMap<String, String>,
        timestamp: UnixTimeMs,
        expires_at: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let plan = Self {
            schema_version: PLAN_CONTRACT_VERSION,
            id,
            tenant,
            journey,
            steps,
            metadata,
            timestamp,
            expires_at,
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn retrieval_steps(&self) -> impl Iterator<Item = (&PlanStep, &RetrievalQuery)> {
        self.steps.iter().filter_map(|step| match &step.kind {
            StepKind::Retrieval { query } => Some((step, query)),
            _ => None,
        })
    }
}

impl Validate for Plan {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PLAN_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "plan.schema_version",
                reason: "must match PLAN_CONTRACT_VERSION",
            });
        }
        self.id.validate()?;
        self.tenant.validate()?;
        validate_token("plan.journey", &self.journey, 128)?;
        if self.steps.len() > MAX_PLAN_STEPS {
            return Err(ContractViolation::InvalidValue {
                field: "plan.steps",
                reason: "must contain <= 64 steps",
            });
        }
        for step in &self.steps {
            step.validate()?;
        }
        if self.metadata.len() > 32 {
            return Err(ContractViolation::InvalidValue {
                field: "plan.metadata",
                reason: "must contain <= 32 entries",
            });
        }
        for key in self.metadata.keys() {
            validate_token("plan.metadata.key", key, 64)?;
        }
        if self.expires_at < self.timestamp {
            return Err(ContractViolation::InvalidValue {
                field: "plan.expires_at",
                reason: "must not precede plan.timestamp",
            });
        }
        Ok(())
    }
}
