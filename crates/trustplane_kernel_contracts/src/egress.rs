#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::plan::{PlanId, TenantId};
use crate::{validate_token, ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const CERTIFICATE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedactionCategory {
    Pii,
    Secret,
    NeverReveal,
}

impl RedactionCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RedactionCategory::Pii => "pii",
            RedactionCategory::Secret => "secret",
            RedactionCategory::NeverReveal => "never_reveal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactedItem {
    pub category: RedactionCategory,
    pub tag: String,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionSummary {
    pub pii_count: u32,
    pub secret_count: u32,
    pub near_dup_count: u32,
    pub blocked_spans: u32,
    pub redacted: Vec<RedactedItem>,
}

/// Non-interference bands. Classification is a function purely of the final
/// counts; nothing else feeds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NonInterferenceLevel {
    L0,
    L1,
    L2,
    L3,
}

impl NonInterferenceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            NonInterferenceLevel::L0 => "L0",
            NonInterferenceLevel::L1 => "L1",
            NonInterferenceLevel::L2 => "L2",
            NonInterferenceLevel::L3 => "L3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EgressVerdict {
    Passed,
    Failed,
}

impl EgressVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            EgressVerdict::Passed => "passed",
            EgressVerdict::Failed => "failed",
        }
    }
}

/// The verdict records whether sensitive data was present in the INPUT, not
/// whether the redacted output is unsafe. Downstream policy decides what a
/// failed verdict blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonInterference {
    pub level: NonInterferenceLevel,
    pub verdict: EgressVerdict,
    pub proof_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressCertificate {
    pub schema_version: SchemaVersion,
    pub id: String,
    pub plan_id: PlanId,
    pub tenant: TenantId,
    pub content_hash: String,
    pub filtered_content_hash: String,
    pub summary: RedactionSummary,
    pub non_interference: NonInterference,
    pub policy_applied: String,
    pub issued_at: UnixTimeMs,
}

impl EgressCertificate {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        id: String,
        plan_id: PlanId,
        tenant: TenantId,
        content_hash: String,
        filtered_content_hash: String,
        summary: RedactionSummary,
        non_interference: NonInterference,
        policy_applied: String,
        issued_at: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let certificate = Self {
            schema_version: CERTIFICATE_CONTRACT_VERSION,
            id,
            plan_id,
            tenant,
            content_hash,
            filtered_content_hash,
            summary,
            non_interference,
            policy_applied,
            issued_at,
        };
        certificate.validate()?;
        Ok(certificate)
    }
}

impl Validate for EgressCertificate {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CERTIFICATE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "egress_certificate.schema_version",
                reason: "must match CERTIFICATE_CONTRACT_VERSION",
            });
        }
        validate_token("egress_certificate.id", &self.id, 96)?;
        self.plan_id.validate()?;
        self.tenant.validate()?;
        if self.content_hash.is_empty() || self.filtered_content_hash.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "egress_certificate.hashes",
                reason: "content hashes must be non-empty",
            });
        }
        if self.non_interference.proof_hash.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "egress_certificate.non_interference.proof_hash",
                reason: "must be non-empty",
            });
        }
        validate_token(
            "egress_certificate.policy_applied",
            &self.policy_applied,
            96,
        )?;
        Ok(())
    }
}

/// Classify final counts into a band and a verdict. Failed means sensitive
/// data was detected, even though the content has already been redacted.
pub fn classify_non_interference(
    pii_count: u32,
    secret_count: u32,
) -> (NonInterferenceLevel, EgressVerdict) {
    let level = if pii_count == 0 && secret_count == 0 {
        NonInterferenceLevel::L0
    } else if pii_count <= 5 && secret_count == 0 {
        NonInterferenceLevel::L1
    } else if pii_count <= 10 || secret_count > 0 {
        NonInterferenceLevel::L2
    } else {
        NonInterferenceLevel::L3
    };
    let verdict = if pii_count > 0 || secret_count > 0 {
        EgressVerdict::Failed
    } else {
        EgressVerdict::Passed
    };
    (level, verdict)
}
