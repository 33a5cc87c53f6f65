#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::plan::{PlanId, TenantId};
use crate::{validate_token, ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const SAFETY_CASE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// One hash per evidence channel. Receipts and certificates are hashed over
/// exactly the evidence accumulated for the safety case's plan id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceHashes {
    pub input_hash: String,
    pub output_hash: String,
    pub receipts_hash: String,
    pub certificates_hash: String,
    pub policy_hash: String,
    pub proof_hash: String,
    pub automata_hash: String,
    pub labeler_hash: String,
}

impl Validate for EvidenceHashes {
    fn validate(&self) -> Result<(), ContractViolation> {
        let fields = [
            ("evidence_hashes.input_hash", &self.input_hash),
            ("evidence_hashes.output_hash", &self.output_hash),
            ("evidence_hashes.receipts_hash", &self.receipts_hash),
            (
                "evidence_hashes.certificates_hash",
                &self.certificates_hash,
            ),
            ("evidence_hashes.policy_hash", &self.policy_hash),
            ("evidence_hashes.proof_hash", &self.proof_hash),
            ("evidence_hashes.automata_hash", &self.automata_hash),
            ("evidence_hashes.labeler_hash", &self.labeler_hash),
        ];
        for (field, value) in fields {
            if value.is_empty() {
                return Err(ContractViolation::InvalidValue {
                    field,
                    reason: "must be non-empty",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SafetyCaseVerdict {
    Passed,
    Failed,
}

impl SafetyCaseVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyCaseVerdict::Passed => "passed",
            SafetyCaseVerdict::Failed => "failed",
        }
    }
}

/// Aggregated, signed evidence bundle for one plan execution; the final
/// audit artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCase {
    pub schema_version: SchemaVersion,
    pub id: String,
    pub plan_id: PlanId,
    pub tenant: TenantId,
    pub evidence: EvidenceHashes,
    pub verdict: SafetyCaseVerdict,
    pub confidence: f32,
    pub signature: String,
    pub issued_at: UnixTimeMs,
}

impl SafetyCase {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        id: String,
        plan_id: PlanId,
        tenant: TenantId,
        evidence: EvidenceHashes,
        verdict: SafetyCaseVerdict,
        confidence: f32,
        signature: String,
        issued_at: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let case = Self {
            schema_version: SAFETY_CASE_CONTRACT_VERSION,
            id,
            plan_id,
            tenant,
            evidence,
            verdict,
            confidence,
            signature,
            issued_at,
        };
        case.validate()?;
        Ok(case)
    }

    /// Canonical signing payload over the evidence hashes and verdict.
    pub fn canonical_payload(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.plan_id.as_str(),
            self.tenant.as_str(),
            self.evidence.input_hash,
            self.evidence.output_hash,
            self.evidence.receipts_hash,
            self.evidence.certificates_hash,
            self.evidence.policy_hash,
            self.evidence.proof_hash,
            self.evidence.automata_hash,
            self.evidence.labeler_hash,
            self.verdict.as_str(),
        )
    }
}

impl Validate for SafetyCase {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != SAFETY_CASE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "safety_case.schema_version",
                reason: "must match SAFETY_CASE_CONTRACT_VERSION",
            });
        }
        validate_token("safety_case.id", &self.id, 96)?;
        self.plan_id.validate()?;
        self.tenant.validate()?;
        self.evidence.validate()?;
        if !self.confidence.is_finite() {
            return Err(ContractViolation::NotFinite {
                field: "safety_case.confidence",
            });
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ContractViolation::InvalidRange {
                field: "safety_case.confidence",
                min: 0.0,
                max: 1.0,
                got: f64::from(self.confidence),
            });
        }
        if self.signature.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "safety_case.signature",
                reason: "must be non-empty",
            });
        }
        Ok(())
    }
}
