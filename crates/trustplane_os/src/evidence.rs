#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::Serialize;

use trustplane_engines::signing::sha256_b64;
use trustplane_kernel_contracts::egress::EgressCertificate;
use trustplane_kernel_contracts::plan::{Plan, StepKind};
use trustplane_kernel_contracts::retrieval::{ReceiptVerificationResult, SignedAccessReceipt};
use trustplane_kernel_contracts::safety_case::SafetyCase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolExecutionRecord {
    pub step_id: String,
    pub tool: String,
    pub result_ref: String,
}

/// Evidence accumulated while a trace runs, threaded explicitly through the
/// phase executor. Later phases read earlier phases' output from here, never
/// from shared tables.
#[derive(Debug, Default)]
pub struct EvidenceBundle {
    pub receipts: Vec<SignedAccessReceipt>,
    pub verifications: Vec<ReceiptVerificationResult>,
    pub tool_results: Vec<ToolExecutionRecord>,
    pub certificate: Option<EgressCertificate>,
    pub filtered_content: Option<String>,
    pub safety_case: Option<SafetyCase>,
}

impl EvidenceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receipt_ids(&self) -> Vec<String> {
        self.receipts.iter().map(|r| r.id.clone()).collect()
    }

    pub fn certificate_ids(&self) -> Vec<String> {
        self.certificate.iter().map(|c| c.id.clone()).collect()
    }

    pub fn safety_case_ids(&self) -> Vec<String> {
        self.safety_case.iter().map(|c| c.id.clone()).collect()
    }

    /// Union of the labels every receipt was issued under; feeds the safety
    /// case's labeler hash.
    pub fn receipt_labels(&self) -> BTreeSet<String> {
        self.receipts
            .iter()
            .flat_map(|r| r.labels.iter().cloned())
            .collect()
    }

    pub fn hash_receipts(&self) -> String {
        let joined = self
            .receipts
            .iter()
            .map(|r| format!("{}:{}", r.id, r.signature))
            .collect::<Vec<_>>()
            .join("\n");
        sha256_b64(joined.as_bytes())
    }

    pub fn hash_certificates(&self) -> String {
        let joined = self
            .certificate
            .iter()
            .map(|c| format!("{}:{}", c.id, c.non_interference.proof_hash))
            .collect::<Vec<_>>()
            .join("\n");
        sha256_b64(joined.as_bytes())
    }
}

/// The plan's aggregate outward-facing content: journey, metadata values,
/// parameter values, and extra-bag values in deterministic order. This is
/// what the egress firewall scans.
pub fn aggregate_plan_content(plan: &Plan) -> String {
    let mut parts = Vec::new();
    parts.push(plan.journey.clone());
    for value in plan.metadata.values() {
        parts.push(value.clone());
    }
    for step in &plan.steps {
        match &step.kind {
            StepKind::ToolCall { parameters, .. }
            | StepKind::Decision { parameters }
            | StepKind::Verification { parameters } => {
                for value in parameters.values() {
                    parts.push(value.render());
                }
            }
            StepKind::Retrieval { query } => {
                parts.push(query.query_text.clone());
            }
        }
        for value in step.extra.values() {
            parts.push(value.clone());
        }
    }
    parts.join("\n")
}
