#![forbid(unsafe_code)]

use std::fmt;

use trustplane_kernel_contracts::egress::EgressCertificate;
use trustplane_kernel_contracts::plan::PlanId;
use trustplane_kernel_contracts::retrieval::SignedAccessReceipt;
use trustplane_kernel_contracts::safety_case::SafetyCase;
use trustplane_kernel_contracts::trace::DecisionPathTrace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    DuplicateId { table: &'static str, id: String },
    NotFound { table: &'static str, id: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId { table, id } => {
                write!(f, "duplicate id in {table} table: {id}")
            }
            Self::NotFound { table, id } => write!(f, "not found in {table} table: {id}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Typed repository interface for decision-path trace persistence. Traces
/// are retained regardless of final status; failure is always auditable.
pub trait TraceRepo {
    fn insert_trace(&mut self, trace: DecisionPathTrace) -> Result<(), StorageError>;
    fn trace(&self, trace_id: &str) -> Option<&DecisionPathTrace>;
    fn traces_by_plan(&self, plan_id: &PlanId) -> Vec<&DecisionPathTrace>;
}

/// Typed repository interface for signed access receipts.
pub trait ReceiptRepo {
    fn insert_receipt(&mut self, receipt: SignedAccessReceipt) -> Result<(), StorageError>;
    fn receipt(&self, receipt_id: &str) -> Option<&SignedAccessReceipt>;
    fn receipts_by_plan(&self, plan_id: &PlanId) -> Vec<&SignedAccessReceipt>;
}

/// Typed repository interface for egress certificates.
pub trait CertificateRepo {
    fn insert_certificate(&mut self, certificate: EgressCertificate) -> Result<(), StorageError>;
    fn certificate(&self, certificate_id: &str) -> Option<&EgressCertificate>;
    fn certificates_by_plan(&self, plan_id: &PlanId) -> Vec<&EgressCertificate>;
}

/// Typed repository interface for safety cases.
pub trait SafetyCaseRepo {
    fn insert_safety_case(&mut self, case: SafetyCase) -> Result<(), StorageError>;
    fn safety_case(&self, case_id: &str) -> Option<&SafetyCase>;
    fn safety_cases_by_plan(&self, plan_id: &PlanId) -> Vec<&SafetyCase>;
}
