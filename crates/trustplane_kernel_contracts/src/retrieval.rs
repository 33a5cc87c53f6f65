#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::plan::{PlanId, PlanStepId, TenantId};
use crate::{validate_token, ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const RECEIPT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_QUERY_LABELS: usize = 16;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Capability {
    Read,
    Search,
    Aggregate,
    Export,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Search => "search",
            Capability::Aggregate => "aggregate",
            Capability::Export => "export",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessPolicy {
    Standard,
    Restricted,
    Disabled,
}

impl AccessPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessPolicy::Standard => "standard",
            AccessPolicy::Restricted => "restricted",
            AccessPolicy::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(value.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PartitionId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("partition_id", &self.0, 96)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub query_id: String,
    pub tenant: TenantId,
    pub labels: BTreeSet<String>,
    pub query_text: String,
    pub capabilities: BTreeSet<Capability>,
}

impl RetrievalQuery {
    pub fn v1(
        query_id: String,
        tenant: TenantId,
        labels: BTreeSet<String>,
        query_text: String,
        capabilities: BTreeSet<Capability>,
    ) -> Result<Self, ContractViolation> {
        let query = Self {
            query_id,
            tenant,
            labels,
            query_text,
            capabilities,
        };
        query.validate()?;
        Ok(query)
    }
}

impl Validate for RetrievalQuery {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("retrieval_query.query_id", &self.query_id, 96)?;
        self.tenant.validate()?;
        if self.labels.is_empty() || self.labels.len() > MAX_QUERY_LABELS {
            return Err(ContractViolation::InvalidValue {
                field: "retrieval_query.labels",
                reason: "must contain 1..=16 labels",
            });
        }
        for label in &self.labels {
            validate_token("retrieval_query.labels", label, 64)?;
        }
        if self.query_text.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "retrieval_query.query_text",
                reason: "must be non-empty",
            });
        }
        if self.capabilities.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "retrieval_query.capabilities",
                reason: "must contain at least one capability",
            });
        }
        Ok(())
    }
}

/// Signed proof that one retrieval happened under one partition. Immutable
/// once issued. The `public_key` field carries a fingerprint of the symmetric
/// partition key, not a verification key; the signer and the verifier share
/// the same secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAccessReceipt {
    pub schema_version: SchemaVersion,
    pub id: String,
    pub plan_id: PlanId,
    pub plan_step_id: PlanStepId,
    pub tenant: TenantId,
    pub query_id: String,
    pub partition_id: PartitionId,
    pub access_timestamp: UnixTimeMs,
    pub expires_at: UnixTimeMs,
    pub capabilities: BTreeSet<Capability>,
    pub labels: BTreeSet<String>,
    pub query_hash: String,
    pub result_hash: String,
    pub public_key: String,
    pub signature: String,
}

impl SignedAccessReceipt {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        id: String,
        plan_id: PlanId,
        plan_step_id: PlanStepId,
        tenant: TenantId,
        query_id: String,
        partition_id: PartitionId,
        access_timestamp: UnixTimeMs,
        expires_at: UnixTimeMs,
        capabilities: BTreeSet<Capability>,
        labels: BTreeSet<String>,
        query_hash: String,
        result_hash: String,
        public_key: String,
        signature: String,
    ) -> Result<Self, ContractViolation> {
        let receipt = Self {
            schema_version: RECEIPT_CONTRACT_VERSION,
            id,
            plan_id,
            plan_step_id,
            tenant,
            query_id,
            partition_id,
            access_timestamp,
            expires_at,
            capabilities,
            labels,
            query_hash,
            result_hash,
            public_key,
            signature,
        };
        receipt.validate()?;
        Ok(receipt)
    }

    /// Canonical signing payload. Field order is load-bearing: signer and
    /// verifier must agree byte for byte.
    pub fn canonical_payload(&self) -> String {
        let capabilities = self
            .capabilities
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let labels = self.labels.iter().cloned().collect::<Vec<_>>().join(",");
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.plan_id.as_str(),
            self.tenant.as_str(),
            self.query_id,
            self.partition_id.as_str(),
            self.access_timestamp.0,
            self.expires_at.0,
            capabilities,
            labels,
            self.query_hash,
            self.result_hash,
        )
    }
}

impl Validate for SignedAccessReceipt {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != RECEIPT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "signed_access_receipt.schema_version",
                reason: "must match RECEIPT_CONTRACT_VERSION",
            });
        }
        validate_token("signed_access_receipt.id", &self.id, 96)?;
        self.plan_id.validate()?;
        self.plan_step_id.validate()?;
        self.tenant.validate()?;
        validate_token("signed_access_receipt.query_id", &self.query_id, 96)?;
        self.partition_id.validate()?;
        if self.expires_at <= self.access_timestamp {
            return Err(ContractViolation::InvalidValue {
                field: "signed_access_receipt.expires_at",
                reason: "must follow access_timestamp",
            });
        }
        if self.capabilities.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "signed_access_receipt.capabilities",
                reason: "must contain at least one capability",
            });
        }
        for label in &self.labels {
            validate_token("signed_access_receipt.labels", label, 64)?;
        }
        if self.query_hash.is_empty() || self.result_hash.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "signed_access_receipt.hashes",
                reason: "query_hash and result_hash must be non-empty",
            });
        }
        if self.signature.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "signed_access_receipt.signature",
                reason: "must be non-empty",
            });
        }
        Ok(())
    }
}

/// Outcome of re-validating a receipt. A failed check is a value, never an
/// error; the caller decides policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptVerificationResult {
    pub valid: bool,
    pub signature_valid: bool,
    pub expiration_valid: bool,
    pub tenant_match: bool,
    pub partition_valid: bool,
    pub plan_step_valid: bool,
    pub reason: Option<String>,
}
