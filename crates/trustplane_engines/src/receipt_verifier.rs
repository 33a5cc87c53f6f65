#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};

use trustplane_kernel_contracts::plan::{PlanId, PlanStepId, TenantId};
use trustplane_kernel_contracts::retrieval::{
    AccessPolicy, PartitionId, ReceiptVerificationResult, SignedAccessReceipt,
};
use trustplane_kernel_contracts::UnixTimeMs;

use crate::retrieval_gateway::{RetrievalGateway, RetrievalPartition};
use crate::signing::{signature_matches, stable_hash};

pub const REASON_SIGNATURE_INVALID: &str = "Receipt signature is invalid";
pub const REASON_EXPIRED: &str = "Receipt has expired";
pub const REASON_TENANT_MISMATCH: &str = "Receipt tenant does not match request tenant";
pub const REASON_PARTITION_INVALID: &str =
    "Receipt partition is unknown, disabled, or belongs to another tenant";
pub const REASON_PLAN_STEP_MISMATCH: &str = "Receipt is bound to a different plan step";

/// Read access to the issuer's current partition table. The verifier never
/// trusts the issuer's in-process check; it recomputes everything from the
/// partitions it can see here.
pub trait PartitionDirectory {
    fn partition(&self, id: &PartitionId) -> Option<&RetrievalPartition>;
}

impl PartitionDirectory for RetrievalGateway {
    fn partition(&self, id: &PartitionId) -> Option<&RetrievalPartition> {
        RetrievalGateway::partition(self, id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationContext {
    pub plan_id: PlanId,
    pub plan_step_id: PlanStepId,
    pub tenant: TenantId,
    pub user_id: Option<String>,
    pub now: UnixTimeMs,
}

#[derive(Debug, Clone)]
pub struct VerificationAuditEntry {
    pub receipt_id: String,
    pub plan_id: String,
    pub plan_step_id: String,
    pub tenant: String,
    pub user_id: Option<String>,
    pub result: ReceiptVerificationResult,
    pub at: UnixTimeMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifierConfig {
    pub audit_capacity: usize,
}

impl VerifierConfig {
    pub fn mvp_v1() -> Self {
        Self {
            audit_capacity: 1_000,
        }
    }
}

/// Independently re-proves receipt validity: five checks computed from first
/// principles against the current partition table. Failed verifications are
/// values, never errors, and land in a bounded audit log.
#[derive(Debug)]
pub struct ReceiptVerifier {
    config: VerifierConfig,
    cache: BTreeMap<u64, ReceiptVerificationResult>,
    audit_log: VecDeque<VerificationAuditEntry>,
}

impl ReceiptVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self {
            config,
            cache: BTreeMap::new(),
            audit_log: VecDeque::new(),
        }
    }

    pub fn verify(
        &mut self,
        receipt: &SignedAccessReceipt,
        ctx: &VerificationContext,
        partitions: &impl PartitionDirectory,
    ) -> ReceiptVerificationResult {
        let key = cache_key(receipt, ctx);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }

        let result = compute_verification(receipt, ctx, partitions);
        self.cache.insert(key, result.clone());
        if !result.valid {
            self.append_audit(receipt, ctx, &result);
        }
        result
    }

    /// The cache never expires proactively but is always safe to clear;
    /// recomputation yields the same key and the same result.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn audit_entries(&self) -> impl Iterator<Item = &VerificationAuditEntry> {
        self.audit_log.iter()
    }

    pub fn audit_len(&self) -> usize {
        self.audit_log.len()
    }

    fn append_audit(
        &mut self,
        receipt: &SignedAccessReceipt,
        ctx: &VerificationContext,
        result: &ReceiptVerificationResult,
    ) {
        self.audit_log.push_back(VerificationAuditEntry {
            receipt_id: receipt.id.clone(),
            plan_id: ctx.plan_id.as_str().to_string(),
            plan_step_id: ctx.plan_step_id.as_str().to_string(),
            tenant: ctx.tenant.as_str().to_string(),
            user_id: ctx.user_id.clone(),
            result: result.clone(),
            at: ctx.now,
        });
        while self.audit_log.len() > self.config.audit_capacity {
            self.audit_log.pop_front();
        }
    }
}

fn cache_key(receipt: &SignedAccessReceipt, ctx: &VerificationContext) -> u64 {
    stable_hash(&[
        &receipt.id,
        ctx.plan_id.as_str(),
        ctx.plan_step_id.as_str(),
        ctx.tenant.as_str(),
        ctx.user_id.as_deref().unwrap_or(""),
    ])
}

fn compute_verification(
    receipt: &SignedAccessReceipt,
    ctx: &VerificationContext,
    partitions: &impl PartitionDirectory,
) -> ReceiptVerificationResult {
    let partition = partitions.partition(&receipt.partition_id);

    let signature_valid = match partition {
        Some(partition) => signature_matches(
            partition.key_bytes(),
            receipt.canonical_payload().as_bytes(),
            &receipt.signature,
        ),
        None => false,
    };
    let expiration_valid = ctx.now < receipt.expires_at;
    let tenant_match = receipt.tenant == ctx.tenant;
    let partition_valid = partition.is_some_and(|partition| {
        partition.tenant == receipt.tenant && partition.access_policy != AccessPolicy::Disabled
    });
    let plan_step_valid =
        receipt.plan_id == ctx.plan_id && receipt.plan_step_id == ctx.plan_step_id;

    let valid =
        signature_valid && expiration_valid && tenant_match && partition_valid && plan_step_valid;

    // First failing check wins: signature > expiration > tenant > partition >
    // plan_step.
    let reason = if valid {
        None
    } else if !signature_valid {
        Some(REASON_SIGNATURE_INVALID.to_string())
    } else if !expiration_valid {
        Some(REASON_EXPIRED.to_string())
    } else if !tenant_match {
        Some(REASON_TENANT_MISMATCH.to_string())
    } else if !partition_valid {
        Some(REASON_PARTITION_INVALID.to_string())
    } else {
        Some(REASON_PLAN_STEP_MISMATCH.to_string())
    };

    ReceiptVerificationResult {
        valid,
        signature_valid,
        expiration_valid,
        tenant_match,
        partition_valid,
        plan_step_valid,
        reason,
    }
}
