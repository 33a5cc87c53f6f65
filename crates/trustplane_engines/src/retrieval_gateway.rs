#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;

use trustplane_kernel_contracts::context::ExecutionContext;
use trustplane_kernel_contracts::plan::{Plan, PlanStepId, TenantId};
use trustplane_kernel_contracts::retrieval::{
    AccessPolicy, PartitionId, RetrievalQuery, SignedAccessReceipt, RECEIPT_CONTRACT_VERSION,
};
use trustplane_kernel_contracts::{ContractViolation, UnixTimeMs, Validate};

use crate::signing::{key_fingerprint, opaque_ref, sha256_b64, sign_payload, signature_matches};

const PARTITION_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug)]
pub enum GatewayError {
    IsolationViolation { expected: String, got: String },
    PartitionNotFound { tenant: String },
    QueryTooLarge { len: usize, max: usize },
    PartitionLimitReached { max: usize },
    DocumentLimitReached { max: usize },
    UnknownPartition(String),
    Sealing,
    Contract(ContractViolation),
    Simulated(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IsolationViolation { expected, got } => write!(
                f,
                "cross-tenant access denied: context tenant {expected}, query tenant {got}"
            ),
            Self::PartitionNotFound { tenant } => write!(
                f,
                "no partition found for tenant {tenant} covering the requested labels"
            ),
            Self::QueryTooLarge { len, max } => {
                write!(f, "query of {len} bytes exceeds the {max} byte limit")
            }
            Self::PartitionLimitReached { max } => {
                write!(f, "partition limit of {max} reached")
            }
            Self::DocumentLimitReached { max } => {
                write!(f, "document limit of {max} reached for partition")
            }
            Self::UnknownPartition(id) => write!(f, "unknown partition: {id}"),
            Self::Sealing => write!(f, "partition sealing operation failed"),
            Self::Contract(violation) => write!(f, "contract violation: {violation:?}"),
            Self::Simulated(message) => write!(f, "simulated failure: {message}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<ContractViolation> for GatewayError {
    fn from(value: ContractViolation) -> Self {
        Self::Contract(value)
    }
}

/// Symmetric partition key. Debug never prints key material.
#[derive(Clone)]
pub struct PartitionKey([u8; PARTITION_KEY_LEN]);

impl PartitionKey {
    fn generate() -> Self {
        let mut bytes = [0u8; PARTITION_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.0)
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionKey({})", self.fingerprint())
    }
}

/// Tenant + label isolation boundary with its own symmetric key. The key
/// signs receipts and seals the partition's documents at rest.
#[derive(Debug, Clone)]
pub struct RetrievalPartition {
    pub id: PartitionId,
    pub tenant: TenantId,
    pub labels: BTreeSet<String>,
    pub shard_id: String,
    pub access_policy: AccessPolicy,
    key: PartitionKey,
}

impl RetrievalPartition {
    pub fn key_bytes(&self) -> &[u8] {
        self.key.as_bytes()
    }

    pub fn key_fingerprint(&self) -> String {
        self.key.fingerprint()
    }

    fn covers(&self, query: &RetrievalQuery) -> bool {
        self.tenant == query.tenant
            && self.access_policy != AccessPolicy::Disabled
            && query.labels.iter().all(|label| self.labels.contains(label))
    }
}

#[derive(Debug, Clone)]
struct SealedDocument {
    doc_id: String,
    nonce_b64: String,
    ciphertext_b64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalRecord {
    pub doc_id: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalResult {
    pub partition_id: PartitionId,
    pub shard_id: String,
    pub records: Vec<RetrievalRecord>,
}

#[derive(Debug, Clone)]
pub struct QueryLogEntry {
    pub id: String,
    pub tenant: String,
    pub query_id: String,
    pub receipt_id: Option<String>,
    pub timestamp: UnixTimeMs,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    pub receipt_ttl_ms: u64,
    pub max_query_len: usize,
    pub max_partitions: usize,
    pub max_documents_per_partition: usize,
    pub query_log_capacity: usize,
}

impl GatewayConfig {
    pub fn mvp_v1() -> Self {
        Self {
            receipt_ttl_ms: 86_400_000,
            max_query_len: 10_000,
            max_partitions: 64,
            max_documents_per_partition: 256,
            query_log_capacity: 10_000,
        }
    }
}

/// Owns tenant partitions and issues a signed receipt for every retrieval.
/// Partition creation is not idempotent; callers must avoid duplicates.
#[derive(Debug)]
pub struct RetrievalGateway {
    config: GatewayConfig,
    partitions: BTreeMap<PartitionId, RetrievalPartition>,
    documents: BTreeMap<PartitionId, Vec<SealedDocument>>,
    next_shard: u64,
    query_log: VecDeque<QueryLogEntry>,
    stats: GatewayStats,
}

impl RetrievalGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            partitions: BTreeMap::new(),
            documents: BTreeMap::new(),
            next_shard: 0,
            query_log: VecDeque::new(),
            stats: GatewayStats::default(),
        }
    }

    pub fn create_partition(
        &mut self,
        tenant: TenantId,
        labels: BTreeSet<String>,
    ) -> Result<PartitionId, GatewayError> {
        if self.partitions.len() >= self.config.max_partitions {
            return Err(GatewayError::PartitionLimitReached {
                max: self.config.max_partitions,
            });
        }
        self.next_shard += 1;
        let shard_id = format!("shard-{}", self.next_shard);
        let id = PartitionId::new(opaque_ref("part", &[tenant.as_str(), &shard_id]))?;
        let partition = RetrievalPartition {
            id: id.clone(),
            tenant,
            labels,
            shard_id,
            access_policy: AccessPolicy::Standard,
            key: PartitionKey::generate(),
        };
        self.partitions.insert(id.clone(), partition);
        self.documents.insert(id.clone(), Vec::new());
        Ok(id)
    }

    pub fn set_access_policy(
        &mut self,
        partition_id: &PartitionId,
        policy: AccessPolicy,
    ) -> Result<(), GatewayError> {
        let partition = self
            .partitions
            .get_mut(partition_id)
            .ok_or_else(|| GatewayError::UnknownPartition(partition_id.as_str().to_string()))?;
        partition.access_policy = policy;
        Ok(())
    }

    /// Seal a document into a partition. Documents rest encrypted under the
    /// partition key and only unseal for queries scoped to that partition.
    pub fn ingest_document(
        &mut self,
        partition_id: &PartitionId,
        doc_id: String,
        body: &str,
    ) -> Result<(), GatewayError> {
        let partition = self
            .partitions
            .get(partition_id)
            .ok_or_else(|| GatewayError::UnknownPartition(partition_id.as_str().to_string()))?;
        let sealed = seal_document(partition.key.as_bytes(), doc_id, body)?;
        let docs = self
            .documents
            .get_mut(partition_id)
            .ok_or_else(|| GatewayError::UnknownPartition(partition_id.as_str().to_string()))?;
        if docs.len() >= self.config.max_documents_per_partition {
            return Err(GatewayError::DocumentLimitReached {
                max: self.config.max_documents_per_partition,
            });
        }
        docs.push(sealed);
        Ok(())
    }

    /// Execute one receipted retrieval. The tenant check runs before anything
    /// else and fails closed; nothing partial executes on a mismatch.
    pub fn execute_retrieval(
        &mut self,
        query: &RetrievalQuery,
        plan: &Plan,
        step_id: &PlanStepId,
        ctx: &ExecutionContext,
    ) -> Result<(RetrievalResult, SignedAccessReceipt), GatewayError> {
        let outcome = self.try_execute(query, plan, step_id, ctx);
        match &outcome {
            Ok((_, receipt)) => {
                self.record_query(query, ctx.timestamp, Some(receipt.id.clone()), None);
            }
            Err(error) => {
                self.record_query(query, ctx.timestamp, None, Some(error.to_string()));
            }
        }
        outcome
    }

    fn try_execute(
        &mut self,
        query: &RetrievalQuery,
        plan: &Plan,
        step_id: &PlanStepId,
        ctx: &ExecutionContext,
    ) -> Result<(RetrievalResult, SignedAccessReceipt), GatewayError> {
        query.validate()?;

        if query.tenant != ctx.tenant {
            return Err(GatewayError::IsolationViolation {
                expected: ctx.tenant.as_str().to_string(),
                got: query.tenant.as_str().to_string(),
            });
        }
        if plan.tenant != ctx.tenant {
            return Err(GatewayError::IsolationViolation {
                expected: ctx.tenant.as_str().to_string(),
                got: plan.tenant.as_str().to_string(),
            });
        }
        if query.query_text.len() > self.config.max_query_len {
            return Err(GatewayError::QueryTooLarge {
                len: query.query_text.len(),
                max: self.config.max_query_len,
            });
        }

        let partition = self
            .partitions
            .values()
            .find(|partition| partition.covers(query))
            .cloned()
            .ok_or_else(|| GatewayError::PartitionNotFound {
                tenant: query.tenant.as_str().to_string(),
            })?;

        let records = self.run_scoped_query(&partition, query)?;
        let result = RetrievalResult {
            partition_id: partition.id.clone(),
            shard_id: partition.shard_id.clone(),
            records,
        };

        let receipt = self.issue_receipt(query, plan, step_id, ctx, &partition, &result)?;
        Ok((result, receipt))
    }

    fn run_scoped_query(
        &self,
        partition: &RetrievalPartition,
        query: &RetrievalQuery,
    ) -> Result<Vec<RetrievalRecord>, GatewayError> {
        let docs = self
            .documents
            .get(&partition.id)
            .ok_or_else(|| GatewayError::UnknownPartition(partition.id.as_str().to_string()))?;
        let mut records = Vec::new();
        for sealed in docs {
            let body = unseal_document(partition.key.as_bytes(), sealed)?;
            if body.contains(&query.query_text) {
                records.push(RetrievalRecord {
                    doc_id: sealed.doc_id.clone(),
                    body,
                });
            }
        }
        Ok(records)
    }

    fn issue_receipt(
        &self,
        query: &RetrievalQuery,
        plan: &Plan,
        step_id: &PlanStepId,
        ctx: &ExecutionContext,
        partition: &RetrievalPartition,
        result: &RetrievalResult,
    ) -> Result<SignedAccessReceipt, GatewayError> {
        let result_json = serde_json::to_string(&result.records).map_err(|_| GatewayError::Sealing)?;
        let mut receipt = SignedAccessReceipt {
            schema_version: RECEIPT_CONTRACT_VERSION,
            id: opaque_ref(
                "rcpt",
                &[
                    plan.id.as_str(),
                    step_id.as_str(),
                    &query.query_id,
                    &ctx.request_id,
                ],
            ),
            plan_id: plan.id.clone(),
            plan_step_id: step_id.clone(),
            tenant: query.tenant.clone(),
            query_id: query.query_id.clone(),
            partition_id: partition.id.clone(),
            access_timestamp: ctx.timestamp,
            expires_at: ctx.timestamp.saturating_add_ms(self.config.receipt_ttl_ms),
            capabilities: query.capabilities.clone(),
            labels: query.labels.clone(),
            query_hash: sha256_b64(query.query_text.as_bytes()),
            result_hash: sha256_b64(result_json.as_bytes()),
            public_key: partition.key.fingerprint(),
            signature: String::new(),
        };
        receipt.signature = sign_payload(
            partition.key.as_bytes(),
            receipt.canonical_payload().as_bytes(),
        );
        receipt.validate()?;
        Ok(receipt)
    }

    /// Convenience check only: recomputes the signature and checks expiry.
    /// The authoritative verification lives in the Receipt Verifier.
    pub fn verify_access_receipt(&self, receipt: &SignedAccessReceipt, now: UnixTimeMs) -> bool {
        let Some(partition) = self.partitions.get(&receipt.partition_id) else {
            return false;
        };
        if now >= receipt.expires_at {
            return false;
        }
        signature_matches(
            partition.key.as_bytes(),
            receipt.canonical_payload().as_bytes(),
            &receipt.signature,
        )
    }

    pub fn partition(&self, id: &PartitionId) -> Option<&RetrievalPartition> {
        self.partitions.get(id)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn query_log(&self) -> impl Iterator<Item = &QueryLogEntry> {
        self.query_log.iter()
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats
    }

    fn record_query(
        &mut self,
        query: &RetrievalQuery,
        timestamp: UnixTimeMs,
        receipt_id: Option<String>,
        error: Option<String>,
    ) {
        let success = error.is_none();
        self.stats.total_queries += 1;
        if success {
            self.stats.successful_queries += 1;
        } else {
            self.stats.failed_queries += 1;
        }
        self.query_log.push_back(QueryLogEntry {
            id: opaque_ref(
                "qlog",
                &[
                    &query.query_id,
                    &timestamp.0.to_string(),
                    &self.stats.total_queries.to_string(),
                ],
            ),
            tenant: query.tenant.as_str().to_string(),
            query_id: query.query_id.clone(),
            receipt_id,
            timestamp,
            success,
            error,
        });
        while self.query_log.len() > self.config.query_log_capacity {
            self.query_log.pop_front();
        }
    }
}

fn seal_document(
    key: &[u8],
    doc_id: String,
    body: &str,
) -> Result<SealedDocument, GatewayError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| GatewayError::Sealing)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, body.as_bytes())
        .map_err(|_| GatewayError::Sealing)?;
    Ok(SealedDocument {
        doc_id,
        nonce_b64: BASE64.encode(nonce_bytes),
        ciphertext_b64: BASE64.encode(ciphertext),
    })
}

fn unseal_document(key: &[u8], sealed: &SealedDocument) -> Result<String, GatewayError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| GatewayError::Sealing)?;
    let nonce_bytes = BASE64
        .decode(&sealed.nonce_b64)
        .map_err(|_| GatewayError::Sealing)?;
    let ciphertext = BASE64
        .decode(&sealed.ciphertext_b64)
        .map_err(|_| GatewayError::Sealing)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| GatewayError::Sealing)?;
    String::from_utf8(plaintext).map_err(|_| GatewayError::Sealing)
}
