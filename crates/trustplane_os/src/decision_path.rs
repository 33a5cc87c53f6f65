#![forbid(unsafe_code)]

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use trustplane_engines::egress_firewall::{
    EgressError, EgressFilterResult, EgressFirewall, EGRESS_PATTERN_SET_VERSION,
};
use trustplane_engines::receipt_verifier::{
    PartitionDirectory, ReceiptVerifier, VerificationContext,
};
use trustplane_engines::retrieval_gateway::{
    GatewayError, RetrievalGateway, RetrievalResult,
};
use trustplane_engines::signing::{opaque_ref, sha256_b64, sign_payload};
use trustplane_kernel_contracts::context::{CancelToken, ExecutionContext, ExecutionMode};
use trustplane_kernel_contracts::egress::{EgressCertificate, EgressVerdict};
use trustplane_kernel_contracts::plan::{Plan, PlanStepId, StepKind};
use trustplane_kernel_contracts::retrieval::{RetrievalQuery, SignedAccessReceipt};
use trustplane_kernel_contracts::safety_case::{
    EvidenceHashes, SafetyCase, SafetyCaseVerdict, SAFETY_CASE_CONTRACT_VERSION,
};
use trustplane_kernel_contracts::trace::{
    DecisionPathStep, DecisionPathTrace, DecisionPhase, FinalStatus, PhaseStepStatus,
    TRACE_CONTRACT_VERSION,
};
use trustplane_kernel_contracts::{ContractViolation, UnixTimeMs, Validate};
use trustplane_storage::{
    CertificateRepo, InMemoryEvidenceStore, ReceiptRepo, SafetyCaseRepo, StorageError, TraceRepo,
};

use crate::evidence::{aggregate_plan_content, EvidenceBundle, ToolExecutionRecord};

const CONFIDENCE_PASSED: f32 = 0.95;
const CONFIDENCE_FLAGGED: f32 = 0.40;

/// Tool name that injects a deterministic failure into the tool broker.
pub const SIMULATED_FAILURE_TOOL: &str = "simulate_failure";

/// Retrieval seam the retrieve phase calls through. The gateway implements
/// it; tests substitute failing or tampering doubles.
pub trait RetrievalEngine: PartitionDirectory {
    fn execute_retrieval(
        &mut self,
        query: &RetrievalQuery,
        plan: &Plan,
        step_id: &PlanStepId,
        ctx: &ExecutionContext,
    ) -> Result<(RetrievalResult, SignedAccessReceipt), GatewayError>;
}

impl RetrievalEngine for RetrievalGateway {
    fn execute_retrieval(
        &mut self,
        query: &RetrievalQuery,
        plan: &Plan,
        step_id: &PlanStepId,
        ctx: &ExecutionContext,
    ) -> Result<(RetrievalResult, SignedAccessReceipt), GatewayError> {
        RetrievalGateway::execute_retrieval(self, query, plan, step_id, ctx)
    }
}

/// Egress seam the egress phase calls through.
pub trait EgressEngine {
    fn filter_content(
        &mut self,
        content: &str,
        plan: &Plan,
        policy_id: &str,
        now: UnixTimeMs,
    ) -> Result<EgressFilterResult, EgressError>;
}

impl EgressEngine for EgressFirewall {
    fn filter_content(
        &mut self,
        content: &str,
        plan: &Plan,
        policy_id: &str,
        now: UnixTimeMs,
    ) -> Result<EgressFilterResult, EgressError> {
        EgressFirewall::filter_content(self, content, plan, policy_id, now)
    }
}

#[derive(Debug)]
pub enum PhaseError {
    Cancelled,
    Gateway(GatewayError),
    Egress(EgressError),
    Contract(ContractViolation),
    PlanStructure { reason: String },
    KernelValidation { receipt_id: String, reason: String },
    ToolBroker { step_id: String, reason: String },
    Simulated(String),
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "phase cancelled by caller"),
            Self::Gateway(error) => write!(f, "{error}"),
            Self::Egress(error) => write!(f, "{error}"),
            Self::Contract(violation) => write!(f, "contract violation: {violation:?}"),
            Self::PlanStructure { reason } => write!(f, "plan structure invalid: {reason}"),
            Self::KernelValidation { receipt_id, reason } => {
                write!(f, "kernel rejected receipt {receipt_id}: {reason}")
            }
            Self::ToolBroker { step_id, reason } => {
                write!(f, "tool broker failed at step {step_id}: {reason}")
            }
            Self::Simulated(message) => write!(f, "simulated failure: {message}"),
        }
    }
}

impl std::error::Error for PhaseError {}

impl From<GatewayError> for PhaseError {
    fn from(value: GatewayError) -> Self {
        Self::Gateway(value)
    }
}

impl From<EgressError> for PhaseError {
    fn from(value: EgressError) -> Self {
        Self::Egress(value)
    }
}

impl From<ContractViolation> for PhaseError {
    fn from(value: ContractViolation) -> Self {
        Self::Contract(value)
    }
}

#[derive(Debug, Clone)]
pub struct DecisionPathConfig {
    pub egress_policy_id: String,
    pub case_signing_key: [u8; 32],
}

impl DecisionPathConfig {
    pub fn mvp_v1(case_signing_key: [u8; 32]) -> Self {
        Self {
            egress_policy_id: "egress/strict_v1".to_string(),
            case_signing_key,
        }
    }
}

/// Seven-phase decision-path orchestrator. Phases run strictly in order; a
/// phase failure records the error verbatim and aborts the remaining phases.
/// Evidence produced before a failure stays on the trace; nothing rolls back.
#[derive(Debug)]
pub struct DecisionPathEngine<G, F>
where
    G: RetrievalEngine,
    F: EgressEngine,
{
    config: DecisionPathConfig,
    gateway: G,
    firewall: F,
    verifier: ReceiptVerifier,
    store: InMemoryEvidenceStore,
}

impl<G, F> DecisionPathEngine<G, F>
where
    G: RetrievalEngine,
    F: EgressEngine,
{
    pub fn new(config: DecisionPathConfig, gateway: G, firewall: F, verifier: ReceiptVerifier) -> Self {
        Self {
            config,
            gateway,
            firewall,
            verifier,
            store: InMemoryEvidenceStore::new(),
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn firewall_mut(&mut self) -> &mut F {
        &mut self.firewall
    }

    pub fn verifier(&self) -> &ReceiptVerifier {
        &self.verifier
    }

    /// The sole entry point: runs a plan through all seven phases and returns
    /// the fully populated trace, completed or not. The only error surfaced
    /// here is an evidence-table write conflict.
    pub fn execute_decision_path(
        &mut self,
        plan: &Plan,
        ctx: &ExecutionContext,
        cancel: &CancelToken,
    ) -> Result<DecisionPathTrace, StorageError> {
        let run_started = Instant::now();
        let trace_id = opaque_ref(
            "trace",
            &[plan.id.as_str(), &ctx.session_id, &ctx.request_id],
        );
        let mut bundle = EvidenceBundle::new();
        let mut steps = Vec::new();
        let mut final_status = FinalStatus::Completed;

        for phase in DecisionPhase::ORDERED {
            let (step, outcome) =
                self.execute_phase(&trace_id, phase, plan, ctx, cancel, &mut bundle);
            steps.push(step);
            if let Err(error) = outcome {
                final_status = match error {
                    PhaseError::Cancelled => FinalStatus::Aborted,
                    _ => FinalStatus::Failed,
                };
                break;
            }
        }

        let total_duration_ms = run_started.elapsed().as_millis() as u64;
        let trace = DecisionPathTrace {
            schema_version: TRACE_CONTRACT_VERSION,
            trace_id,
            plan_id: plan.id.clone(),
            tenant: plan.tenant.clone(),
            session_id: ctx.session_id.clone(),
            steps,
            receipt_ids: bundle.receipt_ids(),
            certificate_ids: bundle.certificate_ids(),
            safety_case_ids: bundle.safety_case_ids(),
            final_status,
            started_at: ctx.timestamp,
            finished_at: ctx.timestamp.saturating_add_ms(total_duration_ms),
            total_duration_ms,
        };
        self.flush_evidence(&trace, bundle)?;
        Ok(trace)
    }

    pub fn get_trace(&self, trace_id: &str) -> Option<&DecisionPathTrace> {
        self.store.trace(trace_id)
    }

    pub fn get_safety_case(&self, case_id: &str) -> Option<&SafetyCase> {
        self.store.safety_case(case_id)
    }

    pub fn get_egress_certificate(&self, certificate_id: &str) -> Option<&EgressCertificate> {
        self.store.certificate(certificate_id)
    }

    pub fn get_retrieval_receipt(&self, receipt_id: &str) -> Option<&SignedAccessReceipt> {
        self.store.receipt(receipt_id)
    }

    /// Generic phase wrapper: input hash before dispatch, output hash and
    /// status after. The step record is finalized exactly once.
    fn execute_phase(
        &mut self,
        trace_id: &str,
        phase: DecisionPhase,
        plan: &Plan,
        ctx: &ExecutionContext,
        cancel: &CancelToken,
        bundle: &mut EvidenceBundle,
    ) -> (DecisionPathStep, Result<(), PhaseError>) {
        let input_hash = phase_input_hash(plan, ctx, phase);
        let step_id = opaque_ref("step", &[trace_id, phase.as_str()]);
        let started = Instant::now();

        let outcome = if cancel.is_cancelled() {
            Err(PhaseError::Cancelled)
        } else {
            self.dispatch(trace_id, phase, plan, ctx, bundle)
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => (
                DecisionPathStep {
                    id: step_id,
                    phase,
                    input_hash,
                    output_hash: Some(sha256_b64(output.as_bytes())),
                    status: PhaseStepStatus::Completed,
                    error: None,
                    duration_ms,
                },
                Ok(()),
            ),
            Err(error) => (
                DecisionPathStep {
                    id: step_id,
                    phase,
                    input_hash,
                    output_hash: None,
                    status: PhaseStepStatus::Failed,
                    error: Some(error.to_string()),
                    duration_ms,
                },
                Err(error),
            ),
        }
    }

    fn dispatch(
        &mut self,
        trace_id: &str,
        phase: DecisionPhase,
        plan: &Plan,
        ctx: &ExecutionContext,
        bundle: &mut EvidenceBundle,
    ) -> Result<String, PhaseError> {
        match phase {
            DecisionPhase::Observe => self.run_observe(plan, ctx),
            DecisionPhase::Retrieve => self.run_retrieve(plan, ctx, bundle),
            DecisionPhase::Plan => self.run_plan(plan, ctx),
            DecisionPhase::Kernel => self.run_kernel(plan, ctx, bundle),
            DecisionPhase::ToolBroker => self.run_tool_broker(plan, ctx, bundle),
            DecisionPhase::Egress => self.run_egress(plan, ctx, bundle),
            DecisionPhase::SafetyCase => self.run_safety_case(trace_id, plan, ctx, bundle),
        }
    }

    fn run_observe(&mut self, plan: &Plan, ctx: &ExecutionContext) -> Result<String, PhaseError> {
        ctx.validate()?;
        plan.validate()?;
        let output = ObserveOutput {
            tenant: ctx.tenant.as_str().to_string(),
            journey: plan.journey.clone(),
            step_count: plan.steps.len(),
            retrieval_steps: plan.retrieval_steps().count(),
            tool_steps: plan
                .steps
                .iter()
                .filter(|s| matches!(s.kind, StepKind::ToolCall { .. }))
                .count(),
            mode: ctx.mode.as_str(),
        };
        serialize_output(&output)
    }

    fn run_retrieve(
        &mut self,
        plan: &Plan,
        ctx: &ExecutionContext,
        bundle: &mut EvidenceBundle,
    ) -> Result<String, PhaseError> {
        let mut receipt_ids = Vec::new();
        let mut total_records = 0usize;
        let retrievals: Vec<(PlanStepId, RetrievalQuery)> = plan
            .retrieval_steps()
            .map(|(step, query)| (step.id.clone(), query.clone()))
            .collect();
        for (step_id, query) in retrievals {
            let (result, receipt) = self
                .gateway
                .execute_retrieval(&query, plan, &step_id, ctx)?;
            total_records += result.records.len();
            receipt_ids.push(receipt.id.clone());
            bundle.receipts.push(receipt);
        }
        serialize_output(&RetrieveOutput {
            receipt_ids,
            total_records,
        })
    }

    fn run_plan(&mut self, plan: &Plan, ctx: &ExecutionContext) -> Result<String, PhaseError> {
        if plan.steps.is_empty() {
            return Err(PhaseError::PlanStructure {
                reason: "plan has no steps".to_string(),
            });
        }
        let mut seen = std::collections::BTreeSet::new();
        for step in &plan.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(PhaseError::PlanStructure {
                    reason: format!("duplicate step id: {}", step.id.as_str()),
                });
            }
        }
        if ctx.timestamp > plan.expires_at {
            return Err(PhaseError::PlanStructure {
                reason: "plan expired before execution".to_string(),
            });
        }
        serialize_output(&PlanReviewOutput {
            step_count: plan.steps.len(),
            expires_at: plan.expires_at.0,
        })
    }

    /// Authoritative receipt re-verification. Verification failures are
    /// values; the kernel applies mode policy: enforce fails the phase,
    /// shadow records and keeps going.
    fn run_kernel(
        &mut self,
        plan: &Plan,
        ctx: &ExecutionContext,
        bundle: &mut EvidenceBundle,
    ) -> Result<String, PhaseError> {
        let mut results = Vec::new();
        let mut first_failure: Option<(String, String)> = None;
        for receipt in &bundle.receipts {
            let vctx = VerificationContext {
                plan_id: plan.id.clone(),
                plan_step_id: receipt.plan_step_id.clone(),
                tenant: ctx.tenant.clone(),
                user_id: ctx.user_id.clone(),
                now: ctx.timestamp,
            };
            let result = self.verifier.verify(receipt, &vctx, &self.gateway);
            if !result.valid && first_failure.is_none() {
                let reason = result
                    .reason
                    .clone()
                    .unwrap_or_else(|| "receipt verification failed".to_string());
                first_failure = Some((receipt.id.clone(), reason));
            }
            results.push(result);
            if first_failure.is_some() && ctx.mode == ExecutionMode::Enforce {
                break;
            }
        }
        let verified = results.len();
        let invalid = results.iter().filter(|r| !r.valid).count();
        bundle.verifications.append(&mut results);

        if let Some((receipt_id, reason)) = first_failure {
            if ctx.mode == ExecutionMode::Enforce {
                return Err(PhaseError::KernelValidation { receipt_id, reason });
            }
        }
        serialize_output(&KernelOutput { verified, invalid })
    }

    fn run_tool_broker(
        &mut self,
        plan: &Plan,
        ctx: &ExecutionContext,
        bundle: &mut EvidenceBundle,
    ) -> Result<String, PhaseError> {
        let mut records = Vec::new();
        for step in &plan.steps {
            let StepKind::ToolCall {
                tool, capability, ..
            } = &step.kind
            else {
                continue;
            };
            if tool == SIMULATED_FAILURE_TOOL {
                return Err(PhaseError::Simulated(format!(
                    "tool broker failure injected at step {}",
                    step.id.as_str()
                )));
            }
            if ctx.mode == ExecutionMode::Enforce && capability.is_none() {
                return Err(PhaseError::ToolBroker {
                    step_id: step.id.as_str().to_string(),
                    reason: "tool call carries no capability token".to_string(),
                });
            }
            // Tool execution is emulated; real side effects live outside the
            // core and never run in shadow mode.
            let record = ToolExecutionRecord {
                step_id: step.id.as_str().to_string(),
                tool: tool.clone(),
                result_ref: opaque_ref("toolres", &[step.id.as_str(), tool]),
            };
            records.push(record.clone());
            bundle.tool_results.push(record);
        }
        serialize_output(&ToolBrokerOutput {
            executed: records.len(),
            records,
        })
    }

    fn run_egress(
        &mut self,
        plan: &Plan,
        ctx: &ExecutionContext,
        bundle: &mut EvidenceBundle,
    ) -> Result<String, PhaseError> {
        let content = aggregate_plan_content(plan);
        let out = self.firewall.filter_content(
            &content,
            plan,
            &self.config.egress_policy_id,
            ctx.timestamp,
        )?;
        let output = EgressOutput {
            certificate_id: out.certificate.id.clone(),
            level: out.certificate.non_interference.level.as_str(),
            verdict: out.certificate.non_interference.verdict.as_str(),
            pii_count: out.certificate.summary.pii_count,
            secret_count: out.certificate.summary.secret_count,
        };
        bundle.filtered_content = Some(out.filtered_content);
        bundle.certificate = Some(out.certificate);
        serialize_output(&output)
    }

    fn run_safety_case(
        &mut self,
        trace_id: &str,
        plan: &Plan,
        ctx: &ExecutionContext,
        bundle: &mut EvidenceBundle,
    ) -> Result<String, PhaseError> {
        let certificate = bundle.certificate.as_ref().ok_or(PhaseError::PlanStructure {
            reason: "egress certificate missing before safety case".to_string(),
        })?;

        let plan_json = serialize_output(plan)?;
        let labels = bundle
            .receipt_labels()
            .into_iter()
            .collect::<Vec<_>>()
            .join(",");
        let evidence = EvidenceHashes {
            input_hash: sha256_b64(plan_json.as_bytes()),
            output_hash: sha256_b64(
                bundle
                    .filtered_content
                    .as_deref()
                    .unwrap_or_default()
                    .as_bytes(),
            ),
            receipts_hash: bundle.hash_receipts(),
            certificates_hash: bundle.hash_certificates(),
            policy_hash: sha256_b64(certificate.policy_applied.as_bytes()),
            proof_hash: certificate.non_interference.proof_hash.clone(),
            automata_hash: sha256_b64(EGRESS_PATTERN_SET_VERSION.as_bytes()),
            labeler_hash: sha256_b64(labels.as_bytes()),
        };

        let any_invalid_receipt = bundle.verifications.iter().any(|v| !v.valid);
        let verdict = if any_invalid_receipt
            || certificate.non_interference.verdict == EgressVerdict::Failed
        {
            SafetyCaseVerdict::Failed
        } else {
            SafetyCaseVerdict::Passed
        };
        let confidence = match verdict {
            SafetyCaseVerdict::Passed => CONFIDENCE_PASSED,
            SafetyCaseVerdict::Failed => CONFIDENCE_FLAGGED,
        };

        let mut case = SafetyCase {
            schema_version: SAFETY_CASE_CONTRACT_VERSION,
            id: opaque_ref("case", &[plan.id.as_str(), trace_id]),
            plan_id: plan.id.clone(),
            tenant: plan.tenant.clone(),
            evidence,
            verdict,
            confidence,
            signature: String::new(),
            issued_at: ctx.timestamp,
        };
        case.signature = sign_payload(
            &self.config.case_signing_key,
            case.canonical_payload().as_bytes(),
        );
        case.validate()?;

        let output = SafetyCaseOutput {
            safety_case_id: case.id.clone(),
            verdict: case.verdict.as_str(),
            confidence: case.confidence,
        };
        bundle.safety_case = Some(case);
        serialize_output(&output)
    }

    fn flush_evidence(
        &mut self,
        trace: &DecisionPathTrace,
        bundle: EvidenceBundle,
    ) -> Result<(), StorageError> {
        for receipt in bundle.receipts {
            self.store.insert_receipt(receipt)?;
        }
        if let Some(certificate) = bundle.certificate {
            self.store.insert_certificate(certificate)?;
        }
        if let Some(case) = bundle.safety_case {
            self.store.insert_safety_case(case)?;
        }
        self.store.insert_trace(trace.clone())
    }
}

fn phase_input_hash(plan: &Plan, ctx: &ExecutionContext, phase: DecisionPhase) -> String {
    let serialized = serde_json::to_string(&(plan, ctx, phase.as_str())).unwrap_or_default();
    sha256_b64(serialized.as_bytes())
}

fn serialize_output<T: Serialize>(value: &T) -> Result<String, PhaseError> {
    serde_json::to_string(value).map_err(|_| {
        PhaseError::Contract(ContractViolation::InvalidValue {
            field: "phase_output",
            reason: "must serialize",
        })
    })
}

#[derive(Serialize)]
struct ObserveOutput {
    tenant: String,
    journey: String,
    step_count: usize,
    retrieval_steps: usize,
    tool_steps: usize,
    mode: &'static str,
}

#[derive(Serialize)]
struct RetrieveOutput {
    receipt_ids: Vec<String>,
    total_records: usize,
}

#[derive(Serialize)]
struct PlanReviewOutput {
    step_count: usize,
    expires_at: u64,
}

#[derive(Serialize)]
struct KernelOutput {
    verified: usize,
    invalid: usize,
}

#[derive(Serialize)]
struct ToolBrokerOutput {
    executed: usize,
    records: Vec<ToolExecutionRecord>,
}

#[derive(Serialize)]
struct EgressOutput {
    certificate_id: String,
    level: &'static str,
    verdict: &'static str,
    pii_count: u32,
    secret_count: u32,
}

#[derive(Serialize)]
struct SafetyCaseOutput {
    safety_case_id: String,
    verdict: &'static str,
    confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use trustplane_engines::egress_firewall::FirewallConfig;
    use trustplane_engines::receipt_verifier::VerifierConfig;
    use trustplane_engines::retrieval_gateway::GatewayConfig;
    use trustplane_kernel_contracts::plan::{
        ParamValue, PlanId, PlanStep, StepStatus, TenantId,
    };
    use trustplane_kernel_contracts::retrieval::{Capability, PartitionId};
    use trustplane_engines::retrieval_gateway::RetrievalPartition;

    const SIGNING_KEY: [u8; 32] = [11u8; 32];

    fn tenant() -> TenantId {
        TenantId::new("tenant_acme").unwrap()
    }

    fn retrieval_query() -> RetrievalQuery {
        RetrievalQuery::v1(
            "q_employees".to_string(),
            tenant(),
            BTreeSet::from(["hr".to_string()]),
            "employees".to_string(),
            BTreeSet::from([Capability::Read]),
        )
        .unwrap()
    }

    fn sample_plan() -> Plan {
        let retrieval = PlanStep::v1(
            PlanStepId::new("step_retrieve").unwrap(),
            StepKind::Retrieval {
                query: retrieval_query(),
            },
            StepStatus::Pending,
            UnixTimeMs(1_000),
            BTreeMap::new(),
        )
        .unwrap();
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "subject".to_string(),
            ParamValue::Text("quarterly roster update".to_string()),
        );
        let tool_call = PlanStep::v1(
            PlanStepId::new("step_notify").unwrap(),
            StepKind::ToolCall {
                tool: "send_summary".to_string(),
                parameters,
                capability: Some("cap/notify:send".to_string()),
            },
            StepStatus::Pending,
            UnixTimeMs(1_000),
            BTreeMap::new(),
        )
        .unwrap();
        Plan::v1(
            PlanId::new("plan_roster").unwrap(),
            tenant(),
            "journey/roster".to_string(),
            vec![retrieval, tool_call],
            BTreeMap::new(),
            UnixTimeMs(1_000),
            UnixTimeMs(10_000_000),
        )
        .unwrap()
    }

    fn sample_ctx(mode: ExecutionMode, request_id: &str) -> ExecutionContext {
        ExecutionContext::v1(
            tenant(),
            Some("user_1".to_string()),
            "session_1".to_string(),
            request_id.to_string(),
            UnixTimeMs(5_000),
            mode,
            BTreeMap::new(),
        )
        .unwrap()
    }

    fn engine_with_partition() -> DecisionPathEngine<RetrievalGateway, EgressFirewall> {
        let mut gateway = RetrievalGateway::new(GatewayConfig::mvp_v1());
        gateway
            .create_partition(tenant(), BTreeSet::from(["hr".to_string()]))
            .unwrap();
        DecisionPathEngine::new(
            DecisionPathConfig::mvp_v1(SIGNING_KEY),
            gateway,
            EgressFirewall::new(FirewallConfig::mvp_v1()),
            ReceiptVerifier::new(VerifierConfig::mvp_v1()),
        )
    }

    struct FailingFirewall;

    impl EgressEngine for FailingFirewall {
        fn filter_content(
            &mut self,
            _content: &str,
            _plan: &Plan,
            _policy_id: &str,
            _now: UnixTimeMs,
        ) -> Result<EgressFilterResult, EgressError> {
            Err(EgressError::Simulated("egress refused".to_string()))
        }
    }

    /// Delegates to a real gateway but corrupts every receipt signature, so
    /// the kernel phase sees verification failures.
    struct TamperingGateway {
        inner: RetrievalGateway,
    }

    impl PartitionDirectory for TamperingGateway {
        fn partition(&self, id: &PartitionId) -> Option<&RetrievalPartition> {
            self.inner.partition(id)
        }
    }

    impl RetrievalEngine for TamperingGateway {
        fn execute_retrieval(
            &mut self,
            query: &RetrievalQuery,
            plan: &Plan,
            step_id: &PlanStepId,
            ctx: &ExecutionContext,
        ) -> Result<(RetrievalResult, SignedAccessReceipt), GatewayError> {
            let (result, mut receipt) = self.inner.execute_retrieval(query, plan, step_id, ctx)?;
            receipt.signature = "Zm9yZ2Vk".to_string();
            Ok((result, receipt))
        }
    }

    #[test]
    fn at_path_01_happy_path_produces_full_evidence_chain() {
        let mut engine = engine_with_partition();
        let trace = engine
            .execute_decision_path(
                &sample_plan(),
                &sample_ctx(ExecutionMode::Enforce, "request_1"),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(trace.final_status, FinalStatus::Completed);
        assert_eq!(trace.steps.len(), 7);
        assert!(trace
            .steps
            .iter()
            .all(|s| s.status == PhaseStepStatus::Completed));
        assert_eq!(trace.receipt_ids.len(), 1);
        assert_eq!(trace.certificate_ids.len(), 1);
        assert_eq!(trace.safety_case_ids.len(), 1);
    }

    #[test]
    fn at_path_02_phases_run_in_declared_order() {
        let mut engine = engine_with_partition();
        let trace = engine
            .execute_decision_path(
                &sample_plan(),
                &sample_ctx(ExecutionMode::Enforce, "request_2"),
                &CancelToken::new(),
            )
            .unwrap();
        let phases: Vec<DecisionPhase> = trace.steps.iter().map(|s| s.phase).collect();
        assert_eq!(phases, DecisionPhase::ORDERED.to_vec());
        assert!(trace
            .steps
            .iter()
            .all(|s| !s.input_hash.is_empty() && s.output_hash.is_some()));
    }

    #[test]
    fn at_path_03_egress_failure_aborts_but_keeps_receipts() {
        let mut gateway = RetrievalGateway::new(GatewayConfig::mvp_v1());
        gateway
            .create_partition(tenant(), BTreeSet::from(["hr".to_string()]))
            .unwrap();
        let mut engine = DecisionPathEngine::new(
            DecisionPathConfig::mvp_v1(SIGNING_KEY),
            gateway,
            FailingFirewall,
            ReceiptVerifier::new(VerifierConfig::mvp_v1()),
        );
        let trace = engine
            .execute_decision_path(
                &sample_plan(),
                &sample_ctx(ExecutionMode::Enforce, "request_3"),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(trace.final_status, FinalStatus::Failed);
        assert_eq!(trace.certificate_ids.len(), 0);
        assert_eq!(trace.safety_case_ids.len(), 0);
        assert_eq!(trace.receipt_ids.len(), 1);
        let egress_step = trace.steps.last().unwrap();
        assert_eq!(egress_step.phase, DecisionPhase::Egress);
        assert_eq!(egress_step.status, PhaseStepStatus::Failed);
        assert_eq!(
            egress_step.error.as_deref(),
            Some("simulated failure: egress refused")
        );
    }

    #[test]
    fn at_path_04_cross_tenant_plan_fails_in_retrieve_phase() {
        let mut engine = engine_with_partition();
        let mut ctx = sample_ctx(ExecutionMode::Enforce, "request_4");
        ctx.tenant = TenantId::new("tenant_globex").unwrap();
        let trace = engine
            .execute_decision_path(&sample_plan(), &ctx, &CancelToken::new())
            .unwrap();

        assert_eq!(trace.final_status, FinalStatus::Failed);
        assert_eq!(trace.steps.len(), 2);
        assert_eq!(trace.steps[0].status, PhaseStepStatus::Completed);
        let retrieve = &trace.steps[1];
        assert_eq!(retrieve.phase, DecisionPhase::Retrieve);
        assert!(retrieve
            .error
            .as_deref()
            .unwrap()
            .contains("cross-tenant access denied"));
        assert!(trace.receipt_ids.is_empty());
    }

    #[test]
    fn at_path_05_cancellation_aborts_current_phase() {
        let mut engine = engine_with_partition();
        let cancel = CancelToken::new();
        cancel.cancel();
        let trace = engine
            .execute_decision_path(
                &sample_plan(),
                &sample_ctx(ExecutionMode::Enforce, "request_5"),
                &cancel,
            )
            .unwrap();
        assert_eq!(trace.final_status, FinalStatus::Aborted);
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(
            trace.steps[0].error.as_deref(),
            Some("phase cancelled by caller")
        );
    }

    #[test]
    fn at_path_06_tampered_receipt_fails_kernel_in_enforce_mode() {
        let mut inner = RetrievalGateway::new(GatewayConfig::mvp_v1());
        inner
            .create_partition(tenant(), BTreeSet::from(["hr".to_string()]))
            .unwrap();
        let mut engine = DecisionPathEngine::new(
            DecisionPathConfig::mvp_v1(SIGNING_KEY),
            TamperingGateway { inner },
            EgressFirewall::new(FirewallConfig::mvp_v1()),
            ReceiptVerifier::new(VerifierConfig::mvp_v1()),
        );
        let trace = engine
            .execute_decision_path(
                &sample_plan(),
                &sample_ctx(ExecutionMode::Enforce, "request_6"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(trace.final_status, FinalStatus::Failed);
        let kernel = trace.steps.last().unwrap();
        assert_eq!(kernel.phase, DecisionPhase::Kernel);
        assert!(kernel
            .error
            .as_deref()
            .unwrap()
            .contains("Receipt signature is invalid"));
        assert_eq!(engine.verifier().audit_len(), 1);
    }

    #[test]
    fn at_path_07_tampered_receipt_is_recorded_only_in_shadow_mode() {
        let mut inner = RetrievalGateway::new(GatewayConfig::mvp_v1());
        inner
            .create_partition(tenant(), BTreeSet::from(["hr".to_string()]))
            .unwrap();
        let mut engine = DecisionPathEngine::new(
            DecisionPathConfig::mvp_v1(SIGNING_KEY),
            TamperingGateway { inner },
            EgressFirewall::new(FirewallConfig::mvp_v1()),
            ReceiptVerifier::new(VerifierConfig::mvp_v1()),
        );
        let trace = engine
            .execute_decision_path(
                &sample_plan(),
                &sample_ctx(ExecutionMode::Shadow, "request_7"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(trace.final_status, FinalStatus::Completed);
        assert_eq!(trace.safety_case_ids.len(), 1);
        let case = engine.get_safety_case(&trace.safety_case_ids[0]).unwrap();
        assert_eq!(case.verdict, SafetyCaseVerdict::Failed);
    }

    #[test]
    fn at_path_08_simulated_tool_failure_aborts_before_egress() {
        let mut engine = engine_with_partition();
        let mut plan = sample_plan();
        plan.steps[1].kind = StepKind::ToolCall {
            tool: SIMULATED_FAILURE_TOOL.to_string(),
            parameters: BTreeMap::new(),
            capability: Some("cap/test".to_string()),
        };
        let trace = engine
            .execute_decision_path(
                &plan,
                &sample_ctx(ExecutionMode::Enforce, "request_8"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(trace.final_status, FinalStatus::Failed);
        let broker = trace.steps.last().unwrap();
        assert_eq!(broker.phase, DecisionPhase::ToolBroker);
        assert!(broker.error.as_deref().unwrap().contains("simulated failure"));
        assert_eq!(trace.certificate_ids.len(), 0);
    }

    #[test]
    fn at_path_09_getters_resolve_flushed_evidence() {
        let mut engine = engine_with_partition();
        let trace = engine
            .execute_decision_path(
                &sample_plan(),
                &sample_ctx(ExecutionMode::Enforce, "request_9"),
                &CancelToken::new(),
            )
            .unwrap();
        assert!(engine.get_trace(&trace.trace_id).is_some());
        assert!(engine.get_retrieval_receipt(&trace.receipt_ids[0]).is_some());
        assert!(engine
            .get_egress_certificate(&trace.certificate_ids[0])
            .is_some());
        assert!(engine.get_safety_case(&trace.safety_case_ids[0]).is_some());
    }

    #[test]
    fn at_path_10_safety_case_signature_covers_evidence() {
        let mut engine = engine_with_partition();
        let trace = engine
            .execute_decision_path(
                &sample_plan(),
                &sample_ctx(ExecutionMode::Enforce, "request_10"),
                &CancelToken::new(),
            )
            .unwrap();
        let case = engine.get_safety_case(&trace.safety_case_ids[0]).unwrap();
        let expected = sign_payload(&SIGNING_KEY, case.canonical_payload().as_bytes());
        assert_eq!(case.signature, expected);
        assert_eq!(case.plan_id.as_str(), "plan_roster");
    }

    #[test]
    fn at_path_11_missing_capability_blocks_tool_in_enforce_only() {
        let mut plan = sample_plan();
        plan.steps[1].kind = StepKind::ToolCall {
            tool: "send_summary".to_string(),
            parameters: BTreeMap::new(),
            capability: None,
        };

        let mut engine = engine_with_partition();
        let trace = engine
            .execute_decision_path(
                &plan,
                &sample_ctx(ExecutionMode::Enforce, "request_11"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(trace.final_status, FinalStatus::Failed);
        assert_eq!(trace.steps.last().unwrap().phase, DecisionPhase::ToolBroker);

        let mut shadow_engine = engine_with_partition();
        let trace = shadow_engine
            .execute_decision_path(
                &plan,
                &sample_ctx(ExecutionMode::Shadow, "request_11"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(trace.final_status, FinalStatus::Completed);
    }
}
