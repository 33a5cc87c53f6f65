use std::collections::{BTreeMap, BTreeSet};

use trustplane_engines::egress_firewall::{EgressFirewall, EgressPolicy, FirewallConfig};
use trustplane_engines::receipt_verifier::{ReceiptVerifier, VerifierConfig};
use trustplane_engines::retrieval_gateway::{GatewayConfig, RetrievalGateway};
use trustplane_kernel_contracts::context::{CancelToken, ExecutionContext, ExecutionMode};
use trustplane_kernel_contracts::egress::EgressVerdict;
use trustplane_kernel_contracts::plan::{
    ParamValue, Plan, PlanId, PlanStep, PlanStepId, StepKind, StepStatus, TenantId,
};
use trustplane_kernel_contracts::retrieval::{Capability, RetrievalQuery};
use trustplane_kernel_contracts::safety_case::SafetyCaseVerdict;
use trustplane_kernel_contracts::trace::FinalStatus;
use trustplane_kernel_contracts::UnixTimeMs;
use trustplane_os::decision_path::{DecisionPathConfig, DecisionPathEngine};

const SIGNING_KEY: [u8; 32] = [42u8; 32];

fn tenant(name: &str) -> TenantId {
    TenantId::new(name).unwrap()
}

fn plan_with_contact_details(plan_id: &str) -> Plan {
    let query = RetrievalQuery::v1(
        "q_roster".to_string(),
        tenant("tenant_acme"),
        BTreeSet::from(["hr".to_string()]),
        "roster".to_string(),
        BTreeSet::from([Capability::Read, Capability::Search]),
    )
    .unwrap();
    let retrieval = PlanStep::v1(
        PlanStepId::new("step_lookup").unwrap(),
        StepKind::Retrieval { query },
        StepStatus::Pending,
        UnixTimeMs(1_000),
        BTreeMap::new(),
    )
    .unwrap();
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "body".to_string(),
        ParamValue::Text("Contact me at alice@example.com or call 555-123-4567".to_string()),
    );
    let tool_call = PlanStep::v1(
        PlanStepId::new("step_send").unwrap(),
        StepKind::ToolCall {
            tool: "send_digest".to_string(),
            parameters,
            capability: Some("cap/digest:send".to_string()),
        },
        StepStatus::Pending,
        UnixTimeMs(1_000),
        BTreeMap::new(),
    )
    .unwrap();
    Plan::v1(
        PlanId::new(plan_id).unwrap(),
        tenant("tenant_acme"),
        "journey/digest".to_string(),
        vec![retrieval, tool_call],
        BTreeMap::new(),
        UnixTimeMs(1_000),
        UnixTimeMs(10_000_000),
    )
    .unwrap()
}

fn ctx(request_id: &str) -> ExecutionContext {
    ExecutionContext::v1(
        tenant("tenant_acme"),
        Some("user_ops".to_string()),
        "session_e2e".to_string(),
        request_id.to_string(),
        UnixTimeMs(50_000),
        ExecutionMode::Enforce,
        BTreeMap::new(),
    )
    .unwrap()
}

fn build_engine() -> DecisionPathEngine<RetrievalGateway, EgressFirewall> {
    let mut gateway = RetrievalGateway::new(GatewayConfig::mvp_v1());
    let partition = gateway
        .create_partition(
            tenant("tenant_acme"),
            BTreeSet::from(["hr".to_string(), "payroll".to_string()]),
        )
        .unwrap();
    gateway
        .ingest_document(&partition, "doc_roster".to_string(), "roster of employees")
        .unwrap();
    gateway
        .ingest_document(&partition, "doc_budget".to_string(), "payroll budget")
        .unwrap();
    DecisionPathEngine::new(
        DecisionPathConfig::mvp_v1(SIGNING_KEY),
        gateway,
        EgressFirewall::new(FirewallConfig::mvp_v1()),
        ReceiptVerifier::new(VerifierConfig::mvp_v1()),
    )
}

#[test]
fn e2e_01_full_chain_with_pii_redaction() {
    let mut engine = build_engine();
    let plan = plan_with_contact_details("plan_digest");
    let trace = engine
        .execute_decision_path(&plan, &ctx("request_e2e_1"), &CancelToken::new())
        .unwrap();

    assert_eq!(trace.final_status, FinalStatus::Completed);
    assert_eq!(trace.receipt_ids.len(), 1);
    assert_eq!(trace.certificate_ids.len(), 1);
    assert_eq!(trace.safety_case_ids.len(), 1);

    // The retrieval hit the sealed roster document.
    let receipt = engine.get_retrieval_receipt(&trace.receipt_ids[0]).unwrap();
    assert_eq!(receipt.tenant.as_str(), "tenant_acme");
    assert_eq!(receipt.plan_id.as_str(), "plan_digest");
    assert!(engine
        .gateway()
        .verify_access_receipt(receipt, UnixTimeMs(60_000)));

    // The tool-call body carried an email and a phone number; both were
    // detected, so the certificate fails the non-interference verdict even
    // though the content went out redacted.
    let certificate = engine
        .get_egress_certificate(&trace.certificate_ids[0])
        .unwrap();
    assert_eq!(certificate.summary.pii_count, 2);
    assert_eq!(certificate.non_interference.verdict, EgressVerdict::Failed);

    let case = engine.get_safety_case(&trace.safety_case_ids[0]).unwrap();
    assert_eq!(case.verdict, SafetyCaseVerdict::Failed);
    assert_eq!(case.evidence.proof_hash, certificate.non_interference.proof_hash);
}

#[test]
fn e2e_02_distinct_plans_keep_distinct_evidence() {
    let mut engine = build_engine();
    let trace_a = engine
        .execute_decision_path(
            &plan_with_contact_details("plan_a"),
            &ctx("request_a"),
            &CancelToken::new(),
        )
        .unwrap();
    let trace_b = engine
        .execute_decision_path(
            &plan_with_contact_details("plan_b"),
            &ctx("request_b"),
            &CancelToken::new(),
        )
        .unwrap();

    assert_ne!(trace_a.trace_id, trace_b.trace_id);
    assert_ne!(trace_a.receipt_ids[0], trace_b.receipt_ids[0]);
    assert_ne!(trace_a.safety_case_ids[0], trace_b.safety_case_ids[0]);

    let case_a = engine.get_safety_case(&trace_a.safety_case_ids[0]).unwrap();
    let case_b = engine.get_safety_case(&trace_b.safety_case_ids[0]).unwrap();
    assert_eq!(case_a.plan_id.as_str(), "plan_a");
    assert_eq!(case_b.plan_id.as_str(), "plan_b");
}

#[test]
fn e2e_03_never_reveal_policy_applies_to_plan_content() {
    let mut gateway = RetrievalGateway::new(GatewayConfig::mvp_v1());
    gateway
        .create_partition(tenant("tenant_acme"), BTreeSet::from(["hr".to_string()]))
        .unwrap();
    let mut firewall = EgressFirewall::new(FirewallConfig::mvp_v1());
    let mut term_policy = EgressPolicy::strict_v1();
    term_policy.id = "egress/terms".to_string();
    term_policy.never_reveal = vec!["aurora".to_string()];
    firewall.register_policy(term_policy);
    let mut config = DecisionPathConfig::mvp_v1(SIGNING_KEY);
    config.egress_policy_id = "egress/terms".to_string();
    let mut engine = DecisionPathEngine::new(
        config,
        gateway,
        firewall,
        ReceiptVerifier::new(VerifierConfig::mvp_v1()),
    );

    let mut parameters = BTreeMap::new();
    parameters.insert(
        "note".to_string(),
        ParamValue::Text("Project Aurora status update".to_string()),
    );
    let step = PlanStep::v1(
        PlanStepId::new("step_note").unwrap(),
        StepKind::ToolCall {
            tool: "post_note".to_string(),
            parameters,
            capability: Some("cap/notes:post".to_string()),
        },
        StepStatus::Pending,
        UnixTimeMs(1_000),
        BTreeMap::new(),
    )
    .unwrap();
    let plan = Plan::v1(
        PlanId::new("plan_note").unwrap(),
        tenant("tenant_acme"),
        "journey/notes".to_string(),
        vec![step],
        BTreeMap::new(),
        UnixTimeMs(1_000),
        UnixTimeMs(10_000_000),
    )
    .unwrap();

    let trace = engine
        .execute_decision_path(&plan, &ctx("request_terms"), &CancelToken::new())
        .unwrap();
    assert_eq!(trace.final_status, FinalStatus::Completed);
    let certificate = engine
        .get_egress_certificate(&trace.certificate_ids[0])
        .unwrap();
    assert_eq!(certificate.summary.blocked_spans, 1);
    assert_eq!(certificate.policy_applied, "egress/terms");
}

#[test]
fn e2e_04_failed_trace_is_fully_auditable() {
    let mut engine = build_engine();
    let mut plan = plan_with_contact_details("plan_doomed");
    plan.steps[1].kind = StepKind::ToolCall {
        tool: "simulate_failure".to_string(),
        parameters: BTreeMap::new(),
        capability: Some("cap/test".to_string()),
    };
    let trace = engine
        .execute_decision_path(&plan, &ctx("request_doomed"), &CancelToken::new())
        .unwrap();

    assert_eq!(trace.final_status, FinalStatus::Failed);
    // Receipts earned before the failure remain on the trace and in storage.
    assert_eq!(trace.receipt_ids.len(), 1);
    assert!(engine.get_retrieval_receipt(&trace.receipt_ids[0]).is_some());
    assert!(trace.certificate_ids.is_empty());
    assert!(trace.safety_case_ids.is_empty());

    let stored = engine.get_trace(&trace.trace_id).unwrap();
    assert_eq!(stored.steps.len(), 5);
    assert!(stored.steps.last().unwrap().error.is_some());
}
