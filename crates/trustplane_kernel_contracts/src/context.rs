#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::plan::TenantId;
use crate::{validate_token, ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const CONTEXT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Enforce blocks on policy violations; shadow records them and keeps going.
/// The flag is produced by the calling gateway, never by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    Enforce,
    Shadow,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Enforce => "enforce",
            ExecutionMode::Shadow => "shadow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub schema_version: SchemaVersion,
    pub tenant: TenantId,
    pub user_id: Option<String>,
    pub session_id: String,
    pub request_id: String,
    pub timestamp: UnixTimeMs,
    pub mode: ExecutionMode,
    pub metadata: BTreeMap<String, String>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        tenant: TenantId,
        user_id: Option<String>,
        session_id: String,
        request_id: String,
        timestamp: UnixTimeMs,
        mode: ExecutionMode,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self, ContractViolation> {
        let context = Self {
            schema_version: CONTEXT_CONTRACT_VERSION,
            tenant,
            user_id,
            session_id,
            request_id,
            timestamp,
            mode,
            metadata,
        };
        context.validate()?;
        Ok(context)
    }
}

impl Validate for ExecutionContext {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CONTEXT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "execution_context.schema_version",
                reason: "must match CONTEXT_CONTRACT_VERSION",
            });
        }
        self.tenant.validate()?;
        if let Some(user_id) = &self.user_id {
            validate_token("execution_context.user_id", user_id, 96)?;
        }
        validate_token("execution_context.session_id", &self.session_id, 96)?;
        validate_token("execution_context.request_id", &self.request_id, 96)?;
        if self.timestamp.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "execution_context.timestamp",
                reason: "must be > 0",
            });
        }
        if self.metadata.len() > 32 {
            return Err(ContractViolation::InvalidValue {
                field: "execution_context.metadata",
                reason: "must contain <= 32 entries",
            });
        }
        for key in self.metadata.keys() {
            validate_token("execution_context.metadata.key", key, 64)?;
        }
        Ok(())
    }
}

/// Cooperative cancellation handle threaded through every phase call. A
/// cancelled token fails the current phase the same way a phase error does.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
