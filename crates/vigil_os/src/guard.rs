#![forbid(unsafe_code)]

use serde::Serialize;

use vigil_contracts::guard::{GuardRefuse, GuardRequest, GuardResponse};
use vigil_contracts::{ContractViolation, Validate};
use vigil_engine::GuardRuntime;

pub mod reason_codes {
    use vigil_contracts::ReasonCodeId;

    // GUARD OS wiring reason-code namespace. Values are placeholders until registry lock.
    pub const GUARD_OS_INPUT_SCHEMA_INVALID: ReasonCodeId = ReasonCodeId(0x4744_0101);
    pub const GUARD_OS_INTERNAL_PIPELINE_ERROR: ReasonCodeId = ReasonCodeId(0x4744_01F1);
    pub const GUARD_OS_RESPONSE_CAPABILITY_MISMATCH: ReasonCodeId = ReasonCodeId(0x4744_01F2);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardWiringConfig {
    pub guard_enabled: bool,
}

impl GuardWiringConfig {
    pub fn mvp_v1(guard_enabled: bool) -> Self {
        Self { guard_enabled }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardWiringOutcome {
    /// The guard is switched off; callers must route to a manual-only
    /// workflow instead of treating this as approval.
    NotInvokedDisabled,
    Refused(GuardRefuse),
    Forwarded(GuardResponse),
}

pub trait GuardEngine {
    fn run(&self, req: &GuardRequest) -> GuardResponse;
}

impl GuardEngine for GuardRuntime {
    fn run(&self, req: &GuardRequest) -> GuardResponse {
        GuardRuntime::run(self, req)
    }
}

/// The single choke point between recommenders and caregivers: every dose
/// proposal passes through here, and anything that fails contract validation
/// on the way in or out is refused rather than forwarded.
#[derive(Debug, Clone)]
pub struct GuardWiring<E>
where
    E: GuardEngine,
{
    config: GuardWiringConfig,
    engine: E,
}

impl<E> GuardWiring<E>
where
    E: GuardEngine,
{
    pub fn new(config: GuardWiringConfig, engine: E) -> Self {
        Self { config, engine }
    }

    pub fn run(&self, req: &GuardRequest) -> Result<GuardWiringOutcome, ContractViolation> {
        if !self.config.guard_enabled {
            return Ok(GuardWiringOutcome::NotInvokedDisabled);
        }

        if req.validate().is_err() {
            return Ok(GuardWiringOutcome::Refused(GuardRefuse::v1(
                req.capability_id(),
                reason_codes::GUARD_OS_INPUT_SCHEMA_INVALID,
                "guard request failed contract validation".to_string(),
            )?));
        }

        let response = self.engine.run(req);
        if response.validate().is_err() {
            return Ok(GuardWiringOutcome::Refused(GuardRefuse::v1(
                req.capability_id(),
                reason_codes::GUARD_OS_INTERNAL_PIPELINE_ERROR,
                "guard engine response failed contract validation".to_string(),
            )?));
        }

        if !response_matches_request(req, &response) {
            return Ok(GuardWiringOutcome::Refused(GuardRefuse::v1(
                req.capability_id(),
                reason_codes::GUARD_OS_RESPONSE_CAPABILITY_MISMATCH,
                "guard engine response capability mismatched request".to_string(),
            )?));
        }

        match response {
            GuardResponse::Refuse(refuse) => Ok(GuardWiringOutcome::Refused(refuse)),
            out => Ok(GuardWiringOutcome::Forwarded(out)),
        }
    }
}

fn response_matches_request(req: &GuardRequest, response: &GuardResponse) -> bool {
    match (req, response) {
        (GuardRequest::DoseEvaluate(_), GuardResponse::Verdict(_)) => true,
        (GuardRequest::RuleMeshDescribe(_), GuardResponse::RuleMeshDescribeOk(_)) => true,
        (_, GuardResponse::Refuse(refuse)) => refuse.capability_id == req.capability_id(),
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize)]
struct GuardAuditRecord<'a> {
    request: &'a GuardRequest,
    response: &'a GuardResponse,
}

/// One self-describing (request, response) tuple for an external audit
/// collaborator. The wiring never persists anything itself.
pub fn audit_json(
    request: &GuardRequest,
    response: &GuardResponse,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&GuardAuditRecord { request, response })
}
