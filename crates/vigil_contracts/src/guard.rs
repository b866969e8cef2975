#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_finite_non_negative;
use crate::{ContractViolation, CorrelationId, ReasonCodeId, SchemaVersion, Validate};

pub const GUARD_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardCapabilityId {
    DoseEvaluate,
    RuleMeshDescribe,
}

impl GuardCapabilityId {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardCapabilityId::DoseEvaluate => "GUARD_DOSE_EVALUATE",
            GuardCapabilityId::RuleMeshDescribe => "GUARD_RULE_MESH_DESCRIBE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictStatus {
    Approved,
    Blocked,
}

impl VerdictStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictStatus::Approved => "APPROVED",
            VerdictStatus::Blocked => "BLOCKED",
        }
    }
}

/// Identifier of the terminal rule in the guard mesh. Order of declaration
/// matches evaluation precedence; `StandardRange` is the no-rule-fired leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleId {
    HypoglycemiaBlock,
    MaxDoseCeiling,
    StackingBlock,
    SustainedHyperglycemiaAdvisory,
    StandardRange,
}

impl RuleId {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleId::HypoglycemiaBlock => "HYPOGLYCEMIA_BLOCK",
            RuleId::MaxDoseCeiling => "MAX_DOSE_CEILING",
            RuleId::StackingBlock => "STACKING_BLOCK",
            RuleId::SustainedHyperglycemiaAdvisory => "SUSTAINED_HYPERGLYCEMIA_ADVISORY",
            RuleId::StandardRange => "STANDARD_RANGE",
        }
    }

    /// True for rules whose terminal decision is a Blocked verdict.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            RuleId::HypoglycemiaBlock | RuleId::MaxDoseCeiling | RuleId::StackingBlock
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardRequestEnvelope {
    pub schema_version: SchemaVersion,
    pub correlation_id: CorrelationId,
}

impl GuardRequestEnvelope {
    pub fn v1(correlation_id: CorrelationId) -> Result<Self, ContractViolation> {
        let env = Self {
            schema_version: GUARD_CONTRACT_VERSION,
            correlation_id,
        };
        env.validate()?;
        Ok(env)
    }
}

impl Validate for GuardRequestEnvelope {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != GUARD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "guard_request_envelope.schema_version",
                reason: "must match GUARD_CONTRACT_VERSION",
            });
        }
        self.correlation_id.validate()?;
        Ok(())
    }
}

/// Per-evaluation safety thresholds. Immutable for the duration of one call;
/// callers that need different limits construct a new value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub schema_version: SchemaVersion,
    pub hypo_threshold_mg_dl: f64,
    pub hyper_threshold_mg_dl: f64,
    pub max_insulin_dose_units: f64,
    pub stacking_window_hours: f64,
}

impl ThresholdConfig {
    pub fn v1(
        hypo_threshold_mg_dl: f64,
        hyper_threshold_mg_dl: f64,
        max_insulin_dose_units: f64,
        stacking_window_hours: f64,
    ) -> Result<Self, ContractViolation> {
        let cfg = Self {
            schema_version: GUARD_CONTRACT_VERSION,
            hypo_threshold_mg_dl,
            hyper_threshold_mg_dl,
            max_insulin_dose_units,
            stacking_window_hours,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Named default thresholds: hypo 70 mg/dL, hyper 250 mg/dL, ceiling
    /// 10 units, stacking window 3 h. Always passed explicitly by callers;
    /// there is no process-wide threshold state.
    pub fn default_v1() -> Self {
        Self {
            schema_version: GUARD_CONTRACT_VERSION,
            hypo_threshold_mg_dl: 70.0,
            hyper_threshold_mg_dl: 250.0,
            max_insulin_dose_units: 10.0,
            stacking_window_hours: 3.0,
        }
    }
}

impl Validate for ThresholdConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != GUARD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "threshold_config.schema_version",
                reason: "must match GUARD_CONTRACT_VERSION",
            });
        }
        validate_finite_non_negative(
            "threshold_config.hypo_threshold_mg_dl",
            self.hypo_threshold_mg_dl,
        )?;
        validate_finite_non_negative(
            "threshold_config.hyper_threshold_mg_dl",
            self.hyper_threshold_mg_dl,
        )?;
        validate_finite_non_negative(
            "threshold_config.max_insulin_dose_units",
            self.max_insulin_dose_units,
        )?;
        validate_finite_non_negative(
            "threshold_config.stacking_window_hours",
            self.stacking_window_hours,
        )?;
        if self.hypo_threshold_mg_dl >= self.hyper_threshold_mg_dl {
            return Err(ContractViolation::InvalidValue {
                field: "threshold_config.hypo_threshold_mg_dl",
                reason: "must be strictly below hyper_threshold_mg_dl",
            });
        }
        Ok(())
    }
}

/// One recommender proposal plus the patient state it was issued against.
/// Transient; created per call. Temporal context (hours since last dose) is
/// computed by the caller, never by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationInput {
    pub schema_version: SchemaVersion,
    pub glucose_mg_dl: f64,
    pub proposed_dose_units: f64,
    pub hours_since_last_dose: f64,
}

impl EvaluationInput {
    pub fn v1(
        glucose_mg_dl: f64,
        proposed_dose_units: f64,
        hours_since_last_dose: f64,
    ) -> Result<Self, ContractViolation> {
        let input = Self {
            schema_version: GUARD_CONTRACT_VERSION,
            glucose_mg_dl,
            proposed_dose_units,
            hours_since_last_dose,
        };
        input.validate()?;
        Ok(input)
    }
}

impl Validate for EvaluationInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != GUARD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "evaluation_input.schema_version",
                reason: "must match GUARD_CONTRACT_VERSION",
            });
        }
        validate_finite_non_negative("evaluation_input.glucose_mg_dl", self.glucose_mg_dl)?;
        validate_finite_non_negative(
            "evaluation_input.proposed_dose_units",
            self.proposed_dose_units,
        )?;
        validate_finite_non_negative(
            "evaluation_input.hours_since_last_dose",
            self.hours_since_last_dose,
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DoseEvaluateRequest {
    pub schema_version: SchemaVersion,
    pub envelope: GuardRequestEnvelope,
    pub input: EvaluationInput,
    pub thresholds: ThresholdConfig,
}

impl DoseEvaluateRequest {
    pub fn v1(
        envelope: GuardRequestEnvelope,
        input: EvaluationInput,
        thresholds: ThresholdConfig,
    ) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: GUARD_CONTRACT_VERSION,
            envelope,
            input,
            thresholds,
        };
        req.validate()?;
        Ok(req)
    }
}

impl Validate for DoseEvaluateRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != GUARD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "dose_evaluate_request.schema_version",
                reason: "must match GUARD_CONTRACT_VERSION",
            });
        }
        self.envelope.validate()?;
        self.input.validate()?;
        self.thresholds.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleMeshDescribeRequest {
    pub schema_version: SchemaVersion,
    pub envelope: GuardRequestEnvelope,
}

impl RuleMeshDescribeRequest {
    pub fn v1(envelope: GuardRequestEnvelope) -> Result<Self, ContractViolation> {
        let req = Self {
            schema_version: GUARD_CONTRACT_VERSION,
            envelope,
        };
        req.validate()?;
        Ok(req)
    }
}

impl Validate for RuleMeshDescribeRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != GUARD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "rule_mesh_describe_request.schema_version",
                reason: "must match GUARD_CONTRACT_VERSION",
            });
        }
        self.envelope.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GuardRequest {
    DoseEvaluate(DoseEvaluateRequest),
    RuleMeshDescribe(RuleMeshDescribeRequest),
}

impl GuardRequest {
    pub fn capability_id(&self) -> GuardCapabilityId {
        match self {
            GuardRequest::DoseEvaluate(_) => GuardCapabilityId::DoseEvaluate,
            GuardRequest::RuleMeshDescribe(_) => GuardCapabilityId::RuleMeshDescribe,
        }
    }
}

impl Validate for GuardRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            GuardRequest::DoseEvaluate(r) => r.validate(),
            GuardRequest::RuleMeshDescribe(r) => r.validate(),
        }
    }
}

/// Terminal safety decision for one dose proposal. A value, never mutated
/// after construction; serializable so an external audit collaborator can
/// log the full (input, thresholds, verdict) tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub schema_version: SchemaVersion,
    pub capability_id: GuardCapabilityId,
    pub reason_code: ReasonCodeId,
    pub status: VerdictStatus,
    pub rule_applied: RuleId,
    pub reason: Option<String>,
    pub mandated_intervention: Option<String>,
}

impl Verdict {
    pub fn v1(
        reason_code: ReasonCodeId,
        status: VerdictStatus,
        rule_applied: RuleId,
        reason: Option<String>,
        mandated_intervention: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let out = Self {
            schema_version: GUARD_CONTRACT_VERSION,
            capability_id: GuardCapabilityId::DoseEvaluate,
            reason_code,
            status,
            rule_applied,
            reason,
            mandated_intervention,
        };
        out.validate()?;
        Ok(out)
    }
}

impl Validate for Verdict {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != GUARD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "verdict.schema_version",
                reason: "must match GUARD_CONTRACT_VERSION",
            });
        }
        if self.capability_id != GuardCapabilityId::DoseEvaluate {
            return Err(ContractViolation::InvalidValue {
                field: "verdict.capability_id",
                reason: "must be GUARD_DOSE_EVALUATE",
            });
        }
        match self.status {
            VerdictStatus::Blocked => {
                if !self.rule_applied.is_blocking() {
                    return Err(ContractViolation::InvalidValue {
                        field: "verdict.rule_applied",
                        reason: "blocked verdict requires a blocking rule id",
                    });
                }
                validate_required_text("verdict.reason", &self.reason)?;
                validate_required_text(
                    "verdict.mandated_intervention",
                    &self.mandated_intervention,
                )?;
            }
            VerdictStatus::Approved => match self.rule_applied {
                RuleId::SustainedHyperglycemiaAdvisory => {
                    validate_required_text(
                        "verdict.mandated_intervention",
                        &self.mandated_intervention,
                    )?;
                    if let Some(reason) = &self.reason {
                        validate_clinical_text("verdict.reason", reason)?;
                    }
                }
                RuleId::StandardRange => {
                    if self.reason.is_some() {
                        return Err(ContractViolation::InvalidValue {
                            field: "verdict.reason",
                            reason: "must be None for a standard-range verdict",
                        });
                    }
                    if self.mandated_intervention.is_some() {
                        return Err(ContractViolation::InvalidValue {
                            field: "verdict.mandated_intervention",
                            reason: "must be None for a standard-range verdict",
                        });
                    }
                }
                _ => {
                    return Err(ContractViolation::InvalidValue {
                        field: "verdict.rule_applied",
                        reason: "approved verdict cannot carry a blocking rule id",
                    });
                }
            },
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMeshDescribeOk {
    pub schema_version: SchemaVersion,
    pub capability_id: GuardCapabilityId,
    pub reason_code: ReasonCodeId,
    pub rule_mesh_version: String,
    pub rule_mesh_hash: String,
    pub ordered_rules: Vec<RuleId>,
}

impl RuleMeshDescribeOk {
    pub fn v1(
        reason_code: ReasonCodeId,
        rule_mesh_version: String,
        rule_mesh_hash: String,
        ordered_rules: Vec<RuleId>,
    ) -> Result<Self, ContractViolation> {
        let out = Self {
            schema_version: GUARD_CONTRACT_VERSION,
            capability_id: GuardCapabilityId::RuleMeshDescribe,
            reason_code,
            rule_mesh_version,
            rule_mesh_hash,
            ordered_rules,
        };
        out.validate()?;
        Ok(out)
    }
}

impl Validate for RuleMeshDescribeOk {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != GUARD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "rule_mesh_describe_ok.schema_version",
                reason: "must match GUARD_CONTRACT_VERSION",
            });
        }
        if self.capability_id != GuardCapabilityId::RuleMeshDescribe {
            return Err(ContractViolation::InvalidValue {
                field: "rule_mesh_describe_ok.capability_id",
                reason: "must be GUARD_RULE_MESH_DESCRIBE",
            });
        }
        validate_token_ascii(
            "rule_mesh_describe_ok.rule_mesh_version",
            &self.rule_mesh_version,
            64,
        )?;
        validate_sha256_hex(
            "rule_mesh_describe_ok.rule_mesh_hash",
            &self.rule_mesh_hash,
        )?;
        if self.ordered_rules.is_empty() || self.ordered_rules.len() > 16 {
            return Err(ContractViolation::InvalidValue {
                field: "rule_mesh_describe_ok.ordered_rules",
                reason: "must contain 1..=16 entries",
            });
        }
        for (idx, rule) in self.ordered_rules.iter().enumerate() {
            if self.ordered_rules[..idx].contains(rule) {
                return Err(ContractViolation::InvalidValue {
                    field: "rule_mesh_describe_ok.ordered_rules",
                    reason: "must not contain duplicate rule ids",
                });
            }
        }
        if self.ordered_rules.last() != Some(&RuleId::StandardRange) {
            return Err(ContractViolation::InvalidValue {
                field: "rule_mesh_describe_ok.ordered_rules",
                reason: "must end with the standard-range default",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardRefuse {
    pub schema_version: SchemaVersion,
    pub capability_id: GuardCapabilityId,
    pub reason_code: ReasonCodeId,
    pub message: String,
}

impl GuardRefuse {
    pub fn v1(
        capability_id: GuardCapabilityId,
        reason_code: ReasonCodeId,
        message: String,
    ) -> Result<Self, ContractViolation> {
        let out = Self {
            schema_version: GUARD_CONTRACT_VERSION,
            capability_id,
            reason_code,
            message,
        };
        out.validate()?;
        Ok(out)
    }
}

impl Validate for GuardRefuse {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != GUARD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "guard_refuse.schema_version",
                reason: "must match GUARD_CONTRACT_VERSION",
            });
        }
        validate_clinical_text("guard_refuse.message", &self.message)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GuardResponse {
    Verdict(Verdict),
    RuleMeshDescribeOk(RuleMeshDescribeOk),
    Refuse(GuardRefuse),
}

impl GuardResponse {
    pub fn capability_id(&self) -> GuardCapabilityId {
        match self {
            GuardResponse::Verdict(v) => v.capability_id,
            GuardResponse::RuleMeshDescribeOk(ok) => ok.capability_id,
            GuardResponse::Refuse(refuse) => refuse.capability_id,
        }
    }
}

impl Validate for GuardResponse {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            GuardResponse::Verdict(v) => v.validate(),
            GuardResponse::RuleMeshDescribeOk(ok) => ok.validate(),
            GuardResponse::Refuse(refuse) => refuse.validate(),
        }
    }
}

fn validate_required_text(
    field: &'static str,
    value: &Option<String>,
) -> Result<(), ContractViolation> {
    let Some(value) = value else {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be present for this verdict",
        });
    };
    validate_clinical_text(field, value)
}

fn validate_clinical_text(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > 512 {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be <= 512 chars",
        });
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain control characters",
        });
    }
    Ok(())
}

fn validate_token_ascii(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    if !value.is_ascii() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be ASCII",
        });
    }
    if value
        .chars()
        .any(|c| c.is_control() || c.is_ascii_whitespace())
    {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain control or whitespace characters",
        });
    }
    Ok(())
}

fn validate_sha256_hex(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.len() != 64
        || !value
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be lowercase hex sha256 (64 chars)",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> GuardRequestEnvelope {
        GuardRequestEnvelope::v1(CorrelationId(3101)).unwrap()
    }

    #[test]
    fn guard_contract_01_thresholds_reject_inverted_bands() {
        let cfg = ThresholdConfig::v1(250.0, 70.0, 10.0, 3.0);
        assert!(cfg.is_err());
    }

    #[test]
    fn guard_contract_02_thresholds_reject_non_finite() {
        let cfg = ThresholdConfig::v1(70.0, f64::NAN, 10.0, 3.0);
        assert_eq!(
            cfg,
            Err(ContractViolation::NotFinite {
                field: "threshold_config.hyper_threshold_mg_dl",
            })
        );
    }

    #[test]
    fn guard_contract_03_input_rejects_negative_glucose() {
        let input = EvaluationInput::v1(-5.0, 2.0, 1.0);
        assert!(matches!(
            input,
            Err(ContractViolation::InvalidRange {
                field: "evaluation_input.glucose_mg_dl",
                ..
            })
        ));
    }

    #[test]
    fn guard_contract_04_blocked_verdict_requires_reason_and_intervention() {
        let out = Verdict::v1(
            ReasonCodeId(21),
            VerdictStatus::Blocked,
            RuleId::HypoglycemiaBlock,
            None,
            None,
        );
        assert!(out.is_err());
    }

    #[test]
    fn guard_contract_05_blocked_verdict_forbids_advisory_rule_id() {
        let out = Verdict::v1(
            ReasonCodeId(22),
            VerdictStatus::Blocked,
            RuleId::SustainedHyperglycemiaAdvisory,
            Some("reason".to_string()),
            Some("intervention".to_string()),
        );
        assert!(out.is_err());
    }

    #[test]
    fn guard_contract_06_standard_range_forbids_texts() {
        let out = Verdict::v1(
            ReasonCodeId(23),
            VerdictStatus::Approved,
            RuleId::StandardRange,
            None,
            Some("stray advisory".to_string()),
        );
        assert!(out.is_err());
    }

    #[test]
    fn guard_contract_07_advisory_requires_intervention() {
        let out = Verdict::v1(
            ReasonCodeId(24),
            VerdictStatus::Approved,
            RuleId::SustainedHyperglycemiaAdvisory,
            None,
            None,
        );
        assert!(out.is_err());
    }

    #[test]
    fn guard_contract_08_mesh_must_end_with_standard_range() {
        let out = RuleMeshDescribeOk::v1(
            ReasonCodeId(25),
            "guard_mesh_v1".to_string(),
            "a".repeat(64),
            vec![RuleId::StandardRange, RuleId::HypoglycemiaBlock],
        );
        assert!(out.is_err());
    }

    #[test]
    fn guard_contract_09_mesh_hash_must_be_lowercase_hex() {
        let out = RuleMeshDescribeOk::v1(
            ReasonCodeId(26),
            "guard_mesh_v1".to_string(),
            "Z".repeat(64),
            vec![RuleId::HypoglycemiaBlock, RuleId::StandardRange],
        );
        assert!(out.is_err());
    }

    #[test]
    fn guard_contract_10_request_validates_nested_parts() {
        let req = DoseEvaluateRequest::v1(
            envelope(),
            EvaluationInput::v1(110.0, 4.0, 1.0).unwrap(),
            ThresholdConfig::default_v1(),
        )
        .unwrap();
        assert!(GuardRequest::DoseEvaluate(req).validate().is_ok());
    }

    #[test]
    fn guard_contract_11_refuse_rejects_empty_message() {
        let out = GuardRefuse::v1(
            GuardCapabilityId::DoseEvaluate,
            ReasonCodeId(27),
            "  ".to_string(),
        );
        assert!(out.is_err());
    }
}
