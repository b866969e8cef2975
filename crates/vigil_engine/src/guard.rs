#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};

use vigil_contracts::guard::{
    DoseEvaluateRequest, EvaluationInput, GuardCapabilityId, GuardRefuse, GuardRequest,
    GuardResponse, RuleId, RuleMeshDescribeOk, ThresholdConfig, Verdict, VerdictStatus,
};
use vigil_contracts::{ContractViolation, ReasonCodeId, Validate};

pub mod reason_codes {
    use vigil_contracts::ReasonCodeId;

    // GUARD reason-code namespace. Values are placeholders until registry lock.
    pub const GUARD_HYPOGLYCEMIA_BLOCK: ReasonCodeId = ReasonCodeId(0x4744_0001);
    pub const GUARD_MAX_DOSE_BLOCK: ReasonCodeId = ReasonCodeId(0x4744_0002);
    pub const GUARD_STACKING_BLOCK: ReasonCodeId = ReasonCodeId(0x4744_0003);
    pub const GUARD_HYPERGLYCEMIA_ADVISORY: ReasonCodeId = ReasonCodeId(0x4744_0004);
    pub const GUARD_STANDARD_RANGE: ReasonCodeId = ReasonCodeId(0x4744_0005);
    pub const GUARD_RULE_MESH_OK: ReasonCodeId = ReasonCodeId(0x4744_0006);

    pub const GUARD_INPUT_SCHEMA_INVALID: ReasonCodeId = ReasonCodeId(0x4744_00F1);
    pub const GUARD_INTERNAL_PIPELINE_ERROR: ReasonCodeId = ReasonCodeId(0x4744_00F2);
}

pub const RULE_MESH_VERSION: &str = "guard_mesh_v1";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardConfig {
    /// Linear insulin-on-board decay factor per (window - elapsed) hour.
    /// Placeholder heuristic, not a validated pharmacokinetic model; the
    /// reference value is 0.3 and must not change without a mesh version bump.
    pub iob_decay_factor: f64,
}

impl GuardConfig {
    pub fn mvp_v1() -> Self {
        Self {
            iob_decay_factor: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleFire {
    pub status: VerdictStatus,
    pub reason: Option<String>,
    pub mandated_intervention: Option<String>,
}

/// One ordered entry of the guard mesh: a trigger predicate plus the
/// consequence that builds the terminal decision. The mesh is static data so
/// precedence is inspectable and testable independently of dispatch.
#[derive(Debug, Clone, Copy)]
pub struct RuleDescriptor {
    pub id: RuleId,
    pub reason_code: ReasonCodeId,
    pub triggers: fn(&EvaluationInput, &ThresholdConfig) -> bool,
    pub consequence: fn(&EvaluationInput, &ThresholdConfig, &GuardConfig) -> RuleFire,
}

// Declaration order is evaluation order. First match wins; rules have
// overlapping trigger conditions, so reordering changes clinical behavior.
const RULE_MESH: [RuleDescriptor; 4] = [
    RuleDescriptor {
        id: RuleId::HypoglycemiaBlock,
        reason_code: reason_codes::GUARD_HYPOGLYCEMIA_BLOCK,
        triggers: hypoglycemia_triggers,
        consequence: hypoglycemia_consequence,
    },
    RuleDescriptor {
        id: RuleId::MaxDoseCeiling,
        reason_code: reason_codes::GUARD_MAX_DOSE_BLOCK,
        triggers: max_dose_triggers,
        consequence: max_dose_consequence,
    },
    RuleDescriptor {
        id: RuleId::StackingBlock,
        reason_code: reason_codes::GUARD_STACKING_BLOCK,
        triggers: stacking_triggers,
        consequence: stacking_consequence,
    },
    RuleDescriptor {
        id: RuleId::SustainedHyperglycemiaAdvisory,
        reason_code: reason_codes::GUARD_HYPERGLYCEMIA_ADVISORY,
        triggers: hyperglycemia_triggers,
        consequence: hyperglycemia_consequence,
    },
];

/// The ordered guard mesh, highest precedence first.
pub fn rule_mesh() -> &'static [RuleDescriptor] {
    &RULE_MESH
}

/// Lowercase hex sha256 over the ordered rule ids plus the default leaf.
/// Callers pin this to detect precedence drift between releases.
pub fn rule_mesh_hash() -> String {
    let mut hasher = Sha256::new();
    for rule in RULE_MESH.iter() {
        hasher.update(rule.id.as_str().as_bytes());
        hasher.update(b"|");
    }
    hasher.update(RuleId::StandardRange.as_str().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

// Clinical-range values print as-is ("62", "2.4"); extreme magnitudes fall
// back to scientific notation so a verdict text never overruns the contract
// cap for any finite input.
fn fmt_quantity(value: f64) -> String {
    if value.abs() < 1.0e6 {
        format!("{value}")
    } else {
        format!("{value:e}")
    }
}

fn hypoglycemia_triggers(input: &EvaluationInput, thresholds: &ThresholdConfig) -> bool {
    input.glucose_mg_dl < thresholds.hypo_threshold_mg_dl && input.proposed_dose_units > 0.0
}

fn hypoglycemia_consequence(
    input: &EvaluationInput,
    thresholds: &ThresholdConfig,
    _config: &GuardConfig,
) -> RuleFire {
    RuleFire {
        status: VerdictStatus::Blocked,
        reason: Some(format!(
            "Glucose at {} mg/dL is below the hypoglycemia threshold of {} mg/dL. \
             Insulin is absolutely contraindicated at this level.",
            fmt_quantity(input.glucose_mg_dl),
            fmt_quantity(thresholds.hypo_threshold_mg_dl)
        )),
        mandated_intervention: Some(
            "Start fast-acting carbohydrate rescue: 15 g of rapid-absorption carbohydrates. \
             Re-evaluate glucose in 15 minutes."
                .to_string(),
        ),
    }
}

fn max_dose_triggers(input: &EvaluationInput, thresholds: &ThresholdConfig) -> bool {
    input.proposed_dose_units > thresholds.max_insulin_dose_units
}

fn max_dose_consequence(
    input: &EvaluationInput,
    thresholds: &ThresholdConfig,
    _config: &GuardConfig,
) -> RuleFire {
    RuleFire {
        status: VerdictStatus::Blocked,
        reason: Some(format!(
            "Proposed dose of {} units exceeds the configured safety ceiling of {} units.",
            fmt_quantity(input.proposed_dose_units),
            fmt_quantity(thresholds.max_insulin_dose_units)
        )),
        mandated_intervention: Some(
            "Automated execution disabled at source. A clinician must manually confirm \
             any dose above the ceiling (human-in-the-loop)."
                .to_string(),
        ),
    }
}

fn stacking_triggers(input: &EvaluationInput, thresholds: &ThresholdConfig) -> bool {
    input.proposed_dose_units > 0.0
        && input.hours_since_last_dose < thresholds.stacking_window_hours
}

fn stacking_consequence(
    input: &EvaluationInput,
    thresholds: &ThresholdConfig,
    config: &GuardConfig,
) -> RuleFire {
    let residual = residual_insulin_units(input, thresholds, config);
    RuleFire {
        status: VerdictStatus::Blocked,
        reason: Some(format!(
            "Last dose was {} h ago, inside the {} h stacking window. \
             Estimated {} units of residual insulin still bioavailable.",
            fmt_quantity(input.hours_since_last_dose),
            fmt_quantity(thresholds.stacking_window_hours),
            fmt_quantity(residual)
        )),
        mandated_intervention: Some(
            "High stacking risk of hypoglycemia. Recalculate the dose net of residual \
             insulin on board, or defer administration until the window has elapsed."
                .to_string(),
        ),
    }
}

fn hyperglycemia_triggers(input: &EvaluationInput, thresholds: &ThresholdConfig) -> bool {
    input.glucose_mg_dl > thresholds.hyper_threshold_mg_dl
}

fn hyperglycemia_consequence(
    _input: &EvaluationInput,
    _thresholds: &ThresholdConfig,
    _config: &GuardConfig,
) -> RuleFire {
    RuleFire {
        status: VerdictStatus::Approved,
        reason: None,
        mandated_intervention: Some(
            "Patient above the sustained-hyperglycemia threshold. Monitor ketone levels \
             for ketoacidosis risk and notify the treating clinician immediately, \
             prioritizing remote and rural patients."
                .to_string(),
        ),
    }
}

/// Residual insulin-on-board estimate for the stacking rule:
/// `max(0, round10((window - elapsed) * dose * factor))`, one decimal place.
/// Simplified linear decay, preserved for behavioral compatibility with the
/// reference guardrail; it is not a pharmacokinetic integral.
fn residual_insulin_units(
    input: &EvaluationInput,
    thresholds: &ThresholdConfig,
    config: &GuardConfig,
) -> f64 {
    let raw = (thresholds.stacking_window_hours - input.hours_since_last_dose)
        * input.proposed_dose_units
        * config.iob_decay_factor;
    let rounded = (raw * 10.0).round() / 10.0;
    rounded.max(0.0)
}

/// Stateless guard evaluator. Pure: no clock, no I/O, no shared state; safe
/// to call from any number of concurrent callers without coordination.
#[derive(Debug, Clone)]
pub struct GuardRuntime {
    config: GuardConfig,
}

impl GuardRuntime {
    pub fn new(config: GuardConfig) -> Result<Self, ContractViolation> {
        if !config.iob_decay_factor.is_finite() {
            return Err(ContractViolation::NotFinite {
                field: "guard_config.iob_decay_factor",
            });
        }
        if config.iob_decay_factor <= 0.0 || config.iob_decay_factor > 1.0 {
            return Err(ContractViolation::InvalidRange {
                field: "guard_config.iob_decay_factor",
                min: 0.0,
                max: 1.0,
                got: config.iob_decay_factor,
            });
        }
        Ok(Self { config })
    }

    pub fn run(&self, req: &GuardRequest) -> GuardResponse {
        if req.validate().is_err() {
            return self.refuse(
                req.capability_id(),
                reason_codes::GUARD_INPUT_SCHEMA_INVALID,
                "guard request failed contract validation",
            );
        }

        match req {
            GuardRequest::DoseEvaluate(r) => self.run_dose_evaluate(r),
            GuardRequest::RuleMeshDescribe(_) => self.run_rule_mesh_describe(),
        }
    }

    /// Spec call interface: `evaluate(glucose, dose, hours, thresholds?)`.
    /// Omitted thresholds fall back to the named default; malformed numerics
    /// surface as a `ContractViolation`, never as a guessed verdict.
    pub fn evaluate(
        &self,
        glucose_mg_dl: f64,
        proposed_dose_units: f64,
        hours_since_last_dose: f64,
        thresholds: Option<ThresholdConfig>,
    ) -> Result<Verdict, ContractViolation> {
        let input = EvaluationInput::v1(glucose_mg_dl, proposed_dose_units, hours_since_last_dose)?;
        let thresholds = match thresholds {
            Some(t) => {
                t.validate()?;
                t
            }
            None => ThresholdConfig::default_v1(),
        };
        self.dose_verdict(&input, &thresholds)
    }

    fn run_dose_evaluate(&self, req: &DoseEvaluateRequest) -> GuardResponse {
        match self.dose_verdict(&req.input, &req.thresholds) {
            Ok(verdict) => GuardResponse::Verdict(verdict),
            Err(_) => self.refuse(
                GuardCapabilityId::DoseEvaluate,
                reason_codes::GUARD_INTERNAL_PIPELINE_ERROR,
                "guard verdict failed contract validation",
            ),
        }
    }

    fn dose_verdict(
        &self,
        input: &EvaluationInput,
        thresholds: &ThresholdConfig,
    ) -> Result<Verdict, ContractViolation> {
        for rule in RULE_MESH.iter() {
            if (rule.triggers)(input, thresholds) {
                let fire = (rule.consequence)(input, thresholds, &self.config);
                return Verdict::v1(
                    rule.reason_code,
                    fire.status,
                    rule.id,
                    fire.reason,
                    fire.mandated_intervention,
                );
            }
        }
        Verdict::v1(
            reason_codes::GUARD_STANDARD_RANGE,
            VerdictStatus::Approved,
            RuleId::StandardRange,
            None,
            None,
        )
    }

    fn run_rule_mesh_describe(&self) -> GuardResponse {
        let mut ordered: Vec<RuleId> = RULE_MESH.iter().map(|rule| rule.id).collect();
        ordered.push(RuleId::StandardRange);
        match RuleMeshDescribeOk::v1(
            reason_codes::GUARD_RULE_MESH_OK,
            RULE_MESH_VERSION.to_string(),
            rule_mesh_hash(),
            ordered,
        ) {
            Ok(ok) => GuardResponse::RuleMeshDescribeOk(ok),
            Err(_) => self.refuse(
                GuardCapabilityId::RuleMeshDescribe,
                reason_codes::GUARD_INTERNAL_PIPELINE_ERROR,
                "rule mesh description failed contract validation",
            ),
        }
    }

    fn refuse(
        &self,
        capability_id: GuardCapabilityId,
        reason_code: ReasonCodeId,
        message: &str,
    ) -> GuardResponse {
        match GuardRefuse::v1(capability_id, reason_code, message.to_string()) {
            Ok(refuse) => GuardResponse::Refuse(refuse),
            Err(_) => GuardResponse::Refuse(GuardRefuse {
                schema_version: vigil_contracts::guard::GUARD_CONTRACT_VERSION,
                capability_id,
                reason_code: reason_codes::GUARD_INTERNAL_PIPELINE_ERROR,
                message: "guard refuse construction failed".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_contracts::guard::GuardRequestEnvelope;
    use vigil_contracts::CorrelationId;

    fn runtime() -> GuardRuntime {
        GuardRuntime::new(GuardConfig::mvp_v1()).unwrap()
    }

    fn verdict(glucose: f64, dose: f64, hours: f64) -> Verdict {
        runtime().evaluate(glucose, dose, hours, None).unwrap()
    }

    #[test]
    fn at_guard_01_scenario_hypoglycemia_blocks_any_positive_dose() {
        let out = verdict(62.0, 2.0, 1.5);
        assert_eq!(out.status, VerdictStatus::Blocked);
        assert_eq!(out.rule_applied, RuleId::HypoglycemiaBlock);
        assert!(out.reason.as_deref().unwrap().contains("62 mg/dL"));
        assert!(out
            .mandated_intervention
            .as_deref()
            .unwrap()
            .contains("15 minutes"));
    }

    #[test]
    fn at_guard_02_scenario_oversized_dose_hits_ceiling() {
        let out = verdict(110.0, 15.0, 5.0);
        assert_eq!(out.status, VerdictStatus::Blocked);
        assert_eq!(out.rule_applied, RuleId::MaxDoseCeiling);
        assert!(out.reason.as_deref().unwrap().contains("15 units"));
        assert!(out.reason.as_deref().unwrap().contains("10 units"));
    }

    #[test]
    fn at_guard_03_scenario_stacking_reports_residual_insulin() {
        let out = verdict(110.0, 4.0, 1.0);
        assert_eq!(out.status, VerdictStatus::Blocked);
        assert_eq!(out.rule_applied, RuleId::StackingBlock);
        // round10((3 - 1) * 4 * 0.3) = 2.4
        assert!(out.reason.as_deref().unwrap().contains("2.4 units"));
    }

    #[test]
    fn at_guard_04_scenario_hyperglycemia_approves_with_advisory() {
        let out = verdict(310.0, 0.0, 5.0);
        assert_eq!(out.status, VerdictStatus::Approved);
        assert_eq!(out.rule_applied, RuleId::SustainedHyperglycemiaAdvisory);
        assert!(out
            .mandated_intervention
            .as_deref()
            .unwrap()
            .contains("ketone"));
    }

    #[test]
    fn at_guard_05_scenario_standard_range_approves_clean() {
        let out = verdict(120.0, 2.0, 4.0);
        assert_eq!(out.status, VerdictStatus::Approved);
        assert_eq!(out.rule_applied, RuleId::StandardRange);
        assert_eq!(out.reason, None);
        assert_eq!(out.mandated_intervention, None);
    }

    #[test]
    fn at_guard_06_hypoglycemia_precedes_ceiling_and_stacking() {
        // All three blocking triggers hold; the hypoglycemia rule must win.
        let out = verdict(50.0, 25.0, 0.5);
        assert_eq!(out.rule_applied, RuleId::HypoglycemiaBlock);
    }

    #[test]
    fn at_guard_07_ceiling_precedes_stacking() {
        let out = verdict(110.0, 25.0, 0.5);
        assert_eq!(out.rule_applied, RuleId::MaxDoseCeiling);
    }

    #[test]
    fn at_guard_08_stacking_precedes_hyperglycemia_advisory() {
        // Hyperglycemic patient, but the dose lands inside the stacking
        // window; the block must win over the approved-with-advisory leaf.
        let out = verdict(310.0, 4.0, 1.0);
        assert_eq!(out.status, VerdictStatus::Blocked);
        assert_eq!(out.rule_applied, RuleId::StackingBlock);
    }

    #[test]
    fn at_guard_09_boundaries_are_strict_inequalities() {
        // glucose == hypo threshold does not trigger the hypoglycemia block.
        let at_hypo = verdict(70.0, 2.0, 4.0);
        assert_eq!(at_hypo.rule_applied, RuleId::StandardRange);

        // dose == ceiling does not trigger the max-dose block.
        let at_ceiling = verdict(120.0, 10.0, 4.0);
        assert_eq!(at_ceiling.status, VerdictStatus::Approved);

        // hours == stacking window does not trigger the stacking block.
        let at_window = verdict(120.0, 2.0, 3.0);
        assert_eq!(at_window.rule_applied, RuleId::StandardRange);
    }

    #[test]
    fn at_guard_10_zero_dose_bypasses_hypoglycemia_and_stacking() {
        let out = verdict(62.0, 0.0, 0.5);
        assert_eq!(out.status, VerdictStatus::Approved);
        assert_eq!(out.rule_applied, RuleId::StandardRange);
    }

    #[test]
    fn at_guard_11_monotonic_ceiling_never_flips_back() {
        let runtime = runtime();
        for dose in [10.5, 12.0, 50.0, 400.0] {
            let out = runtime.evaluate(120.0, dose, 4.0, None).unwrap();
            assert_eq!(out.status, VerdictStatus::Blocked);
            assert_eq!(out.rule_applied, RuleId::MaxDoseCeiling);
        }
    }

    #[test]
    fn at_guard_12_deterministic_repeat_calls_return_identical_verdicts() {
        let runtime = runtime();
        let first = runtime.evaluate(62.0, 2.0, 1.5, None).unwrap();
        let second = runtime.evaluate(62.0, 2.0, 1.5, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn at_guard_13_invalid_input_yields_error_not_verdict() {
        let out = runtime().evaluate(-5.0, 2.0, 1.0, None);
        assert!(out.is_err());
    }

    #[test]
    fn at_guard_14_custom_thresholds_shift_rule_bands() {
        let thresholds = ThresholdConfig::v1(80.0, 200.0, 6.0, 2.0).unwrap();
        let out = runtime().evaluate(75.0, 2.0, 4.0, Some(thresholds)).unwrap();
        assert_eq!(out.rule_applied, RuleId::HypoglycemiaBlock);
    }

    #[test]
    fn at_guard_15_request_path_refuses_schema_invalid_input() {
        let mut req = DoseEvaluateRequest::v1(
            GuardRequestEnvelope::v1(CorrelationId(9001)).unwrap(),
            EvaluationInput::v1(110.0, 4.0, 1.0).unwrap(),
            ThresholdConfig::default_v1(),
        )
        .unwrap();
        // Corrupt the validated value after construction.
        req.input.glucose_mg_dl = f64::NAN;

        let out = runtime().run(&GuardRequest::DoseEvaluate(req));
        match out {
            GuardResponse::Refuse(refuse) => {
                assert_eq!(
                    refuse.reason_code,
                    reason_codes::GUARD_INPUT_SCHEMA_INVALID
                );
            }
            _ => panic!("expected Refuse"),
        }
    }

    #[test]
    fn at_guard_16_rule_mesh_describe_reports_precedence_order() {
        let req = GuardRequest::RuleMeshDescribe(
            vigil_contracts::guard::RuleMeshDescribeRequest::v1(
                GuardRequestEnvelope::v1(CorrelationId(9002)).unwrap(),
            )
            .unwrap(),
        );
        let out = runtime().run(&req);
        match out {
            GuardResponse::RuleMeshDescribeOk(ok) => {
                assert_eq!(
                    ok.ordered_rules,
                    vec![
                        RuleId::HypoglycemiaBlock,
                        RuleId::MaxDoseCeiling,
                        RuleId::StackingBlock,
                        RuleId::SustainedHyperglycemiaAdvisory,
                        RuleId::StandardRange,
                    ]
                );
                assert_eq!(ok.rule_mesh_hash, rule_mesh_hash());
                assert_eq!(ok.rule_mesh_version, RULE_MESH_VERSION);
            }
            _ => panic!("expected RuleMeshDescribeOk"),
        }
    }

    #[test]
    fn at_guard_17_mesh_hash_is_stable_lowercase_hex() {
        let hash = rule_mesh_hash();
        assert_eq!(hash, rule_mesh_hash());
        assert_eq!(hash.len(), 64);
        assert!(hash
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn at_guard_18_verdict_round_trips_through_json() {
        let out = verdict(62.0, 2.0, 1.5);
        let json = serde_json::to_string(&out).unwrap();
        let back: Verdict = serde_json::from_str(&json).unwrap();
        assert_eq!(out, back);
    }

    #[test]
    fn at_guard_19_runtime_rejects_malformed_decay_factor() {
        assert!(GuardRuntime::new(GuardConfig {
            iob_decay_factor: 0.0
        })
        .is_err());
        assert!(GuardRuntime::new(GuardConfig {
            iob_decay_factor: f64::NAN
        })
        .is_err());
    }

    #[test]
    fn at_guard_20_residual_estimate_clamps_at_zero() {
        // Elapsed exactly at the window would yield 0 residual; just inside
        // it the estimate must stay non-negative after rounding.
        let input = EvaluationInput::v1(110.0, 0.1, 2.99).unwrap();
        let residual = residual_insulin_units(
            &input,
            &ThresholdConfig::default_v1(),
            &GuardConfig::mvp_v1(),
        );
        assert!(residual >= 0.0);
    }

    #[test]
    fn at_guard_21_extreme_valid_magnitudes_still_yield_verdict() {
        // Any finite non-negative input must produce a Verdict, never a
        // ContractViolation; huge doses render in scientific notation
        // instead of overrunning the verdict text cap.
        let thresholds = ThresholdConfig::v1(70.0, 250.0, 1.0e300, 3.0).unwrap();
        let out = runtime()
            .evaluate(110.0, 2.0e300, 5.0, Some(thresholds))
            .unwrap();
        assert_eq!(out.status, VerdictStatus::Blocked);
        assert_eq!(out.rule_applied, RuleId::MaxDoseCeiling);
        assert!(out.reason.as_deref().unwrap().contains("2e300"));
        assert!(out.validate().is_ok());
    }
}
