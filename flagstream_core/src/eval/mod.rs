//! The evaluation engine: a deterministic, side-effect-free pipeline that
//! resolves a flag against a user by walking the
//! disabled -> targeted -> rule-matched -> fallthrough stages.
use std::collections::HashSet;
use std::sync::Arc;

use crate::data::{Category, DataItem, FeatureFlag, RolloutVariation, Segment};
use crate::splitter;
use crate::store::MemoryStore;
use crate::user::FlagUser;

mod conditions;

pub const EXPT_KEY_PREFIX: &str = "expt";
pub const DEFAULT_DISPATCH_KEY: &str = "keyid";

pub const REASON_FLAG_OFF: &str = "flag off";
pub const REASON_TARGET_MATCH: &str = "target match";
pub const REASON_RULE_MATCH: &str = "rule match";
pub const REASON_FALLTHROUGH: &str = "fall through all rules";
pub const REASON_CLIENT_NOT_READY: &str = "client not ready";
pub const REASON_FLAG_NOT_FOUND: &str = "flag not found";
pub const REASON_WRONG_TYPE: &str = "wrong type";
pub const REASON_USER_NOT_SPECIFIED: &str = "user not specified";
pub const REASON_ERROR: &str = "error in evaluation";

pub const FLAG_KEY_UNKNOWN: &str = "flag key unknown";
pub const FLAG_NAME_UNKNOWN: &str = "flag name unknown";

pub const FLAG_TYPE_BOOL: &str = "boolean";
pub const FLAG_TYPE_STRING: &str = "string";
pub const FLAG_TYPE_NUMBER: &str = "number";
pub const FLAG_TYPE_JSON: &str = "json";

pub(crate) const THAN_CLAUSE: &str = "Than";
pub(crate) const GE_CLAUSE: &str = "BiggerEqualThan";
pub(crate) const GT_CLAUSE: &str = "BiggerThan";
pub(crate) const LE_CLAUSE: &str = "LessEqualThan";
pub(crate) const LT_CLAUSE: &str = "LessThan";
pub(crate) const EQ_CLAUSE: &str = "Equal";
pub(crate) const NEQ_CLAUSE: &str = "NotEqual";
pub(crate) const CONTAINS_CLAUSE: &str = "Contains";
pub(crate) const NOT_CONTAIN_CLAUSE: &str = "NotContain";
pub(crate) const IS_ONE_OF_CLAUSE: &str = "IsOneOf";
pub(crate) const NOT_ONE_OF_CLAUSE: &str = "NotOneOf";
pub(crate) const STARTS_WITH_CLAUSE: &str = "StartsWith";
pub(crate) const ENDS_WITH_CLAUSE: &str = "EndsWith";
pub(crate) const IS_TRUE_CLAUSE: &str = "IsTrue";
pub(crate) const IS_FALSE_CLAUSE: &str = "IsFalse";
pub(crate) const MATCH_REGEX_CLAUSE: &str = "MatchRegex";
pub(crate) const NOT_MATCH_REGEX_CLAUSE: &str = "NotMatchRegex";
pub(crate) const IS_IN_SEGMENT_CLAUSE: &str = "User is in segment";
pub(crate) const NOT_IN_SEGMENT_CLAUSE: &str = "User is not in segment";

/// The outcome of one evaluation: the winning variation, its raw string
/// value, whether the result feeds experimentation, and how it was decided.
///
/// Type-specific coercion of `value` happens at the facade boundary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvalResult {
    pub variation_id: String,
    pub value: String,
    pub send_to_experiment: bool,
    pub success: bool,
    pub flag_type: String,
    pub reason: String,
    pub flag_key: String,
    pub flag_name: String,
}

impl EvalResult {
    /// A non-successful result carrying only the reason and flag identity.
    pub fn error(reason: &str, flag_key: &str, flag_name: &str) -> EvalResult {
        EvalResult {
            reason: reason.to_owned(),
            flag_key: flag_key.to_owned(),
            flag_name: flag_name.to_owned(),
            ..EvalResult::default()
        }
    }
}

/// Pure decision pipeline over the snapshot store. Evaluation performs no
/// I/O and never mutates its inputs.
#[derive(Clone)]
pub struct Evaluator {
    store: Arc<MemoryStore>,
}

impl Evaluator {
    pub fn new(store: Arc<MemoryStore>) -> Evaluator {
        Evaluator { store }
    }

    /// Look up a live flag by key.
    pub fn get_flag(&self, key: &str) -> Option<Arc<DataItem>> {
        self.store.get(Category::FeatureFlags, key)
    }

    fn get_segment(&self, id: &str) -> Option<Arc<DataItem>> {
        self.store.get(Category::Segments, id)
    }

    pub(crate) fn with_segment<R>(&self, id: &str, f: impl FnOnce(&Segment) -> R) -> Option<R> {
        let item = self.get_segment(id)?;
        match item.as_ref() {
            DataItem::Segment(segment) => Some(f(segment)),
            _ => None,
        }
    }

    /// Resolve `flag` for `user`: first matching stage wins.
    pub fn evaluate(&self, flag: &FeatureFlag, user: &FlagUser) -> EvalResult {
        let result = self
            .match_disabled(flag)
            .or_else(|| self.match_targeted(flag, user))
            .or_else(|| self.match_rules(flag, user))
            .or_else(|| self.match_fallthrough(flag, user))
            .unwrap_or_else(|| EvalResult::error(REASON_ERROR, &flag.key, &flag.name));
        if result.success {
            log::debug!(target: "flagstream",
                "user {}, flag {}, served {}", user.key(), flag.key, result.value);
        }
        result
    }

    fn match_disabled(&self, flag: &FeatureFlag) -> Option<EvalResult> {
        if flag.enabled {
            return None;
        }
        Some(EvalResult {
            variation_id: flag.disabled_variation_id.clone(),
            value: flag.variation_value(&flag.disabled_variation_id).to_owned(),
            send_to_experiment: false,
            success: true,
            flag_type: flag.variation_type.clone(),
            reason: REASON_FLAG_OFF.to_owned(),
            flag_key: flag.key.clone(),
            flag_name: flag.name.clone(),
        })
    }

    fn match_targeted(&self, flag: &FeatureFlag, user: &FlagUser) -> Option<EvalResult> {
        let target = flag
            .target_users
            .iter()
            .find(|target| target.key_ids.iter().any(|key| key == user.key()))?;
        Some(EvalResult {
            variation_id: target.variation_id.clone(),
            value: flag.variation_value(&target.variation_id).to_owned(),
            send_to_experiment: flag.expt_include_all_targets,
            success: true,
            flag_type: flag.variation_type.clone(),
            reason: REASON_TARGET_MATCH.to_owned(),
            flag_key: flag.key.clone(),
            flag_name: flag.name.clone(),
        })
    }

    fn match_rules(&self, flag: &FeatureFlag, user: &FlagUser) -> Option<EvalResult> {
        let mut visited = HashSet::new();
        let rule = flag
            .rules
            .iter()
            .find(|rule| self.if_user_match_rule(user, &rule.conditions, &mut visited))?;
        self.rollout_variation(
            flag,
            &rule.variations,
            user,
            REASON_RULE_MATCH,
            rule.included_in_expt,
            &rule.dispatch_key,
        )
    }

    fn match_fallthrough(&self, flag: &FeatureFlag, user: &FlagUser) -> Option<EvalResult> {
        let fallthrough = &flag.fallthrough;
        self.rollout_variation(
            flag,
            &fallthrough.variations,
            user,
            REASON_FALLTHROUGH,
            fallthrough.included_in_expt,
            &fallthrough.dispatch_key,
        )
    }

    /// Resolve a rollout: hash the dispatch-key value (prefixed by the flag
    /// key) into `[0, 1)` and pick the variation whose interval contains it.
    fn rollout_variation(
        &self,
        flag: &FeatureFlag,
        rollouts: &[RolloutVariation],
        user: &FlagUser,
        reason: &str,
        rule_included_in_expt: bool,
        dispatch_key: &str,
    ) -> Option<EvalResult> {
        let attribute = if dispatch_key.is_empty() {
            DEFAULT_DISPATCH_KEY
        } else {
            dispatch_key
        };
        let dispatch_key_value = format!("{}{}", flag.key, user.get(attribute));

        let rollout = rollouts
            .iter()
            .find(|r| splitter::key_belongs_to_percentage(&dispatch_key_value, &r.rollout))?;

        Some(EvalResult {
            variation_id: rollout.id.clone(),
            value: flag.variation_value(&rollout.id).to_owned(),
            send_to_experiment: send_to_experiment(
                &dispatch_key_value,
                rollout,
                flag.expt_include_all_targets,
                rule_included_in_expt,
            ),
            success: true,
            flag_type: flag.variation_type.clone(),
            reason: reason.to_owned(),
            flag_key: flag.key.clone(),
            flag_name: flag.name.clone(),
        })
    }
}

/// Experimentation gate: every target when the flag opts all targets in,
/// otherwise a re-hash of the dispatch key into the experiment window.
fn send_to_experiment(
    dispatch_key_value: &str,
    rollout: &RolloutVariation,
    expt_include_all_targets: bool,
    rule_included_in_expt: bool,
) -> bool {
    if expt_include_all_targets {
        return true;
    }
    if !rule_included_in_expt {
        return false;
    }
    let send_to_experiment_percentage = rollout.expt_rollout;
    let splitting_percentage = rollout.splitting_percentage();
    if send_to_experiment_percentage == 0.0 || splitting_percentage == 0.0 {
        return false;
    }
    let upper_bound = (send_to_experiment_percentage / splitting_percentage).min(1.0);
    let expt_dispatch_key_value = format!("{}{}", EXPT_KEY_PREFIX, dispatch_key_value);
    splitter::key_belongs_to_percentage(&expt_dispatch_key_value, &[0.0, upper_bound])
}

#[cfg(test)]
mod tests;
