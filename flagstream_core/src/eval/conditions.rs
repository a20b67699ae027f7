//! Condition evaluators: one entry per operator, plus recursive segment
//! matching. An operator that cannot be applied (bad number, bad regex,
//! malformed JSON list) evaluates to no-match.
use std::collections::HashSet;

use regex::Regex;

use crate::data::{Condition, SegmentMatch};
use crate::user::FlagUser;

use super::*;

impl Evaluator {
    /// A rule holds iff every condition holds.
    pub(crate) fn if_user_match_rule(
        &self,
        user: &FlagUser,
        conditions: &[Condition],
        visited: &mut HashSet<String>,
    ) -> bool {
        conditions
            .iter()
            .all(|condition| self.if_user_match_condition(user, condition, visited))
    }

    fn if_user_match_condition(
        &self,
        user: &FlagUser,
        condition: &Condition,
        visited: &mut HashSet<String>,
    ) -> bool {
        // Segment clauses carry no operator; the property field holds the
        // operator name instead.
        let op = if condition.op.is_empty() {
            condition.property.as_str()
        } else {
            condition.op.as_str()
        };
        if op.contains(THAN_CLAUSE) {
            return than_condition(user, condition, op);
        }
        match op {
            EQ_CLAUSE => equals_condition(user, condition),
            NEQ_CLAUSE => !equals_condition(user, condition),
            CONTAINS_CLAUSE => contains_condition(user, condition),
            NOT_CONTAIN_CLAUSE => !contains_condition(user, condition),
            IS_ONE_OF_CLAUSE => one_of_condition(user, condition),
            NOT_ONE_OF_CLAUSE => !one_of_condition(user, condition),
            STARTS_WITH_CLAUSE => starts_with_condition(user, condition),
            ENDS_WITH_CLAUSE => ends_with_condition(user, condition),
            IS_TRUE_CLAUSE => true_condition(user, condition),
            IS_FALSE_CLAUSE => false_condition(user, condition),
            MATCH_REGEX_CLAUSE => match_regex_condition(user, condition),
            NOT_MATCH_REGEX_CLAUSE => !match_regex_condition(user, condition),
            IS_IN_SEGMENT_CLAUSE => self.in_segment_condition(user, condition, visited),
            NOT_IN_SEGMENT_CLAUSE => !self.in_segment_condition(user, condition, visited),
            _ => false,
        }
    }

    /// The condition value is a JSON array of segment ids. Within one
    /// segment: excluded wins, then included, then the segment's own rules
    /// (which may reference further segments; cycles fail closed via the
    /// visited set).
    fn in_segment_condition(
        &self,
        user: &FlagUser,
        condition: &Condition,
        visited: &mut HashSet<String>,
    ) -> bool {
        let Ok(segment_ids) = serde_json::from_str::<Vec<String>>(&condition.value) else {
            return false;
        };
        for segment_id in segment_ids {
            // A segment already on the current recursion path would loop;
            // skip it so cycles fail closed.
            if visited.contains(&segment_id) {
                continue;
            }
            let matched = self.with_segment(&segment_id, |segment| {
                match segment.match_user(user.key()) {
                    SegmentMatch::Excluded => false,
                    SegmentMatch::Included => true,
                    SegmentMatch::Fallthrough => {
                        visited.insert(segment_id.clone());
                        let matched = segment
                            .rules
                            .iter()
                            .any(|rule| self.if_user_match_rule(user, &rule.conditions, visited));
                        visited.remove(&segment_id);
                        matched
                    }
                }
            });
            if matched.unwrap_or(false) {
                return true;
            }
        }
        false
    }
}

fn than_condition(user: &FlagUser, condition: &Condition, op: &str) -> bool {
    let Ok(property_value) = user.get(&condition.property).parse::<f64>() else {
        return false;
    };
    let Ok(condition_value) = condition.value.parse::<f64>() else {
        return false;
    };
    match op {
        GE_CLAUSE => property_value >= condition_value,
        GT_CLAUSE => property_value > condition_value,
        LE_CLAUSE => property_value <= condition_value,
        LT_CLAUSE => property_value < condition_value,
        _ => false,
    }
}

fn equals_condition(user: &FlagUser, condition: &Condition) -> bool {
    let property_value = user.get(&condition.property);
    !condition.value.is_empty() && condition.value == property_value
}

fn contains_condition(user: &FlagUser, condition: &Condition) -> bool {
    let property_value = user.get(&condition.property);
    !property_value.is_empty()
        && !condition.value.is_empty()
        && property_value.contains(&condition.value)
}

fn one_of_condition(user: &FlagUser, condition: &Condition) -> bool {
    let property_value = user.get(&condition.property);
    if property_value.is_empty() {
        return false;
    }
    match serde_json::from_str::<Vec<String>>(&condition.value) {
        Ok(values) => values.iter().any(|value| value == property_value),
        Err(_) => false,
    }
}

fn starts_with_condition(user: &FlagUser, condition: &Condition) -> bool {
    let property_value = user.get(&condition.property);
    !property_value.is_empty()
        && !condition.value.is_empty()
        && property_value.starts_with(&condition.value)
}

fn ends_with_condition(user: &FlagUser, condition: &Condition) -> bool {
    let property_value = user.get(&condition.property);
    !property_value.is_empty()
        && !condition.value.is_empty()
        && property_value.ends_with(&condition.value)
}

fn true_condition(user: &FlagUser, condition: &Condition) -> bool {
    let property_value = user.get(&condition.property);
    !property_value.is_empty() && property_value.eq_ignore_ascii_case("true")
}

fn false_condition(user: &FlagUser, condition: &Condition) -> bool {
    let property_value = user.get(&condition.property);
    !property_value.is_empty() && property_value.eq_ignore_ascii_case("false")
}

fn match_regex_condition(user: &FlagUser, condition: &Condition) -> bool {
    let property_value = user.get(&condition.property);
    if property_value.is_empty() || condition.value.is_empty() {
        return false;
    }
    match Regex::new(&condition.value) {
        Ok(regex) => regex.is_match(property_value),
        Err(_) => false,
    }
}
