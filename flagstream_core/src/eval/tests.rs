use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::data::SyncPayload;
use crate::store::MemoryStore;
use crate::user::FlagUser;

fn evaluator_with(payload: serde_json::Value) -> Evaluator {
    let payload: SyncPayload = serde_json::from_value(payload).unwrap();
    let version = payload.data.max_timestamp();
    let store = Arc::new(MemoryStore::new());
    assert!(store.init(payload.data.into_data_set(), version));
    Evaluator::new(store)
}

fn test_environment() -> Evaluator {
    evaluator_with(json!({
        "messageType": "data-sync",
        "data": {
            "eventType": "full",
            "featureFlags": [
                {
                    "id": "1",
                    "key": "ff-test-off",
                    "name": "test off",
                    "isEnabled": false,
                    "variationType": "boolean",
                    "disabledVariationId": "v-false",
                    "variations": [
                        {"id": "v-true", "value": "true"},
                        {"id": "v-false", "value": "false"}
                    ],
                    "fallthrough": {
                        "variations": [{"id": "v-true", "rollout": [0.0, 1.0]}]
                    },
                    "updatedAt": "2024-03-01T10:00:00Z"
                },
                {
                    "id": "2",
                    "key": "ff-evaluation-test",
                    "name": "evaluation test",
                    "isEnabled": true,
                    "variationType": "string",
                    "disabledVariationId": "v-a",
                    "variations": [
                        {"id": "v-a", "value": "teamA"},
                        {"id": "v-b", "value": "teamB"},
                        {"id": "v-c", "value": "teamC"},
                        {"id": "v-d", "value": "teamD"},
                        {"id": "v-e", "value": "teamE"},
                        {"id": "v-f", "value": "teamF"},
                        {"id": "v-g", "value": "teamG"},
                        {"id": "v-h", "value": "teamH"},
                        {"id": "v-i", "value": "teamI"},
                        {"id": "v-j", "value": "teamJ"}
                    ],
                    "targetUsers": [
                        {"keyIds": ["test-target-user"], "variationId": "v-b"}
                    ],
                    "rules": [
                        {
                            "conditions": [{"property": "graduated", "op": "IsTrue", "value": ""}],
                            "variations": [{"id": "v-c", "rollout": [0.0, 1.0]}]
                        },
                        {
                            "conditions": [{"property": "country", "op": "Equal", "value": "CHN"}],
                            "variations": [{"id": "v-d", "rollout": [0.0, 1.0]}]
                        },
                        {
                            "conditions": [{"property": "salary", "op": "BiggerThan", "value": "2000"}],
                            "variations": [{"id": "v-e", "rollout": [0.0, 1.0]}]
                        },
                        {
                            "conditions": [{"property": "email", "op": "Contains", "value": "@gmail"}],
                            "variations": [{"id": "v-f", "rollout": [0.0, 1.0]}]
                        },
                        {
                            "conditions": [{"property": "major", "op": "IsOneOf", "value": "[\"CS\",\"Math\"]"}],
                            "variations": [{"id": "v-g", "rollout": [0.0, 1.0]}]
                        },
                        {
                            "conditions": [{"property": "keyid", "op": "StartsWith", "value": "group-admin"}],
                            "variations": [{"id": "v-h", "rollout": [0.0, 1.0]}]
                        },
                        {
                            "conditions": [{"property": "phone", "op": "MatchRegex", "value": "^1855"}],
                            "variations": [{"id": "v-i", "rollout": [0.0, 1.0]}]
                        },
                        {
                            "conditions": [{"property": "User is in segment", "op": "", "value": "[\"seg-1\"]"}],
                            "variations": [{"id": "v-j", "rollout": [0.0, 1.0]}]
                        }
                    ],
                    "fallthrough": {
                        "variations": [{"id": "v-a", "rollout": [0.0, 1.0]}]
                    },
                    "updatedAt": "2024-03-01T10:00:00Z"
                }
            ],
            "segments": [
                {
                    "id": "seg-1",
                    "included": ["test-user-1"],
                    "excluded": ["test-user-3"],
                    "updatedAt": "2024-03-01T10:00:00Z"
                }
            ]
        }
    }))
}

fn flag_of(evaluator: &Evaluator, key: &str) -> crate::data::FeatureFlag {
    match evaluator.get_flag(key).unwrap().as_ref() {
        crate::data::DataItem::Flag(flag) => flag.clone(),
        other => panic!("expected a flag, got {other:?}"),
    }
}

fn user(key: &str) -> FlagUser {
    FlagUser::builder(key).build().unwrap()
}

fn user_with(key: &str, attribute: &str, value: &str) -> FlagUser {
    FlagUser::builder(key)
        .custom(attribute, value)
        .build()
        .unwrap()
}

#[test]
fn disabled_flag_serves_disabled_variation() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-test-off");
    let result = evaluator.evaluate(&flag, &user("test-user-1"));
    assert!(result.success);
    assert_eq!(result.value, "false");
    assert_eq!(result.reason, REASON_FLAG_OFF);
    assert!(!result.send_to_experiment);
}

#[test]
fn targeted_user_wins_before_rules() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(&flag, &user("test-target-user"));
    assert_eq!(result.value, "teamB");
    assert_eq!(result.reason, REASON_TARGET_MATCH);
}

#[test]
fn true_condition_matches() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(&flag, &user_with("test-true-user", "graduated", "true"));
    assert_eq!(result.value, "teamC");
    assert_eq!(result.reason, REASON_RULE_MATCH);
}

#[test]
fn equal_condition_matches() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(&flag, &user_with("test-equal-user", "country", "CHN"));
    assert_eq!(result.value, "teamD");
    assert_eq!(result.reason, REASON_RULE_MATCH);
}

#[test]
fn numeric_comparison_matches() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(&flag, &user_with("test-than-user", "salary", "2500"));
    assert_eq!(result.value, "teamE");
    assert_eq!(result.reason, REASON_RULE_MATCH);

    // A non-numeric attribute never matches a numeric comparison.
    let result = evaluator.evaluate(&flag, &user_with("test-than-user-2", "salary", "a lot"));
    assert_ne!(result.value, "teamE");
}

#[test]
fn contains_condition_matches() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(
        &flag,
        &user_with("test-contain-user", "email", "test-contain-user@gmail.com"),
    );
    assert_eq!(result.value, "teamF");
    assert_eq!(result.reason, REASON_RULE_MATCH);
}

#[test]
fn one_of_condition_matches() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(&flag, &user_with("test-isoneof-user", "major", "CS"));
    assert_eq!(result.value, "teamG");
    assert_eq!(result.reason, REASON_RULE_MATCH);
}

#[test]
fn starts_with_condition_matches() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(&flag, &user("group-admin-user"));
    assert_eq!(result.value, "teamH");
    assert_eq!(result.reason, REASON_RULE_MATCH);
}

#[test]
fn regex_condition_matches() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(&flag, &user_with("test-regex-user", "phone", "18555358000"));
    assert_eq!(result.value, "teamI");
    assert_eq!(result.reason, REASON_RULE_MATCH);
}

#[test]
fn segment_included_user_matches_rule() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(&flag, &user("test-user-1"));
    assert_eq!(result.value, "teamJ");
    assert_eq!(result.reason, REASON_RULE_MATCH);
}

#[test]
fn segment_excluded_user_falls_through() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(&flag, &user("test-user-3"));
    assert_eq!(result.value, "teamA");
    assert_eq!(result.reason, REASON_FALLTHROUGH);
}

#[test]
fn unmatched_user_falls_through() {
    let evaluator = test_environment();
    let flag = flag_of(&evaluator, "ff-evaluation-test");
    let result = evaluator.evaluate(&flag, &user("test-fallthrough-user"));
    assert_eq!(result.value, "teamA");
    assert_eq!(result.reason, REASON_FALLTHROUGH);
}

#[test]
fn evaluation_is_deterministic_across_snapshot_reloads() {
    let flag_json = json!({
        "messageType": "data-sync",
        "data": {
            "eventType": "full",
            "featureFlags": [{
                "key": "ff-rollout",
                "name": "rollout",
                "isEnabled": true,
                "variationType": "string",
                "variations": [
                    {"id": "v-1", "value": "one"},
                    {"id": "v-2", "value": "two"}
                ],
                "fallthrough": {
                    "variations": [
                        {"id": "v-1", "rollout": [0.0, 0.5]},
                        {"id": "v-2", "rollout": [0.5, 1.0]}
                    ]
                },
                "updatedAt": "2024-03-01T10:00:00Z"
            }],
            "segments": []
        }
    });

    let first = {
        let evaluator = evaluator_with(flag_json.clone());
        let flag = flag_of(&evaluator, "ff-rollout");
        evaluator.evaluate(&flag, &user("rollout-user")).value
    };
    for _ in 0..10 {
        let evaluator = evaluator_with(flag_json.clone());
        let flag = flag_of(&evaluator, "ff-rollout");
        assert_eq!(evaluator.evaluate(&flag, &user("rollout-user")).value, first);
    }
}

#[test]
fn segment_cycle_fails_closed() {
    let evaluator = evaluator_with(json!({
        "messageType": "data-sync",
        "data": {
            "eventType": "full",
            "featureFlags": [{
                "key": "ff-seg-cycle",
                "name": "segment cycle",
                "isEnabled": true,
                "variationType": "string",
                "variations": [
                    {"id": "v-in", "value": "inside"},
                    {"id": "v-out", "value": "outside"}
                ],
                "rules": [{
                    "conditions": [{"property": "User is in segment", "op": "", "value": "[\"seg-a\"]"}],
                    "variations": [{"id": "v-in", "rollout": [0.0, 1.0]}]
                }],
                "fallthrough": {
                    "variations": [{"id": "v-out", "rollout": [0.0, 1.0]}]
                },
                "updatedAt": "2024-03-01T10:00:00Z"
            }],
            "segments": [
                {
                    "id": "seg-a",
                    "rules": [{
                        "conditions": [{"property": "User is in segment", "op": "", "value": "[\"seg-b\"]"}]
                    }],
                    "updatedAt": "2024-03-01T10:00:00Z"
                },
                {
                    "id": "seg-b",
                    "rules": [{
                        "conditions": [{"property": "User is in segment", "op": "", "value": "[\"seg-a\"]"}]
                    }],
                    "updatedAt": "2024-03-01T10:00:00Z"
                }
            ]
        }
    }));
    let flag = flag_of(&evaluator, "ff-seg-cycle");
    let result = evaluator.evaluate(&flag, &user("anyone"));
    assert_eq!(result.value, "outside");
    assert_eq!(result.reason, REASON_FALLTHROUGH);
}

#[test]
fn experiment_gate_respects_rollout() {
    let evaluator = evaluator_with(json!({
        "messageType": "data-sync",
        "data": {
            "eventType": "full",
            "featureFlags": [{
                "key": "ff-expt",
                "name": "experiment",
                "isEnabled": true,
                "variationType": "string",
                "variations": [{"id": "v-1", "value": "one"}],
                "fallthrough": {
                    "includedInExpt": true,
                    "variations": [{"id": "v-1", "rollout": [0.0, 1.0], "exptRollout": 1.0}]
                },
                "updatedAt": "2024-03-01T10:00:00Z"
            }],
            "segments": []
        }
    }));
    let flag = flag_of(&evaluator, "ff-expt");
    let result = evaluator.evaluate(&flag, &user("expt-user"));
    assert!(result.send_to_experiment);

    // A zero experiment rollout excludes everyone.
    let evaluator = evaluator_with(json!({
        "messageType": "data-sync",
        "data": {
            "eventType": "full",
            "featureFlags": [{
                "key": "ff-expt",
                "name": "experiment",
                "isEnabled": true,
                "variationType": "string",
                "variations": [{"id": "v-1", "value": "one"}],
                "fallthrough": {
                    "includedInExpt": true,
                    "variations": [{"id": "v-1", "rollout": [0.0, 1.0], "exptRollout": 0.0}]
                },
                "updatedAt": "2024-03-01T10:00:00Z"
            }],
            "segments": []
        }
    }));
    let flag = flag_of(&evaluator, "ff-expt");
    let result = evaluator.evaluate(&flag, &user("expt-user"));
    assert!(!result.send_to_experiment);
}
