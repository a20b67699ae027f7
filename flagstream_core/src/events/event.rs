//! Event types shipped to the insight endpoint.
use chrono::Utc;
use derive_more::From;
use serde::Serialize;

use crate::eval::EvalResult;
use crate::user::FlagUser;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct UserAttribute {
    pub name: String,
    pub value: String,
}

/// The user shape expected by the insight endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventUser {
    pub key_id: String,
    pub name: String,
    #[serde(rename = "customizedProperties")]
    pub attributes: Vec<UserAttribute>,
}

impl EventUser {
    pub fn is_valid(&self) -> bool {
        !self.key_id.is_empty() && !self.name.is_empty()
    }
}

impl From<&FlagUser> for EventUser {
    fn from(user: &FlagUser) -> EventUser {
        EventUser {
            key_id: user.key().to_owned(),
            name: user.name().to_owned(),
            attributes: user
                .custom_attributes()
                .iter()
                .map(|(name, value)| UserAttribute {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

/// One served variation, attached to a [`FlagEvent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagVariation {
    #[serde(rename = "featureFlagKey")]
    pub flag_key: String,
    pub send_to_experiment: bool,
    pub timestamp: i64,
    pub variation: VariationRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct VariationRecord {
    pub id: String,
    pub value: String,
    pub reason: String,
}

impl FlagVariation {
    /// Build the telemetry record for a successful evaluation, stamped now.
    pub fn from_result(result: &EvalResult) -> FlagVariation {
        FlagVariation {
            flag_key: result.flag_key.clone(),
            send_to_experiment: result.send_to_experiment,
            timestamp: Utc::now().timestamp_millis(),
            variation: VariationRecord {
                id: result.variation_id.clone(),
                value: result.value.clone(),
                reason: result.reason.clone(),
            },
        }
    }

}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Metric {
    pub route: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub event_name: String,
    pub numeric_value: f64,
    pub app_type: String,
    pub timestamp: i64,
}

impl Metric {
    pub fn new(event_name: impl Into<String>, numeric_value: f64) -> Metric {
        Metric {
            route: "index/metric".to_owned(),
            metric_type: "CustomEvent".to_owned(),
            event_name: event_name.into(),
            numeric_value,
            app_type: "rustserverside".to_owned(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Identify event: registers a user with the flag center.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserEvent {
    pub user: EventUser,
}

impl UserEvent {
    pub fn new(user: EventUser) -> UserEvent {
        UserEvent { user }
    }
}

/// Evaluation telemetry: which variation(s) a user was served.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagEvent {
    pub user: EventUser,
    pub variations: Vec<FlagVariation>,
}

impl FlagEvent {
    pub fn new(user: EventUser) -> FlagEvent {
        FlagEvent {
            user,
            variations: Vec::new(),
        }
    }

    pub fn add(&mut self, variation: FlagVariation) {
        self.variations.push(variation);
    }
}

/// Metric telemetry for experimentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub user: EventUser,
    pub metrics: Vec<Metric>,
}

impl MetricEvent {
    pub fn new(user: EventUser) -> MetricEvent {
        MetricEvent {
            user,
            metrics: Vec::new(),
        }
    }

    pub fn add(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }
}

/// Any event accepted by the pipeline. Serialized untagged: the endpoint
/// discriminates on the per-kind fields.
#[derive(Debug, Clone, PartialEq, Serialize, From)]
#[serde(untagged)]
pub enum InsightEvent {
    User(UserEvent),
    Flag(FlagEvent),
    Metric(MetricEvent),
}

impl InsightEvent {
    /// Minimum validity to be worth shipping: a valid user plus, for flag
    /// and metric events, a non-empty payload.
    pub fn is_sendable(&self) -> bool {
        match self {
            InsightEvent::User(event) => event.user.is_valid(),
            InsightEvent::Flag(event) => event.user.is_valid() && !event.variations.is_empty(),
            InsightEvent::Metric(event) => event.user.is_valid() && !event.metrics.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_user() -> EventUser {
        EventUser {
            key_id: "u-1".to_owned(),
            name: "alice".to_owned(),
            attributes: vec![],
        }
    }

    #[test]
    fn flag_event_needs_a_variation() {
        let event = FlagEvent::new(event_user());
        assert!(!InsightEvent::from(event.clone()).is_sendable());

        let mut event = event;
        event.add(FlagVariation {
            flag_key: "flag-a".to_owned(),
            send_to_experiment: false,
            timestamp: 1,
            variation: VariationRecord {
                id: "v-1".to_owned(),
                value: "true".to_owned(),
                reason: "target match".to_owned(),
            },
        });
        assert!(InsightEvent::from(event).is_sendable());
    }

    #[test]
    fn invalid_user_is_never_sendable() {
        let user = EventUser {
            key_id: String::new(),
            name: "alice".to_owned(),
            attributes: vec![],
        };
        assert!(!InsightEvent::from(UserEvent::new(user)).is_sendable());
    }

    #[test]
    fn wire_shape_matches_endpoint_contract() {
        let mut event = MetricEvent::new(event_user());
        event.add(Metric::new("clicked", 1.0));
        let value = serde_json::to_value(InsightEvent::from(event)).unwrap();
        assert_eq!(value["user"]["keyId"], "u-1");
        assert_eq!(value["metrics"][0]["route"], "index/metric");
        assert_eq!(value["metrics"][0]["type"], "CustomEvent");
        assert_eq!(value["metrics"][0]["eventName"], "clicked");
    }
}
