use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use flagstream_core::eval::{
    EvalResult, FLAG_NAME_UNKNOWN, FLAG_TYPE_BOOL, FLAG_TYPE_JSON, FLAG_TYPE_NUMBER,
    FLAG_TYPE_STRING, REASON_FLAG_NOT_FOUND, REASON_WRONG_TYPE,
};
use flagstream_core::events::{EventUser, FlagEvent, FlagVariation, InsightProcessor};

use crate::client::{check_type, detail_of, EvalDetail};

/// A snapshot of every flag evaluated for one user, usable as a cache that
/// feeds a client-side SDK or a front-end app.
///
/// Reading a value emits the corresponding insight event with a fresh
/// timestamp, so serving from this cache stays observable.
pub struct AllFlagState {
    user: EventUser,
    states: HashMap<String, EvalResult>,
    processor: Arc<dyn InsightProcessor>,
}

impl AllFlagState {
    pub(crate) fn new(
        user: EventUser,
        states: HashMap<String, EvalResult>,
        processor: Arc<dyn InsightProcessor>,
    ) -> AllFlagState {
        AllFlagState {
            user,
            states,
            processor,
        }
    }

    /// Keys of every flag held by this snapshot.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    /// String value of one flag from the snapshot.
    pub fn string_variation(&self, flag_key: &str, default_value: &str) -> EvalDetail<String> {
        match self.get(flag_key, FLAG_TYPE_STRING) {
            Ok(result) => detail_of(result.value.clone(), &result),
            Err(result) => detail_of(default_value.to_owned(), &result),
        }
    }

    /// Boolean value of one flag from the snapshot.
    pub fn bool_variation(&self, flag_key: &str, default_value: bool) -> EvalDetail<bool> {
        match self.get(flag_key, FLAG_TYPE_BOOL) {
            Ok(result) => detail_of(result.value.parse().unwrap_or(default_value), &result),
            Err(result) => detail_of(default_value, &result),
        }
    }

    /// Integer value of one flag from the snapshot.
    pub fn int_variation(&self, flag_key: &str, default_value: i64) -> EvalDetail<i64> {
        match self.get(flag_key, FLAG_TYPE_NUMBER) {
            Ok(result) => {
                let value = result
                    .value
                    .parse::<f64>()
                    .map(|number| number as i64)
                    .unwrap_or(default_value);
                detail_of(value, &result)
            }
            Err(result) => detail_of(default_value, &result),
        }
    }

    /// Floating-point value of one flag from the snapshot.
    pub fn double_variation(&self, flag_key: &str, default_value: f64) -> EvalDetail<f64> {
        match self.get(flag_key, FLAG_TYPE_NUMBER) {
            Ok(result) => detail_of(result.value.parse().unwrap_or(default_value), &result),
            Err(result) => detail_of(default_value, &result),
        }
    }

    /// JSON value of one flag, decoded into the caller-supplied shape.
    pub fn json_variation<T: DeserializeOwned>(
        &self,
        flag_key: &str,
        default_value: T,
    ) -> EvalDetail<T> {
        match self.get(flag_key, FLAG_TYPE_JSON) {
            Ok(result) => match serde_json::from_str(&result.value) {
                Ok(value) => detail_of(value, &result),
                Err(err) => {
                    log::error!(target: "flagstream",
                        "unexpected error in parsing json, using default value: {err}");
                    detail_of(default_value, &result)
                }
            },
            Err(result) => detail_of(default_value, &result),
        }
    }

    /// Resolve one cached result, emitting the insight event on success.
    fn get(&self, flag_key: &str, required_type: &str) -> Result<EvalResult, EvalResult> {
        let Some(result) = self.states.get(flag_key) else {
            return Err(EvalResult::error(
                REASON_FLAG_NOT_FOUND,
                flag_key,
                FLAG_NAME_UNKNOWN,
            ));
        };
        if !check_type(result, required_type) {
            return Err(EvalResult::error(
                REASON_WRONG_TYPE,
                &result.flag_key,
                &result.flag_name,
            ));
        }
        let mut event = FlagEvent::new(self.user.clone());
        event.add(FlagVariation::from_result(result));
        self.processor.send(event.into());
        Ok(result.clone())
    }
}
