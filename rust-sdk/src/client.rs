use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use flagstream_core::data::{Category, DataItem, SyncPayload};
use flagstream_core::eval::{
    EvalResult, Evaluator, FLAG_NAME_UNKNOWN, FLAG_TYPE_BOOL, FLAG_TYPE_JSON, FLAG_TYPE_NUMBER,
    FLAG_TYPE_STRING, REASON_CLIENT_NOT_READY, REASON_ERROR, REASON_FLAG_NOT_FOUND,
    REASON_USER_NOT_SPECIFIED, REASON_WRONG_TYPE,
};
use flagstream_core::events::{
    EventProcessor, EventProcessorConfig, EventUser, FlagEvent, FlagVariation, InsightProcessor,
    InsightSender, Metric, MetricEvent, NullEventProcessor, UserEvent,
};
use flagstream_core::network;
use flagstream_core::store::MemoryStore;
use flagstream_core::streaming::{
    DataSynchronizer, NullDataSynchronizer, StreamingSynchronizer,
};
use flagstream_core::updater::{DataUpdater, State, StateType, StatusProvider};
use flagstream_core::{Error, FlagUser, Result};

use crate::all_flags::AllFlagState;
use crate::ClientConfig;

const EVENT_PATH: &str = "/api/public/insight/track";

const MAX_EVENT_RETRY_TIMES: u32 = 3;
const MAX_EVENT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// How a flag value was determined: the served value plus the decision
/// reason and the flag's identity. On any failure the value is the
/// caller-supplied default and the reason names the failure; evaluation
/// never panics or errors across this boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalDetail<T> {
    /// The served value, or the caller-supplied default on failure.
    pub value: T,
    /// Which pipeline stage decided, or the failure kind.
    pub reason: String,
    /// Key of the evaluated flag.
    pub flag_key: String,
    /// Display name of the evaluated flag.
    pub flag_name: String,
}

pub(crate) fn detail_of<T>(value: T, result: &EvalResult) -> EvalDetail<T> {
    EvalDetail {
        value,
        reason: result.reason.clone(),
        flag_key: result.flag_key.clone(),
        flag_name: result.flag_name.clone(),
    }
}

/// Whether a flag of `result.flag_type` can satisfy a `required` request.
/// A boolean flag satisfies only a boolean request; other flag types may
/// satisfy cross-type requests when the raw value parses.
pub(crate) fn check_type(result: &EvalResult, required: &str) -> bool {
    match result.flag_type.as_str() {
        FLAG_TYPE_BOOL => required == FLAG_TYPE_BOOL,
        FLAG_TYPE_NUMBER => match required {
            FLAG_TYPE_BOOL => result.value.parse::<bool>().is_ok(),
            _ => true,
        },
        FLAG_TYPE_JSON | FLAG_TYPE_STRING => match required {
            FLAG_TYPE_BOOL => result.value.parse::<bool>().is_ok(),
            FLAG_TYPE_NUMBER => result.value.parse::<f64>().is_ok(),
            _ => true,
        },
        _ => false,
    }
}

/// A client for one flag environment.
///
/// The client connects to the flag center as soon as it is constructed and
/// keeps an in-process snapshot of flags and segments fresh over a
/// streaming connection. Evaluations run against that snapshot in constant
/// time and never perform I/O.
///
/// # Examples
/// ```no_run
/// # use flagstream::{Client, FlagUser};
/// let client = Client::new(
///     "a1b2c3d4e5f6",
///     "wss://flags.example.com",
///     "https://events.example.com",
/// ).unwrap();
/// let user = FlagUser::builder("user-key").name("bob").build().unwrap();
/// let detail = client.bool_variation("my-flag", &user, false);
/// if detail.value {
///     // the new code path
/// }
/// ```
pub struct Client {
    offline: bool,
    store: Arc<MemoryStore>,
    updater: DataUpdater,
    status_provider: StatusProvider,
    synchronizer: Arc<dyn DataSynchronizer>,
    insight_processor: Arc<dyn InsightProcessor>,
    evaluator: Evaluator,
    closed: AtomicBool,
}

impl Client {
    /// Create a client with the default configuration and block up to the
    /// default start-wait for the first successful data sync.
    ///
    /// A timeout is not fatal: the returned client keeps initializing in
    /// the background and serves defaults until ready. Only an invalid
    /// configuration fails construction.
    pub fn new(env_secret: &str, streaming_url: &str, event_url: &str) -> Result<Client> {
        Client::with_config(env_secret, streaming_url, event_url, ClientConfig::default())
    }

    /// Create a client with a custom [`ClientConfig`].
    pub fn with_config(
        env_secret: &str,
        streaming_url: &str,
        event_url: &str,
        config: ClientConfig,
    ) -> Result<Client> {
        if config.offline {
            log::info!(target: "flagstream", "SDK is in offline mode");
        } else {
            if !is_env_secret_valid(env_secret) {
                return Err(Error::InvalidSecret);
            }
            url::Url::parse(streaming_url)?;
            url::Url::parse(event_url)?;
        }

        let store = Arc::new(MemoryStore::new());
        let updater = DataUpdater::new(store.clone());
        let status_provider = StatusProvider::new(updater.clone());
        let evaluator = Evaluator::new(store.clone());

        let insight_processor: Arc<dyn InsightProcessor> = if config.offline {
            NullEventProcessor::shared()
        } else {
            let http_client = network::build_http_client(&config.network)?;
            let sender = Arc::new(InsightSender::new(
                http_client,
                network::default_headers(env_secret),
                config.event_retry_interval.min(MAX_EVENT_RETRY_INTERVAL),
                config.event_max_retry_times.min(MAX_EVENT_RETRY_TIMES),
            ));
            let event_uri = format!("{}{}", event_url.trim_end_matches('/'), EVENT_PATH);
            Arc::new(EventProcessor::start(
                event_uri,
                sender,
                EventProcessorConfig::new(config.event_capacity, config.event_flush_interval),
            ))
        };

        let synchronizer: Arc<dyn DataSynchronizer> = if config.offline {
            NullDataSynchronizer::shared()
        } else {
            Arc::new(StreamingSynchronizer::new(
                updater.clone(),
                streaming_url,
                env_secret,
                config.streaming_first_retry_delay,
                config.streaming_max_retry_times,
            ))
        };

        let client = Client {
            offline: config.offline,
            store,
            updater,
            status_provider,
            synchronizer,
            insight_processor,
            evaluator,
            closed: AtomicBool::new(false),
        };

        let ready = client.synchronizer.start();
        if !config.start_wait.is_zero() && !client.offline {
            log::info!(target: "flagstream",
                "waiting up to {:?} for client initialization", config.start_wait);
            if ready.wait(config.start_wait) {
                if !client.is_initialized() {
                    log::warn!(target: "flagstream", "SDK was not successfully initialized");
                }
            } else {
                log::warn!(target: "flagstream",
                    "timeout encountered when waiting for data sync; continuing in the background");
            }
        }
        Ok(client)
    }

    /// True once the client has received at least one snapshot. While
    /// false, evaluations return the caller's defaults.
    pub fn is_initialized(&self) -> bool {
        self.synchronizer.is_initialized()
    }

    /// Block until the first snapshot lands.
    ///
    /// # Errors
    ///
    /// - [`Error::InitializationFailed`] when the synchronizer gave up for
    ///   good.
    /// - [`Error::InitializationTimeout`] when `timeout` elapsed; the
    ///   client keeps initializing in the background.
    pub fn wait_for_initialization(&self, timeout: Duration) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        if self.status_provider.wait_for_ok(timeout) {
            return Ok(());
        }
        if self.status_provider.current_state().state_type == StateType::Off {
            Err(Error::InitializationFailed)
        } else {
            Err(Error::InitializationTimeout)
        }
    }

    /// An interface for tracking the synchronizer's lifecycle: current
    /// state plus wait-for-state semantics. Recommended when the client is
    /// constructed with a zero start-wait.
    pub fn status_provider(&self) -> &StatusProvider {
        &self.status_provider
    }

    /// True if the flag key exists in the current snapshot.
    pub fn is_flag_known(&self, flag_key: &str) -> bool {
        self.evaluator.get_flag(flag_key).is_some()
    }

    /// Register a user with the flag center.
    pub fn identify(&self, user: &FlagUser) {
        self.insight_processor
            .send(UserEvent::new(EventUser::from(user)).into());
    }

    /// Report that a user performed an event, weighted 1. Used by
    /// percentage custom metrics.
    pub fn track_percentage_metric(&self, user: &FlagUser, event_name: &str) {
        self.track_numeric_metric(user, event_name, 1.0);
    }

    /// Report that a user performed an event with a metric value. Used by
    /// numeric custom metrics.
    pub fn track_numeric_metric(&self, user: &FlagUser, event_name: &str, metric_value: f64) {
        let mut event = MetricEvent::new(EventUser::from(user));
        event.add(Metric::new(event_name, metric_value));
        self.insight_processor.send(event.into());
    }

    /// Report a series of events, each weighted 1.
    pub fn track_percentage_metrics(&self, user: &FlagUser, event_names: &[&str]) {
        if event_names.is_empty() {
            return;
        }
        let mut event = MetricEvent::new(EventUser::from(user));
        for event_name in event_names {
            event.add(Metric::new(*event_name, 1.0));
        }
        self.insight_processor.send(event.into());
    }

    /// Report a series of events with their metric values.
    pub fn track_numeric_metrics(&self, user: &FlagUser, metrics: &HashMap<String, f64>) {
        if metrics.is_empty() {
            return;
        }
        let mut event = MetricEvent::new(EventUser::from(user));
        for (event_name, metric_value) in metrics {
            event.add(Metric::new(event_name.clone(), *metric_value));
        }
        self.insight_processor.send(event.into());
    }

    /// Deliver all pending events as soon as possible. Asynchronous; close
    /// is the call that guarantees delivery.
    pub fn flush(&self) {
        self.insight_processor.flush();
    }

    /// Shut the client down, blocking until pending events are sent.
    /// Idempotent; the client should no longer be used afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "flagstream", "SDK client is closing");
        self.store.close();
        self.status_provider.close();
        self.synchronizer.close();
        self.insight_processor.close();
    }

    /// Bootstrap the snapshot from a full-sync JSON blob. Offline mode
    /// only; returns whether the payload was applied.
    pub fn initialize_from_external_json(&self, json: &str) -> Result<bool> {
        if !self.offline || json.is_empty() {
            return Ok(false);
        }
        let payload: SyncPayload = serde_json::from_str(json)?;
        if !payload.is_process_data() {
            return Ok(false);
        }
        let version = payload.data.max_timestamp();
        if self.updater.init(payload.data.into_data_set(), version) {
            self.updater.update_status(State::ok());
            return Ok(true);
        }
        Ok(false)
    }

    /// String variation of a flag for the given user.
    ///
    /// The returned [`EvalDetail`] carries `default_value` with the
    /// failure reason whenever the flag cannot be served. A successful
    /// evaluation emits one insight event.
    pub fn variation(
        &self,
        flag_key: &str,
        user: &FlagUser,
        default_value: &str,
    ) -> EvalDetail<String> {
        let (result, error) = self.evaluate_core(flag_key, user, FLAG_TYPE_STRING);
        match error {
            None => detail_of(result.value.clone(), &result),
            Some(_) => detail_of(default_value.to_owned(), &result),
        }
    }

    /// Boolean variation of a flag for the given user.
    pub fn bool_variation(
        &self,
        flag_key: &str,
        user: &FlagUser,
        default_value: bool,
    ) -> EvalDetail<bool> {
        let (result, error) = self.evaluate_core(flag_key, user, FLAG_TYPE_BOOL);
        match error {
            None => detail_of(result.value.parse().unwrap_or(default_value), &result),
            Some(_) => detail_of(default_value, &result),
        }
    }

    /// Integer variation of a flag for the given user.
    pub fn int_variation(
        &self,
        flag_key: &str,
        user: &FlagUser,
        default_value: i64,
    ) -> EvalDetail<i64> {
        let (result, error) = self.evaluate_core(flag_key, user, FLAG_TYPE_NUMBER);
        match error {
            None => {
                let value = result
                    .value
                    .parse::<f64>()
                    .map(|number| number as i64)
                    .unwrap_or(default_value);
                detail_of(value, &result)
            }
            Some(_) => detail_of(default_value, &result),
        }
    }

    /// Floating-point variation of a flag for the given user.
    pub fn double_variation(
        &self,
        flag_key: &str,
        user: &FlagUser,
        default_value: f64,
    ) -> EvalDetail<f64> {
        let (result, error) = self.evaluate_core(flag_key, user, FLAG_TYPE_NUMBER);
        match error {
            None => detail_of(result.value.parse().unwrap_or(default_value), &result),
            Some(_) => detail_of(default_value, &result),
        }
    }

    /// JSON variation of a flag, decoded into the caller-supplied shape.
    /// A value that fails to decode yields the default.
    pub fn json_variation<T: DeserializeOwned>(
        &self,
        flag_key: &str,
        user: &FlagUser,
        default_value: T,
    ) -> EvalDetail<T> {
        let (result, error) = self.evaluate_core(flag_key, user, FLAG_TYPE_JSON);
        match error {
            None => match serde_json::from_str(&result.value) {
                Ok(value) => detail_of(value, &result),
                Err(err) => {
                    log::error!(target: "flagstream",
                        "unexpected error in parsing json, using default value: {err}");
                    detail_of(default_value, &result)
                }
            },
            Some(_) => detail_of(default_value, &result),
        }
    }

    /// Evaluate every flag in the snapshot for one user. The returned
    /// state emits the matching insight event when a value is read out of
    /// it, which makes it usable as a cache handed to a front end.
    ///
    /// # Errors
    ///
    /// [`Error::ClientNotReady`], [`Error::UserInvalid`] or
    /// [`Error::FlagNotFound`] when nothing can be evaluated.
    pub fn all_latest_flags(&self, user: &FlagUser) -> Result<AllFlagState> {
        if !self.is_initialized() {
            log::warn!(target: "flagstream",
                "evaluation is called before client is initialized");
            return Err(Error::ClientNotReady);
        }
        if !user.is_valid() {
            return Err(Error::UserInvalid);
        }
        let items = self.store.get_all(Category::FeatureFlags);
        if items.is_empty() {
            return Err(Error::FlagNotFound);
        }

        let mut states = HashMap::with_capacity(items.len());
        for (key, item) in items {
            if let DataItem::Flag(flag) = item.as_ref() {
                let result = self.evaluator.evaluate(flag, user);
                if result.success {
                    states.insert(key, result);
                }
            }
        }
        if states.is_empty() {
            log::error!(target: "flagstream", "unexpected error in evaluation");
            return Err(Error::EvalFailed);
        }
        Ok(AllFlagState::new(
            EventUser::from(user),
            states,
            self.insight_processor.clone(),
        ))
    }

    /// The shared evaluation path behind the typed variation methods.
    fn evaluate_core(
        &self,
        flag_key: &str,
        user: &FlagUser,
        required_type: &str,
    ) -> (EvalResult, Option<Error>) {
        if !self.is_initialized() {
            log::warn!(target: "flagstream",
                "evaluation of {flag_key} is called before client is initialized, using the default value");
            return (
                EvalResult::error(REASON_CLIENT_NOT_READY, flag_key, FLAG_NAME_UNKNOWN),
                Some(Error::ClientNotReady),
            );
        }
        let Some(item) = self.evaluator.get_flag(flag_key) else {
            log::warn!(target: "flagstream",
                "unknown feature flag {flag_key}; returning default value");
            return (
                EvalResult::error(REASON_FLAG_NOT_FOUND, flag_key, FLAG_NAME_UNKNOWN),
                Some(Error::FlagNotFound),
            );
        };
        let DataItem::Flag(flag) = item.as_ref() else {
            return (
                EvalResult::error(REASON_FLAG_NOT_FOUND, flag_key, FLAG_NAME_UNKNOWN),
                Some(Error::FlagNotFound),
            );
        };
        if !user.is_valid() {
            log::warn!(target: "flagstream",
                "invalid user for feature flag {flag_key}, returning default value");
            return (
                EvalResult::error(REASON_USER_NOT_SPECIFIED, flag_key, FLAG_NAME_UNKNOWN),
                Some(Error::UserInvalid),
            );
        }

        let result = self.evaluator.evaluate(flag, user);
        if !check_type(&result, required_type) {
            // A type mismatch serves the default and emits no telemetry.
            return (
                EvalResult::error(REASON_WRONG_TYPE, flag_key, &result.flag_name),
                Some(Error::WrongType),
            );
        }
        if result.success {
            let mut event = FlagEvent::new(EventUser::from(user));
            event.add(FlagVariation::from_result(&result));
            self.insight_processor.send(event.into());
            (result, None)
        } else {
            log::error!(target: "flagstream", "unexpected error in evaluation");
            (
                EvalResult::error(REASON_ERROR, flag_key, &flag.name),
                Some(Error::EvalFailed),
            )
        }
    }
}

fn is_env_secret_valid(env_secret: &str) -> bool {
    let secret = env_secret.trim();
    !secret.is_empty() && secret.chars().all(|c| c.is_ascii_hexdigit())
}
