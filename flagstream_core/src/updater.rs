//! The data updater sits between the synchronizer and the snapshot store:
//! it applies payloads, owns the lifecycle state machine, and multiplexes
//! state changes to waiters.
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::data::{Category, DataItem, DataSet};
use crate::store::MemoryStore;

pub const ERROR_REQUEST_INVALID: &str = "Request invalid";
pub const ERROR_DATA_INVALID: &str = "Received Data invalid";
pub const ERROR_WEBSOCKET: &str = "WebSocket error";
pub const ERROR_WEBSOCKET_CLOSE_TIMEOUT: &str = "WebSocket close timeout";
pub const ERROR_UNKNOWN: &str = "Unknown error";
pub const ERROR_NETWORK: &str = "Network error";
pub const ERROR_UNKNOWN_CLOSE_CODE: &str = "Unknown close code";

/// Overall state of the data synchronization machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    /// Initial state, kept until the first successful payload or a
    /// permanent failure. Transient errors do not leave this state.
    Initializing,
    /// Sync is healthy and at least one payload has been applied.
    Ok,
    /// A recoverable failure occurred; a retry is in progress.
    Interrupted,
    /// Terminal: explicit shutdown or an unrecoverable failure.
    Off,
}

/// The last error the synchronizer encountered, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorTrack {
    pub error_type: String,
    pub message: String,
}

impl ErrorTrack {
    fn is_empty(&self) -> bool {
        self.error_type.is_empty()
    }
}

/// A state value plus when it was entered and the last error seen.
/// `state_since` only moves when the state type changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub state_type: StateType,
    pub state_since: chrono::DateTime<chrono::Utc>,
    pub error_track: ErrorTrack,
}

impl State {
    fn new(state_type: StateType, error_track: ErrorTrack) -> State {
        State {
            state_type,
            state_since: chrono::Utc::now(),
            error_track,
        }
    }

    pub fn initializing() -> State {
        State::new(StateType::Initializing, ErrorTrack::default())
    }

    pub fn ok() -> State {
        State::new(StateType::Ok, ErrorTrack::default())
    }

    pub fn interrupted(error_type: &str, message: impl Into<String>) -> State {
        State::new(
            StateType::Interrupted,
            ErrorTrack {
                error_type: error_type.to_owned(),
                message: message.into(),
            },
        )
    }

    pub fn error_off(error_type: &str, message: impl Into<String>) -> State {
        State::new(
            StateType::Off,
            ErrorTrack {
                error_type: error_type.to_owned(),
                message: message.into(),
            },
        )
    }

    pub fn normal_off() -> State {
        State::new(StateType::Off, ErrorTrack::default())
    }
}

struct StatusInner {
    current: State,
    listeners: HashMap<u64, mpsc::Sender<State>>,
    next_listener_id: u64,
}

/// Mediates between the synchronizer and the store, and owns the lifecycle
/// state machine. Cheap to clone; clones share the same store and state.
#[derive(Clone)]
pub struct DataUpdater {
    store: Arc<MemoryStore>,
    status: Arc<Mutex<StatusInner>>,
}

impl DataUpdater {
    pub fn new(store: Arc<MemoryStore>) -> DataUpdater {
        DataUpdater {
            store,
            status: Arc::new(Mutex::new(StatusInner {
                current: State::initializing(),
                listeners: HashMap::new(),
                next_listener_id: 0,
            })),
        }
    }

    /// Overwrite the snapshot with a full payload. Returns `true` when the
    /// store processed the request (including the benign "older version
    /// ignored" case).
    pub fn init(&self, all: DataSet, version: i64) -> bool {
        self.store.init(all, version);
        true
    }

    /// Upsert one item. Returns whether the store accepted it; a rejected
    /// item makes the synchronizer drop the connection and resync in full.
    pub fn upsert(&self, category: Category, key: &str, item: Arc<DataItem>, version: i64) -> bool {
        self.store.upsert(category, key, item, version)
    }

    pub fn storage_initialized(&self) -> bool {
        self.store.is_initialized()
    }

    pub fn version(&self) -> i64 {
        self.store.version()
    }

    /// Apply a state transition and broadcast the resulting state to all
    /// registered waiters.
    ///
    /// INTERRUPTED is only meaningful after a first OK: while the machine
    /// is still INITIALIZING, a transient failure keeps it INITIALIZING.
    pub fn update_status(&self, state: State) {
        let (current, listeners) = {
            let mut inner = self
                .status
                .lock()
                .expect("thread holding status lock should not panic");

            let mut new_type = state.state_type;
            if new_type == StateType::Interrupted
                && inner.current.state_type == StateType::Initializing
            {
                new_type = StateType::Initializing;
            }

            let state_since = if new_type != inner.current.state_type {
                state.state_since
            } else {
                inner.current.state_since
            };
            let error_track = if state.error_track.is_empty() {
                inner.current.error_track.clone()
            } else {
                state.error_track
            };

            inner.current = State {
                state_type: new_type,
                state_since,
                error_track,
            };

            (
                inner.current.clone(),
                inner.listeners.values().cloned().collect::<Vec<_>>(),
            )
        };

        // Fan out outside the lock so a waiter re-entering wait_for during
        // its own delivery cannot deadlock.
        for listener in listeners {
            let _ = listener.send(current.clone());
        }
    }

    pub fn current_state(&self) -> State {
        self.status
            .lock()
            .expect("thread holding status lock should not panic")
            .current
            .clone()
    }

    /// Block until the machine reaches `target`, goes OFF, or the timeout
    /// elapses. Returns immediately when already at `target` (true) or OFF
    /// (false). A zero timeout means wait indefinitely.
    pub fn wait_for(&self, target: StateType, timeout: Duration) -> bool {
        let (listener_id, receiver) = {
            let mut inner = self
                .status
                .lock()
                .expect("thread holding status lock should not panic");
            if inner.current.state_type == target {
                return true;
            }
            if inner.current.state_type == StateType::Off {
                return false;
            }
            let (tx, rx) = mpsc::channel();
            let id = inner.next_listener_id;
            inner.next_listener_id += 1;
            inner.listeners.insert(id, tx);
            (id, rx)
        };

        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };

        let reached = loop {
            let wait = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) => remaining,
                    None => break false,
                },
                None => Duration::from_secs(3600),
            };
            match receiver.recv_timeout(wait) {
                Ok(state) if state.state_type == target => break true,
                Ok(state) if state.state_type == StateType::Off => break false,
                Ok(_) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if deadline.is_some() {
                        break false;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break false,
            }
        };

        self.deregister(listener_id);
        reached
    }

    fn deregister(&self, listener_id: u64) {
        let mut inner = self
            .status
            .lock()
            .expect("thread holding status lock should not panic");
        inner.listeners.remove(&listener_id);
    }

    /// Drop all listeners so pending waiters return.
    pub fn close(&self) {
        let mut inner = self
            .status
            .lock()
            .expect("thread holding status lock should not panic");
        inner.listeners.clear();
    }
}

/// Read-only view over the updater's lifecycle state, handed to SDK users.
#[derive(Clone)]
pub struct StatusProvider {
    updater: DataUpdater,
}

impl StatusProvider {
    pub fn new(updater: DataUpdater) -> StatusProvider {
        StatusProvider { updater }
    }

    pub fn current_state(&self) -> State {
        self.updater.current_state()
    }

    /// See [`DataUpdater::wait_for`].
    pub fn wait_for(&self, target: StateType, timeout: Duration) -> bool {
        self.updater.wait_for(target, timeout)
    }

    /// Wait for the OK state; the common form after an asynchronous start.
    pub fn wait_for_ok(&self, timeout: Duration) -> bool {
        self.updater.wait_for(StateType::Ok, timeout)
    }

    pub fn close(&self) {
        self.updater.close();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;

    fn updater() -> DataUpdater {
        DataUpdater::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn interrupted_while_initializing_stays_initializing() {
        let updater = updater();
        updater.update_status(State::interrupted(ERROR_NETWORK, "connection reset"));
        let state = updater.current_state();
        assert_eq!(state.state_type, StateType::Initializing);
        assert_eq!(state.error_track.error_type, ERROR_NETWORK);
    }

    #[test]
    fn interrupted_after_ok_is_observed() {
        let updater = updater();
        updater.update_status(State::ok());
        updater.update_status(State::interrupted(ERROR_WEBSOCKET, "read failed"));
        assert_eq!(updater.current_state().state_type, StateType::Interrupted);
    }

    #[test]
    fn state_since_moves_only_on_type_change() {
        let updater = updater();
        updater.update_status(State::ok());
        let first = updater.current_state().state_since;
        updater.update_status(State::ok());
        assert_eq!(updater.current_state().state_since, first);
        updater.update_status(State::interrupted(ERROR_NETWORK, "boom"));
        assert_ne!(updater.current_state().state_type, StateType::Ok);
    }

    #[test]
    fn wait_for_returns_immediately_on_current_state() {
        let updater = updater();
        assert!(updater.wait_for(StateType::Initializing, Duration::from_millis(10)));
    }

    #[test]
    fn wait_for_returns_false_when_off() {
        let updater = updater();
        updater.update_status(State::normal_off());
        assert!(!updater.wait_for(StateType::Ok, Duration::from_secs(5)));
    }

    #[test]
    fn wait_for_unblocks_on_transition() {
        let updater = updater();
        let waiter = {
            let updater = updater.clone();
            std::thread::spawn(move || updater.wait_for(StateType::Ok, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(50));
        updater.update_status(State::ok());
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_for_times_out() {
        let updater = updater();
        assert!(!updater.wait_for(StateType::Ok, Duration::from_millis(50)));
    }

    #[test]
    fn upsert_reaches_the_store() {
        let store = Arc::new(MemoryStore::new());
        let updater = DataUpdater::new(store.clone());
        let flag: crate::data::FeatureFlag = serde_json::from_value(serde_json::json!({
            "key": "flag-a",
            "updatedAt": "2024-03-01T10:00:00Z",
        }))
        .unwrap();
        let ts = flag.timestamp();
        let item = Arc::new(crate::data::DataItem::Flag(flag));
        assert!(updater.upsert(crate::data::Category::FeatureFlags, "flag-a", item, ts));
        assert!(updater.storage_initialized());
        assert_eq!(updater.version(), ts);
        assert_eq!(store.version(), ts);
        let _unused: HashMap<String, _> = store.get_all(crate::data::Category::FeatureFlags);
    }
}
