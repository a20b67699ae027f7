//! The streaming data synchronizer: a long-lived WebSocket client that
//! keeps the snapshot store fresh with full and patch updates, reconnects
//! with backoff and jitter, and reports its lifecycle through the data
//! updater.
mod backoff;
mod token;

pub use backoff::BackoffJitterStrategy;
pub use token::build_token;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::data::{self, MessageEnvelope, SyncPayload};
use crate::network;
use crate::updater::{
    DataUpdater, State, ERROR_DATA_INVALID, ERROR_NETWORK, ERROR_REQUEST_INVALID, ERROR_UNKNOWN,
    ERROR_UNKNOWN_CLOSE_CODE, ERROR_WEBSOCKET, ERROR_WEBSOCKET_CLOSE_TIMEOUT,
};

const STREAMING_PATH: &str = "/streaming";
const PING_INTERVAL: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TO_PROCESS_CAPACITY: usize = 100;
const INVALID_REQUEST_CLOSE: u16 = 4003;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// One-shot startup signal handed out by [`DataSynchronizer::start`]. It
/// fires exactly once: when the first payload lands, or when the
/// synchronizer concludes it will never succeed.
pub struct ReadyListener {
    receiver: Option<mpsc::Receiver<()>>,
}

impl ReadyListener {
    fn fired() -> ReadyListener {
        ReadyListener { receiver: None }
    }

    /// Block up to `timeout` for the signal. A timeout is not an error of
    /// the synchronizer; it keeps running in the background.
    pub fn wait(&self, timeout: Duration) -> bool {
        let Some(receiver) = &self.receiver else {
            return true;
        };
        match receiver.recv_timeout(timeout) {
            Ok(()) => true,
            // The sender is dropped right after firing (or on thread
            // death); both mean there is nothing left to wait for.
            Err(mpsc::RecvTimeoutError::Disconnected) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }
}

/// The seam between the client facade and whatever keeps the store fresh.
pub trait DataSynchronizer: Send + Sync {
    /// Begin synchronizing. Subsequent calls are no-ops; only the first
    /// caller receives the live ready signal.
    fn start(&self) -> ReadyListener;

    /// True once at least one payload has been applied.
    fn is_initialized(&self) -> bool;

    /// Stop synchronizing and release the connection. Idempotent; all
    /// connection tasks have terminated when this returns.
    fn close(&self);
}

/// Messages handed from the read loop to the dispatch loop.
#[derive(Debug)]
enum SyncMessage {
    Data(Box<SyncPayload>),
    NormalClose,
    InvalidRequestClose,
    PeerAway,
    OtherClose(u16),
    JsonError,
    TransportError(String),
}

impl SyncMessage {
    /// After any non-data message the read loop has nothing further to do.
    fn ends_read_loop(&self) -> bool {
        !matches!(self, SyncMessage::Data(_))
    }
}

/// Classify one incoming frame; `None` means "nothing to dispatch" (pings
/// and non-text noise).
fn classify_frame(message: Message) -> Option<SyncMessage> {
    match message {
        Message::Text(text) => classify_text(&text),
        Message::Close(Some(frame)) => Some(classify_close(frame.code)),
        Message::Close(None) => Some(SyncMessage::OtherClose(CloseCode::Status.into())),
        _ => None,
    }
}

fn classify_text(text: &str) -> Option<SyncMessage> {
    let Ok(envelope) = serde_json::from_str::<MessageEnvelope>(text) else {
        return Some(SyncMessage::JsonError);
    };
    // Server pongs arrive as ping-typed sync messages; drop them.
    if envelope.is_ping() {
        return None;
    }
    match serde_json::from_str::<SyncPayload>(text) {
        Ok(payload) if payload.is_process_data() => Some(SyncMessage::Data(Box::new(payload))),
        _ => Some(SyncMessage::JsonError),
    }
}

fn classify_close(code: CloseCode) -> SyncMessage {
    match code {
        CloseCode::Normal => SyncMessage::NormalClose,
        CloseCode::Away => SyncMessage::PeerAway,
        CloseCode::Library(INVALID_REQUEST_CLOSE) => SyncMessage::InvalidRequestClose,
        other => SyncMessage::OtherClose(other.into()),
    }
}

enum LoopOutcome {
    Reconnect,
    Exit,
}

struct StreamingInner {
    updater: DataUpdater,
    streaming_uri: String,
    env_secret: String,
    first_retry_delay: Duration,
    max_retry_times: u64,
    initialized: AtomicBool,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    ready_tx: Mutex<Option<mpsc::Sender<()>>>,
}

/// The default synchronizer. One dedicated thread hosts a current-thread
/// async runtime driving the connect loop; per connection, a read task
/// decodes frames into a bounded channel consumed by the dispatch loop,
/// which also owns the keepalive ticker and the close signal.
pub struct StreamingSynchronizer {
    inner: Arc<StreamingInner>,
    started: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    ready_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl StreamingSynchronizer {
    /// `streaming_url` is the service base; the streaming path and auth
    /// query are appended per connection attempt.
    pub fn new(
        updater: DataUpdater,
        streaming_url: &str,
        env_secret: &str,
        first_retry_delay: Duration,
        max_retry_times: Option<u64>,
    ) -> StreamingSynchronizer {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (close_tx, _close_rx) = watch::channel(false);
        StreamingSynchronizer {
            inner: Arc::new(StreamingInner {
                updater,
                streaming_uri: format!("{}{}", streaming_url.trim_end_matches('/'), STREAMING_PATH),
                env_secret: env_secret.to_owned(),
                first_retry_delay,
                max_retry_times: max_retry_times.unwrap_or(u64::MAX),
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                close_tx,
                ready_tx: Mutex::new(Some(ready_tx)),
            }),
            started: AtomicBool::new(false),
            thread: Mutex::new(None),
            ready_rx: Mutex::new(Some(ready_rx)),
        }
    }
}

impl DataSynchronizer for StreamingSynchronizer {
    fn start(&self) -> ReadyListener {
        if !self.started.swap(true, Ordering::SeqCst) {
            log::debug!(target: "flagstream", "streaming is starting");
            let inner = self.inner.clone();
            let handle = std::thread::Builder::new()
                .name("flagstream-streaming".to_owned())
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            inner
                                .updater
                                .update_status(State::error_off(ERROR_UNKNOWN, err.to_string()));
                            inner.fire_ready();
                            return;
                        }
                    };
                    runtime.block_on(inner.run());
                });
            match handle {
                Ok(handle) => {
                    *self.thread.lock().expect("streaming thread lock poisoned") = Some(handle);
                }
                Err(err) => {
                    self.inner
                        .updater
                        .update_status(State::error_off(ERROR_UNKNOWN, err.to_string()));
                    self.inner.fire_ready();
                }
            }
        }
        match self
            .ready_rx
            .lock()
            .expect("streaming ready lock poisoned")
            .take()
        {
            Some(receiver) => ReadyListener {
                receiver: Some(receiver),
            },
            None => ReadyListener::fired(),
        }
    }

    fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "flagstream", "streaming is stopping");
        let _ = self.inner.close_tx.send(true);
        if let Some(handle) = self
            .thread
            .lock()
            .expect("streaming thread lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
        self.inner.fire_ready();
    }
}

impl StreamingInner {
    /// Signal (at most once) that startup has concluded, successfully or
    /// not. Dropping the sender afterwards wakes any later waiter too.
    fn fire_ready(&self) {
        if let Some(sender) = self
            .ready_tx
            .lock()
            .expect("streaming ready lock poisoned")
            .take()
        {
            let _ = sender.send(());
        }
    }

    async fn run(&self) {
        let mut strategy = BackoffJitterStrategy::new(self.first_retry_delay);
        let mut close_rx = self.close_tx.subscribe();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            if u64::from(strategy.retry_count()) > self.max_retry_times {
                self.updater.update_status(State::error_off(
                    ERROR_NETWORK,
                    "reconnect attempts exhausted",
                ));
                self.fire_ready();
                return;
            }
            match self.connect_and_dispatch(&mut strategy, &mut close_rx).await {
                LoopOutcome::Exit => return,
                LoopOutcome::Reconnect => {
                    let delay = strategy.next_delay();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = close_rx.changed() => return,
                    }
                }
            }
        }
    }

    async fn connect_and_dispatch(
        &self,
        strategy: &mut BackoffJitterStrategy,
        close_rx: &mut watch::Receiver<bool>,
    ) -> LoopOutcome {
        // An unresolvable host will never connect; give up for good.
        match self.probe_dns().await {
            Ok(()) => {}
            Err(message) => {
                log::error!(target: "flagstream", "host unknown: {message}");
                self.updater
                    .update_status(State::error_off(ERROR_NETWORK, message));
                self.fire_ready();
                return LoopOutcome::Exit;
            }
        }

        let url = format!(
            "{}?token={}&type=server",
            self.streaming_uri,
            token::build_token(&self.env_secret)
        );
        let mut request = match url.into_client_request() {
            Ok(request) => request,
            Err(err) => {
                self.updater
                    .update_status(State::error_off(ERROR_REQUEST_INVALID, err.to_string()));
                self.fire_ready();
                return LoopOutcome::Exit;
            }
        };
        if let Ok(value) = HeaderValue::from_str(&self.env_secret) {
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        request.headers_mut().insert(
            USER_AGENT,
            HeaderValue::from_static(network::SDK_USER_AGENT),
        );

        let ws = match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _response)) => ws,
            Err(err) => {
                log::warn!(target: "flagstream",
                    "streaming connect error: {err}, will reconnect");
                self.updater
                    .update_status(State::interrupted(ERROR_NETWORK, err.to_string()));
                return LoopOutcome::Reconnect;
            }
        };
        log::debug!(target: "flagstream", "streaming connection established");
        strategy.set_good_run_at_now();

        let (mut write, read) = ws.split();

        // Handshake: ask for everything newer than what we hold.
        let version = if self.updater.storage_initialized() {
            self.updater.version()
        } else {
            0
        };
        if write
            .send(Message::Text(data::sync_request_frame(version)))
            .await
            .is_err()
        {
            self.updater
                .update_status(State::interrupted(ERROR_WEBSOCKET, "handshake send failed"));
            return LoopOutcome::Reconnect;
        }

        let (r2p_tx, mut r2p_rx) = async_mpsc::channel(READ_TO_PROCESS_CAPACITY);
        let read_task = tokio::spawn(read_loop(read, r2p_tx, self.updater.clone()));
        let outcome = self.dispatch_loop(&mut write, &mut r2p_rx, close_rx).await;
        read_task.abort();
        outcome
    }

    async fn probe_dns(&self) -> Result<(), String> {
        let url = url::Url::parse(&self.streaming_uri).map_err(|err| err.to_string())?;
        let host = url.host_str().ok_or_else(|| "missing host".to_owned())?;
        let port = url.port_or_known_default().unwrap_or(80);
        tokio::net::lookup_host((host, port))
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    /// Drives the ping ticker, applies incoming payloads, and reacts to
    /// the close signal.
    async fn dispatch_loop(
        &self,
        write: &mut WsSink,
        r2p_rx: &mut async_mpsc::Receiver<SyncMessage>,
        close_rx: &mut watch::Receiver<bool>,
    ) -> LoopOutcome {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; swallow it.
        ping.tick().await;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let _ = write.send(Message::Text(data::PING_FRAME.to_owned())).await;
                }
                _ = close_rx.changed() => {
                    return self.graceful_close(write, r2p_rx).await;
                }
                message = r2p_rx.recv() => match message {
                    // Read loop ended (queue overflow or post-error drain);
                    // any status was already reported.
                    None => return LoopOutcome::Reconnect,
                    Some(SyncMessage::Data(payload)) => {
                        if !self.process_data(*payload) {
                            // The snapshot rejected the payload; drop the
                            // connection and let a fresh full sync repair us.
                            let _ = write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Away,
                                    reason: "data sync error".into(),
                                })))
                                .await;
                            return LoopOutcome::Reconnect;
                        }
                    }
                    Some(SyncMessage::NormalClose) => {
                        self.updater.update_status(State::normal_off());
                        self.fire_ready();
                        return LoopOutcome::Exit;
                    }
                    Some(SyncMessage::InvalidRequestClose) => {
                        self.updater.update_status(State::error_off(
                            ERROR_REQUEST_INVALID,
                            "invalid request",
                        ));
                        self.fire_ready();
                        return LoopOutcome::Exit;
                    }
                    Some(SyncMessage::JsonError) => {
                        log::error!(target: "flagstream",
                            "streaming failure: invalid payload, giving up");
                        self.updater.update_status(State::error_off(
                            ERROR_DATA_INVALID,
                            ERROR_DATA_INVALID,
                        ));
                        self.fire_ready();
                        return LoopOutcome::Exit;
                    }
                    // Peer-away is commonly our own triggered close; just
                    // restart quietly.
                    Some(SyncMessage::PeerAway) => return LoopOutcome::Reconnect,
                    Some(SyncMessage::OtherClose(code)) => {
                        self.updater.update_status(State::interrupted(
                            ERROR_UNKNOWN_CLOSE_CODE,
                            code.to_string(),
                        ));
                        return LoopOutcome::Reconnect;
                    }
                    Some(SyncMessage::TransportError(message)) => {
                        log::warn!(target: "flagstream",
                            "streaming will reconnect because of {message}");
                        self.updater
                            .update_status(State::interrupted(ERROR_WEBSOCKET, message));
                        return LoopOutcome::Reconnect;
                    }
                },
            }
        }
    }

    /// Send a normal close frame and wait (bounded) for the server's
    /// reply before tearing the connection down.
    async fn graceful_close(
        &self,
        write: &mut WsSink,
        r2p_rx: &mut async_mpsc::Receiver<SyncMessage>,
    ) -> LoopOutcome {
        log::debug!(target: "flagstream", "closing streaming connection");
        if let Err(err) = write
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
        {
            self.updater
                .update_status(State::error_off(ERROR_UNKNOWN, err.to_string()));
            return LoopOutcome::Exit;
        }
        match tokio::time::timeout(CLOSE_TIMEOUT, r2p_rx.recv()).await {
            Ok(_) => self.updater.update_status(State::normal_off()),
            Err(_elapsed) => {
                log::debug!(target: "flagstream", "timed out closing streaming, forcing exit");
                self.updater.update_status(State::error_off(
                    ERROR_WEBSOCKET_CLOSE_TIMEOUT,
                    ERROR_WEBSOCKET_CLOSE_TIMEOUT,
                ));
            }
        }
        LoopOutcome::Exit
    }

    /// Apply one payload through the data updater. The first successful
    /// apply (and only the first) reports OK and fires the ready signal.
    fn process_data(&self, payload: SyncPayload) -> bool {
        log::debug!(target: "flagstream", "processing {} data", payload.data.event_type);
        let full = payload.is_full();
        let version = payload.data.max_timestamp();
        let data_set = payload.data.into_data_set();

        let success = if full {
            self.updater.init(data_set, version)
        } else {
            let mut success = true;
            'apply: for (category, items) in data_set {
                for (key, item) in items {
                    let timestamp = item.timestamp();
                    if !self.updater.upsert(category, &key, item, timestamp) {
                        success = false;
                        break 'apply;
                    }
                }
            }
            success
        };

        if success && !self.initialized.swap(true, Ordering::SeqCst) {
            log::debug!(target: "flagstream", "processing data is well done");
            self.updater.update_status(State::ok());
            self.fire_ready();
        }
        success
    }
}

/// Decode incoming frames and push everything dispatch-worthy onto the
/// bounded channel. If the channel would block, the stream is considered
/// wedged: flag INTERRUPTED and bail out; the full sync after reconnect
/// restores consistency.
async fn read_loop(
    mut read: SplitStream<WsStream>,
    tx: async_mpsc::Sender<SyncMessage>,
    updater: DataUpdater,
) {
    loop {
        let message = match read.next().await {
            None => SyncMessage::TransportError("connection closed".to_owned()),
            Some(Err(err)) => SyncMessage::TransportError(err.to_string()),
            Some(Ok(frame)) => match classify_frame(frame) {
                Some(message) => message,
                None => continue,
            },
        };
        let ends_read_loop = message.ends_read_loop();
        match tx.try_send(message) {
            Ok(()) => {}
            Err(_) => {
                log::debug!(target: "flagstream",
                    "too many sync messages in queue, skip the message and restart");
                updater.update_status(State::interrupted(
                    ERROR_UNKNOWN,
                    "too many sync messages in queue, skip the message and restart",
                ));
                return;
            }
        }
        if ends_read_loop {
            return;
        }
    }
}

/// Offline stand-in: immediately ready, never connected. Stateless, so a
/// single shared instance serves every client; close stays side-effect
/// free.
pub struct NullDataSynchronizer;

impl NullDataSynchronizer {
    pub fn shared() -> Arc<NullDataSynchronizer> {
        static INSTANCE: OnceLock<Arc<NullDataSynchronizer>> = OnceLock::new();
        INSTANCE
            .get_or_init(|| Arc::new(NullDataSynchronizer))
            .clone()
    }
}

impl DataSynchronizer for NullDataSynchronizer {
    fn start(&self) -> ReadyListener {
        ReadyListener::fired()
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests;
