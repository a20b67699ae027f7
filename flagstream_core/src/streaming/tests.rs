use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use super::*;
use crate::store::MemoryStore;
use crate::updater::StateType;

const FULL_PAYLOAD: &str = r#"{
  "messageType": "data-sync",
  "data": {
    "eventType": "full",
    "featureFlags": [{
      "key": "flag-a",
      "name": "Flag A",
      "isEnabled": true,
      "variationType": "boolean",
      "variations": [{"id": "v1", "value": "true"}],
      "fallthrough": {"variations": [{"id": "v1", "rollout": [0.0, 1.0]}]},
      "updatedAt": "2024-03-01T10:00:00Z"
    }],
    "segments": []
  }
}"#;

/// A one-connection echo of the control plane: answers the handshake with
/// the given payload, then keeps the socket open until the client closes.
fn spawn_server(payload: &'static str) -> (String, mpsc::Receiver<String>) {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (frame_tx, frame_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) => {
                        let _ = frame_tx.send(text.clone());
                        if text.contains(r#""messageType":"data-sync""#) {
                            ws.send(Message::Text(payload.to_owned())).await.unwrap();
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            // Keep polling so the close handshake completes.
            while let Some(Ok(_)) = ws.next().await {}
        });
    });
    let addr = addr_rx.recv().unwrap();
    (format!("ws://{addr}"), frame_rx)
}

fn synchronizer(base_url: &str) -> (StreamingSynchronizer, DataUpdater, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let updater = DataUpdater::new(store.clone());
    let sync = StreamingSynchronizer::new(
        updater.clone(),
        base_url,
        "a1b2c3d4e5f6",
        Duration::from_millis(100),
        None,
    );
    (sync, updater, store)
}

#[test]
fn full_sync_initializes_the_store() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (base_url, frames) = spawn_server(FULL_PAYLOAD);
    let (sync, updater, store) = synchronizer(&base_url);

    let ready = sync.start();
    assert!(ready.wait(Duration::from_secs(5)));
    assert!(sync.is_initialized());
    assert!(store.is_initialized());
    assert_eq!(updater.current_state().state_type, StateType::Ok);

    // The handshake carried version 0 for the empty store.
    let handshake = frames.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(handshake.contains(r#""timestamp":0"#));

    sync.close();
    assert_eq!(updater.current_state().state_type, StateType::Off);
}

#[test]
fn close_is_idempotent_and_terminal() {
    let (base_url, _frames) = spawn_server(FULL_PAYLOAD);
    let (sync, updater, _store) = synchronizer(&base_url);

    let ready = sync.start();
    assert!(ready.wait(Duration::from_secs(5)));
    sync.close();
    sync.close();
    assert_eq!(updater.current_state().state_type, StateType::Off);
    // OFF is terminal: a waiter fails immediately.
    assert!(!updater.wait_for(StateType::Ok, Duration::from_secs(1)));
}

#[test]
fn dns_failure_gives_up_for_good() {
    let (sync, updater, _store) =
        synchronizer("ws://no-such-host.invalid:9999");
    let ready = sync.start();
    // The ready signal fires on permanent failure too.
    assert!(ready.wait(Duration::from_secs(10)));
    assert!(!sync.is_initialized());
    assert_eq!(updater.current_state().state_type, StateType::Off);
    sync.close();
}

#[test]
fn null_synchronizer_is_ready_immediately() {
    let sync = NullDataSynchronizer::shared();
    assert!(sync.start().wait(Duration::ZERO));
    assert!(sync.is_initialized());
    sync.close();
}

#[test]
fn close_codes_map_to_actions() {
    assert!(matches!(
        classify_close(CloseCode::Normal),
        SyncMessage::NormalClose
    ));
    assert!(matches!(
        classify_close(CloseCode::Away),
        SyncMessage::PeerAway
    ));
    assert!(matches!(
        classify_close(CloseCode::Library(4003)),
        SyncMessage::InvalidRequestClose
    ));
    assert!(matches!(
        classify_close(CloseCode::Library(4500)),
        SyncMessage::OtherClose(4500)
    ));
}

#[test]
fn text_frames_are_classified() {
    assert!(classify_text(r#"{"messageType":"ping","data":{"timestamp":0}}"#).is_none());
    assert!(matches!(
        classify_text(FULL_PAYLOAD),
        Some(SyncMessage::Data(_))
    ));
    assert!(matches!(
        classify_text("{not json"),
        Some(SyncMessage::JsonError)
    ));
    assert!(matches!(
        classify_text(r#"{"messageType":"data-sync","data":{"eventType":"mystery"}}"#),
        Some(SyncMessage::JsonError)
    ));
}
