mod common;

use common::*;
use serde_json::json;
use spaces_client::{ConnectionState, ErrorCode, MultiplayerConfig, MultiplayerConnection};
use spaces_shared::constants::hub::*;
use spaces_shared::{Scope, SpaceTransform, Vector3};
use spaces_shared::entity::SpaceEntityType;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;

fn record_code() -> (Arc<Mutex<Vec<ErrorCode>>>, spaces_client::net::event_bus::ErrorCodeCallback) {
    let codes = Arc::new(Mutex::new(Vec::new()));
    let sink = codes.clone();
    (codes, Box::new(move |code| sink.lock().unwrap().push(code)))
}

fn record_reasons(connection: &MultiplayerConnection) -> Arc<Mutex<Vec<String>>> {
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = reasons.clone();
    connection.set_disconnection_callback(Arc::new(move |reason| sink.lock().unwrap().push(reason.to_string())));
    reasons
}

#[test]
fn handshake_runs_in_order() {
    let fx = connected(12, MultiplayerConfig::default());

    assert_eq!(fx.transport.methods(), vec![DELETE_OBJECTS, GET_CLIENT_ID, START_LISTENING]);
    assert_eq!(fx.transport.calls_to(DELETE_OBJECTS), vec![json!([[u64::MAX]])]);
    assert_eq!(fx.connection.get_client_id(), 12);
    assert!(fx.connection.is_connected());
    assert_eq!(fx.connection.get_connection_state(), ConnectionState::Connected);
    assert!(!fx.connection.cancellation_token().is_cancelled());
}

#[test]
fn connection_callback_reports_success() {
    init_logging();
    let transport = MockTransport::new(4);
    let connection = MultiplayerConnection::new(transport.clone(), MultiplayerConfig::default(), MockRunner::new());

    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    connection.set_connection_callback(Arc::new(move |m| sink.lock().unwrap().push(m.to_string())));

    let (codes, callback) = record_code();
    connection.connect(callback);

    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::None]);
    assert_eq!(*messages.lock().unwrap(), vec!["Success".to_string()]);
}

#[test]
fn second_connect_is_rejected() {
    let fx = connected(1, MultiplayerConfig::default());
    let (codes, callback) = record_code();
    fx.connection.connect(callback);

    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::AlreadyConnected]);
    assert_eq!(fx.transport.start_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn disconnect_reports_once_and_clears_the_session() {
    let fx = connected(1, MultiplayerConfig::default());
    let reasons = record_reasons(&fx.connection);
    deliver(&fx.transport, &remote_entity(8, SpaceEntityType::Object, 2, "Rock"));
    fx.connection.space_entity_system().tick_entities();
    let token = fx.connection.cancellation_token();

    let (codes, callback) = record_code();
    fx.connection.disconnect(callback);

    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::None]);
    assert_eq!(*reasons.lock().unwrap(), vec!["Client called disconnect.".to_string()]);
    assert_eq!(fx.connection.get_connection_state(), ConnectionState::Disconnected);
    assert_eq!(fx.connection.space_entity_system().get_num_entities(), 0);
    assert_eq!(fx.transport.stop_calls.load(Ordering::SeqCst), 1);
    assert!(token.is_cancelled());

    let (codes, callback) = record_code();
    fx.connection.disconnect(callback);
    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::NotConnected]);
    assert_eq!(reasons.lock().unwrap().len(), 1);
}

#[test]
fn disconnect_without_connecting_is_not_connected() {
    let connection = MultiplayerConnection::new(MockTransport::new(1), MultiplayerConfig::default(), MockRunner::new());
    let (codes, callback) = record_code();
    connection.disconnect(callback);
    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::NotConnected]);
}

#[test]
fn reconnect_after_disconnect_starts_fresh() {
    let fx = connected(1, MultiplayerConfig::default());
    let old_token = fx.connection.cancellation_token();
    fx.connection.disconnect(Box::new(|_| {}));
    fx.transport.clear_invocations();

    let (codes, callback) = record_code();
    fx.connection.connect(callback);

    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::None]);
    assert_eq!(fx.transport.methods(), vec![DELETE_OBJECTS, GET_CLIENT_ID, START_LISTENING]);
    assert!(old_token.is_cancelled());
    assert!(!fx.connection.cancellation_token().is_cancelled());
}

#[test]
fn failed_handshake_disconnects_with_the_error() {
    init_logging();
    let transport = MockTransport::new(1);
    transport.fail(GET_CLIENT_ID);
    let connection = MultiplayerConnection::new(transport.clone(), MultiplayerConfig::default(), MockRunner::new());
    let reasons = record_reasons(&connection);

    let (codes, callback) = record_code();
    connection.connect(callback);

    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::Unknown]);
    assert_eq!(connection.get_connection_state(), ConnectionState::Disconnected);
    assert!(transport.calls_to(START_LISTENING).is_empty());
    let reasons = reasons.lock().unwrap();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].contains("GetClientId rejected"));
}

#[test]
fn interruption_reports_once_and_drops_entities() {
    let fx = connected(1, MultiplayerConfig::default());
    deliver(&fx.transport, &remote_entity(8, SpaceEntityType::Object, 2, "Rock"));
    fx.connection.space_entity_system().tick_entities();

    let interruptions = Arc::new(AtomicUsize::new(0));
    let counter = interruptions.clone();
    fx.connection.set_network_interruption_callback(Arc::new(move |message| {
        assert_eq!(message, "socket reset");
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let token = fx.connection.cancellation_token();

    fx.transport.interrupt("socket reset");
    fx.transport.interrupt("socket reset");

    assert_eq!(interruptions.load(Ordering::SeqCst), 1);
    assert_eq!(fx.connection.get_connection_state(), ConnectionState::Disconnected);
    assert_eq!(fx.connection.space_entity_system().get_num_entities(), 0);
    assert!(token.is_cancelled());
}

#[test]
fn server_can_request_a_disconnect() {
    let fx = connected(1, MultiplayerConfig::default());
    let reasons = record_reasons(&fx.connection);

    fx.transport.fire(ON_REQUEST_TO_DISCONNECT, json!(["Space closed"]));

    assert_eq!(*reasons.lock().unwrap(), vec!["Space closed".to_string()]);
    assert!(!fx.connection.is_connected());
}

#[test]
fn scope_calls_need_a_connection() {
    let connection = MultiplayerConnection::new(MockTransport::new(1), MultiplayerConfig::default(), MockRunner::new());
    let (codes, callback) = record_code();
    connection.set_scopes(&[Scope::for_space("space-1")], callback);
    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::NotConnected]);

    let fx = connected(1, MultiplayerConfig::default());
    let (codes, callback) = record_code();
    fx.connection.set_scopes(&[Scope::for_space("space-1")], callback);
    let (reset_codes, reset_callback) = record_code();
    fx.connection.reset_scopes(reset_callback);

    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::None]);
    assert_eq!(*reset_codes.lock().unwrap(), vec![ErrorCode::None]);
    let sent = fx.transport.calls_to(SET_SCOPES);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0][0][0]["id"], json!("space-1"));
}

#[test]
fn self_messaging_flag_follows_the_server() {
    let fx = connected(1, MultiplayerConfig::default());
    assert!(!fx.connection.get_allow_self_messaging());

    let (codes, callback) = record_code();
    fx.connection.set_allow_self_messaging(true, callback);
    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::None]);
    assert!(fx.connection.get_allow_self_messaging());

    fx.transport.fail(SET_ALLOW_SELF_MESSAGING);
    let (codes, callback) = record_code();
    fx.connection.set_allow_self_messaging(false, callback);
    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::Unknown]);
    assert!(fx.connection.get_allow_self_messaging());
}

#[test]
fn entities_cannot_be_created_offline() {
    let connection = MultiplayerConnection::new(MockTransport::new(1), MultiplayerConfig::default(), MockRunner::new());
    let created = Arc::new(Mutex::new(None));
    let sink = created.clone();
    connection
        .space_entity_system()
        .create_object("Offline", SpaceTransform::identity(), Box::new(move |e| *sink.lock().unwrap() = Some(e.is_some())));
    assert_eq!(*created.lock().unwrap(), Some(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tick_loop_flushes_until_disconnect() {
    let config = MultiplayerConfig { tick_interval_ms: 5, ..unthrottled() };
    let fx = connected(1, config);
    let system = fx.connection.space_entity_system().clone();

    let created = Arc::new(Mutex::new(None));
    let sink = created.clone();
    system.create_object("Kite", SpaceTransform::identity(), Box::new(move |e| *sink.lock().unwrap() = e));
    let kite = created.lock().unwrap().take().unwrap();

    let ticker = fx.connection.spawn_tick_loop(&Handle::current());

    kite.set_position(Vector3::new(0.0, 10.0, 0.0));
    kite.queue_update();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.transport.sent_patches().len(), 1);

    fx.connection.disconnect(Box::new(|_| {}));
    tokio::time::timeout(Duration::from_secs(1), ticker).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_tick_interval_still_ticks() {
    let config = MultiplayerConfig { tick_interval_ms: 0, ..unthrottled() };
    let fx = connected(1, config);
    let system = fx.connection.space_entity_system().clone();

    let created = Arc::new(Mutex::new(None));
    let sink = created.clone();
    system.create_object("Pebble", SpaceTransform::identity(), Box::new(move |e| *sink.lock().unwrap() = e));
    let pebble = created.lock().unwrap().take().unwrap();

    let ticker = fx.connection.spawn_tick_loop(&Handle::current());
    pebble.set_position(Vector3::new(1.0, 0.0, 0.0));
    pebble.queue_update();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.transport.sent_patches().len(), 1);

    fx.connection.disconnect(Box::new(|_| {}));
    tokio::time::timeout(Duration::from_secs(1), ticker).await.unwrap().unwrap();
}
