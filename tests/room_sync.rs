//! End-to-end sync behavior of the room core: outbound frame shapes,
//! batching, the unacknowledged-op ledger, and reconnect resend.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use liveroom::auth::AuthEndpoint;
use liveroom::channel::{ChannelEvent, ChannelSender};
use liveroom::config::RoomConfig;
use liveroom::room::{LiveValue, RoomCore, StorageStatus};
use liveroom::token::AuthToken;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

fn test_config() -> RoomConfig {
    let mut config = RoomConfig::new(
        "test-room",
        "wss://rooms.example.io",
        AuthEndpoint::Private {
            url: "https://example.io/api/auth".into(),
        },
    );
    config.throttle = Duration::from_millis(16);
    config
}

fn test_token(actor: i64) -> AuthToken {
    AuthToken {
        raw: "raw-token".into(),
        actor,
        scopes: vec!["room:write".into()],
        user_id: None,
        user_info: None,
        exp: u64::MAX / 2,
        iat: 0,
    }
}

fn open_room(actor: i64) -> (RoomCore, UnboundedReceiver<String>, Instant) {
    let mut core = RoomCore::new(test_config());
    let now = Instant::now();
    core.connect(now);
    core.auth_succeeded(test_token(actor), now);
    let (sender, rx) = ChannelSender::new_pair();
    core.channel_opened(sender, now);
    (core, rx, now)
}

fn load_default_storage(core: &mut RoomCore, now: Instant) {
    core.handle_message(
        &json!({
            "type": 200,
            "items": [["0:0", { "type": 0, "data": { "a": 0, "b": 0 } }]],
        })
        .to_string(),
        now,
    );
}

/// Drain outbound frames and flatten them into individual messages.
fn sent_messages(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if frame == "ping" {
            continue;
        }
        match serde_json::from_str::<Value>(&frame) {
            Ok(Value::Array(items)) => out.extend(items),
            Ok(v) => out.push(v),
            Err(_) => {}
        }
    }
    out
}

fn update_storage_messages(messages: &[Value]) -> Vec<&Value> {
    messages.iter().filter(|m| m["type"] == json!(201)).collect()
}

#[test]
fn presence_keyframe_merges_pending_updates_on_reconnect() {
    // S1: after a reconnect the queued presence goes out as one full
    // keyframe with targetActor -1, carrying the merged record.
    let mut config = test_config();
    config.initial_presence.insert("color".into(), json!("red"));
    let mut core = RoomCore::new(config);
    let mut now = Instant::now();
    core.connect(now);
    core.auth_succeeded(test_token(7), now);
    let (sender, mut rx) = ChannelSender::new_pair();
    core.channel_opened(sender, now);
    let _ = sent_messages(&mut rx);

    let mut patch = serde_json::Map::new();
    patch.insert("x".into(), json!(1));
    core.update_presence(patch, false, now);
    let mut patch = serde_json::Map::new();
    patch.insert("y".into(), json!(2));
    core.update_presence(patch, false, now);

    // The channel dies; the retry fires with the cached token and a new
    // channel opens.
    core.handle_channel_event(
        core.channel_generation(),
        ChannelEvent::Closed {
            code: None,
            reason: String::new(),
        },
        now,
    );
    now += Duration::from_secs(1);
    core.tick(now);
    let (sender, mut rx2) = ChannelSender::new_pair();
    core.channel_opened(sender, now);

    let messages = sent_messages(&mut rx2);
    let presence: Vec<&Value> = messages.iter().filter(|m| m["type"] == json!(100)).collect();
    assert_eq!(presence.len(), 1);
    assert_eq!(presence[0]["targetActor"], json!(-1));
    assert_eq!(
        presence[0]["data"],
        json!({ "color": "red", "x": 1, "y": 2 })
    );
}

#[test]
fn batch_collapses_updates_and_ops() {
    // S2: one observer emission with merged updates, one UPDATE_STORAGE
    // with exactly two ops.
    let (mut core, mut rx, now) = open_room(1);
    load_default_storage(&mut core, now);
    let _ = sent_messages(&mut rx);

    let emissions: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = emissions.clone();
    core.events_mut().on_storage("0:0", false, move |updates| {
        let keys: Vec<String> = updates.iter().map(|u| u.node_id.clone()).collect();
        sink.lock().unwrap().push(keys);
    });

    let later = now + Duration::from_secs(1);
    core.batch(later, |room| {
        room.object_set("0:0", "a", LiveValue::Json(json!(1)), later)
            .unwrap();
        room.object_set("0:0", "b", LiveValue::Json(json!(1)), later)
            .unwrap();
    });

    // Exactly one emission, carrying one merged update for the root.
    let emissions = emissions.lock().unwrap();
    assert_eq!(emissions.len(), 1);
    assert_eq!(emissions[0], vec!["0:0".to_string()]);

    let messages = sent_messages(&mut rx);
    let storage = update_storage_messages(&messages);
    assert_eq!(storage.len(), 1);
    assert_eq!(storage[0]["ops"].as_array().unwrap().len(), 2);
}

#[test]
fn ledger_tracks_dispatch_and_ack() {
    // Property 2: dispatched implies in ledger; acked implies absent.
    let (mut core, mut rx, now) = open_room(1);
    load_default_storage(&mut core, now);
    let _ = sent_messages(&mut rx);

    let later = now + Duration::from_secs(1);
    core.object_set("0:0", "a", LiveValue::Json(json!(7)), later)
        .unwrap();
    assert_eq!(core.ledger().len(), 1);
    assert_eq!(core.storage_status(), StorageStatus::Synchronizing);

    // Grab the op as it went over the wire and echo it back.
    let messages = sent_messages(&mut rx);
    let storage = update_storage_messages(&messages);
    let op = storage[0]["ops"][0].clone();
    let op_id = op["opId"].as_str().unwrap().to_string();
    assert!(core.ledger().contains(&op_id));

    core.handle_message(
        &json!({ "type": 201, "ops": [op] }).to_string(),
        later + Duration::from_millis(50),
    );
    assert!(core.ledger().is_empty());
    assert_eq!(core.storage_status(), StorageStatus::Synchronized);
    // The ack did not disturb the replica.
    assert_eq!(core.node_json("0:0").unwrap()["a"], json!(7));
}

#[test]
fn ack_opcode_clears_ledger_without_applying() {
    let (mut core, mut rx, now) = open_room(1);
    load_default_storage(&mut core, now);
    let later = now + Duration::from_secs(1);
    core.object_set("0:0", "a", LiveValue::Json(json!(3)), later)
        .unwrap();
    let messages = sent_messages(&mut rx);
    let op_id = update_storage_messages(&messages)[0]["ops"][0]["opId"]
        .as_str()
        .unwrap()
        .to_string();

    core.handle_message(
        &json!({ "type": 201, "ops": [{ "type": 0, "opId": op_id }] }).to_string(),
        later,
    );
    assert!(core.ledger().is_empty());
    assert_eq!(core.node_json("0:0").unwrap()["a"], json!(3));
}

#[test]
fn reconnect_resends_unacked_ops_exactly_once() {
    // S7 / property 8: after reconnect and the next initial storage
    // state, exactly one UPDATE_STORAGE frame carries the unacked op.
    let (mut core, mut rx, now) = open_room(1);
    load_default_storage(&mut core, now);
    let _ = sent_messages(&mut rx);

    let later = now + Duration::from_secs(1);
    core.object_set("0:0", "a", LiveValue::Json(json!(9)), later)
        .unwrap();
    let _ = sent_messages(&mut rx);
    assert_eq!(core.ledger().len(), 1);

    // The channel dies before the server confirms.
    core.handle_channel_event(
        core.channel_generation(),
        ChannelEvent::Closed {
            code: None,
            reason: String::new(),
        },
        later,
    );
    assert_eq!(core.ledger().len(), 1);

    // Reconnect with the cached token.
    let reconnect_at = later + Duration::from_secs(2);
    core.tick(reconnect_at);
    let (sender, mut rx2) = ChannelSender::new_pair();
    core.channel_opened(sender, reconnect_at);

    // The server replays a baseline without our edit.
    let resync_at = reconnect_at + Duration::from_secs(1);
    load_default_storage(&mut core, resync_at);

    let messages = sent_messages(&mut rx2);
    // Reconnect refetches storage.
    assert!(messages.iter().any(|m| m["type"] == json!(200)));
    let storage = update_storage_messages(&messages);
    assert_eq!(storage.len(), 1);
    let ops = storage[0]["ops"].as_array().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["data"], json!({ "a": 9 }));

    // The replica kept the local value on top of the fresh baseline.
    assert_eq!(core.node_json("0:0").unwrap()["a"], json!(9));
    // Nothing further is queued: no second resend can happen.
    assert!(sent_messages(&mut rx2).is_empty());
}

#[test]
fn remote_ops_reach_observers_with_merged_updates() {
    let (mut core, _rx, now) = open_room(1);
    load_default_storage(&mut core, now);

    let emissions: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = emissions.clone();
    core.events_mut().on_storage("0:0", false, move |updates| {
        sink.lock().unwrap().push(updates.len());
    });

    core.handle_message(
        &json!({
            "type": 201,
            "ops": [
                { "type": 1, "opId": "9:0", "id": "0:0", "data": { "a": 1 } },
                { "type": 1, "opId": "9:1", "id": "0:0", "data": { "b": 2 } },
            ],
        })
        .to_string(),
        now,
    );

    // Two ops on the same node, one emission with one merged update.
    assert_eq!(&*emissions.lock().unwrap(), &[1]);
    assert_eq!(core.node_json("0:0").unwrap()["a"], json!(1));
    assert_eq!(core.node_json("0:0").unwrap()["b"], json!(2));
}

#[test]
fn deep_subscription_sees_descendant_updates() {
    let (mut core, _rx, now) = open_room(1);
    core.handle_message(
        &json!({
            "type": 200,
            "items": [
                ["0:0", { "type": 0, "data": {} }],
                ["0:1", { "type": 0, "parentId": "0:0", "parentKey": "child", "data": { "v": 0 } }],
            ],
        })
        .to_string(),
        now,
    );

    let deep_hits = Arc::new(Mutex::new(0usize));
    let shallow_hits = Arc::new(Mutex::new(0usize));
    let d = deep_hits.clone();
    core.events_mut().on_storage("0:0", true, move |_| {
        *d.lock().unwrap() += 1;
    });
    let s = shallow_hits.clone();
    core.events_mut().on_storage("0:0", false, move |_| {
        *s.lock().unwrap() += 1;
    });

    core.handle_message(
        &json!({
            "type": 201,
            "ops": [{ "type": 1, "opId": "9:0", "id": "0:1", "data": { "v": 5 } }],
        })
        .to_string(),
        now,
    );

    // The child update reaches the deep subscription only.
    assert_eq!(*deep_hits.lock().unwrap(), 1);
    assert_eq!(*shallow_hits.lock().unwrap(), 0);
}

#[test]
fn storage_status_emits_only_on_change() {
    // Property 4: idempotent assignments emit nothing.
    let (mut core, _rx, now) = open_room(1);
    let seen: Arc<Mutex<Vec<StorageStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    core.events_mut().on_storage_status(move |status| {
        sink.lock().unwrap().push(*status);
    });

    let _waiter = core.request_storage(now);
    load_default_storage(&mut core, now);
    let later = now + Duration::from_secs(1);
    core.object_set("0:0", "a", LiveValue::Json(json!(1)), later)
        .unwrap();
    // A second local op: status is already synchronizing, no new event.
    core.object_set("0:0", "a", LiveValue::Json(json!(2)), later)
        .unwrap();

    assert_eq!(
        &*seen.lock().unwrap(),
        &[
            StorageStatus::Loading,
            StorageStatus::Synchronized,
            StorageStatus::Synchronizing,
        ]
    );
}

#[test]
fn create_then_mutate_collapses_into_creation() {
    // Mutations on a node created in the same batch surface only as the
    // parent-level creation update.
    let (mut core, _rx, now) = open_room(1);
    load_default_storage(&mut core, now);

    let emissions: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = emissions.clone();
    core.events_mut().on_storage("0:0", true, move |updates| {
        sink.lock()
            .unwrap()
            .push(updates.iter().map(|u| u.node_id.clone()).collect());
    });

    let later = now + Duration::from_secs(1);
    core.batch(later, |room| {
        room.object_set(
            "0:0",
            "list",
            LiveValue::List(vec![
                LiveValue::Json(json!("x")),
                LiveValue::Json(json!("y")),
            ]),
            later,
        )
        .unwrap();
    });

    // One emission; only the root (attach point) is reported, not the
    // freshly created list node.
    let emissions = emissions.lock().unwrap();
    assert_eq!(emissions.len(), 1);
    assert_eq!(emissions[0], vec!["0:0".to_string()]);
}

#[test]
fn throttle_coalesces_frames() {
    let (mut core, mut rx, now) = open_room(1);
    load_default_storage(&mut core, now);
    let _ = sent_messages(&mut rx);

    // Flush window is still open from the connect keyframe: these two
    // updates buffer instead of sending.
    let mut patch = serde_json::Map::new();
    patch.insert("x".into(), json!(1));
    core.update_presence(patch, false, now);
    let mut patch = serde_json::Map::new();
    patch.insert("y".into(), json!(2));
    core.update_presence(patch, false, now);
    assert!(sent_messages(&mut rx).is_empty());

    // Once the throttle elapses, the timer fires and one frame carries
    // the coalesced patch.
    let deadline = core.next_deadline().unwrap();
    core.tick(deadline);
    let messages = sent_messages(&mut rx);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["data"], json!({ "x": 1, "y": 2 }));
}

#[test]
fn offline_mutations_survive_for_resend() {
    let (mut core, mut rx, now) = open_room(1);
    load_default_storage(&mut core, now);
    core.handle_channel_event(
        core.channel_generation(),
        ChannelEvent::Closed {
            code: None,
            reason: String::new(),
        },
        now,
    );
    let _ = sent_messages(&mut rx);

    // Editing while unavailable still applies locally and ledgers the op.
    let later = now + Duration::from_secs(1);
    core.object_set("0:0", "a", LiveValue::Json(json!(4)), later)
        .unwrap();
    assert_eq!(core.node_json("0:0").unwrap()["a"], json!(4));
    assert_eq!(core.ledger().len(), 1);
}
