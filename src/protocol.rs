//! JSON wire protocol between the room client and the coordination server.
//!
//! Every frame is a text frame carrying either a single JSON object or a
//! JSON array of objects. The `type` field is a small integer opcode.
//! Inbound frames are structurally decoded without full schema validation:
//! a hand-written tagged-variant decoder checks each field it needs and
//! drops anything malformed.
//!
//! The server additionally sends the literal string `"pong"` (not JSON) in
//! response to an outbound `"ping"`; that exchange is handled one level up.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

/// Shorthand for a JSON object used as presence or op payload data.
pub type JsonMap = Map<String, Value>;

/// Close code that ends the session without any reconnect attempt.
pub const CLOSE_WITHOUT_RETRY: u16 = 4999;

/// Inclusive close-code band meaning "rejected: surface the error, then
/// retry on the slow schedule".
pub const REJECT_CODE_MIN: u16 = 4000;
pub const REJECT_CODE_MAX: u16 = 4100;

/// Sentinel `targetActor` marking an outbound presence message as a full
/// keyframe broadcast: recipients replace their cached entry wholesale.
pub const KEYFRAME_TARGET: i64 = -1;

// Client-to-server opcodes.
pub const CLIENT_UPDATE_PRESENCE: u64 = 100;
pub const CLIENT_BROADCAST_EVENT: u64 = 103;
pub const CLIENT_FETCH_STORAGE: u64 = 200;
pub const CLIENT_UPDATE_STORAGE: u64 = 201;

// Server-to-client opcodes.
pub const SERVER_UPDATE_PRESENCE: u64 = 100;
pub const SERVER_USER_JOINED: u64 = 101;
pub const SERVER_USER_LEFT: u64 = 102;
pub const SERVER_BROADCASTED_EVENT: u64 = 103;
pub const SERVER_ROOM_STATE: u64 = 104;
pub const SERVER_INITIAL_STORAGE_STATE: u64 = 200;
pub const SERVER_UPDATE_STORAGE: u64 = 201;
pub const SERVER_REJECT_STORAGE_OP: u64 = 299;

// Op codes inside UPDATE_STORAGE payloads.
pub const OP_ACK: u64 = 0;
pub const OP_UPDATE_OBJECT: u64 = 1;
pub const OP_CREATE_OBJECT: u64 = 2;
pub const OP_CREATE_LIST: u64 = 3;
pub const OP_CREATE_MAP: u64 = 4;
pub const OP_CREATE_REGISTER: u64 = 5;
pub const OP_DELETE_CRDT: u64 = 6;
pub const OP_SET_PARENT_KEY: u64 = 7;
pub const OP_DELETE_OBJECT_KEY: u64 = 8;

// Serialized node kind tags.
pub const CRDT_OBJECT: u64 = 0;
pub const CRDT_REGISTER: u64 = 1;
pub const CRDT_LIST: u64 = 2;
pub const CRDT_MAP: u64 = 3;

/// A single mutation descriptor on the storage tree, or an Ack echo.
///
/// Every non-Ack op carries a unique `op_id` (`"<actor>:<n>"`) assigned at
/// dispatch time. Ops produced as reverse (compensating) ops are stored
/// without an id and receive a fresh one when they are re-applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Server echo with no state effect; only clears the ledger entry.
    Ack { op_id: String },
    UpdateObject {
        op_id: Option<String>,
        id: String,
        data: JsonMap,
    },
    CreateObject {
        op_id: Option<String>,
        id: String,
        parent_id: String,
        parent_key: String,
        data: JsonMap,
    },
    CreateList {
        op_id: Option<String>,
        id: String,
        parent_id: String,
        parent_key: String,
    },
    CreateMap {
        op_id: Option<String>,
        id: String,
        parent_id: String,
        parent_key: String,
    },
    CreateRegister {
        op_id: Option<String>,
        id: String,
        parent_id: String,
        parent_key: String,
        data: Value,
    },
    DeleteCrdt {
        op_id: Option<String>,
        id: String,
    },
    SetParentKey {
        op_id: Option<String>,
        id: String,
        parent_key: String,
    },
    DeleteObjectKey {
        op_id: Option<String>,
        id: String,
        key: String,
    },
}

impl Op {
    /// The dispatch-time op id, if one has been assigned.
    pub fn op_id(&self) -> Option<&str> {
        match self {
            Op::Ack { op_id } => Some(op_id),
            Op::UpdateObject { op_id, .. }
            | Op::CreateObject { op_id, .. }
            | Op::CreateList { op_id, .. }
            | Op::CreateMap { op_id, .. }
            | Op::CreateRegister { op_id, .. }
            | Op::DeleteCrdt { op_id, .. }
            | Op::SetParentKey { op_id, .. }
            | Op::DeleteObjectKey { op_id, .. } => op_id.as_deref(),
        }
    }

    /// Assign an op id. No-op for Ack (an ack always carries one).
    pub fn set_op_id(&mut self, new_id: String) {
        match self {
            Op::Ack { .. } => {}
            Op::UpdateObject { op_id, .. }
            | Op::CreateObject { op_id, .. }
            | Op::CreateList { op_id, .. }
            | Op::CreateMap { op_id, .. }
            | Op::CreateRegister { op_id, .. }
            | Op::DeleteCrdt { op_id, .. }
            | Op::SetParentKey { op_id, .. }
            | Op::DeleteObjectKey { op_id, .. } => *op_id = Some(new_id),
        }
    }

    /// Whether this op creates a new node.
    pub fn is_create(&self) -> bool {
        matches!(
            self,
            Op::CreateObject { .. }
                | Op::CreateList { .. }
                | Op::CreateMap { .. }
                | Op::CreateRegister { .. }
        )
    }

    /// Encode to the wire representation.
    pub fn to_json(&self) -> Value {
        fn base(code: u64, op_id: &Option<String>) -> Map<String, Value> {
            let mut m = Map::new();
            m.insert("type".into(), json!(code));
            if let Some(id) = op_id {
                m.insert("opId".into(), json!(id));
            }
            m
        }
        match self {
            Op::Ack { op_id } => json!({ "type": OP_ACK, "opId": op_id }),
            Op::UpdateObject { op_id, id, data } => {
                let mut m = base(OP_UPDATE_OBJECT, op_id);
                m.insert("id".into(), json!(id));
                m.insert("data".into(), Value::Object(data.clone()));
                Value::Object(m)
            }
            Op::CreateObject {
                op_id,
                id,
                parent_id,
                parent_key,
                data,
            } => {
                let mut m = base(OP_CREATE_OBJECT, op_id);
                m.insert("id".into(), json!(id));
                m.insert("parentId".into(), json!(parent_id));
                m.insert("parentKey".into(), json!(parent_key));
                m.insert("data".into(), Value::Object(data.clone()));
                Value::Object(m)
            }
            Op::CreateList {
                op_id,
                id,
                parent_id,
                parent_key,
            } => {
                let mut m = base(OP_CREATE_LIST, op_id);
                m.insert("id".into(), json!(id));
                m.insert("parentId".into(), json!(parent_id));
                m.insert("parentKey".into(), json!(parent_key));
                Value::Object(m)
            }
            Op::CreateMap {
                op_id,
                id,
                parent_id,
                parent_key,
            } => {
                let mut m = base(OP_CREATE_MAP, op_id);
                m.insert("id".into(), json!(id));
                m.insert("parentId".into(), json!(parent_id));
                m.insert("parentKey".into(), json!(parent_key));
                Value::Object(m)
            }
            Op::CreateRegister {
                op_id,
                id,
                parent_id,
                parent_key,
                data,
            } => {
                let mut m = base(OP_CREATE_REGISTER, op_id);
                m.insert("id".into(), json!(id));
                m.insert("parentId".into(), json!(parent_id));
                m.insert("parentKey".into(), json!(parent_key));
                m.insert("data".into(), data.clone());
                Value::Object(m)
            }
            Op::DeleteCrdt { op_id, id } => {
                let mut m = base(OP_DELETE_CRDT, op_id);
                m.insert("id".into(), json!(id));
                Value::Object(m)
            }
            Op::SetParentKey {
                op_id,
                id,
                parent_key,
            } => {
                let mut m = base(OP_SET_PARENT_KEY, op_id);
                m.insert("id".into(), json!(id));
                m.insert("parentKey".into(), json!(parent_key));
                Value::Object(m)
            }
            Op::DeleteObjectKey { op_id, id, key } => {
                let mut m = base(OP_DELETE_OBJECT_KEY, op_id);
                m.insert("id".into(), json!(id));
                m.insert("key".into(), json!(key));
                Value::Object(m)
            }
        }
    }

    /// Decode from the wire representation. Returns `None` for anything
    /// that does not validate field by field.
    pub fn from_json(v: &Value) -> Option<Op> {
        let obj = v.as_object()?;
        let code = obj.get("type")?.as_u64()?;
        let op_id = obj.get("opId").and_then(Value::as_str).map(String::from);
        let id = || obj.get("id").and_then(Value::as_str).map(String::from);
        let parent_id = || obj.get("parentId").and_then(Value::as_str).map(String::from);
        let parent_key = || obj.get("parentKey").and_then(Value::as_str).map(String::from);
        let data_map = || obj.get("data").and_then(Value::as_object).cloned();

        match code {
            OP_ACK => Some(Op::Ack { op_id: op_id? }),
            OP_UPDATE_OBJECT => Some(Op::UpdateObject {
                op_id,
                id: id()?,
                data: data_map()?,
            }),
            OP_CREATE_OBJECT => Some(Op::CreateObject {
                op_id,
                id: id()?,
                parent_id: parent_id()?,
                parent_key: parent_key()?,
                data: data_map().unwrap_or_default(),
            }),
            OP_CREATE_LIST => Some(Op::CreateList {
                op_id,
                id: id()?,
                parent_id: parent_id()?,
                parent_key: parent_key()?,
            }),
            OP_CREATE_MAP => Some(Op::CreateMap {
                op_id,
                id: id()?,
                parent_id: parent_id()?,
                parent_key: parent_key()?,
            }),
            OP_CREATE_REGISTER => Some(Op::CreateRegister {
                op_id,
                id: id()?,
                parent_id: parent_id()?,
                parent_key: parent_key()?,
                data: obj.get("data")?.clone(),
            }),
            OP_DELETE_CRDT => Some(Op::DeleteCrdt { op_id, id: id()? }),
            OP_SET_PARENT_KEY => Some(Op::SetParentKey {
                op_id,
                id: id()?,
                parent_key: parent_key()?,
            }),
            OP_DELETE_OBJECT_KEY => Some(Op::DeleteObjectKey {
                op_id,
                id: id()?,
                key: obj.get("key").and_then(Value::as_str)?.to_string(),
            }),
            _ => None,
        }
    }
}

/// Serialized form of one storage node, as it appears in
/// `INITIAL_STORAGE_STATE` items. The root is the unique item with no
/// parent link.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedCrdt {
    pub kind: u64,
    pub parent_id: Option<String>,
    pub parent_key: Option<String>,
    pub data: Option<Value>,
}

impl SerializedCrdt {
    pub fn to_json(&self) -> Value {
        let mut m = Map::new();
        m.insert("type".into(), json!(self.kind));
        if let Some(p) = &self.parent_id {
            m.insert("parentId".into(), json!(p));
        }
        if let Some(k) = &self.parent_key {
            m.insert("parentKey".into(), json!(k));
        }
        if let Some(d) = &self.data {
            m.insert("data".into(), d.clone());
        }
        Value::Object(m)
    }

    pub fn from_json(v: &Value) -> Option<SerializedCrdt> {
        let obj = v.as_object()?;
        let kind = obj.get("type")?.as_u64()?;
        if kind > CRDT_MAP {
            return None;
        }
        Some(SerializedCrdt {
            kind,
            parent_id: obj.get("parentId").and_then(Value::as_str).map(String::from),
            parent_key: obj
                .get("parentKey")
                .and_then(Value::as_str)
                .map(String::from),
            data: obj.get("data").cloned(),
        })
    }
}

/// Connection metadata for one actor inside a `ROOM_STATE` roster.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomStateUser {
    pub user_id: Option<String>,
    pub user_info: Option<Value>,
    pub scopes: Vec<String>,
}

/// Messages the client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    /// No `target_actor` means an incremental patch; [`KEYFRAME_TARGET`]
    /// means a broadcast full keyframe; any other value is a direct full
    /// send to that actor.
    UpdatePresence {
        data: JsonMap,
        target_actor: Option<i64>,
    },
    BroadcastEvent { event: Value },
    FetchStorage,
    UpdateStorage { ops: Vec<Op> },
}

impl ClientMsg {
    pub fn to_json(&self) -> Value {
        match self {
            ClientMsg::UpdatePresence { data, target_actor } => {
                let mut m = Map::new();
                m.insert("type".into(), json!(CLIENT_UPDATE_PRESENCE));
                if let Some(t) = target_actor {
                    m.insert("targetActor".into(), json!(t));
                }
                m.insert("data".into(), Value::Object(data.clone()));
                Value::Object(m)
            }
            ClientMsg::BroadcastEvent { event } => {
                json!({ "type": CLIENT_BROADCAST_EVENT, "event": event })
            }
            ClientMsg::FetchStorage => json!({ "type": CLIENT_FETCH_STORAGE }),
            ClientMsg::UpdateStorage { ops } => json!({
                "type": CLIENT_UPDATE_STORAGE,
                "ops": ops.iter().map(Op::to_json).collect::<Vec<_>>(),
            }),
        }
    }
}

/// Encode a group of client messages into one outbound text frame.
/// A single message is sent bare; several are sent as a JSON array.
pub fn encode_frame(msgs: &[ClientMsg]) -> String {
    let values: Vec<Value> = msgs.iter().map(ClientMsg::to_json).collect();
    let frame = if values.len() == 1 {
        values.into_iter().next().unwrap_or(Value::Null)
    } else {
        Value::Array(values)
    };
    frame.to_string()
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMsg {
    UpdatePresence {
        actor: i64,
        data: JsonMap,
        /// Present iff the message is a full keyframe.
        target_actor: Option<i64>,
    },
    UserJoined {
        actor: i64,
        user_id: Option<String>,
        user_info: Option<Value>,
        scopes: Vec<String>,
    },
    UserLeft { actor: i64 },
    BroadcastedEvent { actor: i64, event: Value },
    RoomState { users: HashMap<i64, RoomStateUser> },
    InitialStorageState { items: Vec<(String, SerializedCrdt)> },
    UpdateStorage { ops: Vec<Op> },
    RejectStorageOp { op_ids: Vec<String>, reason: String },
}

/// Parse an inbound text frame: a single JSON object or an array of them.
/// Parse failures and unrecognized messages are dropped (logged one level
/// up), never fatal.
pub fn parse_frame(text: &str) -> Vec<ServerMsg> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    match value {
        Value::Array(items) => items.iter().filter_map(parse_server_msg).collect(),
        v @ Value::Object(_) => parse_server_msg(&v).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn parse_server_msg(v: &Value) -> Option<ServerMsg> {
    let obj = v.as_object()?;
    let code = obj.get("type")?.as_u64()?;
    match code {
        SERVER_UPDATE_PRESENCE => Some(ServerMsg::UpdatePresence {
            actor: obj.get("actor")?.as_i64()?,
            data: obj.get("data")?.as_object()?.clone(),
            target_actor: obj.get("targetActor").and_then(Value::as_i64),
        }),
        SERVER_USER_JOINED => Some(ServerMsg::UserJoined {
            actor: obj.get("actor")?.as_i64()?,
            user_id: obj.get("id").and_then(Value::as_str).map(String::from),
            user_info: non_null(obj.get("info")),
            scopes: parse_scopes(obj.get("scopes")),
        }),
        SERVER_USER_LEFT => Some(ServerMsg::UserLeft {
            actor: obj.get("actor")?.as_i64()?,
        }),
        SERVER_BROADCASTED_EVENT => Some(ServerMsg::BroadcastedEvent {
            actor: obj.get("actor")?.as_i64()?,
            event: obj.get("event")?.clone(),
        }),
        SERVER_ROOM_STATE => {
            let users = obj.get("users")?.as_object()?;
            let mut out = HashMap::new();
            for (key, entry) in users {
                let actor: i64 = key.parse().ok()?;
                let entry = entry.as_object()?;
                out.insert(
                    actor,
                    RoomStateUser {
                        user_id: entry.get("id").and_then(Value::as_str).map(String::from),
                        user_info: non_null(entry.get("info")),
                        scopes: parse_scopes(entry.get("scopes")),
                    },
                );
            }
            Some(ServerMsg::RoomState { users: out })
        }
        SERVER_INITIAL_STORAGE_STATE => {
            let items = obj.get("items")?.as_array()?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let pair = item.as_array()?;
                let id = pair.first()?.as_str()?.to_string();
                let crdt = SerializedCrdt::from_json(pair.get(1)?)?;
                out.push((id, crdt));
            }
            Some(ServerMsg::InitialStorageState { items: out })
        }
        SERVER_UPDATE_STORAGE => {
            let ops = obj.get("ops")?.as_array()?;
            Some(ServerMsg::UpdateStorage {
                ops: ops.iter().filter_map(Op::from_json).collect(),
            })
        }
        SERVER_REJECT_STORAGE_OP => Some(ServerMsg::RejectStorageOp {
            op_ids: obj
                .get("opIds")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            reason: obj
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_string(),
        }),
        _ => None,
    }
}

fn non_null(v: Option<&Value>) -> Option<Value> {
    match v {
        Some(Value::Null) | None => None,
        Some(other) => Some(other.clone()),
    }
}

fn parse_scopes(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_roundtrip() {
        let mut data = JsonMap::new();
        data.insert("a".into(), json!(1));
        let op = Op::UpdateObject {
            op_id: Some("1:7".into()),
            id: "0:0".into(),
            data,
        };
        let decoded = Op::from_json(&op.to_json()).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(decoded.op_id(), Some("1:7"));
    }

    #[test]
    fn test_create_ops_roundtrip() {
        let ops = vec![
            Op::CreateObject {
                op_id: Some("2:1".into()),
                id: "2:0".into(),
                parent_id: "0:0".into(),
                parent_key: "child".into(),
                data: JsonMap::new(),
            },
            Op::CreateList {
                op_id: None,
                id: "2:2".into(),
                parent_id: "0:0".into(),
                parent_key: "items".into(),
            },
            Op::CreateMap {
                op_id: None,
                id: "2:3".into(),
                parent_id: "0:0".into(),
                parent_key: "index".into(),
            },
            Op::CreateRegister {
                op_id: Some("2:4".into()),
                id: "2:5".into(),
                parent_id: "2:3".into(),
                parent_key: "k".into(),
                data: json!("v"),
            },
            Op::DeleteCrdt {
                op_id: None,
                id: "2:5".into(),
            },
            Op::SetParentKey {
                op_id: None,
                id: "2:5".into(),
                parent_key: "!".into(),
            },
            Op::DeleteObjectKey {
                op_id: Some("2:6".into()),
                id: "0:0".into(),
                key: "a".into(),
            },
        ];
        for op in ops {
            assert_eq!(Op::from_json(&op.to_json()), Some(op.clone()));
        }
    }

    #[test]
    fn test_op_set_id() {
        let mut op = Op::DeleteCrdt {
            op_id: None,
            id: "1:0".into(),
        };
        assert!(op.op_id().is_none());
        op.set_op_id("3:9".into());
        assert_eq!(op.op_id(), Some("3:9"));
    }

    #[test]
    fn test_encode_single_message_is_bare_object() {
        let frame = encode_frame(&[ClientMsg::FetchStorage]);
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert!(v.is_object());
        assert_eq!(v["type"], json!(CLIENT_FETCH_STORAGE));
    }

    #[test]
    fn test_encode_multiple_messages_is_array() {
        let mut data = JsonMap::new();
        data.insert("x".into(), json!(1));
        let frame = encode_frame(&[
            ClientMsg::UpdatePresence {
                data,
                target_actor: Some(KEYFRAME_TARGET),
            },
            ClientMsg::FetchStorage,
        ]);
        let v: Value = serde_json::from_str(&frame).unwrap();
        let arr = v.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["targetActor"], json!(-1));
    }

    #[test]
    fn test_parse_frame_single_and_array() {
        let single = r#"{"type":102,"actor":3}"#;
        assert_eq!(parse_frame(single), vec![ServerMsg::UserLeft { actor: 3 }]);

        let array = r#"[{"type":102,"actor":1},{"type":102,"actor":2}]"#;
        assert_eq!(parse_frame(array).len(), 2);
    }

    #[test]
    fn test_parse_frame_ignores_garbage() {
        assert!(parse_frame("not json").is_empty());
        assert!(parse_frame("[]").is_empty());
        assert!(parse_frame("42").is_empty());
        // Unknown opcode inside a valid array is dropped, the rest kept.
        let mixed = r#"[{"type":9999},{"type":102,"actor":1}]"#;
        assert_eq!(parse_frame(mixed).len(), 1);
    }

    #[test]
    fn test_parse_user_joined() {
        let text = r#"{"type":101,"actor":5,"id":"user-5","info":{"name":"Ada"},"scopes":["room:write"]}"#;
        match parse_frame(text).pop().unwrap() {
            ServerMsg::UserJoined {
                actor,
                user_id,
                user_info,
                scopes,
            } => {
                assert_eq!(actor, 5);
                assert_eq!(user_id.as_deref(), Some("user-5"));
                assert_eq!(user_info.unwrap()["name"], json!("Ada"));
                assert_eq!(scopes, vec!["room:write".to_string()]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_room_state() {
        let text = r#"{"type":104,"users":{"2":{"id":"u2","scopes":["room:read"]},"7":{}}}"#;
        match parse_frame(text).pop().unwrap() {
            ServerMsg::RoomState { users } => {
                assert_eq!(users.len(), 2);
                assert_eq!(users[&2].user_id.as_deref(), Some("u2"));
                assert!(users[&7].scopes.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_initial_storage_state() {
        let text = r#"{"type":200,"items":[["0:0",{"type":0,"data":{"a":1}}],["0:1",{"type":2,"parentId":"0:0","parentKey":"list"}]]}"#;
        match parse_frame(text).pop().unwrap() {
            ServerMsg::InitialStorageState { items } => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].0, "0:0");
                assert_eq!(items[0].1.kind, CRDT_OBJECT);
                assert!(items[0].1.parent_id.is_none());
                assert_eq!(items[1].1.parent_key.as_deref(), Some("list"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_storage_drops_bad_ops() {
        let text = r#"{"type":201,"ops":[{"type":6,"id":"1:1"},{"type":6}]}"#;
        match parse_frame(text).pop().unwrap() {
            ServerMsg::UpdateStorage { ops } => assert_eq!(ops.len(), 1),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_reject_storage_op() {
        let text = r#"{"type":299,"opIds":["1:4"],"reason":"forbidden"}"#;
        match parse_frame(text).pop().unwrap() {
            ServerMsg::RejectStorageOp { op_ids, reason } => {
                assert_eq!(op_ids, vec!["1:4".to_string()]);
                assert_eq!(reason, "forbidden");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_serialized_crdt_roundtrip() {
        let crdt = SerializedCrdt {
            kind: CRDT_REGISTER,
            parent_id: Some("0:0".into()),
            parent_key: Some("k".into()),
            data: Some(json!([1, 2, 3])),
        };
        assert_eq!(SerializedCrdt::from_json(&crdt.to_json()), Some(crdt));
    }

    #[test]
    fn test_presence_patch_vs_keyframe_shape() {
        let mut data = JsonMap::new();
        data.insert("cursor".into(), json!({ "x": 1 }));
        let patch = ClientMsg::UpdatePresence {
            data: data.clone(),
            target_actor: None,
        }
        .to_json();
        assert!(patch.get("targetActor").is_none());

        let keyframe = ClientMsg::UpdatePresence {
            data,
            target_actor: Some(KEYFRAME_TARGET),
        }
        .to_json();
        assert_eq!(keyframe["targetActor"], json!(-1));
    }
}
