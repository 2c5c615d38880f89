use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Messages carried on the per-peer control channel. The transport is
/// collaborator-supplied and only promises ordered reliable delivery of
/// these while the link is up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    TimekeepRequest { sent_at: f64 },

    #[serde(rename_all = "camelCase")]
    TimekeepResponse { sent_at: f64, responded_at: f64 },

    #[serde(rename_all = "camelCase")]
    PeerInfo {
        peer: PeerDescriptor,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shared_state: Option<Value>,
    },

    Disconnect,

    Rpc(RpcEnvelope),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcEnvelope {
    pub uuid: Uuid,
    pub rpc_type: String,
    pub is_response: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    pub body: Value,
}

/// Identity of a mesh participant. `uuid` is stable across restarts,
/// `instance_uuid` is minted per process and is what lets a manager
/// tell a reconnecting duplicate apart from a restarted peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub uuid: Uuid,
    pub instance_uuid: Uuid,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub capacities: Vec<Capacity>,
}

/// Optional features a peer advertises. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capacity {
    Librespot,
    Shairport,
    HttpServerAccessible,
    Hue,
    ChromecastInteraction,
    SharedStateKeeper,
    AirplaySink,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> PeerDescriptor {
        PeerDescriptor {
            uuid: Uuid::nil(),
            instance_uuid: Uuid::nil(),
            name: "living room".into(),
            version: "0.1.0".into(),
            capacities: vec![Capacity::AirplaySink, Capacity::SharedStateKeeper],
        }
    }

    #[test]
    fn wire_tags_are_camel_case() {
        let json = serde_json::to_value(ControlMessage::TimekeepRequest { sent_at: 12.5 }).unwrap();
        assert_eq!(json["type"], "timekeepRequest");
        assert_eq!(json["sentAt"], 12.5);

        let json = serde_json::to_value(ControlMessage::Disconnect).unwrap();
        assert_eq!(json["type"], "disconnect");

        let json = serde_json::to_value(ControlMessage::PeerInfo {
            peer: descriptor(),
            shared_state: None,
        })
        .unwrap();
        assert_eq!(json["type"], "peerInfo");
        assert_eq!(json["peer"]["capacities"][0], "airplaySink");
        assert!(json.get("sharedState").is_none());
    }

    #[test]
    fn rpc_envelope_round_trips() {
        let msg = ControlMessage::Rpc(RpcEnvelope {
            uuid: Uuid::from_u128(7),
            rpc_type: "setVolume".into(),
            is_response: false,
            is_error: false,
            body: serde_json::json!({ "volume": 0.5 }),
        });

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"rpc\""));
        assert!(json.contains("\"rpcType\":\"setVolume\""));
        assert!(!json.contains("isError"));

        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn timekeep_response_round_trips() {
        let msg = ControlMessage::TimekeepResponse { sent_at: 100.0, responded_at: 241.5 };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
