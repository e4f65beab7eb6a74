//! JSON status report for operators

use crate::kv::Kv;
use crate::message_log::{Direction, Message};
use crate::store::StoreError;
use crate::sync::SyncStats;
use gossipkv_net::Member;
use serde::Serialize;

/// Point-in-time view of one node
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub node: String,
    pub generated_at_ms: u64,
    pub local: Member,
    pub members: Vec<Member>,
    pub store: Vec<KeyStatus>,
    pub sent: Vec<MessageStatus>,
    pub received: Vec<MessageStatus>,
    pub sync: SyncStats,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub key: String,
    pub version: u64,
    pub codec: u16,
    pub codec_name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageStatus {
    pub id: u64,
    pub direction: Direction,
    pub timestamp_ms: u64,
    pub key: String,
    pub version: u64,
    pub codec: u16,
}

impl From<&Message> for MessageStatus {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            direction: message.direction,
            timestamp_ms: message.timestamp,
            key: message.key.clone(),
            version: message.descriptor.version,
            codec: message.descriptor.codec.0,
        }
    }
}

impl StatusReport {
    /// Collect a report from a running store
    pub fn collect(kv: &Kv) -> Result<Self, StoreError> {
        let store = kv
            .store()
            .snapshot()
            .into_iter()
            .map(|(key, desc)| {
                let (codec_name, value) = match kv.lookup_codec(desc.codec) {
                    Some(codec) => (codec.name().to_string(), codec.render(&desc.value)),
                    None => ("unknown".to_string(), "<unknown codec>".to_string()),
                };
                KeyStatus {
                    key,
                    version: desc.version,
                    codec: desc.codec.0,
                    codec_name,
                    value,
                }
            })
            .collect();

        let (sent, received) = kv.list_messages();
        Ok(Self {
            node: kv.node_name().to_string(),
            generated_at_ms: crate::message_log::now_millis(),
            local: kv.local_member(),
            members: kv.members(),
            store,
            sent: sent.iter().map(MessageStatus::from).collect(),
            received: received.iter().map(MessageStatus::from).collect(),
            sync: kv.sync_stats(),
            digest: kv.digest()?,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KvConfig;
    use gossipkv_core::codecs::{LwwRegister, MaxCounter, LWW_REGISTER, MAX_COUNTER};
    use gossipkv_core::CodecRegistry;
    use gossipkv_net::LocalNetwork;
    use std::sync::Arc;

    #[test]
    fn test_report_renders_store_and_messages() {
        let network = LocalNetwork::new();
        let (transport, _events) = network.join("a").unwrap();
        let (_b, _b_events) = network.join("b").unwrap();
        let kv = Kv::new(
            KvConfig {
                node_name: "a".into(),
                ..KvConfig::default()
            },
            Arc::new(CodecRegistry::with_builtin()),
            transport,
        );

        kv.store()
            .cas_typed::<MaxCounter, _>("tokens", MAX_COUNTER, |_| Some(MaxCounter(42)))
            .unwrap();
        kv.store()
            .cas_typed::<LwwRegister, _>("leader", LWW_REGISTER, |_| {
                Some(LwwRegister::new(b"b".to_vec(), 7, "a"))
            })
            .unwrap();

        let report = StatusReport::collect(&kv).unwrap();
        assert!(report.sent.is_empty());

        assert_eq!(kv.flush().unwrap(), 2);
        let report = StatusReport::collect(&kv).unwrap();
        assert_eq!(report.node, "a");
        assert_eq!(report.local.name, "a");
        assert_eq!(report.members.len(), 2);
        assert_eq!(report.store.len(), 2);
        assert_eq!(report.store[1].key, "tokens");
        assert_eq!(report.store[1].codec_name, "max-counter");
        assert_eq!(report.sent.len(), 2);
        assert!(report.received.is_empty());
        assert_eq!(report.digest, kv.digest().unwrap());

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["store"][0]["key"], "leader");
        assert_eq!(json["sent"][0]["direction"], "sent");
        assert_eq!(json["members"][0]["name"], "a");
    }
}
