//! Key-value lookup service.
//!
//! A namespaced byte-string map used by worker plugins to rendezvous
//! (service endpoints, pid maps, feature flags). All operations are
//! serialized on the coordinator thread; there is no locking. The
//! coordinator itself appends an ordered event log into a reserved
//! namespace, and the whole store can be snapshotted to JSON and
//! loaded back losslessly.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use bytes::Bytes;
use dmtcp_proto::{KvdbOp, KvdbStatus, Message};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::CoordError;

/// Namespace holding the coordinator's own event log.
pub const EVENT_NAMESPACE: &str = "/Events";

/// One stored value with its write timestamp (milliseconds since epoch,
/// decimal string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Raw value bytes.
    pub value: Vec<u8>,
    /// Wall-clock write stamp.
    pub timestamp_ms: String,
}

/// Outcome of one kvdb request: status plus optional reply payload.
#[derive(Debug, PartialEq, Eq)]
pub struct KvdbReply {
    /// Status for the response header.
    pub status: KvdbStatus,
    /// Value bytes for gets and lists; empty otherwise.
    pub value: Vec<u8>,
}

impl KvdbReply {
    fn ok(value: Vec<u8>) -> Self {
        Self {
            status: KvdbStatus::Ok,
            value,
        }
    }

    fn status(status: KvdbStatus) -> Self {
        Self {
            status,
            value: Vec::new(),
        }
    }
}

/// Namespaced map of `key -> (value, timestamp)`.
#[derive(Debug, Default)]
pub struct LookupService {
    namespaces: BTreeMap<String, BTreeMap<String, KvEntry>>,
    event_seq: u64,
}

impl LookupService {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all namespaces and restart the event sequence.
    pub fn reset(&mut self) {
        self.namespaces.clear();
        self.event_seq = 0;
    }

    /// Store a value, timestamping it now.
    pub fn set(&mut self, namespace: &str, key: &str, value: Vec<u8>) {
        let entry = KvEntry {
            value,
            timestamp_ms: now_timestamp_ms(),
        };
        self.namespaces
            .entry(namespace.to_owned())
            .or_default()
            .insert(key.to_owned(), entry);
    }

    /// Fetch a value.
    #[must_use]
    pub fn get(&self, namespace: &str, key: &str) -> Option<&[u8]> {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(|e| e.value.as_slice())
    }

    /// Append an event to the ordered event log.
    ///
    /// Keys are `NNNNN-<timestamp-ms>` so lexicographic order is event
    /// order; the value is the event name.
    pub fn record_event(&mut self, event: &str) {
        self.event_seq += 1;
        let key = format!("{:05}-{}", self.event_seq, now_timestamp_ms());
        self.set(EVENT_NAMESPACE, &key, event.as_bytes().to_vec());
    }

    /// Execute one wire request. `payload` carries the key followed by
    /// the value, with lengths from the header.
    pub fn process_request(&mut self, msg: &Message, payload: &Bytes) -> KvdbReply {
        let Some(op) = KvdbOp::from_u32(msg.kvdb_op) else {
            return KvdbReply::status(KvdbStatus::InvalidRequest);
        };

        let key_len = msg.key_len as usize;
        let val_len = msg.val_len as usize;
        if key_len + val_len > payload.len() {
            return KvdbReply::status(KvdbStatus::InvalidRequest);
        }
        let Ok(key) = std::str::from_utf8(&payload[..key_len]) else {
            return KvdbReply::status(KvdbStatus::InvalidRequest);
        };
        let value = &payload[key_len..key_len + val_len];
        let namespace = msg.text.as_str();

        debug!(namespace, key, ?op, "kvdb request");

        match op {
            KvdbOp::Get => match self.get(namespace, key) {
                Some(v) => KvdbReply::ok(v.to_vec()),
                None => KvdbReply::status(KvdbStatus::NotFound),
            },
            KvdbOp::Get64 => match self.get(namespace, key) {
                Some(v) => match decode_i64(v) {
                    Some(_) => KvdbReply::ok(v.to_vec()),
                    None => KvdbReply::status(KvdbStatus::InvalidRequest),
                },
                None => KvdbReply::status(KvdbStatus::NotFound),
            },
            KvdbOp::Set => {
                self.set(namespace, key, value.to_vec());
                KvdbReply::ok(Vec::new())
            }
            KvdbOp::Set64 => {
                if decode_i64(value).is_none() {
                    return KvdbReply::status(KvdbStatus::InvalidRequest);
                }
                self.set(namespace, key, value.to_vec());
                KvdbReply::ok(Vec::new())
            }
            KvdbOp::Incr64 => {
                let Some(delta) = decode_i64(value) else {
                    return KvdbReply::status(KvdbStatus::InvalidRequest);
                };
                let old = match self.get(namespace, key) {
                    Some(v) => match decode_i64(v) {
                        Some(n) => n,
                        None => return KvdbReply::status(KvdbStatus::InvalidRequest),
                    },
                    None => 0,
                };
                let new = old.wrapping_add(delta);
                self.set(namespace, key, new.to_le_bytes().to_vec());
                KvdbReply::ok(new.to_le_bytes().to_vec())
            }
            KvdbOp::Del => {
                let removed = self
                    .namespaces
                    .get_mut(namespace)
                    .and_then(|ns| ns.remove(key));
                match removed {
                    Some(_) => KvdbReply::ok(Vec::new()),
                    None => KvdbReply::status(KvdbStatus::NotFound),
                }
            }
            KvdbOp::List => match self.namespaces.get(namespace) {
                Some(ns) => {
                    let mut out = Vec::new();
                    for (k, entry) in ns {
                        out.extend_from_slice(&(k.len() as u32).to_le_bytes());
                        out.extend_from_slice(k.as_bytes());
                        out.extend_from_slice(&(entry.value.len() as u32).to_le_bytes());
                        out.extend_from_slice(&entry.value);
                    }
                    KvdbReply::ok(out)
                }
                None => KvdbReply::status(KvdbStatus::NotFound),
            },
        }
    }

    /// Write a JSON snapshot: `{namespace: {key: [value, timestamp]}}`.
    ///
    /// Values that are valid UTF-8 are stored as strings; anything else
    /// is hex-encoded with a `hex:` prefix so the round trip through
    /// [`load`](Self::load) is the identity.
    pub fn serialize(&self, path: &Path) -> Result<(), CoordError> {
        let mut root = Map::new();
        for (ns, entries) in &self.namespaces {
            let mut ns_obj = Map::new();
            for (key, entry) in entries {
                ns_obj.insert(
                    key.clone(),
                    json!([encode_value(&entry.value), entry.timestamp_ms]),
                );
            }
            root.insert(ns.clone(), Value::Object(ns_obj));
        }

        // Write-then-rename so a crash never leaves a torn snapshot.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&Value::Object(root))?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a snapshot previously written by [`serialize`](Self::serialize).
    pub fn load(path: &Path) -> Result<Self, CoordError> {
        let data = fs::read(path)?;
        let root: Value = serde_json::from_slice(&data)?;
        let mut service = Self::new();

        let Value::Object(root) = root else {
            return Err(CoordError::Fatal(format!(
                "kv snapshot {} is not a JSON object",
                path.display()
            )));
        };
        for (ns, entries) in root {
            let Value::Object(entries) = entries else {
                continue;
            };
            let target = service.namespaces.entry(ns).or_default();
            for (key, pair) in entries {
                let (Some(value), Some(ts)) = (
                    pair.get(0).and_then(Value::as_str),
                    pair.get(1).and_then(Value::as_str),
                ) else {
                    continue;
                };
                target.insert(
                    key,
                    KvEntry {
                        value: decode_value(value),
                        timestamp_ms: ts.to_owned(),
                    },
                );
            }
        }
        Ok(service)
    }

    /// Namespace count, for logging.
    #[must_use]
    pub fn num_namespaces(&self) -> usize {
        self.namespaces.len()
    }
}

/// Little-endian i64, the value format of the 64-bit operations.
fn decode_i64(bytes: &[u8]) -> Option<i64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(i64::from_le_bytes(arr))
}

fn encode_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(s) if !s.starts_with("hex:") => s.to_owned(),
        _ => {
            let mut out = String::with_capacity(4 + value.len() * 2);
            out.push_str("hex:");
            for b in value {
                let _ = write!(out, "{b:02x}");
            }
            out
        }
    }
}

fn decode_value(encoded: &str) -> Vec<u8> {
    match encoded.strip_prefix("hex:") {
        Some(hex) => hex
            .as_bytes()
            .chunks(2)
            .filter_map(|pair| {
                let s = std::str::from_utf8(pair).ok()?;
                u8::from_str_radix(s, 16).ok()
            })
            .collect(),
        None => encoded.as_bytes().to_vec(),
    }
}

fn now_timestamp_ms() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}
