//! The message policy: application values to bytes and back.

use crate::registry;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, warn};

/// Upper bound on a type-tagged payload; anything larger is treated as a
/// corrupt record rather than an allocation request.
const MAX_TYPED_PAYLOAD: usize = 64 * 1024 * 1024;

/// Most batch decodes are genuine; a count beyond this marks a non-batch
/// buffer that happens to start with a plausible integer.
const MAX_BATCH_COUNT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageStats {
    pub messages_encoded: u64,
    pub messages_decoded: u64,
    pub bytes_encoded: u64,
    pub bytes_decoded: u64,
    pub encode_errors: u64,
    pub parse_errors: u64,
}

/// Encodes one application value into bytes and dispatches inbound payloads
/// to a handler. `Item` is the value type the service layer sees.
pub trait MessageCodec {
    type Item;

    fn encode(&mut self, value: &Self::Item) -> Option<Vec<u8>>;
    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(Self::Item));

    fn stats(&self) -> MessageStats {
        MessageStats::default()
    }
}

/// Identity codec over raw byte vectors.
#[derive(Default)]
pub struct RawBytes {
    stats: MessageStats,
}

impl RawBytes {
    pub fn new() -> RawBytes {
        RawBytes::default()
    }
}

impl MessageCodec for RawBytes {
    type Item = Vec<u8>;

    fn encode(&mut self, value: &Vec<u8>) -> Option<Vec<u8>> {
        self.stats.messages_encoded += 1;
        self.stats.bytes_encoded += value.len() as u64;
        Some(value.clone())
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(Vec<u8>)) {
        self.stats.messages_decoded += 1;
        self.stats.bytes_decoded += data.len() as u64;
        handler(data.to_vec());
    }

    fn stats(&self) -> MessageStats {
        self.stats
    }
}

/// A value tagged with a stable type id (see [`crate::registry`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedPayload {
    pub type_id: u32,
    pub data: Vec<u8>,
}

/// Codec for type-tagged records: `type_id u32 LE | len u32 LE | bytes`.
///
/// Inbound records are routed to the handler registered for their type id;
/// unknown types fall back to the dispatch handler.
#[derive(Default)]
pub struct TypedMessage {
    handlers: FxHashMap<u32, Box<dyn FnMut(&[u8]) + Send>>,
    stats: MessageStats,
}

impl TypedMessage {
    pub fn new() -> TypedMessage {
        TypedMessage::default()
    }

    pub fn register_handler(
        &mut self,
        type_id: u32,
        handler: impl FnMut(&[u8]) + Send + 'static,
    ) {
        debug!(
            "registering handler for type {} ({})",
            type_id,
            registry::type_name(type_id)
        );
        self.handlers.insert(type_id, Box::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl MessageCodec for TypedMessage {
    type Item = TypedPayload;

    fn encode(&mut self, value: &TypedPayload) -> Option<Vec<u8>> {
        let mut result = Vec::with_capacity(8 + value.data.len());
        result.extend_from_slice(&value.type_id.to_le_bytes());
        result.extend_from_slice(&(value.data.len() as u32).to_le_bytes());
        result.extend_from_slice(&value.data);

        self.stats.messages_encoded += 1;
        self.stats.bytes_encoded += result.len() as u64;
        Some(result)
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(TypedPayload)) {
        if data.len() < 8 {
            warn!("typed record shorter than its header: {} bytes", data.len());
            self.stats.parse_errors += 1;
            return;
        }

        let type_id = u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice"));
        let data_len = u32::from_le_bytes(data[4..8].try_into().expect("4-byte slice")) as usize;

        if data_len > MAX_TYPED_PAYLOAD {
            warn!("typed record claims {} bytes - dropping", data_len);
            self.stats.parse_errors += 1;
            return;
        }
        if data.len() < 8 + data_len {
            warn!(
                "typed record truncated: header claims {} bytes, {} available",
                data_len,
                data.len() - 8
            );
            self.stats.parse_errors += 1;
            return;
        }

        self.stats.messages_decoded += 1;
        self.stats.bytes_decoded += data.len() as u64;

        let payload = &data[8..8 + data_len];
        match self.handlers.get_mut(&type_id) {
            Some(registered) => registered(payload),
            None => handler(TypedPayload {
                type_id,
                data: payload.to_vec(),
            }),
        }
    }

    fn stats(&self) -> MessageStats {
        self.stats
    }
}

/// Codec over a JSON document model. Unparseable inbound text is handed to
/// the handler as a JSON string so no input is silently dropped.
#[derive(Default)]
pub struct JsonMessage {
    stats: MessageStats,
}

impl JsonMessage {
    pub fn new() -> JsonMessage {
        JsonMessage::default()
    }

    /// Encodes any serialisable value through the document model, without
    /// building a [`Value`] first.
    pub fn encode_typed<T: serde::Serialize>(&mut self, value: &T) -> Option<Vec<u8>> {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.stats.messages_encoded += 1;
                self.stats.bytes_encoded += bytes.len() as u64;
                Some(bytes)
            }
            Err(error) => {
                warn!("json encoding failed: {}", error);
                self.stats.encode_errors += 1;
                None
            }
        }
    }
}

impl MessageCodec for JsonMessage {
    type Item = Value;

    fn encode(&mut self, value: &Value) -> Option<Vec<u8>> {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.stats.messages_encoded += 1;
                self.stats.bytes_encoded += bytes.len() as u64;
                Some(bytes)
            }
            Err(error) => {
                warn!("json encoding failed: {}", error);
                self.stats.encode_errors += 1;
                None
            }
        }
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(Value)) {
        self.stats.bytes_decoded += data.len() as u64;
        match serde_json::from_slice::<Value>(data) {
            Ok(document) => {
                self.stats.messages_decoded += 1;
                handler(document);
            }
            Err(error) => {
                debug!("json parsing failed: {}", error);
                self.stats.parse_errors += 1;
                handler(Value::String(String::from_utf8_lossy(data).into_owned()));
            }
        }
    }

    fn stats(&self) -> MessageStats {
        self.stats
    }
}

/// Marks payloads with a leading flag byte (`1` = transformed content
/// follows, `0` = passthrough). The content transform itself is pluggable
/// and defaults to identity.
pub struct Compressed<M> {
    base: M,
}

impl<M> Compressed<M> {
    pub fn new(base: M) -> Compressed<M> {
        Compressed { base }
    }

    pub fn base(&self) -> &M {
        &self.base
    }
}

impl<M: MessageCodec> MessageCodec for Compressed<M> {
    type Item = M::Item;

    fn encode(&mut self, value: &M::Item) -> Option<Vec<u8>> {
        let encoded = self.base.encode(value)?;
        let mut result = Vec::with_capacity(1 + encoded.len());
        result.push(1);
        result.extend_from_slice(&encoded);
        Some(result)
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(M::Item)) {
        match data.first() {
            None => warn!("empty buffer cannot carry a compression flag"),
            Some(1) => self.base.dispatch(&data[1..], handler),
            Some(_) => self.base.dispatch(data, handler),
        }
    }

    fn stats(&self) -> MessageStats {
        self.base.stats()
    }
}

/// XOR whitening with a fixed key byte. A placeholder marking where real
/// encryption would sit - explicitly not a security boundary.
pub struct Encrypted<M> {
    base: M,
}

const XOR_KEY: u8 = 0xAA;

impl<M> Encrypted<M> {
    pub fn new(base: M) -> Encrypted<M> {
        Encrypted { base }
    }

    pub fn base(&self) -> &M {
        &self.base
    }
}

impl<M: MessageCodec> MessageCodec for Encrypted<M> {
    type Item = M::Item;

    fn encode(&mut self, value: &M::Item) -> Option<Vec<u8>> {
        let mut encoded = self.base.encode(value)?;
        for byte in &mut encoded {
            *byte ^= XOR_KEY;
        }
        Some(encoded)
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(M::Item)) {
        let mut decrypted = data.to_vec();
        for byte in &mut decrypted {
            *byte ^= XOR_KEY;
        }
        self.base.dispatch(&decrypted, handler);
    }

    fn stats(&self) -> MessageStats {
        self.base.stats()
    }
}

/// Packs several messages into one buffer: `count u32 LE | {len u32 LE |
/// msg}*`. Dispatch unpacks item by item; buffers that do not look like a
/// batch are delegated to the base codec unchanged.
pub struct Batch<M> {
    base: M,
}

impl<M: MessageCodec> Batch<M> {
    pub fn new(base: M) -> Batch<M> {
        Batch { base }
    }

    pub fn base(&self) -> &M {
        &self.base
    }

    /// Encodes a batch of values into a single buffer. Fails if any single
    /// item fails to encode.
    pub fn encode_batch(&mut self, values: &[M::Item]) -> Option<Vec<u8>> {
        let mut result = Vec::new();
        result.extend_from_slice(&(values.len() as u32).to_le_bytes());

        for value in values {
            let encoded = self.base.encode(value)?;
            result.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            result.extend_from_slice(&encoded);
        }
        Some(result)
    }
}

impl<M: MessageCodec> MessageCodec for Batch<M> {
    type Item = M::Item;

    fn encode(&mut self, value: &M::Item) -> Option<Vec<u8>> {
        self.base.encode(value)
    }

    fn dispatch(&mut self, data: &[u8], handler: &mut dyn FnMut(M::Item)) {
        if data.len() < 4 {
            self.base.dispatch(data, handler);
            return;
        }

        let count = u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice"));
        if count == 0 || count > MAX_BATCH_COUNT {
            self.base.dispatch(data, handler);
            return;
        }

        let mut offset = 4;
        for index in 0..count {
            if offset + 4 > data.len() {
                warn!("batch truncated at item {}", index);
                break;
            }
            let item_len =
                u32::from_le_bytes(data[offset..offset + 4].try_into().expect("4-byte slice"))
                    as usize;
            offset += 4;

            if offset + item_len > data.len() {
                warn!(
                    "batch item {} claims {} bytes, {} available",
                    index,
                    item_len,
                    data.len() - offset
                );
                break;
            }

            self.base.dispatch(&data[offset..offset + item_len], handler);
            offset += item_len;
        }
    }

    fn stats(&self) -> MessageStats {
        self.base.stats()
    }
}
