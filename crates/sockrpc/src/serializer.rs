//! Pluggable encode/decode hooks and the per-type serializer registry.
//!
//! The wire format is JSON, but both directions go through replaceable
//! functions so alternative encoders (or instrumented ones) can be swapped
//! in per endpoint. The registry turns arbitrary Rust values into wire-safe
//! structures for values JSON cannot express directly; byte blobs are
//! encoded as base64 strings out of the box.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::error::{EncodeError, ProtocolError};

type EncodeFn = Box<dyn Fn(&dyn Any) -> Value + Send + Sync>;
type LoadsFn = dyn Fn(&str) -> Result<Value, serde_json::Error> + Send + Sync;
type DumpsFn = dyn Fn(&Value) -> Result<String, serde_json::Error> + Send + Sync;

/// Per-type encode functions, keyed by `TypeId`.
pub struct SerializerRegistry {
    encoders: HashMap<TypeId, EncodeFn>,
}

impl SerializerRegistry {
    /// An empty registry with the default byte-blob encoder installed.
    pub fn new() -> Self {
        let mut registry = Self {
            encoders: HashMap::new(),
        };
        registry.register::<Vec<u8>>(|bytes| Value::String(BASE64.encode(bytes)));
        registry
    }

    /// Install an encoder for `T`, replacing any previous one.
    pub fn register<T: 'static>(
        &mut self,
        encode: impl Fn(&T) -> Value + Send + Sync + 'static,
    ) {
        self.encoders.insert(
            TypeId::of::<T>(),
            Box::new(move |any| {
                // The map is keyed by the value's TypeId, so this downcast
                // cannot fail.
                match any.downcast_ref::<T>() {
                    Some(v) => encode(v),
                    None => Value::Null,
                }
            }),
        );
    }

    /// Encode a value through its registered per-type function.
    pub fn encode<T: 'static>(&self, value: &T) -> Result<Value, EncodeError> {
        match self.encoders.get(&TypeId::of::<T>()) {
            Some(encode) => Ok(encode(value)),
            None => Err(EncodeError::Unsupported(std::any::type_name::<T>())),
        }
    }

    /// Encode an already-erased value. The concrete type name is not
    /// recoverable here, so the error only says a serializer was missing.
    pub fn encode_any(&self, value: &dyn Any) -> Result<Value, EncodeError> {
        match self.encoders.get(&value.type_id()) {
            Some(encode) => Ok(encode(value)),
            None => Err(EncodeError::Unsupported("unregistered type")),
        }
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.encoders.contains_key(&TypeId::of::<T>())
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame encode/decode hooks for one endpoint.
///
/// Cheap to clone; both sessions of an endpoint share the same codec.
#[derive(Clone)]
pub struct Codec {
    loads: Arc<LoadsFn>,
    dumps: Arc<DumpsFn>,
    registry: Arc<SerializerRegistry>,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            loads: Arc::new(|text| serde_json::from_str(text)),
            dumps: Arc::new(serde_json::to_string),
            registry: Arc::new(SerializerRegistry::new()),
        }
    }

    /// Replace the decode hook.
    pub fn with_loads(
        mut self,
        loads: impl Fn(&str) -> Result<Value, serde_json::Error> + Send + Sync + 'static,
    ) -> Self {
        self.loads = Arc::new(loads);
        self
    }

    /// Replace the encode hook.
    pub fn with_dumps(
        mut self,
        dumps: impl Fn(&Value) -> Result<String, serde_json::Error> + Send + Sync + 'static,
    ) -> Self {
        self.dumps = Arc::new(dumps);
        self
    }

    /// Replace the serializer registry.
    pub fn with_registry(mut self, registry: SerializerRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn decode(&self, text: &str) -> Result<Value, ProtocolError> {
        (self.loads)(text).map_err(ProtocolError::Json)
    }

    pub fn encode(&self, payload: &Value) -> Result<String, EncodeError> {
        (self.dumps)(payload).map_err(EncodeError::Json)
    }

    /// Turn an arbitrary value into a wire-safe structure through the
    /// serializer registry.
    pub fn encode_any(&self, value: &dyn Any) -> Result<Value, EncodeError> {
        self.registry.encode_any(value)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}
