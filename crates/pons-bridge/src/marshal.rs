//! Object marshaling: decides how a concrete Rust object crosses the
//! boundary.
//!
//! Three strategies apply in order. A custom codec registered for the
//! object's concrete type wins. Otherwise a structural probe converts
//! primitives, strings, byte buffers, and prebuilt value trees directly.
//! Otherwise the object must carry a registered bridged-type tag and
//! crosses as an opaque foreign reference through its side's export table.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use once_cell::sync::OnceCell;
use pons_contracts::CLOSURE_TYPE_TAG;

use crate::error::BridgeError;
use crate::peer::{PeerObject, Side};
use crate::value::BridgedValue;

/// Converts one concrete object into a boundary value.
pub type EncodeObjectFn =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<BridgedValue, BridgeError> + Send + Sync>;

/// Rebuilds a concrete object from a boundary value.
pub type DecodeObjectFn =
    Arc<dyn Fn(&BridgedValue) -> Result<PeerObject, BridgeError> + Send + Sync>;

struct CustomCodec {
    encode: EncodeObjectFn,
    decode: DecodeObjectFn,
}

#[derive(Default)]
struct CodecState {
    codecs: HashMap<TypeId, Arc<CustomCodec>>,
    by_tag: BTreeMap<String, Arc<CustomCodec>>,
    foreign_tags: HashMap<TypeId, String>,
    foreign_by_tag: BTreeMap<String, TypeId>,
}

/// Registry of per-type marshaling strategies.
pub struct CodecRegistry {
    state: Mutex<CodecState>,
}

fn poisoned() -> BridgeError {
    BridgeError::ProtocolViolation {
        what: "codec registry lock poisoned".to_string(),
    }
}

impl CodecRegistry {
    pub fn new() -> CodecRegistry {
        CodecRegistry {
            state: Mutex::new(CodecState::default()),
        }
    }

    /// Registers a by-value codec for `T`. The tag must be unused and the
    /// type must not already carry a codec.
    pub fn register_codec<T, E, D>(&self, tag: &str, encode: E, decode: D) -> Result<()>
    where
        T: Any + Send + Sync,
        E: Fn(&T) -> Result<BridgedValue, BridgeError> + Send + Sync + 'static,
        D: Fn(&BridgedValue) -> Result<T, BridgeError> + Send + Sync + 'static,
    {
        check_tag(tag)?;
        let id = TypeId::of::<T>();
        let Ok(mut state) = self.state.lock() else {
            bail!("codec registry lock poisoned");
        };
        if state.codecs.contains_key(&id) {
            bail!("type already carries a codec (requested tag '{tag}')");
        }
        if state.by_tag.contains_key(tag) || state.foreign_by_tag.contains_key(tag) {
            bail!("marshaling tag '{tag}' already in use");
        }
        let codec = Arc::new(CustomCodec {
            encode: Arc::new(move |obj: &(dyn Any + Send + Sync)| {
                let Some(typed) = obj.downcast_ref::<T>() else {
                    return Err(BridgeError::EncodingMismatch {
                        expected: "object matching its registered codec".to_string(),
                        found: "different concrete type".to_string(),
                    });
                };
                encode(typed)
            }),
            decode: Arc::new(move |value: &BridgedValue| Ok(Arc::new(decode(value)?) as PeerObject)),
        });
        state.by_tag.insert(tag.to_string(), Arc::clone(&codec));
        state.codecs.insert(id, codec);
        Ok(())
    }

    /// Registers `T` as an opaque bridged type crossing by reference under
    /// `tag`.
    pub fn register_foreign_type<T: Any + Send + Sync>(&self, tag: &str) -> Result<()> {
        check_tag(tag)?;
        let id = TypeId::of::<T>();
        let Ok(mut state) = self.state.lock() else {
            bail!("codec registry lock poisoned");
        };
        if let Some(existing) = state.foreign_tags.get(&id) {
            bail!("type already registered as bridged type '{existing}'");
        }
        if state.foreign_by_tag.contains_key(tag) || state.by_tag.contains_key(tag) {
            bail!("marshaling tag '{tag}' already in use");
        }
        state.foreign_tags.insert(id, tag.to_string());
        state.foreign_by_tag.insert(tag.to_string(), id);
        Ok(())
    }

    /// Turns an object into a boundary value, exporting it from `side`'s
    /// table when it crosses by reference.
    pub fn export_object(&self, side: Side, object: PeerObject) -> Result<BridgedValue, BridgeError> {
        let id = (*object).type_id();
        let (codec, tag) = {
            let Ok(state) = self.state.lock() else {
                return Err(poisoned());
            };
            (
                state.codecs.get(&id).cloned(),
                state.foreign_tags.get(&id).cloned(),
            )
        };
        // The codec runs outside the lock; it may marshal nested objects.
        if let Some(codec) = codec {
            return (codec.encode)(object.as_ref());
        }
        if let Some(value) = structural_probe(object.as_ref()) {
            return Ok(value);
        }
        match tag {
            Some(type_tag) => {
                let handle = side.exports().export(object);
                Ok(BridgedValue::Foreign { handle, type_tag })
            }
            None => Err(BridgeError::EncodingMismatch {
                expected: "codec, structural shape, or registered bridged type".to_string(),
                found: "unregistered object".to_string(),
            }),
        }
    }

    /// Resolves a foreign reference back to the object exported by `side`.
    pub fn resolve_object(&self, side: Side, value: &BridgedValue) -> Result<PeerObject, BridgeError> {
        let BridgedValue::Foreign { handle, type_tag } = value else {
            return Err(BridgeError::EncodingMismatch {
                expected: "foreign reference".to_string(),
                found: value.category().to_string(),
            });
        };
        let expected_id = {
            let Ok(state) = self.state.lock() else {
                return Err(poisoned());
            };
            state.foreign_by_tag.get(type_tag).copied()
        };
        let Some(expected_id) = expected_id else {
            return Err(BridgeError::EncodingMismatch {
                expected: "registered bridged type tag".to_string(),
                found: type_tag.clone(),
            });
        };
        let object = side.exports().resolve(*handle)?;
        if (*object).type_id() != expected_id {
            return Err(BridgeError::ProtocolViolation {
                what: format!(
                    "foreign handle tagged '{type_tag}' resolves to a different concrete type"
                ),
            });
        }
        Ok(object)
    }

    /// Runs the registered decode half of a custom codec.
    pub fn decode_custom(&self, tag: &str, value: &BridgedValue) -> Result<PeerObject, BridgeError> {
        let codec = {
            let Ok(state) = self.state.lock() else {
                return Err(poisoned());
            };
            state.by_tag.get(tag).cloned()
        };
        let Some(codec) = codec else {
            return Err(BridgeError::EncodingMismatch {
                expected: "registered custom codec tag".to_string(),
                found: tag.to_string(),
            });
        };
        (codec.decode)(value)
    }
}

impl Default for CodecRegistry {
    fn default() -> CodecRegistry {
        CodecRegistry::new()
    }
}

fn check_tag(tag: &str) -> Result<()> {
    if !crate::decl::is_wire_tag(tag) {
        bail!("invalid marshaling tag '{tag}'");
    }
    if tag == CLOSURE_TYPE_TAG {
        bail!("marshaling tag '{tag}' is reserved for the bridge runtime");
    }
    Ok(())
}

fn structural_probe(obj: &(dyn Any + Send + Sync)) -> Option<BridgedValue> {
    if let Some(v) = obj.downcast_ref::<BridgedValue>() {
        return Some(v.clone());
    }
    if let Some(v) = obj.downcast_ref::<bool>() {
        return Some(BridgedValue::Bool(*v));
    }
    if let Some(v) = obj.downcast_ref::<i8>() {
        return Some(BridgedValue::I8(*v));
    }
    if let Some(v) = obj.downcast_ref::<i16>() {
        return Some(BridgedValue::I16(*v));
    }
    if let Some(v) = obj.downcast_ref::<i32>() {
        return Some(BridgedValue::I32(*v));
    }
    if let Some(v) = obj.downcast_ref::<i64>() {
        return Some(BridgedValue::I64(*v));
    }
    if let Some(v) = obj.downcast_ref::<u8>() {
        return Some(BridgedValue::U8(*v));
    }
    if let Some(v) = obj.downcast_ref::<u16>() {
        return Some(BridgedValue::U16(*v));
    }
    if let Some(v) = obj.downcast_ref::<u32>() {
        return Some(BridgedValue::U32(*v));
    }
    if let Some(v) = obj.downcast_ref::<u64>() {
        return Some(BridgedValue::U64(*v));
    }
    if let Some(v) = obj.downcast_ref::<f32>() {
        return Some(BridgedValue::F32(*v));
    }
    if let Some(v) = obj.downcast_ref::<f64>() {
        return Some(BridgedValue::F64(*v));
    }
    if let Some(v) = obj.downcast_ref::<String>() {
        return Some(BridgedValue::Str(v.clone()));
    }
    if let Some(v) = obj.downcast_ref::<Vec<u8>>() {
        return Some(BridgedValue::Blob(v.clone()));
    }
    if let Some(v) = obj.downcast_ref::<Vec<BridgedValue>>() {
        return Some(BridgedValue::Array(v.clone()));
    }
    None
}

static CODECS: OnceCell<CodecRegistry> = OnceCell::new();

/// Process-wide codec registry.
pub fn codecs() -> &'static CodecRegistry {
    CODECS.get_or_init(CodecRegistry::new)
}

/// Exports through the process-wide registry.
pub fn export_object(side: Side, object: PeerObject) -> Result<BridgedValue, BridgeError> {
    codecs().export_object(side, object)
}

/// Resolves through the process-wide registry.
pub fn resolve_object(side: Side, value: &BridgedValue) -> Result<PeerObject, BridgeError> {
    codecs().resolve_object(side, value)
}
