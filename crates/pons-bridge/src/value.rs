//! The closed set of value categories that may cross the boundary.

use serde::Deserialize;

use crate::peer::PeerHandle;

/// One boundary-crossing value.
///
/// The set is closed: anything not listed here crosses as a `Foreign`
/// reference or through a registered custom codec, never as an open-ended
/// object graph. `Tuple(vec![])` doubles as the unit value.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgedValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Optional(Option<Box<BridgedValue>>),
    Array(Vec<BridgedValue>),
    Set(Vec<BridgedValue>),
    /// Entries in insertion order; keys are unique.
    Map(Vec<(BridgedValue, BridgedValue)>),
    Tuple(Vec<BridgedValue>),
    Variant { case: String, payload: Vec<BridgedValue> },
    /// Reference to an object pinned in the exporting side's registry.
    Foreign { handle: PeerHandle, type_tag: String },
    /// Nanoseconds relative to the Unix epoch.
    Instant(i64),
    Uuid([u8; 16]),
    Locale(String),
    Blob(Vec<u8>),
    Uri(String),
}

impl BridgedValue {
    pub fn unit() -> BridgedValue {
        BridgedValue::Tuple(Vec::new())
    }

    pub fn category(&self) -> &'static str {
        match self {
            BridgedValue::Bool(_) => "bool",
            BridgedValue::I8(_) => "i8",
            BridgedValue::I16(_) => "i16",
            BridgedValue::I32(_) => "i32",
            BridgedValue::I64(_) => "i64",
            BridgedValue::U8(_) => "u8",
            BridgedValue::U16(_) => "u16",
            BridgedValue::U32(_) => "u32",
            BridgedValue::U64(_) => "u64",
            BridgedValue::F32(_) => "f32",
            BridgedValue::F64(_) => "f64",
            BridgedValue::Str(_) => "str",
            BridgedValue::Optional(_) => "optional",
            BridgedValue::Array(_) => "array",
            BridgedValue::Set(_) => "set",
            BridgedValue::Map(_) => "map",
            BridgedValue::Tuple(_) => "tuple",
            BridgedValue::Variant { .. } => "variant",
            BridgedValue::Foreign { .. } => "foreign",
            BridgedValue::Instant(_) => "instant",
            BridgedValue::Uuid(_) => "uuid",
            BridgedValue::Locale(_) => "locale",
            BridgedValue::Blob(_) => "blob",
            BridgedValue::Uri(_) => "uri",
        }
    }
}

/// Declared type of a parameter, result, or nested position.
///
/// Spelled in manifests as JSON: unit variants as plain strings
/// (`"i64"`), parameterized ones as single-key objects
/// (`{"optional": "str"}`, `{"map": ["str", "i64"]}`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ty {
    Unit,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
    Optional(Box<Ty>),
    Array(Box<Ty>),
    Set(Box<Ty>),
    Map(Box<Ty>, Box<Ty>),
    Tuple(Vec<Ty>),
    /// Named variant type; cases come from the type registry.
    Variant(String),
    /// Opaque reference with the given type tag.
    Foreign(String),
    Closure { params: Vec<Ty>, ret: Box<Ty> },
    Instant,
    Uuid,
    Locale,
    Blob,
    Uri,
}

impl Ty {
    /// Whether values of this type may be set elements or map keys. Floats,
    /// collections, foreign references and closures are excluded; variants
    /// are hashable when every case payload is.
    pub fn is_hashable(&self) -> bool {
        self.hashable_inner(&mut Vec::new())
    }

    fn hashable_inner(&self, seen: &mut Vec<String>) -> bool {
        match self {
            Ty::Bool
            | Ty::I8
            | Ty::I16
            | Ty::I32
            | Ty::I64
            | Ty::U8
            | Ty::U16
            | Ty::U32
            | Ty::U64
            | Ty::Str
            | Ty::Instant
            | Ty::Uuid
            | Ty::Locale
            | Ty::Blob
            | Ty::Uri => true,
            Ty::Optional(inner) => inner.hashable_inner(seen),
            Ty::Tuple(items) => items.iter().all(|t| t.hashable_inner(seen)),
            Ty::Variant(name) => {
                if seen.iter().any(|n| n == name) {
                    // Recursive variant; the cycle itself adds nothing new.
                    return true;
                }
                seen.push(name.clone());
                match crate::decl::types().variant(name) {
                    Some(decl) => decl
                        .cases
                        .iter()
                        .all(|c| c.payload.iter().all(|t| t.hashable_inner(seen))),
                    None => false,
                }
            }
            Ty::Unit
            | Ty::F32
            | Ty::F64
            | Ty::Array(_)
            | Ty::Set(_)
            | Ty::Map(..)
            | Ty::Foreign(_)
            | Ty::Closure { .. } => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Ty::Unit => "unit".to_string(),
            Ty::Bool => "bool".to_string(),
            Ty::I8 => "i8".to_string(),
            Ty::I16 => "i16".to_string(),
            Ty::I32 => "i32".to_string(),
            Ty::I64 => "i64".to_string(),
            Ty::U8 => "u8".to_string(),
            Ty::U16 => "u16".to_string(),
            Ty::U32 => "u32".to_string(),
            Ty::U64 => "u64".to_string(),
            Ty::F32 => "f32".to_string(),
            Ty::F64 => "f64".to_string(),
            Ty::Str => "str".to_string(),
            Ty::Optional(t) => format!("optional<{}>", t.describe()),
            Ty::Array(t) => format!("array<{}>", t.describe()),
            Ty::Set(t) => format!("set<{}>", t.describe()),
            Ty::Map(k, v) => format!("map<{}, {}>", k.describe(), v.describe()),
            Ty::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(|t| t.describe()).collect();
                format!("tuple({})", inner.join(", "))
            }
            Ty::Variant(name) => format!("variant {name}"),
            Ty::Foreign(tag) => format!("foreign {tag}"),
            Ty::Closure { .. } => "closure".to_string(),
            Ty::Instant => "instant".to_string(),
            Ty::Uuid => "uuid".to_string(),
            Ty::Locale => "locale".to_string(),
            Ty::Blob => "blob".to_string(),
            Ty::Uri => "uri".to_string(),
        }
    }
}
