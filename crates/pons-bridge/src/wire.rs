//! Byte codec for boundary-crossing values and call outcomes.
//!
//! Every value is a tag byte followed by a fixed-width or length-prefixed
//! little-endian payload:
//!
//! - `0x01` bool (one byte, 0 or 1)
//! - `0x02..=0x05` i8/i16/i32/i64, `0x06..=0x09` u8/u16/u32/u64
//! - `0x0a`/`0x0b` f32/f64 (IEEE 754 bits)
//! - `0x0c` str: u32 byte length, UTF-8 bytes
//! - `0x0d` optional: presence byte, then the value when present
//! - `0x0e` array, `0x0f` set: u32 count, then elements
//! - `0x10` map: u32 count, then key/value pairs in insertion order
//! - `0x11` tuple: u32 arity, then elements
//! - `0x12` variant: case name as str payload, u32 payload count, payloads
//! - `0x13` foreign: u64 raw handle, type tag as str payload
//! - `0x14` instant (i64 epoch nanoseconds), `0x15` uuid (16 raw bytes)
//! - `0x16` locale, `0x18` uri (str payload), `0x17` blob (u32 length, bytes)
//!
//! Unit occupies zero bytes. Closure-typed positions reuse the foreign
//! encoding with the reserved closure tag. A call outcome is the envelope
//! `magic | abi u32 | status byte | payload` where status 0 carries an
//! encoded return value, 1 an encoded thrown error, and 2 a fault message
//! from the far side's glue.

use pons_contracts::{CLOSURE_TYPE_TAG, OUTCOME_MAGIC, PONS_ABI_MAJOR};

use crate::decl::types;
use crate::error::{BridgeError, WireError};
use crate::limits::{limits, Limits};
use crate::peer::PeerHandle;
use crate::value::{BridgedValue, Ty};

const TAG_BOOL: u8 = 0x01;
const TAG_I8: u8 = 0x02;
const TAG_I16: u8 = 0x03;
const TAG_I32: u8 = 0x04;
const TAG_I64: u8 = 0x05;
const TAG_U8: u8 = 0x06;
const TAG_U16: u8 = 0x07;
const TAG_U32: u8 = 0x08;
const TAG_U64: u8 = 0x09;
const TAG_F32: u8 = 0x0a;
const TAG_F64: u8 = 0x0b;
const TAG_STR: u8 = 0x0c;
const TAG_OPTIONAL: u8 = 0x0d;
const TAG_ARRAY: u8 = 0x0e;
const TAG_SET: u8 = 0x0f;
const TAG_MAP: u8 = 0x10;
const TAG_TUPLE: u8 = 0x11;
const TAG_VARIANT: u8 = 0x12;
const TAG_FOREIGN: u8 = 0x13;
const TAG_INSTANT: u8 = 0x14;
const TAG_UUID: u8 = 0x15;
const TAG_LOCALE: u8 = 0x16;
const TAG_BLOB: u8 = 0x17;
const TAG_URI: u8 = 0x18;

const STATUS_RETURN: u8 = 0;
const STATUS_THROW: u8 = 1;
const STATUS_FAULT: u8 = 2;

const ERR_KIND_MESSAGE: u8 = 0;
const ERR_KIND_REGISTERED: u8 = 1;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                need: n,
                have: self.remaining(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Raw bytes consumed since `start`, borrowed from the input rather
    /// than the reader.
    fn span(&self, start: usize) -> &'a [u8] {
        &self.buf[start..self.pos]
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8], lim: &Limits) -> Result<(), BridgeError> {
    if bytes.len() > lim.max_value_bytes as usize {
        return Err(WireError::TooLarge {
            len: bytes.len(),
            max: lim.max_value_bytes,
        }
        .into());
    }
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_count(out: &mut Vec<u8>, count: usize, lim: &Limits) -> Result<(), BridgeError> {
    if count > lim.max_entries as usize {
        return Err(WireError::TooManyEntries {
            count: count.min(u32::MAX as usize) as u32,
            max: lim.max_entries,
        }
        .into());
    }
    out.extend_from_slice(&(count as u32).to_le_bytes());
    Ok(())
}

fn read_count(r: &mut Reader<'_>, lim: &Limits) -> Result<usize, BridgeError> {
    let count = r.u32()?;
    if count > lim.max_entries {
        return Err(WireError::TooManyEntries {
            count,
            max: lim.max_entries,
        }
        .into());
    }
    Ok(count as usize)
}

fn read_string(r: &mut Reader<'_>, lim: &Limits) -> Result<String, BridgeError> {
    let len = r.u32()? as usize;
    if len > lim.max_value_bytes as usize {
        return Err(WireError::TooLarge {
            len,
            max: lim.max_value_bytes,
        }
        .into());
    }
    let bytes = r.take(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| BridgeError::from(WireError::BadUtf8))
}

fn expect_tag(r: &mut Reader<'_>, want: u8, expected: &'static str) -> Result<(), WireError> {
    let tag = r.u8()?;
    if tag != want {
        return Err(WireError::TagMismatch {
            expected,
            found: tag,
        });
    }
    Ok(())
}

fn mismatch(declared: &Ty, value: &BridgedValue) -> BridgeError {
    BridgeError::EncodingMismatch {
        expected: declared.describe(),
        found: value.category().to_string(),
    }
}

fn has_duplicates(encodings: &[&[u8]]) -> bool {
    let mut sorted = encodings.to_vec();
    sorted.sort_unstable();
    sorted.windows(2).any(|w| w[0] == w[1])
}

/// Encodes one value against its declared type. Rejects any disagreement
/// between the two; nothing narrows or widens implicitly.
pub fn encode_value(value: &BridgedValue, declared: &Ty) -> Result<Vec<u8>, BridgeError> {
    let mut out = Vec::new();
    encode_into(value, declared, 0, &mut out)?;
    let lim = limits();
    if out.len() > lim.max_value_bytes as usize {
        return Err(WireError::TooLarge {
            len: out.len(),
            max: lim.max_value_bytes,
        }
        .into());
    }
    Ok(out)
}

fn encode_into(
    value: &BridgedValue,
    declared: &Ty,
    depth: u32,
    out: &mut Vec<u8>,
) -> Result<(), BridgeError> {
    let lim = limits();
    if depth > lim.max_depth {
        return Err(WireError::DepthExceeded { max: lim.max_depth }.into());
    }
    match (declared, value) {
        (Ty::Unit, BridgedValue::Tuple(items)) if items.is_empty() => {}
        (Ty::Bool, BridgedValue::Bool(v)) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*v));
        }
        (Ty::I8, BridgedValue::I8(v)) => {
            out.push(TAG_I8);
            out.extend_from_slice(&v.to_le_bytes());
        }
        (Ty::I16, BridgedValue::I16(v)) => {
            out.push(TAG_I16);
            out.extend_from_slice(&v.to_le_bytes());
        }
        (Ty::I32, BridgedValue::I32(v)) => {
            out.push(TAG_I32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        (Ty::I64, BridgedValue::I64(v)) => {
            out.push(TAG_I64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        (Ty::U8, BridgedValue::U8(v)) => {
            out.push(TAG_U8);
            out.extend_from_slice(&v.to_le_bytes());
        }
        (Ty::U16, BridgedValue::U16(v)) => {
            out.push(TAG_U16);
            out.extend_from_slice(&v.to_le_bytes());
        }
        (Ty::U32, BridgedValue::U32(v)) => {
            out.push(TAG_U32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        (Ty::U64, BridgedValue::U64(v)) => {
            out.push(TAG_U64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        (Ty::F32, BridgedValue::F32(v)) => {
            out.push(TAG_F32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        (Ty::F64, BridgedValue::F64(v)) => {
            out.push(TAG_F64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        (Ty::Str, BridgedValue::Str(s)) => {
            out.push(TAG_STR);
            write_bytes(out, s.as_bytes(), lim)?;
        }
        (Ty::Optional(inner), BridgedValue::Optional(opt)) => {
            out.push(TAG_OPTIONAL);
            match opt {
                None => out.push(0),
                Some(v) => {
                    out.push(1);
                    encode_into(v, inner, depth + 1, out)?;
                }
            }
        }
        (Ty::Array(elem), BridgedValue::Array(items)) => {
            out.push(TAG_ARRAY);
            write_count(out, items.len(), lim)?;
            for item in items {
                encode_into(item, elem, depth + 1, out)?;
            }
        }
        (Ty::Set(elem), BridgedValue::Set(items)) => {
            if !elem.is_hashable() {
                return Err(BridgeError::EncodingMismatch {
                    expected: "hashable set element type".to_string(),
                    found: elem.describe(),
                });
            }
            out.push(TAG_SET);
            write_count(out, items.len(), lim)?;
            let mut encoded: Vec<Vec<u8>> = Vec::with_capacity(items.len());
            for item in items {
                let mut buf = Vec::new();
                encode_into(item, elem, depth + 1, &mut buf)?;
                encoded.push(buf);
            }
            let views: Vec<&[u8]> = encoded.iter().map(|b| b.as_slice()).collect();
            if has_duplicates(&views) {
                return Err(BridgeError::EncodingMismatch {
                    expected: "distinct set elements".to_string(),
                    found: "duplicate element".to_string(),
                });
            }
            for buf in &encoded {
                out.extend_from_slice(buf);
            }
        }
        (Ty::Map(key_ty, val_ty), BridgedValue::Map(entries)) => {
            if !key_ty.is_hashable() {
                return Err(BridgeError::EncodingMismatch {
                    expected: "hashable map key type".to_string(),
                    found: key_ty.describe(),
                });
            }
            out.push(TAG_MAP);
            write_count(out, entries.len(), lim)?;
            let mut encoded: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(entries.len());
            for (key, val) in entries {
                let mut kb = Vec::new();
                encode_into(key, key_ty, depth + 1, &mut kb)?;
                let mut vb = Vec::new();
                encode_into(val, val_ty, depth + 1, &mut vb)?;
                encoded.push((kb, vb));
            }
            let keys: Vec<&[u8]> = encoded.iter().map(|(k, _)| k.as_slice()).collect();
            if has_duplicates(&keys) {
                return Err(BridgeError::EncodingMismatch {
                    expected: "distinct map keys".to_string(),
                    found: "duplicate key".to_string(),
                });
            }
            for (kb, vb) in &encoded {
                out.extend_from_slice(kb);
                out.extend_from_slice(vb);
            }
        }
        (Ty::Tuple(types), BridgedValue::Tuple(items)) => {
            if types.len() != items.len() {
                return Err(BridgeError::EncodingMismatch {
                    expected: format!("tuple of arity {}", types.len()),
                    found: format!("tuple of arity {}", items.len()),
                });
            }
            out.push(TAG_TUPLE);
            write_count(out, items.len(), lim)?;
            for (item, ty) in items.iter().zip(types) {
                encode_into(item, ty, depth + 1, out)?;
            }
        }
        (Ty::Variant(name), BridgedValue::Variant { case, payload }) => {
            let Some(decl) = types().variant(name) else {
                return Err(BridgeError::EncodingMismatch {
                    expected: format!("registered variant type {name}"),
                    found: "unregistered variant".to_string(),
                });
            };
            let Some(case_decl) = decl.cases.iter().find(|c| c.name == *case) else {
                return Err(BridgeError::EncodingMismatch {
                    expected: format!("case of variant {name}"),
                    found: case.clone(),
                });
            };
            if case_decl.payload.len() != payload.len() {
                return Err(BridgeError::EncodingMismatch {
                    expected: format!("{} payload values for case {case}", case_decl.payload.len()),
                    found: format!("{}", payload.len()),
                });
            }
            out.push(TAG_VARIANT);
            write_bytes(out, case.as_bytes(), lim)?;
            write_count(out, payload.len(), lim)?;
            for (item, ty) in payload.iter().zip(&case_decl.payload) {
                encode_into(item, ty, depth + 1, out)?;
            }
        }
        (Ty::Foreign(expected), BridgedValue::Foreign { handle, type_tag }) => {
            if type_tag != expected {
                return Err(BridgeError::EncodingMismatch {
                    expected: format!("foreign {expected}"),
                    found: format!("foreign {type_tag}"),
                });
            }
            encode_foreign(out, *handle, type_tag, lim)?;
        }
        (Ty::Closure { .. }, BridgedValue::Foreign { handle, type_tag }) => {
            if type_tag != CLOSURE_TYPE_TAG {
                return Err(BridgeError::EncodingMismatch {
                    expected: "closure reference".to_string(),
                    found: format!("foreign {type_tag}"),
                });
            }
            encode_foreign(out, *handle, type_tag, lim)?;
        }
        (Ty::Instant, BridgedValue::Instant(ns)) => {
            out.push(TAG_INSTANT);
            out.extend_from_slice(&ns.to_le_bytes());
        }
        (Ty::Uuid, BridgedValue::Uuid(id)) => {
            out.push(TAG_UUID);
            out.extend_from_slice(id);
        }
        (Ty::Locale, BridgedValue::Locale(s)) => {
            out.push(TAG_LOCALE);
            write_bytes(out, s.as_bytes(), lim)?;
        }
        (Ty::Blob, BridgedValue::Blob(b)) => {
            out.push(TAG_BLOB);
            write_bytes(out, b, lim)?;
        }
        (Ty::Uri, BridgedValue::Uri(s)) => {
            out.push(TAG_URI);
            write_bytes(out, s.as_bytes(), lim)?;
        }
        (declared, value) => return Err(mismatch(declared, value)),
    }
    Ok(())
}

fn encode_foreign(
    out: &mut Vec<u8>,
    handle: PeerHandle,
    type_tag: &str,
    lim: &Limits,
) -> Result<(), BridgeError> {
    if handle.is_nil() {
        return Err(BridgeError::EncodingMismatch {
            expected: "live foreign reference".to_string(),
            found: "nil handle".to_string(),
        });
    }
    out.push(TAG_FOREIGN);
    out.extend_from_slice(&handle.raw().to_le_bytes());
    write_bytes(out, type_tag.as_bytes(), lim)
}

/// Decodes one value against its declared type, requiring full consumption
/// of the input.
pub fn decode_value(bytes: &[u8], declared: &Ty) -> Result<BridgedValue, BridgeError> {
    let lim = limits();
    if bytes.len() > lim.max_value_bytes as usize {
        return Err(WireError::TooLarge {
            len: bytes.len(),
            max: lim.max_value_bytes,
        }
        .into());
    }
    let mut r = Reader::new(bytes);
    let value = decode_at(&mut r, declared, 0)?;
    if r.remaining() != 0 {
        return Err(WireError::TrailingBytes {
            extra: r.remaining(),
        }
        .into());
    }
    Ok(value)
}

fn decode_at(r: &mut Reader<'_>, declared: &Ty, depth: u32) -> Result<BridgedValue, BridgeError> {
    let lim = limits();
    if depth > lim.max_depth {
        return Err(WireError::DepthExceeded { max: lim.max_depth }.into());
    }
    match declared {
        Ty::Unit => Ok(BridgedValue::unit()),
        Ty::Bool => {
            expect_tag(r, TAG_BOOL, "bool")?;
            match r.u8()? {
                0 => Ok(BridgedValue::Bool(false)),
                1 => Ok(BridgedValue::Bool(true)),
                value => Err(WireError::InvalidByte {
                    what: "bool",
                    value,
                }
                .into()),
            }
        }
        Ty::I8 => {
            expect_tag(r, TAG_I8, "i8")?;
            Ok(BridgedValue::I8(r.u8()? as i8))
        }
        Ty::I16 => {
            expect_tag(r, TAG_I16, "i16")?;
            let b = r.take(2)?;
            Ok(BridgedValue::I16(i16::from_le_bytes([b[0], b[1]])))
        }
        Ty::I32 => {
            expect_tag(r, TAG_I32, "i32")?;
            let b = r.take(4)?;
            Ok(BridgedValue::I32(i32::from_le_bytes([
                b[0], b[1], b[2], b[3],
            ])))
        }
        Ty::I64 => {
            expect_tag(r, TAG_I64, "i64")?;
            Ok(BridgedValue::I64(r.u64()? as i64))
        }
        Ty::U8 => {
            expect_tag(r, TAG_U8, "u8")?;
            Ok(BridgedValue::U8(r.u8()?))
        }
        Ty::U16 => {
            expect_tag(r, TAG_U16, "u16")?;
            let b = r.take(2)?;
            Ok(BridgedValue::U16(u16::from_le_bytes([b[0], b[1]])))
        }
        Ty::U32 => {
            expect_tag(r, TAG_U32, "u32")?;
            Ok(BridgedValue::U32(r.u32()?))
        }
        Ty::U64 => {
            expect_tag(r, TAG_U64, "u64")?;
            Ok(BridgedValue::U64(r.u64()?))
        }
        Ty::F32 => {
            expect_tag(r, TAG_F32, "f32")?;
            let b = r.take(4)?;
            Ok(BridgedValue::F32(f32::from_le_bytes([
                b[0], b[1], b[2], b[3],
            ])))
        }
        Ty::F64 => {
            expect_tag(r, TAG_F64, "f64")?;
            let b = r.take(8)?;
            Ok(BridgedValue::F64(f64::from_le_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ])))
        }
        Ty::Str => {
            expect_tag(r, TAG_STR, "str")?;
            Ok(BridgedValue::Str(read_string(r, lim)?))
        }
        Ty::Optional(inner) => {
            expect_tag(r, TAG_OPTIONAL, "optional")?;
            match r.u8()? {
                0 => Ok(BridgedValue::Optional(None)),
                1 => Ok(BridgedValue::Optional(Some(Box::new(decode_at(
                    r,
                    inner,
                    depth + 1,
                )?)))),
                value => Err(WireError::InvalidByte {
                    what: "optional presence",
                    value,
                }
                .into()),
            }
        }
        Ty::Array(elem) => {
            expect_tag(r, TAG_ARRAY, "array")?;
            let count = read_count(r, lim)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_at(r, elem, depth + 1)?);
            }
            Ok(BridgedValue::Array(items))
        }
        Ty::Set(elem) => {
            if !elem.is_hashable() {
                return Err(BridgeError::EncodingMismatch {
                    expected: "hashable set element type".to_string(),
                    found: elem.describe(),
                });
            }
            expect_tag(r, TAG_SET, "set")?;
            let count = read_count(r, lim)?;
            let mut items = Vec::with_capacity(count);
            let mut spans = Vec::with_capacity(count);
            for _ in 0..count {
                let start = r.pos;
                items.push(decode_at(r, elem, depth + 1)?);
                spans.push(r.span(start));
            }
            if has_duplicates(&spans) {
                return Err(BridgeError::ProtocolViolation {
                    what: "duplicate set element on the wire".to_string(),
                });
            }
            Ok(BridgedValue::Set(items))
        }
        Ty::Map(key_ty, val_ty) => {
            if !key_ty.is_hashable() {
                return Err(BridgeError::EncodingMismatch {
                    expected: "hashable map key type".to_string(),
                    found: key_ty.describe(),
                });
            }
            expect_tag(r, TAG_MAP, "map")?;
            let count = read_count(r, lim)?;
            let mut entries = Vec::with_capacity(count);
            let mut key_spans = Vec::with_capacity(count);
            for _ in 0..count {
                let start = r.pos;
                let key = decode_at(r, key_ty, depth + 1)?;
                key_spans.push(r.span(start));
                let val = decode_at(r, val_ty, depth + 1)?;
                entries.push((key, val));
            }
            if has_duplicates(&key_spans) {
                return Err(BridgeError::ProtocolViolation {
                    what: "duplicate map key on the wire".to_string(),
                });
            }
            Ok(BridgedValue::Map(entries))
        }
        Ty::Tuple(types) => {
            expect_tag(r, TAG_TUPLE, "tuple")?;
            let count = read_count(r, lim)?;
            if count != types.len() {
                return Err(BridgeError::ProtocolViolation {
                    what: format!(
                        "tuple arity mismatch: declared {}, wire carries {count}",
                        types.len()
                    ),
                });
            }
            let mut items = Vec::with_capacity(count);
            for ty in types {
                items.push(decode_at(r, ty, depth + 1)?);
            }
            Ok(BridgedValue::Tuple(items))
        }
        Ty::Variant(name) => {
            let Some(decl) = types().variant(name) else {
                return Err(BridgeError::EncodingMismatch {
                    expected: format!("registered variant type {name}"),
                    found: "unregistered variant".to_string(),
                });
            };
            expect_tag(r, TAG_VARIANT, "variant")?;
            let case = read_string(r, lim)?;
            // Unknown cases are a hard error, never a default case.
            let Some(case_decl) = decl.cases.iter().find(|c| c.name == case) else {
                return Err(BridgeError::ProtocolViolation {
                    what: format!("unknown case '{case}' for variant {name}"),
                });
            };
            let count = read_count(r, lim)?;
            if count != case_decl.payload.len() {
                return Err(BridgeError::ProtocolViolation {
                    what: format!(
                        "variant {name} case {case} payload arity mismatch: declared {}, wire carries {count}",
                        case_decl.payload.len()
                    ),
                });
            }
            let mut payload = Vec::with_capacity(count);
            for ty in &case_decl.payload {
                payload.push(decode_at(r, ty, depth + 1)?);
            }
            Ok(BridgedValue::Variant { case, payload })
        }
        Ty::Foreign(expected) => decode_foreign(r, expected, lim),
        Ty::Closure { .. } => decode_foreign(r, CLOSURE_TYPE_TAG, lim),
        Ty::Instant => {
            expect_tag(r, TAG_INSTANT, "instant")?;
            Ok(BridgedValue::Instant(r.u64()? as i64))
        }
        Ty::Uuid => {
            expect_tag(r, TAG_UUID, "uuid")?;
            let b = r.take(16)?;
            let mut id = [0u8; 16];
            id.copy_from_slice(b);
            Ok(BridgedValue::Uuid(id))
        }
        Ty::Locale => {
            expect_tag(r, TAG_LOCALE, "locale")?;
            Ok(BridgedValue::Locale(read_string(r, lim)?))
        }
        Ty::Blob => {
            expect_tag(r, TAG_BLOB, "blob")?;
            let len = r.u32()? as usize;
            if len > lim.max_value_bytes as usize {
                return Err(WireError::TooLarge {
                    len,
                    max: lim.max_value_bytes,
                }
                .into());
            }
            Ok(BridgedValue::Blob(r.take(len)?.to_vec()))
        }
        Ty::Uri => {
            expect_tag(r, TAG_URI, "uri")?;
            Ok(BridgedValue::Uri(read_string(r, lim)?))
        }
    }
}

fn decode_foreign(
    r: &mut Reader<'_>,
    expected: &str,
    lim: &Limits,
) -> Result<BridgedValue, BridgeError> {
    expect_tag(r, TAG_FOREIGN, "foreign reference")?;
    let handle = PeerHandle::from_raw(r.u64()?);
    let type_tag = read_string(r, lim)?;
    if type_tag != expected {
        return Err(BridgeError::ProtocolViolation {
            what: format!("foreign type tag mismatch: expected {expected}, found {type_tag}"),
        });
    }
    if handle.is_nil() {
        return Err(BridgeError::ProtocolViolation {
            what: format!("nil handle in foreign reference tagged {type_tag}"),
        });
    }
    Ok(BridgedValue::Foreign { handle, type_tag })
}

/// Encodes an argument frame: u32 count, then each value against its
/// parameter type. Arity is checked before any value bytes are produced.
pub fn encode_args(args: &[BridgedValue], params: &[Ty]) -> Result<Vec<u8>, BridgeError> {
    if args.len() != params.len() {
        return Err(BridgeError::EncodingMismatch {
            expected: format!("{} arguments", params.len()),
            found: format!("{} arguments", args.len()),
        });
    }
    let mut out = Vec::new();
    out.extend_from_slice(&(args.len() as u32).to_le_bytes());
    for (arg, param) in args.iter().zip(params) {
        encode_into(arg, param, 0, &mut out)?;
    }
    let lim = limits();
    if out.len() > lim.max_value_bytes as usize {
        return Err(WireError::TooLarge {
            len: out.len(),
            max: lim.max_value_bytes,
        }
        .into());
    }
    Ok(out)
}

/// Decodes an argument frame against the declared parameter list.
pub fn decode_args(bytes: &[u8], params: &[Ty]) -> Result<Vec<BridgedValue>, BridgeError> {
    let lim = limits();
    if bytes.len() > lim.max_value_bytes as usize {
        return Err(WireError::TooLarge {
            len: bytes.len(),
            max: lim.max_value_bytes,
        }
        .into());
    }
    let mut r = Reader::new(bytes);
    let count = r.u32()? as usize;
    if count != params.len() {
        return Err(BridgeError::ProtocolViolation {
            what: format!(
                "argument frame carries {count} values, declaration names {}",
                params.len()
            ),
        });
    }
    let mut args = Vec::with_capacity(count);
    for param in params {
        args.push(decode_at(&mut r, param, 0)?);
    }
    if r.remaining() != 0 {
        return Err(WireError::TrailingBytes {
            extra: r.remaining(),
        }
        .into());
    }
    Ok(args)
}

/// Parsed form of a call-outcome envelope.
#[derive(Debug, PartialEq)]
pub enum Outcome<'a> {
    Return(&'a [u8]),
    Throw(&'a [u8]),
    Fault(String),
}

fn envelope(status: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(OUTCOME_MAGIC.len() + 5 + payload.len());
    out.extend_from_slice(&OUTCOME_MAGIC);
    out.extend_from_slice(&PONS_ABI_MAJOR.to_le_bytes());
    out.push(status);
    out.extend_from_slice(payload);
    out
}

/// Wraps an encoded return value (empty for unit) in an outcome envelope.
pub fn envelope_ok(payload: &[u8]) -> Vec<u8> {
    envelope(STATUS_RETURN, payload)
}

/// Wraps an encoded thrown error in an outcome envelope.
pub fn envelope_throw(payload: &[u8]) -> Vec<u8> {
    envelope(STATUS_THROW, payload)
}

/// Wraps a glue fault message in an outcome envelope.
pub fn envelope_fault(message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + message.len());
    payload.extend_from_slice(&(message.len() as u32).to_le_bytes());
    payload.extend_from_slice(message.as_bytes());
    envelope(STATUS_FAULT, &payload)
}

pub fn parse_outcome(bytes: &[u8]) -> Result<Outcome<'_>, BridgeError> {
    let mut r = Reader::new(bytes);
    if r.take(OUTCOME_MAGIC.len())? != OUTCOME_MAGIC {
        return Err(WireError::BadEnvelope("bad magic").into());
    }
    let abi = r.u32()?;
    if abi != PONS_ABI_MAJOR {
        return Err(WireError::AbiMismatch {
            expected: PONS_ABI_MAJOR,
            found: abi,
        }
        .into());
    }
    let status = r.u8()?;
    let rest = &bytes[r.pos..];
    match status {
        STATUS_RETURN => Ok(Outcome::Return(rest)),
        STATUS_THROW => Ok(Outcome::Throw(rest)),
        STATUS_FAULT => {
            let message = read_string(&mut r, limits())?;
            if r.remaining() != 0 {
                return Err(WireError::TrailingBytes {
                    extra: r.remaining(),
                }
                .into());
            }
            Ok(Outcome::Fault(message))
        }
        _ => Err(WireError::BadEnvelope("bad status byte").into()),
    }
}

/// Encodes a thrown error. Registered errors carry their tag and typed
/// payload; everything else carries a message.
pub fn encode_error(err: &crate::error::BridgedError) -> Result<Vec<u8>, BridgeError> {
    use crate::error::BridgedError;
    let lim = limits();
    let mut out = Vec::new();
    match err {
        BridgedError::Message(text) => {
            out.push(ERR_KIND_MESSAGE);
            write_bytes(&mut out, text.as_bytes(), lim)?;
        }
        BridgedError::Registered { type_tag, payload } => {
            let Some(decl) = types().error(type_tag) else {
                return Err(BridgeError::EncodingMismatch {
                    expected: "registered bridged error type".to_string(),
                    found: type_tag.clone(),
                });
            };
            out.push(ERR_KIND_REGISTERED);
            write_bytes(&mut out, type_tag.as_bytes(), lim)?;
            encode_into(payload, &decl.payload, 0, &mut out)?;
        }
    }
    Ok(out)
}

/// Decodes a thrown error. An unregistered tag is a hard error, not a
/// silent downgrade to a message.
pub fn decode_error(bytes: &[u8]) -> Result<crate::error::BridgedError, BridgeError> {
    use crate::error::BridgedError;
    let lim = limits();
    let mut r = Reader::new(bytes);
    let kind = r.u8()?;
    let err = match kind {
        ERR_KIND_MESSAGE => BridgedError::Message(read_string(&mut r, lim)?),
        ERR_KIND_REGISTERED => {
            let type_tag = read_string(&mut r, lim)?;
            let Some(decl) = types().error(&type_tag) else {
                return Err(BridgeError::ProtocolViolation {
                    what: format!("unregistered bridged error tag '{type_tag}'"),
                });
            };
            let payload = decode_at(&mut r, &decl.payload, 0)?;
            BridgedError::Registered { type_tag, payload }
        }
        value => {
            return Err(WireError::InvalidByte {
                what: "error kind",
                value,
            }
            .into())
        }
    };
    if r.remaining() != 0 {
        return Err(WireError::TrailingBytes {
            extra: r.remaining(),
        }
        .into());
    }
    Ok(err)
}

/// Builds the payload of a closure-invoke entry call: the raw closure
/// handle, then a normal argument frame. The handle crosses as a borrow;
/// the caller's trampoline keeps it retained for the duration.
pub fn encode_closure_invoke(
    handle: PeerHandle,
    args: &[BridgedValue],
    params: &[Ty],
) -> Result<Vec<u8>, BridgeError> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&handle.raw().to_le_bytes());
    out.extend_from_slice(&encode_args(args, params)?);
    Ok(out)
}

/// Splits a closure-invoke payload into the target handle and the argument
/// frame.
pub fn split_closure_invoke(payload: &[u8]) -> Result<(PeerHandle, &[u8]), BridgeError> {
    if payload.len() < 8 {
        return Err(WireError::Truncated {
            need: 8,
            have: payload.len(),
        }
        .into());
    }
    let handle = u64::from_le_bytes([
        payload[0], payload[1], payload[2], payload[3], payload[4], payload[5], payload[6],
        payload[7],
    ]);
    Ok((PeerHandle::from_raw(handle), &payload[8..]))
}
