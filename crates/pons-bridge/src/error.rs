use crate::value::BridgedValue;

/// Structural failure while reading or writing the byte form of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum WireError {
    Truncated { need: usize, have: usize },
    TrailingBytes { extra: usize },
    TagMismatch { expected: &'static str, found: u8 },
    InvalidByte { what: &'static str, value: u8 },
    BadUtf8,
    DepthExceeded { max: u32 },
    TooManyEntries { count: u32, max: u32 },
    TooLarge { len: usize, max: u32 },
    BadEnvelope(&'static str),
    AbiMismatch { expected: u32, found: u32 },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated { need, have } => {
                write!(f, "truncated value: need {need} bytes, have {have}")
            }
            WireError::TrailingBytes { extra } => {
                write!(f, "{extra} trailing bytes after value")
            }
            WireError::TagMismatch { expected, found } => {
                write!(f, "wire tag {found:#04x} does not encode {expected}")
            }
            WireError::InvalidByte { what, value } => {
                write!(f, "invalid {what} byte {value:#04x}")
            }
            WireError::BadUtf8 => write!(f, "string payload is not valid UTF-8"),
            WireError::DepthExceeded { max } => {
                write!(f, "value nesting exceeds depth limit {max}")
            }
            WireError::TooManyEntries { count, max } => {
                write!(f, "collection count {count} exceeds entry limit {max}")
            }
            WireError::TooLarge { len, max } => {
                write!(f, "encoded value of {len} bytes exceeds limit {max}")
            }
            WireError::BadEnvelope(what) => write!(f, "malformed outcome envelope: {what}"),
            WireError::AbiMismatch { expected, found } => {
                write!(f, "outcome envelope carries ABI {found}, expected {expected}")
            }
        }
    }
}

impl std::error::Error for WireError {}

/// Infrastructure failure of the bridge itself, as opposed to an error value
/// thrown by bridged user code.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Generated glue or a registry talked nonsense: unknown case tags,
    /// foreign tag mismatches, stale handle traffic.
    ProtocolViolation { what: String },
    /// The module is loaded but does not export the mangled symbol.
    MissingSymbol { symbol: String },
    /// No module of that name has been loaded on the target side.
    LibraryNotLoaded { module: String },
    /// A value's runtime shape does not match its declared bridged type.
    EncodingMismatch { expected: String, found: String },
    Wire(WireError),
    /// The far side's glue reported a fault instead of an outcome.
    Remote { message: String },
    /// The producer of an async completion went away before delivering.
    CompletionDropped,
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::ProtocolViolation { what } => write!(f, "protocol violation: {what}"),
            BridgeError::MissingSymbol { symbol } => {
                write!(f, "missing bridge entry symbol: {symbol}")
            }
            BridgeError::LibraryNotLoaded { module } => {
                write!(f, "module library not loaded: {module}")
            }
            BridgeError::EncodingMismatch { expected, found } => {
                write!(f, "encoding mismatch: expected {expected}, found {found}")
            }
            BridgeError::Wire(e) => write!(f, "wire error: {e}"),
            BridgeError::Remote { message } => write!(f, "remote bridge fault: {message}"),
            BridgeError::CompletionDropped => {
                write!(f, "async completion dropped before delivery")
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for BridgeError {
    fn from(e: WireError) -> BridgeError {
        BridgeError::Wire(e)
    }
}

/// An error value thrown by bridged user code and re-raised on the caller's
/// side.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgedError {
    /// Degraded form: only the rendered message survived the crossing.
    Message(String),
    /// A registered error type crossing with its typed payload intact.
    Registered { type_tag: String, payload: BridgedValue },
}

impl BridgedError {
    /// Builds a structured error for a tag present in the error-type
    /// registry. The payload must conform to the registered payload type.
    pub fn registered(type_tag: &str, payload: BridgedValue) -> Result<BridgedError, BridgeError> {
        let Some(decl) = crate::decl::types().error(type_tag) else {
            return Err(BridgeError::EncodingMismatch {
                expected: "registered bridged error type".to_string(),
                found: type_tag.to_string(),
            });
        };
        crate::wire::encode_value(&payload, &decl.payload)?;
        Ok(BridgedError::Registered {
            type_tag: type_tag.to_string(),
            payload,
        })
    }

    /// Fallback conversion for arbitrary native errors. Identity is lost:
    /// only the message crosses, and the far side sees `Message`.
    pub fn from_error(err: &dyn std::error::Error) -> BridgedError {
        BridgedError::Message(err.to_string())
    }
}

impl std::fmt::Display for BridgedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgedError::Message(m) => write!(f, "{m}"),
            BridgedError::Registered { type_tag, .. } => write!(f, "bridged error {type_tag}"),
        }
    }
}

impl std::error::Error for BridgedError {}

/// Outcome of one cross-runtime call: either the bridge failed, or the callee
/// threw.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    Bridge(BridgeError),
    Thrown(BridgedError),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Bridge(e) => write!(f, "{e}"),
            CallError::Thrown(e) => write!(f, "callee threw: {e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Bridge(e) => Some(e),
            CallError::Thrown(e) => Some(e),
        }
    }
}

impl From<BridgeError> for CallError {
    fn from(e: BridgeError) -> CallError {
        CallError::Bridge(e)
    }
}

impl From<BridgedError> for CallError {
    fn from(e: BridgedError) -> CallError {
        CallError::Thrown(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_are_stable() {
        let e = BridgeError::MissingSymbol {
            symbol: "pons_m1_a_t0__f1_f_s__v".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "missing bridge entry symbol: pons_m1_a_t0__f1_f_s__v"
        );
        let w = BridgeError::Wire(WireError::TrailingBytes { extra: 3 });
        assert_eq!(w.to_string(), "wire error: 3 trailing bytes after value");
    }

    #[test]
    fn from_error_degrades_to_message() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        match BridgedError::from_error(&io) {
            BridgedError::Message(m) => assert!(m.contains("disk gone")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
