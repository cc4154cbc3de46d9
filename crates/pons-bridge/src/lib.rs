//! In-process object bridge between a reference-counted native runtime and a
//! garbage-collected managed runtime.
//!
//! Objects cross the boundary as opaque peer handles held in per-side
//! registries, values cross through a closed typed wire codec, and callables
//! cross as trampolines that forward invocations back to their home side.

mod decl;
mod error;
mod limits;
mod marshal;
mod peer;
mod task;
mod trampoline;
mod value;
mod wire;

pub use decl::{
    entries, load_module_manifest, mangle, parse_module_manifest, serve_async, serve_streaming,
    serve_sync, types, BridgedDecl, CaseDecl, Dispatcher, EntryFn, EntryTable, ErrorDecl,
    ModuleManifest, TypeRegistry, VariantDecl,
};
pub use error::{BridgeError, BridgedError, CallError, WireError};
pub use limits::{limits, Limits};
pub use marshal::{
    codecs, export_object, resolve_object, CodecRegistry, DecodeObjectFn, EncodeObjectFn,
};
pub use peer::{
    guest_exports, host_exports, BorrowedHandle, PeerHandle, PeerObject, PeerTable, Side,
    NIL_HANDLE,
};
pub use task::{
    bridge_runtime, AsyncCall, Completion, RemoteCompletion, RemoteStream, StreamEvent,
    StreamProducer, ValueStream,
};
pub use trampoline::{export_closure, ForeignClosure};
pub use value::{BridgedValue, Ty};
pub use wire::{
    decode_args, decode_error, decode_value, encode_args, encode_closure_invoke, encode_error,
    encode_value, envelope_fault, envelope_ok, envelope_throw, parse_outcome, split_closure_invoke,
    Outcome,
};

/// Upper bound, in bytes, on one encoded value or argument frame.
pub const ENV_MAX_VALUE_BYTES: &str = "PONS_MAX_VALUE_BYTES";
/// Upper bound on value nesting depth accepted by the codec.
pub const ENV_MAX_DEPTH: &str = "PONS_MAX_DEPTH";
/// Upper bound on the entry count of one encoded collection.
pub const ENV_MAX_ENTRIES: &str = "PONS_MAX_ENTRIES";
