//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for the bridge ABI numbers,
//! schema/version strings, and well-known entry names that appear in
//! machine-readable I/O. Both runtimes must agree on every value in this
//! crate; any incompatible change bumps `PONS_ABI_MAJOR`.

/// Major revision of the value wire format and outcome envelope.
pub const PONS_ABI_MAJOR: u32 = 1;
/// Minor revision; additive changes only.
pub const PONS_ABI_MINOR: u32 = 0;

/// Leading magic of every call-outcome envelope.
pub const OUTCOME_MAGIC: [u8; 4] = *b"PNSB";

pub const MODULE_MANIFEST_SCHEMA_VERSION: &str = "pons.module@0.1.0";

/// Entry name of the runtime module's closure-forwarding entry, preloaded
/// on each side.
pub const CLOSURE_INVOKE_SYMBOL: &str = "pons_rt_closure_invoke_v1";

/// Module name space reserved for the bridge runtime's own entries. User
/// module names are plain identifiers, so no manifest can claim this name.
pub const RT_MODULE: &str = "pons.rt";

/// Type tag carried on the wire by closure references.
pub const CLOSURE_TYPE_TAG: &str = "pons.closure";

/// Prefix of every mangled bridge symbol.
pub const MANGLE_PREFIX: &str = "pons_";

// Trap codes quoted by debug-fatal protocol panics.
pub const TRAP_NIL_RESOLVE: i32 = 9501;
pub const TRAP_STALE_HANDLE: i32 = 9502;
pub const TRAP_OVER_RELEASE: i32 = 9503;
