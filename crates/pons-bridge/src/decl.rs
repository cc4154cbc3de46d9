//! Module manifests, symbol mangling, and call dispatch.
//!
//! A module manifest declares the members one side exposes to the other:
//! functions and methods with typed signatures, variant types, and bridged
//! error types. Loading a manifest claims its module name in the loading
//! side's entry table and registers its types process-wide. Each
//! declaration is reachable under a deterministic mangled symbol, so both
//! sides agree on names without a shared compiler.
//!
//! Async and streaming declarations never dispatch directly. They lower to
//! a synchronous shape whose final parameter is a callback closure, and the
//! glue on both sides is built from that lowered declaration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use pons_contracts::{
    CLOSURE_INVOKE_SYMBOL, CLOSURE_TYPE_TAG, MANGLE_PREFIX, MODULE_MANIFEST_SCHEMA_VERSION,
    PONS_ABI_MAJOR, RT_MODULE,
};

use crate::error::{BridgeError, BridgedError, CallError};
use crate::peer::Side;
use crate::task::{AsyncCall, RemoteCompletion, RemoteStream, StreamRelay, ValueStream};
use crate::trampoline::{self, ForeignClosure};
use crate::value::{BridgedValue, Ty};
use crate::wire;

/// Everything one module exposes across the boundary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleManifest {
    pub schema_version: String,
    pub abi_major: u32,
    pub module: String,
    #[serde(default)]
    pub decls: Vec<BridgedDecl>,
    #[serde(default)]
    pub variants: Vec<VariantDecl>,
    #[serde(default)]
    pub errors: Vec<ErrorDecl>,
}

/// One bridged function or method.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgedDecl {
    #[serde(default)]
    pub module: String,
    /// Owning type name; empty for free functions.
    #[serde(default)]
    pub owner: String,
    pub member: String,
    #[serde(default)]
    pub params: Vec<Ty>,
    #[serde(default = "unit_ty")]
    pub result: Ty,
    #[serde(default)]
    pub throws: bool,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub streaming: bool,
}

fn unit_ty() -> Ty {
    Ty::Unit
}

/// A closed sum type shared by both sides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantDecl {
    pub name: String,
    pub cases: Vec<CaseDecl>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseDecl {
    pub name: String,
    #[serde(default)]
    pub payload: Vec<Ty>,
}

/// A typed error that crosses the boundary without degrading to text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorDecl {
    pub type_tag: String,
    pub payload: Ty,
}

pub(crate) fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Dot-separated identifiers. Manifest-declared names are single
/// identifiers; the dotted space belongs to the runtime and to error tags.
pub(crate) fn is_wire_tag(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_ident)
}

impl ModuleManifest {
    /// Structural validation: identifier shapes, type placement, flag
    /// consistency, and symbol uniqueness.
    pub fn validate(&self) -> Result<()> {
        if !is_ident(&self.module) {
            bail!("invalid module name '{}'", self.module);
        }
        let mut symbols = BTreeSet::new();
        for decl in &self.decls {
            decl.validate(&self.module)?;
            let symbol = mangle(decl);
            if !symbols.insert(symbol.clone()) {
                bail!("duplicate entry symbol '{symbol}'");
            }
        }
        let mut names = BTreeSet::new();
        for variant in &self.variants {
            variant.validate()?;
            if !names.insert(variant.name.clone()) {
                bail!("duplicate variant type '{}'", variant.name);
            }
        }
        let mut tags = BTreeSet::new();
        for error in &self.errors {
            error.validate()?;
            if !tags.insert(error.type_tag.clone()) {
                bail!("duplicate bridged error tag '{}'", error.type_tag);
            }
        }
        Ok(())
    }
}

impl BridgedDecl {
    fn validate(&self, module: &str) -> Result<()> {
        if self.module != module {
            bail!(
                "declaration '{}' does not belong to module '{module}'",
                self.qualified()
            );
        }
        if !self.owner.is_empty() && !is_ident(&self.owner) {
            bail!("invalid owner type name '{}'", self.owner);
        }
        if !is_ident(&self.member) {
            bail!("invalid member name '{}'", self.member);
        }
        for param in &self.params {
            validate_ty(param, false).with_context(|| format!("parameter of '{}'", self.qualified()))?;
        }
        validate_ty(&self.result, true)
            .with_context(|| format!("result of '{}'", self.qualified()))?;
        if self.streaming && !self.is_async {
            bail!("'{}' is streaming but not async", self.qualified());
        }
        Ok(())
    }

    fn qualified(&self) -> String {
        if self.owner.is_empty() {
            format!("{}.{}", self.module, self.member)
        } else {
            format!("{}.{}.{}", self.module, self.owner, self.member)
        }
    }

    /// Parameters of the completion closure appended when an async
    /// declaration lowers: the present arm carries the result, the other
    /// arm an encoded error.
    pub fn completion_params(&self) -> Vec<Ty> {
        vec![
            Ty::Optional(Box::new(self.result.clone())),
            Ty::Optional(Box::new(Ty::Blob)),
        ]
    }

    /// Parameters of the event closure appended when a streaming
    /// declaration lowers: an optional element, a done flag, and an
    /// optional encoded error.
    pub fn event_params(&self) -> Vec<Ty> {
        vec![
            Ty::Optional(Box::new(self.result.clone())),
            Ty::Bool,
            Ty::Optional(Box::new(Ty::Blob)),
        ]
    }

    /// Synchronous shape of an async declaration: declared parameters plus
    /// a completion closure, returning unit immediately.
    pub fn lowered_async(&self) -> BridgedDecl {
        let mut lowered = self.clone();
        lowered.params.push(Ty::Closure {
            params: self.completion_params(),
            ret: Box::new(Ty::Unit),
        });
        lowered.result = Ty::Unit;
        lowered.throws = false;
        lowered.is_async = false;
        lowered.streaming = false;
        lowered
    }

    /// Synchronous shape of a streaming declaration: declared parameters
    /// plus an event closure, returning unit immediately.
    pub fn lowered_streaming(&self) -> BridgedDecl {
        let mut lowered = self.clone();
        lowered.params.push(Ty::Closure {
            params: self.event_params(),
            ret: Box::new(Ty::Unit),
        });
        lowered.result = Ty::Unit;
        lowered.throws = false;
        lowered.is_async = false;
        lowered.streaming = false;
        lowered
    }
}

impl VariantDecl {
    fn validate(&self) -> Result<()> {
        if !is_ident(&self.name) {
            bail!("invalid variant type name '{}'", self.name);
        }
        if self.cases.is_empty() {
            bail!("variant type '{}' has no cases", self.name);
        }
        let mut seen = BTreeSet::new();
        for case in &self.cases {
            if !is_ident(&case.name) {
                bail!("invalid case name '{}' in variant '{}'", case.name, self.name);
            }
            if !seen.insert(case.name.clone()) {
                bail!("duplicate case '{}' in variant '{}'", case.name, self.name);
            }
            for ty in &case.payload {
                validate_ty(ty, false)
                    .with_context(|| format!("payload of {}::{}", self.name, case.name))?;
            }
        }
        Ok(())
    }
}

impl ErrorDecl {
    fn validate(&self) -> Result<()> {
        if !is_wire_tag(&self.type_tag) {
            bail!("invalid bridged error tag '{}'", self.type_tag);
        }
        if self.type_tag == "pons" || self.type_tag.starts_with("pons.") {
            bail!(
                "bridged error tag '{}' is reserved for the bridge runtime",
                self.type_tag
            );
        }
        validate_ty(&self.payload, false)
            .with_context(|| format!("payload of bridged error '{}'", self.type_tag))
    }
}

fn validate_ty(ty: &Ty, unit_ok: bool) -> Result<()> {
    match ty {
        Ty::Unit if !unit_ok => bail!("unit is only valid in result position"),
        Ty::Unit => Ok(()),
        Ty::Optional(inner) | Ty::Array(inner) | Ty::Set(inner) => validate_ty(inner, false),
        Ty::Map(key, value) => {
            validate_ty(key, false)?;
            validate_ty(value, false)
        }
        Ty::Tuple(items) => {
            for item in items {
                validate_ty(item, false)?;
            }
            Ok(())
        }
        Ty::Variant(name) => {
            if !is_ident(name) {
                bail!("invalid variant type name '{name}'");
            }
            Ok(())
        }
        Ty::Foreign(tag) => {
            if !is_ident(tag) {
                bail!("invalid bridged type tag '{tag}' (declared tags are plain identifiers)");
            }
            Ok(())
        }
        Ty::Closure { params, ret } => {
            for param in params {
                validate_ty(param, false)?;
            }
            validate_ty(ret, true)
        }
        _ => Ok(()),
    }
}

/// Parses a manifest from JSON, checking schema and ABI pins before
/// anything else. Declarations may omit their module field; it fills from
/// the manifest.
pub fn parse_module_manifest(json: &str) -> Result<ModuleManifest> {
    let mut manifest: ModuleManifest =
        serde_json::from_str(json).context("parse module manifest JSON")?;
    if manifest.schema_version != MODULE_MANIFEST_SCHEMA_VERSION {
        bail!(
            "unsupported module manifest schema_version '{}' (want '{}')",
            manifest.schema_version,
            MODULE_MANIFEST_SCHEMA_VERSION
        );
    }
    if manifest.abi_major != PONS_ABI_MAJOR {
        bail!(
            "module manifest abi_major {} does not match runtime abi {}",
            manifest.abi_major,
            PONS_ABI_MAJOR
        );
    }
    for decl in &mut manifest.decls {
        if decl.module.is_empty() {
            decl.module = manifest.module.clone();
        }
    }
    manifest.validate()?;
    Ok(manifest)
}

/// Reads and parses a module manifest from disk.
pub fn load_module_manifest(path: &Path) -> Result<ModuleManifest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read module manifest: {}", path.display()))?;
    parse_module_manifest(&text).with_context(|| format!("parse module manifest: {}", path.display()))
}

/// Deterministic entry symbol for one declaration. Both sides derive the
/// same name from the same manifest, so lookup needs no negotiation.
pub fn mangle(decl: &BridgedDecl) -> String {
    let mut out = String::from(MANGLE_PREFIX);
    push_segment(&mut out, 'm', &decl.module);
    out.push('_');
    push_segment(&mut out, 't', &decl.owner);
    out.push('_');
    push_segment(&mut out, 'f', &decl.member);
    out.push_str("_s");
    for param in &decl.params {
        out.push('_');
        push_ty_code(&mut out, param);
    }
    out.push_str("__");
    push_ty_code(&mut out, &decl.result);
    out
}

fn push_segment(out: &mut String, kind: char, name: &str) {
    out.push(kind);
    out.push_str(&name.len().to_string());
    out.push('_');
    out.push_str(name);
}

// The code set is prefix-free so signatures concatenate unambiguously.
fn push_ty_code(out: &mut String, ty: &Ty) {
    match ty {
        Ty::Unit => out.push('v'),
        Ty::Bool => out.push('b'),
        Ty::I8 => out.push_str("i1"),
        Ty::I16 => out.push_str("i2"),
        Ty::I32 => out.push_str("i4"),
        Ty::I64 => out.push_str("i8"),
        Ty::U8 => out.push_str("u1"),
        Ty::U16 => out.push_str("u2"),
        Ty::U32 => out.push_str("u4"),
        Ty::U64 => out.push_str("u8"),
        Ty::F32 => out.push_str("f4"),
        Ty::F64 => out.push_str("f8"),
        Ty::Str => out.push_str("str"),
        Ty::Optional(inner) => {
            out.push('o');
            push_ty_code(out, inner);
        }
        Ty::Array(elem) => {
            out.push('a');
            push_ty_code(out, elem);
        }
        Ty::Set(elem) => {
            out.push('h');
            push_ty_code(out, elem);
        }
        Ty::Map(key, value) => {
            out.push('d');
            push_ty_code(out, key);
            push_ty_code(out, value);
        }
        Ty::Tuple(items) => {
            out.push('p');
            out.push_str(&items.len().to_string());
            for item in items {
                push_ty_code(out, item);
            }
        }
        Ty::Variant(name) => {
            out.push('e');
            out.push_str(&name.len().to_string());
            out.push('_');
            out.push_str(name);
        }
        Ty::Foreign(tag) => {
            out.push('x');
            out.push_str(&tag.len().to_string());
            out.push('_');
            out.push_str(tag);
        }
        Ty::Closure { params, ret } => {
            out.push('c');
            out.push_str(&params.len().to_string());
            for param in params {
                push_ty_code(out, param);
            }
            push_ty_code(out, ret);
        }
        Ty::Instant => out.push_str("ts"),
        Ty::Uuid => out.push_str("uid"),
        Ty::Locale => out.push_str("loc"),
        Ty::Blob => out.push('k'),
        Ty::Uri => out.push_str("uri"),
    }
}

/// Shared sum and error types, keyed by name and tag.
#[derive(Default)]
pub struct TypeRegistry {
    state: Mutex<TypeState>,
}

#[derive(Default)]
struct TypeState {
    variants: BTreeMap<String, VariantDecl>,
    errors: BTreeMap<String, ErrorDecl>,
}

impl TypeRegistry {
    /// Re-registering an identical declaration is a no-op; a conflicting
    /// shape under the same name fails.
    pub fn register_variant(&self, decl: VariantDecl) -> Result<()> {
        let Ok(mut state) = self.state.lock() else {
            bail!("type registry lock poisoned");
        };
        match state.variants.get(&decl.name) {
            None => {
                state.variants.insert(decl.name.clone(), decl);
                Ok(())
            }
            Some(existing) if *existing == decl => Ok(()),
            Some(_) => bail!(
                "variant type '{}' already registered with a different shape",
                decl.name
            ),
        }
    }

    pub fn register_error(&self, decl: ErrorDecl) -> Result<()> {
        let Ok(mut state) = self.state.lock() else {
            bail!("type registry lock poisoned");
        };
        match state.errors.get(&decl.type_tag) {
            None => {
                state.errors.insert(decl.type_tag.clone(), decl);
                Ok(())
            }
            Some(existing) if *existing == decl => Ok(()),
            Some(_) => bail!(
                "bridged error tag '{}' already registered with a different payload",
                decl.type_tag
            ),
        }
    }

    pub fn variant(&self, name: &str) -> Option<VariantDecl> {
        self.state.lock().ok()?.variants.get(name).cloned()
    }

    pub fn error(&self, type_tag: &str) -> Option<ErrorDecl> {
        self.state.lock().ok()?.errors.get(type_tag).cloned()
    }
}

static TYPES: OnceCell<TypeRegistry> = OnceCell::new();

/// Process-wide registry of shared types.
pub fn types() -> &'static TypeRegistry {
    TYPES.get_or_init(TypeRegistry::default)
}

/// A callable entry point. Takes an encoded argument frame, returns an
/// outcome envelope.
pub type EntryFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// One side's entry points, keyed module then symbol. The runtime module
/// is preloaded with the closure-invoke entry and cannot be claimed by a
/// manifest.
pub struct EntryTable {
    state: Mutex<BTreeMap<String, BTreeMap<String, EntryFn>>>,
}

impl EntryTable {
    pub fn new(side: Side) -> EntryTable {
        let mut rt = BTreeMap::new();
        rt.insert(
            CLOSURE_INVOKE_SYMBOL.to_string(),
            trampoline::closure_invoke_entry(side),
        );
        let mut modules = BTreeMap::new();
        modules.insert(RT_MODULE.to_string(), rt);
        EntryTable {
            state: Mutex::new(modules),
        }
    }

    /// Claims the manifest's module name and registers its types. Entries
    /// are registered separately, by whatever serves the declarations.
    pub fn load_module(&self, manifest: &ModuleManifest) -> Result<()> {
        manifest.validate()?;
        for variant in &manifest.variants {
            types().register_variant(variant.clone())?;
        }
        for error in &manifest.errors {
            types().register_error(error.clone())?;
        }
        let Ok(mut state) = self.state.lock() else {
            bail!("entry table lock poisoned");
        };
        if state.contains_key(&manifest.module) {
            bail!("module '{}' already loaded", manifest.module);
        }
        state.insert(manifest.module.clone(), BTreeMap::new());
        Ok(())
    }

    pub fn is_module_loaded(&self, module: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.contains_key(module))
            .unwrap_or(false)
    }

    pub fn register(&self, module: &str, symbol: &str, entry: EntryFn) -> Result<()> {
        let Ok(mut state) = self.state.lock() else {
            bail!("entry table lock poisoned");
        };
        let Some(symbols) = state.get_mut(module) else {
            bail!("module '{module}' is not loaded");
        };
        if symbols.contains_key(symbol) {
            bail!("entry symbol '{symbol}' already registered in module '{module}'");
        }
        symbols.insert(symbol.to_string(), entry);
        Ok(())
    }

    /// Looks up and invokes an entry. A module that was never loaded and a
    /// missing symbol inside a loaded one fail distinctly.
    pub fn call(&self, module: &str, symbol: &str, payload: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let entry = {
            let Ok(state) = self.state.lock() else {
                return Err(BridgeError::ProtocolViolation {
                    what: "entry table lock poisoned".to_string(),
                });
            };
            let Some(symbols) = state.get(module) else {
                return Err(BridgeError::LibraryNotLoaded {
                    module: module.to_string(),
                });
            };
            let Some(entry) = symbols.get(symbol) else {
                return Err(BridgeError::MissingSymbol {
                    symbol: symbol.to_string(),
                });
            };
            Arc::clone(entry)
        };
        // Invoked outside the lock; entries re-enter the table when they
        // call back across the boundary.
        Ok(entry(payload))
    }
}

static HOST_ENTRIES: OnceCell<EntryTable> = OnceCell::new();
static GUEST_ENTRIES: OnceCell<EntryTable> = OnceCell::new();

/// The entry table owned by `side`.
pub fn entries(side: Side) -> &'static EntryTable {
    match side {
        Side::Host => HOST_ENTRIES.get_or_init(|| EntryTable::new(Side::Host)),
        Side::Guest => GUEST_ENTRIES.get_or_init(|| EntryTable::new(Side::Guest)),
    }
}

fn ensure_loaded(side: Side, decl: &BridgedDecl) -> Result<()> {
    if decl.module == RT_MODULE {
        bail!("module name '{RT_MODULE}' is reserved for the bridge runtime");
    }
    if !entries(side).is_module_loaded(&decl.module) {
        bail!("module '{}' is not loaded on the serving side", decl.module);
    }
    Ok(())
}

/// Registers the serving glue for a synchronous declaration on `side`.
/// The implementation sees decoded values; decode or encode failures in
/// the glue surface to the caller as a fault outcome.
pub fn serve_sync<F>(side: Side, decl: &BridgedDecl, f: F) -> Result<()>
where
    F: Fn(&[BridgedValue]) -> Result<BridgedValue, BridgedError> + Send + Sync + 'static,
{
    if decl.is_async || decl.streaming {
        bail!("serve_sync requires a synchronous declaration");
    }
    ensure_loaded(side, decl)?;
    let params = decl.params.clone();
    let result_ty = decl.result.clone();
    let entry: EntryFn = Arc::new(move |payload: &[u8]| {
        match sync_entry(&params, &result_ty, &f, payload) {
            Ok(resp) => resp,
            Err(err) => wire::envelope_fault(&err.to_string()),
        }
    });
    entries(side).register(&decl.module, &mangle(decl), entry)
}

fn sync_entry<F>(
    params: &[Ty],
    result_ty: &Ty,
    f: &F,
    payload: &[u8],
) -> Result<Vec<u8>, BridgeError>
where
    F: Fn(&[BridgedValue]) -> Result<BridgedValue, BridgedError>,
{
    let args = wire::decode_args(payload, params)?;
    match f(&args) {
        Ok(value) => Ok(wire::envelope_ok(&wire::encode_value(&value, result_ty)?)),
        Err(thrown) => Ok(wire::envelope_throw(&wire::encode_error(&thrown)?)),
    }
}

/// Registers the serving glue for an async declaration on `side`. The
/// implementation receives its arguments and a completion it must resolve
/// exactly once, from any thread.
pub fn serve_async<F>(side: Side, decl: &BridgedDecl, f: F) -> Result<()>
where
    F: Fn(Vec<BridgedValue>, RemoteCompletion) + Send + Sync + 'static,
{
    if !decl.is_async || decl.streaming {
        bail!("serve_async requires an async, non-streaming declaration");
    }
    ensure_loaded(side, decl)?;
    let lowered = decl.lowered_async();
    let completion_params = decl.completion_params();
    let symbol = mangle(&lowered);
    let entry: EntryFn = Arc::new(move |payload: &[u8]| {
        match callback_entry(side, &lowered.params, &completion_params, payload) {
            Ok((args, closure)) => {
                f(args, RemoteCompletion::new(closure));
                wire::envelope_ok(&[])
            }
            Err(err) => wire::envelope_fault(&err.to_string()),
        }
    });
    entries(side).register(&decl.module, &symbol, entry)
}

/// Registers the serving glue for a streaming declaration on `side`. The
/// implementation receives a producer it must finish or fail; dropping it
/// unterminated fails the stream on the consumer side.
pub fn serve_streaming<F>(side: Side, decl: &BridgedDecl, f: F) -> Result<()>
where
    F: Fn(Vec<BridgedValue>, RemoteStream) + Send + Sync + 'static,
{
    if !decl.is_async || !decl.streaming {
        bail!("serve_streaming requires a streaming declaration");
    }
    ensure_loaded(side, decl)?;
    let lowered = decl.lowered_streaming();
    let event_params = decl.event_params();
    let symbol = mangle(&lowered);
    let entry: EntryFn = Arc::new(move |payload: &[u8]| {
        match callback_entry(side, &lowered.params, &event_params, payload) {
            Ok((args, closure)) => {
                f(args, RemoteStream::new(closure));
                wire::envelope_ok(&[])
            }
            Err(err) => wire::envelope_fault(&err.to_string()),
        }
    });
    entries(side).register(&decl.module, &symbol, entry)
}

/// Decodes a lowered call frame and adopts the trailing callback closure.
/// The closure was exported by the calling side, so it resolves against
/// the serving side's peer table.
fn callback_entry(
    side: Side,
    lowered_params: &[Ty],
    callback_params: &[Ty],
    payload: &[u8],
) -> Result<(Vec<BridgedValue>, ForeignClosure), BridgeError> {
    let mut args = wire::decode_args(payload, lowered_params)?;
    let Some(BridgedValue::Foreign { handle, .. }) = args.pop() else {
        return Err(BridgeError::ProtocolViolation {
            what: "lowered call frame missing its callback closure".to_string(),
        });
    };
    let closure = ForeignClosure::adopt(side.other(), handle, callback_params.to_vec(), Ty::Unit)?;
    Ok((args, closure))
}

/// Caller-side view of one side's entries.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    target: Side,
}

impl Dispatcher {
    pub fn new(target: Side) -> Dispatcher {
        Dispatcher { target }
    }

    /// Synchronous call into the target's entry for `decl`.
    pub fn call(&self, decl: &BridgedDecl, args: &[BridgedValue]) -> Result<BridgedValue, CallError> {
        if decl.is_async || decl.streaming {
            return Err(BridgeError::ProtocolViolation {
                what: format!("declaration '{}' is not synchronous", decl.qualified()),
            }
            .into());
        }
        let frame = wire::encode_args(args, &decl.params)?;
        let resp = entries(self.target).call(&decl.module, &mangle(decl), &frame)?;
        decode_call_outcome(&resp, &decl.result)
    }

    /// Starts an async call into the target. The returned handle resolves
    /// once the callee delivers its completion.
    pub fn call_async(&self, decl: &BridgedDecl, args: &[BridgedValue]) -> Result<AsyncCall, CallError> {
        if !decl.is_async || decl.streaming {
            return Err(BridgeError::ProtocolViolation {
                what: format!("declaration '{}' is not async", decl.qualified()),
            }
            .into());
        }
        let (call, completion) = AsyncCall::channel();
        let handle = trampoline::export_closure(
            self.target.other(),
            decl.completion_params(),
            Ty::Unit,
            move |args| completion.accept(args),
        );
        if let Err(err) = self.lowered_call(&decl.lowered_async(), args, handle) {
            // The callee never adopted the completion; take back our export.
            let _ = self.target.other().exports().release(handle);
            return Err(err);
        }
        Ok(call)
    }

    /// Starts a streaming call into the target. The returned stream yields
    /// elements until the producer finishes, fails, or is dropped.
    pub fn call_streaming(
        &self,
        decl: &BridgedDecl,
        args: &[BridgedValue],
    ) -> Result<ValueStream, CallError> {
        if !decl.is_async || !decl.streaming {
            return Err(BridgeError::ProtocolViolation {
                what: format!("declaration '{}' is not streaming", decl.qualified()),
            }
            .into());
        }
        let (stream, producer) = ValueStream::channel();
        let relay = StreamRelay::new(producer);
        let handle = trampoline::export_closure(
            self.target.other(),
            decl.event_params(),
            Ty::Unit,
            move |args| relay.accept(args),
        );
        if let Err(err) = self.lowered_call(&decl.lowered_streaming(), args, handle) {
            let _ = self.target.other().exports().release(handle);
            return Err(err);
        }
        Ok(stream)
    }

    fn lowered_call(
        &self,
        lowered: &BridgedDecl,
        args: &[BridgedValue],
        callback: crate::peer::PeerHandle,
    ) -> Result<(), CallError> {
        let mut full = args.to_vec();
        full.push(BridgedValue::Foreign {
            handle: callback,
            type_tag: CLOSURE_TYPE_TAG.to_string(),
        });
        let frame = wire::encode_args(&full, &lowered.params)?;
        let resp = entries(self.target).call(&lowered.module, &mangle(lowered), &frame)?;
        decode_call_outcome(&resp, &Ty::Unit)?;
        Ok(())
    }
}

pub(crate) fn decode_call_outcome(resp: &[u8], result: &Ty) -> Result<BridgedValue, CallError> {
    match wire::parse_outcome(resp)? {
        wire::Outcome::Return(payload) => Ok(wire::decode_value(payload, result)?),
        wire::Outcome::Throw(payload) => Err(CallError::Thrown(wire::decode_error(payload)?)),
        wire::Outcome::Fault(message) => Err(BridgeError::Remote { message }.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(module: &str, owner: &str, member: &str, params: Vec<Ty>, result: Ty) -> BridgedDecl {
        BridgedDecl {
            module: module.to_string(),
            owner: owner.to_string(),
            member: member.to_string(),
            params,
            result,
            throws: false,
            is_async: false,
            streaming: false,
        }
    }

    #[test]
    fn mangle_pins_the_documented_example() {
        let d = decl(
            "geo",
            "Point",
            "translate",
            vec![Ty::F64, Ty::F64],
            Ty::F64,
        );
        assert_eq!(mangle(&d), "pons_m3_geo_t5_Point_f9_translate_s_f8_f8__f8");
    }

    #[test]
    fn mangle_covers_every_type_code() {
        let d = decl(
            "a",
            "",
            "g",
            vec![
                Ty::Bool,
                Ty::U16,
                Ty::Str,
                Ty::Blob,
                Ty::Uuid,
                Ty::Optional(Box::new(Ty::I64)),
                Ty::Array(Box::new(Ty::F32)),
                Ty::Set(Box::new(Ty::U8)),
                Ty::Map(Box::new(Ty::Str), Box::new(Ty::I64)),
                Ty::Tuple(vec![Ty::I8, Ty::Uri]),
                Ty::Variant("Hue".to_string()),
                Ty::Foreign("Grid".to_string()),
                Ty::Closure {
                    params: vec![Ty::Str],
                    ret: Box::new(Ty::Bool),
                },
                Ty::Locale,
                Ty::Instant,
            ],
            Ty::Unit,
        );
        assert_eq!(
            mangle(&d),
            "pons_m1_a_t0__f1_g_s_b_u2_str_k_uid_oi8_af4_hu1_dstri8_p2i1uri_e3_Hue_x4_Grid_c1strb_loc_ts__v"
        );
    }

    #[test]
    fn mangle_distinguishes_overloads_and_owners() {
        let by_arity = [
            mangle(&decl("m", "", "f", vec![Ty::I32], Ty::Unit)),
            mangle(&decl("m", "", "f", vec![Ty::I32, Ty::I32], Ty::Unit)),
            mangle(&decl("m", "", "f", vec![Ty::I64], Ty::Unit)),
            mangle(&decl("m", "T", "f", vec![Ty::I32], Ty::Unit)),
        ];
        for (i, a) in by_arity.iter().enumerate() {
            for b in &by_arity[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn lowered_shapes_append_the_callback_parameter() {
        let mut d = decl("clock", "", "after", vec![Ty::I64], Ty::I64);
        d.is_async = true;
        let lowered = d.lowered_async();
        assert_eq!(lowered.params.len(), 2);
        assert_eq!(lowered.result, Ty::Unit);
        assert!(!lowered.is_async);
        let Ty::Closure { ref params, ref ret } = lowered.params[1] else {
            panic!("expected a closure parameter, got {:?}", lowered.params[1]);
        };
        assert_eq!(
            params.as_slice(),
            &[
                Ty::Optional(Box::new(Ty::I64)),
                Ty::Optional(Box::new(Ty::Blob)),
            ]
        );
        assert_eq!(**ret, Ty::Unit);

        d.streaming = true;
        let lowered = d.lowered_streaming();
        let Ty::Closure { ref params, .. } = lowered.params[1] else {
            panic!("expected a closure parameter, got {:?}", lowered.params[1]);
        };
        assert_eq!(params.len(), 3);
        assert_eq!(params[1], Ty::Bool);
        assert_ne!(mangle(&d.lowered_async()), mangle(&d.lowered_streaming()));
    }

    #[test]
    fn parse_rejects_schema_and_abi_drift() {
        let good = r#"{
            "schema_version": "pons.module@0.1.0",
            "abi_major": 1,
            "module": "geo",
            "decls": [
                {"owner": "Point", "member": "translate", "params": ["f64", "f64"], "result": "f64"}
            ]
        }"#;
        let manifest = parse_module_manifest(good).unwrap();
        assert_eq!(manifest.decls[0].module, "geo");

        let stale = good.replace("pons.module@0.1.0", "pons.module@0.0.1");
        assert!(parse_module_manifest(&stale)
            .unwrap_err()
            .to_string()
            .contains("schema_version"));

        let wrong_abi = good.replace("\"abi_major\": 1", "\"abi_major\": 7");
        assert!(parse_module_manifest(&wrong_abi)
            .unwrap_err()
            .to_string()
            .contains("abi_major"));
    }

    #[test]
    fn validation_rejects_misplaced_unit_and_flag_misuse() {
        let mut manifest = ModuleManifest {
            schema_version: MODULE_MANIFEST_SCHEMA_VERSION.to_string(),
            abi_major: PONS_ABI_MAJOR,
            module: "pons.rt".to_string(),
            decls: vec![],
            variants: vec![],
            errors: vec![],
        };
        assert!(manifest.validate().is_err());

        manifest.module = "nav".to_string();
        manifest.decls = vec![decl("nav", "", "park", vec![Ty::Unit], Ty::Unit)];
        assert!(manifest.validate().is_err());

        let mut streaming = decl("nav", "", "scan", vec![], Ty::I32);
        streaming.streaming = true;
        manifest.decls = vec![streaming];
        assert!(manifest.validate().is_err());

        let dup = decl("nav", "", "go", vec![Ty::I32], Ty::Unit);
        manifest.decls = vec![dup.clone(), dup];
        assert!(manifest
            .validate()
            .unwrap_err()
            .to_string()
            .contains("duplicate entry symbol"));
    }

    #[test]
    fn reserved_error_tags_are_rejected() {
        let decl = ErrorDecl {
            type_tag: "pons.fault".to_string(),
            payload: Ty::Str,
        };
        assert!(decl.validate().unwrap_err().to_string().contains("reserved"));
    }

    #[test]
    fn entry_table_reports_missing_pieces_distinctly() {
        let table = EntryTable::new(Side::Guest);
        let manifest = ModuleManifest {
            schema_version: MODULE_MANIFEST_SCHEMA_VERSION.to_string(),
            abi_major: PONS_ABI_MAJOR,
            module: "nav".to_string(),
            decls: vec![],
            variants: vec![],
            errors: vec![],
        };
        table.load_module(&manifest).unwrap();
        assert!(table.is_module_loaded("nav"));
        assert!(table.load_module(&manifest).is_err());

        let err = table.call("astro", "pons_x", &[]).unwrap_err();
        assert!(matches!(err, BridgeError::LibraryNotLoaded { .. }));
        let err = table.call("nav", "pons_x", &[]).unwrap_err();
        assert!(matches!(err, BridgeError::MissingSymbol { .. }));
    }
}
