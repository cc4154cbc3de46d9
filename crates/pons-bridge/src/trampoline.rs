//! Closure trampolines.
//!
//! A callable never crosses the boundary as code. The home side pins it in
//! its peer table like any object; the other side holds the handle and
//! invokes through the home side's closure-invoke entry. Invocations
//! therefore always run on the side that created the closure, with its
//! captures intact.

use std::sync::Arc;

use pons_contracts::{CLOSURE_INVOKE_SYMBOL, RT_MODULE};

use crate::decl::{decode_call_outcome, entries, EntryFn};
use crate::error::{BridgeError, BridgedError, CallError};
use crate::peer::{PeerHandle, Side};
use crate::value::{BridgedValue, Ty};
use crate::wire;

/// A callable pinned on its home side, invoked through the trampoline.
pub(crate) struct LocalClosure {
    pub(crate) params: Vec<Ty>,
    pub(crate) ret: Ty,
    pub(crate) body:
        Box<dyn Fn(&[BridgedValue]) -> Result<BridgedValue, BridgedError> + Send + Sync>,
}

/// Pins a callable in `owner`'s table and returns its handle, carrying one
/// reference. The caller either hands that reference across the boundary
/// or releases it.
pub fn export_closure<F>(owner: Side, params: Vec<Ty>, ret: Ty, f: F) -> PeerHandle
where
    F: Fn(&[BridgedValue]) -> Result<BridgedValue, BridgedError> + Send + Sync + 'static,
{
    owner.exports().export(Arc::new(LocalClosure {
        params,
        ret,
        body: Box::new(f),
    }))
}

/// A callable owned by the other side. Holds one reference on the owner's
/// table; cloning retains another, dropping releases.
#[derive(Debug)]
pub struct ForeignClosure {
    owner: Side,
    handle: PeerHandle,
    params: Vec<Ty>,
    ret: Ty,
}

impl ForeignClosure {
    /// Takes ownership of a handle received across the boundary. The
    /// transfer already carries the sender's reference, so adoption
    /// retains nothing; it only rejects handles that are no longer live.
    pub fn adopt(
        owner: Side,
        handle: PeerHandle,
        params: Vec<Ty>,
        ret: Ty,
    ) -> Result<ForeignClosure, BridgeError> {
        if owner.exports().retain_count(handle).is_none() {
            return Err(BridgeError::ProtocolViolation {
                what: format!("adopt of dead closure handle {:#x}", handle.raw()),
            });
        }
        Ok(ForeignClosure {
            owner,
            handle,
            params,
            ret,
        })
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    /// Invokes the closure on its home side. The handle crosses as a
    /// borrow; this reference keeps it pinned for the duration.
    pub fn invoke(&self, args: &[BridgedValue]) -> Result<BridgedValue, CallError> {
        if args.len() != self.params.len() {
            return Err(BridgeError::EncodingMismatch {
                expected: format!("{} closure arguments", self.params.len()),
                found: format!("{} closure arguments", args.len()),
            }
            .into());
        }
        let payload = wire::encode_closure_invoke(self.handle, args, &self.params)?;
        let resp = entries(self.owner).call(RT_MODULE, CLOSURE_INVOKE_SYMBOL, &payload)?;
        decode_call_outcome(&resp, &self.ret)
    }
}

impl Clone for ForeignClosure {
    fn clone(&self) -> ForeignClosure {
        self.owner.exports().retain(self.handle);
        ForeignClosure {
            owner: self.owner,
            handle: self.handle,
            params: self.params.clone(),
            ret: self.ret.clone(),
        }
    }
}

impl Drop for ForeignClosure {
    fn drop(&mut self) {
        let _ = self.owner.exports().release(self.handle);
    }
}

/// The closure-invoke entry preloaded into `side`'s table. The payload
/// names a closure in that same table. Glue failures come back as fault
/// outcomes instead of unwinding into the calling runtime.
pub(crate) fn closure_invoke_entry(side: Side) -> EntryFn {
    Arc::new(move |payload: &[u8]| match invoke_local(side, payload) {
        Ok(resp) => resp,
        Err(err) => wire::envelope_fault(&err.to_string()),
    })
}

fn invoke_local(side: Side, payload: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let (handle, frame) = wire::split_closure_invoke(payload)?;
    if handle.is_nil() {
        return Err(BridgeError::ProtocolViolation {
            what: "closure invoke payload names the nil handle".to_string(),
        });
    }
    let object = side.exports().resolve(handle)?;
    let Ok(closure) = object.downcast::<LocalClosure>() else {
        return Err(BridgeError::EncodingMismatch {
            expected: "closure handle".to_string(),
            found: "non-callable object".to_string(),
        });
    };
    let args = wire::decode_args(frame, &closure.params)?;
    match (closure.body)(&args) {
        Ok(value) => Ok(wire::envelope_ok(&wire::encode_value(&value, &closure.ret)?)),
        Err(thrown) => Ok(wire::envelope_throw(&wire::encode_error(&thrown)?)),
    }
}
