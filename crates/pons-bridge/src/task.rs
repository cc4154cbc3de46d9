//! Async call plumbing: completions, streams, and the bridge runtime.
//!
//! An async or streaming call never blocks the boundary. The caller sends
//! a callback closure along with the arguments and gets a waitable handle
//! back; the callee resolves the callback from whatever thread finishes
//! the work. Waiters are always unblocked: a dropped completion or an
//! abandoned stream producer surfaces as an error, not a hang.

use std::future::Future;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BridgeError, BridgedError, CallError};
use crate::trampoline::ForeignClosure;
use crate::value::BridgedValue;
use crate::wire;

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Single-threaded runtime driving the async plumbing. Spawned tasks make
/// progress while any thread is blocked on it.
pub fn bridge_runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("build bridge runtime")
    })
}

/// Caller-side handle for one in-flight async call.
#[derive(Debug)]
pub struct AsyncCall {
    rx: oneshot::Receiver<Result<BridgedValue, BridgedError>>,
}

impl AsyncCall {
    /// A call paired with the completion that will resolve it.
    pub fn channel() -> (AsyncCall, Completion) {
        let (tx, rx) = oneshot::channel();
        (
            AsyncCall { rx },
            Completion {
                tx: Mutex::new(Some(tx)),
            },
        )
    }

    /// Runs a future on the bridge runtime, exposing its output as a call.
    pub fn spawn<F>(future: F) -> AsyncCall
    where
        F: Future<Output = Result<BridgedValue, BridgedError>> + Send + 'static,
    {
        let (call, completion) = AsyncCall::channel();
        bridge_runtime().spawn(async move {
            completion.complete(future.await);
        });
        call
    }

    /// Resolves when the callee delivers its completion. A completion
    /// dropped without delivery surfaces as an error rather than a hang.
    pub async fn wait(self) -> Result<BridgedValue, CallError> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(thrown)) => Err(CallError::Thrown(thrown)),
            Err(_) => Err(BridgeError::CompletionDropped.into()),
        }
    }

    pub fn wait_blocking(self) -> Result<BridgedValue, CallError> {
        bridge_runtime().block_on(self.wait())
    }
}

/// Resolver for one async call. The first delivery wins.
pub struct Completion {
    tx: Mutex<Option<oneshot::Sender<Result<BridgedValue, BridgedError>>>>,
}

impl Completion {
    /// Delivers the outcome; false when it was already delivered.
    pub fn complete(&self, outcome: Result<BridgedValue, BridgedError>) -> bool {
        let sender = match self.tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Body of the exported completion closure. Whatever arrives, the
    /// waiter is unblocked; malformed frames deliver a described error.
    pub(crate) fn accept(&self, args: &[BridgedValue]) -> Result<BridgedValue, BridgedError> {
        let outcome = parse_completion_args(args);
        if self.complete(outcome) {
            Ok(BridgedValue::unit())
        } else {
            Err(BridgedError::Message(
                "async completion already delivered".to_string(),
            ))
        }
    }
}

fn parse_completion_args(args: &[BridgedValue]) -> Result<BridgedValue, BridgedError> {
    match args {
        [BridgedValue::Optional(Some(value)), BridgedValue::Optional(None)] => {
            Ok((**value).clone())
        }
        [BridgedValue::Optional(None), BridgedValue::Optional(Some(err))] => {
            Err(decode_error_arg(err))
        }
        _ => Err(BridgedError::Message(
            "malformed completion arguments".to_string(),
        )),
    }
}

fn decode_error_arg(err: &BridgedValue) -> BridgedError {
    let BridgedValue::Blob(bytes) = err else {
        return BridgedError::Message("malformed callback error payload".to_string());
    };
    wire::decode_error(bytes)
        .unwrap_or_else(|e| BridgedError::Message(format!("undecodable callback error: {e}")))
}

/// One streaming element or terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Value(BridgedValue),
    Finished,
    Failed(BridgedError),
}

impl StreamEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finished | StreamEvent::Failed(_))
    }
}

/// Caller-side consumer of one streaming call.
pub struct ValueStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    terminated: bool,
}

impl ValueStream {
    /// A stream paired with the producer that feeds it.
    pub fn channel() -> (ValueStream, StreamProducer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ValueStream {
                rx,
                terminated: false,
            },
            StreamProducer {
                tx,
                terminated: false,
            },
        )
    }

    /// Next event, `None` once a terminal event has been delivered. A
    /// producer that vanished without terminating yields a failure first.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.terminated {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.terminated = true;
                }
                Some(event)
            }
            None => {
                self.terminated = true;
                Some(StreamEvent::Failed(BridgedError::Message(
                    "stream channel closed before completion".to_string(),
                )))
            }
        }
    }

    pub fn blocking_next(&mut self) -> Option<StreamEvent> {
        bridge_runtime().block_on(self.next())
    }
}

/// Local feeder of a `ValueStream`. Must be finished or failed; dropping
/// it unterminated fails the stream so the consumer never hangs.
pub struct StreamProducer {
    tx: mpsc::UnboundedSender<StreamEvent>,
    terminated: bool,
}

impl StreamProducer {
    /// Sends one element; false once the consumer is gone.
    pub fn yield_value(&self, value: BridgedValue) -> bool {
        self.tx.send(StreamEvent::Value(value)).is_ok()
    }

    pub fn finish(mut self) {
        self.terminated = true;
        let _ = self.tx.send(StreamEvent::Finished);
    }

    pub fn fail(mut self, err: BridgedError) {
        self.terminated = true;
        let _ = self.tx.send(StreamEvent::Failed(err));
    }
}

impl Drop for StreamProducer {
    fn drop(&mut self) {
        if !self.terminated {
            let _ = self.tx.send(StreamEvent::Failed(BridgedError::Message(
                "stream dropped before completion".to_string(),
            )));
        }
    }
}

/// Body shared by exported event closures: translates event triples into
/// producer actions. Terminal events consume the producer; later events
/// error back to the far side.
pub(crate) struct StreamRelay {
    slot: Mutex<Option<StreamProducer>>,
}

impl StreamRelay {
    pub(crate) fn new(producer: StreamProducer) -> StreamRelay {
        StreamRelay {
            slot: Mutex::new(Some(producer)),
        }
    }

    pub(crate) fn accept(&self, args: &[BridgedValue]) -> Result<BridgedValue, BridgedError> {
        let Ok(mut slot) = self.slot.lock() else {
            return Err(BridgedError::Message(
                "stream relay lock poisoned".to_string(),
            ));
        };
        let Some(producer) = slot.take() else {
            return Err(BridgedError::Message(
                "stream already terminated".to_string(),
            ));
        };
        match args {
            [BridgedValue::Optional(Some(value)), BridgedValue::Bool(false), BridgedValue::Optional(None)] =>
            {
                let delivered = producer.yield_value((**value).clone());
                *slot = Some(producer);
                if delivered {
                    Ok(BridgedValue::unit())
                } else {
                    Err(BridgedError::Message("stream consumer is gone".to_string()))
                }
            }
            [BridgedValue::Optional(None), BridgedValue::Bool(true), BridgedValue::Optional(None)] =>
            {
                producer.finish();
                Ok(BridgedValue::unit())
            }
            [BridgedValue::Optional(None), BridgedValue::Bool(false), BridgedValue::Optional(Some(err))] =>
            {
                producer.fail(decode_error_arg(err));
                Ok(BridgedValue::unit())
            }
            _ => {
                producer.fail(BridgedError::Message(
                    "malformed stream event arguments".to_string(),
                ));
                Err(BridgedError::Message(
                    "malformed stream event arguments".to_string(),
                ))
            }
        }
    }
}

/// Callee-side resolver for one async call. Consuming it invokes the
/// caller's completion closure and releases the adopted reference.
pub struct RemoteCompletion {
    closure: ForeignClosure,
}

impl RemoteCompletion {
    pub(crate) fn new(closure: ForeignClosure) -> RemoteCompletion {
        RemoteCompletion { closure }
    }

    pub fn complete(self, outcome: Result<BridgedValue, BridgedError>) -> Result<(), CallError> {
        let args = match outcome {
            Ok(value) => vec![
                BridgedValue::Optional(Some(Box::new(value))),
                BridgedValue::Optional(None),
            ],
            Err(thrown) => vec![
                BridgedValue::Optional(None),
                BridgedValue::Optional(Some(Box::new(BridgedValue::Blob(wire::encode_error(
                    &thrown,
                )?)))),
            ],
        };
        self.closure.invoke(&args)?;
        Ok(())
    }
}

/// Callee-side producer for one streaming call. Events cross through the
/// caller's event closure; dropping this without finishing fails the
/// stream on the caller side.
pub struct RemoteStream {
    closure: ForeignClosure,
}

impl RemoteStream {
    pub(crate) fn new(closure: ForeignClosure) -> RemoteStream {
        RemoteStream { closure }
    }

    /// Sends one element. A false return means the consumer is gone and
    /// producing more is pointless.
    pub fn yield_value(&self, value: BridgedValue) -> bool {
        self.closure
            .invoke(&[
                BridgedValue::Optional(Some(Box::new(value))),
                BridgedValue::Bool(false),
                BridgedValue::Optional(None),
            ])
            .is_ok()
    }

    pub fn finish(self) -> Result<(), CallError> {
        self.closure.invoke(&[
            BridgedValue::Optional(None),
            BridgedValue::Bool(true),
            BridgedValue::Optional(None),
        ])?;
        Ok(())
    }

    pub fn fail(self, err: BridgedError) -> Result<(), CallError> {
        let blob = BridgedValue::Blob(wire::encode_error(&err)?);
        self.closure.invoke(&[
            BridgedValue::Optional(None),
            BridgedValue::Bool(false),
            BridgedValue::Optional(Some(Box::new(blob))),
        ])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_async_call_completes_once() {
        let call = AsyncCall::spawn(async { Ok(BridgedValue::I32(7)) });
        assert_eq!(call.wait_blocking().unwrap(), BridgedValue::I32(7));
    }

    #[test]
    fn dropped_completion_is_reported() {
        let (call, completion) = AsyncCall::channel();
        drop(completion);
        let err = call.wait_blocking().unwrap_err();
        assert!(matches!(
            err,
            CallError::Bridge(BridgeError::CompletionDropped)
        ));
    }

    #[test]
    fn completion_delivers_exactly_once() {
        let (call, completion) = AsyncCall::channel();
        assert!(completion.complete(Ok(BridgedValue::Bool(true))));
        assert!(!completion.complete(Ok(BridgedValue::Bool(false))));
        assert_eq!(call.wait_blocking().unwrap(), BridgedValue::Bool(true));
    }

    #[test]
    fn malformed_completion_frames_still_unblock_the_waiter() {
        let (call, completion) = AsyncCall::channel();
        completion.accept(&[BridgedValue::Bool(true)]).unwrap();
        let err = call.wait_blocking().unwrap_err();
        assert!(matches!(err, CallError::Thrown(BridgedError::Message(_))));
        assert!(completion.accept(&[]).is_err());
    }

    #[test]
    fn producer_drop_terminates_stream_loudly() {
        let (mut stream, producer) = ValueStream::channel();
        assert!(producer.yield_value(BridgedValue::I64(1)));
        drop(producer);
        assert_eq!(
            stream.blocking_next(),
            Some(StreamEvent::Value(BridgedValue::I64(1)))
        );
        let Some(StreamEvent::Failed(BridgedError::Message(msg))) = stream.blocking_next() else {
            panic!("expected a failure event");
        };
        assert!(msg.contains("dropped before completion"));
        assert_eq!(stream.blocking_next(), None);
    }

    #[test]
    fn finish_is_exactly_once_and_clean() {
        let (mut stream, producer) = ValueStream::channel();
        assert!(producer.yield_value(BridgedValue::Str("a".to_string())));
        producer.finish();
        assert_eq!(
            stream.blocking_next(),
            Some(StreamEvent::Value(BridgedValue::Str("a".to_string())))
        );
        assert_eq!(stream.blocking_next(), Some(StreamEvent::Finished));
        assert_eq!(stream.blocking_next(), None);
        assert_eq!(stream.blocking_next(), None);
    }
}
