use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bridge_core::CallFailure;
use bridge_schema::MethodDescriptor;

/// One event produced by a backend call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    Data(Bytes),
    Completed,
    Failed(CallFailure),
}

impl BackendEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data(_))
    }
}

/// Create the two ends of a call: the handle given to the multiplexer and
/// the context given to the backend.
pub fn call_channel(
    descriptor: Arc<MethodDescriptor>,
    initial: Option<Bytes>,
    buffer: usize,
) -> (CallHandle, CallContext) {
    let (event_tx, event_rx) = mpsc::channel(buffer.max(1));
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let cancelled = CancellationToken::new();

    // Input is closed from the start unless the client is allowed to stream.
    let input_tx = descriptor.cardinality.client_streams().then_some(input_tx);

    let handle = CallHandle {
        control: CallControl {
            input: Mutex::new(input_tx),
            cancelled: cancelled.clone(),
        },
        events: CallEvents {
            rx: event_rx,
            done: false,
        },
    };
    let ctx = CallContext {
        descriptor,
        initial,
        input: input_rx,
        sink: EventSink {
            tx: event_tx,
            cancelled: cancelled.clone(),
        },
        cancelled,
    };
    (handle, ctx)
}

/// Multiplexer-side view of a running call.
pub struct CallHandle {
    pub control: CallControl,
    pub events: CallEvents,
}

impl CallHandle {
    pub fn into_parts(self) -> (CallControl, CallEvents) {
        (self.control, self.events)
    }
}

/// Forwards client input and cancellation into a running call.
pub struct CallControl {
    input: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    cancelled: CancellationToken,
}

impl CallControl {
    /// Forward one client message. Returns false if input is closed.
    pub fn send(&self, payload: Bytes) -> bool {
        match self.input.lock().as_ref() {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Close the client → backend direction. Idempotent.
    pub fn end_input(&self) {
        self.input.lock().take();
    }

    pub fn input_open(&self) -> bool {
        self.input.lock().is_some()
    }

    /// Request cooperative cancellation. Idempotent, and a no-op once the
    /// call has finished.
    pub fn cancel(&self) {
        // Token first so observers never mistake the cancel for end of input.
        self.cancelled.cancel();
        self.end_input();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Token that fires when the call is cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancelled.clone()
    }
}

/// Lazy sequence of backend events: zero or more `Data`, then exactly one
/// terminal event, then nothing.
pub struct CallEvents {
    rx: mpsc::Receiver<BackendEvent>,
    done: bool,
}

impl Stream for CallEvents {
    type Item = BackendEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<BackendEvent>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.done = true;
                    self.rx.close();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(BackendEvent::Failed(CallFailure::dropped())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Returned when the consumer of a call has gone away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("call is no longer being consumed")]
pub struct SinkClosed;

/// Backend-side producer of call events.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<BackendEvent>,
    cancelled: CancellationToken,
}

impl EventSink {
    /// Emit one data chunk, waiting for buffer space. Fails once the call
    /// is cancelled or its consumer is gone.
    pub async fn send(&self, payload: Bytes) -> Result<(), SinkClosed> {
        tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => Err(SinkClosed),
            sent = self.tx.send(BackendEvent::Data(payload)) => sent.map_err(|_| SinkClosed),
        }
    }

    pub async fn complete(self) {
        self.finish(BackendEvent::Completed).await;
    }

    pub async fn fail(self, failure: CallFailure) {
        self.finish(BackendEvent::Failed(failure)).await;
    }

    async fn finish(self, event: BackendEvent) {
        tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => {}
            _ = self.tx.send(event) => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancelled.is_cancelled()
    }
}

/// Everything a backend needs to serve one call.
pub struct CallContext {
    pub descriptor: Arc<MethodDescriptor>,
    pub initial: Option<Bytes>,
    /// Client messages after the initial payload; ends on `CallEnd`.
    pub input: mpsc::UnboundedReceiver<Bytes>,
    pub sink: EventSink,
    pub cancelled: CancellationToken,
}

impl CallContext {
    /// Next client message, or `None` once input ended or the call was
    /// cancelled.
    pub async fn next_input(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => None,
            msg = self.input.recv() => msg,
        }
    }
}
