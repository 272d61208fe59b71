//! Per-session call table.
//!
//! Inbound envelopes are applied one at a time by the session. Each open
//! call gets a pump task that drains its backend events into the session's
//! outbound queue. A pump reserves queue space first, then takes the call's
//! status lock, checks the call is still live and enqueues. Cancellation
//! flips the status under the same lock, so once `ResultStatus{Cancelled}`
//! is queued nothing else for that id can follow it.
//!
//! Statuses the bridge originates itself never wait for queue space on the
//! inbound path. When the queue is full they are handed to a background
//! send, and a cancelled call keeps its id reserved until its status is
//! queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, Instrument};

use bridge_backend::{BackendEvent, CallControl, CallEvents, Dispatcher};
use bridge_core::{CallId, Envelope, StatusCode};
use bridge_schema::{MethodDescriptor, Registry};

use crate::metrics::BridgeMetrics;

/// Lifecycle of one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStatus {
    /// Backend invoked, nothing produced yet.
    Pending,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

/// A client envelope that cannot be applied. The envelope is discarded and
/// the session carries on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("call {0} is already open")]
    DuplicateCall(CallId),
    #[error("no open call {0}")]
    UnknownCall(CallId),
    #[error("input of call {0} is closed")]
    InputClosed(CallId),
    #[error("{kind} for call {id} may only be sent by the bridge")]
    ServerEnvelope { kind: &'static str, id: CallId },
    #[error("text message after handshake")]
    TextAfterHandshake,
}

impl ProtocolViolation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateCall(_) => "duplicate_call",
            Self::UnknownCall(_) => "unknown_call",
            Self::InputClosed(_) => "input_closed",
            Self::ServerEnvelope { .. } => "server_envelope",
            Self::TextAfterHandshake => "text_after_handshake",
        }
    }
}

struct CallSlot {
    id: CallId,
    descriptor: Arc<MethodDescriptor>,
    control: CallControl,
    status: Mutex<CallStatus>,
    /// Terminal status still waiting for queue space.
    status_pending: AtomicBool,
    opened_at: Instant,
}

impl CallSlot {
    fn status(&self) -> CallStatus {
        *self.status.lock()
    }

    /// Move to a terminal status. False if the call already finished.
    fn finish_as(&self, to: CallStatus) -> bool {
        let mut status = self.status.lock();
        if status.is_terminal() {
            return false;
        }
        *status = to;
        true
    }

    /// Live, or finished with its status not yet queued.
    fn holds_id(&self) -> bool {
        !self.status().is_terminal() || self.status_pending.load(Ordering::Acquire)
    }
}

struct Shared {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    calls: DashMap<CallId, Arc<CallSlot>>,
    outbound: mpsc::Sender<Envelope>,
    metrics: BridgeMetrics,
}

impl Shared {
    /// Drop `slot` from the table unless its id was already reused.
    fn retire(&self, slot: &Arc<CallSlot>, code: StatusCode) {
        self.calls.remove_if(&slot.id, |_, live| Arc::ptr_eq(live, slot));
        slot.control.end_input();
        self.metrics.call_finished(code, Some(slot.opened_at.elapsed()));
    }
}

/// Routes client envelopes to backend calls and backend events to the
/// session's outbound queue.
pub struct CallMultiplexer {
    shared: Arc<Shared>,
}

impl CallMultiplexer {
    pub fn new(
        registry: Arc<Registry>,
        dispatcher: Dispatcher,
        outbound: mpsc::Sender<Envelope>,
        metrics: BridgeMetrics,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                dispatcher,
                calls: DashMap::new(),
                outbound,
                metrics,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Apply one client envelope. Never waits on the outbound queue.
    pub fn handle(&self, envelope: Envelope) -> Result<(), ProtocolViolation> {
        match envelope {
            Envelope::CallOpen {
                id,
                service,
                method,
                payload,
            } => self.open(id, &service, &method, payload),
            Envelope::CallData { id, payload } => {
                let slot = self.live(id)?;
                if slot.control.send(payload) {
                    Ok(())
                } else {
                    Err(ProtocolViolation::InputClosed(id))
                }
            }
            Envelope::CallEnd { id } => {
                self.live(id)?.control.end_input();
                Ok(())
            }
            Envelope::CallCancel { id } => self.cancel(id),
            other => Err(ProtocolViolation::ServerEnvelope {
                kind: other.kind(),
                id: other.call_id(),
            }),
        }
    }

    fn open(
        &self,
        id: CallId,
        service: &str,
        method: &str,
        payload: Option<Bytes>,
    ) -> Result<(), ProtocolViolation> {
        if self
            .shared
            .calls
            .get(&id)
            .is_some_and(|slot| slot.holds_id())
        {
            return Err(ProtocolViolation::DuplicateCall(id));
        }
        let Some(descriptor) = self.shared.registry.lookup(service, method) else {
            debug!(call_id = id.get(), service, method, "method not found");
            self.shared.metrics.call_finished(StatusCode::MethodNotFound, None);
            self.emit(Envelope::method_not_found(id, service, method), None);
            return Ok(());
        };

        let route = descriptor.route();
        let (control, events) = self
            .shared
            .dispatcher
            .invoke(descriptor.clone(), payload)
            .into_parts();
        let slot = Arc::new(CallSlot {
            id,
            descriptor,
            control,
            status: Mutex::new(CallStatus::Pending),
            status_pending: AtomicBool::new(false),
            opened_at: Instant::now(),
        });
        let _ = self.shared.calls.insert(id, slot.clone());
        self.shared.metrics.call_opened(&route);
        debug!(
            call_id = id.get(),
            method = %route,
            cardinality = slot.descriptor.cardinality.as_str(),
            "call opened"
        );

        let span = tracing::debug_span!("call", call_id = id.get(), method = %route);
        let _ = tokio::spawn(pump(self.shared.clone(), slot, events).instrument(span));
        Ok(())
    }

    fn cancel(&self, id: CallId) -> Result<(), ProtocolViolation> {
        let slot = self.live(id)?;
        // Lost the race with the backend's own terminal event.
        if !slot.finish_as(CallStatus::Cancelled) {
            return Err(ProtocolViolation::UnknownCall(id));
        }
        slot.control.cancel();
        debug!(call_id = id.get(), "call cancelled by client");
        self.emit(Envelope::cancelled(id), Some((slot, StatusCode::Cancelled)));
        Ok(())
    }

    /// Cancel every live call without reporting to the client.
    pub fn shutdown(&self) {
        let slots: Vec<Arc<CallSlot>> = self
            .shared
            .calls
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for slot in slots {
            if slot.finish_as(CallStatus::Cancelled) {
                slot.control.cancel();
                self.shared.retire(&slot, StatusCode::Cancelled);
            }
        }
        self.shared.calls.clear();
        self.shared.dispatcher.close();
    }

    pub fn live_calls(&self) -> usize {
        self.shared.calls.len()
    }

    pub fn call_status(&self, id: CallId) -> Option<CallStatus> {
        self.shared.calls.get(&id).map(|slot| slot.status())
    }

    fn live(&self, id: CallId) -> Result<Arc<CallSlot>, ProtocolViolation> {
        let slot = self
            .shared
            .calls
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(ProtocolViolation::UnknownCall(id))?;
        if slot.status().is_terminal() {
            return Err(ProtocolViolation::UnknownCall(id));
        }
        Ok(slot)
    }

    /// Queue a bridge-originated status, then retire `finished` if given.
    fn emit(&self, envelope: Envelope, finished: Option<(Arc<CallSlot>, StatusCode)>) {
        let envelope = match self.shared.outbound.try_send(envelope) {
            // A closed queue means the session is going away.
            Ok(()) | Err(TrySendError::Closed(_)) => {
                if let Some((slot, code)) = finished {
                    self.shared.retire(&slot, code);
                }
                return;
            }
            Err(TrySendError::Full(envelope)) => envelope,
        };
        if let Some((slot, _)) = &finished {
            slot.status_pending.store(true, Ordering::Release);
        }
        let shared = self.shared.clone();
        let _ = tokio::spawn(async move {
            let _ = shared.outbound.send(envelope).await;
            if let Some((slot, code)) = finished {
                slot.status_pending.store(false, Ordering::Release);
                shared.retire(&slot, code);
            }
        });
    }
}

impl Drop for CallMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Move one call's backend events into the outbound queue.
async fn pump(shared: Arc<Shared>, slot: Arc<CallSlot>, mut events: CallEvents) {
    let cancelled = slot.control.cancellation();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancelled.cancelled() => return,
            event = events.next() => match event {
                Some(event) => event,
                None => return,
            },
        };
        let permit = tokio::select! {
            biased;
            _ = cancelled.cancelled() => return,
            permit = shared.outbound.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    // Session queue closed; nobody is left to report to.
                    if slot.finish_as(CallStatus::Cancelled) {
                        slot.control.cancel();
                        shared.retire(&slot, StatusCode::Cancelled);
                    }
                    return;
                }
            },
        };

        let finished = {
            let mut status = slot.status.lock();
            if status.is_terminal() {
                return;
            }
            match event {
                BackendEvent::Data(payload) => {
                    *status = CallStatus::Streaming;
                    permit.send(Envelope::ResultData {
                        id: slot.id,
                        payload,
                    });
                    None
                }
                BackendEvent::Completed => {
                    *status = CallStatus::Completed;
                    permit.send(Envelope::ok(slot.id));
                    Some(StatusCode::Ok)
                }
                BackendEvent::Failed(failure) => {
                    *status = CallStatus::Errored;
                    debug!(code = failure.code, message = %failure.message, "call failed");
                    let code = failure.status();
                    permit.send(Envelope::failed(slot.id, &failure));
                    Some(code)
                }
            }
        };

        if let Some(code) = finished {
            shared.retire(&slot, code);
            debug!(status = code.as_str(), "call finished");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bridge_backend::{Backend, MockBackend, MockStep};
    use bridge_core::status::INTERNAL;
    use bridge_core::{CallFailure, SessionId};
    use bridge_schema::SchemaKind;
    use bridge_telemetry::{names, MetricsRecorder};

    const SCHEMA: &str = "service Echo {
        rpc Say (Msg) returns (Msg);
        rpc Up (stream Msg) returns (Msg);
        rpc Chat (stream Msg) returns (stream Msg);
        rpc Feed (Msg) returns (stream Msg);
        rpc Hang (Msg) returns (Msg);
    }";

    struct Harness {
        mux: CallMultiplexer,
        out: mpsc::Receiver<Envelope>,
        mock: Arc<MockBackend>,
        recorder: Arc<MetricsRecorder>,
    }

    async fn harness(mock: MockBackend, queue: usize) -> Harness {
        let mock = Arc::new(mock);
        let registry = Arc::new(Registry::load(SCHEMA, SchemaKind::InterfaceDefinition).unwrap());
        let conn = mock.connect(&SessionId::new()).await.unwrap();
        let (tx, out) = mpsc::channel(queue);
        let recorder = Arc::new(MetricsRecorder::in_memory().unwrap());
        let mux = CallMultiplexer::new(
            registry,
            Dispatcher::new(conn, 8),
            tx,
            BridgeMetrics::new(Some(recorder.clone())),
        );
        Harness {
            mux,
            out,
            mock,
            recorder,
        }
    }

    fn open(id: u64, method: &str, payload: Option<&'static [u8]>) -> Envelope {
        Envelope::CallOpen {
            id: CallId(id),
            service: "Echo".into(),
            method: method.into(),
            payload: payload.map(Bytes::from_static),
        }
    }

    fn data(id: u64, payload: &'static [u8]) -> Envelope {
        Envelope::CallData {
            id: CallId(id),
            payload: Bytes::from_static(payload),
        }
    }

    fn result(id: u64, payload: &'static [u8]) -> Envelope {
        Envelope::ResultData {
            id: CallId(id),
            payload: Bytes::from_static(payload),
        }
    }

    async fn next(out: &mut mpsc::Receiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), out.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("outbound closed")
    }

    /// Collect envelopes until `count` statuses have been seen.
    async fn until_statuses(out: &mut mpsc::Receiver<Envelope>, count: usize) -> Vec<Envelope> {
        let mut seen = Vec::new();
        let mut statuses = 0;
        while statuses < count {
            let env = next(out).await;
            if env.is_status() {
                statuses += 1;
            }
            seen.push(env);
        }
        seen
    }

    #[tokio::test]
    async fn unary_echo_round_trip() {
        let mut h = harness(MockBackend::new(), 16).await;
        h.mux.handle(open(1, "Say", Some(b"hi"))).unwrap();

        assert_eq!(next(&mut h.out).await, result(1, b"hi"));
        assert_eq!(next(&mut h.out).await, Envelope::ok(CallId(1)));
        assert_eq!(
            h.recorder.counter_get(names::CALLS_OPENED, &[("method", "Echo/Say")]),
            1
        );
    }

    #[tokio::test]
    async fn unknown_method_never_reaches_backend() {
        let mut h = harness(MockBackend::new(), 16).await;
        h.mux.handle(open(7, "Nope", None)).unwrap();
        h.mux
            .handle(Envelope::CallOpen {
                id: CallId(8),
                service: "Nope".into(),
                method: "X".into(),
                payload: None,
            })
            .unwrap();

        for id in [7, 8] {
            match next(&mut h.out).await {
                Envelope::ResultStatus { id: got, code, .. } => {
                    assert_eq!(got, CallId(id));
                    assert_eq!(code, StatusCode::MethodNotFound);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(h.mock.invocation_count(), 0);
        assert_eq!(h.mux.live_calls(), 0);
    }

    #[tokio::test]
    async fn data_after_end_is_discarded() {
        let mock = MockBackend::new().script("Echo/Up", vec![MockStep::DrainInput, MockStep::Complete]);
        let mut h = harness(mock, 16).await;

        h.mux.handle(open(3, "Up", None)).unwrap();
        h.mux.handle(data(3, b"a")).unwrap();
        h.mux.handle(Envelope::CallEnd { id: CallId(3) }).unwrap();
        // Ending twice is harmless.
        h.mux.handle(Envelope::CallEnd { id: CallId(3) }).unwrap();
        let late = h.mux.handle(data(3, b"b"));

        assert_eq!(next(&mut h.out).await, Envelope::ok(CallId(3)));
        let forwarded: Vec<Bytes> = h.mock.inputs().into_iter().map(|i| i.payload).collect();
        assert_eq!(forwarded, vec![Bytes::from_static(b"a")]);
        // Either the input was closed or the call already finished.
        assert!(matches!(
            late,
            Err(ProtocolViolation::InputClosed(_)) | Err(ProtocolViolation::UnknownCall(_))
        ));
    }

    #[tokio::test]
    async fn unary_input_is_closed() {
        let mock = MockBackend::new().script("Echo/Hang", vec![MockStep::HangUntilCancelled]);
        let h = harness(mock, 16).await;
        h.mux.handle(open(4, "Hang", None)).unwrap();
        assert_eq!(
            h.mux.handle(data(4, b"x")),
            Err(ProtocolViolation::InputClosed(CallId(4)))
        );
        assert_eq!(h.mux.call_status(CallId(4)), Some(CallStatus::Pending));
    }

    #[tokio::test]
    async fn cancel_emits_single_status_and_no_more_data() {
        let mock = MockBackend::new().script(
            "Echo/Feed",
            vec![
                MockStep::Data(Bytes::from_static(b"first")),
                MockStep::HangUntilCancelled,
            ],
        );
        let mut h = harness(mock, 16).await;
        h.mux.handle(open(5, "Feed", None)).unwrap();
        assert_eq!(next(&mut h.out).await, result(5, b"first"));

        h.mux.handle(Envelope::CallCancel { id: CallId(5) }).unwrap();
        assert_eq!(next(&mut h.out).await, Envelope::cancelled(CallId(5)));
        assert_eq!(
            h.mux.handle(Envelope::CallCancel { id: CallId(5) }),
            Err(ProtocolViolation::UnknownCall(CallId(5)))
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.out.try_recv().is_err());
        assert_eq!(h.mock.cancellation_count(), 1);
    }

    #[tokio::test]
    async fn cancel_races_a_chatty_backend() {
        let steps: Vec<MockStep> = (0..200)
            .map(|_| MockStep::Data(Bytes::from_static(b"tick")))
            .chain([MockStep::HangUntilCancelled])
            .collect();
        let mock = MockBackend::new().script("Echo/Feed", steps);
        let Harness { mux, mut out, .. } = harness(mock, 4).await;
        mux.handle(open(9, "Feed", None)).unwrap();
        assert_eq!(next(&mut out).await, result(9, b"tick"));

        mux.handle(Envelope::CallCancel { id: CallId(9) }).unwrap();
        let mut seen = Vec::new();
        loop {
            let env = next(&mut out).await;
            let done = env.is_status();
            seen.push(env);
            if done {
                break;
            }
        }
        assert_eq!(seen.last(), Some(&Envelope::cancelled(CallId(9))));
        assert!(seen[..seen.len() - 1]
            .iter()
            .all(|e| matches!(e, Envelope::ResultData { .. })));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_does_not_stall_other_envelopes() {
        let steps: Vec<MockStep> = (0..4)
            .map(|_| MockStep::Data(Bytes::from_static(b"chunk")))
            .chain([MockStep::HangUntilCancelled])
            .collect();
        let mock = MockBackend::new().script("Echo/Feed", steps);
        let Harness {
            mux,
            mut out,
            recorder,
            ..
        } = harness(mock, 1).await;
        mux.handle(open(1, "Feed", None)).unwrap();
        // Let the pump fill the single slot and block on the next chunk.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let unknown = tokio::time::timeout(Duration::from_secs(1), async {
            mux.handle(Envelope::CallOpen {
                id: CallId(2),
                service: "Nope".into(),
                method: "X".into(),
                payload: None,
            })
        })
        .await;
        assert_eq!(unknown, Ok(Ok(())));
        let cancel =
            tokio::time::timeout(Duration::from_secs(1), async {
                mux.handle(Envelope::CallCancel { id: CallId(1) })
            })
            .await;
        assert_eq!(cancel, Ok(Ok(())));
        // The id stays taken until its status is queued.
        assert_eq!(
            mux.handle(open(1, "Say", Some(b"x"))),
            Err(ProtocolViolation::DuplicateCall(CallId(1)))
        );

        assert_eq!(next(&mut out).await, result(1, b"chunk"));
        let mut statuses = vec![next(&mut out).await, next(&mut out).await];
        statuses.sort_by_key(|e| e.call_id());
        assert_eq!(statuses[0], Envelope::cancelled(CallId(1)));
        assert!(matches!(
            statuses[1],
            Envelope::ResultStatus {
                id: CallId(2),
                code: StatusCode::MethodNotFound,
                ..
            }
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(out.try_recv().is_err());
        assert_eq!(mux.live_calls(), 0);
        assert_eq!(
            recorder.counter_get(names::CALLS_FINISHED, &[("status", "cancelled")]),
            1
        );
    }

    #[tokio::test]
    async fn closed_queue_retires_the_call() {
        let mock = MockBackend::new().script(
            "Echo/Feed",
            vec![
                MockStep::Data(Bytes::from_static(b"lost")),
                MockStep::HangUntilCancelled,
            ],
        );
        let Harness {
            mux,
            out,
            mock,
            recorder,
        } = harness(mock, 4).await;
        drop(out);
        mux.handle(open(1, "Feed", None)).unwrap();

        for _ in 0..100 {
            if mux.live_calls() == 0 && mock.cancellation_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mux.live_calls(), 0);
        assert_eq!(mock.cancellation_count(), 1);
        assert_eq!(
            recorder.counter_get(names::CALLS_FINISHED, &[("status", "cancelled")]),
            1
        );
    }

    #[tokio::test]
    async fn concurrent_calls_keep_per_call_order() {
        let feed = |tag: &'static [u8]| {
            vec![
                MockStep::Data(Bytes::from_static(tag)),
                MockStep::Delay(Duration::from_millis(5)),
                MockStep::Data(Bytes::from_static(tag)),
                MockStep::Complete,
            ]
        };
        let mock = MockBackend::new()
            .script("Echo/Feed", feed(b"f"))
            .script("Echo/Chat", feed(b"c"));
        let mut h = harness(mock, 16).await;
        h.mux.handle(open(1, "Feed", None)).unwrap();
        h.mux.handle(open(2, "Chat", None)).unwrap();

        let seen = until_statuses(&mut h.out, 2).await;
        for id in [CallId(1), CallId(2)] {
            let mine: Vec<&Envelope> = seen.iter().filter(|e| e.call_id() == id).collect();
            assert_eq!(mine.len(), 3);
            assert!(mine[..2].iter().all(|e| matches!(e, Envelope::ResultData { .. })));
            assert_eq!(mine[2], &Envelope::ok(id));
        }
    }

    #[tokio::test]
    async fn backend_failure_maps_to_backend_error() {
        let mock = MockBackend::new().script("Echo/Say", vec![MockStep::Fail(CallFailure::internal("boom"))]);
        let mut h = harness(mock, 16).await;
        h.mux.handle(open(1, "Say", Some(b"x"))).unwrap();
        assert_eq!(
            next(&mut h.out).await,
            Envelope::status(CallId(1), StatusCode::BackendError(INTERNAL), "boom")
        );
        tokio::task::yield_now().await;
        assert_eq!(
            h.recorder.counter_get(names::CALLS_FINISHED, &[("status", "backend_error")]),
            1
        );
    }

    #[tokio::test]
    async fn id_reuse_rules() {
        let mock = MockBackend::new().script("Echo/Hang", vec![MockStep::HangUntilCancelled]);
        let mut h = harness(mock, 16).await;

        h.mux.handle(open(1, "Hang", None)).unwrap();
        assert_eq!(
            h.mux.handle(open(1, "Say", Some(b"x"))),
            Err(ProtocolViolation::DuplicateCall(CallId(1)))
        );
        // The live call is untouched.
        assert_eq!(h.mux.call_status(CallId(1)), Some(CallStatus::Pending));
        assert_eq!(h.mock.invocation_count(), 1);

        h.mux.handle(open(2, "Say", Some(b"once"))).unwrap();
        until_statuses(&mut h.out, 1).await;
        h.mux.handle(open(2, "Say", Some(b"twice"))).unwrap();
        assert_eq!(next(&mut h.out).await, result(2, b"twice"));
        assert_eq!(next(&mut h.out).await, Envelope::ok(CallId(2)));
    }

    #[tokio::test]
    async fn bridge_envelopes_from_client_are_violations() {
        let h = harness(MockBackend::new(), 16).await;
        let err = h.mux.handle(Envelope::ok(CallId(1))).unwrap_err();
        assert_eq!(err.kind(), "server_envelope");
        assert_eq!(
            h.mux.handle(data(42, b"x")),
            Err(ProtocolViolation::UnknownCall(CallId(42)))
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_live_calls() {
        let mock = MockBackend::new().script("Echo/Hang", vec![MockStep::HangUntilCancelled]);
        let mut h = harness(mock, 16).await;
        h.mux.handle(open(1, "Hang", None)).unwrap();
        h.mux.handle(open(2, "Hang", None)).unwrap();
        assert_eq!(h.mux.live_calls(), 2);

        h.mux.shutdown();
        assert_eq!(h.mux.live_calls(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.mock.cancellation_count(), 2);
        // Nothing is reported for calls torn down with the session.
        assert!(h.out.try_recv().is_err());
    }
}
