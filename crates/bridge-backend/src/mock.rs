use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use bridge_core::{CallFailure, SessionId};

use crate::backend::{Backend, BackendConnection};
use crate::call::{CallContext, SinkClosed};
use crate::error::BackendError;

/// One scripted action of a mock call.
#[derive(Clone, Debug)]
pub enum MockStep {
    /// Emit a data chunk.
    Data(Bytes),
    /// Emit the initial payload, if any.
    EchoInitial,
    /// Echo client messages until input ends.
    EchoInput,
    /// Record client messages until input ends.
    DrainInput,
    /// Sleep before the next step.
    Delay(Duration),
    /// Block until the call is cancelled.
    HangUntilCancelled,
    Complete,
    Fail(CallFailure),
    /// Drop the sink without a terminal event.
    Drop,
}

/// A client message observed by the mock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedInput {
    pub route: String,
    pub payload: Bytes,
}

#[derive(Default)]
struct MockState {
    invocations: AtomicUsize,
    connections: AtomicUsize,
    cancellations: AtomicUsize,
    inputs: Mutex<Vec<RecordedInput>>,
}

/// Backend returning pre-programmed responses for deterministic tests.
///
/// Scripts are keyed by `service/method`; unscripted routes use the default
/// script (echo the initial payload and complete).
pub struct MockBackend {
    scripts: HashMap<String, Vec<MockStep>>,
    default_script: Vec<MockStep>,
    connect_error: Option<BackendError>,
    state: Arc<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            default_script: vec![MockStep::EchoInitial, MockStep::Complete],
            connect_error: None,
            state: Arc::new(MockState::default()),
        }
    }

    /// Script a single route.
    pub fn script(mut self, route: &str, steps: Vec<MockStep>) -> Self {
        self.scripts.insert(route.to_string(), steps);
        self
    }

    pub fn default_script(mut self, steps: Vec<MockStep>) -> Self {
        self.default_script = steps;
        self
    }

    /// Every `connect` fails with `error`.
    pub fn failing_connect(mut self, error: BackendError) -> Self {
        self.connect_error = Some(error);
        self
    }

    pub fn invocation_count(&self) -> usize {
        self.state.invocations.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::Relaxed)
    }

    /// Calls that observed cancellation while hanging.
    pub fn cancellation_count(&self) -> usize {
        self.state.cancellations.load(Ordering::Relaxed)
    }

    pub fn inputs(&self) -> Vec<RecordedInput> {
        self.state.inputs.lock().clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(
        &self,
        _session_id: &SessionId,
    ) -> Result<Arc<dyn BackendConnection>, BackendError> {
        if let Some(e) = &self.connect_error {
            return Err(e.clone());
        }
        self.state.connections.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MockConnection {
            scripts: self.scripts.clone(),
            default_script: self.default_script.clone(),
            state: self.state.clone(),
        }))
    }
}

struct MockConnection {
    scripts: HashMap<String, Vec<MockStep>>,
    default_script: Vec<MockStep>,
    state: Arc<MockState>,
}

impl BackendConnection for MockConnection {
    fn start(&self, ctx: CallContext) {
        self.state.invocations.fetch_add(1, Ordering::Relaxed);
        let route = ctx.descriptor.route();
        let steps = self
            .scripts
            .get(&route)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone());
        let state = self.state.clone();
        tokio::spawn(run_script(ctx, route, steps, state));
    }
}

async fn run_script(mut ctx: CallContext, route: String, steps: Vec<MockStep>, state: Arc<MockState>) {
    for step in steps {
        match step {
            MockStep::Data(payload) => {
                if ctx.sink.send(payload).await.is_err() {
                    return;
                }
            }
            MockStep::EchoInitial => {
                if let Some(initial) = ctx.initial.clone() {
                    if ctx.sink.send(initial).await.is_err() {
                        return;
                    }
                }
            }
            MockStep::EchoInput => {
                if relay_input(&mut ctx, &route, &state, true).await.is_err() {
                    return;
                }
            }
            MockStep::DrainInput => {
                let _ = relay_input(&mut ctx, &route, &state, false).await;
            }
            MockStep::Delay(d) => {
                tokio::select! {
                    _ = ctx.cancelled.cancelled() => return,
                    _ = tokio::time::sleep(d) => {}
                }
            }
            MockStep::HangUntilCancelled => {
                ctx.cancelled.cancelled().await;
                state.cancellations.fetch_add(1, Ordering::Relaxed);
                return;
            }
            MockStep::Complete => {
                ctx.sink.complete().await;
                return;
            }
            MockStep::Fail(failure) => {
                ctx.sink.fail(failure).await;
                return;
            }
            MockStep::Drop => return,
        }
    }
}

async fn relay_input(
    ctx: &mut CallContext,
    route: &str,
    state: &MockState,
    echo: bool,
) -> Result<(), SinkClosed> {
    while let Some(payload) = ctx.next_input().await {
        state.inputs.lock().push(RecordedInput {
            route: route.to_string(),
            payload: payload.clone(),
        });
        if echo {
            ctx.sink.send(payload).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Dispatcher;
    use crate::call::BackendEvent;
    use bridge_schema::{Cardinality, MethodDescriptor};
    use futures::StreamExt;

    fn descriptor(method: &str, cardinality: Cardinality) -> Arc<MethodDescriptor> {
        Arc::new(MethodDescriptor {
            service: "Mock".into(),
            method: method.into(),
            cardinality,
            request_type: "M".into(),
            response_type: "M".into(),
        })
    }

    async fn dispatcher(mock: &MockBackend) -> Dispatcher {
        Dispatcher::new(mock.connect(&SessionId::new()).await.unwrap(), 8)
    }

    #[tokio::test]
    async fn default_script_echoes_initial() {
        let mock = MockBackend::new();
        let d = dispatcher(&mock).await;
        let events: Vec<_> = d
            .invoke(descriptor("A", Cardinality::Unary), Some(Bytes::from_static(b"x")))
            .events
            .collect()
            .await;
        assert_eq!(
            events,
            vec![BackendEvent::Data(Bytes::from_static(b"x")), BackendEvent::Completed]
        );
        assert_eq!(mock.invocation_count(), 1);
        assert_eq!(mock.connection_count(), 1);
    }

    #[tokio::test]
    async fn scripted_failure() {
        let mock = MockBackend::new().script(
            "Mock/B",
            vec![
                MockStep::Data(Bytes::from_static(b"partial")),
                MockStep::Fail(CallFailure::internal("boom")),
            ],
        );
        let d = dispatcher(&mock).await;
        let events: Vec<_> = d.invoke(descriptor("B", Cardinality::ServerStreaming), None).events.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], BackendEvent::Failed(CallFailure::internal("boom")));
    }

    #[tokio::test]
    async fn drain_records_inputs() {
        let mock = MockBackend::new().script("Mock/Up", vec![MockStep::DrainInput, MockStep::Complete]);
        let d = dispatcher(&mock).await;
        let handle = d.invoke(descriptor("Up", Cardinality::ClientStreaming), None);
        handle.control.send(Bytes::from_static(b"1"));
        handle.control.send(Bytes::from_static(b"2"));
        handle.control.end_input();
        let events: Vec<_> = handle.events.collect().await;
        assert_eq!(events, vec![BackendEvent::Completed]);
        let payloads: Vec<_> = mock.inputs().into_iter().map(|i| i.payload).collect();
        assert_eq!(payloads, vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
    }

    #[tokio::test]
    async fn hang_until_cancelled() {
        let mock = MockBackend::new().script("Mock/H", vec![MockStep::HangUntilCancelled]);
        let d = dispatcher(&mock).await;
        let handle = d.invoke(descriptor("H", Cardinality::Unary), None);
        handle.control.cancel();
        let events: Vec<_> = handle.events.collect().await;
        assert_eq!(events, vec![BackendEvent::Failed(CallFailure::dropped())]);
        assert_eq!(mock.cancellation_count(), 1);
    }

    #[tokio::test]
    async fn failing_connect() {
        let mock = MockBackend::new().failing_connect(BackendError::Unavailable("down".into()));
        assert!(mock.connect(&SessionId::new()).await.is_err());
        assert_eq!(mock.connection_count(), 0);
    }
}
