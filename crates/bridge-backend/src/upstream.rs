use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bridge_core::status::CANCELLED;
use bridge_core::{CallFailure, CallId, Envelope, EnvelopeCodec, SessionId, StatusCode};

use crate::backend::{Backend, BackendConnection};
use crate::call::{CallContext, EventSink};
use crate::error::BackendError;

/// Where and how to reach the upstream RPC server.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub addr: String,
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:50051".into(),
            connect_timeout: Duration::from_secs(5),
            max_frame_len: bridge_core::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Relays calls to a remote server speaking the envelope protocol over TCP.
/// Each session gets its own upstream connection.
pub struct UpstreamBackend {
    config: UpstreamConfig,
}

impl UpstreamBackend {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }
}

#[async_trait]
impl Backend for UpstreamBackend {
    fn name(&self) -> &str {
        "upstream"
    }

    async fn connect(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<dyn BackendConnection>, BackendError> {
        let addr = self.config.addr.clone();
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BackendError::Timeout {
                addr: addr.clone(),
                timeout: self.config.connect_timeout,
            })?
            .map_err(|e| BackendError::Connect {
                addr: addr.clone(),
                message: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);

        info!(session_id = %session_id, addr = %addr, "upstream connected");
        Ok(UpstreamConnection::spawn(
            stream,
            EnvelopeCodec::new(self.config.max_frame_len),
            session_id.clone(),
        ))
    }
}

struct UpstreamCall {
    sink: EventSink,
    done: CancellationToken,
}

struct UpstreamConnection {
    next_id: AtomicU64,
    calls: Arc<DashMap<u64, UpstreamCall>>,
    outbound: mpsc::UnboundedSender<Envelope>,
    closed: CancellationToken,
}

impl UpstreamConnection {
    fn spawn(stream: TcpStream, codec: EnvelopeCodec, session_id: SessionId) -> Arc<Self> {
        let (mut writer, mut reader) = Framed::new(stream, codec).split::<Envelope>();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let calls: Arc<DashMap<u64, UpstreamCall>> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        // Writer
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    msg = outbound_rx.recv() => {
                        let Some(envelope) = msg else { break };
                        if let Err(e) = writer.send(envelope).await {
                            warn!(error = %e, "upstream write failed");
                            break;
                        }
                    }
                }
            }
            writer_closed.cancel();
            let _ = writer.close().await;
        });

        // Reader
        let reader_calls = calls.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = reader_closed.cancelled() => break "upstream connection closed",
                    frame = reader.next() => match frame {
                        Some(Ok(envelope)) => route_result(&reader_calls, envelope).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "upstream sent an undecodable frame");
                            break "upstream protocol error";
                        }
                        None => break "upstream disconnected",
                    }
                }
            };
            reader_closed.cancel();
            fail_all(&reader_calls, reason).await;
            debug!(session_id = %session_id, reason, "upstream reader stopped");
        });

        Arc::new(Self {
            next_id: AtomicU64::new(1),
            calls,
            outbound,
            closed,
        })
    }
}

async fn route_result(calls: &DashMap<u64, UpstreamCall>, envelope: Envelope) {
    match envelope {
        Envelope::ResultData { id, payload } => {
            let sink = calls.get(&id.get()).map(|c| c.sink.clone());
            match sink {
                Some(sink) => {
                    let _ = sink.send(payload).await;
                }
                None => debug!(upstream_id = %id, "result for unknown upstream call"),
            }
        }
        Envelope::ResultStatus { id, code, message } => {
            let Some((_, call)) = calls.remove(&id.get()) else {
                debug!(upstream_id = %id, "status for unknown upstream call");
                return;
            };
            call.done.cancel();
            match code {
                StatusCode::Ok => call.sink.complete().await,
                StatusCode::Cancelled => call.sink.fail(CallFailure::new(CANCELLED, message)).await,
                StatusCode::MethodNotFound => {
                    call.sink.fail(CallFailure::method_not_found(message)).await
                }
                StatusCode::BackendError(c) => call.sink.fail(CallFailure::new(c, message)).await,
            }
        }
        other => warn!(kind = other.kind(), "upstream sent a client-side envelope"),
    }
}

async fn fail_all(calls: &DashMap<u64, UpstreamCall>, reason: &str) {
    let ids: Vec<u64> = calls.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, call)) = calls.remove(&id) {
            call.done.cancel();
            call.sink.fail(CallFailure::unavailable(reason)).await;
        }
    }
}

impl BackendConnection for UpstreamConnection {
    fn start(&self, ctx: CallContext) {
        let CallContext {
            descriptor,
            initial,
            mut input,
            sink,
            cancelled,
        } = ctx;

        if self.closed.is_cancelled() {
            tokio::spawn(sink.fail(CallFailure::unavailable("upstream connection closed")));
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let done = CancellationToken::new();
        self.calls.insert(
            id,
            UpstreamCall {
                sink,
                done: done.clone(),
            },
        );
        if self.closed.is_cancelled() {
            // Lost a race with disconnect; the reader may already have failed
            // everything it could see.
            if let Some((_, call)) = self.calls.remove(&id) {
                tokio::spawn(call.sink.fail(CallFailure::unavailable("upstream connection closed")));
            }
            return;
        }
        let _ = self.outbound.send(Envelope::CallOpen {
            id: CallId(id),
            service: descriptor.service.clone(),
            method: descriptor.method.clone(),
            payload: initial,
        });

        let outbound = self.outbound.clone();
        let calls = self.calls.clone();
        let client_streams = descriptor.cardinality.client_streams();
        tokio::spawn(async move {
            let mut input_open = client_streams;
            loop {
                tokio::select! {
                    biased;
                    _ = done.cancelled() => break,
                    _ = cancelled.cancelled() => {
                        let _ = outbound.send(Envelope::CallCancel { id: CallId(id) });
                        calls.remove(&id);
                        break;
                    }
                    msg = input.recv(), if input_open => match msg {
                        Some(payload) => {
                            let _ = outbound.send(Envelope::CallData { id: CallId(id), payload });
                        }
                        None => {
                            input_open = false;
                            let _ = outbound.send(Envelope::CallEnd { id: CallId(id) });
                        }
                    },
                }
            }
        });
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Dispatcher;
    use crate::call::BackendEvent;
    use bridge_schema::{Cardinality, MethodDescriptor};
    use bytes::Bytes;
    use tokio::net::TcpListener;

    fn descriptor(method: &str, cardinality: Cardinality) -> Arc<MethodDescriptor> {
        Arc::new(MethodDescriptor {
            service: "demo.Echo".into(),
            method: method.into(),
            cardinality,
            request_type: "demo.Msg".into(),
            response_type: "demo.Msg".into(),
        })
    }

    fn config(addr: String) -> UpstreamConfig {
        UpstreamConfig {
            addr,
            connect_timeout: Duration::from_secs(2),
            ..UpstreamConfig::default()
        }
    }

    /// Fake upstream: echoes `CallOpen` payloads and `CallData`, completes on
    /// `CallEnd` (or immediately for calls opened with a payload), and
    /// reports every envelope it receives.
    async fn spawn_echo_upstream() -> (String, mpsc::UnboundedReceiver<Envelope>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, EnvelopeCodec::default());
            while let Some(Ok(env)) = framed.next().await {
                let _ = seen_tx.send(env.clone());
                match env {
                    Envelope::CallOpen { id, payload: Some(p), .. } => {
                        framed.send(Envelope::ResultData { id, payload: p }).await.unwrap();
                        framed.send(Envelope::ok(id)).await.unwrap();
                    }
                    Envelope::CallData { id, payload } => {
                        framed.send(Envelope::ResultData { id, payload }).await.unwrap();
                    }
                    Envelope::CallEnd { id } => framed.send(Envelope::ok(id)).await.unwrap(),
                    _ => {}
                }
            }
        });
        (addr, seen_rx)
    }

    async fn dispatcher(addr: String) -> Dispatcher {
        let backend = UpstreamBackend::new(config(addr));
        Dispatcher::new(backend.connect(&SessionId::new()).await.unwrap(), 8)
    }

    #[tokio::test]
    async fn unary_roundtrip() {
        let (addr, _seen) = spawn_echo_upstream().await;
        let d = dispatcher(addr).await;
        let events: Vec<_> = d
            .invoke(descriptor("Say", Cardinality::Unary), Some(Bytes::from_static(b"hi")))
            .events
            .collect()
            .await;
        assert_eq!(
            events,
            vec![BackendEvent::Data(Bytes::from_static(b"hi")), BackendEvent::Completed]
        );
    }

    #[tokio::test]
    async fn client_stream_forwards_data_and_end() {
        let (addr, mut seen) = spawn_echo_upstream().await;
        let d = dispatcher(addr).await;
        let handle = d.invoke(descriptor("Chat", Cardinality::BidiStreaming), None);
        handle.control.send(Bytes::from_static(b"a"));
        handle.control.end_input();
        let events: Vec<_> = handle.events.collect().await;
        assert_eq!(
            events,
            vec![BackendEvent::Data(Bytes::from_static(b"a")), BackendEvent::Completed]
        );

        assert!(matches!(seen.recv().await, Some(Envelope::CallOpen { payload: None, .. })));
        assert!(matches!(seen.recv().await, Some(Envelope::CallData { .. })));
        assert!(matches!(seen.recv().await, Some(Envelope::CallEnd { .. })));
    }

    #[tokio::test]
    async fn cancel_is_forwarded() {
        let (addr, mut seen) = spawn_echo_upstream().await;
        let d = dispatcher(addr).await;
        let handle = d.invoke(descriptor("Chat", Cardinality::BidiStreaming), None);
        assert!(matches!(seen.recv().await, Some(Envelope::CallOpen { .. })));
        handle.control.cancel();
        let cancelled = seen.recv().await.unwrap();
        assert_eq!(cancelled, Envelope::CallCancel { id: CallId(1) });
    }

    #[tokio::test]
    async fn upstream_not_found_is_passed_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, EnvelopeCodec::default());
            if let Some(Ok(Envelope::CallOpen { id, service, method, .. })) = framed.next().await {
                let reply = Envelope::method_not_found(id, &service, &method);
                framed.send(reply).await.unwrap();
            }
            // Hold the connection open until the client is done.
            let _ = framed.next().await;
        });

        let d = dispatcher(addr).await;
        let events: Vec<_> = d
            .invoke(descriptor("Gone", Cardinality::Unary), Some(Bytes::new()))
            .events
            .collect()
            .await;
        match &events[..] {
            [BackendEvent::Failed(f)] => assert_eq!(f.status(), StatusCode::MethodNotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_fails_every_open_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, EnvelopeCodec::default());
            // Wait for both calls, then hang up.
            let _ = framed.next().await;
            let _ = framed.next().await;
        });

        let d = dispatcher(addr).await;
        let a = d.invoke(descriptor("Chat", Cardinality::BidiStreaming), None);
        let b = d.invoke(descriptor("Watch", Cardinality::ServerStreaming), Some(Bytes::new()));

        for handle in [a, b] {
            let events: Vec<_> = handle.events.collect().await;
            match &events[..] {
                [BackendEvent::Failed(f)] => {
                    assert_eq!(f.code, bridge_core::status::UNAVAILABLE);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        // Calls started after the disconnect fail straight away.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let late: Vec<_> = d.invoke(descriptor("Say", Cardinality::Unary), None).events.collect().await;
        assert!(matches!(&late[..], [BackendEvent::Failed(_)]));
    }

    #[tokio::test]
    async fn connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let backend = UpstreamBackend::new(config(addr));
        let err = backend.connect(&SessionId::new()).await.err().unwrap();
        assert!(matches!(err, BackendError::Connect { .. }), "{err}");
    }
}
