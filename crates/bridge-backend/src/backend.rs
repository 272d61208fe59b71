use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use bridge_core::SessionId;
use bridge_schema::MethodDescriptor;

use crate::call::{call_channel, CallContext, CallHandle};
use crate::error::BackendError;

/// Factory for per-session backend connections.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<dyn BackendConnection>, BackendError>;
}

/// One session's link to the backend.
pub trait BackendConnection: Send + Sync {
    /// Begin serving a call. Must return promptly; long-running work belongs
    /// on a spawned task that reports through `call.sink`.
    fn start(&self, call: CallContext);

    /// Release the connection. Calls still open fail with `Unavailable`.
    fn close(&self) {}
}

/// Invokes methods by descriptor on a session's backend connection.
#[derive(Clone)]
pub struct Dispatcher {
    connection: Arc<dyn BackendConnection>,
    buffer: usize,
}

impl Dispatcher {
    pub fn new(connection: Arc<dyn BackendConnection>, buffer: usize) -> Self {
        Self { connection, buffer }
    }

    /// Start a call without waiting on the backend.
    pub fn invoke(&self, descriptor: Arc<MethodDescriptor>, initial: Option<Bytes>) -> CallHandle {
        let (handle, ctx) = call_channel(descriptor, initial, self.buffer);
        self.connection.start(ctx);
        handle
    }

    pub fn close(&self) {
        self.connection.close();
    }
}
