use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use bridge_core::{CallFailure, SessionId};

use crate::backend::{Backend, BackendConnection};
use crate::call::CallContext;
use crate::error::BackendError;

/// In-process implementation of one or more methods.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve a call to completion. Dropping the sink without a terminal
    /// event fails the call.
    async fn call(&self, ctx: CallContext);
}

/// Echoes the initial payload and every client message back, completing
/// once client input ends.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn call(&self, mut ctx: CallContext) {
        if let Some(initial) = ctx.initial.take() {
            if ctx.sink.send(initial).await.is_err() {
                return;
            }
        }
        while let Some(msg) = ctx.next_input().await {
            if ctx.sink.send(msg).await.is_err() {
                return;
            }
        }
        if ctx.cancelled.is_cancelled() {
            return;
        }
        ctx.sink.complete().await;
    }
}

type RouteTable = HashMap<(String, String), Arc<dyn Handler>>;

/// Backend whose methods run inside the bridge process.
#[derive(Clone, Default)]
pub struct LocalBackend {
    routes: Arc<RouteTable>,
    fallback: Option<Arc<dyn Handler>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every method of every schema is served by [`EchoHandler`].
    pub fn echo() -> Self {
        Self::new().with_fallback(Arc::new(EchoHandler))
    }

    pub fn with_route(
        mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Arc::make_mut(&mut self.routes).insert((service.into(), method.into()), handler);
        self
    }

    pub fn with_fallback(mut self, handler: Arc<dyn Handler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn connect(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<dyn BackendConnection>, BackendError> {
        debug!(session_id = %session_id, routes = self.routes.len(), "local backend connected");
        Ok(Arc::new(LocalConnection {
            routes: self.routes.clone(),
            fallback: self.fallback.clone(),
        }))
    }
}

struct LocalConnection {
    routes: Arc<RouteTable>,
    fallback: Option<Arc<dyn Handler>>,
}

impl BackendConnection for LocalConnection {
    fn start(&self, ctx: CallContext) {
        let key = (ctx.descriptor.service.clone(), ctx.descriptor.method.clone());
        let handler = self.routes.get(&key).cloned().or_else(|| self.fallback.clone());
        match handler {
            Some(handler) => {
                tokio::spawn(async move { handler.call(ctx).await });
            }
            None => {
                let route = ctx.descriptor.route();
                tokio::spawn(async move {
                    ctx.sink
                        .fail(CallFailure::unimplemented(format!("no handler for {route}")))
                        .await;
                });
            }
        }
    }
}
