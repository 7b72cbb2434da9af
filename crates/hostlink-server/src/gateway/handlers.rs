//! Message-type handler table.
//!
//! Maps an open message-type string to exactly one handler. Registering a
//! type again replaces the previous handler; unknown types have no entry and
//! are dropped by the dispatcher.

use super::SessionGateway;
use hostlink_core::{Envelope, LinkResult};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = LinkResult<()>> + Send>>;

/// A registered message handler.
pub type Handler = Arc<dyn Fn(MessageContext) -> HandlerFuture + Send + Sync>;

/// Everything a handler gets for one inbound message.
#[derive(Clone)]
pub struct MessageContext {
    pub gateway: SessionGateway,
    pub connection_id: String,
    pub envelope: Envelope,
}

impl MessageContext {
    /// Send `msg_type` back to the originating connection, echoing the
    /// inbound request id.
    pub fn reply(&self, msg_type: &str, payload: Value) -> LinkResult<()> {
        let env = Envelope::reply(msg_type, &self.envelope.request_id, payload);
        self.gateway.send_envelope(&self.connection_id, env)
    }
}

/// Wrap an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = LinkResult<()>> + Send + 'static,
{
    Arc::new(move |ctx: MessageContext| -> HandlerFuture { Box::pin(f(ctx)) })
}

/// Single-handler-per-type dispatch table.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `msg_type`, returning the handler it replaced.
    pub fn register(&self, msg_type: String, handler: Handler) -> Option<Handler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg_type, handler)
    }

    pub fn get(&self, msg_type: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(msg_type)
            .cloned()
    }

    pub fn contains(&self, msg_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(msg_type)
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        handler_fn(|_ctx| async { Ok(()) })
    }

    #[test]
    fn register_replaces() {
        let table = HandlerTable::new();
        assert!(table.register("x".into(), noop()).is_none());
        assert!(table.register("x".into(), noop()).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unknown_type_has_no_handler() {
        let table = HandlerTable::new();
        table.register("known".into(), noop());
        assert!(table.get("unknown").is_none());
        assert!(table.contains("known"));
    }
}
