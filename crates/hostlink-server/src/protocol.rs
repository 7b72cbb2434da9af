//! Built-in message handlers: terminals, directory watches, port status.
//!
//! Every handler here is registered through the same open table as any
//! collaborator's, so each type can be overridden after
//! [`register_builtin_handlers`] runs.

use crate::fs_watch::{read_entries, ChangeCallback};
use crate::gateway::{handler_fn, Handler, MessageContext, SessionGateway};
use crate::terminal::{DataObserver, TerminalSession};
use hostlink_core::messages::{
    DirEntryInfo, PathRequest, TerminalCreateRequest, TerminalInputRequest, TerminalRef,
    TerminalResizeRequest,
};
use hostlink_core::{msg, LinkError, LinkResult};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Register every built-in message type on `gateway`.
pub fn register_builtin_handlers(gateway: &SessionGateway) {
    gateway
        .register_handler(msg::PING, replying(ping))
        .register_handler(msg::TERMINAL_CREATE, replying(terminal_create))
        .register_handler(msg::TERMINAL_INPUT, replying(terminal_input))
        .register_handler(msg::TERMINAL_RESIZE, replying(terminal_resize))
        .register_handler(msg::TERMINAL_KILL, replying(terminal_kill))
        .register_handler(msg::TERMINAL_LIST, replying(terminal_list))
        .register_handler(msg::FS_WATCH, replying(fs_watch))
        .register_handler(msg::FS_UNWATCH, replying(fs_unwatch))
        .register_handler(msg::FS_LIST, replying(fs_list))
        .register_handler(msg::PORT_STATUS, replying(port_status));
}

/// Wrap `f` so that a failure is reported to the requester as an `error`
/// message instead of only being logged.
fn replying<F, Fut>(f: F) -> Handler
where
    F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = LinkResult<()>> + Send + 'static,
{
    handler_fn(move |ctx: MessageContext| {
        let requester = ctx.clone();
        let fut = f(ctx);
        async move {
            if let Err(e) = fut.await {
                debug!(
                    connection_id = %requester.connection_id,
                    msg_type = %requester.envelope.msg_type,
                    error = %e,
                    "request failed"
                );
                requester.reply(msg::ERROR, json!({ "message": e.to_string() }))?;
            }
            Ok(())
        }
    })
}

async fn ping(ctx: MessageContext) -> LinkResult<()> {
    ctx.reply(msg::PONG, json!({}))
}

// ── Terminals ───────────────────────────────────────────────────────

/// Observer that forwards a terminal's output to the connection that
/// created it.
fn output_observer(gateway: &SessionGateway, owner: &str, terminal_id: &str) -> DataObserver {
    let weak = gateway.downgrade();
    let owner = owner.to_string();
    let terminal_id = terminal_id.to_string();
    Arc::new(move |success: bool, data: String, correlation_id: Option<String>| {
        let Some(gateway) = weak.upgrade() else {
            return;
        };
        let mut payload = Map::new();
        payload.insert("terminalId".into(), Value::String(terminal_id.clone()));
        payload.insert("success".into(), Value::Bool(success));
        payload.insert("data".into(), Value::String(data));
        if let Some(id) = correlation_id {
            payload.insert("requestId".into(), Value::String(id));
        }
        gateway.send_to_connection(&owner, msg::TERMINAL_OUTPUT, Value::Object(payload));
    })
}

/// Look up a terminal owned by the requesting connection.
async fn owned_terminal(ctx: &MessageContext, terminal_id: &str) -> Option<Arc<TerminalSession>> {
    ctx.gateway
        .terminals()
        .get(terminal_id)
        .await
        .filter(|s| s.owner() == ctx.connection_id)
}

/// Report an unknown terminal through the output channel, the same way a
/// dead terminal reports.
fn report_missing(ctx: &MessageContext, terminal_id: &str) -> LinkResult<()> {
    ctx.reply(
        msg::TERMINAL_OUTPUT,
        json!({
            "terminalId": terminal_id,
            "success": false,
            "data": format!("terminal {terminal_id} not found"),
        }),
    )
}

async fn terminal_create(ctx: MessageContext) -> LinkResult<()> {
    let request: TerminalCreateRequest = ctx.envelope.payload_as()?;
    let session = ctx
        .gateway
        .terminals()
        .create(&ctx.connection_id, &request, |id| {
            output_observer(&ctx.gateway, &ctx.connection_id, id)
        })
        .await?;

    if let Some(err) = session.init_error() {
        return Err(LinkError::TerminalSpawn(err));
    }
    ctx.reply(msg::TERMINAL_CREATED, json!({ "terminalId": session.id() }))
}

async fn terminal_input(ctx: MessageContext) -> LinkResult<()> {
    let request: TerminalInputRequest = ctx.envelope.payload_as()?;
    match owned_terminal(&ctx, &request.terminal_id).await {
        Some(session) => {
            let correlation = Some(ctx.envelope.request_id.clone()).filter(|id| !id.is_empty());
            tokio::task::spawn_blocking(move || session.create_command(&request.data, correlation))
                .await
                .map_err(|e| LinkError::Other(format!("join error: {e}")))
        }
        None => report_missing(&ctx, &request.terminal_id),
    }
}

async fn terminal_resize(ctx: MessageContext) -> LinkResult<()> {
    let request: TerminalResizeRequest = ctx.envelope.payload_as()?;
    match owned_terminal(&ctx, &request.terminal_id).await {
        Some(session) => {
            session.update_size(request.cols, request.rows);
            Ok(())
        }
        None => report_missing(&ctx, &request.terminal_id),
    }
}

async fn terminal_kill(ctx: MessageContext) -> LinkResult<()> {
    let request: TerminalRef = ctx.envelope.payload_as()?;
    let killed = match owned_terminal(&ctx, &request.terminal_id).await {
        Some(_) => ctx.gateway.terminals().kill(&request.terminal_id).await,
        None => false,
    };
    ctx.reply(
        msg::TERMINAL_KILLED,
        json!({ "terminalId": request.terminal_id, "killed": killed }),
    )
}

async fn terminal_list(ctx: MessageContext) -> LinkResult<()> {
    let sessions = ctx.gateway.terminals().list_owned_by(&ctx.connection_id).await;
    ctx.reply(msg::TERMINAL_SESSIONS, json!({ "sessions": sessions }))
}

// ── Filesystem ──────────────────────────────────────────────────────

fn listing_payload(path: &str, result: LinkResult<Vec<DirEntryInfo>>) -> Value {
    match result {
        Ok(entries) => json!({ "path": path, "success": true, "entries": entries }),
        Err(e) => json!({ "path": path, "success": false, "error": e.to_string() }),
    }
}

async fn fs_watch(ctx: MessageContext) -> LinkResult<()> {
    let request: PathRequest = ctx.envelope.payload_as()?;
    let weak = ctx.gateway.downgrade();
    let path = request.path.clone();
    let on_change: ChangeCallback = Arc::new(move |result: LinkResult<Vec<DirEntryInfo>>| {
        if let Some(gateway) = weak.upgrade() {
            gateway.broadcast(msg::FS_CHANGED, listing_payload(&path, result));
        }
    });
    let started = ctx.gateway.fs_watcher().watch_folder(&request.path, on_change)?;
    ctx.reply(
        msg::FS_WATCHING,
        json!({ "path": request.path, "started": started }),
    )
}

async fn fs_unwatch(ctx: MessageContext) -> LinkResult<()> {
    let request: PathRequest = ctx.envelope.payload_as()?;
    let removed = ctx.gateway.fs_watcher().unwatch_folder(&request.path);
    ctx.reply(
        msg::FS_UNWATCHED,
        json!({ "path": request.path, "removed": removed }),
    )
}

async fn fs_list(ctx: MessageContext) -> LinkResult<()> {
    let request: PathRequest = ctx.envelope.payload_as()?;
    let result = read_entries(std::path::Path::new(&request.path)).await;
    ctx.reply(msg::FS_LISTING, listing_payload(&request.path, result))
}

// ── Ports ───────────────────────────────────────────────────────────

async fn port_status(ctx: MessageContext) -> LinkResult<()> {
    let status = ctx.gateway.port_monitor().check_now().await;
    ctx.reply(msg::PORT_STATUS, json!(status))
}
