//! Terminal lifecycle management.
//!
//! Tracks every terminal session spawned on behalf of connected clients,
//! keyed by terminal id. Each session is owned by the connection that created
//! it and is killed when that connection goes away or the gateway shuts down.

use super::pty::PtyOptions;
use super::session::{DataObserver, TerminalSession};
use hostlink_core::messages::{TerminalCreateRequest, TerminalSummary};
use hostlink_core::{generate_request_id, LinkError, LinkResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Spawn defaults applied when a create request leaves a field unset.
#[derive(Debug, Clone)]
pub struct TerminalDefaults {
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Manages all terminal sessions of one gateway.
pub struct TerminalManager {
    defaults: TerminalDefaults,
    sessions: Mutex<HashMap<String, Arc<TerminalSession>>>,
}

impl TerminalManager {
    pub fn new(defaults: TerminalDefaults) -> Self {
        Self {
            defaults,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a shell for `owner`.
    ///
    /// `make_observer` receives the new terminal id and returns the output
    /// observer. A failed spawn is still returned (in the `Uninitialized`
    /// state, with the error already delivered to the observer) but is not
    /// tracked.
    pub async fn create<F>(
        &self,
        owner: &str,
        request: &TerminalCreateRequest,
        make_observer: F,
    ) -> LinkResult<Arc<TerminalSession>>
    where
        F: FnOnce(&str) -> DataObserver,
    {
        let id = format!("term-{}", generate_request_id());
        let options = self.options_for(request);
        let observer = make_observer(&id);

        let session = {
            let id = id.clone();
            let owner = owner.to_string();
            tokio::task::spawn_blocking(move || {
                TerminalSession::spawn(id, owner, &options, Some(observer))
            })
            .await
            .map_err(|e| LinkError::Other(format!("join error: {e}")))?
        };

        if session.init_error().is_none() {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(id.clone(), session.clone());
            info!(terminal_id = %id, owner, count = sessions.len(), "terminal created");
        }
        Ok(session)
    }

    /// Track an externally built session.
    pub async fn insert(&self, session: Arc<TerminalSession>) {
        self.sessions
            .lock()
            .await
            .insert(session.id().to_string(), session);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Kill and forget one session. Returns whether it was tracked.
    pub async fn kill(&self, id: &str) -> bool {
        let session = self.sessions.lock().await.remove(id);
        match session {
            Some(session) => {
                session.kill();
                true
            }
            None => false,
        }
    }

    /// Kill and forget every session owned by `owner`.
    pub async fn kill_owned_by(&self, owner: &str) -> usize {
        let owned: Vec<Arc<TerminalSession>> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.owner() == owner)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &owned {
            session.kill();
        }
        if !owned.is_empty() {
            debug!(owner, count = owned.len(), "killed terminals of closed connection");
        }
        owned.len()
    }

    /// Kill and forget every session.
    pub async fn kill_all(&self) -> usize {
        let all: Vec<Arc<TerminalSession>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in &all {
            session.kill();
        }
        if !all.is_empty() {
            info!(count = all.len(), "killed all terminals");
        }
        all.len()
    }

    /// Summaries of the sessions owned by `owner`, sorted by id.
    pub async fn list_owned_by(&self, owner: &str) -> Vec<TerminalSummary> {
        let sessions = self.sessions.lock().await;
        let mut out: Vec<TerminalSummary> = sessions
            .values()
            .filter(|s| s.owner() == owner)
            .map(|s| TerminalSummary {
                terminal_id: s.id().to_string(),
                alive: s.is_alive(),
                last_command: s.last_command(),
            })
            .collect();
        out.sort_by(|a, b| a.terminal_id.cmp(&b.terminal_id));
        out
    }

    pub async fn alive_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.is_alive())
            .count()
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn options_for(&self, request: &TerminalCreateRequest) -> PtyOptions {
        let dim = |v: Option<i64>, default: u16| {
            v.map(|n| n.clamp(1, i64::from(u16::MAX)) as u16)
                .unwrap_or(default)
        };
        PtyOptions {
            shell: request
                .shell
                .clone()
                .unwrap_or_else(|| self.defaults.shell.clone()),
            cols: dim(request.cols, self.defaults.cols),
            rows: dim(request.rows, self.defaults.rows),
            cwd: request
                .cwd
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.defaults.cwd.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::session::tests::{Call, FakeBackend};

    fn manager() -> TerminalManager {
        TerminalManager::new(TerminalDefaults {
            shell: "/bin/sh".into(),
            cwd: std::env::temp_dir(),
            cols: 80,
            rows: 24,
        })
    }

    fn fake(id: &str, owner: &str, backend: &FakeBackend) -> Arc<TerminalSession> {
        TerminalSession::with_backend(id.into(), owner.into(), Box::new(backend.clone()), None)
    }

    #[test]
    fn options_fill_defaults_and_clamp() {
        let m = manager();
        let opts = m.options_for(&TerminalCreateRequest {
            cols: Some(0),
            rows: None,
            cwd: Some("/work".into()),
            shell: None,
        });
        assert_eq!(opts.cols, 1);
        assert_eq!(opts.rows, 24);
        assert_eq!(opts.cwd, PathBuf::from("/work"));
        assert_eq!(opts.shell, "/bin/sh");
    }

    #[tokio::test]
    async fn kill_owned_by_only_touches_owner() {
        let m = manager();
        let a = FakeBackend::default();
        let b = FakeBackend::default();
        m.insert(fake("t-a", "conn-a", &a)).await;
        m.insert(fake("t-b", "conn-b", &b)).await;

        assert_eq!(m.kill_owned_by("conn-a").await, 1);
        assert_eq!(a.calls(), vec![Call::Kill]);
        assert!(b.calls().is_empty());
        assert_eq!(m.count().await, 1);
        assert_eq!(m.alive_count().await, 1);
    }

    #[tokio::test]
    async fn kill_all_empties_manager() {
        let m = manager();
        let a = FakeBackend::default();
        m.insert(fake("t-1", "c", &a)).await;
        m.insert(fake("t-2", "c", &a)).await;
        assert_eq!(m.kill_all().await, 2);
        assert_eq!(m.kill_all().await, 0);
        assert_eq!(m.count().await, 0);
    }

    #[tokio::test]
    async fn kill_unknown_is_false() {
        let m = manager();
        assert!(!m.kill("nope").await);
    }

    #[tokio::test]
    async fn list_reports_last_command() {
        let m = manager();
        let a = FakeBackend::default();
        let session = fake("t-1", "c", &a);
        m.insert(session.clone()).await;
        session.create_command("pwd\n", None);
        let list = m.list_owned_by("c").await;
        assert_eq!(list.len(), 1);
        assert!(list[0].alive);
        assert_eq!(list[0].last_command, "pwd\n");
    }

    #[tokio::test]
    async fn list_is_scoped_to_owner() {
        let m = manager();
        let backend = FakeBackend::default();
        m.insert(fake("t-2", "conn-a", &backend)).await;
        m.insert(fake("t-1", "conn-a", &backend)).await;
        m.insert(fake("t-3", "conn-b", &backend)).await;

        let ids: Vec<String> = m
            .list_owned_by("conn-a")
            .await
            .into_iter()
            .map(|s| s.terminal_id)
            .collect();
        assert_eq!(ids, vec!["t-1", "t-2"]);
        assert!(m.list_owned_by("conn-c").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_spawn_is_not_tracked() {
        let m = manager();
        let req = TerminalCreateRequest {
            shell: Some("/nonexistent/shell-binary".into()),
            ..Default::default()
        };
        let session = m
            .create("c", &req, |_| -> DataObserver {
                Arc::new(|_: bool, _: String, _: Option<String>| {})
            })
            .await
            .unwrap();
        assert!(session.init_error().is_some());
        assert_eq!(m.count().await, 0);
    }
}
