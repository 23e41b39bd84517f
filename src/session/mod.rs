pub mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{SpawnError, TabError};
use crate::pty::{PtyProcess, SpawnOptions};
use crate::web::events::ServerEvent;
use store::{TabStore, TabTopology};

pub const MAX_TAB_ID_LEN: usize = 32;

/// Accepted terminal geometry range, both axes
pub const MIN_DIMENSION: u16 = 1;
pub const MAX_DIMENSION: u16 = 1000;

/// Depth of the per-connection outbound event queue
const OUTBOUND_QUEUE_DEPTH: usize = 512;

/// Tab ids are opaque client-assigned strings, unique within a session.
pub fn valid_tab_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_TAB_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabState {
    Running,
    /// Process exited on its own; input is rejected until the tab is closed
    Dead,
    /// Spawn failed; the tab stays failed until closed
    Failed,
}

/// One terminal tab. A live tab is backed by exactly one PTY process; the
/// process handle is kept after death so its replay buffer stays readable.
pub struct Tab {
    pub id: String,
    pub state: TabState,
    pub pty: Option<Arc<PtyProcess>>,
    pub cols: u16,
    pub rows: u16,
    pub exit_code: Option<u32>,
    spawn_id: u64,
}

/// The single live connection currently serving a session
struct ConnectionSlot {
    id: Uuid,
    outbound: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
}

struct SessionState {
    tabs: Vec<Tab>,
    active_tab: Option<String>,
    #[allow(dead_code)]
    created: u64,
    last_activity: u64,
    conn: Option<ConnectionSlot>,
    /// Bumped on every bind; a grace timer only fires if the epoch it
    /// captured is still current (no reconnect happened)
    epoch: u64,
    /// Whether the persisted topology has been loaded into this session
    restored: bool,
    /// Set by grace expiry; the handle is orphaned from the registry map and
    /// must not be bound again
    expired: bool,
}

/// One authenticated user's session. All topology mutation goes through the
/// per-session mutex; the registry map is only locked for lookup/insert.
pub struct SessionHandle {
    pub user_id: String,
    state: Mutex<SessionState>,
}

/// Everything a connection needs to serve one existing tab
pub struct TabBinding {
    pub tab_id: String,
    pub state: TabState,
    pub exit_code: Option<u32>,
    /// Buffered output tail to deliver before live output
    pub replay: Vec<u8>,
    /// Seq of the first live chunk not contained in `replay`; chunks below
    /// it have already been delivered via the replay
    pub replay_seq: u64,
    pub output: Option<broadcast::Receiver<(u64, Bytes)>>,
}

/// Result of binding a connection to a session
pub struct BoundConnection {
    pub conn_id: Uuid,
    pub session: Arc<SessionHandle>,
    pub outbound: mpsc::Sender<ServerEvent>,
    pub events: mpsc::Receiver<ServerEvent>,
    pub cancel: CancellationToken,
    pub tabs_snapshot: Vec<String>,
    pub active_tab: Option<String>,
    pub tabs: Vec<TabBinding>,
}

/// Maps authenticated users to their sessions and owns session lifecycle:
/// restore on connect, grace timer on disconnect, teardown on expiry.
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    store: TabStore,
    config: Config,
    next_spawn_id: AtomicU64,
}

impl Registry {
    pub fn new(config: Config, store: TabStore) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            config,
            next_spawn_id: AtomicU64::new(1),
        })
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn find(&self, user_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(user_id).cloned()
    }

    async fn get_or_create(&self, user_id: &str) -> Arc<SessionHandle> {
        {
            let sessions = self.sessions.read().await;
            if let Some(s) = sessions.get(user_id) {
                return s.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(user_id.to_string())
            .or_insert_with(|| {
                tracing::info!(user = %user_id, "Created session");
                Arc::new(SessionHandle {
                    user_id: user_id.to_string(),
                    state: Mutex::new(SessionState {
                        tabs: Vec::new(),
                        active_tab: None,
                        created: now_secs(),
                        last_activity: now_secs(),
                        conn: None,
                        epoch: 0,
                        restored: false,
                        expired: false,
                    }),
                })
            })
            .clone()
    }

    /// Bind a new connection to the user's session. A still-live previous
    /// connection is cancelled and replaced; the persisted topology is
    /// restored (processes spawned) on the first bind of a fresh session.
    pub async fn bind_connection(self: &Arc<Self>, user_id: &str) -> BoundConnection {
        loop {
            let session = self.get_or_create(user_id).await;
            let st = session.state.lock().await;
            // Grace expiry may have torn this session down while we waited
            // for the lock; its map entry is gone, so start over on a fresh one
            if st.expired {
                continue;
            }
            return self.bind_locked(&session, st, user_id);
        }
    }

    fn bind_locked(
        self: &Arc<Self>,
        session: &Arc<SessionHandle>,
        mut st: tokio::sync::MutexGuard<'_, SessionState>,
        user_id: &str,
    ) -> BoundConnection {
        if let Some(old) = st.conn.take() {
            tracing::info!(user = %user_id, "Replacing existing connection");
            old.cancel.cancel();
        }
        st.epoch += 1;

        if !st.restored {
            st.restored = true;
            let topo = self
                .store
                .load(user_id)
                .unwrap_or_else(TabTopology::default_topology);
            st.active_tab = Some(topo.active_tab.clone());
            for tab_id in topo.tabs {
                let (tab, result) = self.spawn_tab_record(session, tab_id.clone());
                if let Err(e) = result {
                    tracing::error!(user = %user_id, tab = %tab_id, error = %e, "Restore spawn failed");
                }
                st.tabs.push(tab);
            }
            tracing::info!(user = %user_id, tabs = st.tabs.len(), "Restored tab topology");
        }

        let (outbound, events) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let conn_id = Uuid::new_v4();
        st.conn = Some(ConnectionSlot {
            id: conn_id,
            outbound: outbound.clone(),
            cancel: cancel.clone(),
        });
        st.last_activity = now_secs();

        // Subscribe before snapshotting so no chunk falls between; the seq
        // cursor lets the forwarder drop chunks the snapshot already holds
        let tabs = st
            .tabs
            .iter()
            .map(|t| {
                let output = t.pty.as_ref().map(|p| p.subscribe());
                let (replay, replay_seq) = t
                    .pty
                    .as_ref()
                    .map(|p| p.replay_snapshot())
                    .unwrap_or_default();
                TabBinding {
                    tab_id: t.id.clone(),
                    state: t.state,
                    exit_code: t.exit_code,
                    replay,
                    replay_seq,
                    output,
                }
            })
            .collect();

        BoundConnection {
            conn_id,
            session: session.clone(),
            outbound,
            events,
            cancel,
            tabs_snapshot: st.tabs.iter().map(|t| t.id.clone()).collect(),
            active_tab: st.active_tab.clone(),
            tabs,
        }
    }

    /// Unbind a dropped connection. PTY processes keep running; the grace
    /// timer tears the session down only if no reconnect arrives in time.
    pub async fn unbind(self: &Arc<Self>, user_id: &str, conn_id: Uuid) {
        let Some(session) = self.find(user_id).await else {
            return;
        };

        let epoch = {
            let mut st = session.state.lock().await;
            match &st.conn {
                Some(conn) if conn.id == conn_id => {}
                // A newer connection already replaced this one
                _ => return,
            }
            if let Some(conn) = st.conn.take() {
                conn.cancel.cancel();
            }
            st.last_activity = now_secs();
            st.epoch
        };

        let grace = self.config.grace_period();
        tracing::info!(user = %user_id, grace_secs = grace.as_secs(), "Connection dropped, grace timer armed");

        let registry = Arc::clone(self);
        let user = user_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.expire_if_idle(&user, epoch).await;
        });
    }

    async fn expire_if_idle(&self, user_id: &str, epoch: u64) {
        let Some(session) = self.find(user_id).await else {
            return;
        };

        {
            let mut st = session.state.lock().await;
            if st.conn.is_some() || st.epoch != epoch {
                // Reconnected within the grace period
                return;
            }
            st.expired = true;
            for tab in st.tabs.drain(..) {
                if let Some(pty) = &tab.pty {
                    pty.kill();
                }
            }
            st.active_tab = None;
        }

        self.sessions.write().await.remove(user_id);
        tracing::info!(user = %user_id, "Session expired after grace period");
    }

    /// Open a new tab and eagerly spawn its shell. Spawn failure records the
    /// tab in a failed state and reports a tab-scoped error.
    pub async fn open_tab(
        self: &Arc<Self>,
        session: &Arc<SessionHandle>,
        tab_id: &str,
    ) -> Result<TabBinding, TabError> {
        if !valid_tab_id(tab_id) {
            return Err(TabError::InvalidTabId(tab_id.to_string()));
        }

        let mut st = session.state.lock().await;
        if st.tabs.iter().any(|t| t.id == tab_id) {
            return Err(TabError::AlreadyExists(tab_id.to_string()));
        }
        if st.tabs.len() >= self.config.session.max_tabs {
            return Err(TabError::TooManyTabs(self.config.session.max_tabs));
        }

        let (tab, result) = self.spawn_tab_record(session, tab_id.to_string());
        if st.active_tab.is_none() {
            st.active_tab = Some(tab_id.to_string());
        }
        st.tabs.push(tab);
        st.last_activity = now_secs();
        self.persist_locked(&st, &session.user_id);

        result?;

        let tab = st.tabs.last().expect("tab just pushed");
        tracing::info!(user = %session.user_id, tab = %tab_id, "Opened tab");
        Ok(TabBinding {
            tab_id: tab.id.clone(),
            state: tab.state,
            exit_code: tab.exit_code,
            output: tab.pty.as_ref().map(|p| p.subscribe()),
            replay: Vec::new(),
            replay_seq: 0,
        })
    }

    /// Close a tab and terminate its process. Closing the last tab leaves the
    /// session with an empty tab list, which is legal.
    pub async fn close_tab(
        &self,
        session: &Arc<SessionHandle>,
        tab_id: &str,
    ) -> Result<(), TabError> {
        let mut st = session.state.lock().await;
        let pos = st
            .tabs
            .iter()
            .position(|t| t.id == tab_id)
            .ok_or_else(|| TabError::NotFound(tab_id.to_string()))?;

        let tab = st.tabs.remove(pos);
        if let Some(pty) = &tab.pty {
            pty.kill();
        }
        if st.active_tab.as_deref() == Some(tab_id) {
            st.active_tab = st.tabs.last().map(|t| t.id.clone());
        }
        st.last_activity = now_secs();
        self.persist_locked(&st, &session.user_id);

        tracing::info!(user = %session.user_id, tab = %tab_id, "Closed tab");
        Ok(())
    }

    /// Mark a tab active and re-assert its stored geometry, covering tabs
    /// whose terminal never sent a resize while backgrounded.
    pub async fn select_tab(
        &self,
        session: &Arc<SessionHandle>,
        tab_id: &str,
    ) -> Result<(), TabError> {
        let mut st = session.state.lock().await;
        let tab = st
            .tabs
            .iter()
            .find(|t| t.id == tab_id)
            .ok_or_else(|| TabError::NotFound(tab_id.to_string()))?;

        if let Some(pty) = &tab.pty {
            if let Err(e) = pty.resize(tab.cols, tab.rows) {
                tracing::warn!(tab = %tab_id, error = %e, "Geometry re-assert failed");
            }
        }
        st.active_tab = Some(tab_id.to_string());
        st.last_activity = now_secs();
        self.persist_locked(&st, &session.user_id);
        Ok(())
    }

    /// Apply a client-driven resize: validate, store the authoritative
    /// geometry on the tab, and forward to the PTY.
    pub async fn resize_tab(
        &self,
        session: &Arc<SessionHandle>,
        tab_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), TabError> {
        if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&cols)
            || !(MIN_DIMENSION..=MAX_DIMENSION).contains(&rows)
        {
            return Err(TabError::InvalidGeometry { cols, rows });
        }

        let mut st = session.state.lock().await;
        st.last_activity = now_secs();
        let tab = st
            .tabs
            .iter_mut()
            .find(|t| t.id == tab_id)
            .ok_or_else(|| TabError::NotFound(tab_id.to_string()))?;

        tab.cols = cols;
        tab.rows = rows;
        if let Some(pty) = &tab.pty {
            if let Err(e) = pty.resize(cols, rows) {
                tracing::warn!(tab = %tab_id, error = %e, "Resize failed");
            }
        }
        Ok(())
    }

    /// Forward raw input to a tab's process, in the order received.
    pub async fn write_tab(
        &self,
        session: &Arc<SessionHandle>,
        tab_id: &str,
        data: Bytes,
    ) -> Result<(), TabError> {
        let pty = {
            let mut st = session.state.lock().await;
            st.last_activity = now_secs();
            let tab = st
                .tabs
                .iter()
                .find(|t| t.id == tab_id)
                .ok_or_else(|| TabError::NotFound(tab_id.to_string()))?;
            match (&tab.state, &tab.pty) {
                (TabState::Running, Some(pty)) => pty.clone(),
                _ => return Err(TabError::DeadProcess(tab_id.to_string())),
            }
        };

        pty.write(data)
            .await
            .map_err(|_| TabError::DeadProcess(tab_id.to_string()))
    }

    /// Persisted topology for the HTTP API; falls back to the default.
    pub fn load_topology(&self, user_id: &str) -> TabTopology {
        self.store
            .load(user_id)
            .unwrap_or_else(TabTopology::default_topology)
    }

    pub fn save_topology(&self, user_id: &str, topology: &TabTopology) -> anyhow::Result<()> {
        self.store.save(user_id, topology)
    }

    fn spawn_tab_record(
        self: &Arc<Self>,
        session: &Arc<SessionHandle>,
        tab_id: String,
    ) -> (Tab, Result<(), TabError>) {
        let opts = SpawnOptions {
            shell: self.config.terminal.shell.clone(),
            cols: self.config.terminal.default_cols,
            rows: self.config.terminal.default_rows,
            replay_buffer_bytes: self.config.terminal.replay_buffer_bytes,
            output_channel_capacity: self.config.terminal.output_channel_capacity,
        };

        match PtyProcess::spawn(&opts) {
            Ok(pty) => {
                let pty = Arc::new(pty);
                let spawn_id = self.next_spawn_id.fetch_add(1, Ordering::Relaxed);
                self.spawn_exit_watcher(
                    session.clone(),
                    tab_id.clone(),
                    spawn_id,
                    pty.exit_watch(),
                );
                (
                    Tab {
                        id: tab_id,
                        state: TabState::Running,
                        pty: Some(pty),
                        cols: opts.cols,
                        rows: opts.rows,
                        exit_code: None,
                        spawn_id,
                    },
                    Ok(()),
                )
            }
            Err(e) => {
                tracing::error!(user = %session.user_id, tab = %tab_id, error = %e, "Spawn failed");
                (
                    Tab {
                        id: tab_id,
                        state: TabState::Failed,
                        pty: None,
                        cols: opts.cols,
                        rows: opts.rows,
                        exit_code: None,
                        spawn_id: 0,
                    },
                    Err(TabError::Spawn(SpawnError(e.to_string()))),
                )
            }
        }
    }

    /// Watch for process exit: mark the tab dead and tell the client. The
    /// spawn id guards against a tab that was closed and reopened meanwhile.
    fn spawn_exit_watcher(
        &self,
        session: Arc<SessionHandle>,
        tab_id: String,
        spawn_id: u64,
        mut exit_rx: watch::Receiver<Option<u32>>,
    ) {
        tokio::spawn(async move {
            loop {
                if exit_rx.borrow().is_some() {
                    break;
                }
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
            let code = (*exit_rx.borrow()).unwrap_or(0);

            let mut st = session.state.lock().await;
            let Some(tab) = st
                .tabs
                .iter_mut()
                .find(|t| t.id == tab_id && t.spawn_id == spawn_id)
            else {
                return;
            };
            if tab.state != TabState::Running {
                return;
            }
            tab.state = TabState::Dead;
            tab.exit_code = Some(code);
            tracing::info!(user = %session.user_id, tab = %tab_id, code, "PTY exited");

            if let Some(conn) = &st.conn {
                let _ = conn.outbound.try_send(ServerEvent::TabExit {
                    tab_id: tab_id.clone(),
                    code,
                });
            }
        });
    }

    /// Save topology while holding the session lock, so persistence is atomic
    /// with respect to concurrent open/close from the same user. An empty tab
    /// list is not persisted; the last non-empty topology survives.
    fn persist_locked(&self, st: &SessionState, user_id: &str) {
        if st.tabs.is_empty() {
            return;
        }
        let topo = TabTopology {
            tabs: st.tabs.iter().map(|t| t.id.clone()).collect(),
            active_tab: st
                .active_tab
                .clone()
                .unwrap_or_else(|| st.tabs[0].id.clone()),
        };
        if let Err(e) = self.store.save(user_id, &topo) {
            tracing::warn!(user = %user_id, error = %e, "Failed to persist tab topology");
        }
    }

    #[cfg(test)]
    pub async fn tab_geometry(
        &self,
        session: &Arc<SessionHandle>,
        tab_id: &str,
    ) -> Option<(u16, u16)> {
        let st = session.state.lock().await;
        st.tabs
            .iter()
            .find(|t| t.id == tab_id)
            .map(|t| (t.cols, t.rows))
    }

    #[cfg(test)]
    pub async fn tab_state(
        &self,
        session: &Arc<SessionHandle>,
        tab_id: &str,
    ) -> Option<TabState> {
        let st = session.state.lock().await;
        st.tabs.iter().find(|t| t.id == tab_id).map(|t| t.state)
    }
}
