//! The PTY capability consumed by connections, plus a local implementation
//! backed by `portable-pty`.
//!
//! Connections only ever see [`PtyWriter`]. [`PtyManager`] is the in-process
//! implementation used by the binary: it owns the PTY processes, forwards
//! input to them and publishes their output through the [`Hub`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::hub::Hub;

/// Pending input chunks buffered per PTY before writes are refused.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Size of each read from the PTY master.
const READ_CHUNK: usize = 4096;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("pty session not found: {0}")]
    NotFound(String),

    #[error("pty session already exists: {0}")]
    AlreadyExists(String),

    #[error("pty input is backed up for session {0}")]
    InputBackpressure(String),

    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("failed to kill pty child: {0}")]
    Kill(#[from] std::io::Error),
}

/// Forwarding capability for terminal input and control.
pub trait PtyWriter: Send + Sync {
    fn write_pty(&self, session_id: &str, data: &[u8]) -> Result<(), PtyError>;
    fn resize_pty(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), PtyError>;
    fn kill_pty(&self, session_id: &str) -> Result<(), PtyError>;
}

/// Public description of a running PTY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PtyInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
}

struct PtySession {
    generation: Uuid,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    input_tx: mpsc::Sender<Bytes>,
    pid: Option<u32>,
    cols: u16,
    rows: u16,
}

impl PtySession {
    fn info(&self, id: &str) -> PtyInfo {
        PtyInfo {
            id: id.to_string(),
            pid: self.pid,
            cols: self.cols,
            rows: self.rows,
        }
    }
}

/// Owns local PTY processes keyed by session id.
#[derive(Clone)]
pub struct PtyManager {
    sessions: Arc<Mutex<HashMap<String, PtySession>>>,
    hub: Hub,
    shell: Option<String>,
}

impl std::fmt::Debug for PtyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyManager")
            .field("sessions", &self.sessions.lock().len())
            .field("shell", &self.shell)
            .finish()
    }
}

impl PtyManager {
    /// `shell` overrides `$SHELL`; `/bin/sh` is the last resort.
    pub fn new(hub: Hub, shell: Option<String>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            hub,
            shell,
        }
    }

    fn build_command(&self) -> CommandBuilder {
        let shell = self
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let mut cmd = CommandBuilder::new(&shell);
        cmd.env(
            "TERM",
            std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
        );
        cmd
    }

    /// Start a shell in a new PTY. A missing `id` gets a random one.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(&self, id: Option<String>, cols: u16, rows: u16) -> Result<PtyInfo, PtyError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.sessions.lock().contains_key(&id) {
            return Err(PtyError::AlreadyExists(id));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::OpenPty)?;
        let mut child = pair
            .slave
            .spawn_command(self.build_command())
            .map_err(PtyError::SpawnCommand)?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;
        let killer = child.clone_killer();
        let pid = child.process_id();
        let generation = Uuid::new_v4();
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);

        let session = PtySession {
            generation,
            master: pair.master,
            killer,
            input_tx,
            pid,
            cols,
            rows,
        };
        let info = {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&id) {
                drop(sessions);
                drop(session);
                discard_child(id.clone(), child);
                return Err(PtyError::AlreadyExists(id));
            }
            let info = session.info(&id);
            sessions.insert(id.clone(), session);
            info
        };

        let runtime = tokio::runtime::Handle::current();

        // Output: every chunk goes through the hub so ordering per session is kept.
        let hub = self.hub.clone();
        let reader_id = id.clone();
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        runtime.block_on(hub.broadcast(&reader_id, data));
                    }
                    Err(_) => break,
                }
            }
            tracing::debug!(session = %reader_id, "pty reader finished");
        });

        tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            let mut rx = input_rx;
            while let Some(data) = rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        let sessions = self.sessions.clone();
        let exit_id = id.clone();
        tokio::task::spawn_blocking(move || {
            match child.wait() {
                Ok(status) => tracing::info!(session = %exit_id, ?status, "pty child exited"),
                Err(e) => tracing::error!(session = %exit_id, ?e, "error waiting for pty child"),
            }
            let mut sessions = sessions.lock();
            if sessions
                .get(&exit_id)
                .is_some_and(|s| s.generation == generation)
            {
                sessions.remove(&exit_id);
            }
        });

        tracing::info!(session = %id, ?pid, cols, rows, "pty spawned");
        Ok(info)
    }

    pub fn list(&self) -> Vec<PtyInfo> {
        let mut list: Vec<PtyInfo> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, s)| s.info(id))
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn get(&self, id: &str) -> Option<PtyInfo> {
        self.sessions.lock().get(id).map(|s| s.info(id))
    }
}

/// Kill a child that lost the race for its id and reap it off the runtime.
fn discard_child(
    id: String,
    mut child: Box<dyn Child + Send + Sync>,
) -> tokio::task::JoinHandle<()> {
    if let Err(e) = child.kill() {
        tracing::debug!(session = %id, ?e, "failed to kill discarded pty child");
    }
    tokio::task::spawn_blocking(move || {
        if let Err(e) = child.wait() {
            tracing::debug!(session = %id, ?e, "error reaping discarded pty child");
        }
    })
}

impl PtyWriter for PtyManager {
    fn write_pty(&self, session_id: &str, data: &[u8]) -> Result<(), PtyError> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| PtyError::NotFound(session_id.to_string()))?;
        session
            .input_tx
            .try_send(Bytes::copy_from_slice(data))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    PtyError::InputBackpressure(session_id.to_string())
                }
                mpsc::error::TrySendError::Closed(_) => PtyError::NotFound(session_id.to_string()),
            })
    }

    fn resize_pty(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), PtyError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| PtyError::NotFound(session_id.to_string()))?;
        session
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)?;
        session.cols = cols;
        session.rows = rows;
        Ok(())
    }

    fn kill_pty(&self, session_id: &str) -> Result<(), PtyError> {
        let mut session = self
            .sessions
            .lock()
            .remove(session_id)
            .ok_or_else(|| PtyError::NotFound(session_id.to_string()))?;
        session.killer.kill()?;
        tracing::info!(session = %session_id, "pty killed");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> (Hub, PtyManager) {
        let hub = Hub::spawn();
        let manager = PtyManager::new(hub.clone(), Some("/bin/sh".to_string()));
        (hub, manager)
    }

    #[tokio::test]
    async fn spawned_output_reaches_hub() {
        let (hub, manager) = manager();
        let mut reg = hub.register("shell-1").await.unwrap();
        manager.spawn(Some("shell-1".into()), 80, 24).unwrap();

        manager.write_pty("shell-1", b"echo pty-marker\n").unwrap();

        let mut output = Vec::new();
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = reg.outbound.recv().await {
                output.extend_from_slice(&chunk);
                if String::from_utf8_lossy(&output).contains("pty-marker") {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found, "expected echoed marker in pty output");

        manager.kill_pty("shell-1").unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn discarded_child_is_reaped() {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .unwrap();
        let mut cmd = CommandBuilder::new("sleep");
        cmd.arg("30");
        let child = pair.slave.spawn_command(cmd).unwrap();
        let pid = child.process_id().unwrap();

        tokio::time::timeout(Duration::from_secs(5), discard_child("lost".into(), child))
            .await
            .expect("child should exit after kill")
            .unwrap();

        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let (_hub, manager) = manager();
        manager.spawn(Some("dup".into()), 80, 24).unwrap();
        assert!(matches!(
            manager.spawn(Some("dup".into()), 80, 24),
            Err(PtyError::AlreadyExists(_))
        ));
        manager.kill_pty("dup").unwrap();
    }

    #[tokio::test]
    async fn resize_updates_info() {
        let (_hub, manager) = manager();
        manager.spawn(Some("r".into()), 80, 24).unwrap();
        manager.resize_pty("r", 120, 40).unwrap();
        let info = manager.get("r").unwrap();
        assert_eq!((info.cols, info.rows), (120, 40));
        manager.kill_pty("r").unwrap();
    }

    #[tokio::test]
    async fn unknown_session_errors() {
        let (_hub, manager) = manager();
        assert!(matches!(manager.write_pty("nope", b"x"), Err(PtyError::NotFound(_))));
        assert!(matches!(manager.resize_pty("nope", 1, 1), Err(PtyError::NotFound(_))));
        assert!(matches!(manager.kill_pty("nope"), Err(PtyError::NotFound(_))));
    }

    #[tokio::test]
    async fn kill_removes_from_list() {
        let (_hub, manager) = manager();
        manager.spawn(Some("k".into()), 80, 24).unwrap();
        assert_eq!(manager.list().len(), 1);
        manager.kill_pty("k").unwrap();
        assert!(manager.list().is_empty());
    }
}
