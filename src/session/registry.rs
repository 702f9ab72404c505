//! Identity → session map owned by a single coordinator task.
//!
//! Callers never touch the map. They send commands over a channel and the
//! coordinator applies them one at a time, so every add, remove and lookup
//! observes a total order. At most one session is registered per identity.
//!
//! The coordinator never awaits connection I/O. Evicted sessions are marked
//! destroyed synchronously and their connections close in the background.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::session::Session;

enum Command {
    Add {
        session: Arc<Session>,
        done: oneshot::Sender<Option<Arc<Session>>>,
    },
    Remove {
        session: Arc<Session>,
    },
    Get {
        user_id: u64,
        reply: oneshot::Sender<Option<Arc<Session>>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the coordinator. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionRegistry {
    /// Start the coordinator on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(coordinate(rx));
        Self { tx }
    }

    fn stopped() -> ProtocolError {
        ProtocolError::Custom(constants::ERR_REGISTRY_STOPPED.to_string())
    }

    /// Install an authenticated session, destroying any prior session for
    /// the same identity first. Returns the evicted session, if any.
    ///
    /// A session that is already destroyed is not installed.
    pub async fn add(&self, session: Arc<Session>) -> Result<Option<Arc<Session>>> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Add { session, done })
            .map_err(|_| Self::stopped())?;
        wait.await.map_err(|_| Self::stopped())
    }

    /// Remove `session` if it is still the one registered for its identity.
    ///
    /// Never blocks, so it is safe to call from teardown paths running inside
    /// the coordinator.
    pub fn remove(&self, session: &Arc<Session>) {
        if self
            .tx
            .send(Command::Remove {
                session: session.clone(),
            })
            .is_err()
        {
            debug!(session = session.id(), "Registry stopped; remove ignored");
        }
    }

    pub async fn get(&self, user_id: u64) -> Option<Arc<Session>> {
        let (reply, wait) = oneshot::channel();
        self.tx.send(Command::Get { user_id, reply }).ok()?;
        wait.await.ok().flatten()
    }

    pub async fn count(&self) -> usize {
        let (reply, wait) = oneshot::channel();
        if self.tx.send(Command::Count { reply }).is_err() {
            return 0;
        }
        wait.await.unwrap_or(0)
    }

    /// Destroy every registered session and stop the coordinator.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Shutdown { done }).is_ok() {
            let _ = wait.await;
        }
    }
}

async fn coordinate(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut sessions: HashMap<u64, Arc<Session>> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Add { session, done } => {
                let evicted = install(&mut sessions, session);
                let _ = done.send(evicted);
            }
            Command::Remove { session } => {
                let user_id = session.user_id();
                let is_current = sessions
                    .get(&user_id)
                    .is_some_and(|current| current.id() == session.id());
                if is_current {
                    sessions.remove(&user_id);
                    debug!(user_id, session = session.id(), "Session unregistered");
                }
            }
            Command::Get { user_id, reply } => {
                let _ = reply.send(sessions.get(&user_id).cloned());
            }
            Command::Count { reply } => {
                let _ = reply.send(sessions.len());
            }
            Command::Shutdown { done } => {
                info!(sessions = sessions.len(), "Registry shutting down");
                for (_, session) in sessions.drain() {
                    session.destroy_detached();
                }
                let _ = done.send(());
                return;
            }
        }
    }
}

fn install(
    sessions: &mut HashMap<u64, Arc<Session>>,
    session: Arc<Session>,
) -> Option<Arc<Session>> {
    let user_id = session.user_id();
    if user_id == 0 {
        warn!(session = session.id(), "Refusing to register unauthenticated session");
        return None;
    }
    if session.is_destroyed() {
        debug!(session = session.id(), "Session destroyed before registration");
        return None;
    }

    let evicted = match sessions.remove(&user_id) {
        Some(previous) if previous.id() != session.id() => {
            info!(
                user_id,
                evicted = previous.id(),
                replacement = session.id(),
                "Duplicate login, evicting previous session"
            );
            previous.destroy_detached();
            Some(previous)
        }
        _ => None,
    };

    debug!(user_id, session = session.id(), "Session registered");
    sessions.insert(user_id, session);
    evicted
}
