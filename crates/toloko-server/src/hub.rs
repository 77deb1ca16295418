//! Connection registry.
//!
//! One task owns the table of live sessions and performs every registration
//! change and every fan-out, in the order commands arrive. Each session gets
//! a bounded mailbox; fan-out never waits on it. A session whose mailbox is
//! full (or already gone) is treated as a slow consumer and disconnected on
//! the spot, which runs the same offline/presence steps as a normal
//! unregister.

use std::collections::HashMap;
use std::fmt;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use toloko_shared::protocol::ServerEvent;
use toloko_shared::{ConversationId, UserId};

use crate::error::ServerError;
use crate::presence::PresenceTracker;
use crate::resolver::ConversationResolver;

/// Queued commands before callers start waiting on the registry loop.
const COMMAND_BUFFER: usize = 1024;

/// Identity of one live connection. A user may hold several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handed to a session when it joins the registry.
#[derive(Debug)]
pub struct Registration {
    pub session_id: SessionId,
    /// Events addressed to this session. Closed when the session leaves the
    /// registry for any reason.
    pub mailbox: mpsc::Receiver<ServerEvent>,
}

enum Command {
    Register {
        user: UserId,
        reply: oneshot::Sender<Registration>,
    },
    Unregister {
        session: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        event: ServerEvent,
    },
    SendToUsers {
        users: Vec<UserId>,
        exclude: Option<UserId>,
        event: ServerEvent,
        reply: oneshot::Sender<usize>,
    },
    SendToSession {
        session: SessionId,
        event: ServerEvent,
        reply: oneshot::Sender<bool>,
    },
    LiveCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Cloneable handle to the registry loop.
#[derive(Clone)]
pub struct Registry {
    commands: mpsc::Sender<Command>,
    resolver: ConversationResolver,
}

impl Registry {
    /// Start the registry loop.
    ///
    /// The returned handle completes once [`Registry::shutdown`] is called
    /// or every handle has been dropped.
    pub fn spawn(
        presence: PresenceTracker,
        resolver: ConversationResolver,
        mailbox_capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let state = RegistryLoop {
            sessions: HashMap::new(),
            mailbox_capacity: mailbox_capacity.max(1),
            presence,
        };
        let handle = tokio::spawn(state.run(rx));

        (
            Self {
                commands: tx,
                resolver,
            },
            handle,
        )
    }

    /// Add a session for `user`, mark the user online and tell every other
    /// live session.
    pub async fn register(&self, user: UserId) -> Result<Registration, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register { user, reply }).await?;
        rx.await.map_err(|_| ServerError::Unavailable)
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub async fn unregister(&self, session: SessionId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .send(Command::Unregister { session, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn broadcast(&self, event: ServerEvent) {
        if self.send(Command::Broadcast { event }).await.is_err() {
            debug!("registry stopped, broadcast dropped");
        }
    }

    /// Deliver to every live session of `user`. Returns the number of
    /// mailboxes that accepted the event.
    pub async fn send_to_user(&self, user: UserId, event: ServerEvent) -> usize {
        self.send_to_users(vec![user], None, event).await
    }

    /// Deliver to every live session of either participant of the
    /// conversation, skipping `exclude`.
    pub async fn send_to_conversation(
        &self,
        conversation: ConversationId,
        event: ServerEvent,
        exclude: Option<UserId>,
    ) -> Result<usize, ServerError> {
        let participants = self.resolver.participants(conversation).await?;
        Ok(self
            .send_to_users(participants.to_vec(), exclude, event)
            .await)
    }

    /// Deliver to exactly one session.
    pub async fn send_to_session(&self, session: SessionId, event: ServerEvent) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .send(Command::SendToSession {
                session,
                event,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Number of live sessions.
    pub async fn live_sessions(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::LiveCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Close every mailbox and stop the loop.
    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }

    async fn send_to_users(
        &self,
        users: Vec<UserId>,
        exclude: Option<UserId>,
        event: ServerEvent,
    ) -> usize {
        let (reply, rx) = oneshot::channel();
        let command = Command::SendToUsers {
            users,
            exclude,
            event,
            reply,
        };
        if self.send(command).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn send(&self, command: Command) -> Result<(), ServerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServerError::Unavailable)
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct LiveSession {
    user: UserId,
    mailbox: mpsc::Sender<ServerEvent>,
}

struct RegistryLoop {
    sessions: HashMap<SessionId, LiveSession>,
    mailbox_capacity: usize,
    presence: PresenceTracker,
}

impl RegistryLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("registry started");

        while let Some(command) = commands.recv().await {
            match command {
                Command::Register { user, reply } => self.register(user, reply).await,
                Command::Unregister { session, reply } => {
                    let removed = self.sessions.contains_key(&session);
                    if removed {
                        self.disconnect(session).await;
                    }
                    let _ = reply.send(removed);
                }
                Command::Broadcast { event } => {
                    let (_, slow) = self.fan_out(&event, |_, _| true);
                    self.evict(slow).await;
                }
                Command::SendToUsers {
                    users,
                    exclude,
                    event,
                    reply,
                } => {
                    let (delivered, slow) = self.fan_out(&event, |_, session| {
                        users.contains(&session.user) && Some(session.user) != exclude
                    });
                    let _ = reply.send(delivered);
                    self.evict(slow).await;
                }
                Command::SendToSession {
                    session,
                    event,
                    reply,
                } => {
                    let (delivered, slow) = self.fan_out(&event, |id, _| id == session);
                    let _ = reply.send(delivered > 0);
                    self.evict(slow).await;
                }
                Command::LiveCount { reply } => {
                    let _ = reply.send(self.sessions.len());
                }
                Command::Shutdown => break,
            }
        }

        // Sessions tearing down after this point find the loop gone, so
        // their users are marked offline here. Dropping the senders closes
        // every mailbox; writers send a close frame and exit.
        let remaining = self.sessions.len();
        for (id, session) in std::mem::take(&mut self.sessions) {
            drop(session.mailbox);
            if let Err(e) = self.presence.set_offline(session.user).await {
                warn!(session = %id, user = %session.user, error = %e, "failed to record presence");
            }
        }
        info!(sessions = remaining, "registry stopped");
    }

    async fn register(&mut self, user: UserId, reply: oneshot::Sender<Registration>) {
        let session_id = SessionId::new();
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);

        let registration = Registration {
            session_id,
            mailbox: rx,
        };
        if reply.send(registration).is_err() {
            // The caller went away before it could start.
            return;
        }

        self.sessions.insert(
            session_id,
            LiveSession {
                user,
                mailbox: tx,
            },
        );
        info!(
            session = %session_id,
            user = %user,
            sessions = self.sessions.len(),
            "session registered"
        );

        let last_seen = match self.presence.set_online(user).await {
            Ok(at) => at,
            Err(e) => {
                warn!(user = %user, error = %e, "failed to record presence");
                Utc::now()
            }
        };

        let event = ServerEvent::PresenceUpdate {
            user_id: user,
            is_online: true,
            last_seen,
        };
        let (_, slow) = self.fan_out(&event, |id, _| id != session_id);
        self.evict(slow).await;
    }

    /// Try to enqueue `event` on every session matching `filter`.
    ///
    /// Returns how many mailboxes accepted it and which sessions could not
    /// keep up.
    fn fan_out(
        &self,
        event: &ServerEvent,
        filter: impl Fn(SessionId, &LiveSession) -> bool,
    ) -> (usize, Vec<SessionId>) {
        let mut delivered = 0;
        let mut slow = Vec::new();

        for (&id, session) in &self.sessions {
            if !filter(id, session) {
                continue;
            }

            match session.mailbox.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        session = %id,
                        user = %session.user,
                        event = event.event_type(),
                        "mailbox full, disconnecting slow consumer"
                    );
                    slow.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session = %id, "mailbox closed, removing session");
                    slow.push(id);
                }
            }
        }

        (delivered, slow)
    }

    async fn evict(&mut self, slow: Vec<SessionId>) {
        for id in slow {
            self.disconnect(id).await;
        }
    }

    /// Remove a session and announce its user as offline.
    ///
    /// The announcement can itself overflow other mailboxes, so removals are
    /// processed as a worklist until nothing else falls behind.
    async fn disconnect(&mut self, first: SessionId) {
        let mut pending = vec![first];

        while let Some(id) = pending.pop() {
            let Some(session) = self.sessions.remove(&id) else {
                continue;
            };
            drop(session.mailbox);

            info!(
                session = %id,
                user = %session.user,
                sessions = self.sessions.len(),
                "session unregistered"
            );

            let last_seen = match self.presence.set_offline(session.user).await {
                Ok(at) => at,
                Err(e) => {
                    warn!(user = %session.user, error = %e, "failed to record presence");
                    Utc::now()
                }
            };

            let event = ServerEvent::PresenceUpdate {
                user_id: session.user,
                is_online: false,
                last_seen,
            };
            let (_, slow) = self.fan_out(&event, |_, _| true);
            pending.extend(slow);
        }
    }
}
