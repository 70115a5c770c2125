//! Per-session fan-out and cache write-back actor.
//!
//! ```text
//!                ┌────────────────────────────────────────┐
//!  ControlBlock  │            ChannelBroadcaster           │
//!  ───────────►  │ broadcast ─┐                            │
//!  (producers)   │ send ──────┼─► fan-out loop ─► sockets  │
//!                │ control ───┘                            │
//!                │ cache ───────► cache loop ──► PageCache │
//!                │ close ──────► both loops               │
//!                └────────────────────────────────────────┘
//! ```
//!
//! The two loops are independent tasks so a slow cache round-trip never
//! head-of-line-blocks user-visible delivery. Messages enqueued by one
//! producer are delivered in enqueue order (single consumer per loop);
//! no ordering holds between producers. Each delivery attempt runs
//! inside a catch_unwind boundary: a panicking or failing transport
//! write degrades to a logged warning for that one message.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use tabula_core::Stroke;

use crate::cache::PageCache;
use crate::protocol::Message;
use crate::session::{SessionError, SessionUsers};
use crate::transport::UserConnection;

/// Buffered messages per channel before producers back off.
const CHANNEL_CAPACITY: usize = 64;

/// What a broadcaster needs to serve one session: the id for cache keys,
/// the live membership view for just-in-time snapshots, and the cache
/// handle for the write-back loop.
#[derive(Clone)]
pub struct SessionBinding {
    pub session_id: String,
    pub users: Arc<SessionUsers>,
    pub cache: Arc<dyn PageCache>,
}

/// Fan-out capability owned by every control block. The broadcaster is
/// the only component allowed to write to user transports or schedule
/// cache writes.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Attach to a session and start both loops. At most once per
    /// instance.
    fn bind(&self, binding: SessionBinding) -> Result<(), SessionError>;

    /// Deliver to every connected user except the declared sender.
    async fn broadcast(&self, msg: Message);

    /// Deliver to exactly `msg.receiver`; an unknown receiver is a
    /// logged warning, not a failure.
    async fn send(&self, msg: Message);

    /// Ask the fan-out loop to close one user's transport.
    async fn control(&self, user_id: Uuid);

    /// Enqueue a stroke batch for asynchronous persistence.
    async fn cache(&self, strokes: Vec<Stroke>);

    /// Terminate both loops. Returns whether a running loop observed
    /// the signal — `false` means the broadcaster was never bound (or
    /// already stopped) and the caller must purge cache state itself.
    async fn close(&self) -> bool;
}

struct Receivers {
    broadcast_rx: mpsc::Receiver<Message>,
    send_rx: mpsc::Receiver<Message>,
    control_rx: mpsc::Receiver<Uuid>,
    cache_rx: mpsc::Receiver<Vec<Stroke>>,
}

/// Production [`Broadcaster`]: five mpsc/broadcast channels feeding two
/// tokio tasks.
pub struct ChannelBroadcaster {
    broadcast_tx: mpsc::Sender<Message>,
    send_tx: mpsc::Sender<Message>,
    control_tx: mpsc::Sender<Uuid>,
    cache_tx: mpsc::Sender<Vec<Stroke>>,
    close_tx: broadcast::Sender<()>,
    /// Consumer halves, taken exactly once by `bind`.
    receivers: Mutex<Option<Receivers>>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (send_tx, send_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (cache_tx, cache_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (close_tx, _) = broadcast::channel(1);
        Self {
            broadcast_tx,
            send_tx,
            control_tx,
            cache_tx,
            close_tx,
            receivers: Mutex::new(Some(Receivers {
                broadcast_rx,
                send_rx,
                control_rx,
                cache_rx,
            })),
        }
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    fn bind(&self, binding: SessionBinding) -> Result<(), SessionError> {
        let receivers = self
            .receivers
            .lock()
            .expect("broadcaster lock")
            .take()
            .ok_or(SessionError::AlreadyBound)?;

        tokio::spawn(fanout_loop(
            binding.clone(),
            receivers.broadcast_rx,
            receivers.send_rx,
            receivers.control_rx,
            self.close_tx.subscribe(),
        ));
        tokio::spawn(cache_loop(
            binding,
            receivers.cache_rx,
            self.close_tx.subscribe(),
        ));
        Ok(())
    }

    async fn broadcast(&self, msg: Message) {
        if self.broadcast_tx.send(msg).await.is_err() {
            log::debug!("broadcast channel closed; message dropped");
        }
    }

    async fn send(&self, msg: Message) {
        if self.send_tx.send(msg).await.is_err() {
            log::debug!("send channel closed; message dropped");
        }
    }

    async fn control(&self, user_id: Uuid) {
        if self.control_tx.send(user_id).await.is_err() {
            log::debug!("control channel closed; directive dropped");
        }
    }

    async fn cache(&self, strokes: Vec<Stroke>) {
        if self.cache_tx.send(strokes).await.is_err() {
            log::debug!("cache channel closed; batch dropped");
        }
    }

    async fn close(&self) -> bool {
        self.close_tx.send(()).is_ok()
    }
}

/// Deliver one envelope to one transport behind a recover boundary.
async fn deliver(user_id: Uuid, conn: &Arc<dyn UserConnection>, msg: &Message) {
    match AssertUnwindSafe(conn.send(msg)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("delivery to user {user_id} failed: {e}"),
        Err(_) => log::warn!("delivery to user {user_id} panicked"),
    }
}

async fn fanout_loop(
    binding: SessionBinding,
    mut broadcast_rx: mpsc::Receiver<Message>,
    mut send_rx: mpsc::Receiver<Message>,
    mut control_rx: mpsc::Receiver<Uuid>,
    mut close_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(msg) = broadcast_rx.recv() => {
                // Snapshot may be one membership change stale; a write to
                // a since-removed user fails harmlessly inside deliver().
                for (user_id, conn) in binding.users.connected_snapshot() {
                    if !msg.sender.is_empty() && user_id.to_string() == msg.sender {
                        continue;
                    }
                    deliver(user_id, &conn, &msg).await;
                }
            }
            Some(msg) = send_rx.recv() => {
                let target = msg
                    .receiver
                    .and_then(|uid| binding.users.connection(&uid).map(|conn| (uid, conn)));
                match target {
                    Some((user_id, conn)) => deliver(user_id, &conn, &msg).await,
                    None => log::warn!(
                        "no receiver for {:?} message in session {}",
                        msg.msg_type,
                        binding.session_id
                    ),
                }
            }
            Some(user_id) = control_rx.recv() => {
                match binding.users.connection(&user_id) {
                    Some(conn) => {
                        match AssertUnwindSafe(conn.close()).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                log::debug!("closing transport of user {user_id} failed: {e}")
                            }
                            Err(_) => log::warn!("closing transport of user {user_id} panicked"),
                        }
                    }
                    None => log::debug!("control: user {user_id} already gone"),
                }
            }
            _ = close_rx.recv() => break,
            else => break,
        }
    }
    log::debug!("fan-out loop of session {} stopped", binding.session_id);
}

async fn cache_loop(
    binding: SessionBinding,
    mut cache_rx: mpsc::Receiver<Vec<Stroke>>,
    mut close_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(batch) = cache_rx.recv() => {
                // At-most-once: a failed write is logged, never retried.
                // Joining users may briefly see less than what was
                // broadcast.
                if let Err(e) = binding.cache.update_strokes(&binding.session_id, &batch).await {
                    log::warn!(
                        "persisting {} strokes for session {} failed: {e}",
                        batch.len(),
                        binding.session_id
                    );
                }
            }
            _ = close_rx.recv() => {
                // The sole place session cache state is deleted.
                if let Err(e) = binding.cache.clear_session(&binding.session_id).await {
                    log::warn!("purging session {} failed: {e}", binding.session_id);
                }
                break;
            }
            else => break,
        }
    }
    log::debug!("cache loop of session {} stopped", binding.session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, PageCache};
    use crate::protocol::MessageType;
    use crate::transport::{ChannelConnection, TransportError};
    use tabula_core::{PageMeta, User};
    use tokio::time::{sleep, timeout, Duration};

    fn user(alias: &str) -> User {
        User::new(alias, "#aabbcc").unwrap()
    }

    fn bound_broadcaster(users: Arc<SessionUsers>) -> (ChannelBroadcaster, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let broadcaster = ChannelBroadcaster::new();
        broadcaster
            .bind(SessionBinding {
                session_id: "sess01".into(),
                users,
                cache: cache.clone(),
            })
            .unwrap();
        (broadcaster, cache)
    }

    fn connect(users: &SessionUsers, user: User) -> tokio::sync::mpsc::Receiver<Message> {
        let (conn, rx) = ChannelConnection::pair(16);
        users.add_ready(user.clone());
        users.promote(user.id, conn, 50).unwrap();
        rx
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let users = Arc::new(SessionUsers::default());
        let alice = user("alice01");
        let bob = user("bob001");
        let mut alice_rx = connect(&users, alice.clone());
        let mut bob_rx = connect(&users, bob.clone());

        let (broadcaster, _cache) = bound_broadcaster(users);
        let msg = Message::new(MessageType::Strokes, alice.id.to_string(), &Vec::<u8>::new())
            .unwrap();
        broadcaster.broadcast(msg).await;

        let got = timeout(Duration::from_secs(1), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.msg_type, MessageType::Strokes);

        // Alice never sees her own broadcast.
        assert!(timeout(Duration::from_millis(100), alice_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_send_targets_exactly_one_user() {
        let users = Arc::new(SessionUsers::default());
        let alice = user("alice01");
        let bob = user("bob001");
        let mut alice_rx = connect(&users, alice.clone());
        let mut bob_rx = connect(&users, bob.clone());

        let (broadcaster, _cache) = bound_broadcaster(users);
        let msg = Message::to_receiver(
            MessageType::UserHost,
            alice.id,
            &crate::protocol::HostSecret {
                secret: "s".into(),
            },
        )
        .unwrap();
        broadcaster.send(msg).await;

        let got = timeout(Duration::from_secs(1), alice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.msg_type, MessageType::UserHost);
        assert!(timeout(Duration::from_millis(100), bob_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_receiver_does_not_kill_loop() {
        let users = Arc::new(SessionUsers::default());
        let alice = user("alice01");
        let mut alice_rx = connect(&users, alice.clone());

        let (broadcaster, _cache) = bound_broadcaster(users);
        let ghost = Message::error_to(Uuid::new_v4(), "nobody home");
        broadcaster.send(ghost).await;

        // The loop is still alive and delivering.
        let msg = Message::error_to(alice.id, "still here");
        broadcaster.send(msg).await;
        let got = timeout(Duration::from_secs(1), alice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.msg_type, MessageType::Error);
    }

    /// Transport whose writes always panic.
    struct PanickingConnection;

    #[async_trait]
    impl UserConnection for PanickingConnection {
        async fn send(&self, _msg: &Message) -> Result<(), TransportError> {
            panic!("wire on fire");
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_transport_degrades_to_warning() {
        let users = Arc::new(SessionUsers::default());
        let bad = user("badwire");
        users.add_ready(bad.clone());
        users
            .promote(bad.id, Arc::new(PanickingConnection), 50)
            .unwrap();
        let good = user("goodwire");
        let mut good_rx = connect(&users, good.clone());

        let (broadcaster, _cache) = bound_broadcaster(users);
        let msg = Message::new(MessageType::UserSync, "", &Vec::<u8>::new()).unwrap();
        broadcaster.broadcast(msg).await;

        // The panic is contained; the healthy peer still gets delivery.
        let got = timeout(Duration::from_secs(1), good_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.msg_type, MessageType::UserSync);
    }

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let users = Arc::new(SessionUsers::default());
        let cache: Arc<dyn PageCache> = Arc::new(MemoryCache::new());
        let broadcaster = ChannelBroadcaster::new();
        let binding = SessionBinding {
            session_id: "sess01".into(),
            users,
            cache,
        };
        broadcaster.bind(binding.clone()).unwrap();
        assert!(matches!(
            broadcaster.bind(binding),
            Err(SessionError::AlreadyBound)
        ));
    }

    #[tokio::test]
    async fn test_cache_loop_persists_and_purges_on_close() {
        let users = Arc::new(SessionUsers::default());
        let (broadcaster, cache) = bound_broadcaster(users);

        cache
            .add_page("sess01", "pid1", 0, &PageMeta::default())
            .await
            .unwrap();
        let mut stroke = Stroke::deleted("st1", "pid1");
        stroke.stroke_type = 1;
        broadcaster.cache(vec![stroke]).await;

        // Write-back is asynchronous; give the loop a beat.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            cache.get_page_strokes("sess01", "pid1").await.unwrap().len(),
            1
        );

        assert!(broadcaster.close().await);
        sleep(Duration::from_millis(50)).await;
        assert!(cache.get_page_rank("sess01").await.unwrap().is_empty());

        // Second close finds no running loops.
        assert!(!broadcaster.close().await);
    }

    #[tokio::test]
    async fn test_close_unbound_returns_false() {
        let broadcaster = ChannelBroadcaster::new();
        assert!(!broadcaster.close().await);
    }
}
