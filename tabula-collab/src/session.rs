//! Session control block: the single source of truth for one session.
//!
//! A [`ControlBlock`] owns the session configuration, the membership
//! maps, and the in-memory page-id set backing stroke sanitation. It is
//! driven from two sides: the handler boundary calls the [`Controller`]
//! surface, and each connected user's read path feeds inbound envelopes
//! into [`Controller::receive`]. Everything user-visible leaves through
//! the broadcaster — the control block never writes to a transport
//! itself.
//!
//! Membership lives in two independent read-write locks (*ready* and
//! *connected*) so kick/update traffic never contends with the hot
//! disconnect path. `receive` blocks only on these locks, never on I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use serde::{Deserialize, Serialize};
use tabula_core::user::{validate_alias, validate_color};
use tabula_core::{Page, Stroke, User, UserError};

use crate::attachment::{AttachmentStore, MemoryAttachmentStore};
use crate::broadcast::{Broadcaster, ChannelBroadcaster, SessionBinding};
use crate::cache::{CacheError, PageCache};
use crate::config::{ConfigUpdate, SessionConfig};
use crate::dispatch::Dispatcher;
use crate::pages::{PageInsert, PageTarget};
use crate::protocol::{
    HostSecret, KickNotice, Message, MessageType, PageSync, ProtocolError, UserEntry,
    SERVER_SENDER,
};
use crate::transport::UserConnection;

/// Session-level error taxonomy. Every variant is distinguishable so
/// the handler boundary can map it to a specific client-visible code.
#[derive(Debug, Clone)]
pub enum SessionError {
    InvalidAlias,
    InvalidColor,
    InvalidConfig(String),
    UnknownUpdateOperation(String),
    UnknownMessageType,
    BadContent(String),
    MaxUsersReached,
    WrongPassword,
    ReadOnlySession,
    UnknownSession(String),
    UnknownUser(Uuid),
    PageNotFound(String),
    PageAlreadyExists(String),
    AlreadyConnected(Uuid),
    NotReady(Uuid),
    AlreadyBound,
    MissingCollaborator(&'static str),
    Cache(CacheError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAlias => write!(f, "invalid alias"),
            Self::InvalidColor => write!(f, "invalid color"),
            Self::InvalidConfig(e) => write!(f, "invalid configuration: {e}"),
            Self::UnknownUpdateOperation(op) => write!(f, "unknown page update operation: {op}"),
            Self::UnknownMessageType => write!(f, "message type not recognized"),
            Self::BadContent(e) => write!(f, "bad message content: {e}"),
            Self::MaxUsersReached => write!(f, "maximum number of users reached"),
            Self::WrongPassword => write!(f, "wrong password"),
            Self::ReadOnlySession => write!(f, "session is read-only"),
            Self::UnknownSession(id) => write!(f, "unknown session: {id}"),
            Self::UnknownUser(id) => write!(f, "unknown user: {id}"),
            Self::PageNotFound(pid) => write!(f, "unknown page: {pid}"),
            Self::PageAlreadyExists(pid) => write!(f, "page already exists: {pid}"),
            Self::AlreadyConnected(id) => write!(f, "user already connected: {id}"),
            Self::NotReady(id) => write!(f, "user not ready to join: {id}"),
            Self::AlreadyBound => write!(f, "broadcaster already bound"),
            Self::MissingCollaborator(name) => write!(f, "missing collaborator: {name}"),
            Self::Cache(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<UserError> for SessionError {
    fn from(e: UserError) -> Self {
        match e {
            UserError::InvalidAlias => SessionError::InvalidAlias,
            UserError::InvalidColor => SessionError::InvalidColor,
        }
    }
}

impl From<CacheError> for SessionError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::PageNotFound(pid) => SessionError::PageNotFound(pid),
            other => SessionError::Cache(other),
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::BadContent(e.to_string())
    }
}

/// Pre-join registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    pub alias: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Mutable identity fields, revalidated on update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserUpdate {
    pub alias: String,
    pub color: String,
}

/// A user holding a live connection.
#[derive(Clone)]
pub struct ConnectedUser {
    pub user: User,
    pub conn: Arc<dyn UserConnection>,
}

/// Shared membership view: *ready* registrations and *connected* users.
/// The broadcaster reads this directly for its just-in-time snapshots,
/// so it lives behind an `Arc` rather than inside the control block.
#[derive(Default)]
pub struct SessionUsers {
    ready: RwLock<HashMap<Uuid, User>>,
    connected: RwLock<HashMap<Uuid, ConnectedUser>>,
}

impl SessionUsers {
    pub fn num_connected(&self) -> usize {
        self.connected.read().expect("connected lock").len()
    }

    /// Snapshot of connected users. May be one membership change stale
    /// by the time it is used; a write to a gone user fails harmlessly.
    pub fn connected_snapshot(&self) -> Vec<(Uuid, Arc<dyn UserConnection>)> {
        self.connected
            .read()
            .expect("connected lock")
            .iter()
            .map(|(id, cu)| (*id, cu.conn.clone()))
            .collect()
    }

    pub fn connection(&self, user_id: &Uuid) -> Option<Arc<dyn UserConnection>> {
        self.connected
            .read()
            .expect("connected lock")
            .get(user_id)
            .map(|cu| cu.conn.clone())
    }

    pub(crate) fn add_ready(&self, user: User) {
        self.ready.write().expect("ready lock").insert(user.id, user);
    }

    pub(crate) fn ready_user(&self, user_id: &Uuid) -> Option<User> {
        self.ready.read().expect("ready lock").get(user_id).cloned()
    }

    pub(crate) fn is_connected(&self, user_id: &Uuid) -> bool {
        self.connected
            .read()
            .expect("connected lock")
            .contains_key(user_id)
    }

    /// Promote ready → connected. Returns the user plus whether this was
    /// the 0→1 transition. The count can never exceed `max_users`: the
    /// capacity check happens under the same lock as the insert.
    pub(crate) fn promote(
        &self,
        user_id: Uuid,
        conn: Arc<dyn UserConnection>,
        max_users: usize,
    ) -> Result<(User, bool), SessionError> {
        let mut connected = self.connected.write().expect("connected lock");
        if connected.contains_key(&user_id) {
            return Err(SessionError::AlreadyConnected(user_id));
        }
        if connected.len() >= max_users {
            return Err(SessionError::MaxUsersReached);
        }
        let user = self
            .ready
            .write()
            .expect("ready lock")
            .remove(&user_id)
            .ok_or(SessionError::NotReady(user_id))?;
        connected.insert(
            user_id,
            ConnectedUser {
                user: user.clone(),
                conn,
            },
        );
        Ok((user, connected.len() == 1))
    }

    /// Remove a connected user; returns the user and the remaining count
    /// observed under the same lock.
    pub(crate) fn remove_connected(&self, user_id: &Uuid) -> (Option<User>, usize) {
        let mut connected = self.connected.write().expect("connected lock");
        let removed = connected.remove(user_id).map(|cu| cu.user);
        (removed, connected.len())
    }

    pub(crate) fn forget_ready(&self, user_id: &Uuid) -> bool {
        self.ready
            .write()
            .expect("ready lock")
            .remove(user_id)
            .is_some()
    }

    pub(crate) fn update(&self, user_id: Uuid, update: &UserUpdate) -> Result<(), SessionError> {
        if let Some(cu) = self
            .connected
            .write()
            .expect("connected lock")
            .get_mut(&user_id)
        {
            cu.user.alias = update.alias.clone();
            cu.user.color = update.color.clone();
            return Ok(());
        }
        if let Some(user) = self.ready.write().expect("ready lock").get_mut(&user_id) {
            user.alias = update.alias.clone();
            user.color = update.color.clone();
            return Ok(());
        }
        Err(SessionError::UnknownUser(user_id))
    }

    pub(crate) fn entries(&self) -> Vec<UserEntry> {
        let mut entries: Vec<UserEntry> = self
            .connected
            .read()
            .expect("connected lock")
            .values()
            .map(|cu| UserEntry::from_user(&cu.user, true))
            .collect();
        entries.extend(
            self.ready
                .read()
                .expect("ready lock")
                .values()
                .map(|user| UserEntry::from_user(user, false)),
        );
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }
}

/// Collaborators for [`ControlBlock::create`]. `cache` and `dispatcher`
/// are required; `broadcaster` and `attachments` get defaults.
pub struct SessionParams {
    pub config: SessionConfig,
    pub cache: Option<Arc<dyn PageCache>>,
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
    pub broadcaster: Option<Arc<dyn Broadcaster>>,
    pub attachments: Option<Arc<dyn AttachmentStore>>,
}

/// Handler-facing surface of one session. This is the complete boundary
/// the routing layer is allowed to call.
#[async_trait]
pub trait Controller: Send + Sync {
    fn config(&self) -> SessionConfig;
    async fn set_config(&self, update: ConfigUpdate) -> Result<(), SessionError>;

    /// Host/secret check for privileged requests. Never logs the secret.
    fn is_host(&self, user_id: Uuid, secret: &str) -> bool;

    fn register_user(&self, req: UserRequest) -> Result<User, SessionError>;

    /// Pure guard used before upgrading a transport connection.
    fn user_can_join(&self, user_id: Uuid) -> Result<(), SessionError>;

    async fn connect_user(
        &self,
        user_id: Uuid,
        conn: Arc<dyn UserConnection>,
    ) -> Result<(), SessionError>;

    async fn disconnect_user(&self, user_id: Uuid);
    async fn kick_user(&self, user_id: Uuid) -> Result<(), SessionError>;
    async fn update_user(&self, user_id: Uuid, update: UserUpdate) -> Result<(), SessionError>;

    /// Entry point for all inbound protocol traffic.
    async fn receive(&self, msg: Message, sender_id: Uuid) -> Result<(), SessionError>;

    async fn add_pages(&self, inserts: Vec<PageInsert>) -> Result<(), SessionError>;
    async fn update_pages(
        &self,
        targets: Vec<PageTarget>,
        operation: &str,
    ) -> Result<(), SessionError>;
    async fn get_page(&self, page_id: &str) -> Result<Page, SessionError>;
    async fn get_page_sync(
        &self,
        page_ids: &[String],
        with_strokes: bool,
    ) -> Result<PageSync, SessionError>;
    async fn sync_session(&self, snapshot: PageSync) -> Result<(), SessionError>;

    fn users(&self) -> Vec<UserEntry>;
    fn num_users(&self) -> usize;
    fn broadcaster(&self) -> Arc<dyn Broadcaster>;
    fn attachments(&self) -> Arc<dyn AttachmentStore>;
}

/// Production [`Controller`] implementation.
pub struct ControlBlock {
    pub(crate) config: RwLock<SessionConfig>,
    pub(crate) users: Arc<SessionUsers>,
    /// Page ids known to this session; backs stroke sanitation without
    /// touching the cache.
    pub(crate) pages: RwLock<HashSet<String>>,
    pub(crate) cache: Arc<dyn PageCache>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) broadcaster: Arc<dyn Broadcaster>,
    pub(crate) attachments: Arc<dyn AttachmentStore>,
}

impl ControlBlock {
    /// Build a control block from its collaborators. Fails when `cache`
    /// or `dispatcher` is absent; defaults the rest.
    pub fn create(params: SessionParams) -> Result<Arc<Self>, SessionError> {
        let cache = params
            .cache
            .ok_or(SessionError::MissingCollaborator("cache"))?;
        let dispatcher = params
            .dispatcher
            .ok_or(SessionError::MissingCollaborator("dispatcher"))?;
        let broadcaster = params
            .broadcaster
            .unwrap_or_else(|| Arc::new(ChannelBroadcaster::new()));
        let attachments = params
            .attachments
            .unwrap_or_else(|| Arc::new(MemoryAttachmentStore::new()));
        Ok(Arc::new(Self {
            config: RwLock::new(params.config),
            users: Arc::new(SessionUsers::default()),
            pages: RwLock::new(HashSet::new()),
            cache,
            dispatcher,
            broadcaster,
            attachments,
        }))
    }

    pub(crate) fn id(&self) -> String {
        self.config.read().expect("config lock").id.clone()
    }

    fn max_users(&self) -> usize {
        self.config.read().expect("config lock").max_users as usize
    }

    async fn receive_strokes(&self, msg: &Message, sender_id: Uuid) -> Result<(), SessionError> {
        let strokes: Vec<Stroke> = msg.decode_content()?;
        {
            let config = self.config.read().expect("config lock");
            if config.read_only && config.host != Some(sender_id) {
                return Err(SessionError::ReadOnlySession);
            }
        }

        let accepted: Vec<Stroke> = {
            let pages = self.pages.read().expect("pages lock");
            strokes
                .into_iter()
                .filter(|stroke| {
                    let valid = stroke.user_id == sender_id && pages.contains(&stroke.page_id);
                    if !valid {
                        log::debug!(
                            "dropping stroke {} from user {sender_id}: foreign owner or unknown page",
                            stroke.id
                        );
                    }
                    valid
                })
                .collect()
        };
        if accepted.is_empty() {
            return Ok(());
        }

        let out = Message::new(MessageType::Strokes, sender_id.to_string(), &accepted)?;
        self.broadcaster.broadcast(out).await;
        self.broadcaster.cache(accepted).await;
        Ok(())
    }
}

#[async_trait]
impl Controller for ControlBlock {
    fn config(&self) -> SessionConfig {
        self.config.read().expect("config lock").clone()
    }

    async fn set_config(&self, update: ConfigUpdate) -> Result<(), SessionError> {
        let config = {
            let mut config = self.config.write().expect("config lock");
            config.apply(&update)?;
            config.clone()
        };
        let msg = Message::new(MessageType::SessionConfig, SERVER_SENDER, &config)?;
        self.broadcaster.broadcast(msg).await;
        Ok(())
    }

    fn is_host(&self, user_id: Uuid, secret: &str) -> bool {
        let config = self.config.read().expect("config lock");
        config.host == Some(user_id) && !secret.is_empty() && config.secret == secret
    }

    fn register_user(&self, req: UserRequest) -> Result<User, SessionError> {
        validate_alias(&req.alias)?;
        validate_color(&req.color)?;
        {
            let config = self.config.read().expect("config lock");
            if let Some(ref password) = config.password {
                if req.password.as_deref() != Some(password.as_str()) {
                    return Err(SessionError::WrongPassword);
                }
            }
        }
        if self.users.num_connected() >= self.max_users() {
            return Err(SessionError::MaxUsersReached);
        }

        let user = User::new(req.alias, req.color)?;
        {
            // The first user ever registered becomes the host.
            let mut config = self.config.write().expect("config lock");
            if config.host.is_none() {
                config.host = Some(user.id);
            }
        }
        self.users.add_ready(user.clone());
        Ok(user)
    }

    fn user_can_join(&self, user_id: Uuid) -> Result<(), SessionError> {
        if self.users.is_connected(&user_id) {
            return Err(SessionError::AlreadyConnected(user_id));
        }
        if self.users.ready_user(&user_id).is_none() {
            return Err(SessionError::NotReady(user_id));
        }
        if self.users.num_connected() >= self.max_users() {
            return Err(SessionError::MaxUsersReached);
        }
        Ok(())
    }

    async fn connect_user(
        &self,
        user_id: Uuid,
        conn: Arc<dyn UserConnection>,
    ) -> Result<(), SessionError> {
        let (user, first) = self.users.promote(user_id, conn, self.max_users())?;

        if first {
            self.broadcaster.bind(SessionBinding {
                session_id: self.id(),
                users: self.users.clone(),
                cache: self.cache.clone(),
            })?;
        }

        let msg = Message::new(MessageType::UserConnected, user_id.to_string(), &user)?;
        self.broadcaster.broadcast(msg).await;

        let (host, secret) = {
            let config = self.config.read().expect("config lock");
            (config.host, config.secret.clone())
        };
        if host == Some(user_id) {
            let msg = Message::to_receiver(MessageType::UserHost, user_id, &HostSecret { secret })?;
            self.broadcaster.send(msg).await;
        }
        Ok(())
    }

    async fn disconnect_user(&self, user_id: Uuid) {
        let (removed, remaining) = self.users.remove_connected(&user_id);
        let Some(user) = removed else {
            log::warn!("disconnect for unknown user {user_id}");
            return;
        };

        if remaining == 0 {
            // Last one out turns off the lights: the dispatcher tears the
            // whole session down, purging cache state on the way.
            if let Err(e) = self.dispatcher.close_session(&self.id()).await {
                log::warn!("closing drained session {} failed: {e}", self.id());
            }
            return;
        }

        match Message::new(MessageType::UserDisconnected, user_id.to_string(), &user) {
            Ok(msg) => self.broadcaster.broadcast(msg).await,
            Err(e) => log::warn!("user-disconnected broadcast failed: {e}"),
        }
        self.broadcaster.control(user_id).await;
    }

    async fn kick_user(&self, user_id: Uuid) -> Result<(), SessionError> {
        let was_ready = self.users.forget_ready(&user_id);
        if !was_ready && !self.users.is_connected(&user_id) {
            return Err(SessionError::UnknownUser(user_id));
        }

        let msg = Message::to_receiver(MessageType::UserKick, user_id, &KickNotice { user_id })?;
        self.broadcaster.send(msg).await;
        self.broadcaster.control(user_id).await;
        Ok(())
    }

    async fn update_user(&self, user_id: Uuid, update: UserUpdate) -> Result<(), SessionError> {
        validate_alias(&update.alias)?;
        validate_color(&update.color)?;
        self.users.update(user_id, &update)?;

        let msg = Message::new(MessageType::UserSync, SERVER_SENDER, &self.users.entries())?;
        self.broadcaster.broadcast(msg).await;
        Ok(())
    }

    async fn receive(&self, msg: Message, sender_id: Uuid) -> Result<(), SessionError> {
        match msg.msg_type {
            MessageType::Strokes => self.receive_strokes(&msg, sender_id).await,
            _ => Err(SessionError::UnknownMessageType),
        }
    }

    async fn add_pages(&self, inserts: Vec<PageInsert>) -> Result<(), SessionError> {
        self.add_pages_impl(inserts).await
    }

    async fn update_pages(
        &self,
        targets: Vec<PageTarget>,
        operation: &str,
    ) -> Result<(), SessionError> {
        self.update_pages_impl(targets, operation).await
    }

    async fn get_page(&self, page_id: &str) -> Result<Page, SessionError> {
        self.get_page_impl(page_id).await
    }

    async fn get_page_sync(
        &self,
        page_ids: &[String],
        with_strokes: bool,
    ) -> Result<PageSync, SessionError> {
        self.assemble_pages(page_ids, with_strokes).await
    }

    async fn sync_session(&self, snapshot: PageSync) -> Result<(), SessionError> {
        self.sync_session_impl(snapshot).await
    }

    fn users(&self) -> Vec<UserEntry> {
        self.users.entries()
    }

    fn num_users(&self) -> usize {
        self.users.num_connected()
    }

    fn broadcaster(&self) -> Arc<dyn Broadcaster> {
        self.broadcaster.clone()
    }

    fn attachments(&self) -> Arc<dyn AttachmentStore> {
        self.attachments.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::dispatch::SessionDispatcher;
    use crate::transport::ChannelConnection;

    fn control_block() -> Arc<ControlBlock> {
        let cache: Arc<dyn PageCache> = Arc::new(MemoryCache::new());
        let dispatcher = SessionDispatcher::new(cache.clone());
        ControlBlock::create(SessionParams {
            config: SessionConfig::new("sess01", "topsecret"),
            cache: Some(cache),
            dispatcher: Some(dispatcher),
            broadcaster: None,
            attachments: None,
        })
        .unwrap()
    }

    fn request(alias: &str) -> UserRequest {
        UserRequest {
            alias: alias.into(),
            color: "#102030".into(),
            password: None,
        }
    }

    #[test]
    fn test_create_requires_cache_and_dispatcher() {
        let cache: Arc<dyn PageCache> = Arc::new(MemoryCache::new());
        let dispatcher = SessionDispatcher::new(cache.clone());

        let missing_cache = ControlBlock::create(SessionParams {
            config: SessionConfig::new("sess01", "s"),
            cache: None,
            dispatcher: Some(dispatcher.clone()),
            broadcaster: None,
            attachments: None,
        });
        assert!(matches!(
            missing_cache,
            Err(SessionError::MissingCollaborator("cache"))
        ));

        let missing_dispatcher = ControlBlock::create(SessionParams {
            config: SessionConfig::new("sess01", "s"),
            cache: Some(cache),
            dispatcher: None,
            broadcaster: None,
            attachments: None,
        });
        assert!(matches!(
            missing_dispatcher,
            Err(SessionError::MissingCollaborator("dispatcher"))
        ));
    }

    #[test]
    fn test_first_registered_user_becomes_host() {
        let scb = control_block();
        let first = scb.register_user(request("alice01")).unwrap();
        assert_eq!(scb.config().host, Some(first.id));

        let second = scb.register_user(request("bob001")).unwrap();
        assert_eq!(scb.config().host, Some(first.id));
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_register_validates_alias_and_color() {
        let scb = control_block();
        assert!(matches!(
            scb.register_user(UserRequest {
                alias: "no".into(),
                color: "#102030".into(),
                password: None,
            }),
            Err(SessionError::InvalidAlias)
        ));
        assert!(matches!(
            scb.register_user(UserRequest {
                alias: "alice01".into(),
                color: "red".into(),
                password: None,
            }),
            Err(SessionError::InvalidColor)
        ));
    }

    #[test]
    fn test_register_checks_password() {
        let scb = control_block();
        scb.config.write().unwrap().password = Some("hunter2".into());

        assert!(matches!(
            scb.register_user(request("alice01")),
            Err(SessionError::WrongPassword)
        ));
        assert!(matches!(
            scb.register_user(UserRequest {
                password: Some("wrong".into()),
                ..request("alice01")
            }),
            Err(SessionError::WrongPassword)
        ));
        assert!(scb
            .register_user(UserRequest {
                password: Some("hunter2".into()),
                ..request("alice01")
            })
            .is_ok());
    }

    #[tokio::test]
    async fn test_connect_is_idempotency_guarded() {
        let scb = control_block();
        let user = scb.register_user(request("alice01")).unwrap();

        let (conn, _rx) = ChannelConnection::pair(16);
        scb.connect_user(user.id, conn.clone()).await.unwrap();
        assert!(matches!(
            scb.connect_user(user.id, conn).await,
            Err(SessionError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_invariant() {
        let scb = control_block();
        scb.config.write().unwrap().max_users = 2;

        let alice = scb.register_user(request("alice01")).unwrap();
        let bob = scb.register_user(request("bob001")).unwrap();
        let carol = scb.register_user(request("carol01")).unwrap();

        let (conn_a, _rx_a) = ChannelConnection::pair(16);
        let (conn_b, _rx_b) = ChannelConnection::pair(16);
        let (conn_c, _rx_c) = ChannelConnection::pair(16);
        scb.connect_user(alice.id, conn_a).await.unwrap();
        scb.connect_user(bob.id, conn_b).await.unwrap();

        assert!(matches!(
            scb.user_can_join(carol.id),
            Err(SessionError::MaxUsersReached)
        ));
        assert!(matches!(
            scb.connect_user(carol.id, conn_c).await,
            Err(SessionError::MaxUsersReached)
        ));
        assert_eq!(scb.num_users(), 2);

        // Registration is also capacity-guarded once the room is full.
        assert!(matches!(
            scb.register_user(request("dave001")),
            Err(SessionError::MaxUsersReached)
        ));
    }

    #[tokio::test]
    async fn test_user_can_join_guards() {
        let scb = control_block();
        assert!(matches!(
            scb.user_can_join(Uuid::new_v4()),
            Err(SessionError::NotReady(_))
        ));

        let user = scb.register_user(request("alice01")).unwrap();
        assert!(scb.user_can_join(user.id).is_ok());

        let (conn, _rx) = ChannelConnection::pair(16);
        scb.connect_user(user.id, conn).await.unwrap();
        assert!(matches!(
            scb.user_can_join(user.id),
            Err(SessionError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_rejects_unknown_message_type() {
        let scb = control_block();
        let user = scb.register_user(request("alice01")).unwrap();
        let (conn, _rx) = ChannelConnection::pair(16);
        scb.connect_user(user.id, conn).await.unwrap();

        let msg = Message::decode(r#"{"type":"telepathy","sender":"","content":null}"#).unwrap();
        assert!(matches!(
            scb.receive(msg, user.id).await,
            Err(SessionError::UnknownMessageType)
        ));
    }

    #[tokio::test]
    async fn test_receive_sanitizes_stroke_batch() {
        let scb = control_block();
        scb.pages.write().unwrap().insert("pid1".into());

        let alice = scb.register_user(request("alice01")).unwrap();
        let bob = scb.register_user(request("bob001")).unwrap();
        let (conn_a, _rx_a) = ChannelConnection::pair(16);
        let (conn_b, mut rx_b) = ChannelConnection::pair(16);
        scb.connect_user(alice.id, conn_a).await.unwrap();
        scb.connect_user(bob.id, conn_b).await.unwrap();

        let mut own = Stroke::deleted("st1", "pid1");
        own.stroke_type = 1;
        own.user_id = alice.id;
        let mut foreign = own.clone();
        foreign.id = "st2".into();
        foreign.user_id = bob.id;
        let mut ghost_page = own.clone();
        ghost_page.id = "st3".into();
        ghost_page.page_id = "nope".into();

        let msg = Message::new(
            MessageType::Strokes,
            alice.id.to_string(),
            &vec![own, foreign, ghost_page],
        )
        .unwrap();
        scb.receive(msg, alice.id).await.unwrap();

        // Only the valid stroke survives; the batch is not rejected.
        let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        let strokes: Vec<Stroke> = got.decode_content().unwrap();
        assert_eq!(strokes.len(), 1);
        assert_eq!(strokes[0].id, "st1");
    }

    #[tokio::test]
    async fn test_read_only_session_rejects_non_host_strokes() {
        let scb = control_block();
        scb.pages.write().unwrap().insert("pid1".into());
        scb.config.write().unwrap().read_only = true;

        let host = scb.register_user(request("host001")).unwrap();
        let guest = scb.register_user(request("guest01")).unwrap();
        let (conn_h, _rx_h) = ChannelConnection::pair(16);
        let (conn_g, _rx_g) = ChannelConnection::pair(16);
        scb.connect_user(host.id, conn_h).await.unwrap();
        scb.connect_user(guest.id, conn_g).await.unwrap();

        let mut stroke = Stroke::deleted("st1", "pid1");
        stroke.stroke_type = 1;
        stroke.user_id = guest.id;
        let msg = Message::new(MessageType::Strokes, guest.id.to_string(), &vec![stroke])
            .unwrap();
        assert!(matches!(
            scb.receive(msg, guest.id).await,
            Err(SessionError::ReadOnlySession)
        ));

        let mut stroke = Stroke::deleted("st2", "pid1");
        stroke.stroke_type = 1;
        stroke.user_id = host.id;
        let msg = Message::new(MessageType::Strokes, host.id.to_string(), &vec![stroke])
            .unwrap();
        assert!(scb.receive(msg, host.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_kick_unknown_user_fails() {
        let scb = control_block();
        assert!(matches!(
            scb.kick_user(Uuid::new_v4()).await,
            Err(SessionError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn test_kick_removes_ready_registration() {
        let scb = control_block();
        let user = scb.register_user(request("alice01")).unwrap();

        scb.kick_user(user.id).await.unwrap();
        // The stale registration cannot be used to join anymore.
        assert!(matches!(
            scb.user_can_join(user.id),
            Err(SessionError::NotReady(_))
        ));
        // And kicking again reports the user as unknown.
        assert!(matches!(
            scb.kick_user(user.id).await,
            Err(SessionError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_is_host_predicate() {
        let scb = control_block();
        let user = scb.register_user(request("alice01")).unwrap();
        assert!(scb.is_host(user.id, "topsecret"));
        assert!(!scb.is_host(user.id, "wrong"));
        assert!(!scb.is_host(user.id, ""));
        assert!(!scb.is_host(Uuid::new_v4(), "topsecret"));
    }

    #[tokio::test]
    async fn test_update_user_revalidates() {
        let scb = control_block();
        let user = scb.register_user(request("alice01")).unwrap();

        assert!(matches!(
            scb.update_user(
                user.id,
                UserUpdate {
                    alias: "x".into(),
                    color: "#102030".into(),
                }
            )
            .await,
            Err(SessionError::InvalidAlias)
        ));

        scb.update_user(
            user.id,
            UserUpdate {
                alias: "alice02".into(),
                color: "#aabbcc".into(),
            },
        )
        .await
        .unwrap();
        let entries = Controller::users(scb.as_ref());
        assert_eq!(entries[0].alias, "alice02");
        assert!(!entries[0].connected);
    }
}
