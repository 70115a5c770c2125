//! Process-wide session registry.
//!
//! One [`SessionDispatcher`] is constructed at process start and
//! threaded explicitly to every collaborator — there is no ambient
//! global. It owns session creation, lookup, and teardown; closing a
//! session removes the registry entry and signals the broadcaster,
//! whose cache loop purges the session's durable state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::cache::PageCache;
use crate::config::{ConfigUpdate, SessionConfig};
use crate::session::{ControlBlock, Controller, SessionError, SessionParams};

const SESSION_ID_LEN: usize = 8;
const SECRET_LEN: usize = 16;

fn random_token(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Registry capability: session creation, lookup, and teardown.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Create a session with a fresh id and secret, applying the given
    /// initial configuration.
    async fn create_session(
        &self,
        update: ConfigUpdate,
    ) -> Result<Arc<dyn Controller>, SessionError>;

    fn session(&self, session_id: &str) -> Result<Arc<dyn Controller>, SessionError>;

    /// Remove the registry entry and stop the session's broadcaster.
    /// Exactly one caller wins; the rest get `UnknownSession`.
    async fn close_session(&self, session_id: &str) -> Result<(), SessionError>;

    fn num_sessions(&self) -> usize;

    /// Arm an idle timer: a session still without connected users when
    /// the bound elapses is force-closed. Re-arms while users are
    /// present.
    fn close_after(&self, session_id: &str, bound: Duration);
}

/// Production [`Dispatcher`] holding the lock-guarded session map.
pub struct SessionDispatcher {
    sessions: RwLock<HashMap<String, Arc<ControlBlock>>>,
    cache: Arc<dyn PageCache>,
    /// Handed to control blocks so the last disconnect can reach back.
    self_ref: Weak<SessionDispatcher>,
}

impl SessionDispatcher {
    pub fn new(cache: Arc<dyn PageCache>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sessions: RwLock::new(HashMap::new()),
            cache,
            self_ref: weak.clone(),
        })
    }

    fn strong_self(&self) -> Arc<SessionDispatcher> {
        self.self_ref.upgrade().expect("dispatcher alive")
    }
}

#[async_trait]
impl Dispatcher for SessionDispatcher {
    async fn create_session(
        &self,
        update: ConfigUpdate,
    ) -> Result<Arc<dyn Controller>, SessionError> {
        let mut config = SessionConfig::new(String::new(), random_token(SECRET_LEN));
        config.apply(&update)?;

        let mut sessions = self.sessions.write().expect("registry lock");
        let mut id = random_token(SESSION_ID_LEN);
        while sessions.contains_key(&id) {
            id = random_token(SESSION_ID_LEN);
        }
        config.id = id.clone();

        let scb = ControlBlock::create(SessionParams {
            config,
            cache: Some(self.cache.clone()),
            dispatcher: Some(self.strong_self()),
            broadcaster: None,
            attachments: None,
        })?;
        sessions.insert(id.clone(), scb.clone());
        log::info!("session {id} created");
        Ok(scb)
    }

    fn session(&self, session_id: &str) -> Result<Arc<dyn Controller>, SessionError> {
        self.sessions
            .read()
            .expect("registry lock")
            .get(session_id)
            .cloned()
            .map(|scb| scb as Arc<dyn Controller>)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))
    }

    async fn close_session(&self, session_id: &str) -> Result<(), SessionError> {
        let scb = self
            .sessions
            .write()
            .expect("registry lock")
            .remove(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        if !scb.broadcaster().close().await {
            // No loops ever ran (nobody connected), so the cache loop
            // cannot purge; do it here.
            if let Err(e) = self.cache.clear_session(session_id).await {
                log::warn!("purging never-started session {session_id} failed: {e}");
            }
        }
        log::info!("session {session_id} closed");
        Ok(())
    }

    fn num_sessions(&self) -> usize {
        self.sessions.read().expect("registry lock").len()
    }

    fn close_after(&self, session_id: &str, bound: Duration) {
        let dispatcher = self.strong_self();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(bound).await;
                let Ok(scb) = dispatcher.session(&session_id) else {
                    break;
                };
                if scb.num_users() == 0 {
                    log::info!("session {session_id} idle past bound, closing");
                    if let Err(e) = dispatcher.close_session(&session_id).await {
                        log::warn!("idle close of session {session_id} failed: {e}");
                    }
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::session::UserRequest;
    use crate::transport::ChannelConnection;
    use tokio::time::sleep;

    fn dispatcher() -> Arc<SessionDispatcher> {
        SessionDispatcher::new(Arc::new(MemoryCache::new()))
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let dispatcher = dispatcher();
        let scb = dispatcher.create_session(ConfigUpdate::default()).await.unwrap();
        let id = scb.config().id;
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert_eq!(dispatcher.num_sessions(), 1);
        assert!(dispatcher.session(&id).is_ok());
        assert!(matches!(
            dispatcher.session("nope1234"),
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_create_applies_initial_config() {
        let dispatcher = dispatcher();
        let scb = dispatcher
            .create_session(ConfigUpdate {
                max_users: Some(3),
                read_only: Some(true),
                password: Some("pw".into()),
            })
            .await
            .unwrap();
        let config = scb.config();
        assert_eq!(config.max_users, 3);
        assert!(config.read_only);
        assert!(!config.secret.is_empty());
        assert_eq!(config.host, None);
    }

    #[tokio::test]
    async fn test_close_session_is_single_shot() {
        let dispatcher = dispatcher();
        let scb = dispatcher.create_session(ConfigUpdate::default()).await.unwrap();
        let id = scb.config().id;

        dispatcher.close_session(&id).await.unwrap();
        assert_eq!(dispatcher.num_sessions(), 0);
        assert!(matches!(
            dispatcher.close_session(&id).await,
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_close_after_fires_only_on_idle_sessions() {
        let dispatcher = dispatcher();
        let idle = dispatcher.create_session(ConfigUpdate::default()).await.unwrap();
        let busy = dispatcher.create_session(ConfigUpdate::default()).await.unwrap();
        let idle_id = idle.config().id;
        let busy_id = busy.config().id;

        let user = busy
            .register_user(UserRequest {
                alias: "alice01".into(),
                color: "#102030".into(),
                password: None,
            })
            .unwrap();
        let (conn, _rx) = ChannelConnection::pair(16);
        busy.connect_user(user.id, conn).await.unwrap();

        dispatcher.close_after(&idle_id, Duration::from_millis(20));
        dispatcher.close_after(&busy_id, Duration::from_millis(20));
        sleep(Duration::from_millis(100)).await;

        assert!(dispatcher.session(&idle_id).is_err());
        assert!(dispatcher.session(&busy_id).is_ok());
    }
}
