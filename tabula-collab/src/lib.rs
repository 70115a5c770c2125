//! # tabula-collab — session engine for the Tabula whiteboard
//!
//! Real-time collaboration core: sessions, fan-out, and durable page
//! state over an external cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  create/lookup/close   ┌──────────────────┐
//! │  Dispatcher  │ ─────────────────────► │  ControlBlock    │
//! │  (registry)  │ ◄───────────────────── │  (per session)   │
//! └──────────────┘   close on last leave  └────────┬─────────┘
//!                                                  │ channels
//!                                                  ▼
//!                                         ┌──────────────────┐
//!                                         │   Broadcaster    │
//!                                         │ fan-out │ cache  │
//!                                         └────┬────┴───┬────┘
//!                                  transports ◄┘         └► PageCache
//! ```
//!
//! Inbound envelopes and user lifecycle events flow into the control
//! block; everything user-visible leaves through the broadcaster's
//! single-consumer loops, so transport writes never race and per-sender
//! ordering is preserved. Stroke batches are persisted asynchronously —
//! a slow cache never delays delivery.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope and message payloads
//! - [`config`] — session configuration and partial updates
//! - [`session`] — control block, membership, inbound sanitation
//! - [`pages`] — ordered page catalogue operations
//! - [`broadcast`] — per-session fan-out/persistence actor
//! - [`dispatch`] — process-wide session registry
//! - [`cache`] — cache command contract (Redis + in-memory)
//! - [`transport`] — user connection boundary
//! - [`attachment`] — blob storage boundary

pub mod attachment;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod pages;
pub mod protocol;
pub mod session;
pub mod transport;

pub use attachment::{AttachmentError, AttachmentStore, MemoryAttachmentStore};
pub use broadcast::{Broadcaster, ChannelBroadcaster, SessionBinding};
pub use cache::{CacheError, MemoryCache, PageCache, RedisCache};
pub use config::{ConfigUpdate, SessionConfig, DEFAULT_MAX_USERS, MAX_USERS_CAP};
pub use dispatch::{Dispatcher, SessionDispatcher};
pub use pages::{PageInsert, PageTarget};
pub use protocol::{
    ErrorContent, HostSecret, KickNotice, Message, MessageType, PageSync, PageUpdateNotice,
    ProtocolError, UserEntry, SERVER_SENDER,
};
pub use session::{
    ControlBlock, Controller, SessionError, SessionParams, SessionUsers, UserRequest, UserUpdate,
};
pub use transport::{ChannelConnection, TransportError, UserConnection, WsConnection};
