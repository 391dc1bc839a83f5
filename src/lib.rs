//! Chatango Client Library
//!
//! A single-threaded client for Chatango group rooms and the private
//! message channel. One [`RoomManager`] drives every connection from a
//! mio poll loop and reports what happens to an [`EventHandler`].
//!
//! # Features
//! - Room login as anonymous, temporary name or account
//! - Message history, deletion and flagging
//! - Moderator list, bans and the unban log
//! - Participant tracking with per-session ids
//! - Private messages, contacts, block list and presence
//! - Timers and blocking work handed back to the loop
//!
//! # Architecture
//! - Connections parse frames and push [`Event`]s into their own outbox
//! - The manager drains outboxes after every frame and dispatches them
//! - Handlers act back on the engine through a [`Session`]
//! - Blocking work runs on a bounded pool; its result returns as a task
//!
//! # Example
//! ```no_run
//! use chatango_client::{Credentials, ManagerConfig, NoopHandler, RoomManager};
//!
//! let credentials = Credentials::new(Some("mybot".into()), Some("secret".into()));
//! let mut manager = RoomManager::new(ManagerConfig::default(), credentials, NoopHandler)?;
//! manager.session().join_room("examplegroup")?;
//! manager.run()?;
//! # Ok::<(), chatango_client::ChatError>(())
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod event;
pub mod manager;
pub mod message;
pub mod pm;
pub mod room;
pub mod scheduler;
pub mod shard;
pub mod types;
pub mod user;
pub mod worker;

// Re-export main types for convenience
pub use config::{BigMessage, Credentials, ManagerConfig, ReconnectPolicy, UserlistMode};
pub use conn::{Conn, ConnContext, ConnState};
pub use error::{ChatError, ConfigError, SchedulerError, ShardError};
pub use event::{Event, EventHandler, NoopHandler};
pub use manager::{RoomManager, Session};
pub use message::{BanRecord, Message};
pub use pm::Pm;
pub use room::Room;
pub use scheduler::{Delay, TaskId};
pub use types::{ConnId, Level, MessageId};
pub use user::{Style, User, UserRegistry};
