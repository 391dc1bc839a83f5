//! Events and the application callback surface
//!
//! Connections queue [`Event`]s while they process a frame; the manager
//! then hands each one to [`dispatch`], which calls the matching
//! [`EventHandler`] method followed by [`EventHandler::on_event_called`].
//! Handlers receive a [`Session`] so they can act on the engine (send,
//! join, schedule) from inside a callback.

use std::rc::Rc;

use crate::manager::Session;
use crate::message::Message;
use crate::types::ConnId;
use crate::user::User;

/// Something that happened on a connection
#[derive(Debug, Clone)]
pub enum Event {
    /// Room joined and bootstrapped for the first time
    Connect,
    /// Room bootstrapped again after a reconnect
    Reconnect,
    /// Server refused the room
    ConnectFail,
    /// Connection closed
    Disconnect,
    /// Credentials rejected (room or PM)
    LoginFail,
    FloodWarning,
    FloodBan,
    FloodBanRepeat,
    Message {
        user: Rc<User>,
        message: Rc<Message>,
    },
    HistoryMessage {
        user: Rc<User>,
        message: Rc<Message>,
    },
    /// A batch of history messages finished replaying
    HistoryMessageUpdate,
    MessageDelete {
        user: Rc<User>,
        message: Rc<Message>,
    },
    ModChange,
    ModAdd {
        user: Rc<User>,
    },
    ModRemove {
        user: Rc<User>,
    },
    Join {
        user: Rc<User>,
        puid: String,
    },
    Leave {
        user: Rc<User>,
        puid: String,
    },
    /// Every inbound frame, before it is interpreted
    Raw(String),
    Ping,
    UserCountChange,
    /// `user` banned `target`
    Ban {
        user: Rc<User>,
        target: Rc<User>,
    },
    /// `user` unbanned `target`
    Unban {
        user: Rc<User>,
        target: Rc<User>,
    },
    /// First ban list of the connection received
    BanlistUpdate,
    /// Target present in a later ban list but not in the previous one
    BanlistAdd {
        target: Rc<User>,
    },
    /// Target missing from a later ban list
    BanlistRemove {
        target: Rc<User>,
    },
    UnbanlistUpdate,
    PmConnect,
    PmDisconnect,
    PmPing,
    PmMessage {
        user: Rc<User>,
        message: Rc<Message>,
    },
    PmOfflineMessage {
        user: Rc<User>,
        body: String,
    },
    PmContactlistReceive,
    PmBlocklistReceive,
    PmContactAdd {
        user: Rc<User>,
    },
    PmContactRemove {
        user: Rc<User>,
    },
    PmBlock {
        user: Rc<User>,
    },
    PmUnblock {
        user: Rc<User>,
    },
    PmContactOnline {
        user: Rc<User>,
    },
    PmContactOffline {
        user: Rc<User>,
    },
}

impl Event {
    /// Stable callback name, useful for logging and tests
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connect => "connect",
            Event::Reconnect => "reconnect",
            Event::ConnectFail => "connect_fail",
            Event::Disconnect => "disconnect",
            Event::LoginFail => "login_fail",
            Event::FloodWarning => "flood_warning",
            Event::FloodBan => "flood_ban",
            Event::FloodBanRepeat => "flood_ban_repeat",
            Event::Message { .. } => "message",
            Event::HistoryMessage { .. } => "history_message",
            Event::HistoryMessageUpdate => "history_message_update",
            Event::MessageDelete { .. } => "message_delete",
            Event::ModChange => "mod_change",
            Event::ModAdd { .. } => "mod_add",
            Event::ModRemove { .. } => "mod_remove",
            Event::Join { .. } => "join",
            Event::Leave { .. } => "leave",
            Event::Raw(_) => "raw",
            Event::Ping => "ping",
            Event::UserCountChange => "user_count_change",
            Event::Ban { .. } => "ban",
            Event::Unban { .. } => "unban",
            Event::BanlistUpdate => "banlist_update",
            Event::BanlistAdd { .. } => "banlist_add",
            Event::BanlistRemove { .. } => "banlist_remove",
            Event::UnbanlistUpdate => "unbanlist_update",
            Event::PmConnect => "pm_connect",
            Event::PmDisconnect => "pm_disconnect",
            Event::PmPing => "pm_ping",
            Event::PmMessage { .. } => "pm_message",
            Event::PmOfflineMessage { .. } => "pm_offline_message",
            Event::PmContactlistReceive => "pm_contactlist_receive",
            Event::PmBlocklistReceive => "pm_blocklist_receive",
            Event::PmContactAdd { .. } => "pm_contact_add",
            Event::PmContactRemove { .. } => "pm_contact_remove",
            Event::PmBlock { .. } => "pm_block",
            Event::PmUnblock { .. } => "pm_unblock",
            Event::PmContactOnline { .. } => "pm_contact_online",
            Event::PmContactOffline { .. } => "pm_contact_offline",
        }
    }
}

/// Application callbacks
///
/// Every method has an empty default, so a bot only implements what it
/// reacts to. `conn` identifies the room or PM connection the event came
/// from; look the room up with [`Session::room_for`].
#[allow(unused_variables)]
pub trait EventHandler {
    /// Called once before the loop starts
    fn on_init(&mut self, session: &mut Session<'_>) {}

    fn on_connect(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_reconnect(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_connect_fail(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_disconnect(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_login_fail(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_flood_warning(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_flood_ban(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_flood_ban_repeat(&mut self, session: &mut Session<'_>, conn: &ConnId) {}

    fn on_message(&mut self, session: &mut Session<'_>, conn: &ConnId, user: &Rc<User>, message: &Rc<Message>) {}
    fn on_history_message(&mut self, session: &mut Session<'_>, conn: &ConnId, user: &Rc<User>, message: &Rc<Message>) {}
    fn on_history_message_update(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_message_delete(&mut self, session: &mut Session<'_>, conn: &ConnId, user: &Rc<User>, message: &Rc<Message>) {}

    fn on_mod_change(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_mod_add(&mut self, session: &mut Session<'_>, conn: &ConnId, user: &Rc<User>) {}
    fn on_mod_remove(&mut self, session: &mut Session<'_>, conn: &ConnId, user: &Rc<User>) {}

    fn on_join(&mut self, session: &mut Session<'_>, conn: &ConnId, user: &Rc<User>, puid: &str) {}
    fn on_leave(&mut self, session: &mut Session<'_>, conn: &ConnId, user: &Rc<User>, puid: &str) {}
    fn on_raw(&mut self, session: &mut Session<'_>, conn: &ConnId, raw: &str) {}
    fn on_ping(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_user_count_change(&mut self, session: &mut Session<'_>, conn: &ConnId) {}

    fn on_ban(&mut self, session: &mut Session<'_>, conn: &ConnId, user: &Rc<User>, target: &Rc<User>) {}
    fn on_unban(&mut self, session: &mut Session<'_>, conn: &ConnId, user: &Rc<User>, target: &Rc<User>) {}
    fn on_banlist_update(&mut self, session: &mut Session<'_>, conn: &ConnId) {}
    fn on_banlist_add(&mut self, session: &mut Session<'_>, conn: &ConnId, target: &Rc<User>) {}
    fn on_banlist_remove(&mut self, session: &mut Session<'_>, conn: &ConnId, target: &Rc<User>) {}
    fn on_unbanlist_update(&mut self, session: &mut Session<'_>, conn: &ConnId) {}

    fn on_pm_connect(&mut self, session: &mut Session<'_>) {}
    fn on_pm_disconnect(&mut self, session: &mut Session<'_>) {}
    fn on_pm_ping(&mut self, session: &mut Session<'_>) {}
    fn on_pm_message(&mut self, session: &mut Session<'_>, user: &Rc<User>, message: &Rc<Message>) {}
    fn on_pm_offline_message(&mut self, session: &mut Session<'_>, user: &Rc<User>, body: &str) {}
    fn on_pm_contactlist_receive(&mut self, session: &mut Session<'_>) {}
    fn on_pm_blocklist_receive(&mut self, session: &mut Session<'_>) {}
    fn on_pm_contact_add(&mut self, session: &mut Session<'_>, user: &Rc<User>) {}
    fn on_pm_contact_remove(&mut self, session: &mut Session<'_>, user: &Rc<User>) {}
    fn on_pm_block(&mut self, session: &mut Session<'_>, user: &Rc<User>) {}
    fn on_pm_unblock(&mut self, session: &mut Session<'_>, user: &Rc<User>) {}
    fn on_pm_contact_online(&mut self, session: &mut Session<'_>, user: &Rc<User>) {}
    fn on_pm_contact_offline(&mut self, session: &mut Session<'_>, user: &Rc<User>) {}

    /// Observes every event after its specific callback ran
    fn on_event_called(&mut self, session: &mut Session<'_>, conn: &ConnId, event: &Event) {}
}

/// Route one event to its callback, then to the catch-all observer
pub fn dispatch<H>(handler: &mut H, session: &mut Session<'_>, conn: &ConnId, event: &Event)
where
    H: EventHandler + ?Sized,
{
    let s = &mut *session;
    match event {
        Event::Connect => handler.on_connect(s, conn),
        Event::Reconnect => handler.on_reconnect(s, conn),
        Event::ConnectFail => handler.on_connect_fail(s, conn),
        Event::Disconnect => handler.on_disconnect(s, conn),
        Event::LoginFail => handler.on_login_fail(s, conn),
        Event::FloodWarning => handler.on_flood_warning(s, conn),
        Event::FloodBan => handler.on_flood_ban(s, conn),
        Event::FloodBanRepeat => handler.on_flood_ban_repeat(s, conn),
        Event::Message { user, message } => handler.on_message(s, conn, user, message),
        Event::HistoryMessage { user, message } => handler.on_history_message(s, conn, user, message),
        Event::HistoryMessageUpdate => handler.on_history_message_update(s, conn),
        Event::MessageDelete { user, message } => handler.on_message_delete(s, conn, user, message),
        Event::ModChange => handler.on_mod_change(s, conn),
        Event::ModAdd { user } => handler.on_mod_add(s, conn, user),
        Event::ModRemove { user } => handler.on_mod_remove(s, conn, user),
        Event::Join { user, puid } => handler.on_join(s, conn, user, puid),
        Event::Leave { user, puid } => handler.on_leave(s, conn, user, puid),
        Event::Raw(raw) => handler.on_raw(s, conn, raw),
        Event::Ping => handler.on_ping(s, conn),
        Event::UserCountChange => handler.on_user_count_change(s, conn),
        Event::Ban { user, target } => handler.on_ban(s, conn, user, target),
        Event::Unban { user, target } => handler.on_unban(s, conn, user, target),
        Event::BanlistUpdate => handler.on_banlist_update(s, conn),
        Event::BanlistAdd { target } => handler.on_banlist_add(s, conn, target),
        Event::BanlistRemove { target } => handler.on_banlist_remove(s, conn, target),
        Event::UnbanlistUpdate => handler.on_unbanlist_update(s, conn),
        Event::PmConnect => handler.on_pm_connect(s),
        Event::PmDisconnect => handler.on_pm_disconnect(s),
        Event::PmPing => handler.on_pm_ping(s),
        Event::PmMessage { user, message } => handler.on_pm_message(s, user, message),
        Event::PmOfflineMessage { user, body } => handler.on_pm_offline_message(s, user, body),
        Event::PmContactlistReceive => handler.on_pm_contactlist_receive(s),
        Event::PmBlocklistReceive => handler.on_pm_blocklist_receive(s),
        Event::PmContactAdd { user } => handler.on_pm_contact_add(s, user),
        Event::PmContactRemove { user } => handler.on_pm_contact_remove(s, user),
        Event::PmBlock { user } => handler.on_pm_block(s, user),
        Event::PmUnblock { user } => handler.on_pm_unblock(s, user),
        Event::PmContactOnline { user } => handler.on_pm_contact_online(s, user),
        Event::PmContactOffline { user } => handler.on_pm_contact_offline(s, user),
    }
    handler.on_event_called(s, conn, event);
}

/// Handler that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}
