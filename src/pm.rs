//! Private-message connection
//!
//! One per manager, opened after the login form handed out a session
//! token. Tracks contacts, the block list and the online status of users
//! the server reports on.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::codec::Frame;
use crate::conn::{CloseRequest, Conn, ConnContext, ConnState, Transport};
use crate::event::Event;
use crate::message::{clean_message, strip_html, Message, MessageParts, MessageStore};
use crate::scheduler::TaskId;
use crate::types::{unix_now, ConnId};
use crate::user::User;

type FrameHandler = fn(&mut Pm, &Frame);

static PM_HANDLERS: Lazy<HashMap<&'static str, FrameHandler>> = Lazy::new(|| {
    HashMap::from([
        ("OK", Pm::handle_ok as FrameHandler),
        ("DENIED", Pm::handle_denied),
        ("wl", Pm::handle_contact_list),
        ("block_list", Pm::handle_block_list),
        ("idleupdate", Pm::handle_idle_update),
        ("track", Pm::handle_status),
        ("status", Pm::handle_status),
        ("msg", Pm::handle_msg),
        ("msgoff", Pm::handle_msgoff),
        ("wladd", Pm::handle_contact_add),
        ("wldelete", Pm::handle_contact_remove),
        ("wlapp", Pm::handle_online),
        ("wlonline", Pm::handle_online),
        ("wloffline", Pm::handle_offline),
        ("kickingoff", Pm::handle_kicked),
        ("toofast", Pm::handle_kicked),
        ("unblocked", Pm::handle_unblocked),
    ])
});

/// Last known presence of a user
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Presence {
    /// Logout time when offline; idle-since time, or 0 when active, when online
    pub last_active: f64,
    pub online: bool,
}

impl Presence {
    const ACTIVE: Presence = Presence {
        last_active: 0.0,
        online: true,
    };
}

/// The PM connection
#[derive(Debug)]
pub struct Pm {
    server: String,
    port: u16,
    state: ConnState,
    transport: Transport,
    ctx: ConnContext,
    contacts: HashSet<Rc<User>>,
    blocklist: HashSet<Rc<User>>,
    status: HashMap<Rc<User>, Presence>,
    messages: MessageStore,
    events: Vec<Event>,
    close: Option<CloseRequest>,
    pub(crate) ping_task: Option<TaskId>,
}

impl Pm {
    pub fn new(ctx: ConnContext) -> Self {
        let server = ctx.config.pm_host.clone();
        let port = ctx.config.pm_port;
        Self::with_address(&server, port, ctx)
    }

    pub fn with_address(server: &str, port: u16, ctx: ConnContext) -> Self {
        let bound = ctx.config.max_history_length;
        Self {
            server: server.to_string(),
            port,
            state: ConnState::Disconnected,
            transport: Transport::new(),
            ctx,
            contacts: HashSet::new(),
            blocklist: HashSet::new(),
            status: HashMap::new(),
            messages: MessageStore::new(bound),
            events: Vec::new(),
            close: None,
            ping_task: None,
        }
    }

    /// Queue the token login; later commands wait until the server says OK
    pub fn start_session(&mut self, token: &str) {
        self.transport.reset();
        self.state = ConnState::Connecting;
        self.close = None;
        self.send(&["tlogin", token, "2"]);
        self.transport.wire.set_write_lock(true);
    }

    pub(crate) fn end_session(&mut self) {
        self.state = ConnState::Disconnected;
    }

    pub(crate) fn request_close(&mut self, request: CloseRequest) {
        if self.close != Some(CloseRequest::Notify) {
            self.close = Some(request);
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Contacts, sorted by name
    pub fn contacts(&self) -> Vec<Rc<User>> {
        sorted(&self.contacts)
    }

    /// Blocked users, sorted by name
    pub fn blocklist(&self) -> Vec<Rc<User>> {
        sorted(&self.blocklist)
    }

    pub fn presence(&self, user: &User) -> Option<Presence> {
        self.status.get(user).copied()
    }

    /// Whether the user is online; `None` when the server never said
    pub fn check_online(&self, user: &User) -> Option<bool> {
        self.presence(user).map(|p| p.online)
    }

    /// Time the user was last active
    ///
    /// Now when active, 0 when offline, `None` when unknown.
    pub fn idle_since(&self, user: &User) -> Option<f64> {
        let presence = self.presence(user)?;
        Some(match presence {
            Presence { online: false, .. } => 0.0,
            Presence { last_active, .. } if last_active == 0.0 => unix_now(),
            Presence { last_active, .. } => last_active,
        })
    }

    /// Private messages received this session, oldest first
    pub fn messages(&self) -> Vec<Rc<Message>> {
        self.messages.history().cloned().collect()
    }

    pub fn outgoing(&self) -> &[u8] {
        self.transport.wire.outgoing()
    }

    // ---- inbound ----

    fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Record a status report; false for an unknown status word
    fn update_status(&mut self, user: &Rc<User>, status: &str, timestamp: f64, idle: &str) -> bool {
        let presence = match status {
            "off" | "offline" => Presence {
                last_active: timestamp,
                online: false,
            },
            "on" | "app" | "online" if idle == "0" => Presence::ACTIVE,
            "on" | "app" | "online" => {
                let minutes: f64 = idle.parse().unwrap_or_default();
                Presence {
                    last_active: (unix_now() - minutes.trunc() * 60.0).trunc(),
                    online: true,
                }
            }
            _ => return false,
        };
        self.status.insert(Rc::clone(user), presence);
        true
    }

    fn handle_ok(&mut self, _f: &Frame) {
        info!(server = %self.server, "PM connected");
        self.transport.wire.set_write_lock(false);
        self.send(&["wl"]);
        self.send(&["getblock"]);
        self.state = ConnState::Active;
        self.push(Event::PmConnect);
    }

    fn handle_denied(&mut self, _f: &Frame) {
        warn!("PM login denied");
        self.request_close(CloseRequest::Quiet);
        self.push(Event::LoginFail);
    }

    fn handle_contact_list(&mut self, f: &Frame) {
        self.contacts.clear();
        for entry in f.args.chunks_exact(4) {
            let (name, last_on, status, idle) = (&entry[0], &entry[1], &entry[2], &entry[3]);
            let user = self.ctx.users.get(name);
            if last_on == "None" {
                debug!(user = %name, "Contact without timestamp");
                continue;
            }
            let timestamp = last_on.parse().unwrap_or_default();
            if !self.update_status(&user, status, timestamp, idle) {
                debug!(user = %name, status = %status, "Unsupported contact status");
            }
            self.contacts.insert(user);
        }
        self.push(Event::PmContactlistReceive);
    }

    fn handle_block_list(&mut self, f: &Frame) {
        let blocked: HashSet<Rc<User>> = f
            .args
            .iter()
            .filter(|name| !name.is_empty())
            .map(|name| self.ctx.users.get(name))
            .collect();
        if !self.blocklist.is_empty() {
            let mut added: Vec<_> = blocked.difference(&self.blocklist).cloned().collect();
            added.sort_by(|a, b| a.name().cmp(b.name()));
            for user in added {
                self.push(Event::PmBlock { user });
            }
        }
        self.blocklist = blocked;
        self.push(Event::PmBlocklistReceive);
    }

    fn handle_idle_update(&mut self, f: &Frame) {
        let user = self.ctx.users.get(f.arg(0));
        let presence = if f.arg(1) == "1" {
            Presence::ACTIVE
        } else {
            Presence {
                last_active: unix_now().trunc(),
                online: true,
            }
        };
        self.status.insert(user, presence);
    }

    fn handle_status(&mut self, f: &Frame) {
        let user = self.ctx.users.get(f.arg(0));
        let timestamp: f64 = f.arg(1).parse().unwrap_or_default();
        if !self.update_status(&user, f.arg(2), timestamp.trunc(), f.arg(1)) {
            debug!(frame = %f.verb, user = %user, "Unsupported status");
        }
    }

    fn handle_msg(&mut self, f: &Frame) {
        let user = self.ctx.users.get(f.arg(0));
        let raw = f.rest(5);
        let clean = clean_message(&raw);
        let msg = Rc::new(Message::new(
            Rc::clone(&user),
            ConnId::Pm,
            MessageParts {
                time: f.arg(3).parse().unwrap_or_default(),
                body: clean.body,
                raw,
                ip: String::new(),
                unid: String::new(),
                puid: String::new(),
                name_tag: clean.name_tag,
                font_tag: clean.font_tag,
            },
        ));
        self.messages.push_history(Rc::clone(&msg));
        self.push(Event::PmMessage { user, message: msg });
    }

    fn handle_msgoff(&mut self, f: &Frame) {
        let user = self.ctx.users.get(f.arg(0));
        let body = strip_html(&f.rest(5));
        self.push(Event::PmOfflineMessage { user, body });
    }

    fn handle_contact_add(&mut self, f: &Frame) {
        let user = self.ctx.users.get(f.arg(0));
        let timestamp = f.arg(2).parse().unwrap_or_default();
        self.update_status(&user, f.arg(1), timestamp, f.arg(2));
        self.contacts.insert(Rc::clone(&user));
        self.push(Event::PmContactAdd { user });
    }

    fn handle_contact_remove(&mut self, f: &Frame) {
        let user = self.ctx.users.get(f.arg(0));
        self.status.remove(&user);
        self.contacts.remove(&user);
        self.push(Event::PmContactRemove { user });
    }

    fn handle_online(&mut self, f: &Frame) {
        let user = self.ctx.users.get(f.arg(0));
        self.status.insert(Rc::clone(&user), Presence::ACTIVE);
        self.push(Event::PmContactOnline { user });
    }

    fn handle_offline(&mut self, f: &Frame) {
        let user = self.ctx.users.get(f.arg(0));
        let last_on: f64 = f.arg(1).parse().unwrap_or_default();
        self.status.insert(
            Rc::clone(&user),
            Presence {
                last_active: last_on.trunc(),
                online: false,
            },
        );
        self.push(Event::PmContactOffline { user });
    }

    fn handle_kicked(&mut self, f: &Frame) {
        warn!(reason = %f.verb, "PM server dropped the session");
        self.request_close(CloseRequest::Notify);
    }

    fn handle_unblocked(&mut self, f: &Frame) {
        let user = self.ctx.users.get(f.arg(0));
        if self.blocklist.remove(&user) {
            self.push(Event::PmUnblock { user });
        }
    }

    // ---- outbound ----

    fn send(&mut self, fields: &[&str]) {
        self.transport.wire.send_command(fields);
    }

    pub fn ping(&mut self) {
        self.send(&[""]);
        self.push(Event::PmPing);
    }

    /// Send a private message; empty text is dropped
    pub fn message(&mut self, user: &User, text: &str) {
        if !text.is_empty() {
            let text = text.replace('\n', "\r");
            self.send(&["msg", user.name(), &text]);
        }
    }

    pub fn add_contact(&mut self, user: &User) {
        if !self.contacts.contains(user) {
            self.send(&["wladd", user.name()]);
        }
    }

    pub fn remove_contact(&mut self, user: &User) {
        if self.contacts.contains(user) {
            self.send(&["wldelete", user.name()]);
        }
    }

    pub fn block(&mut self, user: &User) {
        if !self.blocklist.contains(user) {
            self.send(&["block", user.name(), user.name(), "S"]);
        }
    }

    pub fn unblock(&mut self, user: &User) {
        if self.blocklist.contains(user) {
            self.send(&["unblock", user.name()]);
        }
    }

    /// Ask the server for the user's status
    pub fn track(&mut self, user: &User) {
        self.send(&["track", user.name()]);
    }
}

fn sorted(users: &HashSet<Rc<User>>) -> Vec<Rc<User>> {
    let mut users: Vec<_> = users.iter().cloned().collect();
    users.sort_by(|a, b| a.name().cmp(b.name()));
    users
}

impl Conn for Pm {
    fn id(&self) -> ConnId {
        ConnId::Pm
    }

    fn state(&self) -> ConnState {
        self.state
    }

    fn transport(&self) -> &Transport {
        &self.transport
    }

    fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    fn established(&mut self) {
        if self.state == ConnState::Connecting {
            self.state = ConnState::Authenticating;
        }
    }

    fn process(&mut self, line: &str) {
        if self.close.is_some() || self.state == ConnState::Disconnected {
            return;
        }
        self.push(Event::Raw(line.to_string()));
        let frame = Frame::parse(line);
        match PM_HANDLERS.get(frame.verb.as_str()) {
            Some(handler) => handler(self, &frame),
            None => debug!(verb = %frame.verb, "Unhandled PM command"),
        }
    }

    fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    fn close_request(&self) -> Option<CloseRequest> {
        self.close
    }
}
