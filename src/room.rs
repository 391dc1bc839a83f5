//! Room connection state machine
//!
//! A [`Room`] authenticates, bootstraps its participant, premium and ban
//! state, and turns inbound frames into [`Event`]s. It never touches the
//! poller or the scheduler: the manager drives its [`Transport`] and reads
//! back events and close requests through [`Conn`].
//!
//! Live messages arrive provisional (`b`, keyed by a sequence token) and
//! are attached when acknowledged (`u`). Backlog messages (`i`) carry their
//! id already and are replayed as history once bootstrap completes.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::codec::Frame;
use crate::config::{BigMessage, UserlistMode};
use crate::conn::{CloseRequest, Conn, ConnContext, ConnState, Transport};
use crate::error::ShardError;
use crate::event::Event;
use crate::message::{clean_message, escape_html, BanRecord, Message, MessageParts, MessageStore};
use crate::scheduler::TaskId;
use crate::shard;
use crate::types::{gen_uid, unix_now, ConnId, Level, MessageId};
use crate::user::{anon_id, Style, User};

/// Messages requested per history page
const HISTORY_PAGE: &str = "20";

/// Entries requested per ban list page
const BANLIST_PAGE: &str = "500";

type FrameHandler = fn(&mut Room, &Frame);

/// Verb dispatch table, built once
static ROOM_HANDLERS: Lazy<HashMap<&'static str, FrameHandler>> = Lazy::new(|| {
    HashMap::from([
        ("ok", Room::handle_ok as FrameHandler),
        ("aliasok", Room::handle_aliasok),
        ("pwdok", Room::handle_pwdok),
        ("denied", Room::handle_denied),
        ("inited", Room::handle_inited),
        ("premium", Room::handle_premium),
        ("mods", Room::handle_mods),
        ("b", Room::handle_b),
        ("u", Room::handle_u),
        ("i", Room::handle_i),
        ("gotmore", Room::handle_gotmore),
        ("nomore", Room::handle_nomore),
        ("g_participants", Room::handle_participants),
        ("participant", Room::handle_participant),
        ("show_fw", Room::handle_flood_warning),
        ("show_tb", Room::handle_flood_ban),
        ("tb", Room::handle_flood_ban_repeat),
        ("delete", Room::handle_delete),
        ("deleteall", Room::handle_deleteall),
        ("n", Room::handle_user_count),
        ("blocklist", Room::handle_blocklist),
        ("unblocklist", Room::handle_unblocklist),
        ("blocked", Room::handle_blocked),
        ("unblocked", Room::handle_unblocked),
    ])
});

/// One joined room
#[derive(Debug)]
pub struct Room {
    name: String,
    server: String,
    port: u16,
    uid: String,
    provided_uid: Option<String>,
    state: ConnState,
    transport: Transport,
    ctx: ConnContext,

    owner: Option<Rc<User>>,
    mods: HashSet<Rc<User>>,
    /// Provisional messages keyed by sequence token
    pending: HashMap<String, Rc<Message>>,
    store: MessageStore,
    /// Backlog received before bootstrap or while paging, newest first
    backlog: Vec<Rc<Message>>,
    history_index: Option<u32>,
    fetching_history: bool,
    roster: Vec<Rc<User>>,
    connect_count: u32,
    premium: bool,
    user_count: u32,
    silent: bool,

    bot_name: String,
    login_name: String,
    anon_name: String,
    anon_seed: String,

    banlist: HashMap<Rc<User>, BanRecord>,
    banlist_seen: bool,
    unbanlist: HashMap<Rc<User>, BanRecord>,

    events: Vec<Event>,
    close: Option<CloseRequest>,
    pub(crate) ping_task: Option<TaskId>,
    pub(crate) reconnect_task: Option<TaskId>,
    pub(crate) backoff: Option<Duration>,
}

impl Room {
    /// Create a room served by its shard host
    pub fn new(name: &str, ctx: ConnContext) -> Result<Self, ShardError> {
        let name = name.to_lowercase();
        let server = shard::server_for(&name)?;
        let port = ctx.config.room_port;
        Ok(Self::with_address(&name, &server, port, ctx))
    }

    /// Create a room served by an explicit host
    pub fn with_address(name: &str, server: &str, port: u16, ctx: ConnContext) -> Self {
        let history_bound = ctx.config.max_history_length;
        Self {
            name: name.to_lowercase(),
            server: server.to_string(),
            port,
            uid: gen_uid(),
            provided_uid: None,
            state: ConnState::Disconnected,
            transport: Transport::new(),
            ctx,
            owner: None,
            mods: HashSet::new(),
            pending: HashMap::new(),
            store: MessageStore::new(history_bound),
            backlog: Vec::new(),
            history_index: Some(0),
            fetching_history: false,
            roster: Vec::new(),
            connect_count: 0,
            premium: false,
            user_count: 0,
            silent: false,
            bot_name: String::new(),
            login_name: String::new(),
            anon_name: String::new(),
            anon_seed: String::new(),
            banlist: HashMap::new(),
            banlist_seen: false,
            unbanlist: HashMap::new(),
            events: Vec::new(),
            close: None,
            ping_task: None,
            reconnect_task: None,
            backoff: None,
        }
    }

    /// Use a fixed connection uid instead of a random one
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        let uid = uid.into();
        self.uid = uid.clone();
        self.provided_uid = Some(uid);
        self
    }

    // ---- session lifecycle ----

    /// Reset the transport buffers and queue the auth handshake
    ///
    /// Everything sent afterwards waits behind the write lock until the
    /// server finishes `inited`.
    pub fn start_session(&mut self) {
        self.transport.reset();
        self.uid = self.provided_uid.clone().unwrap_or_else(gen_uid);
        self.state = ConnState::Connecting;
        self.close = None;
        self.banlist_seen = false;

        let creds = Rc::clone(&self.ctx.credentials);
        let (room, uid) = (self.name.clone(), self.uid.clone());
        match (&creds.name, &creds.password) {
            (Some(name), Some(password)) => self.send(&["bauth", &room, &uid, name, password]),
            _ => self.send(&["bauth", &room, "", "", ""]),
        }
        self.transport.wire.set_write_lock(true);
    }

    /// Drop per-session state after the socket is gone
    pub(crate) fn end_session(&mut self, next: ConnState) {
        for user in self.roster.drain(..) {
            user.clear_session_ids(&self.name);
        }
        self.pending.clear();
        self.state = next;
    }

    pub(crate) fn request_close(&mut self, request: CloseRequest) {
        if self.close != Some(CloseRequest::Notify) {
            self.close = Some(request);
        }
    }

    // ---- accessors ----

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Name the bot currently speaks as in this room
    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    /// The manager's own user
    pub fn user(&self) -> &Rc<User> {
        &self.ctx.own
    }

    pub fn owner(&self) -> Option<&Rc<User>> {
        self.owner.as_ref()
    }

    pub fn owner_name(&self) -> Option<&str> {
        self.owner.as_ref().map(|u| u.name())
    }

    pub fn mods(&self) -> Vec<Rc<User>> {
        let mut mods: Vec<_> = self.mods.iter().cloned().collect();
        mods.sort_by(|a, b| a.name().cmp(b.name()));
        mods
    }

    pub fn mod_names(&self) -> Vec<String> {
        self.mods().iter().map(|u| u.name().to_string()).collect()
    }

    pub fn user_count(&self) -> u32 {
        self.user_count
    }

    pub fn premium(&self) -> bool {
        self.premium
    }

    pub fn silent(&self) -> bool {
        self.silent
    }

    /// While silent, outgoing chat messages are dropped
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    pub fn history(&self) -> Vec<Rc<Message>> {
        self.store.history().cloned().collect()
    }

    /// Attached message by durable id
    pub fn message_by_id(&self, id: &MessageId) -> Option<Rc<Message>> {
        self.store.get(id)
    }

    /// Number of provisional messages waiting for acknowledgment
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_message(&self, user: Option<&User>) -> Option<Rc<Message>> {
        self.store.last(user)
    }

    /// Whether older history can still be requested
    pub fn has_more_history(&self) -> bool {
        self.history_index.is_some()
    }

    /// Banned users, sorted by name
    pub fn banlist(&self) -> Vec<Rc<User>> {
        let mut users: Vec<_> = self.banlist.keys().cloned().collect();
        users.sort_by(|a, b| a.name().cmp(b.name()));
        users
    }

    pub fn ban_record(&self, user: &User) -> Option<&BanRecord> {
        self.banlist.get(user)
    }

    /// `(target, src)` pairs of recent unbans
    pub fn unbanlist(&self) -> Vec<(Rc<User>, Rc<User>)> {
        let mut pairs: Vec<_> = self
            .unbanlist
            .values()
            .map(|r| (Rc::clone(&r.target), Rc::clone(&r.src)))
            .collect();
        pairs.sort_by(|a, b| a.0.name().cmp(b.0.name()));
        pairs
    }

    /// Users in the room, per mode
    ///
    /// `None` arguments fall back to the manager configuration.
    pub fn userlist(
        &self,
        mode: Option<UserlistMode>,
        unique: Option<bool>,
        memory: Option<usize>,
    ) -> Vec<Rc<User>> {
        let config = &self.ctx.config;
        let users = match mode.unwrap_or(config.userlist_mode) {
            UserlistMode::Recent => self
                .store
                .recent_authors(memory.unwrap_or(config.userlist_memory)),
            UserlistMode::All => self.roster.clone(),
        };
        if unique.unwrap_or(config.userlist_unique) {
            let mut seen = HashSet::new();
            users
                .into_iter()
                .filter(|u| seen.insert(u.name().to_string()))
                .collect()
        } else {
            users
        }
    }

    /// Names in the participant roster
    pub fn usernames(&self) -> Vec<String> {
        self.roster.iter().map(|u| u.name().to_string()).collect()
    }

    /// Find a user by unique partial name, or by exact name when ambiguous
    pub fn find_user(&self, partial: &str) -> Option<Rc<User>> {
        let partial = partial.to_lowercase();
        let matches: HashMap<String, Rc<User>> = self
            .userlist(None, None, None)
            .into_iter()
            .filter(|u| u.name().contains(&partial))
            .map(|u| (u.name().to_string(), u))
            .collect();
        if matches.len() == 1 {
            return matches.into_values().next();
        }
        matches.get(&partial).cloned()
    }

    /// Permission level of `user` in this room
    pub fn level(&self, user: &User) -> Level {
        if self.owner.as_deref() == Some(user) {
            Level::Owner
        } else if self.mods.contains(user) {
            Level::Moderator
        } else {
            Level::Base
        }
    }

    fn own_level(&self) -> Level {
        self.level(&self.ctx.own)
    }

    /// Bytes queued for the socket
    pub fn outgoing(&self) -> &[u8] {
        self.transport.wire.outgoing()
    }

    // ---- inbound ----

    fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    fn handle_ok(&mut self, f: &Frame) {
        let stamp = f.arg(4);
        let head = stamp.rsplit_once('.').map_or(stamp, |(head, _)| head);
        let seed: String = {
            let chars: Vec<char> = head.chars().collect();
            chars[chars.len().saturating_sub(4)..].iter().collect()
        };
        let aid: String = f.arg(1).chars().take(8).collect();
        self.anon_name = format!("!anon{}", anon_id(&seed, &aid));
        self.anon_seed = seed;
        self.bot_name = self.anon_name.clone();

        let creds = Rc::clone(&self.ctx.credentials);
        match (f.arg(2), creds.name.as_deref(), creds.password.as_deref()) {
            ("N", None, None) => {}
            ("N", Some(name), None) => self.login(name, None),
            ("M", name, _) => {
                if let Some(name) = name {
                    self.bot_name = name.to_string();
                }
            }
            (flag, _, _) => {
                warn!(room = %self.name, flag, "Room login failed");
                self.push(Event::LoginFail);
                self.request_close(CloseRequest::Notify);
                return;
            }
        }

        self.owner = Some(self.ctx.users.get(f.arg(0)));
        self.uid = f.arg(1).to_string();
        self.mods = self.parse_mods(f.arg(6).split(';'));
        self.state = ConnState::Authenticating;
    }

    fn parse_mods<'a>(&self, entries: impl Iterator<Item = &'a str>) -> HashSet<Rc<User>> {
        entries
            .filter_map(|entry| entry.split(',').next())
            .filter(|name| !name.is_empty())
            .map(|name| self.ctx.users.get(name))
            .collect()
    }

    fn handle_aliasok(&mut self, _f: &Frame) {
        self.bot_name = format!("#{}", self.login_name);
    }

    fn handle_pwdok(&mut self, _f: &Frame) {
        self.bot_name = self.login_name.clone();
    }

    fn handle_denied(&mut self, _f: &Frame) {
        warn!(room = %self.name, "Room denied the connection");
        self.push(Event::ConnectFail);
        self.request_close(CloseRequest::Quiet);
    }

    fn handle_inited(&mut self, _f: &Frame) {
        self.send(&["g_participants", "start"]);
        self.send(&["getpremium", "1"]);
        self.request_banlist();
        self.request_unbanlist();

        if self.connect_count == 0 {
            info!(room = %self.name, "Connected");
            self.push(Event::Connect);
            self.replay_backlog();
        } else {
            info!(room = %self.name, "Reconnected");
            self.push(Event::Reconnect);
            for msg in std::mem::take(&mut self.backlog) {
                self.store.detach(&msg);
            }
        }
        self.connect_count += 1;
        self.backoff = None;
        self.state = ConnState::Active;
        self.transport.wire.set_write_lock(false);
    }

    /// Fire history events oldest first and move the backlog into history
    fn replay_backlog(&mut self) {
        let backlog = std::mem::take(&mut self.backlog);
        for msg in backlog.into_iter().rev() {
            self.push(Event::HistoryMessage {
                user: Rc::clone(&msg.user),
                message: Rc::clone(&msg),
            });
            self.store.push_history(msg);
        }
        self.push(Event::HistoryMessageUpdate);
    }

    fn handle_premium(&mut self, f: &Frame) {
        let expiry: f64 = f.arg(1).parse().unwrap_or_default();
        self.premium = expiry > unix_now();
        if self.premium {
            if self.ctx.own.bg() {
                self.set_bg_mode(true);
            }
            if self.ctx.own.recording() {
                self.set_recording_mode(true);
            }
        }
    }

    fn handle_mods(&mut self, f: &Frame) {
        let mods = self.parse_mods(f.args.iter().map(String::as_str));
        let mut added: Vec<_> = mods.difference(&self.mods).cloned().collect();
        let mut removed: Vec<_> = self.mods.difference(&mods).cloned().collect();
        added.sort_by(|a, b| a.name().cmp(b.name()));
        removed.sort_by(|a, b| a.name().cmp(b.name()));

        for user in added {
            self.mods.insert(Rc::clone(&user));
            self.push(Event::ModAdd { user });
        }
        for user in removed {
            self.mods.remove(&user);
            self.push(Event::ModRemove { user });
        }
        self.push(Event::ModChange);
    }

    /// Build a message from a `b` or `i` frame
    fn decode_message(&self, f: &Frame) -> Rc<Message> {
        let raw = f.rest(9);
        let clean = clean_message(&raw);
        let puid = f.arg(3);

        let mut name = f.arg(1).to_string();
        let mut name_tag = clean.name_tag.clone();
        if name.is_empty() {
            name = format!("#{}", f.arg(2));
            if name == "#" {
                name = format!("!anon{}", anon_id(&clean.name_tag, puid));
            }
            // the tag carries the anonymous seed, not a color
            name_tag.clear();
        }

        let user = if name.to_lowercase() == self.bot_name.to_lowercase() {
            Rc::clone(&self.ctx.own)
        } else {
            self.ctx.users.get(&name)
        };

        Rc::new(Message::new(
            user,
            self.id(),
            MessageParts {
                time: f.arg(0).parse().unwrap_or_default(),
                body: clean.body,
                raw,
                ip: f.arg(6).to_string(),
                unid: f.arg(4).to_string(),
                puid: puid.to_string(),
                name_tag,
                font_tag: clean.font_tag,
            },
        ))
    }

    /// Authors other than the bot take on the style of their latest message
    fn adopt_style(&self, msg: &Message) {
        if !Rc::ptr_eq(&msg.user, &self.ctx.own) {
            msg.user.set_style(Style {
                name_color: msg.name_color.clone(),
                font_color: msg.font_color.clone(),
                font_face: msg.font_face.clone(),
                font_size: msg.font_size,
            });
        }
    }

    fn handle_b(&mut self, f: &Frame) {
        let msg = self.decode_message(f);
        self.pending.insert(f.arg(5).to_string(), msg);
    }

    fn handle_u(&mut self, f: &Frame) {
        let Some(msg) = self.pending.remove(f.arg(0)) else {
            debug!(room = %self.name, token = f.arg(0), "Acknowledgment for unknown message");
            return;
        };
        self.adopt_style(&msg);
        self.store.attach(&msg, MessageId::new(f.arg(1)));
        self.store.push_history(Rc::clone(&msg));
        self.push(Event::Message {
            user: Rc::clone(&msg.user),
            message: msg,
        });
    }

    fn handle_i(&mut self, f: &Frame) {
        let msg = self.decode_message(f);
        self.adopt_style(&msg);
        if !f.arg(5).is_empty() {
            self.store.attach(&msg, MessageId::new(f.arg(5)));
        }
        self.backlog.push(msg);
    }

    fn handle_gotmore(&mut self, _f: &Frame) {
        self.fetching_history = false;
        self.replay_backlog();
    }

    fn handle_nomore(&mut self, _f: &Frame) {
        self.history_index = None;
    }

    fn handle_participants(&mut self, f: &Frame) {
        for user in self.roster.drain(..) {
            user.clear_session_ids(&self.name);
        }
        let joined = f.rest(0);
        for entry in joined.split(';') {
            let data: Vec<&str> = entry.split(':').collect();
            if data.len() < 4 {
                continue;
            }
            let name = data[3].to_lowercase();
            if name == "none" {
                continue;
            }
            let user = self.ctx.users.get(&name);
            user.add_session_id(&self.name, data[0]);
            self.roster.push(user);
        }
        debug!(room = %self.name, participants = self.roster.len(), "Participant snapshot");
    }

    fn handle_participant(&mut self, f: &Frame) {
        let name = f.arg(3).to_lowercase();
        if name == "none" || name.is_empty() {
            return;
        }
        let user = self.ctx.users.get(&name);
        let sid = f.arg(1);
        let puid = f.arg(2).to_string();
        let unique = self.ctx.config.userlist_event_unique;

        if f.arg(0) == "0" {
            user.remove_session_id(&self.name, sid);
            if let Some(pos) = self.roster.iter().position(|u| *u == user) {
                self.roster.remove(pos);
            }
            if !self.roster.contains(&user) || !unique {
                self.push(Event::Leave { user, puid });
            }
        } else {
            user.add_session_id(&self.name, sid);
            let first_session = !self.roster.contains(&user);
            self.roster.push(Rc::clone(&user));
            if first_session || !unique {
                self.push(Event::Join { user, puid });
            }
        }
    }

    fn handle_flood_warning(&mut self, _f: &Frame) {
        self.push(Event::FloodWarning);
    }

    fn handle_flood_ban(&mut self, _f: &Frame) {
        self.push(Event::FloodBan);
    }

    fn handle_flood_ban_repeat(&mut self, _f: &Frame) {
        self.push(Event::FloodBanRepeat);
    }

    fn delete_by_id(&mut self, id: &str) {
        if let Some(msg) = self.store.delete(&MessageId::new(id)) {
            self.push(Event::MessageDelete {
                user: Rc::clone(&msg.user),
                message: msg,
            });
        }
    }

    fn handle_delete(&mut self, f: &Frame) {
        self.delete_by_id(f.arg(0));
    }

    fn handle_deleteall(&mut self, f: &Frame) {
        for id in &f.args {
            self.delete_by_id(id);
        }
    }

    fn handle_user_count(&mut self, f: &Frame) {
        match u32::from_str_radix(f.arg(0), 16) {
            Ok(count) => {
                self.user_count = count;
                self.push(Event::UserCountChange);
            }
            Err(_) => debug!(room = %self.name, value = f.arg(0), "Bad user count"),
        }
    }

    fn parse_ban_records(&self, f: &Frame) -> HashMap<Rc<User>, BanRecord> {
        let joined = f.rest(0);
        joined
            .split(';')
            .filter_map(|section| {
                let p: Vec<&str> = section.split(':').collect();
                if p.len() != 5 || p[2].is_empty() {
                    return None;
                }
                let target = self.ctx.users.get(p[2]);
                let record = BanRecord {
                    unid: p[0].to_string(),
                    ip: p[1].to_string(),
                    target: Rc::clone(&target),
                    time: p[3].parse().ok()?,
                    src: self.ctx.users.get(p[4]),
                };
                Some((target, record))
            })
            .collect()
    }

    fn handle_blocklist(&mut self, f: &Frame) {
        let records = self.parse_ban_records(f);

        if !self.banlist_seen {
            self.banlist = records;
            self.banlist_seen = true;
            self.push(Event::BanlistUpdate);
            return;
        }

        let mut added: Vec<_> = records
            .keys()
            .filter(|u| !self.banlist.contains_key(*u))
            .cloned()
            .collect();
        let mut removed: Vec<_> = self
            .banlist
            .keys()
            .filter(|u| !records.contains_key(*u))
            .cloned()
            .collect();
        added.sort_by(|a, b| a.name().cmp(b.name()));
        removed.sort_by(|a, b| a.name().cmp(b.name()));

        self.banlist = records;
        for target in added {
            self.push(Event::BanlistAdd { target });
        }
        for target in removed {
            self.push(Event::BanlistRemove { target });
        }
    }

    fn handle_unblocklist(&mut self, f: &Frame) {
        self.unbanlist = self.parse_ban_records(f);
        self.push(Event::UnbanlistUpdate);
    }

    fn handle_blocked(&mut self, f: &Frame) {
        if f.arg(2).is_empty() {
            return;
        }
        let target = self.ctx.users.get(f.arg(2));
        let user = self.ctx.users.get(f.arg(3));
        self.banlist.insert(
            Rc::clone(&target),
            BanRecord {
                unid: f.arg(0).to_string(),
                ip: f.arg(1).to_string(),
                target: Rc::clone(&target),
                time: f.arg(4).parse().unwrap_or_default(),
                src: Rc::clone(&user),
            },
        );
        self.push(Event::Ban { user, target });
    }

    fn handle_unblocked(&mut self, f: &Frame) {
        if f.arg(2).is_empty() {
            return;
        }
        let target = self.ctx.users.get(f.arg(2));
        let user = self.ctx.users.get(f.arg(3));
        self.banlist.remove(&target);
        self.unbanlist.insert(
            Rc::clone(&target),
            BanRecord {
                unid: f.arg(0).to_string(),
                ip: f.arg(1).to_string(),
                target: Rc::clone(&target),
                time: f.arg(4).parse().unwrap_or_default(),
                src: Rc::clone(&user),
            },
        );
        self.push(Event::Unban { user, target });
    }

    // ---- outbound ----

    fn send(&mut self, fields: &[&str]) {
        self.transport.wire.send_command(fields);
    }

    /// Log in, or take a temporary name when no password is given
    pub fn login(&mut self, name: &str, password: Option<&str>) {
        match password {
            Some(password) => self.send(&["blogin", name, password]),
            None => self.send(&["blogin", name]),
        }
        self.login_name = name.to_string();
    }

    /// Log out and speak anonymously again
    pub fn logout(&mut self) {
        self.send(&["blogout"]);
        self.bot_name = self.anon_name.clone();
    }

    pub fn ping(&mut self) {
        self.send(&[""]);
        self.push(Event::Ping);
    }

    /// Send a body as is, without name or font tags
    pub fn raw_message(&mut self, body: &str) {
        if !self.silent {
            self.send(&["bmsg", "tl2r", body]);
        }
    }

    /// Send plain text; markup is escaped
    pub fn message(&mut self, text: &str) {
        self.send_message(text, false);
    }

    /// Send text that already contains markup
    pub fn message_html(&mut self, text: &str) {
        self.send_message(text, true);
    }

    fn send_message(&mut self, text: &str, html: bool) {
        let text = text.trim_end();
        let text = if html { text.to_string() } else { escape_html(text) };
        let max = self.ctx.config.max_length;

        let chunks = split_chars(&text, max);
        let chunks = match self.ctx.config.too_big_message {
            BigMessage::Cut => &chunks[..chunks.len().min(1)],
            BigMessage::Multiple => &chunks[..],
        };
        for chunk in chunks {
            let tagged = self.tag_message(chunk);
            self.raw_message(&tagged);
        }
    }

    /// Prefix the font and name tags and turn newlines into CR
    fn tag_message(&self, body: &str) -> String {
        let mut out = String::new();
        if self.bot_name.starts_with("!anon") {
            out.push_str(&format!("<n{}/>", self.anon_seed));
        } else {
            let style = self.ctx.own.style();
            out.push_str(&format!(
                "<f x{:02}{}=\"{}\">",
                style.font_size, style.font_color, style.font_face
            ));
            out.push_str(&format!("<n{}/>", style.name_color));
        }
        out.push_str(body);
        out.replace('\n', "\r")
    }

    pub fn set_bg_mode(&mut self, on: bool) {
        self.send(&["msgbg", if on { "1" } else { "0" }]);
    }

    pub fn set_recording_mode(&mut self, on: bool) {
        self.send(&["msgmedia", if on { "1" } else { "0" }]);
    }

    /// Owner only
    pub fn add_mod(&mut self, user: &User) {
        if self.own_level() == Level::Owner {
            self.send(&["addmod", user.name()]);
        }
    }

    /// Owner only
    pub fn remove_mod(&mut self, user: &User) {
        if self.own_level() == Level::Owner {
            self.send(&["removemod", user.name()]);
        }
    }

    pub fn flag(&mut self, message: &Message) {
        if let Some(id) = message.id() {
            self.send(&["g_flag", id.as_str()]);
        }
    }

    /// Flag the user's latest message; false when there is none
    pub fn flag_user(&mut self, user: &User) -> bool {
        match self.last_message(Some(user)) {
            Some(msg) => {
                self.flag(&msg);
                true
            }
            None => false,
        }
    }

    /// Moderator only
    pub fn delete_message(&mut self, message: &Message) {
        if self.own_level() < Level::Moderator {
            return;
        }
        if let Some(id) = message.id() {
            self.send(&["delmsg", id.as_str()]);
        }
    }

    /// Delete the user's latest message (moderator only)
    ///
    /// False when nothing was sent.
    pub fn delete_user(&mut self, user: &User) -> bool {
        if self.own_level() < Level::Moderator {
            return false;
        }
        match self.last_message(Some(user)).and_then(|m| m.id()) {
            Some(id) => {
                self.send(&["delmsg", id.as_str()]);
                true
            }
            None => false,
        }
    }

    pub fn raw_clear_user(&mut self, unid: &str, ip: &str, name: &str) {
        self.send(&["delallmsg", unid, ip, name]);
    }

    /// Delete every message of a user (moderator only)
    pub fn clear_user(&mut self, user: &User) -> bool {
        if self.own_level() < Level::Moderator {
            return false;
        }
        let Some(msg) = self.last_message(Some(user)) else {
            return false;
        };
        // anonymous and temporary names are cleared by unid/ip only
        let name = if msg.user.name().starts_with(['!', '#']) {
            ""
        } else {
            msg.user.name()
        };
        self.raw_clear_user(&msg.unid, &msg.ip, name);
        true
    }

    /// Owner only
    pub fn clear_all(&mut self) {
        if self.own_level() == Level::Owner {
            self.send(&["clearall"]);
        }
    }

    pub fn raw_ban(&mut self, name: &str, ip: &str, unid: &str) {
        self.send(&["block", unid, ip, name]);
    }

    /// Ban the author of a message (moderator only)
    pub fn ban(&mut self, message: &Message) {
        if self.own_level() >= Level::Moderator {
            self.raw_ban(message.user.name(), &message.ip, &message.unid);
        }
    }

    /// Ban a user through their latest message
    pub fn ban_user(&mut self, user: &User) -> bool {
        match self.last_message(Some(user)) {
            Some(msg) => {
                self.ban(&msg);
                true
            }
            None => false,
        }
    }

    pub fn request_banlist(&mut self) {
        self.send(&["blocklist", "block", "", "next", BANLIST_PAGE]);
    }

    pub fn request_unbanlist(&mut self) {
        self.send(&["blocklist", "unblock", "", "next", BANLIST_PAGE]);
    }

    pub fn raw_unban(&mut self, name: &str, ip: &str, unid: &str) {
        self.send(&["removeblock", unid, ip, name]);
    }

    /// Lift a ban (moderator only); false when the user is not banned
    pub fn unban(&mut self, user: &User) -> bool {
        if self.own_level() < Level::Moderator {
            return false;
        }
        let Some(record) = self.banlist.get(user).cloned() else {
            return false;
        };
        self.raw_unban(record.target.name(), &record.ip, &record.unid);
        true
    }

    /// Request the next page of older messages
    ///
    /// At most one page is in flight. Returns whether more history exists.
    pub fn get_more_history(&mut self) -> bool {
        if let (Some(index), false) = (self.history_index, self.fetching_history) {
            self.fetching_history = true;
            self.send(&["get_more", HISTORY_PAGE, &index.to_string()]);
            self.history_index = Some(index + 1);
        }
        self.history_index.is_some()
    }
}

/// Split on character boundaries into pieces of at most `max` characters
fn split_chars(text: &str, max: usize) -> Vec<&str> {
    if text.is_empty() || max == 0 {
        return vec![text];
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (offset, _) in text.char_indices() {
        if count == max {
            pieces.push(&text[start..offset]);
            start = offset;
            count = 0;
        }
        count += 1;
    }
    pieces.push(&text[start..]);
    pieces
}

impl Conn for Room {
    fn id(&self) -> ConnId {
        ConnId::Room(self.name.clone())
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
        match ROOM_HANDLERS.get(frame.verb.as_str()) {
            Some(handler) => handler(self, &frame),
            None => debug!(room = %self.name, verb = %frame.verb, "Unhandled command"),
        }
    }

    fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    fn close_request(&self) -> Option<CloseRequest> {
        self.close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, ManagerConfig};
    use crate::user::UserRegistry;

    fn room_with(config: ManagerConfig, creds: Credentials) -> Room {
        let ctx = ConnContext::new(config, creds, UserRegistry::new());
        let mut room = Room::with_address("Lobby", "127.0.0.1", 443, ctx);
        room.start_session();
        room
    }

    fn anon_room() -> Room {
        room_with(ManagerConfig::default(), Credentials::anonymous())
    }

    fn names(events: &[Event]) -> Vec<&'static str> {
        events.iter().map(Event::name).collect()
    }

    /// Bring a room to the active state and clear its outbox
    fn bootstrap(room: &mut Room, ok: &str) {
        room.process(ok);
        room.process("inited");
        room.take_events();
        let sent = room.outgoing().len();
        room.transport_mut().wire.consume(sent);
    }

    const ANON_OK: &str = "ok:owner:24013249513847:N::1600001234.567:127.0.0.1:mod1,82;mod2,82";

    #[test]
    fn test_anonymous_auth_and_write_lock() {
        let mut room = anon_room();
        assert_eq!(room.name(), "lobby");
        assert_eq!(room.state(), ConnState::Connecting);
        assert_eq!(room.outgoing(), b"bauth:lobby:::\x00");

        room.process(ANON_OK);
        assert_eq!(room.bot_name(), "!anon4473");
        room.message("queued");
        assert_eq!(room.outgoing(), b"bauth:lobby:::\x00");

        assert_eq!(room.owner_name(), Some("owner"));
        assert_eq!(room.mod_names(), vec!["mod1", "mod2"]);
        assert_eq!(room.state(), ConnState::Authenticating);

        room.process("inited");
        assert_eq!(room.state(), ConnState::Active);
        let out = String::from_utf8(room.outgoing().to_vec()).unwrap();
        assert!(out.starts_with("bauth:lobby:::\x00bmsg:tl2r:<n1234/>queued\r\n\x00"));
        assert!(out.contains("g_participants:start\r\n\x00"));
        assert!(out.contains("getpremium:1\r\n\x00"));
        assert!(out.contains("blocklist:block::next:500\r\n\x00"));
        assert!(out.ends_with("blocklist:unblock::next:500\r\n\x00"));
    }

    #[test]
    fn test_named_auth_sends_password() {
        let creds = Credentials::new(Some("Bot".into()), Some("secret".into()));
        let mut room = room_with(ManagerConfig::default(), creds).with_uid("1111222233334444");
        room.start_session();
        assert_eq!(room.outgoing(), b"bauth:lobby:1111222233334444:Bot:secret\x00");

        room.process("ok:owner:24013249513847:M::1600001234.567:127.0.0.1:");
        assert_eq!(room.bot_name(), "Bot");
        assert!(room.mods().is_empty());
    }

    #[test]
    fn test_temporary_name_logs_in() {
        let creds = Credentials::new(Some("guest".into()), None);
        let mut room = room_with(ManagerConfig::default(), creds);
        room.process(ANON_OK);
        assert!(room.transport().wire.shadowed().ends_with(b"blogin:guest\r\n\x00"));
        room.process("aliasok");
        assert_eq!(room.bot_name(), "#guest");
    }

    #[test]
    fn test_failed_login_requests_close() {
        let creds = Credentials::new(Some("bot".into()), Some("wrong".into()));
        let mut room = room_with(ManagerConfig::default(), creds);
        room.process("ok:owner:24013249513847:C::1600001234.567:127.0.0.1:");
        assert_eq!(names(&room.take_events()), vec!["raw", "login_fail"]);
        assert_eq!(room.close_request(), Some(CloseRequest::Notify));

        // nothing is processed once closing
        room.process("inited");
        assert!(room.take_events().is_empty());
    }

    #[test]
    fn test_denied_closes_quietly() {
        let mut room = anon_room();
        room.process("denied");
        assert_eq!(names(&room.take_events()), vec!["raw", "connect_fail"]);
        assert_eq!(room.close_request(), Some(CloseRequest::Quiet));
    }

    #[test]
    fn test_provisional_message_is_attached_on_ack() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);

        room.process(r#"b:1600000000.5:Alice::puid1:unid1:5:1.2.3.4:::<n3C0/><f x14F00="2">hello: world"#);
        assert_eq!(room.pending_len(), 1);
        assert!(room.history().is_empty());

        room.process("u:5:msg-42");
        assert_eq!(room.pending_len(), 0);
        let events = room.take_events();
        assert_eq!(names(&events), vec!["raw", "raw", "message"]);

        let msg = room.message_by_id(&MessageId::new("msg-42")).unwrap();
        assert_eq!(msg.body, "hello: world");
        assert_eq!(msg.user.name(), "alice");
        assert_eq!(msg.ip, "1.2.3.4");
        assert_eq!(msg.unid, "unid1");
        assert_eq!(msg.font_size, 14);
        assert_eq!(msg.user.style().name_color, "3C0");
        assert_eq!(msg.user.style().font_color, "F00");
        assert_eq!(room.history().len(), 1);
    }

    #[test]
    fn test_unknown_ack_is_ignored() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.process("u:99:msg-1");
        assert_eq!(names(&room.take_events()), vec!["raw"]);
        assert!(room.history().is_empty());
    }

    #[test]
    fn test_anonymous_author_names() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.process("b:1.0::temp:p:u:1:ip:::hi");
        room.process("b:1.0:::12344368:u:2:ip:::<n1297/>hi");
        room.process("u:1:a");
        room.process("u:2:b");
        let history = room.history();
        assert_eq!(history[0].user.name(), "#temp");
        assert_eq!(history[1].user.name(), "!anon5555");
        assert_eq!(history[1].name_color, "000");
    }

    #[test]
    fn test_own_messages_use_own_user() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.process("b:1.0:::24013249513847:u:1:ip:::<n1234/>me");
        room.process("b:1.0:!ANON4473::p:u:2:ip:::me again");
        room.process("u:1:a");
        room.process("u:2:b");
        for msg in room.history() {
            assert!(Rc::ptr_eq(&msg.user, room.user()));
        }
    }

    #[test]
    fn test_inited_resets_reconnect_backoff() {
        let mut room = anon_room();
        room.backoff = Some(Duration::from_millis(400));
        room.process(ANON_OK);
        assert_eq!(room.backoff, Some(Duration::from_millis(400)));
        room.process("inited");
        assert_eq!(room.backoff, None);
    }

    #[test]
    fn test_backlog_replays_oldest_first_once() {
        let mut room = anon_room();
        room.process(ANON_OK);
        room.process("i:3.0:carol::p:u:m3:ip:::third");
        room.process("i:2.0:bob::p:u:m2:ip:::second");
        room.process("i:1.0:alice::p:u:m1:ip:::first");
        room.process("inited");

        let events = room.take_events();
        let replayed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::HistoryMessage { message, .. } => Some(message.body.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, vec!["first", "second", "third"]);
        assert!(names(&events).contains(&"connect"));
        assert_eq!(names(&events).last(), Some(&"history_message_update"));

        let bodies: Vec<_> = room.history().iter().map(|m| m.body.clone()).collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);

        // reconnect: backlog is cleared without replay
        room.start_session();
        room.process(ANON_OK);
        room.process("i:4.0:dave::p:u:m4:ip:::late");
        room.process("inited");
        let events = room.take_events();
        assert!(names(&events).contains(&"reconnect"));
        assert!(!names(&events).contains(&"history_message"));
        assert!(room.message_by_id(&MessageId::new("m4")).is_none());
        assert_eq!(room.history().len(), 3);
    }

    #[test]
    fn test_history_paging() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);

        assert!(room.get_more_history());
        assert!(room.outgoing().ends_with(b"get_more:20:0\r\n\x00"));
        let len = room.outgoing().len();
        // second request waits for the first batch
        room.get_more_history();
        assert_eq!(room.outgoing().len(), len);

        room.process("i:1.0:old::p:u:m0:ip:::older");
        room.process("gotmore");
        assert_eq!(
            names(&room.take_events()),
            vec!["raw", "raw", "history_message", "history_message_update"]
        );

        room.get_more_history();
        assert!(room.outgoing().ends_with(b"get_more:20:1\r\n\x00"));
        room.process("nomore");
        assert!(!room.has_more_history());
    }

    #[test]
    fn test_delete_fires_once() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.process("b:1.0:alice::p:u:1:ip:::hello");
        room.process("u:1:msg-42");
        room.take_events();

        room.process("delete:msg-42");
        room.process("delete:msg-42");
        let deletes = room
            .take_events()
            .iter()
            .filter(|e| matches!(e, Event::MessageDelete { .. }))
            .count();
        assert_eq!(deletes, 1);
        assert!(room.history().is_empty());
        assert!(room.message_by_id(&MessageId::new("msg-42")).is_none());
    }

    #[test]
    fn test_deleteall() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        for (token, id) in [("1", "a"), ("2", "b"), ("3", "c")] {
            room.process(&format!("b:1.0:alice::p:u:{token}:ip:::x"));
            room.process(&format!("u:{token}:{id}"));
        }
        room.take_events();
        room.process("deleteall:a:c:zzz");
        assert_eq!(
            names(&room.take_events()),
            vec!["raw", "message_delete", "message_delete"]
        );
        assert_eq!(room.history().len(), 1);
    }

    #[test]
    fn test_participants_and_event_uniqueness() {
        let config = ManagerConfig {
            userlist_event_unique: true,
            ..Default::default()
        };
        let mut room = room_with(config, Credentials::anonymous());
        bootstrap(&mut room, ANON_OK);

        room.process("g_participants:s1:1.0:p1:Alice:None:0;s2:1.0:p2:None:x:0");
        assert_eq!(room.usernames(), vec!["alice"]);
        let alice = room.ctx.users.get("alice");
        assert!(alice.has_session_id(Some("lobby"), "s1"));

        // second session of alice: no join event in unique mode
        room.process("participant:1:s3:p3:alice:None:0:0");
        room.process("participant:1:s4:p4:bob:None:0:0");
        room.process("participant:0:s3:p3:alice:None:0:0");
        room.process("participant:0:s1:p1:alice:None:0:0");
        let events = room.take_events();
        let interesting: Vec<_> = names(&events).into_iter().filter(|n| *n != "raw").collect();
        assert_eq!(interesting, vec!["join", "leave"]);
        assert_eq!(room.usernames(), vec!["bob"]);
        assert!(alice.session_ids(Some("lobby")).is_empty());

        // a new snapshot replaces the roster
        room.process("g_participants:s9:1.0:p9:carol:None:0");
        assert_eq!(room.usernames(), vec!["carol"]);
        assert!(room.ctx.users.get("bob").session_ids(Some("lobby")).is_empty());
    }

    #[test]
    fn test_join_leave_without_uniqueness() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.process("participant:1:s1:p1:alice:None:0:0");
        room.process("participant:1:s2:p2:alice:None:0:0");
        let joins = room
            .take_events()
            .iter()
            .filter(|e| matches!(e, Event::Join { .. }))
            .count();
        assert_eq!(joins, 2);
    }

    #[test]
    fn test_mod_diff() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.process("mods:mod2,82:mod3,82");
        let events = room.take_events();
        assert_eq!(names(&events), vec!["raw", "mod_add", "mod_remove", "mod_change"]);
        match &events[1] {
            Event::ModAdd { user } => assert_eq!(user.name(), "mod3"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(room.mod_names(), vec!["mod2", "mod3"]);
    }

    #[test]
    fn test_ban_snapshot_diff() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.process("blocklist:u1:1.1.1.1:A:100.0:mod1;u2:2.2.2.2:B:101.0:mod1");
        assert_eq!(names(&room.take_events()), vec!["raw", "banlist_update"]);

        room.process("blocklist:u2:2.2.2.2:B:101.0:mod1;u3:3.3.3.3:C:102.0:mod1");
        let events = room.take_events();
        assert_eq!(names(&events), vec!["raw", "banlist_add", "banlist_remove"]);
        match (&events[1], &events[2]) {
            (Event::BanlistAdd { target: added }, Event::BanlistRemove { target: removed }) => {
                assert_eq!(added.name(), "c");
                assert_eq!(removed.name(), "a");
            }
            other => panic!("unexpected {other:?}"),
        }
        let banned: Vec<_> = room.banlist().iter().map(|u| u.name().to_string()).collect();
        assert_eq!(banned, vec!["b", "c"]);
    }

    #[test]
    fn test_live_ban_and_unban() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.process("blocked:u1:1.1.1.1:Troll:mod1:100.0");
        room.process("unblocked:u1:1.1.1.1:Troll:mod1:101.0");
        room.process("unblocked:u1:1.1.1.1::mod1:101.0");
        assert_eq!(names(&room.take_events()), vec!["raw", "ban", "raw", "unban", "raw"]);
        assert!(room.banlist().is_empty());
        let unbans = room.unbanlist();
        assert_eq!(unbans.len(), 1);
        assert_eq!(unbans[0].0.name(), "troll");
        assert_eq!(unbans[0].1.name(), "mod1");
    }

    #[test]
    fn test_permission_gates_are_silent() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.process("b:1.0:alice::p:unid:1:1.2.3.4:::hello");
        room.process("u:1:msg-1");
        let alice = room.ctx.users.get("alice");
        let msg = room.message_by_id(&MessageId::new("msg-1")).unwrap();

        room.add_mod(&alice);
        room.remove_mod(&alice);
        room.clear_all();
        room.delete_message(&msg);
        room.ban(&msg);
        assert!(!room.clear_user(&alice));
        assert!(!room.delete_user(&alice));
        assert!(!room.unban(&alice));
        assert!(room.outgoing().is_empty());

        // flagging needs no privilege
        assert!(room.flag_user(&alice));
        assert_eq!(room.outgoing(), b"g_flag:msg-1\r\n\x00");
    }

    #[test]
    fn test_moderator_commands() {
        let creds = Credentials::new(Some("mod1".into()), Some("pw".into()));
        let mut room = room_with(ManagerConfig::default(), creds);
        bootstrap(&mut room, "ok:owner:24013249513847:M::1600001234.567:127.0.0.1:mod1,82");
        assert_eq!(room.level(room.user()), Level::Moderator);

        room.process("b:1.0:alice::p:unid7:1:1.2.3.4:::hello");
        room.process("u:1:msg-1");
        let alice = room.ctx.users.get("alice");

        room.add_mod(&alice);
        assert!(room.outgoing().is_empty());

        assert!(room.ban_user(&alice));
        assert!(room.clear_user(&alice));
        assert!(room.delete_user(&alice));
        let out = String::from_utf8(room.outgoing().to_vec()).unwrap();
        assert_eq!(
            out,
            "block:unid7:1.2.3.4:alice\r\n\x00delallmsg:unid7:1.2.3.4:alice\r\n\x00delmsg:msg-1\r\n\x00"
        );

        // no attached message left for bob
        let bob = room.ctx.users.get("bob");
        let sent = room.outgoing().len();
        assert!(!room.delete_user(&bob));
        assert_eq!(room.outgoing().len(), sent);

        room.process("blocked:unid7:1.2.3.4:alice:mod1:100.0");
        assert!(room.unban(&alice));
        assert!(room.outgoing().ends_with(b"removeblock:unid7:1.2.3.4:alice\r\n\x00"));
    }

    #[test]
    fn test_owner_commands() {
        let creds = Credentials::new(Some("owner".into()), Some("pw".into()));
        let mut room = room_with(ManagerConfig::default(), creds);
        bootstrap(&mut room, "ok:owner:24013249513847:M::1600001234.567:127.0.0.1:");
        let bob = room.ctx.users.get("bob");
        room.add_mod(&bob);
        room.remove_mod(&bob);
        room.clear_all();
        assert_eq!(
            room.outgoing(),
            b"addmod:bob\r\n\x00removemod:bob\r\n\x00clearall\r\n\x00"
        );
    }

    #[test]
    fn test_named_message_formatting() {
        let creds = Credentials::new(Some("bot".into()), Some("pw".into()));
        let mut room = room_with(ManagerConfig::default(), creds);
        bootstrap(&mut room, "ok:owner:24013249513847:M::1600001234.567:127.0.0.1:");
        room.user().set_name_color("F00");
        room.user().set_font_size(9);
        room.message("a <b>\nline  ");
        assert_eq!(
            room.outgoing(),
            b"bmsg:tl2r:<f x09000=\"0\"><nF00/>a &lt;b&gt;\rline\r\n\x00".as_slice()
        );
    }

    #[test]
    fn test_long_message_policies() {
        let config = ManagerConfig {
            max_length: 4,
            ..Default::default()
        };
        let mut room = room_with(config, Credentials::anonymous());
        bootstrap(&mut room, ANON_OK);
        room.message("abcdefghij");
        let out = String::from_utf8(room.outgoing().to_vec()).unwrap();
        assert_eq!(out.matches("bmsg:tl2r").count(), 3);
        assert!(out.contains("<n1234/>abcd\r\n"));
        assert!(out.contains("<n1234/>ij\r\n"));

        let config = ManagerConfig {
            max_length: 4,
            too_big_message: BigMessage::Cut,
            ..Default::default()
        };
        let mut room = room_with(config, Credentials::anonymous());
        bootstrap(&mut room, ANON_OK);
        room.message("abcdefghij");
        assert_eq!(room.outgoing(), b"bmsg:tl2r:<n1234/>abcd\r\n\x00");
    }

    #[test]
    fn test_silent_drops_chat_only() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.set_silent(true);
        room.message("hush");
        assert!(room.outgoing().is_empty());
        room.ping();
        assert_eq!(room.outgoing(), b"\r\n\x00");
        assert_eq!(names(&room.take_events()), vec!["ping"]);
    }

    #[test]
    fn test_user_count_and_flood() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.process("n:1f");
        room.process("n:zz");
        room.process("show_fw");
        room.process("show_tb:900");
        room.process("tb:300");
        room.process("mystery:verb");
        assert_eq!(room.user_count(), 31);
        assert_eq!(
            names(&room.take_events()),
            vec![
                "raw",
                "user_count_change",
                "raw",
                "raw",
                "flood_warning",
                "raw",
                "flood_ban",
                "raw",
                "flood_ban_repeat",
                "raw"
            ]
        );
    }

    #[test]
    fn test_userlist_modes_and_find_user() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        for (i, name) in ["alice", "bob", "alice", "albert"].iter().enumerate() {
            room.process(&format!("b:1.0:{name}::p:u:{i}:ip:::x"));
            room.process(&format!("u:{i}:id{i}"));
        }
        let recent: Vec<_> = room
            .userlist(None, None, Some(3))
            .iter()
            .map(|u| u.name().to_string())
            .collect();
        assert_eq!(recent, vec!["bob", "alice", "albert"]);
        assert_eq!(room.userlist(None, Some(false), None).len(), 4);

        assert_eq!(room.find_user("BO").unwrap().name(), "bob");
        assert!(room.find_user("al").is_none());
        assert_eq!(room.find_user("alice").unwrap().name(), "alice");

        room.process("participant:1:s1:p1:zed:None:0:0");
        let all = room.userlist(Some(UserlistMode::All), None, None);
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_logout_reverts_to_anon() {
        let creds = Credentials::new(Some("bot".into()), Some("pw".into()));
        let mut room = room_with(ManagerConfig::default(), creds);
        bootstrap(&mut room, "ok:owner:24013249513847:M::1600001234.567:127.0.0.1:");
        room.logout();
        assert_eq!(room.bot_name(), "!anon4473");
        room.login("bot", Some("pw"));
        assert!(room.outgoing().ends_with(b"blogin:bot:pw\r\n\x00"));
        room.process("pwdok");
        assert_eq!(room.bot_name(), "bot");
    }

    #[test]
    fn test_premium_reapplies_modes() {
        let mut room = anon_room();
        bootstrap(&mut room, ANON_OK);
        room.user().set_bg(true);
        room.process("premium:210:9999999999");
        assert!(room.premium());
        assert_eq!(room.outgoing(), b"msgbg:1\r\n\x00");
        room.process("premium:210:1");
        assert!(!room.premium());
    }

    #[test]
    fn test_split_chars_respects_boundaries() {
        assert_eq!(split_chars("héllo", 2), vec!["hé", "ll", "o"]);
        assert_eq!(split_chars("", 3), vec![""]);
        assert_eq!(split_chars("abc", 3), vec!["abc"]);
    }
}
