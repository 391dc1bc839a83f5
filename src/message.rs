//! Chat messages, ban records and markup handling
//!
//! A [`Message`] starts provisional (known only by a per-connection
//! sequence token) and becomes attached once the server assigns a durable
//! [`MessageId`]. [`MessageStore`] owns the id-keyed table and the bounded
//! history of one connection; evicting a message from history detaches it.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::trace;

use crate::types::{ConnId, MessageId};
use crate::user::User;

static NAME_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<n(.*?)/>").expect("valid regex"));
static FONT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<f(.*?)>").expect("valid regex"));
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<.*?>").expect("valid regex"));
static FONT_ATTRS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"x(\d{2})s?(.{0,6})="(.*?)""#).expect("valid regex"));
static ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").expect("valid regex"));

/// Default font size of a message without a font tag
const DEFAULT_MESSAGE_FONT_SIZE: u8 = 11;

/// A message body after markup removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanBody {
    pub body: String,
    /// Contents of the `<n.../>` tag (name color, or the anonymous seed)
    pub name_tag: String,
    /// Contents of the `<f...>` tag
    pub font_tag: String,
}

/// Font attributes carried by an `<f ...>` tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Font {
    pub size: u8,
    pub color: String,
    pub face: String,
}

/// Extract the name and font tags, strip every tag, unescape and trim
pub fn clean_message(raw: &str) -> CleanBody {
    let capture = |re: &Regex| {
        re.captures(raw)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    };
    let name_tag = capture(&NAME_TAG);
    let font_tag = capture(&FONT_TAG);
    let body = unescape_html(&strip_html(raw)).trim().to_string();
    CleanBody {
        body,
        name_tag,
        font_tag,
    }
}

/// Remove every `<...>` tag
pub fn strip_html(text: &str) -> String {
    ANY_TAG.replace_all(text, "").into_owned()
}

/// Decode the character references the server emits
pub fn unescape_html(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures<'_>| {
            let entity = &caps[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}

/// Parse the inside of a font tag, e.g. ` x12F00="1"`
pub fn parse_font(tag: &str) -> Option<Font> {
    let caps = FONT_ATTRS.captures(tag)?;
    Some(Font {
        size: caps[1].parse().ok()?,
        color: caps[2].to_string(),
        face: caps[3].to_string(),
    })
}

/// Escape markup in outgoing plain text
pub fn escape_html(text: &str) -> String {
    text.replace('<', "&lt;").replace('>', "&gt;")
}

/// One chat line
pub struct Message {
    id: RefCell<Option<MessageId>>,
    pub time: f64,
    pub user: Rc<User>,
    /// Body with markup removed
    pub body: String,
    /// Body as received
    pub raw: String,
    /// Sender IP (rooms only, often empty)
    pub ip: String,
    pub unid: String,
    pub puid: String,
    pub name_color: String,
    pub font_color: String,
    pub font_face: String,
    pub font_size: u8,
    /// Connection the message arrived on
    pub origin: ConnId,
}

/// Everything needed to build a [`Message`]
#[derive(Debug, Clone)]
pub struct MessageParts {
    pub time: f64,
    pub body: String,
    pub raw: String,
    pub ip: String,
    pub unid: String,
    pub puid: String,
    pub name_tag: String,
    pub font_tag: String,
}

impl Message {
    /// Build a message from its decoded parts
    ///
    /// Missing display attributes fall back to the protocol defaults.
    pub fn new(user: Rc<User>, origin: ConnId, parts: MessageParts) -> Self {
        let font = parse_font(&parts.font_tag);
        let non_empty = |s: String, default: &str| {
            if s.is_empty() {
                default.to_string()
            } else {
                s
            }
        };
        Self {
            id: RefCell::new(None),
            time: parts.time,
            user,
            body: parts.body,
            raw: parts.raw,
            ip: parts.ip,
            unid: parts.unid,
            puid: parts.puid,
            name_color: non_empty(parts.name_tag, "000"),
            font_color: non_empty(font.as_ref().map(|f| f.color.clone()).unwrap_or_default(), "000"),
            font_face: non_empty(font.as_ref().map(|f| f.face.clone()).unwrap_or_default(), "0"),
            font_size: font.map_or(DEFAULT_MESSAGE_FONT_SIZE, |f| f.size),
            origin,
        }
    }

    /// Durable id, once attached
    pub fn id(&self) -> Option<MessageId> {
        self.id.borrow().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.id.borrow().is_some()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id.borrow())
            .field("user", &self.user)
            .field("body", &self.body)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Immutable ban or unban entry
#[derive(Debug, Clone)]
pub struct BanRecord {
    pub unid: String,
    pub ip: String,
    pub target: Rc<User>,
    pub time: f64,
    pub src: Rc<User>,
}

/// Id-keyed message table plus bounded history of one connection
#[derive(Debug)]
pub struct MessageStore {
    by_id: HashMap<MessageId, Rc<Message>>,
    history: VecDeque<Rc<Message>>,
    bound: usize,
}

impl MessageStore {
    pub fn new(bound: usize) -> Self {
        Self {
            by_id: HashMap::new(),
            history: VecDeque::with_capacity(bound.min(1024)),
            bound,
        }
    }

    /// Give a provisional message its durable id
    ///
    /// A message that already has an id stays as it is.
    pub fn attach(&mut self, msg: &Rc<Message>, id: MessageId) -> bool {
        let mut slot = msg.id.borrow_mut();
        if slot.is_some() {
            return false;
        }
        *slot = Some(id.clone());
        self.by_id.insert(id, Rc::clone(msg));
        true
    }

    /// Remove a message from the id table; it stays valid wherever else it is held
    pub fn detach(&mut self, msg: &Message) {
        let Some(id) = msg.id.borrow_mut().take() else {
            return;
        };
        // a later message may have been attached under the same id
        if self.by_id.get(&id).is_some_and(|held| std::ptr::eq(Rc::as_ptr(held), msg)) {
            self.by_id.remove(&id);
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<Rc<Message>> {
        self.by_id.get(id).cloned()
    }

    /// Append to history, evicting and detaching the oldest beyond the bound
    pub fn push_history(&mut self, msg: Rc<Message>) {
        self.history.push_back(msg);
        while self.history.len() > self.bound {
            if let Some(old) = self.history.pop_front() {
                trace!(id = ?old.id(), "Evicted message from history");
                self.detach(&old);
            }
        }
    }

    /// Remove a message from history and detach it
    ///
    /// Returns the message only if it was in history.
    pub fn delete(&mut self, id: &MessageId) -> Option<Rc<Message>> {
        let msg = self.by_id.get(id).cloned()?;
        let pos = self.history.iter().position(|m| Rc::ptr_eq(m, &msg))?;
        self.history.remove(pos);
        self.detach(&msg);
        Some(msg)
    }

    pub fn history(&self) -> impl DoubleEndedIterator<Item = &Rc<Message>> + ExactSizeIterator {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Most recent message, optionally restricted to one author
    pub fn last(&self, user: Option<&User>) -> Option<Rc<Message>> {
        self.history
            .iter()
            .rev()
            .find(|m| user.map_or(true, |u| *m.user == *u))
            .cloned()
    }

    /// Authors of the last `count` messages, oldest first
    pub fn recent_authors(&self, count: usize) -> Vec<Rc<User>> {
        let skip = self.history.len().saturating_sub(count);
        self.history
            .iter()
            .skip(skip)
            .map(|m| Rc::clone(&m.user))
            .collect()
    }

    pub fn attached_len(&self) -> usize {
        self.by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::UserRegistry;

    fn message(registry: &UserRegistry, name: &str, body: &str) -> Rc<Message> {
        Rc::new(Message::new(
            registry.get(name),
            ConnId::Room("lobby".into()),
            MessageParts {
                time: 0.0,
                body: body.to_string(),
                raw: body.to_string(),
                ip: String::new(),
                unid: String::new(),
                puid: String::new(),
                name_tag: String::new(),
                font_tag: String::new(),
            },
        ))
    }

    #[test]
    fn test_clean_message_extracts_tags() {
        let clean = clean_message(r#"<n3C0/><f x12F00="1">Hello &amp; <b>bye</b> </f>"#);
        assert_eq!(clean.body, "Hello & bye");
        assert_eq!(clean.name_tag, "3C0");
        assert_eq!(clean.font_tag, r#" x12F00="1""#);
    }

    #[test]
    fn test_clean_message_without_tags() {
        let clean = clean_message("  plain 1 &lt; 2  ");
        assert_eq!(clean.body, "plain 1 < 2");
        assert_eq!(clean.name_tag, "");
        assert_eq!(clean.font_tag, "");
    }

    #[test]
    fn test_unescape_numeric_references() {
        assert_eq!(unescape_html("&#126;&#x41;&bogus;"), "~A&bogus;");
    }

    #[test]
    fn test_parse_font() {
        let font = parse_font(r#" x12F00="1""#).unwrap();
        assert_eq!(
            font,
            Font {
                size: 12,
                color: "F00".into(),
                face: "1".into()
            }
        );
        assert!(parse_font("garbage").is_none());
    }

    #[test]
    fn test_message_defaults() {
        let registry = UserRegistry::new();
        let msg = message(&registry, "alice", "hi");
        assert_eq!(msg.name_color, "000");
        assert_eq!(msg.font_color, "000");
        assert_eq!(msg.font_face, "0");
        assert_eq!(msg.font_size, 11);
        assert!(!msg.is_attached());
    }

    #[test]
    fn test_attach_is_one_shot() {
        let registry = UserRegistry::new();
        let mut store = MessageStore::new(10);
        let msg = message(&registry, "alice", "hi");

        assert!(store.attach(&msg, MessageId::new("m1")));
        assert!(!store.attach(&msg, MessageId::new("m2")));
        assert_eq!(msg.id(), Some(MessageId::new("m1")));
        assert!(store.get(&MessageId::new("m2")).is_none());

        store.detach(&msg);
        assert!(msg.id().is_none());
        assert!(store.get(&MessageId::new("m1")).is_none());
    }

    #[test]
    fn test_detach_keeps_newer_owner_of_id() {
        let registry = UserRegistry::new();
        let mut store = MessageStore::new(10);
        let older = message(&registry, "amy", "old");
        let newer = message(&registry, "bob", "new");
        store.attach(&older, MessageId::new("dup"));
        store.attach(&newer, MessageId::new("dup"));

        store.detach(&older);
        assert!(!older.is_attached());
        let held = store.get(&MessageId::new("dup")).unwrap();
        assert!(Rc::ptr_eq(&held, &newer));
        assert!(newer.is_attached());
    }

    #[test]
    fn test_eviction_detaches_oldest() {
        let registry = UserRegistry::new();
        let mut store = MessageStore::new(150);
        let mut all = Vec::new();
        for i in 0..151 {
            let msg = message(&registry, "bob", &format!("line {i}"));
            store.attach(&msg, MessageId::new(format!("id{i}")));
            store.push_history(Rc::clone(&msg));
            all.push(msg);
        }

        assert_eq!(store.history_len(), 150);
        assert!(store.get(&MessageId::new("id0")).is_none());
        assert!(!all[0].is_attached());

        let bodies: Vec<_> = store.history().map(|m| m.body.clone()).collect();
        let expected: Vec<_> = (1..151).map(|i| format!("line {i}")).collect();
        assert_eq!(bodies, expected);
        for i in 1..151 {
            assert!(store.get(&MessageId::new(format!("id{i}"))).is_some());
        }
    }

    #[test]
    fn test_delete_requires_history() {
        let registry = UserRegistry::new();
        let mut store = MessageStore::new(10);
        let listed = message(&registry, "a", "listed");
        let unlisted = message(&registry, "a", "unlisted");
        store.attach(&listed, MessageId::new("1"));
        store.attach(&unlisted, MessageId::new("2"));
        store.push_history(Rc::clone(&listed));

        assert!(store.delete(&MessageId::new("2")).is_none());
        let deleted = store.delete(&MessageId::new("1")).unwrap();
        assert!(Rc::ptr_eq(&deleted, &listed));
        assert_eq!(store.history_len(), 0);
        assert!(store.delete(&MessageId::new("1")).is_none());
    }

    #[test]
    fn test_last_and_recent_authors() {
        let registry = UserRegistry::new();
        let mut store = MessageStore::new(10);
        for (name, body) in [("a", "1"), ("b", "2"), ("a", "3"), ("c", "4")] {
            store.push_history(message(&registry, name, body));
        }
        let a = registry.get("a");
        assert_eq!(store.last(Some(a.as_ref())).unwrap().body, "3");
        assert_eq!(store.last(None).unwrap().body, "4");
        assert!(store.last(Some(registry.get("zed").as_ref())).is_none());

        let names: Vec<_> = store
            .recent_authors(2)
            .iter()
            .map(|u| u.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }
}
