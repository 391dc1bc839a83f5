//! User identities
//!
//! Users are interned per lowercased name through a [`UserRegistry`] owned by
//! the manager: two lookups for the same name yield the same `Rc<User>` while
//! anything still holds it.
//! Mutable per-user state (session ids, display attributes) sits behind a
//! `RefCell` since the whole engine runs on one thread.

use std::cell::{Ref, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use tracing::trace;

/// Anonymous seed used when a message carries no name tag
const DEFAULT_ANON_SEED: &str = "5504";

/// Pseudonym used when the anonymous id inputs are not numeric
const ANON_SENTINEL: &str = "NNNN";

/// Font size bounds accepted by the server
pub const MIN_FONT_SIZE: u8 = 9;
pub const MAX_FONT_SIZE: u8 = 22;

/// Display attributes of a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Style {
    pub name_color: String,
    pub font_color: String,
    pub font_face: String,
    pub font_size: u8,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            name_color: "000".to_string(),
            font_color: "000".to_string(),
            font_face: "0".to_string(),
            font_size: 12,
        }
    }
}

#[derive(Debug, Default)]
struct UserState {
    /// Session ids per room name
    sids: HashMap<String, HashSet<String>>,
    style: Style,
    bg: bool,
    recording: bool,
}

/// A chat participant
///
/// Equality and hashing use the lowercased name only.
pub struct User {
    name: String,
    state: RefCell<UserState>,
}

impl User {
    fn new(name: String) -> Self {
        Self {
            name,
            state: RefCell::new(UserState::default()),
        }
    }

    /// Lowercased name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session ids in one room, or across every room when `room` is None
    pub fn session_ids(&self, room: Option<&str>) -> HashSet<String> {
        let state = self.state.borrow();
        match room {
            Some(room) => state.sids.get(room).cloned().unwrap_or_default(),
            None => state.sids.values().flatten().cloned().collect(),
        }
    }

    /// Names of the rooms the user currently has sessions in
    pub fn room_names(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.state.borrow().sids.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    pub fn add_session_id(&self, room: &str, sid: &str) {
        self.state
            .borrow_mut()
            .sids
            .entry(room.to_string())
            .or_default()
            .insert(sid.to_string());
    }

    pub fn remove_session_id(&self, room: &str, sid: &str) {
        let mut state = self.state.borrow_mut();
        if let Some(set) = state.sids.get_mut(room) {
            set.remove(sid);
            if set.is_empty() {
                state.sids.remove(room);
            }
        }
    }

    pub fn clear_session_ids(&self, room: &str) {
        self.state.borrow_mut().sids.remove(room);
    }

    pub fn has_session_id(&self, room: Option<&str>, sid: &str) -> bool {
        self.session_ids(room).contains(sid)
    }

    pub fn style(&self) -> Ref<'_, Style> {
        Ref::map(self.state.borrow(), |s| &s.style)
    }

    pub fn set_style(&self, style: Style) {
        self.state.borrow_mut().style = style;
    }

    pub fn set_name_color(&self, color: &str) {
        self.state.borrow_mut().style.name_color = color.to_string();
    }

    pub fn set_font_color(&self, color: &str) {
        self.state.borrow_mut().style.font_color = color.to_string();
    }

    pub fn set_font_face(&self, face: &str) {
        self.state.borrow_mut().style.font_face = face.to_string();
    }

    /// Set the font size, clamped to the range the server accepts
    pub fn set_font_size(&self, size: u8) {
        self.state.borrow_mut().style.font_size = size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE);
    }

    /// Background feature flag
    pub fn bg(&self) -> bool {
        self.state.borrow().bg
    }

    pub fn set_bg(&self, on: bool) {
        self.state.borrow_mut().bg = on;
    }

    /// Recording feature flag
    pub fn recording(&self) -> bool {
        self.state.borrow().recording
    }

    pub fn set_recording(&self, on: bool) {
        self.state.borrow_mut().recording = on;
    }
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for User {}

impl Hash for User {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<User: {}>", self.name)
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Interning table for users
///
/// Entries are weak: a user lives as long as something (a roster, a
/// message, the caller) holds it, and a dead entry is replaced on the next
/// reference. Cloning the registry clones a handle to the same table, so
/// connections can hold one without a global.
#[derive(Clone, Default)]
pub struct UserRegistry {
    users: Rc<RefCell<HashMap<String, Weak<User>>>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the user for `name`, creating it on first reference
    pub fn get(&self, name: &str) -> Rc<User> {
        let key = name.to_lowercase();
        let mut users = self.users.borrow_mut();
        if let Some(user) = users.get(&key).and_then(Weak::upgrade) {
            return user;
        }
        users.retain(|_, user| user.strong_count() > 0);
        trace!(user = %key, "Interned user");
        let user = Rc::new(User::new(key.clone()));
        users.insert(key, Rc::downgrade(&user));
        user
    }

    /// Existing user for `name`, without creating one
    pub fn lookup(&self, name: &str) -> Option<Rc<User>> {
        self.users
            .borrow()
            .get(&name.to_lowercase())
            .and_then(Weak::upgrade)
    }

    /// Number of users still alive
    pub fn len(&self) -> usize {
        self.users
            .borrow()
            .values()
            .filter(|user| user.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for UserRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRegistry")
            .field("users", &self.len())
            .finish()
    }
}

/// Derive the 4-digit pseudonym of an anonymous participant
///
/// Each digit of `seed` is added to the matching digit of `session[4..]`
/// and only the last decimal digit of every sum is kept. An empty seed
/// falls back to the default one; non-numeric input yields `"NNNN"`.
pub fn anon_id(seed: &str, session: &str) -> String {
    let seed = if seed.is_empty() { DEFAULT_ANON_SEED } else { seed };
    seed.chars()
        .zip(session.chars().skip(4))
        .map(|(a, b)| match (a.to_digit(10), b.to_digit(10)) {
            (Some(a), Some(b)) => char::from_digit((a + b) % 10, 10),
            _ => None,
        })
        .collect::<Option<String>>()
        .unwrap_or_else(|| ANON_SENTINEL.to_string())
}
