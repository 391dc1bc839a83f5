//! Chatango Echo Bot - Entry Point
//!
//! Joins the rooms given on the command line and answers `!echo` commands.
//! Credentials come from `CHATANGO_NAME` and `CHATANGO_PASSWORD`; a JSON
//! config file may be named with `CHATANGO_CONFIG`.

use std::env;
use std::rc::Rc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chatango_client::{
    ConnId, Credentials, EventHandler, ManagerConfig, Message, RoomManager, Session, User,
};

/// Prefix of the command the bot answers
const ECHO_COMMAND: &str = "!echo ";

struct EchoBot;

impl EventHandler for EchoBot {
    fn on_connect(&mut self, session: &mut Session<'_>, conn: &ConnId) {
        if let Some(room) = session.room_for(conn) {
            info!(room = room.name(), users = room.user_count(), "Connected");
        }
    }

    fn on_login_fail(&mut self, _session: &mut Session<'_>, conn: &ConnId) {
        warn!(conn = %conn, "Login failed");
    }

    fn on_disconnect(&mut self, _session: &mut Session<'_>, conn: &ConnId) {
        info!(conn = %conn, "Disconnected");
    }

    fn on_message(&mut self, session: &mut Session<'_>, conn: &ConnId, user: &Rc<User>, message: &Rc<Message>) {
        if Rc::ptr_eq(user, &session.user()) {
            return;
        }
        let Some(text) = message.body.strip_prefix(ECHO_COMMAND) else {
            return;
        };
        if let Some(room) = session.room_for(conn) {
            room.message(&format!("{}: {}", user.name(), text));
        }
    }

    fn on_pm_message(&mut self, session: &mut Session<'_>, user: &Rc<User>, message: &Rc<Message>) {
        if let Some(pm) = session.pm() {
            pm.message(user, &message.body);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG to control the log level
    // e.g., RUST_LOG=debug or RUST_LOG=chatango_client=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chatango_client=info")),
        )
        .init();

    let rooms: Vec<String> = env::args().skip(1).collect();
    if rooms.is_empty() {
        eprintln!("usage: chatango_client <room> [room...]");
        std::process::exit(2);
    }

    let config = match env::var("CHATANGO_CONFIG") {
        Ok(path) => ManagerConfig::load(path)?,
        Err(_) => ManagerConfig::default(),
    };
    let credentials = Credentials::new(env::var("CHATANGO_NAME").ok(), env::var("CHATANGO_PASSWORD").ok());

    let mut manager = RoomManager::new(config, credentials, EchoBot)?;
    for room in &rooms {
        manager.session().join_room(room)?;
    }
    info!(rooms = rooms.len(), "Echo bot started");

    manager.run()?;
    Ok(())
}
