//! Room manager and event loop
//!
//! [`RoomManager`] owns the poller, the scheduler, the application handler
//! and the engine state every connection shares. One loop iteration ticks
//! the scheduler, waits for readiness no longer than the next deadline,
//! feeds complete frames to their connection and dispatches the events of
//! each frame before the next frame is looked at.
//!
//! Handlers, scheduled tasks and deferred continuations all act on the
//! engine through a [`Session`].
//!
//! # Example
//! ```no_run
//! use chatango_client::{Credentials, EventHandler, ManagerConfig, RoomManager, Session};
//! use chatango_client::{ConnId, Message, User};
//! use std::rc::Rc;
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_message(&mut self, session: &mut Session<'_>, conn: &ConnId, _user: &Rc<User>, message: &Rc<Message>) {
//!         if let Some(room) = session.room_for(conn) {
//!             room.message(&message.body);
//!         }
//!     }
//! }
//!
//! let mut manager = RoomManager::new(ManagerConfig::default(), Credentials::anonymous(), Echo)?;
//! manager.session().join_room("examplegroup")?;
//! manager.run()?;
//! # Ok::<(), chatango_client::ChatError>(())
//! ```

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::auth::fetch_auth_token;
use crate::config::{Credentials, ManagerConfig};
use crate::conn::{CloseRequest, Conn, ConnContext, ConnState, Establish, Transport};
use crate::error::ChatError;
use crate::event::{dispatch, Event, EventHandler};
use crate::pm::Pm;
use crate::room::Room;
use crate::scheduler::{Delay, Scheduler, TaskId};
use crate::types::ConnId;
use crate::user::{User, UserRegistry};
use crate::worker::{Completed, JobId, Payload, Worker};

/// Poll token of the worker waker; sockets start at 1
const WAKER_TOKEN: Token = Token(0);

/// Readiness events taken per poll
const EVENT_CAPACITY: usize = 128;

type LoopScheduler = Scheduler<Core>;

/// Resumes the loop after a deferred job
type Continuation = Box<dyn FnOnce(&mut Session<'_>, Payload)>;

/// Poller plus the token of every registered socket
struct Reactor {
    poll: Poll,
    tokens: HashMap<Token, ConnId>,
    next_token: usize,
}

impl Reactor {
    fn open(
        &mut self,
        transport: &mut Transport,
        id: ConnId,
        host: &str,
        port: u16,
    ) -> Result<(), ChatError> {
        let addr = resolve(host, port)?;
        let token = Token(self.next_token);
        self.next_token += 1;
        transport.open(addr, self.poll.registry(), token)?;
        debug!(conn = %id, %addr, ?token, "Socket registered");
        self.tokens.insert(token, id);
        Ok(())
    }

    fn close(&mut self, transport: &mut Transport) {
        if let Some(token) = transport.token() {
            self.tokens.remove(&token);
        }
        transport.close(self.poll.registry());
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(ErrorKind::NotFound, format!("no address for {host}:{port}"))
    })
}

/// Connection behind `id`, borrowed from the connection maps only
fn lookup<'a>(
    rooms: &'a mut HashMap<String, Room>,
    pm: &'a mut Option<Pm>,
    id: &ConnId,
) -> Option<&'a mut dyn Conn> {
    match id {
        ConnId::Room(name) => rooms.get_mut(name).map(|r| r as &mut dyn Conn),
        ConnId::Pm => pm.as_mut().map(|p| p as &mut dyn Conn),
    }
}

/// Wrap a typed continuation so it can wait on the type-erased worker
fn continuation<T, F>(label: &str, then: F) -> Continuation
where
    T: 'static,
    F: FnOnce(&mut Session<'_>, T) + 'static,
{
    let label = label.to_string();
    Box::new(move |session, payload| match payload.downcast::<T>() {
        Ok(value) => then(session, *value),
        Err(_) => error!(job = %label, "Deferred result has an unexpected type"),
    })
}

/// Engine state shared by every connection
pub(crate) struct Core {
    ctx: ConnContext,
    reactor: Reactor,
    rooms: HashMap<String, Room>,
    pm: Option<Pm>,
    /// Events waiting for dispatch, in order
    events: VecDeque<(ConnId, Event)>,
    worker: Worker<Continuation>,
    running: bool,
}

impl Core {
    fn has_connections(&self) -> bool {
        !self.rooms.is_empty() || self.pm.is_some()
    }

    fn conn_ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.rooms.keys().map(|n| ConnId::Room(n.clone())).collect();
        if self.pm.is_some() {
            ids.push(ConnId::Pm);
        }
        ids
    }

    fn join_room(
        &mut self,
        scheduler: &mut LoopScheduler,
        name: &str,
        addr: Option<SocketAddr>,
    ) -> Result<(), ChatError> {
        let key = name.to_lowercase();
        if self.rooms.contains_key(&key) {
            debug!(room = %key, "Already joined");
            return Ok(());
        }

        let ctx = self.ctx.clone();
        let mut room = match addr {
            Some(addr) => Room::with_address(&key, &addr.ip().to_string(), addr.port(), ctx),
            None => Room::new(&key, ctx)?,
        };
        room.start_session();
        let (id, host, port) = (room.id(), room.server().to_string(), room.port());
        self.reactor.open(room.transport_mut(), id, &host, port)?;

        let ping_key = key.clone();
        room.ping_task = Some(scheduler.set_interval(
            self.ctx.config.ping_delay(),
            format!("ping:{key}"),
            move |core, _| core.ping_room(&ping_key),
        ));

        info!(room = %key, server = %host, port, "Joining room");
        self.rooms.insert(key, room);
        Ok(())
    }

    /// Tear a room down; `notify` fires `Disconnect`
    fn close_room(&mut self, scheduler: &mut LoopScheduler, name: &str, notify: bool) -> bool {
        let Some(mut room) = self.rooms.remove(name) else {
            return false;
        };
        let id = room.id();
        for event in room.take_events() {
            self.events.push_back((id.clone(), event));
        }
        for task in [room.ping_task.take(), room.reconnect_task.take()].into_iter().flatten() {
            scheduler.cancel(task);
        }
        self.reactor.close(room.transport_mut());
        room.end_session(ConnState::Disconnected);
        info!(room = %name, "Left room");
        if notify {
            self.events.push_back((id, Event::Disconnect));
        }
        true
    }

    fn close_pm(&mut self, scheduler: &mut LoopScheduler, notify: bool) -> bool {
        let Some(mut pm) = self.pm.take() else {
            return false;
        };
        for event in pm.take_events() {
            self.events.push_back((ConnId::Pm, event));
        }
        if let Some(task) = pm.ping_task.take() {
            scheduler.cancel(task);
        }
        self.reactor.close(pm.transport_mut());
        pm.end_session();
        info!("PM closed");
        if notify {
            self.events.push_back((ConnId::Pm, Event::PmDisconnect));
        }
        true
    }

    /// The socket died under a connection
    fn transport_lost(&mut self, scheduler: &mut LoopScheduler, id: &ConnId) {
        let name = match id {
            ConnId::Pm => {
                warn!("PM connection lost");
                self.close_pm(scheduler, true);
                return;
            }
            ConnId::Room(name) => name,
        };
        if self.ctx.config.reconnect.is_none() {
            warn!(room = %name, "Connection lost");
            self.close_room(scheduler, name, true);
            return;
        }

        let Some(room) = self.rooms.get_mut(name) else {
            return;
        };
        for event in room.take_events() {
            self.events.push_back((id.clone(), event));
        }
        // backoff is only set between a loss and the next `inited`
        let retrying = room.backoff.is_some();
        self.reactor.close(room.transport_mut());
        room.end_session(ConnState::Reconnecting);
        if retrying {
            debug!(room = %name, "Reconnect attempt lost");
        } else {
            warn!(room = %name, "Connection lost, will reconnect");
            self.events.push_back((id.clone(), Event::Disconnect));
        }
        self.schedule_reconnect(scheduler, name);
    }

    fn schedule_reconnect(&mut self, scheduler: &mut LoopScheduler, name: &str) {
        let Some(policy) = self.ctx.config.reconnect else {
            return;
        };
        let Some(room) = self.rooms.get_mut(name) else {
            return;
        };
        let delay = policy.next(room.backoff);
        room.backoff = Some(delay);

        let key = name.to_string();
        let scheduled = scheduler.set_timeout(delay, format!("reconnect:{name}"), move |core, sched| {
            core.reconnect_room(sched, &key)
        });
        match scheduled {
            Ok(task) => {
                room.reconnect_task = Some(task);
                debug!(room = %name, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
            }
            Err(e) => error!(room = %name, error = %e, "Could not schedule reconnect"),
        }
    }

    fn reconnect_room(&mut self, scheduler: &mut LoopScheduler, name: &str) {
        let Some(room) = self.rooms.get_mut(name) else {
            return;
        };
        room.reconnect_task = None;
        if room.state() != ConnState::Reconnecting {
            return;
        }
        room.start_session();
        let (id, host, port) = (room.id(), room.server().to_string(), room.port());
        match self.reactor.open(room.transport_mut(), id, &host, port) {
            Ok(()) => info!(room = %name, "Reconnecting"),
            Err(e) => {
                warn!(room = %name, error = %e, "Reconnect attempt failed");
                room.end_session(ConnState::Reconnecting);
                self.schedule_reconnect(scheduler, name);
            }
        }
    }

    fn ping_room(&mut self, name: &str) {
        if let Some(room) = self.rooms.get_mut(name) {
            if room.state() == ConnState::Active {
                room.ping();
            }
        }
    }

    fn ping_pm(&mut self) {
        if let Some(pm) = self.pm.as_mut() {
            if pm.state() == ConnState::Active {
                pm.ping();
            }
        }
    }

    /// Fetch the PM token on the worker pool when credentials allow it
    fn start_pm(&mut self) {
        let creds = Rc::clone(&self.ctx.credentials);
        let (Some(name), Some(password)) = (creds.name.clone(), creds.password.clone()) else {
            return;
        };
        if !self.ctx.config.enable_pm {
            return;
        }
        let url = self.ctx.config.login_url.clone();
        let then = continuation("pm-auth", |session: &mut Session<'_>, result| {
            session.core.open_pm(session.scheduler, result)
        });
        self.worker
            .submit("pm-auth", move || fetch_auth_token(&url, &name, &password), then);
    }

    fn open_pm(
        &mut self,
        scheduler: &mut LoopScheduler,
        result: Result<Option<String>, ChatError>,
    ) {
        let token = match result {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!("PM login failed");
                self.events.push_back((ConnId::Pm, Event::LoginFail));
                return;
            }
            Err(e) => {
                warn!(error = %e, "PM login request failed");
                self.events.push_back((ConnId::Pm, Event::LoginFail));
                return;
            }
        };
        if self.pm.is_some() {
            return;
        }

        let mut pm = Pm::new(self.ctx.clone());
        pm.start_session(&token);
        let (host, port) = (pm.server().to_string(), pm.port());
        if let Err(e) = self.reactor.open(pm.transport_mut(), ConnId::Pm, &host, port) {
            warn!(error = %e, "Could not open PM connection");
            self.events.push_back((ConnId::Pm, Event::PmDisconnect));
            return;
        }
        pm.ping_task = Some(scheduler.set_interval(
            self.ctx.config.ping_delay(),
            "ping:pm",
            |core, _| core.ping_pm(),
        ));
        info!(server = %host, port, "Opening PM connection");
        self.pm = Some(pm);
    }

    /// Move every connection outbox into the dispatch queue
    fn collect_events(&mut self) {
        for room in self.rooms.values_mut() {
            let id = room.id();
            for event in room.take_events() {
                self.events.push_back((id.clone(), event));
            }
        }
        if let Some(pm) = self.pm.as_mut() {
            for event in pm.take_events() {
                self.events.push_back((ConnId::Pm, event));
            }
        }
    }

    /// Tear down connections that asked to close while processing a frame
    fn reap_closed(&mut self, scheduler: &mut LoopScheduler) {
        let closing: Vec<(String, CloseRequest)> = self
            .rooms
            .iter()
            .filter_map(|(name, room)| room.close_request().map(|r| (name.clone(), r)))
            .collect();
        for (name, request) in closing {
            self.close_room(scheduler, &name, request == CloseRequest::Notify);
        }
        if let Some(request) = self.pm.as_ref().and_then(|pm| pm.close_request()) {
            self.close_pm(scheduler, request == CloseRequest::Notify);
        }
    }

    /// Hand finished jobs back to the loop as next-tick tasks
    fn drain_worker(&mut self, scheduler: &mut LoopScheduler) {
        for Completed { id, label, then, result } in self.worker.drain() {
            let payload = match result {
                Ok(payload) => payload,
                Err(_) => {
                    error!(job = id, label = %label, "Deferred job panicked, continuation dropped");
                    continue;
                }
            };
            let scheduled = scheduler.set_timeout(
                Delay::NextTick,
                format!("deferred:{label}"),
                move |core, sched| then(&mut Session { core, scheduler: sched }, payload),
            );
            if let Err(e) = scheduled {
                error!(job = id, error = %e, "Could not schedule continuation");
            }
        }
    }

    /// Write what the sockets take and adjust write interest
    fn flush_all(&mut self, scheduler: &mut LoopScheduler) {
        let mut lost = Vec::new();
        for id in self.conn_ids() {
            let registry = self.reactor.poll.registry();
            let Some(conn) = lookup(&mut self.rooms, &mut self.pm, &id) else {
                continue;
            };
            let connecting = conn.state() == ConnState::Connecting;
            let transport = conn.transport_mut();
            if !transport.is_open() {
                continue;
            }
            let flushed = if connecting { Ok(()) } else { transport.flush() };
            let result = flushed.and_then(|()| transport.update_interest(registry, connecting));
            if let Err(e) = result {
                warn!(conn = %id, error = %e, "Socket write failed");
                lost.push(id);
            }
        }
        for id in lost {
            self.transport_lost(scheduler, &id);
        }
    }
}

/// Handle on the engine given to handlers, tasks and continuations
pub struct Session<'a> {
    core: &'a mut Core,
    scheduler: &'a mut LoopScheduler,
}

impl Session<'_> {
    /// Join a room on its shard server; joining twice is a no-op
    pub fn join_room(&mut self, name: &str) -> Result<(), ChatError> {
        self.core.join_room(self.scheduler, name, None)
    }

    /// Join a room served at an explicit address
    pub fn join_room_at(&mut self, name: &str, addr: SocketAddr) -> Result<(), ChatError> {
        self.core.join_room(self.scheduler, name, Some(addr))
    }

    /// Disconnect from a room; false when it was not joined
    pub fn leave_room(&mut self, name: &str) -> bool {
        self.core.close_room(self.scheduler, &name.to_lowercase(), true)
    }

    pub fn room(&self, name: &str) -> Option<&Room> {
        self.core.rooms.get(&name.to_lowercase())
    }

    pub fn room_mut(&mut self, name: &str) -> Option<&mut Room> {
        self.core.rooms.get_mut(&name.to_lowercase())
    }

    /// The room an event came from
    pub fn room_for(&mut self, conn: &ConnId) -> Option<&mut Room> {
        conn.room_name().and_then(|name| self.core.rooms.get_mut(name))
    }

    /// Joined rooms, sorted
    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.core.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pm(&mut self) -> Option<&mut Pm> {
        self.core.pm.as_mut()
    }

    /// Disconnect the PM channel; false when it was not open
    pub fn close_pm(&mut self) -> bool {
        self.core.close_pm(self.scheduler, true)
    }

    /// The manager's own user
    pub fn user(&self) -> Rc<User> {
        Rc::clone(&self.core.ctx.own)
    }

    /// Interned user for `name`
    pub fn get_user(&self, name: &str) -> Rc<User> {
        self.core.ctx.users.get(name)
    }

    pub fn users(&self) -> &UserRegistry {
        &self.core.ctx.users
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.core.ctx.config
    }

    /// Leave the loop after the current iteration
    pub fn stop(&mut self) {
        info!("Stop requested");
        self.core.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.core.running
    }

    fn broadcast(&mut self, f: impl Fn(&mut Room)) {
        for room in self.core.rooms.values_mut() {
            f(room);
        }
    }

    pub fn enable_bg(&mut self) {
        self.core.ctx.own.set_bg(true);
        self.broadcast(|room| room.set_bg_mode(true));
    }

    pub fn disable_bg(&mut self) {
        self.core.ctx.own.set_bg(false);
        self.broadcast(|room| room.set_bg_mode(false));
    }

    pub fn enable_recording(&mut self) {
        self.core.ctx.own.set_recording(true);
        self.broadcast(|room| room.set_recording_mode(true));
    }

    pub fn disable_recording(&mut self) {
        self.core.ctx.own.set_recording(false);
        self.broadcast(|room| room.set_recording_mode(false));
    }

    pub fn set_name_color(&mut self, color: &str) {
        self.core.ctx.own.set_name_color(color);
    }

    pub fn set_font_color(&mut self, color: &str) {
        self.core.ctx.own.set_font_color(color);
    }

    pub fn set_font_face(&mut self, face: &str) {
        self.core.ctx.own.set_font_face(face);
    }

    /// Clamped to the range the server accepts
    pub fn set_font_size(&mut self, size: u8) {
        self.core.ctx.own.set_font_size(size);
    }

    /// Run `f` once after `delay`
    ///
    /// Fails when a zero-delay task re-arms itself under its own label;
    /// the loop then stops with the same error.
    pub fn set_timeout<F>(
        &mut self,
        delay: impl Into<Delay>,
        label: impl Into<String>,
        f: F,
    ) -> Result<TaskId, ChatError>
    where
        F: FnOnce(&mut Session<'_>) + 'static,
    {
        let id = self.scheduler.set_timeout(delay, label, move |core, scheduler| {
            f(&mut Session { core, scheduler })
        })?;
        Ok(id)
    }

    /// Run `f` every `period`
    pub fn set_interval<F>(&mut self, period: impl Into<Delay>, label: impl Into<String>, mut f: F) -> TaskId
    where
        F: FnMut(&mut Session<'_>) + 'static,
    {
        self.scheduler.set_interval(period, label, move |core, scheduler| {
            f(&mut Session { core, scheduler })
        })
    }

    pub fn cancel_task(&mut self, id: TaskId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Run blocking `work` on the worker pool, then `then` on the loop
    pub fn defer_to_thread<T, W, F>(&mut self, label: &str, work: W, then: F) -> JobId
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        F: FnOnce(&mut Session<'_>, T) + 'static,
    {
        let then = continuation(label, then);
        self.core.worker.submit(label, work, then)
    }
}

/// Owner of the event loop
pub struct RoomManager<H> {
    core: Core,
    scheduler: LoopScheduler,
    handler: H,
}

impl<H: EventHandler> RoomManager<H> {
    /// Validate the configuration, set up the poller and the worker pool
    ///
    /// With a name and password (and PM enabled) the PM login starts right
    /// away on the worker pool.
    pub fn new(config: ManagerConfig, credentials: Credentials, handler: H) -> Result<Self, ChatError> {
        config.validate()?;
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let worker = Worker::new(config.worker_threads, waker)?;
        let ctx = ConnContext::new(config, credentials, UserRegistry::new());

        let mut core = Core {
            ctx,
            reactor: Reactor {
                poll,
                tokens: HashMap::new(),
                next_token: WAKER_TOKEN.0 + 1,
            },
            rooms: HashMap::new(),
            pm: None,
            events: VecDeque::new(),
            worker,
            running: true,
        };
        core.start_pm();

        Ok(Self {
            core,
            scheduler: Scheduler::new(),
            handler,
        })
    }

    /// Engine handle for setup outside of callbacks
    pub fn session(&mut self) -> Session<'_> {
        Session {
            core: &mut self.core,
            scheduler: &mut self.scheduler,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn is_running(&self) -> bool {
        self.core.running
    }

    /// Call `on_init`, loop until stopped, then disconnect everything
    pub fn run(&mut self) -> Result<(), ChatError> {
        info!("Room manager running");
        self.handler.on_init(&mut Session {
            core: &mut self.core,
            scheduler: &mut self.scheduler,
        });
        self.settle();

        while self.core.running {
            self.poll_once(None)?;
        }
        self.shutdown();
        Ok(())
    }

    /// One loop iteration; `max_wait` caps the readiness wait
    pub fn poll_once(&mut self, max_wait: Option<Duration>) -> Result<(), ChatError> {
        let next = self.scheduler.tick(&mut self.core)?;
        self.settle();
        self.core.flush_all(&mut self.scheduler);
        if !self.core.running {
            return Ok(());
        }

        let resolution = self.core.ctx.config.timer_resolution();
        let capped = |wait: Option<Duration>| Some(wait.map_or(resolution, |w| w.min(resolution)));
        let wait = if self.core.has_connections() {
            if self.scheduler.has_every_tick() {
                capped(next)
            } else {
                next
            }
        } else {
            let idle = next.is_none() && self.scheduler.is_empty() && self.core.worker.pending() == 0;
            if idle && self.core.ctx.config.stop_when_idle {
                info!("Nothing left to do, stopping");
                self.core.running = false;
                return Ok(());
            }
            capped(next)
        };
        let wait = match (wait, max_wait) {
            (Some(w), Some(max)) => Some(w.min(max)),
            (wait, None) => wait,
            (None, max) => max,
        };

        let mut events = Events::with_capacity(EVENT_CAPACITY);
        if let Err(e) = self.core.reactor.poll.poll(&mut events, wait) {
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        let ready: Vec<(Token, bool, bool)> = events
            .iter()
            .map(|e| (e.token(), e.is_readable() || e.is_read_closed(), e.is_writable() || e.is_error()))
            .collect();
        for (token, readable, writable) in ready {
            if token == WAKER_TOKEN {
                self.core.drain_worker(&mut self.scheduler);
            } else {
                self.handle_ready(token, readable, writable);
            }
        }

        self.core.drain_worker(&mut self.scheduler);
        self.settle();
        self.core.flush_all(&mut self.scheduler);
        Ok(())
    }

    fn handle_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(id) = self.core.reactor.tokens.get(&token).cloned() else {
            trace!(?token, "Event for a closed socket");
            return;
        };

        if writable {
            let failed = match lookup(&mut self.core.rooms, &mut self.core.pm, &id) {
                Some(conn) if conn.state() == ConnState::Connecting => {
                    match conn.transport_mut().establish() {
                        Establish::Pending => false,
                        Establish::Connected => {
                            conn.established();
                            false
                        }
                        Establish::Failed => true,
                    }
                }
                _ => false,
            };
            if failed {
                self.core.transport_lost(&mut self.scheduler, &id);
                self.settle();
                return;
            }
        }

        if !readable {
            return;
        }
        let outcome = match lookup(&mut self.core.rooms, &mut self.core.pm, &id) {
            Some(conn) => conn.transport_mut().read_frames(),
            None => return,
        };
        for frame in &outcome.frames {
            match lookup(&mut self.core.rooms, &mut self.core.pm, &id) {
                // a handler may have replaced the socket or closed the connection
                Some(conn) if conn.transport().token() == Some(token) && conn.close_request().is_none() => {
                    trace!(conn = %id, frame = %frame, "Frame");
                    conn.process(frame);
                }
                _ => break,
            }
            self.settle();
        }

        if outcome.closed {
            let same_socket = lookup(&mut self.core.rooms, &mut self.core.pm, &id)
                .is_some_and(|conn| conn.transport().token() == Some(token));
            if same_socket {
                self.core.transport_lost(&mut self.scheduler, &id);
                self.settle();
            }
        }
    }

    /// Dispatch queued events until no connection produces more
    fn settle(&mut self) {
        loop {
            self.core.collect_events();
            self.core.reap_closed(&mut self.scheduler);
            if self.core.events.is_empty() {
                break;
            }
            while let Some((conn, event)) = self.core.events.pop_front() {
                trace!(conn = %conn, event = event.name(), "Dispatching event");
                let mut session = Session {
                    core: &mut self.core,
                    scheduler: &mut self.scheduler,
                };
                dispatch(&mut self.handler, &mut session, &conn, &event);
            }
        }
    }

    /// Flush what is queued, then disconnect every room and the PM channel
    pub fn shutdown(&mut self) {
        self.core.flush_all(&mut self.scheduler);
        let mut names: Vec<String> = self.core.rooms.keys().cloned().collect();
        names.sort();
        for name in names {
            self.core.close_room(&mut self.scheduler, &name, true);
        }
        self.core.close_pm(&mut self.scheduler, true);
        self.settle();
        self.core.running = false;
        info!("Room manager stopped");
    }
}

impl<H> std::fmt::Debug for RoomManager<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomManager")
            .field("rooms", &self.core.rooms.len())
            .field("pm", &self.core.pm.is_some())
            .field("tasks", &self.scheduler.len())
            .field("running", &self.core.running)
            .finish()
    }
}
