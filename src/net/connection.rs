//! Stateful wrapper around one accepted descriptor.
//!
//! A [Connection] is shared behind an `Arc`: the server's registry holds one
//! owning reference and every channel callback holds another, so an in-flight
//! callback keeps the connection alive even if the registry drops it
//! concurrently. All mutable state is touched only on the owning loop's
//! thread; the mutexes below exist to satisfy `Sync` and are never contended.

use std::any::Any;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::net::Socket;
use crate::reactor::{Channel, EventLoop, LoopHandle};
use crate::{Buffer, debug};

/// Size of the stack buffer each read drains the descriptor into.
const READ_CHUNK_SIZE: usize = 65536;

/// Callback receiving the connection alone.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Message callback receiving the connection and its input buffer. The
/// callback may consume some, all, or none of the buffer; unconsumed bytes
/// persist for the next readiness event.
pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut Buffer) + Send + Sync>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Terminal: the descriptor is closed and every further operation is a
    /// no-op.
    Disconnected = 0,
    /// Accepted but not yet registered with its owning loop.
    Connecting = 1,
    /// Established; read readiness is subscribed and I/O flows.
    Connected = 2,
    /// Shutdown requested while output is still pending; closes on drain.
    Disconnecting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connected: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    close: Option<ConnectionCallback>,
    server_close: Option<ConnectionCallback>,
    event: Option<ConnectionCallback>,
}

/// One accepted TCP connection bound to a worker loop.
pub struct Connection {
    id: u64,
    socket: Socket,
    state: AtomicU8,
    inactive_release: AtomicBool,
    loop_handle: Arc<LoopHandle>,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    callbacks: Mutex<Callbacks>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.socket.fd())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wraps the accepted descriptor `fd` under connection id `id`, owned by
    /// the loop behind `loop_handle`. Starts in [ConnectionState::Connecting]
    /// with no channel registered yet.
    pub fn new(loop_handle: Arc<LoopHandle>, id: u64, fd: RawFd) -> Arc<Self> {
        let socket = Socket::from_fd(fd);
        if let Err(err) = socket.set_nonblocking() {
            crate::warn!("connection {id}: failed to set fd {fd} non-blocking: {err}");
        }

        Arc::new(Connection {
            id,
            socket,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            inactive_release: AtomicBool::new(false),
            loop_handle,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            context: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    /// Numeric id assigned by the server.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying descriptor, or `-1` once closed.
    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Handle of the loop that owns this connection's I/O.
    pub fn loop_handle(&self) -> Arc<LoopHandle> {
        self.loop_handle.clone()
    }

    /// Installs the connected callback.
    pub fn set_connected_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connected = Some(cb);
    }

    /// Installs the message callback.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    /// Installs the close callback.
    pub fn set_close_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    /// Installs the server-owned removal callback, invoked after the close
    /// callback during teardown.
    pub fn set_server_close_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().server_close = Some(cb);
    }

    /// Installs the generic event callback, fired on every readiness cycle
    /// that touches this connection.
    pub fn set_event_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().event = Some(cb);
    }

    /// Replaces the opaque user context.
    pub fn set_context<T: Any + Send>(&self, context: T) {
        *self.context.lock().unwrap() = Some(Box::new(context));
    }

    /// Runs `f` with mutable access to the context, downcast to `T`. `None`
    /// is passed when no context is set or the type does not match.
    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut guard = self.context.lock().unwrap();
        f(guard.as_mut().and_then(|ctx| ctx.downcast_mut::<T>()))
    }

    /// Registers the connection with its owning loop and moves it to
    /// [ConnectionState::Connected], marshaling onto the loop thread first.
    ///
    /// # Panics
    ///
    /// Calling this from any live state other than
    /// [ConnectionState::Connecting] is a contract violation and panics on
    /// the owning loop thread. On a torn-down connection it is a no-op.
    pub fn establish(self: &Arc<Self>) {
        let conn = self.clone();
        self.loop_handle.run_in_loop(move || conn.establish_in_loop());
    }

    /// Copies `data` and marshals the append onto the owning loop, where it
    /// lands in the output buffer with write interest enabled. Safe to call
    /// from any thread; ignored unless the connection is established.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        let mut staged = Buffer::with_capacity(data.len().max(1));
        staged.write(data);

        let conn = self.clone();
        self.loop_handle.run_in_loop(move || conn.send_in_loop(staged));
    }

    /// Requests an orderly shutdown: buffered input is flushed to the
    /// message callback, pending output is drained, then the connection
    /// closes. Safe to call from any thread.
    pub fn shutdown(self: &Arc<Self>) {
        let conn = self.clone();
        self.loop_handle.run_in_loop(move || conn.shutdown_in_loop());
    }

    /// Starts (or restarts) the idle timer: the connection is closed after
    /// `timeout` ticks without any observed activity.
    pub fn enable_inactivity_release(self: &Arc<Self>, timeout: u64) {
        let conn = self.clone();
        self.loop_handle
            .run_in_loop(move || conn.enable_inactivity_in_loop(timeout));
    }

    /// Cancels the idle timer.
    pub fn disable_inactivity_release(self: &Arc<Self>) {
        let conn = self.clone();
        self.loop_handle.run_in_loop(move || {
            conn.inactive_release.store(false, Ordering::Relaxed);
            EventLoop::current().remove_after(conn.id);
        });
    }

    /// Atomically replaces the user context and all four user-facing
    /// callbacks, handing the raw connection off to a higher-level protocol
    /// handler.
    ///
    /// # Panics
    ///
    /// Panics when called from any thread other than the owning loop's.
    pub fn upgrade(
        &self,
        context: impl Any + Send,
        connected: ConnectionCallback,
        message: MessageCallback,
        close: ConnectionCallback,
        event: ConnectionCallback,
    ) {
        assert!(
            self.loop_handle.is_in_loop_thread(),
            "connection upgraded off its owning loop thread"
        );

        *self.context.lock().unwrap() = Some(Box::new(context));
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.connected = Some(connected);
        callbacks.message = Some(message);
        callbacks.close = Some(close);
        callbacks.event = Some(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn establish_in_loop(self: &Arc<Self>) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        assert!(
            self.state() == ConnectionState::Connecting,
            "connection {} established outside the connecting state",
            self.id
        );

        let event_loop = EventLoop::current();
        let channel = Channel::new(self.fd());

        let conn = self.clone();
        channel.set_read_callback(Box::new(move || conn.handle_read()));
        let conn = self.clone();
        channel.set_write_callback(Box::new(move || conn.handle_write()));
        let conn = self.clone();
        channel.set_close_callback(Box::new(move || conn.handle_close()));
        let conn = self.clone();
        channel.set_event_callback(Box::new(move || conn.handle_channel_event()));

        channel.enable_read(&event_loop);
        self.set_state(ConnectionState::Connected);

        let connected_cb = self.callbacks.lock().unwrap().connected.clone();
        if let Some(cb) = connected_cb {
            cb(self);
        }
    }

    /// Read-readiness handler: drain the descriptor into the input buffer
    /// and hand any accumulation to the message callback. Zero bytes means
    /// would-block, never peer-close.
    fn handle_read(self: &Arc<Self>) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }

        let mut buf = [0u8; READ_CHUNK_SIZE];
        match self.socket.recv(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                self.input.lock().unwrap().write(&buf[..n]);
                self.flush_input();
            }
            Err(err) => {
                debug!("connection {}: read failed, shutting down: {err}", self.id);
                self.shutdown_in_loop();
            }
        }
    }

    /// Write-readiness handler: flush as much buffered output as the socket
    /// accepts. Draining fully disables write interest and completes a
    /// pending close; a send error flushes any buffered input to the message
    /// callback (last chance to observe it) and forces close.
    fn handle_write(self: &Arc<Self>) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }

        let mut output = self.output.lock().unwrap();
        match self.socket.send(output.read_pos()) {
            Ok(0) => {}
            Ok(n) => {
                output.move_read_idx(n);
                if output.readable_size() == 0 {
                    drop(output);

                    let event_loop = EventLoop::current();
                    if let Some(channel) = event_loop.channel(self.fd()) {
                        channel.disable_write(&event_loop);
                    }
                    if self.state() == ConnectionState::Disconnecting {
                        self.force_close();
                    }
                }
            }
            Err(err) => {
                drop(output);
                debug!("connection {}: send failed, closing: {err}", self.id);
                self.flush_input();
                self.force_close();
            }
        }
    }

    /// Hangup handler: deliver whatever input is buffered, then close.
    fn handle_close(self: &Arc<Self>) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.flush_input();
        self.force_close();
    }

    /// Generic per-event handler: refreshes the idle timer on any activity,
    /// then runs the user's event callback.
    fn handle_channel_event(self: &Arc<Self>) {
        if self.inactive_release.load(Ordering::Relaxed)
            && self.state() != ConnectionState::Disconnected
        {
            EventLoop::current().refresh_after(self.id);
        }

        let event_cb = self.callbacks.lock().unwrap().event.clone();
        if let Some(cb) = event_cb {
            cb(self);
        }
    }

    /// Delivers the readable input span to the message callback.
    ///
    /// The buffer is taken out of its slot for the duration of the callback
    /// so user code may reenter `send`/`shutdown` on this connection without
    /// deadlocking; unconsumed bytes are restored afterwards. Nothing else
    /// can append to the input meanwhile since only the loop thread writes
    /// it.
    fn flush_input(self: &Arc<Self>) {
        let mut taken = {
            let mut input = self.input.lock().unwrap();
            if input.readable_size() == 0 {
                return;
            }
            mem::take(&mut *input)
        };

        let message_cb = self.callbacks.lock().unwrap().message.clone();
        if let Some(cb) = message_cb {
            cb(self, &mut taken);
        }

        if taken.readable_size() > 0 {
            *self.input.lock().unwrap() = taken;
        }
    }

    fn send_in_loop(self: &Arc<Self>, staged: Buffer) {
        if self.state() != ConnectionState::Connected {
            return;
        }

        self.output.lock().unwrap().write_buf(&staged);

        let event_loop = EventLoop::current();
        if let Some(channel) = event_loop.channel(self.fd()) {
            if !channel.writable() {
                channel.enable_write(&event_loop);
            }
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        self.flush_input();

        let pending = self.output.lock().unwrap().readable_size() > 0;
        if pending {
            let event_loop = EventLoop::current();
            if let Some(channel) = event_loop.channel(self.fd()) {
                if !channel.writable() {
                    channel.enable_write(&event_loop);
                }
            }
        } else {
            self.force_close();
        }
    }

    fn enable_inactivity_in_loop(self: &Arc<Self>, timeout: u64) {
        self.inactive_release.store(true, Ordering::Relaxed);

        let event_loop = EventLoop::current();
        if event_loop.has_after(self.id) {
            event_loop.refresh_after(self.id);
        } else {
            // The wheel holds the task only weakly through its close action,
            // so an expired timer on a dropped connection is a no-op.
            let weak = Arc::downgrade(self);
            event_loop.run_after(self.id, timeout, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Posts the actual teardown to the owning loop, guaranteeing it runs
    /// exactly once on that thread even when several readiness paths request
    /// it in the same cycle.
    fn force_close(self: &Arc<Self>) {
        let conn = self.clone();
        self.loop_handle.run_in_loop(move || conn.close_in_loop());
    }

    fn close_in_loop(self: &Arc<Self>) {
        let prev = self
            .state
            .swap(ConnectionState::Disconnected as u8, Ordering::Relaxed);
        if ConnectionState::from_u8(prev) == ConnectionState::Disconnected {
            return;
        }

        let event_loop = EventLoop::current();
        if let Some(channel) = event_loop.channel(self.fd()) {
            channel.disable_all(&event_loop);
            event_loop.remove_channel(&channel);
        }
        self.socket.close();
        event_loop.remove_after(self.id);

        let (close_cb, server_close_cb) = {
            let callbacks = self.callbacks.lock().unwrap();
            (callbacks.close.clone(), callbacks.server_close.clone())
        };
        if let Some(cb) = close_cb {
            cb(self);
        }
        if let Some(cb) = server_close_cb {
            cb(self);
        }
    }
}
