use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, trace};

use crate::handler::Handler;
use crate::heap::{self, Heap, Links};
use crate::notify::{AsyncSender, AsyncShared, Envelope, Sender};
use crate::ready::{Ready, Trigger};
use crate::slab::Slab;
use crate::sys;
use crate::token::Token;

const NANOS_PER_MILLI: u64 = 1_000_000;

// Handle flags.
const ACTIVE: u8 = 0b01;
const CLOSING: u8 = 0b10;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RunMode {
    Default,
    Once,
    NoWait,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Io,
    Timer,
    Idle,
    Prepare,
    Check,
    Async,
}

struct IoWatcher {
    fd: RawFd,
    trigger: Trigger,
    // What the kernel currently knows.
    events: Ready,
    // What is wanted; the kernel catches up at the next reconcile.
    levents: Ready,
    // Latent readiness delivered by the kernel but not yet consumed.
    revents: Ready,
    queued: bool,
}

struct TimerState {
    deadline: u64,
    repeat: u64,
    start_id: u64,
    links: Links,
}

enum Data {
    Io(IoWatcher),
    Timer(TimerState),
    Idle,
    Prepare,
    Check,
    Async(Arc<AsyncShared>),
}

struct Handle {
    flags: u8,
    data: Data,
}

impl Handle {
    fn kind(&self) -> Kind {
        match self.data {
            Data::Io(_) => Kind::Io,
            Data::Timer(_) => Kind::Timer,
            Data::Idle => Kind::Idle,
            Data::Prepare => Kind::Prepare,
            Data::Check => Kind::Check,
            Data::Async(_) => Kind::Async,
        }
    }

    fn io(&self) -> &IoWatcher {
        match &self.data {
            Data::Io(w) => w,
            _ => panic!("handle is not an io watcher"),
        }
    }

    fn io_mut(&mut self) -> &mut IoWatcher {
        match &mut self.data {
            Data::Io(w) => w,
            _ => panic!("handle is not an io watcher"),
        }
    }

    fn timer(&self) -> &TimerState {
        match &self.data {
            Data::Timer(t) => t,
            _ => panic!("handle is not a timer"),
        }
    }

    fn timer_mut(&mut self) -> &mut TimerState {
        match &mut self.data {
            Data::Timer(t) => t,
            _ => panic!("handle is not a timer"),
        }
    }
}

// The timer heap lives directly on the handle slab; only timer handles
// ever become heap nodes.
impl heap::Arena for Slab<Handle> {
    fn links(&self, node: usize) -> &Links {
        &self[node].timer().links
    }

    fn links_mut(&mut self, node: usize) -> &mut Links {
        &mut self[node].timer_mut().links
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (a, b) = (self[a].timer(), self[b].timer());
        (a.deadline, a.start_id) < (b.deadline, b.start_id)
    }
}

/// Single threaded readiness event loop.
///
/// The loop multiplexes kernel readiness, monotonic timers, per-iteration
/// watchers and cross-thread notifications behind one callback surface,
/// the [`Handler`] trait. Handles are created with the `*_init` methods,
/// armed with `*_start`, and torn down through the [`close`] protocol.
///
/// One call to [`run`] drives iterations until no handle, request or
/// pending close remains. Each iteration visits its phases in a fixed
/// order: timers, deferred callbacks, idle, prepare, poll, check, close.
/// All callbacks run on the calling thread; the only blocking point is the
/// kernel wait inside the poll phase.
///
/// [`close`]: EventLoop::close
/// [`run`]: EventLoop::run
///
/// # Examples
///
/// ```
/// use gyre::{EventLoop, Handler, Token};
///
/// struct App {
///     fired: bool,
/// }
///
/// impl Handler for App {
///     type Message = ();
///
///     fn timer(&mut self, _event_loop: &mut EventLoop<Self>, _token: Token) {
///         self.fired = true;
///     }
/// }
///
/// # fn try_main() -> std::io::Result<()> {
/// let mut event_loop = EventLoop::new()?;
/// let timer = event_loop.timer_init();
/// event_loop.timer_start(timer, 10, 0);
///
/// let mut app = App { fired: false };
/// let remaining = event_loop.run(&mut app);
///
/// assert!(app.fired);
/// assert_eq!(remaining, 0);
/// #     Ok(())
/// # }
/// # fn main() { try_main().unwrap(); }
/// ```
pub struct EventLoop<H: Handler> {
    // Cached monotonic clock, nanoseconds since `base`.
    base: Instant,
    time: u64,

    selector: sys::Selector,
    events: sys::Events,

    // Dense fd -> watcher table, grown to max(fd)+1.
    watchers: Vec<Option<Token>>,
    nfds: usize,
    // Watchers whose kernel registration has not caught up with their
    // requested interest.
    watcher_queue: VecDeque<Token>,

    handles: Slab<Handle>,
    timer_heap: Heap,
    start_id: u64,

    deferred: VecDeque<(Token, Ready)>,
    idle_watchers: Vec<Token>,
    prepare_watchers: Vec<Token>,
    check_watchers: Vec<Token>,
    async_watchers: Vec<Token>,
    closing: VecDeque<Token>,

    active_handles: usize,
    active_requests: usize,
    stop_flag: bool,

    waker: Arc<sys::Waker>,
    rx: mpsc::Receiver<Envelope<H::Message>>,
    tx: mpsc::Sender<Envelope<H::Message>>,
}

impl<H: Handler> EventLoop<H> {
    /// Create a new loop.
    ///
    /// Makes the syscalls that open the kernel readiness descriptor and
    /// the wakeup descriptor; fails when either is exhausted.
    pub fn new() -> io::Result<EventLoop<H>> {
        let selector = sys::Selector::new()?;
        let waker = sys::Waker::new()?;
        // The waker sits in the kernel set for the loop's whole life, so
        // the poll phase always has a descriptor to sleep on.
        selector.add(waker.as_raw_fd(), sys::waker_mask())?;
        let (tx, rx) = mpsc::channel();

        Ok(EventLoop {
            base: Instant::now(),
            time: 0,
            selector,
            events: Vec::with_capacity(sys::EVENTS_CAP),
            watchers: Vec::new(),
            nfds: 0,
            watcher_queue: VecDeque::new(),
            handles: Slab::new(),
            timer_heap: Heap::new(),
            start_id: 0,
            deferred: VecDeque::new(),
            idle_watchers: Vec::new(),
            prepare_watchers: Vec::new(),
            check_watchers: Vec::new(),
            async_watchers: Vec::new(),
            closing: VecDeque::new(),
            active_handles: 0,
            active_requests: 0,
            stop_flag: false,
            waker: Arc::new(waker),
            rx,
            tx,
        })
    }

    /// Cached monotonic time in nanoseconds.
    ///
    /// Stable for the duration of a phase; refreshed at the top of every
    /// iteration and after every kernel wait.
    pub fn now(&self) -> u64 {
        self.time
    }

    /// Refresh the cached monotonic clock.
    pub fn update_time(&mut self) {
        self.time = self.base.elapsed().as_nanos() as u64;
    }

    /// Number of items keeping the loop running: active handles, active
    /// requests, and handles awaiting their close callback.
    pub fn alive(&self) -> usize {
        self.active_handles + self.active_requests + self.closing.len()
    }

    /// True if the handle has been started and not stopped or closed.
    pub fn is_active(&self, token: Token) -> bool {
        self.handles
            .get(token.0)
            .map_or(false, |h| h.flags & ACTIVE != 0)
    }

    /// Run until no work remains or [`stop`] is called.
    ///
    /// Returns the number of items still keeping the loop alive, so zero
    /// means a clean exit.
    ///
    /// [`stop`]: EventLoop::stop
    pub fn run(&mut self, handler: &mut H) -> usize {
        self.run_mode(handler, RunMode::Default)
    }

    /// Run a single iteration, blocking in the poll phase.
    ///
    /// Returns immediately without a pass when nothing is alive; the
    /// liveness gate applies to every run mode.
    pub fn run_once(&mut self, handler: &mut H) -> usize {
        self.run_mode(handler, RunMode::Once)
    }

    /// Run a single iteration without blocking.
    ///
    /// Returns immediately without a pass when nothing is alive, like
    /// [`run_once`].
    ///
    /// [`run_once`]: EventLoop::run_once
    pub fn run_nowait(&mut self, handler: &mut H) -> usize {
        self.run_mode(handler, RunMode::NoWait)
    }

    /// Make the current (or next) `run` return after finishing its
    /// iteration. Idempotent; the flag clears when `run` returns.
    pub fn stop(&mut self) {
        self.stop_flag = true;
    }

    fn run_mode(&mut self, handler: &mut H, mode: RunMode) -> usize {
        let mut alive = self.alive();
        if alive == 0 {
            self.update_time();
        }

        while alive > 0 && !self.stop_flag {
            self.update_time();
            debug!("loop iteration; alive={}", alive);

            self.run_timers(handler);
            let ran_deferred = self.run_deferred(handler);
            self.run_idle(handler);
            self.run_prepare(handler);

            let timeout = match mode {
                RunMode::NoWait => 0,
                RunMode::Once if ran_deferred => 0,
                _ => self.backend_timeout(),
            };

            self.io_poll(handler, timeout);
            self.run_check(handler);
            self.run_closing(handler);

            if mode == RunMode::Once {
                // A blocking poll may have slept clean through to a timer
                // deadline; once mode still owes the caller forward
                // progress.
                self.update_time();
                self.run_timers(handler);
            }

            alive = self.alive();
            if mode != RunMode::Default {
                break;
            }
        }

        if self.stop_flag {
            self.stop_flag = false;
        }
        alive
    }

    /// Poll timeout in milliseconds: 0 to poll, -1 to block.
    fn backend_timeout(&self) -> i32 {
        if self.stop_flag {
            return 0;
        }
        if self.active_handles == 0 && self.active_requests == 0 {
            return 0;
        }
        if !self.idle_watchers.is_empty() {
            return 0;
        }
        if !self.deferred.is_empty() {
            return 0;
        }
        if !self.closing.is_empty() {
            return 0;
        }
        self.next_timer_timeout()
    }

    fn next_timer_timeout(&self) -> i32 {
        match self.timer_heap.min() {
            None => -1,
            Some(node) => {
                let deadline = self.handles[node].timer().deadline;
                if deadline <= self.time {
                    return 0;
                }
                let ms = (deadline - self.time + NANOS_PER_MILLI - 1) / NANOS_PER_MILLI;
                cmp::min(ms, i32::MAX as u64) as i32
            }
        }
    }

    // ===== handle bookkeeping =====

    fn alloc(&mut self, data: Data) -> Token {
        Token(self.handles.insert(Handle { flags: 0, data }))
    }

    fn handle_start(&mut self, token: Token) {
        let h = &mut self.handles[token.0];
        if h.flags & ACTIVE == 0 {
            h.flags |= ACTIVE;
            self.active_handles += 1;
        }
    }

    fn handle_stop(&mut self, token: Token) {
        let h = &mut self.handles[token.0];
        if h.flags & ACTIVE != 0 {
            h.flags &= !ACTIVE;
            self.active_handles -= 1;
        }
    }

    fn is_open(&self, token: Token) -> bool {
        self.handles
            .get(token.0)
            .map_or(false, |h| h.flags & CLOSING == 0)
    }

    fn open_check(&self, token: Token, kind: Kind) {
        let h = self
            .handles
            .get(token.0)
            .expect("operation on a dead handle");
        assert!(h.flags & CLOSING == 0, "operation on a closing handle");
        assert!(
            h.kind() == kind,
            "token does not belong to a {:?} handle",
            kind
        );
    }

    fn io_open_mut(&mut self, token: Token) -> &mut IoWatcher {
        let h = self
            .handles
            .get_mut(token.0)
            .expect("operation on a dead handle");
        assert!(h.flags & CLOSING == 0, "operation on a closing handle");
        h.io_mut()
    }

    fn timer_open_mut(&mut self, token: Token) -> &mut TimerState {
        let h = self
            .handles
            .get_mut(token.0)
            .expect("operation on a dead handle");
        assert!(h.flags & CLOSING == 0, "operation on a closing handle");
        h.timer_mut()
    }

    // ===== io watchers =====

    /// Register `fd` for readiness observation.
    ///
    /// The descriptor stays owned by the caller and must outlive the
    /// watcher; the loop never duplicates or closes it. The watcher is
    /// inert until [`io_start`] arms it.
    ///
    /// [`io_start`]: EventLoop::io_start
    pub fn io_init(&mut self, fd: RawFd, trigger: Trigger) -> Token {
        assert!(fd >= 0, "io watcher needs a valid descriptor");
        let token = self.alloc(Data::Io(IoWatcher {
            fd,
            trigger,
            events: Ready::EMPTY,
            levents: Ready::EMPTY,
            revents: Ready::EMPTY,
            queued: false,
        }));
        trace!("io_init; fd={} token={:?}", fd, token);
        token
    }

    /// Add `interest` to the watcher's requested mask.
    ///
    /// Idempotent in `(fd, interest)`. The kernel registration is
    /// reconciled at the top of the next poll phase.
    pub fn io_start(&mut self, token: Token, interest: Ready) {
        assert!(
            !interest.is_empty() && (interest - (Ready::READABLE | Ready::WRITABLE)).is_empty(),
            "io interest must be a non-empty subset of READABLE | WRITABLE"
        );
        let w = self.io_open_mut(token);
        w.levents |= interest;
        let fd = w.fd;
        let enqueue = !w.queued;
        w.queued = true;
        if enqueue {
            self.watcher_queue.push_back(token);
        }

        if self.watchers.len() <= fd as usize {
            self.watchers.resize(fd as usize + 1, None);
        }
        match self.watchers[fd as usize] {
            Some(owner) => assert!(
                owner == token,
                "descriptor is observed by another watcher"
            ),
            None => {
                self.watchers[fd as usize] = Some(token);
                self.nfds += 1;
            }
        }
        self.handle_start(token);
        trace!("io_start; token={:?} interest={:?}", token, interest);
    }

    /// Clear `interest` from the watcher's requested mask.
    ///
    /// When the last bit clears, the watcher leaves the fd table at once;
    /// readiness captured by an in-flight poll batch is dropped rather
    /// than delivered.
    pub fn io_stop(&mut self, token: Token, interest: Ready) {
        let w = self.io_open_mut(token);
        w.levents = w.levents - interest;
        if w.levents.is_empty() {
            let fd = w.fd;
            let dequeue = w.queued;
            w.queued = false;
            w.events = Ready::EMPTY;
            w.revents = Ready::EMPTY;
            if dequeue {
                self.watcher_queue.retain(|t| *t != token);
            }
            // Clear the table slot before any new watcher can land on a
            // reused fd number.
            if let Some(slot) = self.watchers.get_mut(fd as usize) {
                if *slot == Some(token) {
                    *slot = None;
                    self.nfds -= 1;
                }
            }
            self.handle_stop(token);
        } else if !w.queued {
            w.queued = true;
            self.watcher_queue.push_back(token);
        }
        trace!("io_stop; token={:?} interest={:?}", token, interest);
    }

    // ===== timers =====

    /// Create a timer handle. Inert until [`timer_start`].
    ///
    /// [`timer_start`]: EventLoop::timer_start
    pub fn timer_init(&mut self) -> Token {
        self.alloc(Data::Timer(TimerState {
            deadline: 0,
            repeat: 0,
            start_id: 0,
            links: Links::detached(),
        }))
    }

    /// Arm the timer to fire once after `timeout_ms`, then every
    /// `repeat_ms` if non-zero. Restarts the timer if it was already
    /// running.
    pub fn timer_start(&mut self, token: Token, timeout_ms: u64, repeat_ms: u64) {
        self.open_check(token, Kind::Timer);
        if self.is_active(token) {
            self.timer_heap.remove(&mut self.handles, token.0);
            self.handle_stop(token);
        }

        let deadline = self
            .time
            .saturating_add(timeout_ms.saturating_mul(NANOS_PER_MILLI));
        let start_id = self.next_start_id();
        {
            let t = self.timer_open_mut(token);
            t.deadline = deadline;
            t.repeat = repeat_ms.saturating_mul(NANOS_PER_MILLI);
            t.start_id = start_id;
        }
        self.timer_heap.insert(&mut self.handles, token.0);
        self.handle_start(token);
        trace!(
            "timer_start; token={:?} timeout={}ms repeat={}ms",
            token,
            timeout_ms,
            repeat_ms
        );
    }

    /// Disarm the timer. A no-op if it is not running.
    pub fn timer_stop(&mut self, token: Token) {
        self.open_check(token, Kind::Timer);
        if self.is_active(token) {
            self.timer_heap.remove(&mut self.handles, token.0);
            self.handle_stop(token);
        }
    }

    /// Re-arm a repeating timer to fire one repeat interval from now.
    ///
    /// Errors with `InvalidInput` when the timer has no repeat interval.
    pub fn timer_again(&mut self, token: Token) -> io::Result<()> {
        let repeat = {
            let t = self.timer_open_mut(token);
            t.repeat
        };
        if repeat == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timer has no repeat interval",
            ));
        }

        if self.is_active(token) {
            self.timer_heap.remove(&mut self.handles, token.0);
            self.handle_stop(token);
        }
        let deadline = self.time.saturating_add(repeat);
        let start_id = self.next_start_id();
        {
            let t = self.timer_open_mut(token);
            t.deadline = deadline;
            t.start_id = start_id;
        }
        self.timer_heap.insert(&mut self.handles, token.0);
        self.handle_start(token);
        Ok(())
    }

    /// Change the repeat interval. Takes effect when the timer next
    /// expires or is re-armed; the current deadline is left alone.
    pub fn timer_set_repeat(&mut self, token: Token, repeat_ms: u64) {
        self.timer_open_mut(token).repeat = repeat_ms.saturating_mul(NANOS_PER_MILLI);
    }

    /// The timer's repeat interval in milliseconds.
    pub fn timer_repeat(&self, token: Token) -> u64 {
        self.open_check(token, Kind::Timer);
        self.handles[token.0].timer().repeat / NANOS_PER_MILLI
    }

    fn next_start_id(&mut self) -> u64 {
        let id = self.start_id;
        self.start_id += 1;
        id
    }

    // ===== idle / prepare / check =====

    /// Create an idle watcher. While started it runs every iteration and
    /// keeps the poll phase from blocking.
    pub fn idle_init(&mut self) -> Token {
        self.alloc(Data::Idle)
    }

    /// Start the idle watcher. A no-op if it is already running.
    pub fn idle_start(&mut self, token: Token) {
        self.open_check(token, Kind::Idle);
        self.list_start(token, Kind::Idle);
    }

    /// Stop the idle watcher. A no-op if it is not running.
    pub fn idle_stop(&mut self, token: Token) {
        self.open_check(token, Kind::Idle);
        self.list_stop(token, Kind::Idle);
    }

    /// Create a prepare watcher; while started it runs right before every
    /// poll phase.
    pub fn prepare_init(&mut self) -> Token {
        self.alloc(Data::Prepare)
    }

    /// Start the prepare watcher. A no-op if it is already running.
    pub fn prepare_start(&mut self, token: Token) {
        self.open_check(token, Kind::Prepare);
        self.list_start(token, Kind::Prepare);
    }

    /// Stop the prepare watcher. A no-op if it is not running.
    pub fn prepare_stop(&mut self, token: Token) {
        self.open_check(token, Kind::Prepare);
        self.list_stop(token, Kind::Prepare);
    }

    /// Create a check watcher; while started it runs right after every
    /// poll phase.
    pub fn check_init(&mut self) -> Token {
        self.alloc(Data::Check)
    }

    /// Start the check watcher. A no-op if it is already running.
    pub fn check_start(&mut self, token: Token) {
        self.open_check(token, Kind::Check);
        self.list_start(token, Kind::Check);
    }

    /// Stop the check watcher. A no-op if it is not running.
    pub fn check_stop(&mut self, token: Token) {
        self.open_check(token, Kind::Check);
        self.list_stop(token, Kind::Check);
    }

    fn list_of(&mut self, kind: Kind) -> &mut Vec<Token> {
        match kind {
            Kind::Idle => &mut self.idle_watchers,
            Kind::Prepare => &mut self.prepare_watchers,
            Kind::Check => &mut self.check_watchers,
            _ => unreachable!("kind has no watcher list"),
        }
    }

    fn list_start(&mut self, token: Token, kind: Kind) {
        if !self.is_active(token) {
            self.list_of(kind).push(token);
            self.handle_start(token);
        }
    }

    fn list_stop(&mut self, token: Token, kind: Kind) {
        if self.is_active(token) {
            self.list_of(kind).retain(|t| *t != token);
            self.handle_stop(token);
        }
    }

    fn list_live(&self, token: Token, kind: Kind) -> bool {
        match self.handles.get(token.0) {
            Some(h) => h.flags & ACTIVE != 0 && h.flags & CLOSING == 0 && h.kind() == kind,
            None => false,
        }
    }

    // ===== async handles, channel, requests =====

    /// Create an async handle and the sender that signals it.
    ///
    /// The handle is active immediately and holds the loop open until
    /// closed. The sender may be cloned and moved to other threads; sends
    /// before the loop dispatches coalesce into one [`Handler::wake`].
    ///
    /// [`Handler::wake`]: crate::Handler::wake
    pub fn async_init(&mut self) -> (Token, AsyncSender) {
        let shared = Arc::new(AsyncShared {
            pending: AtomicBool::new(false),
        });
        let token = self.alloc(Data::Async(shared.clone()));
        self.async_watchers.push(token);
        self.handle_start(token);
        trace!("async_init; token={:?}", token);
        (token, AsyncSender::new(shared, self.waker.clone()))
    }

    /// A sender for the loop's message channel.
    ///
    /// Messages arrive at [`Handler::notify`] in send order, waking the
    /// loop if it is blocked in the kernel.
    ///
    /// [`Handler::notify`]: crate::Handler::notify
    pub fn channel(&self) -> Sender<H::Message> {
        Sender::new(self.tx.clone(), self.waker.clone())
    }

    /// Run `work` on a background thread and deliver its result to
    /// [`Handler::notify`].
    ///
    /// The request counts toward the loop's liveness from submission until
    /// the completion message has been delivered.
    ///
    /// [`Handler::notify`]: crate::Handler::notify
    pub fn submit<F>(&mut self, work: F)
    where
        F: FnOnce() -> H::Message + Send + 'static,
    {
        self.active_requests += 1;
        let tx = self.tx.clone();
        let waker = Arc::clone(&self.waker);
        thread::spawn(move || {
            let msg = work();
            // A dropped receiver means the loop itself is gone.
            if tx.send(Envelope::Request(msg)).is_ok() {
                let _ = waker.wake();
            }
        });
    }

    /// Queue `events` for delivery to [`Handler::pending`] at the next
    /// pass of the deferred phase — later in this iteration when called
    /// before it, otherwise in the next one.
    ///
    /// [`Handler::pending`]: crate::Handler::pending
    pub fn defer(&mut self, token: Token, events: Ready) {
        assert!(self.is_open(token), "defer on a dead handle");
        self.deferred.push_back((token, events));
    }

    // ===== close protocol =====

    /// Request teardown of a handle.
    ///
    /// Stops the handle immediately — no further readiness, timer or
    /// watcher callbacks fire — and queues it for the close phase, where
    /// [`Handler::closed`] is delivered and the token is released. Safe
    /// from inside any callback, including the handle's own. Closing a
    /// handle twice is a programming error and panics.
    ///
    /// [`Handler::closed`]: crate::Handler::closed
    pub fn close(&mut self, token: Token) {
        let kind = {
            let h = self
                .handles
                .get(token.0)
                .expect("close of an unknown handle");
            assert!(h.flags & CLOSING == 0, "handle closed twice");
            h.kind()
        };

        match kind {
            Kind::Io => {
                let levents = self.handles[token.0].io().levents;
                if !levents.is_empty() {
                    self.io_stop(token, levents);
                }
                self.handles[token.0].io_mut().revents = Ready::EMPTY;
            }
            Kind::Timer => {
                if self.is_active(token) {
                    self.timer_heap.remove(&mut self.handles, token.0);
                    self.handle_stop(token);
                }
            }
            Kind::Idle => self.list_stop(token, Kind::Idle),
            Kind::Prepare => self.list_stop(token, Kind::Prepare),
            Kind::Check => self.list_stop(token, Kind::Check),
            Kind::Async => {
                self.async_watchers.retain(|t| *t != token);
                self.handle_stop(token);
            }
        }

        self.handles[token.0].flags |= CLOSING;
        self.closing.push_back(token);
        trace!("close requested; token={:?}", token);
    }

    // ===== iteration phases =====

    fn run_timers(&mut self, handler: &mut H) {
        while let Some(node) = self.timer_heap.min() {
            let token = Token(node);
            let (deadline, repeat) = {
                let t = self.handles[node].timer();
                (t.deadline, t.repeat)
            };
            if deadline > self.time {
                break;
            }

            self.timer_heap.remove(&mut self.handles, node);
            if repeat > 0 {
                // Catch up by whole periods; a stalled callback must not
                // produce a burst of back-to-back fires.
                let next = cmp::max(self.time, deadline.saturating_add(repeat));
                let start_id = self.next_start_id();
                {
                    let t = self.handles[node].timer_mut();
                    t.deadline = next;
                    t.start_id = start_id;
                }
                self.timer_heap.insert(&mut self.handles, node);
            } else {
                self.handle_stop(token);
            }

            trace!("timer fired; token={:?}", token);
            handler.timer(self, token);
        }
    }

    fn run_deferred(&mut self, handler: &mut H) -> bool {
        if self.deferred.is_empty() {
            return false;
        }
        // Work deferred from inside these callbacks lands in the fresh
        // queue and runs next iteration.
        let mut batch = mem::take(&mut self.deferred);
        for (token, events) in batch.drain(..) {
            if self.is_open(token) {
                handler.pending(self, token, events);
            }
        }
        true
    }

    fn run_idle(&mut self, handler: &mut H) {
        // Snapshot: watchers started during the phase run next time.
        let snapshot = self.idle_watchers.clone();
        for token in snapshot {
            if self.list_live(token, Kind::Idle) {
                handler.idle(self, token);
            }
        }
    }

    fn run_prepare(&mut self, handler: &mut H) {
        let snapshot = self.prepare_watchers.clone();
        for token in snapshot {
            if self.list_live(token, Kind::Prepare) {
                handler.prepare(self, token);
            }
        }
    }

    fn run_check(&mut self, handler: &mut H) {
        let snapshot = self.check_watchers.clone();
        for token in snapshot {
            if self.list_live(token, Kind::Check) {
                handler.check(self, token);
            }
        }
    }

    fn run_closing(&mut self, handler: &mut H) {
        // FIFO over the entries present at phase start; closes requested
        // from inside these callbacks run next pass.
        let mut remaining = self.closing.len();
        while remaining > 0 {
            remaining -= 1;
            let token = self.closing.pop_front().expect("closing queue underflow");
            trace!("delivering close; token={:?}", token);
            handler.closed(self, token);
            self.handles.remove(token.0);
        }
    }

    // ===== poll phase =====

    /// Reconcile requested interest with the kernel before blocking.
    fn flush_watcher_queue(&mut self, handler: &mut H) {
        while let Some(token) = self.watcher_queue.pop_front() {
            let (fd, trigger, events, levents) = match self.handles.get_mut(token.0) {
                Some(h) if h.flags & CLOSING == 0 => {
                    let w = h.io_mut();
                    w.queued = false;
                    (w.fd, w.trigger, w.events, w.levents)
                }
                _ => continue,
            };
            debug_assert!(!levents.is_empty(), "queued watcher with no interest");

            if trigger == Trigger::Edge && !events.is_empty() {
                // The kernel already holds the full edge mask; surface
                // latent readiness for newly requested bits without a
                // syscall.
                let latent = {
                    let w = self.handles[token.0].io_mut();
                    let latent = w.revents & (w.levents - w.events);
                    w.revents = w.revents - latent;
                    w.events = w.levents;
                    latent
                };
                if !latent.is_empty() {
                    trace!("latent readiness; token={:?} events={:?}", token, latent);
                    handler.ready(self, token, latent);
                }
                continue;
            }

            let mask = sys::interest_mask(levents, trigger);
            let res = if events.is_empty() {
                self.selector.add(fd, mask)
            } else {
                self.selector.modify(fd, mask)
            };
            if let Err(err) = res {
                if events.is_empty() && err.raw_os_error() == Some(libc::EEXIST) {
                    // The fd number was registered before this watcher saw
                    // it, e.g. dup2'd onto a known descriptor.
                    match trigger {
                        Trigger::Level => {
                            if let Err(err) = self.selector.modify(fd, mask) {
                                panic!("epoll_ctl MOD failed for fd {}: {}", fd, err);
                            }
                        }
                        Trigger::Edge => {
                            // The prior trigger mode is unknown;
                            // re-register from scratch.
                            let _ = self.selector.delete(fd);
                            if let Err(err) = self.selector.add(fd, mask) {
                                panic!("epoll_ctl ADD failed for fd {}: {}", fd, err);
                            }
                        }
                    }
                } else {
                    panic!("epoll_ctl failed for fd {}: {}", fd, err);
                }
            }
            self.handles[token.0].io_mut().events = levents;
        }
    }

    fn io_poll(&mut self, handler: &mut H, mut timeout: i32) {
        self.flush_watcher_queue(handler);

        trace!("polling; timeout={}ms nfds={}", timeout, self.nfds);

        loop {
            let base = self.time;
            let res = self.selector.wait(&mut self.events, timeout);
            // The clock refresh is unconditional: even a zero-timeout wait
            // may have been preceded by preemption.
            self.update_time();

            match res {
                Ok(_) => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    if timeout == -1 {
                        continue;
                    }
                    if timeout == 0 {
                        return;
                    }
                    let elapsed = ((self.time - base) / NANOS_PER_MILLI) as i64;
                    if elapsed >= timeout as i64 {
                        return;
                    }
                    timeout -= elapsed as i32;
                }
                Err(err) => panic!("epoll_wait failed: {}", err),
            }
        }

        let nevents = self.events.len();
        let waker_fd = self.waker.as_raw_fd();
        for i in 0..nevents {
            let event: sys::Event = self.events[i];
            let fd = sys::event_fd(&event);

            if fd == waker_fd {
                self.drain_notifications(handler);
                continue;
            }

            let token = match self.watchers.get(fd as usize) {
                Some(&Some(token)) => token,
                _ => {
                    // The watcher was stopped while this batch was in
                    // flight; drop the stale kernel registration.
                    trace!("stale event; fd={}", fd);
                    let _ = self.selector.delete(fd);
                    continue;
                }
            };

            let deliver = match self.handles.get_mut(token.0) {
                Some(h) if h.flags & CLOSING == 0 => {
                    let w = h.io_mut();
                    w.revents |= sys::ready_from(&event);
                    let deliver = w.revents & (w.events | Ready::ERROR | Ready::HUP);
                    w.revents = w.revents - deliver;
                    deliver
                }
                _ => Ready::EMPTY,
            };

            if !deliver.is_empty() {
                handler.ready(self, token, deliver);
            }
        }
    }

    fn drain_notifications(&mut self, handler: &mut H) {
        self.waker.ack();

        // Coalesced async handles first.
        let snapshot = self.async_watchers.clone();
        for token in snapshot {
            let fire = match self.handles.get(token.0) {
                Some(h) if h.flags & ACTIVE != 0 && h.flags & CLOSING == 0 => match &h.data {
                    Data::Async(shared) => shared.pending.swap(false, Ordering::AcqRel),
                    _ => false,
                },
                _ => false,
            };
            if fire {
                handler.wake(self, token);
            }
        }

        // Then queued messages, in send order.
        loop {
            let envelope = match self.rx.try_recv() {
                Ok(envelope) => envelope,
                Err(_) => break,
            };
            match envelope {
                Envelope::Message(msg) => handler.notify(self, msg),
                Envelope::Request(msg) => {
                    self.active_requests -= 1;
                    handler.notify(self, msg);
                }
            }
        }
    }
}

impl<H: Handler> fmt::Debug for EventLoop<H> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("handles", &self.handles.len())
            .field("active_handles", &self.active_handles)
            .field("active_requests", &self.active_requests)
            .field("timers", &self.timer_heap.len())
            .field("closing", &self.closing.len())
            .field("nfds", &self.nfds)
            .finish()
    }
}
