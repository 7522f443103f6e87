use gyre::{EventLoop, Handler, Token};

mod util;

use util::init;

#[derive(Default)]
struct CloseTracker {
    victims: Vec<Token>,
    timer_fires: usize,
    closed: Vec<Token>,
}

impl Handler for CloseTracker {
    type Message = ();

    fn timer(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {
        self.timer_fires += 1;
        // Close the second handle first, then ourselves; delivery must
        // follow this order, not creation order.
        let other = self.victims[1];
        event_loop.close(other);
        event_loop.close(token);
    }

    fn closed(&mut self, _event_loop: &mut EventLoop<Self>, token: Token) {
        self.closed.push(token);
    }
}

// Closing handles from inside a callback defers both close callbacks to
// the close phase, in request order, after which the loop exits.
#[test]
fn close_during_callback_is_deferred_fifo() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create event loop");
    let timer = event_loop.timer_init();
    let idle = event_loop.idle_init();
    event_loop.timer_start(timer, 1, 0);
    event_loop.idle_start(idle);

    let mut handler = CloseTracker {
        victims: vec![timer, idle],
        ..Default::default()
    };
    let remaining = event_loop.run(&mut handler);

    assert_eq!(handler.timer_fires, 1);
    assert_eq!(handler.closed, [idle, timer]);
    assert_eq!(remaining, 0);
}

#[derive(Default)]
struct ChainedClose {
    next: Option<Token>,
    closed: Vec<Token>,
}

impl Handler for ChainedClose {
    type Message = ();

    fn timer(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {
        event_loop.close(token);
    }

    fn closed(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {
        self.closed.push(token);
        if let Some(next) = self.next.take() {
            // A close requested from a close callback lands in the next
            // pass of the close phase.
            event_loop.close(next);
        }
    }
}

#[test]
fn close_requested_from_close_callback_runs_next_pass() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create event loop");
    let timer = event_loop.timer_init();
    let bystander = event_loop.timer_init();
    event_loop.timer_start(timer, 1, 0);

    let mut handler = ChainedClose {
        next: Some(bystander),
        closed: Vec::new(),
    };
    let remaining = event_loop.run(&mut handler);

    assert_eq!(handler.closed, [timer, bystander]);
    assert_eq!(remaining, 0);
}

struct Quiet;

impl Handler for Quiet {
    type Message = ();
}

// A stopped-but-open handle does not keep the loop running, and a closed
// one still gets its callback before exit.
#[test]
fn closing_queue_keeps_loop_alive() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create event loop");
    let timer = event_loop.timer_init();
    event_loop.close(timer);

    let mut handler = Quiet;
    let remaining = event_loop.run(&mut handler);
    assert_eq!(remaining, 0);
}

#[test]
#[should_panic(expected = "handle closed twice")]
fn double_close_panics() {
    let mut event_loop = EventLoop::<Quiet>::new().expect("unable to create event loop");
    let timer = event_loop.timer_init();
    event_loop.close(timer);
    event_loop.close(timer);
}

#[test]
#[should_panic(expected = "operation on a closing handle")]
fn start_of_closing_handle_panics() {
    let mut event_loop = EventLoop::<Quiet>::new().expect("unable to create event loop");
    let timer = event_loop.timer_init();
    event_loop.close(timer);
    event_loop.timer_start(timer, 1, 0);
}

#[test]
#[should_panic(expected = "token does not belong to a Timer handle")]
fn kind_mismatch_panics() {
    let mut event_loop = EventLoop::<Quiet>::new().expect("unable to create event loop");
    let idle = event_loop.idle_init();
    event_loop.timer_start(idle, 1, 0);
}

struct PhaseLog {
    order: Vec<&'static str>,
}

impl Handler for PhaseLog {
    type Message = ();

    fn timer(&mut self, _event_loop: &mut EventLoop<Self>, _token: Token) {
        self.order.push("timer");
    }

    fn idle(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {
        self.order.push("idle");
        event_loop.close(token);
    }

    fn prepare(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {
        self.order.push("prepare");
        event_loop.close(token);
    }

    fn check(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {
        self.order.push("check");
        event_loop.close(token);
    }

    fn closed(&mut self, _event_loop: &mut EventLoop<Self>, _token: Token) {
        self.order.push("closed");
    }
}

// One iteration visits timers, idle, prepare, check and close in order.
#[test]
fn phases_run_in_order() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create event loop");
    let timer = event_loop.timer_init();
    let idle = event_loop.idle_init();
    let prepare = event_loop.prepare_init();
    let check = event_loop.check_init();
    event_loop.timer_start(timer, 0, 0);
    event_loop.idle_start(idle);
    event_loop.prepare_start(prepare);
    event_loop.check_start(check);

    let mut handler = PhaseLog { order: Vec::new() };
    // The timer handle stays open but inactive after firing; everything
    // else closes itself, so one full iteration ends the loop.
    let remaining = event_loop.run(&mut handler);

    assert_eq!(
        handler.order,
        ["timer", "idle", "prepare", "check", "closed", "closed", "closed"]
    );
    assert_eq!(remaining, 0);
}

struct StopsWatchers {
    idle: Token,
    prepare: Token,
    check: Token,
    idle_runs: usize,
    prepare_runs: usize,
    check_runs: usize,
    runs_at_stop: Option<(usize, usize, usize)>,
    timer_fires: usize,
}

impl Handler for StopsWatchers {
    type Message = ();

    fn idle(&mut self, _event_loop: &mut EventLoop<Self>, _token: Token) {
        self.idle_runs += 1;
    }

    fn prepare(&mut self, _event_loop: &mut EventLoop<Self>, _token: Token) {
        self.prepare_runs += 1;
    }

    fn check(&mut self, _event_loop: &mut EventLoop<Self>, _token: Token) {
        self.check_runs += 1;
    }

    fn timer(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {
        self.timer_fires += 1;
        match self.timer_fires {
            1 => {
                event_loop.idle_stop(self.idle);
                event_loop.prepare_stop(self.prepare);
                event_loop.check_stop(self.check);
                self.runs_at_stop = Some((self.idle_runs, self.prepare_runs, self.check_runs));
            }
            _ => {
                event_loop.close(self.idle);
                event_loop.close(self.prepare);
                event_loop.close(self.check);
                event_loop.close(token);
            }
        }
    }
}

// Stopping a per-iteration watcher mid-run silences it: the loop keeps
// iterating on the timer, but no further idle/prepare/check callbacks
// arrive after the stop.
#[test]
fn stopped_watchers_no_longer_fire() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create event loop");
    let timer = event_loop.timer_init();
    let idle = event_loop.idle_init();
    let prepare = event_loop.prepare_init();
    let check = event_loop.check_init();
    event_loop.timer_start(timer, 5, 5);
    event_loop.idle_start(idle);
    event_loop.prepare_start(prepare);
    event_loop.check_start(check);

    let mut handler = StopsWatchers {
        idle,
        prepare,
        check,
        idle_runs: 0,
        prepare_runs: 0,
        check_runs: 0,
        runs_at_stop: None,
        timer_fires: 0,
    };
    let remaining = event_loop.run(&mut handler);

    // The active idle watcher kept the poll phase from blocking, so the
    // watchers got iterations in before the first timer fire.
    assert!(handler.idle_runs >= 1);
    assert!(handler.prepare_runs >= 1);
    assert!(handler.check_runs >= 1);
    // Nothing fired after the stop.
    assert_eq!(
        handler.runs_at_stop,
        Some((handler.idle_runs, handler.prepare_runs, handler.check_runs))
    );
    assert_eq!(handler.timer_fires, 2);
    assert_eq!(remaining, 0);
}
