use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use gyre::{AsyncSender, EventLoop, Handler, Ready, Sender, Token};

mod util;

use util::{assert_send, assert_sync, init};

#[test]
fn senders_are_send_and_sync() {
    assert_send::<AsyncSender>();
    assert_sync::<AsyncSender>();
    assert_send::<Sender<u32>>();
    assert_sync::<Sender<u32>>();
}

struct BurstHandler {
    wakes: usize,
    busy_once: bool,
    async_token: Token,
}

impl Handler for BurstHandler {
    type Message = ();

    fn wake(&mut self, _event_loop: &mut EventLoop<Self>, token: Token) {
        assert_eq!(token, self.async_token);
        self.wakes += 1;
        if self.busy_once {
            self.busy_once = false;
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn notify(&mut self, event_loop: &mut EventLoop<Self>, _msg: ()) {
        event_loop.close(self.async_token);
    }
}

// One hundred rapid-fire sends against a busy loop coalesce into anywhere
// between one and one hundred wake callbacks.
#[test]
fn async_sends_coalesce() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create event loop");
    let (token, sender) = event_loop.async_init();
    let done = event_loop.channel();

    let barrier = Arc::new(Barrier::new(2));
    let barrier2 = barrier.clone();
    let producer = thread::spawn(move || {
        barrier2.wait();
        for _ in 0..100 {
            sender.send().expect("unable to signal");
        }
        done.send(()).expect("unable to send sentinel");
    });

    barrier.wait();
    let mut handler = BurstHandler {
        wakes: 0,
        busy_once: true,
        async_token: token,
    };
    let remaining = event_loop.run(&mut handler);

    assert!(handler.wakes >= 1, "at least one wake must land");
    assert!(handler.wakes <= 100, "wakes cannot outnumber sends");
    assert_eq!(remaining, 0);
    producer.join().unwrap();
}

struct MessageLog {
    msgs: Vec<u32>,
    async_token: Token,
}

impl Handler for MessageLog {
    type Message = u32;

    fn notify(&mut self, event_loop: &mut EventLoop<Self>, msg: u32) {
        self.msgs.push(msg);
        if msg == 5 {
            event_loop.close(self.async_token);
        }
    }
}

#[test]
fn channel_messages_arrive_in_send_order() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create event loop");
    // The async handle only exists to hold the loop open.
    let (token, _keepalive) = event_loop.async_init();
    let sender = event_loop.channel();

    let producer = thread::spawn(move || {
        for i in 1..=5u32 {
            sender.send(i).expect("unable to send");
        }
    });

    let mut handler = MessageLog {
        msgs: Vec::new(),
        async_token: token,
    };
    let remaining = event_loop.run(&mut handler);

    assert_eq!(handler.msgs, [1, 2, 3, 4, 5]);
    assert_eq!(remaining, 0);
    producer.join().unwrap();
}

struct RequestLog {
    msgs: Vec<u32>,
}

impl Handler for RequestLog {
    type Message = u32;

    fn notify(&mut self, _event_loop: &mut EventLoop<Self>, msg: u32) {
        self.msgs.push(msg);
    }
}

// A submitted request keeps the loop alive until its completion message
// has been delivered, with no other handles registered.
#[test]
fn submit_holds_the_loop_open() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create event loop");
    event_loop.submit(|| {
        thread::sleep(Duration::from_millis(10));
        42u32
    });

    let mut handler = RequestLog { msgs: Vec::new() };
    let remaining = event_loop.run(&mut handler);

    assert_eq!(handler.msgs, [42]);
    assert_eq!(remaining, 0);
}

#[test]
fn submitted_requests_complete_in_any_order() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create event loop");
    for i in 0..4u32 {
        event_loop.submit(move || {
            thread::sleep(Duration::from_millis(u64::from(4 - i)));
            i
        });
    }

    let mut handler = RequestLog { msgs: Vec::new() };
    let remaining = event_loop.run(&mut handler);

    let mut seen = handler.msgs.clone();
    seen.sort_unstable();
    assert_eq!(seen, [0, 1, 2, 3]);
    assert_eq!(remaining, 0);
}

struct Deferred {
    keepalive: Token,
    pending: Vec<(Token, Ready)>,
}

impl Handler for Deferred {
    type Message = ();

    fn timer(&mut self, event_loop: &mut EventLoop<Self>, token: Token) {
        event_loop.defer(token, Ready::WRITABLE);
        event_loop.defer(token, Ready::READABLE);
    }

    fn pending(&mut self, event_loop: &mut EventLoop<Self>, token: Token, events: Ready) {
        self.pending.push((token, events));
        if self.pending.len() == 2 {
            event_loop.close(token);
            event_loop.close(self.keepalive);
        }
    }
}

// Deferred callbacks run in the pending phase, in FIFO order.
#[test]
fn deferred_callbacks_run_fifo() {
    init();

    let mut event_loop = EventLoop::new().expect("unable to create event loop");
    let timer = event_loop.timer_init();
    event_loop.timer_start(timer, 1, 0);
    // Deferred work alone does not hold the loop open; an async handle
    // carries it across the iteration boundary.
    let (keepalive, _sender) = event_loop.async_init();

    let mut handler = Deferred {
        keepalive,
        pending: Vec::new(),
    };
    let remaining = event_loop.run(&mut handler);

    assert_eq!(
        handler.pending,
        [(timer, Ready::WRITABLE), (timer, Ready::READABLE)]
    );
    assert_eq!(remaining, 0);
}
