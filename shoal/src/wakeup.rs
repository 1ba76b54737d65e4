//! Cross-thread wake-up channel. The only manager surface that may be
//! touched from another thread: a [`Broadcaster`] enqueues a control record
//! (callback plus owned payload) and flags readiness, and the dispatcher
//! drains the queue inside the next loop iteration, replaying each record to
//! every live connection in list order.

use crate::connection::Connection;
use crate::logging::{self, Logger};
use mio::{Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use std::io;
use std::sync::mpsc;

/// Callback carried by a control record. Invoked once per live connection
/// with the record's payload.
pub type BroadcastFn = Box<dyn FnMut(&mut Connection, &[u8]) + Send>;

pub(crate) struct BroadcastMsg {
    pub callback: BroadcastFn,
    pub data: Vec<u8>,
}

/// Thread-safe sending half of the wake-up channel. Clone freely; each clone
/// may live on a different thread. The queue is unbounded, so `broadcast`
/// never blocks.
#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<BroadcastMsg>,
    ready: SetReadiness,
}

impl Broadcaster {
    /// Enqueues one control record and wakes the readiness loop. Returns
    /// false when the owning manager is gone.
    pub fn broadcast<F>(&self, callback: F, data: Vec<u8>) -> bool
    where
        F: FnMut(&mut Connection, &[u8]) + Send + 'static,
    {
        let msg = BroadcastMsg {
            callback: Box::new(callback),
            data,
        };

        if self.tx.send(msg).is_err() {
            return false;
        }

        self.ready.set_readiness(Ready::readable()).is_ok()
    }
}

/// Dispatcher-side half, polled like any other readiness source.
pub(crate) struct WakeupQueue {
    registration: Registration,
    ready: SetReadiness,
    rx: mpsc::Receiver<BroadcastMsg>,
    log: Logger,
}

impl WakeupQueue {
    pub fn new(log: &Logger) -> (WakeupQueue, Broadcaster) {
        let (registration, ready) = Registration::new2();
        let (tx, rx) = mpsc::channel();

        let queue = WakeupQueue {
            registration,
            ready: ready.clone(),
            rx,
            log: log.new(logging::o!("component" => "wakeup")),
        };

        (queue, Broadcaster { tx, ready })
    }

    pub fn register(&self, poll: &Poll, token: Token) -> io::Result<()> {
        poll.register(&self.registration, token, Ready::readable(), PollOpt::edge())
    }

    /// Drains all pending control records and rearms the channel. Readiness
    /// is cleared before the queue is read, so a record enqueued mid-drain
    /// either lands in this batch or re-arms the channel for the next poll.
    pub fn drain(&self) -> Vec<BroadcastMsg> {
        if let Err(err) = self.ready.set_readiness(Ready::empty()) {
            logging::warn!(self.log, "failed to rearm wakeup channel"; "error" => %err);
        }

        let mut msgs = Vec::new();

        while let Ok(msg) = self.rx.try_recv() {
            msgs.push(msg);
        }

        logging::trace!(self.log, "drained wakeup channel"; "records" => msgs.len());

        msgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Events;
    use std::thread;
    use std::time::Duration;

    fn discard() -> Logger {
        Logger::root(logging::Discard, logging::o!())
    }

    #[test]
    fn test_broadcast_wakes_poll() {
        let log = discard();
        let (queue, tx) = WakeupQueue::new(&log);

        let poll = Poll::new().unwrap();
        queue.register(&poll, Token(7)).unwrap();

        let sender = thread::spawn(move || {
            assert!(tx.broadcast(|_conn, _data| {}, b"ping".to_vec()));
        });

        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();

        let tokens: Vec<Token> = events.iter().map(|ev| ev.token()).collect();
        assert_eq!(tokens, vec![Token(7)]);

        let msgs = queue.drain();
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0].data[..], b"ping");

        sender.join().unwrap();
    }

    #[test]
    fn test_broadcast_after_manager_drop_reports_failure() {
        let log = discard();
        let (queue, tx) = WakeupQueue::new(&log);

        drop(queue);

        assert!(!tx.broadcast(|_conn, _data| {}, Vec::new()));
    }
}
