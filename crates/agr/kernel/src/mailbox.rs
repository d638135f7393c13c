//! Per-agent message queues.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use agr_types::Message;
use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Slots {
    queue: VecDeque<Message>,
    closed: bool,
}

/// FIFO mailbox of one agent.
///
/// A closed mailbox rejects new messages and drops the pending ones.
#[derive(Default)]
pub struct Mailbox {
    slots: Mutex<Slots>,
    available: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Returns false if the mailbox is closed.
    pub fn enqueue(&self, message: Message) -> bool {
        let mut slots = self.slots.lock();
        if slots.closed {
            return false;
        }
        slots.queue.push_back(message);
        drop(slots);
        self.available.notify_one();
        true
    }

    pub fn try_next(&self) -> Option<Message> {
        self.slots.lock().queue.pop_front()
    }

    /// Wait for the next message. `None` means the wait timed out or the
    /// mailbox was closed; `None` as timeout waits indefinitely.
    pub fn wait_next(&self, timeout: Option<Duration>) -> Option<Message> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut slots = self.slots.lock();
        loop {
            if let Some(message) = slots.queue.pop_front() {
                return Some(message);
            }
            if slots.closed {
                return None;
            }
            match deadline {
                None => self.available.wait(&mut slots),
                Some(deadline) => {
                    if self.available.wait_until(&mut slots, deadline).timed_out() {
                        return slots.queue.pop_front();
                    }
                }
            }
        }
    }

    /// Close the mailbox and wake every waiter. Returns how many pending
    /// messages were dropped.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut slots = self.slots.lock();
            slots.closed = true;
            let dropped = slots.queue.len();
            slots.queue.clear();
            dropped
        };
        self.available.notify_all();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.slots.lock().closed
    }

    pub fn len(&self) -> usize {
        self.slots.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("Mailbox")
            .field("pending", &slots.queue.len())
            .field("closed", &slots.closed)
            .finish()
    }
}
