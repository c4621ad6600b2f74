//! Bounded first-in first-out admission to the worker.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Tickets {
    next: u64,
    serving: u64,
}

/// Ticket lock that lets one caller at a time through, in arrival order, and turns
/// callers away once `capacity` of them are already waiting.
#[derive(Debug)]
pub struct CallQueue {
    tickets: Mutex<Tickets>,
    turn: Condvar,
    capacity: AtomicUsize,
}

/// Held while a caller owns the worker; dropping it admits the next caller.
#[must_use]
pub struct Turn<'a> {
    queue: &'a CallQueue,
}

impl CallQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tickets: Mutex::new(Tickets::default()),
            turn: Condvar::new(),
            capacity: AtomicUsize::new(capacity),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// Callers currently holding or waiting for a turn.
    pub fn len(&self) -> usize {
        let tickets = self.tickets.lock();
        (tickets.next - tickets.serving) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until it is this caller's turn.
    pub fn enter(&self) -> Result<Turn<'_>> {
        let mut tickets = self.tickets.lock();

        let waiting = ((tickets.next - tickets.serving) as usize).saturating_sub(1);
        let occupied = tickets.next != tickets.serving;
        if occupied && waiting >= self.capacity.load(Ordering::Relaxed) {
            return Err(Error::QueueFull(waiting));
        }

        let ticket = tickets.next;
        tickets.next += 1;
        while tickets.serving != ticket {
            self.turn.wait(&mut tickets);
        }

        Ok(Turn { queue: self })
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut tickets = self.queue.tickets.lock();
        tickets.serving += 1;
        drop(tickets);
        self.queue.turn.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn wait_for_len(queue: &CallQueue, len: usize) {
        while queue.len() != len {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn admits_waiters_in_arrival_order() {
        let queue = Arc::new(CallQueue::new(16));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = queue.enter().unwrap();
        let mut handles = Vec::new();
        for i in 0..5 {
            let (waiter, order) = (queue.clone(), order.clone());
            handles.push(thread::spawn(move || {
                let _turn = waiter.enter().unwrap();
                order.lock().push(i);
            }));
            wait_for_len(&queue, i + 2);
        }

        drop(first);
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn rejects_callers_beyond_capacity() {
        let queue = Arc::new(CallQueue::new(1));
        let active = queue.enter().unwrap();

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.enter().map(|_turn| ()))
        };
        wait_for_len(&queue, 2);

        assert!(matches!(queue.enter(), Err(Error::QueueFull(1))));

        drop(active);
        waiter.join().unwrap().unwrap();
        assert!(queue.is_empty());
    }
}
