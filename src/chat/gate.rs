//! Per-session generation gate
//!
//! Turns are handed out as tickets at reservation time, so generations on a
//! session run in the order they were reserved, not the order their tasks
//! happen to be polled.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct Queue {
    next_ticket: u64,
    serving: u64,
    /// Tickets dropped before their turn came
    abandoned: BTreeSet<u64>,
}

#[derive(Debug)]
struct Gate {
    queue: Mutex<Queue>,
    turn: watch::Sender<u64>,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            turn: watch::Sender::new(0),
        }
    }
}

impl Gate {
    fn advance(&self, queue: &mut Queue) {
        queue.serving += 1;
        while queue.abandoned.remove(&queue.serving) {
            queue.serving += 1;
        }
        self.turn.send_replace(queue.serving);
    }

    fn release(&self) {
        let mut queue = lock(&self.queue);
        self.advance(&mut queue);
    }

    fn abandon(&self, ticket: u64) {
        let mut queue = lock(&self.queue);
        if queue.serving == ticket {
            self.advance(&mut queue);
        } else {
            queue.abandoned.insert(ticket);
        }
    }
}

/// Serializes generations on the same session while letting different
/// sessions proceed in parallel. Turns are served in reservation order.
#[derive(Debug, Default)]
pub struct SessionGates {
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

/// A place in a session's queue. Dropping it before [`GateTicket::acquire`]
/// returns gives the turn up.
#[derive(Debug)]
pub struct GateTicket {
    gate: Arc<Gate>,
    ticket: u64,
    served: bool,
}

/// Exclusive generation rights on a session, released on drop
#[derive(Debug)]
pub struct SessionGuard {
    gate: Arc<Gate>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl GateTicket {
    /// Wait for this ticket's turn
    pub async fn acquire(mut self) -> SessionGuard {
        let mut turn = self.gate.turn.subscribe();
        let ticket = self.ticket;
        // The sender lives in the gate this ticket holds, so waiting cannot fail.
        let _ = turn.wait_for(|serving| *serving == ticket).await;
        self.served = true;
        SessionGuard {
            gate: self.gate.clone(),
        }
    }
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        if !self.served {
            self.gate.abandon(self.ticket);
        }
    }
}

impl SessionGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next place in `session_id`'s queue without waiting
    pub fn reserve(&self, session_id: &str) -> GateTicket {
        let gate = {
            let mut gates = lock(&self.gates);
            // Entries only referenced by the map are idle.
            gates.retain(|_, gate| Arc::strong_count(gate) > 1);
            gates.entry(session_id.to_string()).or_default().clone()
        };
        let ticket = {
            let mut queue = lock(&gate.queue);
            let ticket = queue.next_ticket;
            queue.next_ticket += 1;
            ticket
        };
        GateTicket {
            gate,
            ticket,
            served: false,
        }
    }

    /// Number of sessions with an active or waiting generation
    pub fn active(&self) -> usize {
        lock(&self.gates)
            .values()
            .filter(|gate| Arc::strong_count(gate) > 1)
            .count()
    }
}
