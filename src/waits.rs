//! Cross-thread wait tracking for single-flight gates
//!
//! Records which thread leads each in-flight gate and which gate each
//! blocked thread is waiting on. Before a thread blocks, the chain of
//! leaders it would end up behind is walked. Reaching the thread itself
//! means the wait could never finish, so the request fails as a cycle
//! instead.

use crate::provider::Binding;
use crate::storage::Gate;
use ahash::RandomState;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// Gates are identified by address while they are alive
type GateKey = usize;

#[derive(Default)]
struct WaitGraph {
    leaders: HashMap<GateKey, ThreadId, RandomState>,
    waiting: HashMap<ThreadId, (GateKey, Binding), RandomState>,
}

impl WaitGraph {
    /// Bindings waited on along the leader chain behind `gate`, if the
    /// chain comes back to `me`.
    fn cycle_to(&self, me: ThreadId, mut gate: GateKey) -> Option<Vec<Binding>> {
        let mut hops = Vec::new();
        // Bounded: a loop among other threads is theirs to report
        for _ in 0..=self.waiting.len() {
            let leader = *self.leaders.get(&gate)?;
            if leader == me {
                return Some(hops);
            }
            let (next, binding) = self.waiting.get(&leader)?;
            hops.push(binding.clone());
            gate = *next;
        }
        None
    }
}

static GRAPH: Lazy<Mutex<WaitGraph>> = Lazy::new(|| Mutex::new(WaitGraph::default()));

fn graph() -> MutexGuard<'static, WaitGraph> {
    GRAPH.lock().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
fn key_of(gate: &Gate) -> GateKey {
    Arc::as_ptr(gate) as GateKey
}

/// Registration of the current thread as waiting on a gate.
///
/// Removed on drop, including during unwinding.
pub(crate) struct Waiting {
    thread: ThreadId,
    gate: GateKey,
}

impl Waiting {
    /// Record that this thread is about to block on `gate`.
    ///
    /// Fails with the bindings the other threads are waiting on when that
    /// would close a loop back to this thread.
    pub fn start(gate: &Gate, binding: &Binding) -> Result<Self, Vec<Binding>> {
        let thread = thread::current().id();
        let gate = key_of(gate);

        let mut graph = graph();
        if let Some(hops) = graph.cycle_to(thread, gate) {
            return Err(hops);
        }
        graph.waiting.insert(thread, (gate, binding.clone()));
        Ok(Self { thread, gate })
    }

    /// This thread won the gate and runs the construction itself.
    pub fn lead(&self) -> Leading {
        let mut graph = graph();
        graph.waiting.remove(&self.thread);
        graph.leaders.insert(self.gate, self.thread);
        Leading { gate: self.gate }
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        let mut graph = graph();
        if graph
            .waiting
            .get(&self.thread)
            .is_some_and(|(gate, _)| *gate == self.gate)
        {
            graph.waiting.remove(&self.thread);
        }
    }
}

/// Leadership of a gate, released on drop
pub(crate) struct Leading {
    gate: GateKey,
}

impl Drop for Leading {
    fn drop(&mut self) {
        graph().leaders.remove(&self.gate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::OnceCell;

    struct Alpha;
    struct Beta;

    fn new_gate() -> Gate {
        Arc::new(OnceCell::new())
    }

    #[test]
    fn test_waiting_on_own_gate_is_a_cycle() {
        let gate = new_gate();
        let binding = Binding::default_of::<Alpha>();

        let waiting = Waiting::start(&gate, &binding).unwrap();
        let _leading = waiting.lead();

        let hops = Waiting::start(&gate, &binding).err().unwrap();
        assert!(hops.is_empty());
    }

    #[test]
    fn test_released_gate_can_be_waited_on() {
        let gate = new_gate();
        let binding = Binding::default_of::<Alpha>();

        {
            let waiting = Waiting::start(&gate, &binding).unwrap();
            let _leading = waiting.lead();
        }

        assert!(Waiting::start(&gate, &binding).is_ok());
    }

    #[test]
    fn test_loop_through_other_thread_detected() {
        let alpha_gate = new_gate();
        let beta_gate = new_gate();
        let alpha = Binding::default_of::<Alpha>();
        let beta = Binding::default_of::<Beta>();

        // this thread leads alpha
        let waiting = Waiting::start(&alpha_gate, &alpha).unwrap();
        let _leading = waiting.lead();

        let (led, blocked) = (std::sync::Barrier::new(2), std::sync::Barrier::new(2));
        thread::scope(|s| {
            s.spawn(|| {
                // the other thread leads beta and waits on alpha
                let waiting = Waiting::start(&beta_gate, &beta).unwrap();
                let _leading = waiting.lead();
                led.wait();
                let _blocked = Waiting::start(&alpha_gate, &alpha).unwrap();
                blocked.wait();
                // hold both registrations until the main thread has checked
                blocked.wait();
            });

            led.wait();
            blocked.wait();
            let hops = Waiting::start(&beta_gate, &beta).err().unwrap();
            assert_eq!(hops, [alpha.clone()]);
            blocked.wait();
        });
    }
}
