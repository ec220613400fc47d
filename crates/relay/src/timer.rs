// Keyed, cancellable timers that report back through a message sink.
//
// Every arm gets a fresh generation. Re-arming a key aborts the previous
// task, and a firing that was already queued when its timer got replaced
// carries a stale generation the owner can detect with `is_current`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Delivers a fired timer's message. Returns false once the receiver is gone.
pub type TimerSink<M> = Arc<dyn Fn(M) -> bool + Send + Sync>;

struct ArmedTimer {
    generation: u64,
    task: JoinHandle<()>,
}

/// Dropping the registry aborts every armed timer.
pub struct TimerRegistry<K, M> {
    armed: HashMap<K, ArmedTimer>,
    next_generation: u64,
    sink: TimerSink<M>,
}

impl<K, M> TimerRegistry<K, M>
where
    K: Eq + Hash + Clone,
    M: Clone + Send + 'static,
{
    pub fn new(sink: TimerSink<M>) -> Self {
        Self { armed: HashMap::new(), next_generation: 0, sink }
    }

    /// Fires `message` once after `delay`. Returns the generation it carries.
    pub fn arm_once(&mut self, key: K, delay: Duration, message: impl FnOnce(u64) -> M) -> u64 {
        let generation = self.allocate();
        let message = message(generation);
        let sink = Arc::clone(&self.sink);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink(message);
        });
        self.install(key, generation, task);
        generation
    }

    /// Fires `message` every `period`, first after one full period.
    pub fn arm_repeating(
        &mut self,
        key: K,
        period: Duration,
        message: impl FnOnce(u64) -> M,
    ) -> u64 {
        let generation = self.allocate();
        let message = message(generation);
        let sink = Arc::clone(&self.sink);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !sink(message.clone()) {
                    break;
                }
            }
        });
        self.install(key, generation, task);
        generation
    }

    /// Aborts the timer for `key`. Returns whether one was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.armed.remove(key) {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_current(&self, key: &K, generation: u64) -> bool {
        self.armed.get(key).is_some_and(|timer| timer.generation == generation)
    }

    /// Forgets a one-shot timer that has fired. Stale generations are ignored.
    pub fn complete(&mut self, key: &K, generation: u64) {
        if self.is_current(key, generation) {
            self.armed.remove(key);
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    fn allocate(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn install(&mut self, key: K, generation: u64, task: JoinHandle<()>) {
        if let Some(previous) = self.armed.insert(key, ArmedTimer { generation, task }) {
            previous.task.abort();
        }
    }
}

impl<K, M> Drop for TimerRegistry<K, M> {
    fn drop(&mut self) {
        for timer in self.armed.values() {
            timer.task.abort();
        }
    }
}
