//! Per-key debounce.
//!
//! A single write on the platform can fan out into many change
//! notifications (one time-entry update touches several joined tables).
//! [`DebounceCoalescer`] merges every burst for a key into one callback,
//! fired after the key has been quiet for its window.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

type FireFn<K> = dyn Fn(K) + Send + Sync;

struct Armed {
    ticket: u64,
    timer: JoinHandle<()>,
}

struct TimerTable<K> {
    armed: HashMap<K, Armed>,
    next_ticket: u64,
}

/// One re-armable timer per key.
///
/// Each [`notify`](Self::notify) replaces the key's pending timer, so at
/// most one callback fires per quiet period. A timer claims its entry under
/// the table lock before firing, so once [`cancel`](Self::cancel) returns
/// the cancelled timer can no longer fire.
pub struct DebounceCoalescer<K> {
    table: Arc<Mutex<TimerTable<K>>>,
    on_fire: Arc<FireFn<K>>,
}

impl<K> DebounceCoalescer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(on_fire: impl Fn(K) + Send + Sync + 'static) -> Self {
        Self {
            table: Arc::new(Mutex::new(TimerTable {
                armed: HashMap::new(),
                next_ticket: 0,
            })),
            on_fire: Arc::new(on_fire),
        }
    }

    /// Arm or re-arm the timer for `key`.
    pub fn notify(&self, key: K, window: Duration) {
        let mut table = lock(&self.table);

        let ticket = table.next_ticket;
        table.next_ticket += 1;

        if let Some(previous) = table.armed.remove(&key) {
            previous.timer.abort();
        }

        let shared = Arc::clone(&self.table);
        let on_fire = Arc::clone(&self.on_fire);
        let fire_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;

            let claimed = {
                let mut table = lock(&shared);
                match table.armed.get(&fire_key) {
                    Some(armed) if armed.ticket == ticket => {
                        table.armed.remove(&fire_key);
                        true
                    }
                    _ => false,
                }
            };

            if claimed {
                on_fire(fire_key);
            }
        });

        table.armed.insert(key, Armed { ticket, timer });
    }

    /// Clear the armed timer for `key` without firing it.
    ///
    /// Returns whether a timer was armed.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.table).armed.remove(key) {
            Some(armed) => {
                armed.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Clear every armed timer.
    pub fn cancel_all(&self) {
        for (_, armed) in lock(&self.table).armed.drain() {
            armed.timer.abort();
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        lock(&self.table).armed.contains_key(key)
    }

    pub fn armed_count(&self) -> usize {
        lock(&self.table).armed.len()
    }
}

impl<K> Drop for DebounceCoalescer<K> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, armed) in table.armed.drain() {
            armed.timer.abort();
        }
    }
}

fn lock<K>(table: &Mutex<TimerTable<K>>) -> MutexGuard<'_, TimerTable<K>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}
