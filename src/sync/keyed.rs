//! Deferred blocks indexed by key.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

type Block = Box<dyn FnOnce() + Send>;

struct State<K> {
    order: VecDeque<K>,
    blocks: HashMap<K, Block>,
    suspend_count: usize,
    disposed: bool,
}

/// Runs blocks immediately, or while suspended keeps the latest block per key
/// and runs them in first-insertion order on resume.
///
/// Useful to coalesce repeated updates: while suspended, performing a block
/// for a key that already has one replaces it but keeps the key's position.
///
/// # Example
/// ```ignore
/// let pending = KeyedBlockQueue::new();
/// pending.suspend();
/// pending.perform("title", || println!("first"));
/// pending.perform("title", || println!("second"));
/// pending.resume(); // prints "second" only
/// ```
pub struct KeyedBlockQueue<K> {
    state: Mutex<State<K>>,
}

impl<K> Default for KeyedBlockQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedBlockQueue<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                blocks: HashMap::new(),
                suspend_count: 0,
                disposed: false,
            }),
        }
    }

    /// Runs `block` now, or stores it under `key` while suspended.
    ///
    /// Blocks performed after [`dispose`](Self::dispose) are dropped.
    pub fn perform<F>(&self, key: K, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            if state.suspend_count > 0 {
                if state.blocks.insert(key.clone(), Box::new(block)).is_none() {
                    state.order.push_back(key);
                }
                return;
            }
        }
        block();
    }

    pub fn suspend(&self) {
        self.state.lock().suspend_count += 1;
    }

    /// Balances one [`suspend`](Self::suspend); the last resume runs every
    /// stored block.
    pub fn resume(&self) {
        let resumed = {
            let mut state = self.state.lock();
            dispatch_assert!(state.suspend_count > 0, "keyed block queue resumed without matching suspend");
            state.suspend_count = state.suspend_count.saturating_sub(1);
            state.suspend_count == 0
        };
        if resumed {
            self.perform_pending();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspend_count > 0
    }

    /// Runs every stored block in first-insertion order, suspended or not.
    pub fn perform_pending(&self) {
        loop {
            // One block at a time, outside the lock, so blocks may perform
            // or suspend re-entrantly.
            let next = {
                let mut state = self.state.lock();
                let mut next = None;
                while let Some(key) = state.order.pop_front() {
                    if let Some(block) = state.blocks.remove(&key) {
                        next = Some(block);
                        break;
                    }
                }
                next
            };
            match next {
                Some(block) => block(),
                None => break,
            }
        }
    }

    /// Runs and removes the block stored under `key`, if any.
    pub fn perform_pending_for(&self, key: &K) -> bool {
        let block = {
            let mut state = self.state.lock();
            let block = state.blocks.remove(key);
            if block.is_some() {
                state.order.retain(|queued| queued != key);
            }
            block
        };
        match block {
            Some(block) => {
                block();
                true
            }
            None => false,
        }
    }

    /// Number of stored blocks.
    pub fn pending(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Drops every stored block and ignores later performs.
    pub fn dispose(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.order.clear();
            std::mem::take(&mut state.blocks)
        };
        drop(dropped);
    }
}
