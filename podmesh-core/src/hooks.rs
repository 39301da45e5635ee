//! Observer registration for membership events: zero or more subscribers invoked in
//! registration order with the same arguments.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A token identifying a previously registered callback, for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct Entry<Args> {
    id: HookId,
    callback: Box<dyn Fn(&Args) + Send + Sync>,
}

/// An ordered list of callbacks over `Args`, supporting add/remove/invoke. A callback
/// that panics aborts the remaining dispatch for that invocation — it does not
/// unregister the callback.
pub struct Hook<Args> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<Entry<Args>>>,
}

impl<Args> Default for Hook<Args> {
    fn default() -> Self {
        Self { next_id: AtomicU64::new(0), callbacks: Mutex::new(Vec::new()) }
    }
}

impl<Args> Hook<Args> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`, returning a `HookId` that can later be passed to
    /// `remove_callback`.
    pub fn add_callback<F>(&self, callback: F) -> HookId
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        let id = HookId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.callbacks.lock().push(Entry { id, callback: Box::new(callback) });
        id
    }

    /// Unregisters the callback identified by `id`. Returns `true` if a callback was
    /// removed, `false` if `id` was already removed or never registered.
    pub fn remove_callback(&self, id: HookId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|entry| entry.id != id);
        callbacks.len() != before
    }

    /// Invokes every registered callback, in registration order, with `args`.
    pub fn fire(&self, args: &Args) {
        for entry in self.callbacks.lock().iter() {
            (entry.callback)(args);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn callbacks_run_in_registration_order() {
        let hook: Hook<()> = Hook::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order1 = Arc::clone(&order);
        hook.add_callback(move |_| order1.lock().push(1));
        let order2 = Arc::clone(&order);
        hook.add_callback(move |_| order2.lock().push(2));

        hook.fire(&());
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn each_callback_invoked_once_per_fire() {
        let hook: Hook<u32> = Hook::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        hook.add_callback(move |n| {
            count_clone.fetch_add(*n, Ordering::SeqCst);
        });

        hook.fire(&3);
        hook.fire(&4);
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn no_callbacks_is_a_no_op() {
        let hook: Hook<()> = Hook::new();
        hook.fire(&());
    }

    #[test]
    fn removed_callback_is_not_invoked() {
        let hook: Hook<u32> = Hook::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        let id = hook.add_callback(move |n| {
            count_clone.fetch_add(*n, Ordering::SeqCst);
        });

        assert!(hook.remove_callback(id));
        hook.fire(&5);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn removing_unknown_id_is_a_no_op() {
        let hook: Hook<()> = Hook::new();
        let id = hook.add_callback(|_| {});
        hook.remove_callback(id);
        assert!(!hook.remove_callback(id));
    }
}
