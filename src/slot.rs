use std::sync::Arc;

use parking_lot::Mutex;

/// Single-slot "latest value" cell.
///
/// Writers overwrite whatever is stored, readers get the most recent value.
/// Nothing is ever queued behind the current value.
#[derive(Debug)]
pub struct Latest<T> {
    inner: Mutex<SlotState<T>>,
}

#[derive(Debug)]
struct SlotState<T> {
    value: Option<Arc<T>>,
    version: u64,
}

impl<T> Latest<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState {
                value: None,
                version: 0,
            }),
        }
    }

    /// Replaces the stored value. Returns `true` when the slot still held a
    /// value, i.e. nothing has `take`n it since the previous publish.
    /// `snapshot` does not empty the slot.
    pub fn publish(&self, value: T) -> bool {
        let value = Arc::new(value);
        let mut guard = self.inner.lock();
        guard.version += 1;
        guard.value.replace(value).is_some()
    }

    pub fn snapshot(&self) -> Option<Arc<T>> {
        self.inner.lock().value.clone()
    }

    /// Removes and returns the stored value, leaving the slot empty.
    pub fn take(&self) -> Option<Arc<T>> {
        self.inner.lock().value.take()
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn clear(&self) {
        self.inner.lock().value = None;
    }
}

impl<T> Default for Latest<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_overwrites_unread_value() {
        let slot = Latest::new();
        assert!(!slot.publish(1));
        assert!(slot.publish(2));
        assert_eq!(slot.snapshot().as_deref(), Some(&2));
        assert_eq!(slot.version(), 2);
    }

    #[test]
    fn take_empties_the_slot() {
        let slot = Latest::new();
        slot.publish("frame");
        assert_eq!(slot.take().as_deref(), Some(&"frame"));
        assert!(slot.take().is_none());
        assert!(!slot.publish("next"));
    }

    #[test]
    fn snapshot_does_not_count_as_taken() {
        let slot = Latest::new();
        slot.publish(1);
        assert!(slot.snapshot().is_some());
        assert!(slot.publish(2));
        slot.take();
        assert!(!slot.publish(3));
    }

    #[test]
    fn snapshot_outlives_replacement() {
        let slot = Latest::new();
        slot.publish(vec![1, 2, 3]);
        let held = slot.snapshot().unwrap();
        slot.publish(vec![9]);
        assert_eq!(*held, vec![1, 2, 3]);
        assert_eq!(*slot.snapshot().unwrap(), vec![9]);
    }
}
