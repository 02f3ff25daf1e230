use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;

/// One detector box in encoder frame space (top-left origin).
///
/// `x2 >= x1` and `y2 >= y1` are not guaranteed by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub class: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn label(&self) -> String {
        format!("{} {:.2}", self.class, self.confidence)
    }
}

/// Immutable set of boxes produced by a single inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionSet {
    boxes: Arc<[BoundingBox]>,
}

impl DetectionSet {
    pub fn new(boxes: Vec<BoundingBox>) -> Self {
        Self {
            boxes: boxes.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn boxes(&self) -> &[BoundingBox] {
        &self.boxes
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// The current detection set, shared between the receive path and the
/// renderer.
///
/// `replace` swaps the whole set in one assignment; readers only ever see a
/// complete set, never a partially updated one.
#[derive(Debug, Clone)]
pub struct DetectionState {
    inner: Arc<StateInner>,
}

#[derive(Debug)]
struct StateInner {
    current: Mutex<DetectionSet>,
    generation: AtomicU64,
}

impl DetectionState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StateInner {
                current: Mutex::new(DetectionSet::empty()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn replace(&self, set: DetectionSet) {
        *self.inner.current.lock() = set;
        self.inner.generation.fetch_add(1, Ordering::Release);
    }

    pub fn snapshot(&self) -> DetectionSet {
        self.inner.current.lock().clone()
    }

    /// Number of replacements applied so far.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }
}

impl Default for DetectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(class: &str, x1: f32) -> BoundingBox {
        BoundingBox {
            class: class.to_string(),
            confidence: 0.9,
            x1,
            y1: 0.0,
            x2: x1 + 10.0,
            y2: 10.0,
        }
    }

    #[test]
    fn label_uses_two_decimals() {
        let b = BoundingBox {
            confidence: 0.856,
            ..bbox("person", 0.0)
        };
        assert_eq!(b.label(), "person 0.86");
    }

    #[test]
    fn replace_discards_previous_set() {
        let state = DetectionState::new();
        state.replace(DetectionSet::new(vec![bbox("car", 1.0), bbox("bus", 2.0)]));
        assert_eq!(state.snapshot().len(), 2);

        state.replace(DetectionSet::empty());
        assert!(state.snapshot().is_empty());
        assert_eq!(state.generation(), 2);
    }

    #[test]
    fn snapshots_are_all_or_nothing_under_concurrent_replace() {
        let state = DetectionState::new();
        let writer = {
            let state = state.clone();
            std::thread::spawn(move || {
                for i in 0..2_000u32 {
                    let n = (i % 7) as usize + 1;
                    let boxes = (0..n).map(|_| bbox(&format!("c{n}"), n as f32)).collect();
                    state.replace(DetectionSet::new(boxes));
                }
            })
        };

        for _ in 0..2_000 {
            let snap = state.snapshot();
            if let Some(first) = snap.boxes().first() {
                let n = snap.len();
                assert_eq!(first.class, format!("c{n}"));
                assert!(snap.boxes().iter().all(|b| b == first));
            }
        }
        writer.join().unwrap();
    }
}
