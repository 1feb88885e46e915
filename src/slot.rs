use crate::detection::DetectionSet;
use parking_lot::Mutex;

/// Single-value handoff between the correlator task and the presentation loop.
///
/// Holds at most one `DetectionSet`. Every write replaces the previous value,
/// so a burst of responses keeps only the most recent one.
#[derive(Debug, Default)]
pub struct LatestResponseSlot {
    inner: Mutex<Option<DetectionSet>>,
}

impl LatestResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites any unread value. Returns true if one was dropped.
    pub fn put(&self, detections: DetectionSet) -> bool {
        self.inner.lock().replace(detections).is_some()
    }

    /// Reads and clears the slot in one critical section.
    pub fn take(&self) -> Option<DetectionSet> {
        self.inner.lock().take()
    }

    /// Reads without clearing.
    pub fn peek(&self) -> Option<DetectionSet> {
        self.inner.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use std::sync::Arc;

    fn set_of(label: &str) -> DetectionSet {
        vec![Detection {
            bounding_box: [0, 0, 1, 1].into(),
            class_name: label.to_string(),
            confidence: 0.9,
        }]
    }

    #[test]
    fn test_last_write_wins() {
        let slot = LatestResponseSlot::new();
        assert!(!slot.put(set_of("a")));
        assert!(slot.put(set_of("b")));
        assert!(slot.put(set_of("c")));

        assert_eq!(slot.take(), Some(set_of("c")));
        assert!(slot.is_empty());
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_peek_does_not_clear() {
        let slot = LatestResponseSlot::new();
        slot.put(Vec::new());

        assert_eq!(slot.peek(), Some(Vec::new()));
        assert_eq!(slot.peek(), Some(Vec::new()));
        assert!(!slot.is_empty());
    }

    #[test]
    fn test_concurrent_writers_leave_one_value() {
        let slot = Arc::new(LatestResponseSlot::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let slot = slot.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        slot.put(set_of(&format!("{}-{}", i, j)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let last = slot.take().unwrap();
        assert_eq!(last.len(), 1);
        assert!(last[0].class_name.ends_with("-99"));
        assert!(slot.take().is_none());
    }
}
