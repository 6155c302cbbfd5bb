use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Device paths reported as removed and not yet seen again.
#[derive(Clone, Default)]
pub struct DisconnectedDevices {
    paths: Arc<Mutex<HashSet<String>>>,
}

impl DisconnectedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_left(&self, path: &str) {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string());
    }

    pub fn mark_arrived(&self, path: &str) {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_then_arrived() {
        let set = DisconnectedDevices::new();
        let shared = set.clone();
        shared.mark_left("/dev/video0");
        assert!(set.contains("/dev/video0"));
        assert!(!set.contains("/dev/video1"));
        shared.mark_arrived("/dev/video0");
        assert!(!set.contains("/dev/video0"));
    }
}
