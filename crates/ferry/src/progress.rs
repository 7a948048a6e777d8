use std::sync::Arc;

/// Cumulative progress of one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes durably stored so far, resumed prefix included.
    pub loaded: u64,
    /// Size of the whole resource.
    pub total: u64,
}

impl Progress {
    pub fn new(loaded: u64, total: u64) -> Self {
        Self { loaded, total }
    }

    /// A finished download of `total` bytes.
    pub fn complete(total: u64) -> Self {
        Self::new(total, total)
    }

    pub fn is_complete(&self) -> bool {
        self.loaded >= self.total
    }

    /// Completed fraction in `0.0..=1.0`; an empty resource counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.loaded as f64 / self.total as f64).min(1.0)
        }
    }
}

/// A callback function for progress updates.
pub type ProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_is_clamped() {
        assert_eq!(Progress::new(5, 10).fraction(), 0.5);
        assert_eq!(Progress::new(0, 0).fraction(), 1.0);
        assert!(Progress::complete(0).is_complete());
        assert!(!Progress::new(9, 10).is_complete());
    }
}
