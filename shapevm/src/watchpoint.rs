//! Write watchpoints on global variable bindings.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchpointState {
    /// Declared but never written.
    #[default]
    ClearWatchpoint,
    /// Written exactly once; readers may treat the value as constant.
    IsWatched,
    /// Written again. Constant-folded readers must recompute.
    IsInvalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchpointSet {
    state: WatchpointState,
    fire_count: u32,
}

impl WatchpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self) -> WatchpointState {
        self.state
    }

    /// True while the binding has held a single value.
    #[inline]
    pub fn is_still_valid(&self) -> bool {
        self.state != WatchpointState::IsInvalidated
    }

    pub fn fire_count(&self) -> u32 {
        self.fire_count
    }

    /// Record a store to the watched binding.
    pub fn notify_write(&mut self) {
        match self.state {
            WatchpointState::ClearWatchpoint => {
                self.state = WatchpointState::IsWatched;
            }
            WatchpointState::IsWatched => {
                self.state = WatchpointState::IsInvalidated;
                self.fire_count += 1;
                log::debug!("watchpoint fired");
            }
            WatchpointState::IsInvalidated => {}
        }
    }

    pub fn invalidate(&mut self) {
        if self.state != WatchpointState::IsInvalidated {
            self.state = WatchpointState::IsInvalidated;
            self.fire_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_write_invalidates() {
        let mut set = WatchpointSet::new();
        assert_eq!(set.state(), WatchpointState::ClearWatchpoint);
        set.notify_write();
        assert_eq!(set.state(), WatchpointState::IsWatched);
        assert!(set.is_still_valid());
        set.notify_write();
        assert!(!set.is_still_valid());
        set.notify_write();
        assert_eq!(set.fire_count(), 1);
    }
}
