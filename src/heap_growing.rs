use crate::Config;

/// Decides when allocation should start a garbage collection.
///
/// Two limits are derived from the live size of the last cycle: reaching the
/// incremental limit starts an incremental cycle, reaching the atomic limit
/// forces the current cycle to finish (or runs a full atomic one).
pub struct HeapGrowing {
    initial_limit: usize,
    growth_factor: f64,
    incremental_start_ratio: f64,
    limit_for_atomic_gc: usize,
    limit_for_incremental_gc: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcTrigger {
    None,
    StartIncremental,
    Atomic,
}

impl HeapGrowing {
    pub fn new(config: &Config) -> Self {
        let mut this = Self {
            initial_limit: config.initial_heap_limit,
            growth_factor: config.heap_growth_factor.max(1.0),
            incremental_start_ratio: config.incremental_start_ratio.clamp(0.0, 1.0),
            limit_for_atomic_gc: 0,
            limit_for_incremental_gc: 0,
        };
        this.configure_limits(0);
        this
    }

    /// Recomputes the limits once the live size after a cycle is known.
    pub fn configure_limits(&mut self, live_bytes: usize) {
        let grown = (live_bytes as f64 * self.growth_factor).ceil() as usize;
        self.limit_for_atomic_gc = grown.max(self.initial_limit);
        self.limit_for_incremental_gc =
            (self.limit_for_atomic_gc as f64 * self.incremental_start_ratio) as usize;
        log::trace!(
            "heap limits: incremental at {} bytes, atomic at {} bytes",
            self.limit_for_incremental_gc,
            self.limit_for_atomic_gc
        );
    }

    pub fn check(&self, allocated_object_size: usize, supports_incremental: bool) -> GcTrigger {
        if allocated_object_size >= self.limit_for_atomic_gc {
            GcTrigger::Atomic
        } else if supports_incremental && allocated_object_size >= self.limit_for_incremental_gc {
            GcTrigger::StartIncremental
        } else {
            GcTrigger::None
        }
    }

    pub fn limit_for_atomic_gc(&self) -> usize {
        self.limit_for_atomic_gc
    }

    pub fn limit_for_incremental_gc(&self) -> usize {
        self.limit_for_incremental_gc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            initial_heap_limit: 1000,
            heap_growth_factor: 2.0,
            incremental_start_ratio: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_limits() {
        let growing = HeapGrowing::new(&config());
        assert_eq!(growing.limit_for_atomic_gc(), 1000);
        assert_eq!(growing.limit_for_incremental_gc(), 500);
        assert_eq!(growing.check(100, true), GcTrigger::None);
        assert_eq!(growing.check(600, true), GcTrigger::StartIncremental);
        assert_eq!(growing.check(600, false), GcTrigger::None);
        assert_eq!(growing.check(1000, true), GcTrigger::Atomic);
    }

    #[test]
    fn test_limits_grow_with_live_size() {
        let mut growing = HeapGrowing::new(&config());
        growing.configure_limits(4000);
        assert_eq!(growing.limit_for_atomic_gc(), 8000);
        assert_eq!(growing.limit_for_incremental_gc(), 4000);
        growing.configure_limits(10);
        assert_eq!(growing.limit_for_atomic_gc(), 1000);
    }
}
