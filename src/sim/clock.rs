//! Simulated wall clock in nanoseconds.
//!
//! Time moves only when the event loop jumps to the next event, so every run
//! of a scenario observes the same timestamps.

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimClock {
    now_ns: u64,
}

impl SimClock {
    pub fn new() -> Self {
        Self { now_ns: 0 }
    }

    #[inline(always)]
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// Jumps to an absolute time. Time never moves backwards.
    #[inline(always)]
    pub fn advance_to(&mut self, t_ns: u64) {
        debug_assert!(t_ns >= self.now_ns, "sim clock moved backwards");
        self.now_ns = self.now_ns.max(t_ns);
    }

    /// Absolute time `dt_ns` from now, saturating.
    #[inline(always)]
    pub fn after(&self, dt_ns: u64) -> u64 {
        self.now_ns.saturating_add(dt_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_and_saturates() {
        let mut clock = SimClock::new();
        clock.advance_to(10);
        assert_eq!(clock.now_ns(), 10);
        assert_eq!(clock.after(5), 15);
        assert_eq!(clock.after(u64::MAX), u64::MAX);
    }
}
