use serde::{Deserialize, Serialize};

/// Client side logical clock. It only ever moves forward: after every
/// completed round trip it jumps past whatever the server reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalClock(u64);

impl LogicalClock {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Advance to `max(local, server) + 1`.
    pub fn observe(&mut self, server_clock: u64) {
        self.0 = self.0.max(server_clock).saturating_add(1);
    }
}

/// Reconciles speculative local edits with the server.
///
/// Local state is never edited in place. A mutation produces a proposed
/// state, the proposal travels to the server together with the current clock,
/// and whatever the server answers replaces the local state wholesale. Conflict
/// resolution between clients is entirely up to the server.
#[derive(Debug, Clone, Default)]
pub struct SyncEngine {
    clock: LogicalClock,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self {
            clock: LogicalClock::default(),
        }
    }

    pub fn with_clock(clock: LogicalClock) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> LogicalClock {
        self.clock
    }

    /// Install a server response: adopt its state and move the clock past it.
    pub fn apply<T>(&mut self, current: &mut T, server_state: T, server_clock: u64) {
        if server_clock < self.clock.value() {
            log::debug!(
                "Server clock {} is behind local clock {}, adopting server state anyway",
                server_clock,
                self.clock.value()
            );
        }
        *current = server_state;
        self.clock.observe(server_clock);
    }

    /// One full round trip. `exchange` performs the transport call given the
    /// proposal and the client clock, and returns the server's state and clock.
    /// On error neither `current` nor the clock change.
    pub fn sync<T, E>(
        &mut self,
        current: &mut T,
        proposed: T,
        exchange: impl FnOnce(T, u64) -> Result<(T, u64), E>,
    ) -> Result<(), E> {
        self.sync_at(self.clock, current, proposed, exchange)
    }

    /// [`Self::sync`] with the proposal stamped `clock` rather than the current
    /// clock, for sending several proposals from the same point in time.
    pub fn sync_at<T, E>(
        &mut self,
        clock: LogicalClock,
        current: &mut T,
        proposed: T,
        exchange: impl FnOnce(T, u64) -> Result<(T, u64), E>,
    ) -> Result<(), E> {
        let (server_state, server_clock) = exchange(proposed, clock.value())?;
        self.apply(current, server_state, server_clock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_jumps_past_server() {
        let mut clock = LogicalClock::new(3);
        clock.observe(10);
        assert_eq!(clock.value(), 11);
        clock.observe(2);
        assert_eq!(clock.value(), 12);
    }

    #[test]
    fn test_sync_replaces_state_with_server_answer() {
        let mut engine = SyncEngine::new();
        let mut state = vec![1];
        engine
            .sync(&mut state, vec![1, 2], |proposed, clock| {
                assert_eq!(clock, 0);
                assert_eq!(proposed, vec![1, 2]);
                Ok::<_, ()>((vec![7], 4))
            })
            .unwrap();
        assert_eq!(state, vec![7]);
        assert_eq!(engine.clock().value(), 5);
    }

    #[test]
    fn test_failed_exchange_leaves_state_and_clock() {
        let mut engine = SyncEngine::with_clock(LogicalClock::new(2));
        let mut state = vec![1];
        let result = engine.sync(&mut state, vec![], |_, _| Err::<(Vec<i32>, u64), _>("offline"));
        assert_eq!(result, Err("offline"));
        assert_eq!(state, vec![1]);
        assert_eq!(engine.clock().value(), 2);
    }

    #[test]
    fn test_clock_is_monotonic_over_any_server_sequence() {
        let mut engine = SyncEngine::new();
        let mut state = 0u8;
        for server_clock in [5u64, 0, 3, 9, 9, 1, 20, 2] {
            let before = engine.clock().value();
            engine
                .sync(&mut state, 0, |s, _| Ok::<_, ()>((s, server_clock)))
                .unwrap();
            assert!(engine.clock().value() >= before.max(server_clock));
            assert!(engine.clock().value() > before);
        }
    }
}
