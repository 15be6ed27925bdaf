/// Lamport logical clock.
///
/// Process-local and never decreasing. Ticked before every outbound stamp,
/// advanced on every inbound stamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogicalClock(u64);

impl LogicalClock {
    /// Clock at zero.
    pub fn new() -> Self {
        LogicalClock(0)
    }

    /// Current value.
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Pre-increment for an outbound send. Returns the value to stamp.
    #[inline]
    pub fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    /// Receive rule: jump past a larger observed stamp, otherwise step by one.
    #[inline]
    pub fn advance(&mut self, observed: u64) -> u64 {
        if observed > self.0 {
            self.0 = observed + 1;
        } else {
            self.0 += 1;
        }
        self.0
    }
}
