//! Extending 32-bit wire sequence numbers to 64 bits
//!
//! Each new value is placed at the 64-bit position closest to the highest one
//! seen so far, so ordering survives the wrap from `u32::MAX` to 0 and
//! moderate reordering across it.

/// Unwrapped values start here so late packets from before the first one
/// seen still map to smaller numbers without underflow.
const ORIGIN: u64 = 1 << 32;

#[derive(Debug, Clone, Default)]
pub struct SequenceUnwrapper {
    highest: Option<u64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap(&mut self, sequence: u32) -> u64 {
        let value = match self.highest {
            None => ORIGIN + sequence as u64,
            Some(highest) => {
                let delta = sequence.wrapping_sub(highest as u32) as i32 as i64;
                (highest as i64 + delta).max(0) as u64
            }
        };
        if self.highest.map_or(true, |h| value > h) {
            self.highest = Some(value);
        }
        value
    }

    /// Forget history; the next value is anchored afresh
    pub fn reset(&mut self) {
        self.highest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order() {
        let mut u = SequenceUnwrapper::new();
        let a = u.unwrap(10);
        let b = u.unwrap(11);
        let c = u.unwrap(12);
        assert_eq!(b, a + 1);
        assert_eq!(c, a + 2);
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let mut u = SequenceUnwrapper::new();
        let a = u.unwrap(u32::MAX - 1);
        let b = u.unwrap(u32::MAX);
        let c = u.unwrap(0);
        let d = u.unwrap(1);
        assert_eq!([b - a, c - b, d - c], [1, 1, 1]);
    }

    #[test]
    fn test_reordered_across_wrap() {
        let mut u = SequenceUnwrapper::new();
        let high = u.unwrap(u32::MAX);
        let after = u.unwrap(1);
        let late = u.unwrap(0);
        assert!(high < late && late < after);
    }

    #[test]
    fn test_reset() {
        let mut u = SequenceUnwrapper::new();
        let first = u.unwrap(5000);
        u.reset();
        let restarted = u.unwrap(0);
        assert_eq!(first - restarted, 5000);
    }
}
