/// Fee escalation for outbound resends
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeePolicy {
    /// Percentage added to the base fee per attempt
    pub bump_percent: u64,
    /// Ceiling as a multiple of the base fee
    pub max_multiplier: f64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            bump_percent: 20,
            max_multiplier: 3.0,
        }
    }
}

impl FeePolicy {
    pub fn new(bump_percent: u64, max_multiplier: f64) -> Self {
        Self {
            bump_percent,
            max_multiplier: max_multiplier.max(1.0),
        }
    }

    /// Fee rate for the given attempt: linear bump, capped at `max_multiplier`
    pub fn fee_for_attempt(&self, base: u128, attempt: u32) -> u128 {
        if attempt == 0 {
            return base;
        }

        let percent = 100u128 + u128::from(self.bump_percent) * u128::from(attempt);
        let bumped = base.saturating_mul(percent) / 100;
        let cap = (base as f64 * self.max_multiplier) as u128;

        bumped.min(cap).max(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_bump() {
        let policy = FeePolicy::default();
        let base = 1_000_000_000u128;

        assert_eq!(policy.fee_for_attempt(base, 0), base);
        assert_eq!(policy.fee_for_attempt(base, 1), 1_200_000_000);
        assert_eq!(policy.fee_for_attempt(base, 2), 1_400_000_000);
        assert_eq!(policy.fee_for_attempt(base, 10), 3_000_000_000);
    }

    #[test]
    fn test_multiplier_floor() {
        let policy = FeePolicy::new(50, 0.5);
        assert_eq!(policy.fee_for_attempt(100, 3), 100);
    }
}
