use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform ±`variance` px offset around a tap target.
/// Never returns the same point twice in a row.
pub struct TapJitter {
    variance: i32,
    last: Option<(i32, i32)>,
    rng: StdRng,
}

impl TapJitter {
    pub fn new(variance: i32) -> Self {
        Self::with_rng(variance, StdRng::from_entropy())
    }

    pub fn seeded(variance: i32, seed: u64) -> Self {
        Self::with_rng(variance, StdRng::seed_from_u64(seed))
    }

    fn with_rng(variance: i32, rng: StdRng) -> Self {
        Self {
            variance: variance.max(0),
            last: None,
            rng,
        }
    }

    pub fn set_variance(&mut self, variance: i32) {
        self.variance = variance.max(0);
    }

    pub fn variance(&self) -> i32 {
        self.variance
    }

    pub fn apply(&mut self, center: (i32, i32)) -> (i32, i32) {
        let v = self.variance;
        let mut point = center;
        for _ in 0..8 {
            point = (
                center.0 + self.rng.gen_range(-v..=v),
                center.1 + self.rng.gen_range(-v..=v),
            );
            if Some(point) != self.last {
                break;
            }
        }
        if Some(point) == self.last {
            // Zero variance, or very unlucky draws.
            point.0 += if point.0 > center.0 { -1 } else { 1 };
        }
        self.last = Some(point);
        point
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stays_within_variance() {
        let mut jitter = TapJitter::seeded(5, 42);
        for _ in 0..500 {
            let (x, y) = jitter.apply((100, 200));
            assert!((95..=105).contains(&x));
            assert!((195..=205).contains(&y));
        }
    }

    #[test]
    fn test_never_repeats_consecutively() {
        let mut jitter = TapJitter::seeded(1, 7);
        let mut prev = jitter.apply((50, 50));
        for _ in 0..500 {
            let next = jitter.apply((50, 50));
            assert_ne!(next, prev);
            prev = next;
        }
    }

    #[test]
    fn test_zero_variance_still_alternates() {
        let mut jitter = TapJitter::seeded(0, 7);
        let a = jitter.apply((10, 10));
        let b = jitter.apply((10, 10));
        let c = jitter.apply((10, 10));
        assert_eq!(a, (10, 10));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!((b.0 - 10).abs() <= 1);
    }
}
