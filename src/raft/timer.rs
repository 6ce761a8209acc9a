use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Produces randomized election deadlines.
///
/// Each reset draws a fresh timeout so that replicas which timed out
/// together drift apart and a split vote does not repeat forever.
#[derive(Debug, Clone, Copy)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_deadline_from(Instant::now())
    }

    pub fn next_deadline_from(&self, now: Instant) -> Instant {
        now + random_election_timeout(self.min_ms, self.max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_within_range() {
        for _ in 0..200 {
            let t = random_election_timeout(150, 300);
            assert!(t >= Duration::from_millis(150));
            assert!(t <= Duration::from_millis(300));
        }
    }

    #[test]
    fn fixed_range_is_exact() {
        assert_eq!(random_election_timeout(75, 75), Duration::from_millis(75));
    }

    #[tokio::test]
    async fn deadline_is_in_the_future() {
        let timer = ElectionTimer::new(50, 100);
        let now = Instant::now();
        let deadline = timer.next_deadline_from(now);
        assert!(deadline >= now + Duration::from_millis(50));
        assert!(deadline <= now + Duration::from_millis(100));
    }
}
