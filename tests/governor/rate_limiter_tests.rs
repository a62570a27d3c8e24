// tests/governor/rate_limiter_tests.rs

#[cfg(test)]
mod tests {

    use crate::fixtures::test_clock::TestClock;
    use request_governor::{RateLimiter, RateLimiterConfig};
    use std::sync::Arc;

    // Token bucket algorithm tests
    #[test]
    fn first_request_always_allowed() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(1, 1.0);
        let limiter = RateLimiter::with_config(config, clock).unwrap();
        let decision = limiter.check_request("client1").unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.limit, 1);
    }

    #[test]
    fn burst_then_deny_then_refill() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(5, 1.0); // 5 tokens, 1 token/sec
        let limiter = RateLimiter::with_config(config, clock.clone()).unwrap();
        let client = "client1";

        // 5 immediate requests drain the bucket
        for _ in 0..5 {
            assert!(limiter.check_request(client).unwrap().allowed);
        }

        // 6th request in the same instant is denied
        assert!(!limiter.check_request(client).unwrap().allowed);

        // After 1 second exactly one more request is admitted
        clock.advance(1.0);
        assert!(limiter.check_request(client).unwrap().allowed);
        assert!(!limiter.check_request(client).unwrap().allowed);
    }

    #[test]
    fn remaining_counts_down_to_zero() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(3, 1.0);
        let limiter = RateLimiter::with_config(config, clock).unwrap();
        let client = "client1";

        let remaining: Vec<u64> = (0..4)
            .map(|_| limiter.check_request(client).unwrap().remaining)
            .collect();
        assert_eq!(remaining, vec![2, 1, 0, 0]);
    }

    #[test]
    fn refill_grants_elapsed_times_rate() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(10, 2.0); // 2 tokens/sec
        let limiter = RateLimiter::with_config(config, clock.clone()).unwrap();
        let client = "client1";

        for _ in 0..10 {
            assert!(limiter.check_request(client).unwrap().allowed);
        }
        assert!(!limiter.check_request(client).unwrap().allowed);

        // 1.5 seconds at 2 tokens/sec = 3 tokens
        clock.advance(1.5);
        for _ in 0..3 {
            assert!(limiter.check_request(client).unwrap().allowed);
        }
        assert!(!limiter.check_request(client).unwrap().allowed);
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(3, 1.0);
        let limiter = RateLimiter::with_config(config, clock.clone()).unwrap();
        let client = "client1";

        for _ in 0..3 {
            assert!(limiter.check_request(client).unwrap().allowed);
        }

        // A long idle period only refills up to capacity
        clock.advance(100.0);
        for _ in 0..3 {
            assert!(limiter.check_request(client).unwrap().allowed);
        }
        assert!(!limiter.check_request(client).unwrap().allowed);
    }

    #[test]
    fn fractional_refill_accumulates() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(1, 2.0); // one token every 0.5s
        let limiter = RateLimiter::with_config(config, clock.clone()).unwrap();
        let client = "client1";

        assert!(limiter.check_request(client).unwrap().allowed);

        // Half a token is not enough
        clock.advance(0.25);
        assert!(!limiter.check_request(client).unwrap().allowed);

        // The half token earned earlier is kept
        clock.advance(0.25);
        assert!(limiter.check_request(client).unwrap().allowed);
    }

    #[test]
    fn multiple_clients_independent() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(1, 1.0);
        let limiter = RateLimiter::with_config(config, clock.clone()).unwrap();

        // Both clients' first requests should be allowed
        assert!(limiter.check_request("client1").unwrap().allowed);
        assert!(limiter.check_request("client2").unwrap().allowed);

        // Both clients' immediate second requests should be blocked
        assert!(!limiter.check_request("client1").unwrap().allowed);
        assert!(!limiter.check_request("client2").unwrap().allowed);

        // Client3 (new client) should be allowed even though others are blocked
        assert!(limiter.check_request("client3").unwrap().allowed);
        assert_eq!(limiter.tracked_clients(), 3);
    }

    #[test]
    fn retry_after_reports_time_to_next_token() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(1, 2.0); // one token every 0.5s
        let limiter = RateLimiter::with_config(config, clock.clone()).unwrap();
        let client = "client1";

        let allowed = limiter.check_request(client).unwrap();
        assert!(allowed.retry_after_seconds.is_none());

        let denied = limiter.check_request(client).unwrap();
        assert!(!denied.allowed);
        let retry_after = denied.retry_after_seconds.unwrap();
        assert!((retry_after - 0.5).abs() < 1e-9);
    }

    #[test]
    fn bucket_bound_evicts_least_recently_refilled() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(1, 1.0).max_buckets(2);
        let limiter = RateLimiter::with_config(config, clock.clone()).unwrap();

        assert!(limiter.check_request("a").unwrap().allowed);
        assert!(!limiter.check_request("a").unwrap().allowed);

        clock.set_time(0.1);
        assert!(limiter.check_request("b").unwrap().allowed);

        // "a" was refilled longest ago and makes room for "c"
        clock.set_time(0.2);
        assert!(limiter.check_request("c").unwrap().allowed);
        assert_eq!(limiter.tracked_clients(), 2);

        // Without eviction "a" would hold 0.3 tokens and be denied
        clock.set_time(0.3);
        assert!(limiter.check_request("a").unwrap().allowed);
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn reset_restores_full_bucket() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(1, 1.0);
        let limiter = RateLimiter::with_config(config, clock).unwrap();

        assert!(limiter.check_request("client1").unwrap().allowed);
        assert!(!limiter.check_request("client1").unwrap().allowed);

        assert!(limiter.reset(&"client1"));
        assert!(!limiter.reset(&"client1"));
        assert!(limiter.check_request("client1").unwrap().allowed);
    }

    #[test]
    fn concurrent_admits_never_exceed_capacity() {
        let clock = TestClock::new(0.0);
        let config = RateLimiterConfig::new(100, 1.0);
        let limiter = Arc::new(RateLimiter::with_config(config, clock).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.admit("shared".to_string()).allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
