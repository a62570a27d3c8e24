// tests/governor/cache_tests.rs

#[cfg(test)]
mod tests {

    use crate::fixtures::test_clock::TestClock;
    use request_governor::{CacheConfig, ResponseCache};
    use regex::Regex;
    use std::sync::Arc;
    use std::time::Duration;

    fn cache_with(max_entries: usize, clock: &TestClock) -> ResponseCache<String, TestClock> {
        let config = CacheConfig::new(max_entries, Duration::from_secs(60));
        ResponseCache::with_config(config, clock.clone()).unwrap()
    }

    fn value(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn entry_is_fresh_before_ttl_and_stale_after() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(10, &clock);

        cache.set("k", value("v"), Duration::from_millis(100));

        clock.advance(0.05);
        assert_eq!(cache.get("k"), Some(value("v")));

        clock.advance(0.1);
        assert_eq!(cache.get("k"), None);

        // The stale entry was removed by the lookup
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn entry_is_stale_exactly_at_ttl() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(10, &clock);

        cache.set("k", value("v"), Duration::from_millis(100));
        clock.advance(0.1);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn full_cache_evicts_oldest_insert() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(2, &clock);

        cache.set_default("a", value("1"));
        cache.set_default("b", value("2"));
        cache.set_default("c", value("3"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(value("2")));
        assert_eq!(cache.get("c"), Some(value("3")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn overwrite_refreshes_insertion_time() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(2, &clock);

        cache.set_default("a", value("1"));
        clock.advance(1.0);
        cache.set_default("b", value("2"));
        clock.advance(1.0);

        // Overwriting a full cache's existing key evicts nothing
        cache.set_default("a", value("1b"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);

        // "b" is now the oldest insert
        clock.advance(1.0);
        cache.set_default("c", value("3"));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(value("1b")));
        assert_eq!(cache.get("c"), Some(value("3")));
    }

    #[test]
    fn inserting_past_bound_keeps_exactly_max_entries() {
        let clock = TestClock::new(0.0);
        let max_entries = 16;
        let cache = cache_with(max_entries, &clock);

        for i in 0..=max_entries {
            cache.set_default(format!("key{i}"), value("v"));
            clock.advance(0.001);
        }

        assert_eq!(cache.len(), max_entries);
        assert_eq!(cache.get("key0"), None);
        for i in 1..=max_entries {
            assert!(cache.get(&format!("key{i}")).is_some(), "key{i} should survive");
        }
    }

    #[test]
    fn repeated_reads_are_idempotent() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(10, &clock);
        cache.set_default("k", value("v"));
        cache.set_default("other", value("w"));

        let first = cache.get("k");
        let second = cache.get("k");
        assert_eq!(first, second);
        assert_eq!(cache.len(), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn delete_reports_presence() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(10, &clock);
        cache.set_default("k", value("v"));

        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_pattern_removes_matching_keys() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(10, &clock);
        cache.set_default("GET:/api/employees:aa", value("list"));
        cache.set_default("GET:/api/employees/7:bb", value("one"));
        cache.set_default("GET:/api/contracts:cc", value("contracts"));

        assert_eq!(cache.invalidate_pattern("GET:/api/employees*").unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("GET:/api/contracts:cc").is_some());

        assert_eq!(cache.invalidate_pattern("nothing*").unwrap(), 0);
    }

    #[test]
    fn invalidate_regex_accepts_prebuilt_pattern() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(10, &clock);
        cache.set_default("GET:/a:1", value("x"));
        cache.set_default("HEAD:/a:2", value("y"));
        cache.set_default("GET:/b:3", value("z"));

        let regex = Regex::new(r"^(GET|HEAD):/a:").unwrap();
        assert_eq!(cache.invalidate_regex(&regex), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicted_and_invalidated_keys_leave_no_age_residue() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(2, &clock);

        cache.set_default("a", value("1"));
        cache.set_default("b", value("2"));
        cache.invalidate_pattern("a").unwrap();

        // Room was freed by invalidation, so nothing is evicted
        cache.set_default("c", value("3"));
        assert_eq!(cache.stats().evictions, 0);
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn clear_removes_everything() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(10, &clock);
        for i in 0..4 {
            cache.set_default(format!("k{i}"), value("v"));
        }

        assert_eq!(cache.clear(), 4);
        assert!(cache.is_empty());
        assert_eq!(cache.get("k0"), None);
    }

    #[test]
    fn stats_report_bounds_and_ttl() {
        let clock = TestClock::new(0.0);
        let config = CacheConfig::new(25, Duration::from_millis(1500));
        let cache = ResponseCache::<String, _>::with_config(config, clock).unwrap();
        cache.set_default("k", value("v"));

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.max_size, 25);
        assert_eq!(stats.default_ttl_ms, 1500);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["maxSize"], 25);
        assert_eq!(json["defaultTTL"], 1500);
    }

    #[test]
    fn huge_ttl_does_not_wrap() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(10, &clock);

        cache.set("k", value("v"), Duration::from_secs(18_446_744_074));
        clock.advance(1.0);
        assert_eq!(cache.get("k"), Some(value("v")));
        assert_eq!(cache.sweep_expired(), 0);
    }

    #[test]
    fn zero_ttl_is_not_stored() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(10, &clock);
        cache.set("k", value("v"), Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let clock = TestClock::new(0.0);
        let cache = cache_with(10, &clock);
        cache.set("short", value("1"), Duration::from_secs(1));
        cache.set("long", value("2"), Duration::from_secs(10));

        clock.advance(5.0);
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("long").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_expires_unread_entries() {
        let clock = TestClock::new(0.0);
        let config =
            CacheConfig::new(10, Duration::from_millis(100)).sweep_interval(Duration::from_secs(1));
        let cache = Arc::new(ResponseCache::<String, _>::with_config(config, clock.clone()).unwrap());
        let sweeper = cache.spawn_sweeper();

        cache.set_default("k", value("v"));
        clock.advance(0.2);

        // Nothing removes the entry until the sweeper ticks
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.len(), 0);

        // Dropping the cache ends the sweeper on its next tick
        drop(cache);
        let finished = tokio::time::timeout(Duration::from_secs(5), sweeper).await;
        assert!(finished.is_ok());
    }

    #[test]
    fn concurrent_writers_respect_bound() {
        let clock = TestClock::new(0.0);
        let cache = Arc::new(cache_with(50, &clock));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.set_default(format!("t{t}-{i}"), format!("{i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 50);
        assert_eq!(cache.stats().evictions, 350);
    }
}
