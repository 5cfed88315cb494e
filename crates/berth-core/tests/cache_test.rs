use std::sync::Arc;
use std::thread;
use std::time::Duration;

use berth_core::cache::{Cache, CacheConfig, LruCache};

fn cache_with(max_size: usize) -> LruCache<i32> {
    LruCache::new(CacheConfig {
        max_size,
        default_ttl: Duration::ZERO,
        cleanup_period: Duration::ZERO,
        enable_stats: true,
    })
}

#[test]
fn lru_promotion_decides_the_victim() {
    let cache = cache_with(2);
    cache.set("a", 1);
    cache.set("b", 2);
    assert_eq!(cache.get("a"), Some(1));
    cache.set("c", 3);

    assert_eq!(cache.get("b"), None);
    assert_eq!(cache.get("a"), Some(1));
    assert_eq!(cache.get("c"), Some(3));
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn overflow_evicts_exactly_one_entry_per_insert() {
    let n = 5;
    let cache = cache_with(n);
    for i in 0..n {
        cache.set(&format!("k{i}"), i as i32);
        assert!(cache.size() <= n);
    }
    cache.set("extra", 99);

    assert_eq!(cache.size(), n);
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(cache.get("k0"), None, "least recently touched key is evicted");
    for i in 1..n {
        assert!(cache.get(&format!("k{i}")).is_some());
    }
    assert_eq!(cache.get("extra"), Some(99));
}

#[test]
fn expired_entry_is_absent_despite_recent_access() {
    let cache = cache_with(10);
    cache.set_with_ttl("short", 1, Duration::from_millis(1));
    cache.set("forever", 2);
    thread::sleep(Duration::from_millis(2));

    assert_eq!(cache.get("short"), None);
    cache.set_with_ttl("short-again", 3, Duration::from_millis(1));
    thread::sleep(Duration::from_millis(2));
    cache.cleanup(Duration::ZERO);

    assert_eq!(cache.size(), 1);
    assert_eq!(cache.get("forever"), Some(2));
}

#[test]
fn expired_get_counts_as_miss() {
    let cache = cache_with(10);
    cache.set_with_ttl("k", 1, Duration::from_millis(1));
    thread::sleep(Duration::from_millis(2));
    assert_eq!(cache.get("k"), None);

    let stats = cache.stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.size, 0);
}

#[test]
fn cleanup_with_max_age_drops_old_entries() {
    let cache = cache_with(10);
    cache.set("old", 1);
    thread::sleep(Duration::from_millis(20));
    cache.set("new", 2);

    cache.cleanup(Duration::from_millis(10));
    assert_eq!(cache.get("old"), None);
    assert_eq!(cache.get("new"), Some(2));
}

#[test]
fn cleanup_updates_last_cleanup() {
    let cache = cache_with(10);
    let before = cache.stats().last_cleanup;
    thread::sleep(Duration::from_millis(5));
    cache.cleanup(Duration::ZERO);
    assert!(cache.stats().last_cleanup > before);
}

#[test]
fn hit_rate_arithmetic() {
    let cache = cache_with(10);
    assert_eq!(cache.stats().hit_rate, 0.0);

    cache.set("x", 1);
    for _ in 0..3 {
        cache.get("x");
    }
    cache.get("missing");

    let stats = cache.stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
}

#[test]
fn clear_prefix_scopes_removal() {
    let cache = cache_with(10);
    cache.set("wt1:merge", 1);
    cache.set("wt1:sync", 2);
    cache.set("wt2:merge", 3);

    cache.clear_prefix("wt1:");
    assert_eq!(cache.size(), 1);
    assert_eq!(cache.get("wt2:merge"), Some(3));

    cache.clear_prefix("");
    assert_eq!(cache.size(), 0);
}

#[test]
fn delete_removes_only_that_key() {
    let cache = cache_with(10);
    cache.set("a", 1);
    cache.set("b", 2);
    cache.delete("a");
    cache.delete("not-there");
    assert_eq!(cache.size(), 1);
    assert_eq!(cache.get("b"), Some(2));
}

#[test]
fn stats_payload_has_wire_keys() {
    let cache = cache_with(3);
    cache.set("a", 1);
    let json = serde_json::to_value(cache.stats()).unwrap();
    for key in [
        "hits",
        "misses",
        "evictions",
        "size",
        "max_size",
        "hit_rate",
        "last_cleanup",
    ] {
        assert!(json.get(key).is_some(), "missing {key}");
    }
    assert_eq!(json["max_size"], 3);
    assert_eq!(json["size"], 1);
}

#[test]
fn sweeper_removes_expired_entries_in_background() {
    let cache = LruCache::new(CacheConfig {
        max_size: 10,
        default_ttl: Duration::from_millis(5),
        cleanup_period: Duration::from_millis(10),
        enable_stats: true,
    });
    assert!(cache.sweeper_running());
    cache.set("a", 1);

    let mut gone = false;
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(10));
        if cache.size() == 0 {
            gone = true;
            break;
        }
    }
    assert!(gone, "sweeper never removed the expired entry");
    cache.close();
    assert!(!cache.sweeper_running());
}

#[test]
fn close_without_sweeper_is_safe() {
    let cache = cache_with(2);
    cache.set("a", 1);
    cache.close();
    assert_eq!(cache.size(), 0);
}

#[test]
fn concurrent_access_respects_bound() {
    let cache: Arc<LruCache<i32>> = Arc::new(cache_with(16));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("t{t}-{i}");
                    cache.set(&key, i);
                    cache.get(&key);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(cache.size() <= 16);
    let stats = cache.stats();
    assert_eq!(stats.evictions, 800 - 16);
}
