use anyhow::{ensure, Context, Result};
use shared_cache_core::{
    CacheConfig, DeliveryMode, KeyPattern, MemoryStore, Number, RateLimitConfig, RateLimiter,
    SetOptions, SharedCache, SignalBus, TokioScheduler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const WORKERS: u32 = 8;

/// A group of simulated workers sharing one store and one signal bus
struct Cluster {
    store: MemoryStore,
    bus: Arc<SignalBus>,
    config: CacheConfig,
}

impl Cluster {
    fn new(config: CacheConfig) -> Self {
        Self {
            store: MemoryStore::new(),
            bus: Arc::new(SignalBus::new()),
            config,
        }
    }

    /// The cache as seen by worker `pid`
    fn worker(&self, pid: u32) -> SharedCache {
        SharedCache::new(
            Arc::new(self.store.clone()),
            Arc::new(TokioScheduler::with_bus(pid, self.bus.clone())),
            self.config.clone(),
        )
    }

    fn workers(&self) -> Vec<SharedCache> {
        (1..=WORKERS).map(|pid| self.worker(pid)).collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shared_cache_workers=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CacheConfig::from_env();
    tracing::info!("🧪 Shared cache worker scenarios");
    tracing::info!("   Workers: {}, fuse: {:?}, delivery: {:?}", WORKERS, config.fuse, config.delivery_mode);
    println!();

    test_basic_operations(&config).await?;
    test_mutual_exclusion(&config).await?;
    test_counters(&config).await?;
    test_hash_ttl(&config).await?;
    test_channel_fan_out(&config, DeliveryMode::Timer).await?;
    test_channel_fan_out(&config, DeliveryMode::Signal).await?;
    test_rate_limiter(&config).await?;
    test_admin(&config).await?;

    println!();
    tracing::info!("✅ All scenarios passed!");

    Ok(())
}

/// SET/GET/DEL plus NX and pattern scans
async fn test_basic_operations(config: &CacheConfig) -> Result<()> {
    tracing::info!("Scenario: Basic Operations");

    let cluster = Cluster::new(config.clone());
    let cache = cluster.worker(1);
    let key = format!("basic-{}", uuid::Uuid::new_v4());

    tokio::task::spawn_blocking(move || -> Result<()> {
        ensure!(cache.set(&key, "hello world", SetOptions::new().ex(60))?);
        ensure!(cache.get(&key)?.as_deref() == Some("hello world"), "value should match");

        let lease = format!("{}:lease", key);
        ensure!(cache.set(&lease, "mine", SetOptions::new().nx())?);

        let found = cache.keys(Some(&KeyPattern::prefix(&key)))?;
        ensure!(found.len() == 2, "expected 2 keys, found {}", found.len());

        ensure!(cache.del(&[key.as_str(), lease.as_str()])?.is_empty());
        ensure!(cache.get(&key)?.is_none(), "key should be gone after DEL");
        Ok(())
    })
    .await??;

    tracing::info!("   ✓ Basic operations work correctly");
    Ok(())
}

/// Unlocked read-modify-write inside `atomic` must not lose updates
async fn test_mutual_exclusion(config: &CacheConfig) -> Result<()> {
    let rounds = 50;
    tracing::info!("Scenario: Mutual exclusion ({} workers x {} rounds)", WORKERS, rounds);

    let cluster = Cluster::new(config.clone());
    let key = format!("exclusive-{}", uuid::Uuid::new_v4());
    let start = Instant::now();

    let handles: Vec<_> = cluster
        .workers()
        .into_iter()
        .map(|cache| {
            let key = key.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                for _ in 0..rounds {
                    let ran = cache.atomic(&key, true, || {
                        let current: u64 = cache
                            .get(&key)?
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        cache.set(&key, &(current + 1).to_string(), SetOptions::new())?;
                        Ok(())
                    })?;
                    ensure!(ran.is_some(), "section hit the fuse");
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.await??;
    }

    let cache = cluster.worker(0);
    let total = cache.get(&key)?.context("counter missing")?;
    let expected = (WORKERS * rounds).to_string();
    ensure!(total == expected, "lost updates: expected {}, got {}", expected, total);
    ensure!(cache.lock_info()?.is_empty(), "locks left behind");

    tracing::info!("   ✓ {} increments in {:?}", total, start.elapsed());
    Ok(())
}

/// INCR/DECR from every worker
async fn test_counters(config: &CacheConfig) -> Result<()> {
    tracing::info!("Scenario: Counters");

    let cluster = Cluster::new(config.clone());
    let key = format!("counter-{}", uuid::Uuid::new_v4());

    let handles: Vec<_> = cluster
        .workers()
        .into_iter()
        .enumerate()
        .map(|(i, cache)| {
            let key = key.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                for _ in 0..20 {
                    let result = if i % 2 == 0 {
                        cache.incr(&key, 3, 0)?
                    } else {
                        cache.decr(&key, 1, 0)?
                    };
                    ensure!(result.is_some(), "counter update failed");
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.await??;
    }

    let cache = cluster.worker(0);
    let half = i64::from(WORKERS / 2);
    let expected = Number::Int(half * 20 * 3 - half * 20);
    ensure!(
        cache.get(&key)?.as_deref() == Some(expected.to_string().as_str()),
        "counter mismatch"
    );

    tracing::info!("   ✓ Counter settled at {}", expected);
    Ok(())
}

/// Field TTLs hide values before HRECYCLE removes them
async fn test_hash_ttl(config: &CacheConfig) -> Result<()> {
    tracing::info!("Scenario: Hash field TTL");

    let cluster = Cluster::new(config.clone());
    let cache = cluster.worker(1);
    let key = format!("session-{}", uuid::Uuid::new_v4());

    {
        let cache = cache.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            ensure!(cache.hset(&key, "token", "abc", 1)?);
            ensure!(cache.hset(&key, "user", "alice", 0)?);
            cache.hincr(&key, "visits", 1, 0)?;
            Ok(())
        })
        .await??;
    }

    tokio::time::sleep(Duration::from_millis(1100)).await;

    tokio::task::spawn_blocking(move || -> Result<()> {
        ensure!(cache.hget(&key, "token")?.is_none(), "token should have expired");
        ensure!(cache.hget(&key, "user")?.as_deref() == Some("alice"));
        ensure!(cache.hrecycle(&key)? == Some(1), "one field should be recycled");
        let fields = cache.hkeys(&key, None)?;
        ensure!(fields == ["user", "visits"], "unexpected fields {:?}", fields);
        Ok(())
    })
    .await??;

    tracing::info!("   ✓ Expired fields hidden and recycled");
    Ok(())
}

/// Every listening worker receives every fanned-out message, in order
async fn test_channel_fan_out(config: &CacheConfig, mode: DeliveryMode) -> Result<()> {
    let messages = 20;
    tracing::info!("Scenario: Channel fan-out ({:?} delivery, {} messages)", mode, messages);

    let cluster = Cluster::new(
        config
            .clone()
            .with_delivery_mode(mode)
            .with_listener_interval(Duration::from_millis(2)),
    );
    let channel = format!("jobs-{}", uuid::Uuid::new_v4());
    let workers = cluster.workers();
    let received = Arc::new(AtomicUsize::new(0));

    for (i, cache) in workers.iter().enumerate() {
        let received = received.clone();
        let next = Arc::new(AtomicUsize::new(0));
        cache
            .create_listener(&channel, &format!("worker-{}", i), move |_, worker, message| {
                let expected = format!("msg-{}", next.fetch_add(1, Ordering::SeqCst));
                if message != expected {
                    tracing::error!(worker, message, %expected, "out of order delivery");
                }
                received.fetch_add(1, Ordering::SeqCst);
            })?
            .context("listener not created")?;
    }

    let publisher = cluster.worker(0);
    {
        let channel = channel.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for i in 0..messages {
                ensure!(publisher.publish(&channel, &format!("msg-{}", i), false, None)?);
            }
            Ok(())
        })
        .await??;
    }

    let expected = messages * workers.len();
    let start = Instant::now();
    while received.load(Ordering::SeqCst) < expected {
        ensure!(
            start.elapsed() < Duration::from_secs(10),
            "only {} of {} deliveries",
            received.load(Ordering::SeqCst),
            expected
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for cache in &workers {
        cache.shutdown()?;
    }

    tracing::info!("   ✓ {} deliveries in {:?}", expected, start.elapsed());
    Ok(())
}

/// Workers share one request window
async fn test_rate_limiter(config: &CacheConfig) -> Result<()> {
    tracing::info!("Scenario: Rate limiter");

    let cluster = Cluster::new(config.clone());
    let key = format!("client-{}", uuid::Uuid::new_v4());
    let limit = 25;

    let handles: Vec<_> = cluster
        .workers()
        .into_iter()
        .map(|cache| {
            let key = key.clone();
            let limiter = RateLimiter::new(cache, RateLimitConfig::new(limit, Duration::from_secs(60)));
            tokio::task::spawn_blocking(move || -> Result<usize> {
                let mut allowed = 0;
                for _ in 0..10 {
                    let status = limiter.traffic(&key)?.context("rate limiter timed out")?;
                    if !status.is_limited {
                        allowed += 1;
                    }
                }
                Ok(allowed)
            })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        allowed += handle.await??;
    }
    ensure!(allowed == limit as usize, "allowed {} requests, limit {}", allowed, limit);

    tracing::info!("   ✓ {} of {} requests allowed", allowed, WORKERS * 10);
    Ok(())
}

/// Lock listing and store-wide cleanup
async fn test_admin(config: &CacheConfig) -> Result<()> {
    tracing::info!("Scenario: Admin");

    let cluster = Cluster::new(config.clone());
    let cache = cluster.worker(1);
    let key = format!("admin-{}", uuid::Uuid::new_v4());

    tokio::task::spawn_blocking(move || -> Result<()> {
        let held = cache
            .atomic(&key, false, || cache.lock_info())?
            .context("lock should be free")?;
        ensure!(held.len() == 1 && held[0].1.method == "atomic", "unexpected locks {:?}", held);

        cache.set(&key, "v", SetOptions::new())?;
        cache.hset(&format!("{}:hash", key), "f", "v", 0)?;
        let info = cache.info()?;
        tracing::info!("   store holds {} entries ({} bytes)", info.entries, info.size_bytes);

        ensure!(cache.clear()?);
        ensure!(cache.info()?.entries == 0, "store should be empty after CLEAR");
        Ok(())
    })
    .await??;

    tracing::info!("   ✓ Lock listing and CLEAR work");
    Ok(())
}
