use anyhow::{ensure, Result};
use lapse_core::{Store, StoreConfig};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lapse_stress=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("🧪 Lapse scenario and stress driver");
    println!();

    scenario_basic_operations()?;
    scenario_expiration_ordering()?;
    scenario_replace_semantics()?;
    scenario_purger_lifecycle()?;
    scenario_parallel_stress()?;

    println!();
    tracing::info!("✅ All scenarios passed!");

    Ok(())
}

/// Insert, read back, remove, read again.
fn scenario_basic_operations() -> Result<()> {
    tracing::info!("Scenario: Basic Operations");

    let store: Store<String, String> = Store::new();

    store.put("basic".to_string(), "hello world".to_string(), 60_000);
    ensure!(
        store.get(&"basic".to_string()).as_deref() == Some("hello world"),
        "value should be readable right after put"
    );
    ensure!(store.len() == 1, "store should hold exactly one entry");

    let removed = store.remove(&"basic".to_string());
    ensure!(
        removed.as_deref() == Some("hello world"),
        "remove should hand back the stored value"
    );
    ensure!(
        store.get(&"basic".to_string()).is_none(),
        "entry should be gone after remove"
    );

    store.close();
    tracing::info!("   ✓ Basic operations work correctly");
    Ok(())
}

/// Entries inserted out of deadline order expire in deadline order.
fn scenario_expiration_ordering() -> Result<()> {
    tracing::info!("Scenario: Out-of-order Expiration");

    let store: Store<&str, u32> = Store::new();
    store.put("slow", 1, 600);
    store.put("slower", 2, 800);
    store.put("fast", 3, 150);

    thread::sleep(Duration::from_millis(300));
    ensure!(
        store.get(&"fast").is_none(),
        "earliest deadline should expire first"
    );
    ensure!(
        store.get(&"slow") == Some(1) && store.get(&"slower") == Some(2),
        "later deadlines must not expire early"
    );

    thread::sleep(Duration::from_millis(700));
    ensure!(
        store.is_empty(),
        "everything should be evicted past the last deadline"
    );

    store.close();
    tracing::info!("   ✓ Expiration follows deadline order");
    Ok(())
}

/// Overwriting an entry replaces both its value and its deadline.
fn scenario_replace_semantics() -> Result<()> {
    tracing::info!("Scenario: Replace Semantics");

    let store: Store<&str, &str> = Store::new();

    // Shorten: the rewritten entry must honor the shorter deadline.
    store.put("a", "long-lived", 10_000);
    store.put("a", "short-lived", 150);
    thread::sleep(Duration::from_millis(400));
    ensure!(
        store.get(&"a").is_none(),
        "shortened deadline should have evicted the entry"
    );

    // Lengthen: the rewritten entry must survive the original deadline.
    store.put("b", "first", 150);
    store.put("b", "second", 10_000);
    thread::sleep(Duration::from_millis(400));
    ensure!(
        store.get(&"b") == Some("second"),
        "lengthened entry should survive with the newest value"
    );

    store.close();
    tracing::info!("   ✓ Replace reschedules in both directions");
    Ok(())
}

/// The purger thread comes and goes with the workload.
fn scenario_purger_lifecycle() -> Result<()> {
    tracing::info!("Scenario: Purger Lifecycle");

    let config = StoreConfig::default().with_idle_timeout(Duration::from_millis(200));
    let store: Store<&str, u32> = Store::with_config(config);

    store.put("blip", 1, 100);
    thread::sleep(Duration::from_millis(700));
    ensure!(
        store.get(&"blip").is_none(),
        "entry should expire while the purger is alive"
    );

    // A fresh insert after the idle exit must still be evicted on time.
    store.put("blip2", 2, 100);
    thread::sleep(Duration::from_millis(400));
    ensure!(
        store.get(&"blip2").is_none(),
        "re-spawned purger should evict on schedule"
    );

    store.close();
    tracing::info!("   ✓ Purger respawns after idling out");
    Ok(())
}

/// Many threads hammering one store: insert, verify, remove.
fn scenario_parallel_stress() -> Result<()> {
    const THREADS: usize = 10;
    const KEYS_PER_THREAD: usize = 100;

    tracing::info!(
        "Scenario: Parallel Stress ({} threads x {} keys)",
        THREADS,
        KEYS_PER_THREAD
    );

    let store: Store<String, usize> = Store::new();
    let start = Instant::now();

    let mut handles = Vec::new();
    for thread_id in 0..THREADS {
        let store = store.clone();
        handles.push(thread::spawn(move || -> Result<()> {
            for i in 0..KEYS_PER_THREAD {
                let key = format!("stress-t{}-k{}", thread_id, i);
                let value = thread_id * KEYS_PER_THREAD + i;
                let timeout_ms = 150 + ((thread_id * 13 + i * 29) % 101) as u64;

                store.put(key.clone(), value, timeout_ms);
                ensure!(
                    store.get(&key) == Some(value),
                    "read-back mismatch for {}",
                    key
                );
            }
            for i in 0..KEYS_PER_THREAD {
                let key = format!("stress-t{}-k{}", thread_id, i);
                store.remove(&key);
                ensure!(store.get(&key).is_none(), "{} survived its removal", key);
            }
            Ok(())
        }));
    }

    for handle in handles {
        handle
            .join()
            .expect("stress thread panicked")?;
    }

    let elapsed = start.elapsed();
    let ops = THREADS * KEYS_PER_THREAD * 4;
    tracing::info!(
        "   {} operations in {:?} ({:.0} ops/sec)",
        ops,
        elapsed,
        ops as f64 / elapsed.as_secs_f64()
    );

    ensure!(store.len() == 0, "store should be empty after teardown");

    // Let the purger work through the cancelled schedules.
    thread::sleep(Duration::from_millis(400));
    ensure!(store.len() == 0, "no key may reappear after its removal");

    store.close();
    tracing::info!("   ✓ No lost writes, no stragglers, no deadlock");
    Ok(())
}
