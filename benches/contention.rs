use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use classbook::config::PolicyConfig;
use classbook::engine::{Engine, EnrollOutcome};
use classbook::model::BookingStatus;
use classbook::notify::NotifyHub;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const DAY: i64 = 24 * HOUR;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn setup(engine: &Engine) -> Vec<(Ulid, u32)> {
    let capacities = [1, 1, 5, 5, 10, 10, 20, 20, 50, 50];
    let mut classes = Vec::new();
    for (i, &cap) in capacities.iter().enumerate() {
        let id = Ulid::new();
        engine
            .schedule_class(id, 1, Some(format!("bench {i}")), 10 * DAY, HOUR, cap)
            .await
            .unwrap();
        classes.push((id, cap));
    }
    println!("  scheduled {} classes", classes.len());
    classes
}

/// Many users race for a handful of seats; every request is an enroll.
async fn enroll_storm(engine: Arc<Engine>, classes: &[(Ulid, u32)], users: usize) {
    println!("\n── enroll storm: {users} users x {} classes ──", classes.len());
    let start = Instant::now();
    let mut handles = Vec::new();
    for u in 0..users {
        for &(class_id, _) in classes {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                let out = engine.enroll(&format!("user{u}"), class_id, 0).await;
                (t.elapsed(), out)
            }));
        }
    }
    let mut reserved_lat = Vec::new();
    let mut waitlisted_lat = Vec::new();
    let mut errors = 0;
    for h in handles {
        let (elapsed, out) = h.await.unwrap();
        match out {
            Ok(EnrollOutcome::Reserved { .. }) => reserved_lat.push(elapsed),
            Ok(EnrollOutcome::Waitlisted { .. }) => waitlisted_lat.push(elapsed),
            Err(_) => errors += 1,
        }
    }
    let wall = start.elapsed();
    let total = reserved_lat.len() + waitlisted_lat.len() + errors;
    println!(
        "  {total} requests in {:.2}s ({:.0} req/s), {errors} errors",
        wall.as_secs_f64(),
        total as f64 / wall.as_secs_f64()
    );
    print_latency("reserved", &mut reserved_lat);
    print_latency("waitlisted", &mut waitlisted_lat);

    for &(class_id, cap) in classes {
        let info = engine.class_info(class_id).await.unwrap();
        assert_eq!(info.enrolled, cap, "class {class_id} over- or under-booked");
    }
    println!("  seat counts verified");
}

/// Cancel every seat holder in parallel; each cancel promotes in the same commit.
async fn cancel_cascade(engine: Arc<Engine>, classes: &[(Ulid, u32)]) {
    println!("\n── cancel cascade ──");
    let mut handles = Vec::new();
    for &(class_id, _) in classes {
        let holders = seat_holders(&engine, class_id).await;
        for user in holders {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                let out = engine.cancel(&user, class_id, 0).await;
                (t.elapsed(), out.map(|o| o.waitlist_promotion.is_some()))
            }));
        }
    }
    let mut lat = Vec::new();
    let mut promoted = 0;
    for h in handles {
        let (elapsed, out) = h.await.unwrap();
        lat.push(elapsed);
        if let Ok(true) = out {
            promoted += 1;
        }
    }
    println!("  {} cancels, {promoted} promotions", lat.len());
    print_latency("cancel", &mut lat);
}

async fn seat_holders(engine: &Engine, class_id: Ulid) -> Vec<String> {
    engine
        .class_bookings(class_id, Some(BookingStatus::Reserved))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.user_id)
        .collect()
}

#[tokio::main]
async fn main() {
    let users: usize = std::env::var("BENCH_USERS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(200);

    let dir = std::env::temp_dir().join(format!("classbook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(
            dir.join("bench.wal"),
            PolicyConfig::default(),
            Arc::new(NotifyHub::new()),
        )
        .unwrap(),
    );

    println!("classbook contention bench");
    let classes = setup(&engine).await;
    enroll_storm(engine.clone(), &classes, users).await;
    cancel_cascade(engine.clone(), &classes).await;

    let _ = std::fs::remove_dir_all(&dir);
}
