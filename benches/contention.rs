use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_postgres::{Config, NoTls};

const HOUR: i64 = 3_600_000; // 1 hour in ms
const DAY: i64 = 24 * HOUR;

async fn connect(host: &str, port: u16, user: u64) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotbook")
        .user(user.to_string())
        .password(std::env::var("SLOTBOOK_PASSWORD").unwrap_or_else(|_| "slotbook".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

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

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as i64
}

/// Start of the UTC day after tomorrow, so every slot is safely in the future.
fn base_ms() -> i64 {
    (now_ms() / DAY + 2) * DAY
}

/// Resource ids derived from the wall clock so reruns against the same data dir don't collide.
fn fresh_resource_ids(n: u64) -> Vec<u64> {
    let seed = (now_ms() as u64 % 1_000_000) * 1000;
    (0..n).map(|i| seed + i).collect()
}

const OWNER: u64 = 1;

async fn setup(client: &tokio_postgres::Client, ids: &[u64]) {
    for &rid in ids {
        client
            .batch_execute(&format!(
                "INSERT INTO resources (id, owner_id, name, category, rate, approved) \
                 VALUES ({rid}, {OWNER}, 'bench court {rid}', 'badminton', '120.00', true)"
            ))
            .await
            .unwrap();
    }
    println!("  synced {} listings", ids.len());
}

fn insert_sql(rid: u64, start: i64, end: i64) -> String {
    format!(r#"INSERT INTO reservations (resource_id, start, "end") VALUES ({rid}, {start}, {end})"#)
}

async fn hold(client: &tokio_postgres::Client, rid: u64, start: i64, end: i64) -> Option<u64> {
    let msgs = client.simple_query(&insert_sql(rid, start, end)).await.ok()?;
    msgs.into_iter().find_map(|m| match m {
        tokio_postgres::SimpleQueryMessage::Row(row) => row.get("id").and_then(|s| s.parse().ok()),
        _ => None,
    })
}

async fn phase1_sequential(host: &str, port: u16, rid: u64) {
    let client = connect(host, port, 100).await;
    let base = base_ms();

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = base + (i as i64) * HOUR;
        let t = Instant::now();
        hold(&client, rid, s, s + HOUR).await.expect("hold refused");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} holds in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("hold latency", &mut latencies);
}

/// Many users race for the same slot; exactly one hold should win each round.
async fn phase2_same_slot(host: &str, port: u16, rid: u64) {
    let n_users = 32u64;
    let rounds = 50;
    let base = base_ms();

    let mut clients = Vec::new();
    for u in 0..n_users {
        clients.push(Arc::new(connect(host, port, 1000 + u).await));
    }

    let mut latencies = Vec::new();
    let mut bad_rounds = 0;
    let start = Instant::now();

    for round in 0..rounds {
        let s = base + (round as i64) * HOUR;
        let winners = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for client in &clients {
            let client = client.clone();
            let winners = winners.clone();
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                if let Some(id) = hold(&client, rid, s, s + HOUR).await {
                    client
                        .batch_execute(&format!(
                            "UPDATE reservations SET status = 'confirmed' WHERE id = {id}"
                        ))
                        .await
                        .expect("winner could not confirm");
                    winners.fetch_add(1, Ordering::Relaxed);
                }
                t.elapsed()
            }));
        }

        for h in handles {
            latencies.push(h.await.unwrap());
        }
        if winners.load(Ordering::Relaxed) != 1 {
            bad_rounds += 1;
        }
    }

    let elapsed = start.elapsed();
    let attempts = rounds * n_users as usize;
    println!(
        "  {rounds} rounds x {n_users} users = {attempts} attempts in {:.2}s, rounds without exactly one winner: {bad_rounds}",
        elapsed.as_secs_f64()
    );
    print_latency("attempt latency", &mut latencies);
}

/// Independent resources should not serialize behind each other.
async fn phase3_spread(host: &str, port: u16, rids: &[u64]) {
    let n_per_task = 200;
    let base = base_ms() + 200 * DAY;

    let start = Instant::now();
    let mut handles = Vec::new();

    for (i, &rid) in rids.iter().enumerate() {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, 2000 + i as u64).await;
            for j in 0..n_per_task {
                let s = base + (j as i64) * HOUR;
                let id = hold(&client, rid, s, s + HOUR).await.expect("hold refused");
                client
                    .batch_execute(&format!(
                        "UPDATE reservations SET status = 'confirmed' WHERE id = {id}"
                    ))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = rids.len() * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {} resources x {n_per_task} hold+confirm = {total} in {:.2}s = {ops:.0} ops/sec",
        rids.len(),
        elapsed.as_secs_f64()
    );
}

async fn phase4_stats_under_load(host: &str, port: u16, rid: u64) {
    let writer_host = host.to_string();
    let base = base_ms() + 400 * DAY;
    let writer = tokio::spawn(async move {
        let client = connect(&writer_host, port, 3000).await;
        for i in 0..500 {
            let s = base + (i as i64) * HOUR;
            let _ = hold(&client, rid, s, s + HOUR).await;
        }
    });

    let reader = connect(host, port, OWNER).await;
    let mut latencies = Vec::new();
    while !writer.is_finished() {
        let t = Instant::now();
        reader
            .simple_query(&format!("SELECT * FROM stats WHERE owner_id = {OWNER}"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    writer.await.unwrap();

    print_latency("owner stats latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTBOOK_PORT");

    println!("=== slotbook contention benchmark ===");
    println!("target: {host}:{port}\n");

    let rids = fresh_resource_ids(10);

    println!("[setup]");
    let setup_client = connect(&host, port, OWNER).await;
    setup(&setup_client, &rids).await;
    drop(setup_client);

    println!("\n[phase 1] sequential holds");
    phase1_sequential(&host, port, rids[0]).await;

    println!("\n[phase 2] same-slot race");
    phase2_same_slot(&host, port, rids[1]).await;

    println!("\n[phase 3] independent resources");
    phase3_spread(&host, port, &rids[2..]).await;

    println!("\n[phase 4] stats latency under write load");
    phase4_stats_under_load(&host, port, rids[1]).await;

    println!("\n=== benchmark complete ===");
}
