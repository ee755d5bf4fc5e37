// =============================================================================
// relaycore — Load Test Tool
// =============================================================================
// Generates valid JSON envelopes and POSTs them to /v1/router/enqueue at a
// configurable rate, tallying accept/duplicate/rate-limit/error outcomes.
// =============================================================================

use base64::Engine as _;
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Serialize)]
struct Header {
    sender_fp: String,
    recipient_fp: String,
    msg_id: String,
    nonce: String,
    ttl: i64,
    ts: i64,
}

#[derive(Serialize)]
struct Envelope {
    version: &'static str,
    header: Header,
    ciphertext: String,
}

#[derive(Parser)]
#[command(name = "relaycore-loadtest")]
#[command(about = "Load test tool for the relaycore router")]
struct Args {
    /// Server base URL
    #[arg(long, default_value = "http://localhost:9002")]
    url: String,

    /// Envelopes per second
    #[arg(long, default_value_t = 100)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of distinct simulated sender fingerprints
    #[arg(long, default_value_t = 10)]
    senders: usize,

    /// X-Device-Fp header value
    #[arg(long, default_value = "loadtest-device")]
    device_fp: String,

    /// X-Device-Token header value (from `router provision`)
    #[arg(long)]
    device_token: String,
}

struct Counters {
    sent: AtomicU64,
    accepted: AtomicU64,
    duplicate: AtomicU64,
    rejected: AtomicU64,
    rate_limited: AtomicU64,
    network_error: AtomicU64,
    latency_sum_us: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            duplicate: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            network_error: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
        }
    }
}

fn build_envelope(sender_fp: &str, rng: &mut impl Rng) -> Envelope {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;

    let mut nonce = [0u8; 12];
    rng.fill(&mut nonce);
    let mut payload = vec![0u8; 64];
    rng.fill(&mut payload[..]);

    Envelope {
        version: "1.0",
        header: Header {
            sender_fp: sender_fp.to_string(),
            recipient_fp: "loadtest-recipient".to_string(),
            msg_id: uuid::Uuid::new_v4().to_string(),
            nonce: base64::engine::general_purpose::STANDARD.encode(nonce),
            ttl: 4,
            ts: now,
        },
        ciphertext: base64::engine::general_purpose::STANDARD.encode(payload),
    }
}

fn main() {
    let args = Args::parse();

    println!("=== relaycore Load Test ===");
    println!("Target:   {}/v1/router/enqueue", args.url);
    println!("Rate:     {} env/s", args.rate);
    println!("Duration: {}s", args.duration);
    println!("Senders:  {}", args.senders);
    println!();

    let senders: Vec<String> = (0..args.senders)
        .map(|i| format!("sender-{i:04}"))
        .collect();

    let counters = Arc::new(Counters::new());
    let enqueue_url = format!("{}/v1/router/enqueue", args.url);

    let interval = Duration::from_micros(1_000_000 / args.rate as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    println!("Sending...\n");
    let start = Instant::now();

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    let mut rng = rand::thread_rng();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let sender = &senders[(tick as usize) % senders.len()];
        let envelope = build_envelope(sender, &mut rng);

        let req_start = Instant::now();
        counters.sent.fetch_add(1, Ordering::Relaxed);

        match client
            .post(&enqueue_url)
            .header("X-Device-Fp", &args.device_fp)
            .header("X-Device-Token", &args.device_token)
            .json(&envelope)
            .send()
        {
            Ok(resp) => {
                let lat = req_start.elapsed().as_micros() as u64;
                counters.latency_sum_us.fetch_add(lat, Ordering::Relaxed);

                match resp.status().as_u16() {
                    200 => {
                        let body: serde_json::Value = resp.json().unwrap_or_default();
                        if body.get("queued").and_then(|v| v.as_bool()) == Some(true) {
                            counters.accepted.fetch_add(1, Ordering::Relaxed);
                        } else {
                            counters.duplicate.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    401 | 429 => {
                        counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    }
                    other => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        if tick < 5 {
                            eprintln!("Unexpected status: {}", other);
                        }
                    }
                }
            }
            Err(_) => {
                counters.network_error.fetch_add(1, Ordering::Relaxed);
            }
        }

        tick += 1;

        if tick % 500 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} accepted={} duplicate={} rejected={} rate_limited={} err={} ({:.0} env/s)",
                elapsed,
                sent,
                counters.accepted.load(Ordering::Relaxed),
                counters.duplicate.load(Ordering::Relaxed),
                counters.rejected.load(Ordering::Relaxed),
                counters.rate_limited.load(Ordering::Relaxed),
                counters.network_error.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        let target = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual = start.elapsed();
        if actual < target {
            std::thread::sleep(target - actual);
        }
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    let accepted = counters.accepted.load(Ordering::Relaxed);
    let avg_lat = if sent > 0 {
        counters.latency_sum_us.load(Ordering::Relaxed) / sent
    } else {
        0
    };

    println!("\n=== Results ===");
    println!("Duration:     {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:   {}", sent);
    println!(
        "Accepted:     {} ({:.1}%)",
        accepted,
        accepted as f64 / sent.max(1) as f64 * 100.0
    );
    println!("Duplicate:    {}", counters.duplicate.load(Ordering::Relaxed));
    println!("Rejected:     {}", counters.rejected.load(Ordering::Relaxed));
    println!("Rate limited: {}", counters.rate_limited.load(Ordering::Relaxed));
    println!("Net errors:   {}", counters.network_error.load(Ordering::Relaxed));
    println!("Avg latency:  {} us", avg_lat);
    println!("Throughput:   {:.1} env/s", sent as f64 / elapsed.as_secs_f64());
}
