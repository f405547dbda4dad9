//! The load-test worker body (§4.K step 3): a virtual-user fan-out that
//! runs inside the child process spawned by [`super::LoadDriver::start`].
//!
//! Invoked as `<this binary> loadtest-worker --config C --status S --result
//! R`. Grounded in the original Locust `User` class's `@task` loop: a pool
//! of `users` virtual users, ramped at `1/spawn_rate` second intervals,
//! each repeatedly walking the step list with a small random pause between
//! requests, recording per-endpoint latency/failure counters under a
//! shared lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::Client;
use tokio::sync::Mutex;

use super::{EndpointStat, LoadTestConfig, Percentiles, ResultFile, StatusFile, WorkerState, WorkerStep};

#[derive(Default)]
struct EndpointCounters {
    durations_ms: Vec<f64>,
    failures: u64,
}

struct Shared {
    counters: Mutex<HashMap<String, EndpointCounters>>,
    active_users: std::sync::atomic::AtomicU32,
    stop: std::sync::atomic::AtomicBool,
}

/// Runs the full worker lifecycle: ramp up virtual users, drive them until
/// stopped or `duration_secs` elapses, periodically flush `status.json`,
/// then write the final `result.json`.
pub async fn run(config_path: &Path, status_path: &Path, result_path: &Path) -> Result<(), String> {
    let config_bytes = std::fs::read(config_path).map_err(|e| format!("read config: {e}"))?;
    let config: LoadTestConfig = serde_json::from_slice(&config_bytes).map_err(|e| format!("parse config: {e}"))?;

    let shared = Arc::new(Shared {
        counters: Mutex::new(HashMap::new()),
        active_users: std::sync::atomic::AtomicU32::new(0),
        stop: std::sync::atomic::AtomicBool::new(false),
    });

    let started = Instant::now();
    write_status(status_path, &shared, WorkerState::Starting, started.elapsed()).await;

    let client = Client::builder()
        .build()
        .map_err(|e| format!("build http client: {e}"))?;

    let stop_sentinel = config_path.with_extension("stop");
    let mut handles = Vec::with_capacity(config.users as usize);
    let spawn_interval = if config.spawn_rate > 0.0 {
        Duration::from_secs_f64(1.0 / config.spawn_rate)
    } else {
        Duration::ZERO
    };

    write_status(status_path, &shared, WorkerState::Ramping, started.elapsed()).await;

    for _ in 0..config.users {
        let shared = shared.clone();
        let client = client.clone();
        let steps = config.steps.clone();
        let stop_sentinel = stop_sentinel.clone();
        let deadline = config.duration_secs.map(|d| started + Duration::from_secs(d));

        handles.push(tokio::spawn(async move {
            shared.active_users.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            virtual_user_loop(&shared, &client, &steps, &stop_sentinel, deadline).await;
            shared.active_users.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }));
        if !spawn_interval.is_zero() {
            tokio::time::sleep(spawn_interval).await;
        }
    }

    // Status-flush loop (§4.K: "updates status.json at least every 0.5s").
    let status_flusher = {
        let shared = shared.clone();
        let status_path = status_path.to_path_buf();
        let stop_sentinel = stop_sentinel.clone();
        let deadline = config.duration_secs.map(|d| started + Duration::from_secs(d));
        tokio::spawn(async move {
            loop {
                write_status(&status_path, &shared, WorkerState::Running, started.elapsed()).await;
                if stop_sentinel.exists() {
                    shared.stop.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        shared.stop.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                }
                if shared.active_users.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
        })
    };

    for handle in handles {
        let _ = handle.await;
    }
    let _ = status_flusher.await;

    let result = compute_result(&shared, started.elapsed()).await;
    write_status(status_path, &shared, WorkerState::Completed, started.elapsed()).await;
    let result_json = serde_json::to_string_pretty(&result).map_err(|e| format!("serialize result: {e}"))?;
    std::fs::write(result_path, result_json).map_err(|e| format!("write result: {e}"))?;
    let _ = std::fs::remove_file(&stop_sentinel);

    Ok(())
}

async fn virtual_user_loop(
    shared: &Shared,
    client: &Client,
    steps: &[WorkerStep],
    stop_sentinel: &PathBuf,
    deadline: Option<Instant>,
) {
    loop {
        if shared.stop.load(std::sync::atomic::Ordering::SeqCst) || stop_sentinel.exists() {
            return;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return;
            }
        }
        if steps.is_empty() {
            return;
        }
        for step in steps {
            if shared.stop.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            let started = Instant::now();
            let outcome = dispatch(client, step).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            let mut counters = shared.counters.lock().await;
            let entry = counters.entry(step.name.clone()).or_default();
            entry.durations_ms.push(elapsed_ms);
            if !outcome {
                entry.failures += 1;
            }
            drop(counters);

            let pause_ms = rand::thread_rng().gen_range(50..250);
            tokio::time::sleep(Duration::from_millis(pause_ms)).await;
        }
        if deadline.is_none() && stop_sentinel.exists() {
            return;
        }
    }
}

/// Sends one request for `step`, returning whether it succeeded (2xx/3xx).
async fn dispatch(client: &Client, step: &WorkerStep) -> bool {
    let method = match step.method.as_str() {
        "GET" => reqwest::Method::GET,
        "POST" => reqwest::Method::POST,
        "PUT" => reqwest::Method::PUT,
        "PATCH" => reqwest::Method::PATCH,
        "DELETE" => reqwest::Method::DELETE,
        _ => return false,
    };
    let mut builder = client.request(method, &step.url);
    if let Some(headers) = step.headers.as_object() {
        for (k, v) in headers {
            if let Some(s) = v.as_str() {
                builder = builder.header(k, s);
            }
        }
    }
    if !step.body.is_null() && step.body != serde_json::json!({}) {
        builder = builder.json(&step.body);
    }
    match builder.send().await {
        Ok(resp) => resp.status().is_success() || resp.status().is_redirection(),
        Err(_) => false,
    }
}

async fn write_status(path: &Path, shared: &Shared, state: WorkerState, elapsed: Duration) {
    let counters = shared.counters.lock().await;
    let total_requests: u64 = counters.values().map(|c| c.durations_ms.len() as u64).sum();
    let total_failures: u64 = counters.values().map(|c| c.failures).sum();
    drop(counters);

    let status = StatusFile {
        state,
        elapsed: elapsed.as_secs_f64(),
        active_users: shared.active_users.load(std::sync::atomic::Ordering::SeqCst),
        total_requests,
        total_failures,
        error: None,
    };
    if let Ok(json) = serde_json::to_string(&status) {
        let _ = tokio::fs::write(path, json).await;
    }
}

async fn compute_result(shared: &Shared, elapsed: Duration) -> ResultFile {
    let counters = shared.counters.lock().await;
    let elapsed_secs = elapsed.as_secs_f64().max(0.001);

    let mut endpoints = Vec::with_capacity(counters.len());
    let mut all_durations: Vec<f64> = Vec::new();
    let mut total_failures = 0u64;

    for (name, counter) in counters.iter() {
        let mut sorted = counter.durations_ms.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        all_durations.extend(sorted.iter().copied());
        total_failures += counter.failures;

        endpoints.push(EndpointStat {
            name: name.clone(),
            num_requests: sorted.len() as u64,
            num_failures: counter.failures,
            avg_ms: average(&sorted),
            min_ms: sorted.first().copied().unwrap_or(0.0),
            max_ms: sorted.last().copied().unwrap_or(0.0),
            percentiles: percentiles(&sorted),
            rps: sorted.len() as f64 / elapsed_secs,
        });
    }
    endpoints.sort_by(|a, b| a.name.cmp(&b.name));

    all_durations.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let aggregated = EndpointStat {
        name: "Aggregated".to_string(),
        num_requests: all_durations.len() as u64,
        num_failures: total_failures,
        avg_ms: average(&all_durations),
        min_ms: all_durations.first().copied().unwrap_or(0.0),
        max_ms: all_durations.last().copied().unwrap_or(0.0),
        percentiles: percentiles(&all_durations),
        rps: all_durations.len() as f64 / elapsed_secs,
    };

    ResultFile { endpoints, aggregated }
}

fn average(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        0.0
    } else {
        sorted.iter().sum::<f64>() / sorted.len() as f64
    }
}

fn percentile_of(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn percentiles(sorted: &[f64]) -> Percentiles {
    Percentiles {
        p50: percentile_of(sorted, 50.0),
        p75: percentile_of(sorted, 75.0),
        p90: percentile_of(sorted, 90.0),
        p95: percentile_of(sorted, 95.0),
        p99: percentile_of(sorted, 99.0),
    }
}
