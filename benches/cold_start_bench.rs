// Cold-start benchmark for SOCK sandboxes
// Measures create-to-ready latency for fresh and forked leaves, and the
// pause/unpause round trip, against a real worker directory.
// Needs root, cgroup v1 and a base image; set SOCKBOX_WORKER_DIR to run.

use sockbox::config::WorkerConfig;
use sockbox::core::types::{Runtime, SandboxMeta};
use sockbox::sandbox::SandboxPool;
use sockbox::Engine;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Benchmark configuration
const ITERATIONS: usize = 50;
const WARMUP_ITERATIONS: usize = 5;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = ((len as f64 * 0.95) as usize).min(len - 1);
        let p99_idx = ((len as f64 * 0.99) as usize).min(len - 1);

        let sum: Duration = samples.iter().sum();
        let mean = sum / len as u32;

        Self {
            p50: samples[p50_idx],
            p95: samples[p95_idx],
            p99: samples[p99_idx],
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

/// Benchmark result
struct BenchmarkResult {
    scenario: String,
    stats: Option<LatencyStats>,
    passed: bool,
    reason: Option<String>,
}

impl BenchmarkResult {
    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        if let Some(stats) = &self.stats {
            stats.print("Latency");
        }
        match &self.reason {
            None => println!("PASS"),
            Some(reason) => println!("FAIL: {}", reason),
        }
    }

    fn judge(scenario: &str, samples: Vec<Duration>, p50: Duration, p95: Duration) -> Self {
        let stats = LatencyStats::from_samples(samples);
        let passed = stats.p50 < p50 && stats.p95 < p95;
        let reason = if !passed {
            Some(format!(
                "p50={:?} (target <{:?}), p95={:?} (target <{:?})",
                stats.p50, p50, stats.p95, p95
            ))
        } else {
            None
        };
        Self {
            scenario: scenario.to_string(),
            stats: Some(stats),
            passed,
            reason,
        }
    }

    fn failed(scenario: &str, reason: String) -> Self {
        Self {
            scenario: scenario.to_string(),
            stats: None,
            passed: false,
            reason: Some(reason),
        }
    }
}

/// Create and destroy one leaf, timing only the create.
fn time_leaf(engine: &Engine, code: &Path) -> Result<Duration, String> {
    let start = Instant::now();
    let sb = engine
        .create_leaf(code, SandboxMeta::default(), Runtime::Python)
        .map_err(|e| e.to_string())?;
    let elapsed = start.elapsed();
    sb.destroy();
    Ok(elapsed)
}

fn run_leaves(engine: &Engine, code: &Path, scenario: &str, p50: Duration, p95: Duration) -> BenchmarkResult {
    for _ in 0..WARMUP_ITERATIONS {
        if let Err(e) = time_leaf(engine, code) {
            return BenchmarkResult::failed(scenario, e);
        }
    }

    let mut samples = Vec::with_capacity(ITERATIONS);
    for _ in 0..ITERATIONS {
        match time_leaf(engine, code) {
            Ok(elapsed) => samples.push(elapsed),
            Err(e) => return BenchmarkResult::failed(scenario, e),
        }
    }
    BenchmarkResult::judge(scenario, samples, p50, p95)
}

/// Pause followed by unpause of one running leaf.
fn benchmark_pause_unpause(engine: &Engine, code: &Path) -> BenchmarkResult {
    let scenario = "Pause/Unpause";
    let sb = match engine.create_leaf(code, SandboxMeta::default(), Runtime::Python) {
        Ok(sb) => sb,
        Err(e) => return BenchmarkResult::failed(scenario, e.to_string()),
    };

    let mut samples = Vec::with_capacity(ITERATIONS);
    for _ in 0..ITERATIONS {
        let start = Instant::now();
        if let Err(e) = sb.pause().and_then(|_| sb.unpause()) {
            return BenchmarkResult::failed(scenario, e.to_string());
        }
        samples.push(start.elapsed());
    }
    sb.destroy();
    BenchmarkResult::judge(scenario, samples, Duration::from_millis(10), Duration::from_millis(50))
}

fn load_config(worker_dir: PathBuf, import_cache: bool) -> Result<WorkerConfig, String> {
    let path = worker_dir.join("config.json");
    let mut config = if path.exists() {
        WorkerConfig::load_from_file(&path).map_err(|e| e.to_string())?
    } else {
        WorkerConfig {
            worker_dir,
            ..WorkerConfig::default()
        }
    };
    config.features.import_cache = import_cache;
    Ok(config)
}

fn bench_engine(worker_dir: &Path, import_cache: bool, code: &Path) -> Vec<BenchmarkResult> {
    let label = if import_cache { "Forked leaf" } else { "Fresh leaf" };
    let engine = match load_config(worker_dir.to_path_buf(), import_cache)
        .and_then(|c| Engine::start(c).map_err(|e| e.to_string()))
    {
        Ok(engine) => engine,
        Err(e) => return vec![BenchmarkResult::failed(label, e)],
    };

    let mut results = vec![if import_cache {
        // Forking from a live Zygote skips interpreter start-up.
        run_leaves(&engine, code, label, Duration::from_millis(30), Duration::from_millis(80))
    } else {
        run_leaves(&engine, code, label, Duration::from_millis(300), Duration::from_millis(600))
    }];
    if !import_cache {
        results.push(benchmark_pause_unpause(&engine, code));
    }
    println!("\n{} pool: {} MB free", label, engine.leaves().memory().available_mb().unwrap_or(-1));
    engine.shutdown();
    results
}

fn main() {
    let worker_dir = match std::env::var_os("SOCKBOX_WORKER_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => {
            println!("SOCKBOX_WORKER_DIR not set, skipping cold-start benchmark");
            return;
        }
    };
    let code = std::env::var_os("SOCKBOX_CODE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| worker_dir.join("registry").join("hello"));

    println!("=== sockbox Cold-Start Benchmark ===");
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    let mut results = bench_engine(&worker_dir, false, &code);
    results.extend(bench_engine(&worker_dir, true, &code));

    for result in &results {
        result.print();
    }

    let passed_count = results.iter().filter(|r| r.passed).count();
    let total_count = results.len();

    println!("\n=== Summary ===");
    println!("{}/{} scenarios passed", passed_count, total_count);

    if passed_count == total_count {
        println!("All cold-start budgets met");
        std::process::exit(0);
    } else {
        println!("Some cold-start budgets exceeded");
        std::process::exit(1);
    }
}
