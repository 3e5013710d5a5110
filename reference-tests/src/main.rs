//! Conformance binary entry point
//!
//! Runs every scenario on the CPU reference backend and, when built with
//! `--features gpu` and an adapter is present, on wgpu.

use reference_tests::{run_all, CpuRig, ScenarioResult};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "reference_tests=info".into()))
        .init();

    let mut results: Vec<ScenarioResult> = run_all(&mut CpuRig);
    results.extend(gpu_results());

    for result in &results {
        result.print_summary();
    }

    let failed = results.iter().filter(|r| !r.passed()).count();
    let skipped = results
        .iter()
        .filter(|r| matches!(r.verdict, reference_tests::Verdict::Skipped(_)))
        .count();

    println!("\n{}", "=".repeat(80));
    println!("OVERALL SUMMARY");
    println!("{}", "=".repeat(80));
    println!("Total runs: {}", results.len());
    println!("Passed: {}", results.len() - failed - skipped);
    println!("Skipped: {}", skipped);
    println!("Failed: {}", failed);
    println!("{}", "=".repeat(80));

    if failed > 0 {
        std::process::exit(1);
    }
}

#[cfg(feature = "gpu")]
fn gpu_results() -> Vec<ScenarioResult> {
    if !interop::gpu_available() {
        println!("No GPU adapter found, skipping wgpu runs");
        return Vec::new();
    }
    run_all(&mut reference_tests::GpuRig::default())
}

#[cfg(not(feature = "gpu"))]
fn gpu_results() -> Vec<ScenarioResult> {
    Vec::new()
}
