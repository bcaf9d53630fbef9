//! Benchmark suite for converge hot paths.
//!
//! This module provides performance benchmarks for:
//! - Best-of-N selection over growing result sets
//! - History window pushes with rolling-summary folding
//! - Stagnation detection
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//!
//! # Compare against baseline
//! cargo bench -- --baseline main
//! ```
//!
//! Criterion writes JSON estimates and HTML reports to `target/criterion/`.

use chrono::Utc;
use converge::engine::stop::is_stagnant;
use converge::history::{HistoryEntry, HistoryManager};
use converge::selector::select_best;
use converge::state::{AttemptId, AttemptResult, AttemptStatus};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::PathBuf;

// ============================================================================
// Selection Benchmarks
// ============================================================================

fn results(n: usize) -> Vec<AttemptResult> {
    let statuses = [
        AttemptStatus::Converged,
        AttemptStatus::BudgetExhausted,
        AttemptStatus::Stagnant,
        AttemptStatus::Failed,
    ];
    (1..=n)
        .map(|i| AttemptResult {
            attempt_id: AttemptId::from_index(i),
            strategy: "direct".to_string(),
            // Plenty of exact ties so every ranking key gets exercised
            final_score: (i % 7) as f64 / 7.0,
            iterations_run: (i % 5) as u32 + 1,
            status: statuses[i % statuses.len()],
            artifact_path: PathBuf::from("attempts"),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            failure: None,
            worker_id: Some(i % 4),
            restart_worker: false,
        })
        .collect()
}

/// Measures `select_best` as the number of attempts grows.
fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection");

    for size in [3, 16, 128] {
        let input = results(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("select_best", size), &input, |b, input| {
            b.iter(|| select_best(black_box(input)))
        });
    }

    group.finish();
}

// ============================================================================
// History Benchmarks
// ============================================================================

fn entries(n: u32) -> Vec<HistoryEntry> {
    let issues = vec![
        "The cube is too small".to_string(),
        "Wrong material on the table".to_string(),
        "Lighting too flat".to_string(),
    ];
    (1..=n)
        .map(|i| {
            let plan = format!("Scale the cube by {i}%\nThen adjust the lighting rig.");
            HistoryEntry::new(i, &plan, f64::from(i % 10) / 10.0, &issues)
        })
        .collect()
}

/// Measures pushing a long run through a small window, which folds every
/// evicted entry into the rolling summary.
fn bench_history_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("history");

    for iterations in [10u32, 100, 1000] {
        let input = entries(iterations);
        group.throughput(Throughput::Elements(u64::from(iterations)));
        group.bench_with_input(
            BenchmarkId::new("push_and_fold", iterations),
            &input,
            |b, input| {
                b.iter(|| {
                    let mut history = HistoryManager::new(5);
                    for entry in input {
                        history.push(entry.clone());
                    }
                    black_box(history.render())
                })
            },
        );
    }

    group.finish();
}

/// Measures the stagnation check on the scores a window exposes.
fn bench_stagnation(c: &mut Criterion) {
    let scores: Vec<f64> = (0..50).map(|i| 0.4 + f64::from(i % 3) * 0.005).collect();

    c.bench_function("is_stagnant_window_5", |b| {
        b.iter(|| is_stagnant(black_box(&scores), 5, 0.02))
    });
}

criterion_group!(benches, bench_selection, bench_history_fold, bench_stagnation);
criterion_main!(benches);
