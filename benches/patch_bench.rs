use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fuzzpatch::{parse_patch, FileDiffResult, PatchConfig};
use indoc::indoc;

const SMALL_DIFF: &str = indoc! {"
    --- a/greeting.txt
    +++ b/greeting.txt
    @@ -1,3 +1,3 @@
     hello
    -world
    +there
     goodbye
"};

/// Builds a unified diff with `hunks` well-spaced hunks over a numbered
/// file, plus the matching target content.
fn generate_large_input(hunks: usize) -> (String, String) {
    let lines_per_hunk = 10;
    let total_lines = hunks * lines_per_hunk;
    let mut target = String::new();
    for i in 0..total_lines {
        target.push_str(&format!("line number {}\n", i));
    }

    let mut diff = String::from("--- a/big.txt\n+++ b/big.txt\n");
    for h in 0..hunks {
        let start = h * lines_per_hunk + 1;
        diff.push_str(&format!("@@ -{},3 +{},3 @@\n", start, start));
        diff.push_str(&format!(" line number {}\n", start - 1));
        diff.push_str(&format!("-line number {}\n", start));
        diff.push_str(&format!("+LINE NUMBER {}\n", start));
        diff.push_str(&format!(" line number {}\n", start + 1));
    }
    (diff, target)
}

fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Parsing");
    let (large_diff, _) = generate_large_input(100);

    group.bench_function("small unified diff", |b| {
        b.iter(|| parse_patch(black_box(SMALL_DIFF)))
    });
    group.bench_function("large unified diff (100 hunks)", |b| {
        b.iter(|| parse_patch(black_box(&large_diff)))
    });
    group.finish();
}

fn bench_application(c: &mut Criterion) {
    let mut group = c.benchmark_group("Application");
    let (large_diff, target) = generate_large_input(100);
    let set = parse_patch(&large_diff);
    let exact = PatchConfig::default();
    let fuzzy = PatchConfig::builder().fuzz(2).build();

    group.bench_function("apply 100 hunks at fuzz 0", |b| {
        b.iter(|| {
            let mut result = FileDiffResult::new(&set.diffs[0], &exact);
            result.refresh(Some(black_box(&target)));
            black_box(result.has_matches())
        })
    });

    // Drift the target so every hunk needs the fuzz search to run.
    let drifted = target.replacen("line number 0\n", "LINE 0\n", 1);
    group.bench_function("apply 100 hunks with fuzz ceiling 2", |b| {
        b.iter(|| {
            let mut result = FileDiffResult::new(&set.diffs[0], &fuzzy);
            result.refresh(Some(black_box(&drifted)));
            black_box(result.has_matches())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_parsing, bench_application);
criterion_main!(benches);
