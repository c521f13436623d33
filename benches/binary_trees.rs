use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use nebula::{
    gcref::{GcRef, Member},
    heap::Heap,
    internal::{finalize_trait::FinalizeTrait, trace_trait::TraceTrait},
    stats_collector::{MarkingType, SweepingType},
    visitor::Visitor,
    Config,
};

struct TreeNode {
    left: Member<TreeNode>,
    right: Member<TreeNode>,
}

impl TraceTrait for TreeNode {
    fn trace(&self, vis: &mut Visitor) {
        self.left.trace(vis);
        self.right.trace(vis);
    }
}

impl FinalizeTrait<TreeNode> for TreeNode {}

impl TreeNode {
    fn item_check(&self) -> usize {
        match (self.left.get(), self.right.get()) {
            (Some(left), Some(right)) => 1 + left.item_check() + right.item_check(),
            _ => 1,
        }
    }
}

// Children are only referenced from the stack until the parent exists, so
// collections started by allocation scan the stack conservatively.
#[inline(never)]
fn bottom_up_tree(heap: &mut Heap, depth: usize) -> GcRef<TreeNode> {
    if depth > 0 {
        let right = bottom_up_tree(heap, depth - 1);
        let left = bottom_up_tree(heap, depth - 1);
        heap.allocate(TreeNode {
            left: Member::new(left),
            right: Member::new(right),
        })
    } else {
        heap.allocate(TreeNode {
            left: Member::null(),
            right: Member::null(),
        })
    }
}

fn run(heap: &mut Heap, min_depth: usize, max_depth: usize) {
    let mut depth = min_depth;
    while depth < max_depth {
        let iterations = 1 << (max_depth - depth + min_depth);
        for _ in 0..iterations {
            criterion::black_box(bottom_up_tree(heap, depth).item_check());
        }
        depth += 2;
    }
}

pub fn bench_gcs(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(10);
    let n = 12;
    let configs = [
        ("atomic", Config::default()),
        (
            "incremental",
            Config {
                marking_type: MarkingType::Incremental,
                sweeping_type: SweepingType::IncrementalAndConcurrent,
                ..Default::default()
            },
        ),
        (
            "concurrent",
            Config {
                marking_type: MarkingType::IncrementalAndConcurrent,
                sweeping_type: SweepingType::IncrementalAndConcurrent,
                ..Default::default()
            },
        ),
    ];

    for i in n..16 {
        let min_depth = 4;
        let max_depth = i.max(min_depth + 2);
        for (name, config) in configs.iter() {
            group.bench_function(BenchmarkId::new(*name, i), |b| {
                b.iter_batched_ref(
                    || Heap::new(*config),
                    |heap| run(heap, min_depth, max_depth),
                    criterion::BatchSize::LargeInput,
                );
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_gcs);
criterion_main!(benches);
