use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use lexfield::atoms::field_types::{DecayConfig, LedgerConfig, ThemeConfig};
use lexfield::engine::ledger::Ledger;
use lexfield::engine::themes::ThemeBuilder;
use lexfield::engine::tokenizer::tokenize;
use lexfield::{Field, FieldConfig, GenerateParams};
use tokio::runtime::Runtime;

const CORPUS: &str = "the river runs past the old mill and the mill wheel turns. \
    water finds the lowest path! stones remember the river. \
    the wheel turns slowly when the water is low, and quickly when the rain comes.";

fn corpus_ledger(repeats: usize) -> Ledger {
    let config = LedgerConfig::default();
    let tokens = tokenize(CORPUS);
    let mut ledger = Ledger::new();
    for _ in 0..repeats {
        ledger.ingest(&tokens, &config);
    }
    ledger
}

fn bench_tokenize(c: &mut Criterion) {
    c.bench_function("tokenize", |b| b.iter(|| tokenize(black_box(CORPUS))));
}

fn bench_ledger_ingest(c: &mut Criterion) {
    let tokens = tokenize(CORPUS);
    let config = LedgerConfig::default();
    let mut group = c.benchmark_group("ledger_ingest");
    for size in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || corpus_ledger(size),
                |mut ledger| ledger.ingest(black_box(&tokens), &config),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_decay(c: &mut Criterion) {
    let config = DecayConfig::default();
    c.bench_function("ledger_decay", |b| {
        b.iter_batched(|| corpus_ledger(50), |mut ledger| ledger.decay(&config), BatchSize::SmallInput)
    });
}

fn bench_theme_rebuild(c: &mut Criterion) {
    let ledger = corpus_ledger(20);
    let config = ThemeConfig::default();
    c.bench_function("theme_rebuild", |b| {
        b.iter(|| ThemeBuilder::new(&config).rebuild(black_box(&ledger), 1))
    });
}

fn bench_generate(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let field = rt.block_on(async {
        let field = Field::open(FieldConfig { seed: Some(1), ..Default::default() }).await.unwrap();
        for _ in 0..20 {
            field.ingest(CORPUS).await.unwrap();
        }
        field
    });
    let params = GenerateParams::default();
    c.bench_function("field_generate", |b| {
        b.iter(|| rt.block_on(field.generate(black_box("where does the river go?"), &params)))
    });
}

criterion_group!(
    benches,
    bench_tokenize,
    bench_ledger_ingest,
    bench_decay,
    bench_theme_rebuild,
    bench_generate
);
criterion_main!(benches);
