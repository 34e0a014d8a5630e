use criterion::{Criterion, black_box, criterion_group, criterion_main};
use medguard_core::config::AggregationConfig;
use medguard_core::providers::LocalEmbedder;
use medguard_core::text::split_sentences;
use medguard_safety::aggregate::{SignalScores, aggregate};
use medguard_safety::attribution::sentence_scores;
use medguard_safety::consistency::{mean_off_diagonal, similarity_matrix};
use medguard_safety::entropy::{cluster_answers, shannon_entropy};

const TRIALS: &[&str] = &[
    "Amoxicillin is first-line therapy for community-acquired pneumonia in healthy adults.",
    "For healthy adults with community-acquired pneumonia, amoxicillin is the first-line choice.",
    "Doxycycline is an alternative for penicillin-allergic patients with pneumonia.",
    "A macrolide may be used where pneumococcal resistance is low.",
    "Amoxicillin remains first-line for outpatient community-acquired pneumonia.",
    "Ceftriaxone plus azithromycin is recommended for hospitalized patients.",
    "Supportive care alone is sufficient for most viral pneumonias.",
    "Amoxicillin is the recommended first-line antibiotic for pneumonia in adults.",
];

fn trial_vectors(embedder: &LocalEmbedder) -> (Vec<String>, Vec<Option<Vec<f32>>>) {
    let answers: Vec<String> = TRIALS.iter().map(|s| s.to_string()).collect();
    let vectors = answers
        .iter()
        .map(|a| Some(embedder.embed_text(a)))
        .collect();
    (answers, vectors)
}

fn bench_entropy(c: &mut Criterion) {
    let embedder = LocalEmbedder::new(384);
    let (answers, vectors) = trial_vectors(&embedder);

    c.bench_function("cluster_answers_8_trials", |b| {
        b.iter(|| cluster_answers(black_box(&answers), black_box(&vectors), 0.85))
    });

    let counts = vec![3usize, 2, 1, 1, 1];
    c.bench_function("shannon_entropy_5_clusters", |b| {
        b.iter(|| shannon_entropy(black_box(&counts)))
    });
}

fn bench_consistency(c: &mut Criterion) {
    let embedder = LocalEmbedder::new(384);
    let (answers, vectors) = trial_vectors(&embedder);

    c.bench_function("similarity_matrix_8_trials", |b| {
        b.iter(|| {
            let m = similarity_matrix(black_box(&answers), black_box(&vectors));
            mean_off_diagonal(&m)
        })
    });
}

fn bench_attribution(c: &mut Criterion) {
    let embedder = LocalEmbedder::new(384);
    let answer = TRIALS.join(" ");
    let sentences: Vec<Option<Vec<f32>>> = split_sentences(&answer)
        .iter()
        .map(|s| Some(embedder.embed_text(s)))
        .collect();
    let chunks: Vec<Vec<f32>> = TRIALS.iter().map(|t| embedder.embed_text(t)).collect();

    c.bench_function("sentence_scores_8x8", |b| {
        b.iter(|| sentence_scores(black_box(&sentences), black_box(&chunks)))
    });

    c.bench_function("local_embed_sentence", |b| {
        b.iter(|| embedder.embed_text(black_box(TRIALS[0])))
    });
}

fn bench_aggregation(c: &mut Criterion) {
    let config = AggregationConfig::default();
    let full = SignalScores {
        attribution: Some(0.82),
        consistency: Some(0.91),
        entropy: Some(0.67),
        external: Some(0.55),
    };
    let partial = SignalScores {
        external: None,
        ..full
    };

    c.bench_function("aggregate_four_signals", |b| {
        b.iter(|| aggregate(black_box(&full), black_box(&config)))
    });

    c.bench_function("aggregate_without_external", |b| {
        b.iter(|| aggregate(black_box(&partial), black_box(&config)))
    });
}

criterion_group!(
    benches,
    bench_entropy,
    bench_consistency,
    bench_attribution,
    bench_aggregation
);
criterion_main!(benches);
