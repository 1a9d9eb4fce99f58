use criterion::{black_box, criterion_group, criterion_main, Criterion};

use std::collections::HashMap;

use atelier_collab::awareness::{CursorPosition, PeerState, UserInfo};
use atelier_collab::document::SharedDocument;
use atelier_collab::editor::TextModel;
use atelier_collab::presence::build_stylesheet;
use atelier_collab::protocol::SyncMessage;

fn bench_update_encode(c: &mut Criterion) {
    let update = vec![0u8; 64]; // typical small update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(
                black_box(7),
                black_box("project-p1-f1"),
                black_box(update.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = SyncMessage::update(7, "project-p1-f1", vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_large_update_compression(c: &mut Criterion) {
    // Compressible payload above the LZ4 threshold.
    let update = vec![42u8; 16 * 1024];

    c.bench_function("update_encode_16K_compressed", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(7, "project-p1-f1", black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_document_set_text_append(c: &mut Criterion) {
    let document = SharedDocument::new("bench").unwrap();
    let base: String = "fn main() { println!(\"hello\"); }\n".repeat(100);
    document.set_text(&base);

    c.bench_function("document_set_text_append_line", |b| {
        let mut content = base.clone();
        b.iter(|| {
            content.push_str("// typed\n");
            document.set_text(black_box(&content));
        })
    });
}

fn bench_model_set_value(c: &mut Criterion) {
    let model = TextModel::new("bench", "", "rust");

    c.bench_function("model_set_value_1K", |b| {
        let mut tick = 0u64;
        b.iter(|| {
            tick += 1;
            let value = format!("{}{}", "x".repeat(1024), tick);
            model.set_value(black_box(&value));
        })
    });
}

fn bench_stylesheet_100_peers(c: &mut Criterion) {
    let mut states = HashMap::new();
    for i in 0..100u64 {
        states.insert(
            i,
            PeerState {
                user: UserInfo {
                    name: format!("Peer{i}"),
                    color: "12ab34".into(),
                    email: format!("peer{i}@example.com"),
                },
                active_file: Some("f1".into()),
                cursor: Some(CursorPosition { line: 0, column: 0 }),
            },
        );
    }

    c.bench_function("stylesheet_100_peers", |b| {
        b.iter(|| {
            black_box(build_stylesheet(
                black_box(&states),
                "me@example.com",
                "f1",
            ));
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_large_update_compression,
    bench_document_set_text_append,
    bench_model_set_value,
    bench_stylesheet_100_peers,
);
criterion_main!(benches);
