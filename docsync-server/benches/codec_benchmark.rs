use std::collections::BTreeMap;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use docsync_core::{ChangeEvent, Document, Model, SetterId, Value};
use docsync_server::{encode_event, Fragment, Message, Receiver};

fn document_with_source(rows: usize) -> Document {
    let mut doc = Document::new();
    let mut columns = BTreeMap::new();
    columns.insert(
        "x".to_string(),
        Value::List((0..rows).map(|i| Value::Float(i as f64)).collect()),
    );
    doc.add_root(
        Model::with_id("source", "ColumnDataSource").with("data", Value::Map(columns)),
        None,
    )
    .unwrap();
    doc.add_root(Model::with_id("slider", "Slider").with("value", 0i64), None)
        .unwrap();
    doc
}

fn property_event() -> ChangeEvent {
    ChangeEvent::ModelChanged {
        model: "slider".into(),
        attr: "value".to_string(),
        old: Value::Int(0),
        new: Value::Int(42),
        setter: Some(SetterId::next()),
    }
}

fn stream_event(rows: usize) -> ChangeEvent {
    let mut data = BTreeMap::new();
    data.insert("x".to_string(), (0..rows).map(|i| Value::Float(i as f64 * 0.5)).collect());
    ChangeEvent::ColumnsStreamed {
        source: "source".into(),
        data,
        rollover: Some(10_000),
        setter: None,
    }
}

fn reassemble(fragments: &[Fragment]) -> Message {
    let mut receiver = Receiver::new();
    let mut out = None;
    for fragment in fragments {
        if let Some(message) = receiver.consume(fragment.clone()).unwrap() {
            out = Some(message);
        }
    }
    out.unwrap()
}

fn bench_property_encode(c: &mut Criterion) {
    let doc = document_with_source(0);
    let event = property_event();

    c.bench_function("patch_encode_property", |b| {
        b.iter(|| {
            let message = encode_event(black_box(&doc), black_box(&event)).unwrap();
            black_box(message.to_fragments().unwrap());
        })
    });
}

fn bench_stream_encode(c: &mut Criterion) {
    let doc = document_with_source(0);
    let event = stream_event(1_000);

    c.bench_function("patch_encode_stream_1k", |b| {
        b.iter(|| {
            let message = encode_event(black_box(&doc), black_box(&event)).unwrap();
            black_box(message.to_fragments().unwrap());
        })
    });
}

fn bench_reassemble(c: &mut Criterion) {
    let doc = document_with_source(0);
    let fragments = encode_event(&doc, &stream_event(1_000))
        .unwrap()
        .to_fragments()
        .unwrap();

    c.bench_function("receiver_reassemble_stream_1k", |b| {
        b.iter(|| black_box(reassemble(black_box(&fragments))))
    });
}

fn bench_apply_stream(c: &mut Criterion) {
    let origin = document_with_source(0);
    let message = encode_event(&origin, &stream_event(1_000)).unwrap();

    c.bench_function("patch_apply_stream_1k", |b| {
        b.iter(|| {
            let mut replica = document_with_source(0);
            message.apply_to(&mut replica, None).unwrap();
            black_box(replica.model_count());
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let doc = document_with_source(10_000);

    c.bench_function("snapshot_10k_rows", |b| {
        b.iter(|| {
            let message = Message::push_doc(black_box(&doc).to_snapshot());
            black_box(message.to_fragments().unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_property_encode,
    bench_stream_encode,
    bench_reassemble,
    bench_apply_stream,
    bench_snapshot,
);
criterion_main!(benches);
