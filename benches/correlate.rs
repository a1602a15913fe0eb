use criterion::{criterion_group, criterion_main, Criterion};
use streamview_core::signalling::correlator::{Correlator, RequestKey};
use streamview_core::signalling::SignalMessage;

fn bench_correlator(c: &mut Criterion) {
    let correlator = Correlator::new();

    c.bench_function("register_and_complete_session", |b| {
        b.iter(|| {
            let key = RequestKey::Session {
                consumer_id: "A1".to_string(),
                stream_id: "p1".to_string(),
            };
            let (rx, _) = correlator.register(key);
            let handled = correlator.complete(SignalMessage::SessionGranted {
                consumer_id: "A1".to_string(),
                stream_id: "p1".to_string(),
                session_id: "S1".to_string(),
            });
            assert!(handled);
            drop(rx);
        })
    });

    c.bench_function("parse_session_granted", |b| {
        let raw = r#"{"type":"session_granted","consumer_id":"A1","stream_id":"p1","session_id":"S1"}"#;
        b.iter(|| SignalMessage::from_json(raw).unwrap())
    });
}

criterion_group!(benches, bench_correlator);
criterion_main!(benches);
