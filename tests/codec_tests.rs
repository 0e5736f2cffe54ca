//! Seeded randomized coverage for the XOR chunk codec and its persisted form.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use kvtsdb::encoding::{decode_all, from_u64_words, to_u64_words, ChunkMeta, XorChunk};
use kvtsdb::{Sample, TsdbError};

const SEED: u64 = 0x_4B56_5453_4442_5453;

fn random_series(rng: &mut ChaCha8Rng, len: usize) -> Vec<Sample> {
    let mut t = rng.random_range(0..1_000_000_000i64);
    let mut v = rng.random::<f64>() * 100.0;
    (0..len)
        .map(|_| {
            // regular steps mixed with tiny and large gaps
            t += match rng.random_range(0..10) {
                0 => rng.random_range(1..5),
                1 => rng.random_range(100_000..10_000_000),
                _ => 10_000,
            };
            v = match rng.random_range(0..5) {
                0 => v,
                1 => -v,
                2 => rng.random::<f64>() * 1e12,
                _ => v + rng.random_range(-1.0..1.0),
            };
            Sample::new(t, v)
        })
        .collect()
}

fn encode(samples: &[Sample]) -> XorChunk {
    let mut app = XorChunk::new().appender().expect("appender");
    for s in samples {
        app.append(s.t, s.v).expect("append");
    }
    app.into_chunk()
}

#[test]
fn random_series_round_trip_bit_exact() {
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    for round in 0..50 {
        let len = rng.random_range(1..400);
        let samples = random_series(&mut rng, len);
        let chunk = encode(&samples);
        let decoded = decode_all(&chunk).expect("decode");
        assert_eq!(decoded.len(), samples.len(), "round {}", round);
        for (a, b) in decoded.iter().zip(&samples) {
            assert_eq!(a.t, b.t, "round {}", round);
            assert_eq!(a.v.to_bits(), b.v.to_bits(), "round {}", round);
        }
    }
}

#[test]
fn persisted_words_restore_and_keep_appending() {
    let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ 1);
    let samples = random_series(&mut rng, 300);
    let (head, tail) = samples.split_at(120);

    let chunk = encode(head);
    let (meta, _, bytes) = chunk.get_chunk_buffer();
    let words = to_u64_words(bytes);
    let restored_bytes = from_u64_words(&words, ChunkMeta::unpack(meta).length as usize).expect("unpack words");
    let restored = XorChunk::from_buffer(meta, &restored_bytes).expect("restore");

    let mut app = restored.appender().expect("resume");
    for s in tail {
        app.append(s.t, s.v).expect("append after restore");
    }
    assert_eq!(decode_all(app.chunk()).expect("decode"), samples);
}

#[test]
fn incremental_tails_concatenate_to_full_buffer() {
    let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ 2);
    let samples = random_series(&mut rng, 200);
    let mut app = XorChunk::new().appender().expect("appender");
    let mut shipped: Vec<u8> = Vec::new();

    for batch in samples.chunks(17) {
        for s in batch {
            app.append(s.t, s.v).expect("append");
        }
        let (_, offset, tail) = app.chunk().get_chunk_buffer();
        shipped.truncate(offset);
        shipped.extend_from_slice(tail);
        let len = app.chunk().bytes().len();
        // keep the last, possibly partial, word for the next round
        let marker = (len - 1) / 8 * 8;
        app.chunk_mut().move_offset(marker).expect("commit");
    }
    assert_eq!(shipped, app.chunk().bytes());
}

#[test]
fn malformed_meta_word_is_rejected() {
    let chunk = encode(&[Sample::new(1, 1.0), Sample::new(2, 2.0)]);
    let mut meta = ChunkMeta::unpack(chunk.get_chunk_buffer().0);
    meta.encoding = 9;
    let err = XorChunk::from_buffer(meta.pack(), chunk.bytes()).unwrap_err();
    assert!(matches!(err, TsdbError::UnknownEncoding(9)));

    let short = XorChunk::from_buffer(chunk.get_chunk_buffer().0, &chunk.bytes()[..1]);
    assert!(short.is_err());
}
