use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use manio::{Fingerprint, HookRecord, ManifestOptions, ManifestReader, ManifestWriter, StreamEntry};
use tempfile::tempdir;

const ENTRIES: u64 = 1_000;
const SIGS_PER_ENTRY: u64 = 8;

fn write_entries(w: &mut ManifestWriter) {
    for i in 0..ENTRIES {
        let path = format!("dir/file{:06}", i);
        w.write_entry(&StreamEntry::new(path.as_bytes(), vec![b'a'; 32]))
            .unwrap();
        let mut hook = HookRecord::new(path.into_bytes());
        for j in 0..SIGS_PER_ENTRY {
            let fp = Fingerprint::from_u64((i * SIGS_PER_ENTRY + j).wrapping_mul(0x9E37_79B9));
            w.write_signature(&fp).unwrap();
            hook.push(&fp).unwrap();
        }
        w.write_hook(hook).unwrap();
    }
}

fn manifest_write(c: &mut Criterion, name: &str, entries_per_chunk: usize) {
    c.bench_function(name, |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let options = ManifestOptions {
                    entries_per_chunk,
                    sync: false,
                };
                let w = ManifestWriter::create(dir.path().join("manifest"), options).unwrap();
                (dir, w)
            },
            |(_dir, mut w)| {
                write_entries(&mut w);
                w.set_read_mode().unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn manifest_write_per_entry_chunks(c: &mut Criterion) {
    manifest_write(c, "manifest_write_1k_chunk_per_entry", 1);
}

fn manifest_write_large_chunks(c: &mut Criterion) {
    manifest_write(c, "manifest_write_1k_chunk_256", 256);
}

fn manifest_read(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let options = ManifestOptions {
        entries_per_chunk: 64,
        sync: false,
    };
    let mut w = ManifestWriter::create(dir.path().join("manifest"), options).unwrap();
    write_entries(&mut w);
    let summary = w.set_read_mode().unwrap();

    c.bench_function("manifest_read_1k", |b| {
        b.iter(|| {
            let mut r: ManifestReader = summary.open_reader();
            let entries = r.collect_entries().unwrap();
            assert_eq!(entries.len() as u64, ENTRIES);
        });
    });
}

criterion_group!(
    benches,
    manifest_write_per_entry_chunks,
    manifest_write_large_chunks,
    manifest_read
);
criterion_main!(benches);
