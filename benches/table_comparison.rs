use core::hash::Hash;
use core::hash::Hasher;
use core::hint::black_box;

use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;
use criterion::Throughput;
use hashbrown::hash_table::Entry as HashbrownEntry;
use hashbrown::hash_table::HashTable as HashbrownHashTable;
use rh_hash::HashTable;
use siphasher::sip::SipHasher;

#[derive(Clone, Debug, PartialEq, Eq)]
struct TestItem {
    key: String,
    value: u64,
}

impl TestItem {
    fn new(key: u64) -> Self {
        black_box(Self {
            key: format!("key_{}", key),
            value: key,
        })
    }
}

const SIZES: &[usize] = &[
    ((1 << 10) as f32 * 0.80) as usize,
    ((1 << 15) as f32 * 0.80) as usize,
    ((1 << 19) as f32 * 0.80) as usize,
];

fn hash_key(key: &str) -> u64 {
    let mut hasher = SipHasher::new();
    key.hash(&mut hasher);
    black_box(hasher.finish())
}

fn prepared_items(size: usize) -> Vec<(u64, TestItem)> {
    (0..size)
        .map(|i| {
            let item = TestItem::new(i as u64);
            let hash = hash_key(&item.key);
            (hash, item)
        })
        .collect()
}

fn bench_insert_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_sequential");

    for size in SIZES.iter() {
        let hash_and_item = prepared_items(*size);
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_function(format!("rh_hash/{}", size), |b| {
            b.iter(|| {
                let mut table: HashTable<TestItem> = HashTable::new().unwrap();
                for (hash, item) in hash_and_item.iter().cloned() {
                    let key = item.key.clone();
                    table
                        .add(hash as u32, |v| v.key == key, item)
                        .unwrap();
                }
                black_box(table)
            })
        });

        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                let mut table = HashbrownHashTable::<TestItem>::with_capacity(0);
                for (hash, item) in hash_and_item.iter().cloned() {
                    match table.entry(hash, |v| v.key == item.key, |v| hash_key(&v.key)) {
                        HashbrownEntry::Vacant(entry) => {
                            black_box(entry.insert(item));
                        }
                        HashbrownEntry::Occupied(_) => unreachable!(),
                    }
                }
                black_box(table)
            })
        });
    }

    group.finish();
}

fn bench_lookup_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");

    for size in SIZES.iter() {
        let hash_and_item = prepared_items(*size);
        group.throughput(Throughput::Elements(*size as u64));

        let mut rh_table: HashTable<TestItem> = HashTable::new().unwrap();
        let mut hb_table = HashbrownHashTable::<TestItem>::with_capacity(0);
        for (hash, item) in hash_and_item.iter().cloned() {
            let key = item.key.clone();
            rh_table
                .add(hash as u32, |v| v.key == key, item.clone())
                .unwrap();
            match hb_table.entry(hash, |v| v.key == item.key, |v| hash_key(&v.key)) {
                HashbrownEntry::Vacant(entry) => {
                    entry.insert(item);
                }
                HashbrownEntry::Occupied(_) => unreachable!(),
            }
        }

        group.bench_function(format!("rh_hash/{}", size), |b| {
            b.iter(|| {
                for (hash, item) in hash_and_item.iter() {
                    let found = rh_table.find(*hash as u32, |v| v.key == item.key);
                    black_box(found);
                }
            })
        });

        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                for (hash, item) in hash_and_item.iter() {
                    let found = hb_table.find(*hash, |v| v.key == item.key);
                    black_box(found);
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert_sequential, bench_lookup_hit);
criterion_main!(benches);
