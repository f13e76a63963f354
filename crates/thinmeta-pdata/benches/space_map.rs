use std::rc::Rc;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use thinmeta_block::{BlockManager, MemoryIo};
use thinmeta_pdata::space_map::{create_disk_sm, CarefulAllocSpaceMap, CoreSpaceMap, SpaceMap};
use thinmeta_pdata::txn::TransactionManager;

const NR_BLOCKS: u64 = 16 * 1024;

fn bench_core(c: &mut Criterion) {
    c.bench_function("core_alloc_all", |b| {
        b.iter_batched(
            || CoreSpaceMap::new(NR_BLOCKS),
            |sm| {
                while let Some(blk) = sm.new_block().unwrap() {
                    std::hint::black_box(blk);
                }
            },
            BatchSize::SmallInput,
        );
    });

    c.bench_function("core_inc_dec", |b| {
        let sm = CoreSpaceMap::new(NR_BLOCKS);
        b.iter(|| {
            for blk in 0..1024 {
                sm.inc(blk).unwrap();
            }
            for blk in 0..1024 {
                sm.dec(blk).unwrap();
            }
        });
    });
}

fn bench_disk(c: &mut Criterion) {
    c.bench_function("disk_set_counts", |b| {
        b.iter_batched(
            || {
                let io = Arc::new(MemoryIo::new(1024).unwrap());
                let bm = Arc::new(BlockManager::new(io));
                let sm: Rc<dyn SpaceMap> =
                    Rc::new(CarefulAllocSpaceMap::new(CoreSpaceMap::new(1024)));
                let tm = TransactionManager::new(bm, sm);
                create_disk_sm(tm, NR_BLOCKS).unwrap()
            },
            |sm| {
                for blk in 0..512 {
                    sm.set_count(blk, (blk % 7) as u32).unwrap();
                }
                sm.commit().unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_core, bench_disk);
criterion_main!(benches);
