#![allow(missing_docs)]

mod support;

use std::collections::BTreeMap;

use pagestore::{PageAccess, PageId, PageStore, PageUpdate, Result, Transaction};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use support::{commit_and_finalize, init_tracing, options};
use tempfile::tempdir;

const PAGES: u8 = 6;
const ROUNDS: u64 = 300;

type Model = BTreeMap<PageId, Vec<u8>>;

struct Reader {
    txn: Transaction,
    snapshot: Model,
}

fn random_updates(rng: &mut ChaCha8Rng, pages: &[PageId], page_size: usize) -> Vec<PageUpdate> {
    let count = rng.gen_range(1..=4);
    (0..count)
        .map(|n| {
            let page = pages[rng.gen_range(0..pages.len())];
            let len = rng.gen_range(1..=16);
            let offset = rng.gen_range(0..=page_size - len);
            let mut data = vec![0u8; len];
            rng.fill(&mut data[..]);
            PageUpdate::new(page, offset as u32, n + 1, data)
        })
        .collect()
}

fn check_readers(store: &PageStore, readers: &[Reader]) -> Result<()> {
    for reader in readers {
        for (page, expected) in &reader.snapshot {
            let seen = store.get(Some(&reader.txn), *page)?;
            assert_eq!(
                seen.data(),
                expected.as_slice(),
                "reader {:?} saw a newer version of {page:?}",
                reader.txn.id
            );
        }
    }
    Ok(())
}

#[test]
fn random_transactions_match_a_simple_model() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let options = options(dir.path()).with_page_idle_sweeps(1);
    let page_size = options.page_size;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_0f_9a9e);

    let mut model = Model::new();
    {
        let store = PageStore::open(options.clone())?;
        let first = store.allocate_run(PAGES)?;
        let pages: Vec<PageId> = (0..u64::from(PAGES)).map(|n| PageId(first.0 + n)).collect();
        for page in &pages {
            model.insert(*page, vec![0; page_size]);
        }
        let mut readers: Vec<Reader> = Vec::new();

        for round in 1..=ROUNDS {
            let begin = store.cache().current_version().0;
            let txn = Transaction::new(round, begin).with_commit_version(begin + 1);
            store.begin_transaction(&txn, None)?;

            let updates = random_updates(&mut rng, &pages, page_size);
            let mut staged = model.clone();
            for update in &updates {
                let bytes = staged.get_mut(&update.page_id).expect("modelled page");
                let start = update.offset as usize;
                bytes[start..start + update.data.len()].copy_from_slice(&update.data);
            }
            store.update(Some(&txn), updates)?;
            for page in &pages {
                assert_eq!(store.get(Some(&txn), *page)?.data(), staged[page].as_slice());
            }

            if rng.gen_bool(0.75) {
                commit_and_finalize(&store, &txn)?;
                model = staged;
            } else {
                store.rollback_transaction(&txn)?;
            }

            if rng.gen_bool(0.1) {
                let begin = store.cache().current_version().0;
                let reader = Transaction::new(1_000_000 + round, begin);
                store.begin_transaction(&reader, None)?;
                readers.push(Reader {
                    txn: reader,
                    snapshot: model.clone(),
                });
            }
            if !readers.is_empty() && rng.gen_bool(0.08) {
                let retired = readers.swap_remove(rng.gen_range(0..readers.len()));
                store.rollback_transaction(&retired.txn)?;
            }
            if round % 20 == 0 {
                store.cache().sweep_now()?;
            }

            check_readers(&store, &readers)?;
            for page in &pages {
                assert_eq!(store.get(None, *page)?.data(), model[page].as_slice());
            }
        }

        for reader in readers.drain(..) {
            store.rollback_transaction(&reader.txn)?;
        }
        store.cache().sweep_now()?;
        let stats = store.stats();
        assert_eq!(stats.transaction_heads, 0);
        assert_eq!(stats.version_heads, 1);
        assert_eq!(stats.page_versions, stats.page_heads);
    }

    let store = PageStore::open(options)?;
    assert_eq!(store.recovery_report().rolled_forward, 0);
    for (page, expected) in &model {
        assert_eq!(store.get(None, *page)?.data(), expected.as_slice());
        assert_eq!(
            store.cache().fileset().read_page(*page)?.data(),
            expected.as_slice()
        );
    }
    Ok(())
}
