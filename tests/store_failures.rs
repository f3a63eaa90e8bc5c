// Round steps against a store that refuses writes on demand: a failed save
// must leave the previous state intact and the control usable.
mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use common::{image_url_for, Harness, Script};
use evolv::error::{Error, Result};
use evolv::round::{Phase, ERROR_LABEL};
use evolv::store::{KvStore, MemoryStore};
use evolv::voting::{Candidate, VoteOutcome};

const TEXT_A: &str = "make the circle red";
const TEXT_B: &str = "make the circle a square";

#[derive(Debug, Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_writes: Arc<AtomicBool>,
}

impl FlakyStore {
    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Store(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
                Some("disk full".into()),
            )));
        }
        Ok(())
    }
}

impl KvStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.remove(key)
    }

    fn set_many(&mut self, writes: &[(String, Option<String>)]) -> Result<()> {
        self.check()?;
        self.inner.set_many(writes)
    }

    fn clear(&mut self) -> Result<()> {
        self.check()?;
        self.inner.clear()
    }
}

fn flaky(script: Script) -> (Harness<FlakyStore>, Arc<AtomicBool>) {
    let store = FlakyStore::default();
    let fail = Arc::clone(&store.fail_writes);
    (Harness::with_kv(script, store), fail)
}

#[test]
fn variant_save_failure_offers_retry() {
    let (mut h, fail) = flaky(Script::default());
    fail.store(true, Ordering::SeqCst);

    assert!(h.machine.start_variants());
    let err = h.try_pump(h.at(0)).unwrap_err();
    assert_matches!(err, Error::Store(_));

    assert_eq!(h.machine.phase(), Phase::Idle);
    let start = &h.machine.controls().start;
    assert_eq!(start.label, ERROR_LABEL);
    assert!(start.enabled);
    assert_eq!(h.machine.round().text(Candidate::A), None);
    assert_eq!(h.machine.store().text(Candidate::A), None);
    assert!(!h.machine.controls().images.visible);

    fail.store(false, Ordering::SeqCst);
    assert!(h.machine.start_variants());
    h.pump(h.at(0));
    assert_eq!(h.machine.phase(), Phase::VariantsReady);
    assert_eq!(h.machine.store().text(Candidate::B).as_deref(), Some(TEXT_B));
}

#[test]
fn image_save_failure_leaves_no_partial_round() {
    let (mut h, fail) = flaky(Script::default());
    h.to_variants_ready();
    fail.store(true, Ordering::SeqCst);

    assert!(h.machine.start_images().unwrap());
    let err = h.try_pump(h.at(0)).unwrap_err();
    assert_matches!(err, Error::Store(_));

    assert_eq!(h.machine.phase(), Phase::VariantsReady);
    let images = &h.machine.controls().images;
    assert_eq!(images.label, ERROR_LABEL);
    assert!(images.enabled);
    assert!(!h.machine.controls().voting_visible);
    assert!(h.machine.prompt_history().is_empty());
    assert!(h.machine.store().image(Candidate::A).is_none());
    assert!(h.machine.store().reflection().is_none());
    assert!(h.machine.round().image(Candidate::A).is_none());
    assert!(!h.machine.is_polling());

    fail.store(false, Ordering::SeqCst);
    assert!(h.machine.start_images().unwrap());
    h.pump(h.at(0));
    assert_eq!(h.machine.phase(), Phase::Voting);
    assert_eq!(h.machine.prompt_history().len(), 2);
}

#[test]
fn winning_vote_save_failure_keeps_voting_open() {
    let (mut h, fail) = flaky(Script {
        instruction_count: 10,
        ..Script::default()
    });
    h.to_voting();
    let now = h.at(0);
    h.machine.vote(Candidate::A, now).unwrap();
    h.machine.vote(Candidate::A, now).unwrap();

    fail.store(true, Ordering::SeqCst);
    let err = h.machine.vote(Candidate::A, now).unwrap_err();
    assert_matches!(err, Error::Store(_));

    assert_eq!(h.machine.phase(), Phase::Voting);
    assert_eq!(h.machine.tally().get(Candidate::A), 2);
    assert_eq!(h.machine.tally().winner(), None);
    assert!(h.machine.history().is_empty());
    assert_eq!(h.machine.current_image(), "CircleStart.png");
    assert!(h.machine.announcement().is_none());
    // the loser's instruction is only retired once the promotion is saved
    h.pump(now);
    assert!(h.backend.calls().removed.is_empty());

    fail.store(false, Ordering::SeqCst);
    assert_matches!(
        h.machine.vote(Candidate::A, now).unwrap(),
        VoteOutcome::Won {
            candidate: Candidate::A,
            votes: 3
        }
    );
    assert_eq!(h.machine.current_image(), image_url_for(TEXT_A));
    assert_eq!(h.machine.history(), vec![format!("summary: {TEXT_A}")]);
    h.pump(now);
    assert_eq!(
        h.backend.calls().removed,
        vec![format!("instruction for {TEXT_B}")]
    );
}

#[test]
fn round_clear_failure_keeps_the_winner_until_it_succeeds() {
    let (mut h, fail) = flaky(Script::default());
    h.to_voting();
    for _ in 0..3 {
        h.machine.vote(Candidate::B, h.at(0)).unwrap();
    }
    h.pump(h.at(0));

    fail.store(true, Ordering::SeqCst);
    assert_matches!(h.machine.on_tick(h.at(2)), Err(Error::Store(_)));
    assert_eq!(h.machine.phase(), Phase::WinnerSelected(Candidate::B));
    assert!(h.machine.store().text(Candidate::A).is_some());

    fail.store(false, Ordering::SeqCst);
    h.machine.on_tick(h.at(3)).unwrap();
    assert_eq!(h.machine.phase(), Phase::Idle);
    assert!(h.machine.store().text(Candidate::A).is_none());
}
