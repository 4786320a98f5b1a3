//! The block miner: ingests announcements, keeps the most valuable subset
//! by effective work, builds the proof tree, and searches block headers
//! whose PacketCrypt hash meets the effective target.
//!
//! State machine: `Unlocked -> Locked -> Mining -> Unlocked`. Announcements
//! may arrive at any time except while locked; they become eligible at the
//! next `lock_for_mining`.
//!
//! The announcement table, the effective-work list and the tree entries are
//! parallel structures stitched together with index handles; every sort or
//! permutation must repair the handles on both sides.

use super::tree::{hash_proof, ProofTree};
use crate::config::{BlockMinerConfig, ANN_WAIT_PERIOD};
use crate::consensus::difficulty::{
    degrade_announcement_target, get_effective_target, get_hash_rate_multiplier,
};
use crate::consensus::work::{ann_soft_nonce_max, work_check};
use crate::crypto::{hash, CycleState};
use crate::output::{pointer_record, RecordSink};
use crate::protocol::{
    Announcement, BlockHeader, CoinbaseCommit, HeaderAndProof, Share, COINBASE_MAGIC, NUM_ANNS,
};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const HASHES_PER_CYCLE: u32 = 2000;

const STOPPED: u32 = 0;
const RUNNING: u32 = 1;
const SHUTDOWN: u32 = 2;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("announcements cannot be added while locked for mining")]
    Locked,

    #[error("no usable announcements")]
    NoAnns,

    #[error("the miner is not locked for mining")]
    NotLocked,

    #[error("the miner is already mining")]
    AlreadyMining,
}

/// Outcome of `lock_for_mining`: the commitment to embed in the coinbase.
#[derive(Debug, Clone, Copy)]
pub struct LockResult {
    pub commit: CoinbaseCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unlocked,
    Locked,
    Mining,
}

/// Effective-work record; `ann` indexes the job's announcement table.
#[derive(Debug, Clone, Copy)]
struct Aew {
    ann: usize,
    effective_work: u32,
    initial_work: u32,
    parent_block: u32,
}

/// Staged record for a queued announcement batch.
#[derive(Debug, Clone, Copy)]
struct NextAew {
    batch: usize,
    index: usize,
    effective_work: u32,
    initial_work: u32,
    parent_block: u32,
}

/// Everything the workers read while mining. Writes happen only with the
/// workers parked, so reader/writer contention never materializes; the
/// RwLock documents and enforces the invariant.
struct Job {
    header: BlockHeader,
    anns: Vec<Announcement>,
    tree: ProofTree,
    ann_count: u64,
    effective_target: u32,
    coinbase: CoinbaseCommit,
}

/// Master bookkeeping behind the scheduler mutex.
struct Sched {
    state: State,
    aew: Vec<Aew>,
    /// Reverse handles: announcement index -> its `aew` slot.
    ann_to_aew: Vec<usize>,
    /// Announcement index -> its entry slot in the tree.
    tree_pos: Vec<u64>,
    queue: Vec<Vec<Announcement>>,
    next_aew: Vec<NextAew>,
    /// How many queued batches already have records in `next_aew`.
    staged_batches: usize,
    /// Height the aew lists are prepared for, if any.
    ready_for_block: Option<u32>,
    currently_mining: u32,
}

struct WorkerCtl {
    req_state: AtomicU32,
    worker_state: AtomicU32,
    hashes_per_second: AtomicU32,
}

struct Shared {
    job: RwLock<Job>,
    sched: Mutex<Sched>,
    park: Mutex<()>,
    cond: Condvar,
    workers: Vec<WorkerCtl>,
    output: Box<dyn RecordSink>,
    send_ptr: bool,
    deterministic_time: bool,
}

fn update_aew(effective_work: &mut u32, initial_work: u32, parent_block: u32, next_height: u32) {
    if next_height < ANN_WAIT_PERIOD {
        // the first blocks accept everything so the chain can bootstrap
        *effective_work = initial_work;
    } else {
        *effective_work =
            degrade_announcement_target(initial_work, next_height.wrapping_sub(parent_block));
    }
}

pub struct BlockMiner {
    shared: Arc<Shared>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl BlockMiner {
    pub fn new(cfg: BlockMinerConfig, output: Box<dyn RecordSink>) -> Self {
        assert!(cfg.threads > 0, "at least one worker required");
        assert!(cfg.max_anns > 0, "a zero-capacity miner cannot mine");
        let shared = Arc::new(Shared {
            job: RwLock::new(Job {
                header: BlockHeader::default(),
                anns: vec![Announcement::default(); cfg.max_anns],
                tree: ProofTree::new(cfg.max_anns as u64),
                ann_count: 0,
                effective_target: 0,
                coinbase: CoinbaseCommit::default(),
            }),
            sched: Mutex::new(Sched {
                state: State::Unlocked,
                aew: Vec::with_capacity(cfg.max_anns),
                ann_to_aew: vec![0; cfg.max_anns],
                tree_pos: vec![u64::MAX; cfg.max_anns],
                queue: Vec::new(),
                next_aew: Vec::new(),
                staged_batches: 0,
                ready_for_block: None,
                currently_mining: 0,
            }),
            park: Mutex::new(()),
            cond: Condvar::new(),
            workers: (0..cfg.threads)
                .map(|_| WorkerCtl {
                    req_state: AtomicU32::new(STOPPED),
                    worker_state: AtomicU32::new(STOPPED),
                    hashes_per_second: AtomicU32::new(0),
                })
                .collect(),
            output,
            send_ptr: cfg.send_ptr,
            deterministic_time: cfg.deterministic_time,
        });
        let handles = (0..cfg.threads)
            .map(|num| {
                let shared = Arc::clone(&shared);
                let nonce_id = cfg.miner_id.wrapping_add(num as u32);
                thread::Builder::new()
                    .name(format!("blk-worker-{num}"))
                    .spawn(move || worker_thread(shared, num, nonce_id))
                    .expect("spawn block worker")
            })
            .collect();
        BlockMiner { shared, handles }
    }

    /// Queue a batch of announcements. Rejected while locked. Announcements
    /// whose soft nonce exceeds the bound for their target are neutralized
    /// rather than dropped, so their slots cannot be replayed.
    pub fn add_anns(&self, mut anns: Vec<Announcement>) -> Result<(), StateError> {
        let mut sched = self.shared.sched.lock();
        if sched.state == State::Locked {
            return Err(StateError::Locked);
        }
        for ann in &mut anns {
            debug_assert!(ann.work_bits() != 0);
            if ann.soft_nonce() > ann_soft_nonce_max(ann.work_bits()) {
                ann.set_work_bits(0xffff_ffff);
            }
        }
        sched.queue.push(anns);
        if let Some(height) = sched.ready_for_block {
            let batch = sched.queue.len() - 1;
            Self::prepare_batch(&mut sched, batch, height);
            sched.staged_batches = sched.queue.len();
            sched.next_aew.sort_by_key(|a| a.effective_work);
        }
        Ok(())
    }

    /// Extend `next_aew` with a queued batch, computing effective work for
    /// `next_height`.
    fn prepare_batch(sched: &mut Sched, batch: usize, next_height: u32) {
        for index in 0..sched.queue[batch].len() {
            let hdr = sched.queue[batch][index].header();
            let mut rec = NextAew {
                batch,
                index,
                effective_work: 0xffff_ffff,
                initial_work: hdr.work_bits,
                parent_block: hdr.parent_block_height,
            };
            update_aew(&mut rec.effective_work, rec.initial_work, rec.parent_block, next_height);
            sched.next_aew.push(rec);
        }
    }

    /// Recompute and re-sort both effective-work lists for `next_height`.
    /// Cheap to call early; `lock_for_mining` is on the critical path.
    fn prepare_next_block(&self, sched: &mut Sched, job: &Job, next_height: u32) {
        if sched.ready_for_block == Some(next_height) {
            return;
        }
        // the previous lock pass trashed the aew list; rebuild it
        let ann_count = job.ann_count as usize;
        sched.aew.clear();
        for i in 0..ann_count {
            let hdr = job.anns[i].header();
            let mut rec = Aew {
                ann: i,
                effective_work: 0xffff_ffff,
                initial_work: hdr.work_bits,
                parent_block: hdr.parent_block_height,
            };
            update_aew(&mut rec.effective_work, rec.initial_work, rec.parent_block, next_height);
            sched.aew.push(rec);
        }
        sched.aew.sort_by_key(|a| a.effective_work);
        for (slot, rec) in sched.aew.iter().enumerate() {
            sched.ann_to_aew[rec.ann] = slot;
        }

        for rec in sched.next_aew.iter_mut() {
            update_aew(&mut rec.effective_work, rec.initial_work, rec.parent_block, next_height);
        }
        for batch in sched.staged_batches..sched.queue.len() {
            Self::prepare_batch(sched, batch, next_height);
        }
        sched.staged_batches = sched.queue.len();
        sched.next_aew.sort_by_key(|a| a.effective_work);
        sched.ready_for_block = Some(next_height);
    }

    fn post_lock_cleanup(sched: &mut Sched) {
        sched.queue.clear();
        sched.next_aew.clear();
        sched.staged_batches = 0;
        sched.ready_for_block = None;
    }

    /// Merge the staged announcements with the held set, pick the subset
    /// maximizing the hash-rate multiplier, rebuild the tree, and emit the
    /// coinbase commitment. Stops mining first if needed.
    pub fn lock_for_mining(
        &self,
        next_height: u32,
        next_target: u32,
    ) -> Result<LockResult, StateError> {
        let mut sched = self.shared.sched.lock();
        if sched.state == State::Mining {
            self.stop_locked(&mut sched);
        }
        let mut job = self.shared.job.write();
        self.prepare_next_block(&mut sched, &job, next_height);

        // 1. drop staged entries that are not valid at this height
        while sched.next_aew.last().is_some_and(|a| a.effective_work == 0xffff_ffff) {
            sched.next_aew.pop();
        }

        // 2. walk back from the end of the held list until everything
        //    staged fits, or the next held entry beats the best staged one
        let capacity = job.anns.len();
        let ann_count = job.ann_count as usize;
        let mut end_of_old = ann_count;
        loop {
            if end_of_old == 0 {
                break;
            }
            if end_of_old + sched.next_aew.len() <= capacity {
                break;
            }
            if sched
                .next_aew
                .first()
                .is_some_and(|first| first.effective_work > sched.aew[end_of_old - 1].effective_work)
            {
                break;
            }
            end_of_old -= 1;
        }

        // 3. append (or overwrite, when capacity-bound) the staged entries
        let mut new_i = 0;
        let mut main_i = end_of_old;
        while main_i < capacity && new_i < sched.next_aew.len() {
            let staged = sched.next_aew[new_i];
            let (ann_slot, tree_slot) = if main_i < ann_count {
                // replacement: reuse the slot of the evicted entry
                let slot = sched.aew[main_i].ann;
                (slot, sched.tree_pos[slot])
            } else {
                sched.tree_pos[main_i] = main_i as u64;
                (main_i, main_i as u64)
            };
            job.anns[ann_slot] = sched.queue[staged.batch][staged.index].clone();
            let ann_hash = hash::compress32(job.anns[ann_slot].as_bytes());
            job.tree.entry_mut(tree_slot).hash = ann_hash;
            if main_i < sched.aew.len() {
                sched.aew[main_i] = Aew {
                    ann: ann_slot,
                    effective_work: staged.effective_work,
                    initial_work: staged.initial_work,
                    parent_block: staged.parent_block,
                };
            } else {
                sched.aew.push(Aew {
                    ann: ann_slot,
                    effective_work: staged.effective_work,
                    initial_work: staged.initial_work,
                    parent_block: staged.parent_block,
                });
            }
            new_i += 1;
            main_i += 1;
        }
        sched.aew.truncate(main_i);

        if main_i == 0 {
            Self::post_lock_cleanup(&mut sched);
            drop(job);
            let job = self.shared.job.read();
            self.prepare_next_block(&mut sched, &job, next_height);
            return Err(StateError::NoAnns);
        }

        // 4. sort by effective work and search for the subset with the
        //    best hash-rate multiplier
        sched.aew.sort_by_key(|a| a.effective_work);
        let mut best_hrm = 0u64;
        let mut best_i = 0usize;
        if main_i > 0 {
            let ann0 = sched.aew[0].ann;
            sched.ann_to_aew[ann0] = 0;
        }
        for i in 1..main_i {
            let ann_i = sched.aew[i].ann;
            sched.ann_to_aew[ann_i] = i;
            let work = sched.aew[i].effective_work;
            if work == 0xffff_ffff {
                break;
            }
            let hrm = get_hash_rate_multiplier(work, i as u64);
            if hrm <= best_hrm {
                continue;
            }
            best_hrm = hrm;
            best_i = i;
        }
        // zero the tree entries of everything past the chosen subset; the
        // prepare pass will strip them as forbidden zero keys
        for i in best_i..main_i {
            let slot = sched.aew[i].ann;
            *job.tree.entry_mut(sched.tree_pos[slot]) =
                crate::block::tree::TreeEntry::zeroed();
        }
        let main_i = best_i + 1;
        sched.aew.truncate(main_i);
        let worst_effective_work = sched.aew[best_i].effective_work;

        // 5. sort the tree by hash key, stripping zeroed and duplicate
        //    entries
        job.tree.set_ann_count(main_i as u64);
        let next_count = job.tree.prepare();
        job.ann_count = next_count;

        // 6. reorder the announcement table to tree order; each tree entry
        //    still carries its pre-sort index in `start`
        for i in 0..main_i {
            sched.tree_pos[i] = u64::MAX;
        }
        for i in 0..next_count {
            let orig = job.tree.entry(i).start as usize;
            sched.tree_pos[orig] = i;
        }
        for i in 0..next_count as usize {
            assert!(sched.tree_pos[i] >= i as u64, "permutation moved an entry backward");
            if sched.tree_pos[i] == i as u64 {
                let idx = sched.ann_to_aew[i];
                sched.aew[idx].ann = i;
                continue;
            }
            let b = job.tree.entry(i as u64).start as usize;
            assert_eq!(sched.tree_pos[b], i as u64, "tree index desynchronized");
            job.anns.swap(i, b);
            sched.tree_pos.swap(i, b);
            sched.ann_to_aew.swap(i, b);
            // the displaced entry keeps its tree slot pointed at its new home
            job.tree.entry_mut(sched.tree_pos[b]).start = b as u64;
            let idx = sched.ann_to_aew[i];
            sched.aew[idx].ann = i;
        }

        if next_count == 0 {
            Self::post_lock_cleanup(&mut sched);
            drop(job);
            let job = self.shared.job.read();
            self.prepare_next_block(&mut sched, &job, next_height);
            return Err(StateError::NoAnns);
        }

        // consistency audit over the final set
        for i in 0..next_count as usize {
            let aew = &sched.aew[sched.ann_to_aew[i]];
            let hdr = job.anns[i].header();
            assert_eq!(aew.initial_work, hdr.work_bits);
            assert_eq!(aew.parent_block, hdr.parent_block_height);
            let mut real = 0xffff_ffff;
            update_aew(&mut real, aew.initial_work, aew.parent_block, next_height);
            if aew.effective_work != real {
                error!(
                    "ann {i} of {next_count} has effective work {:#010x}, expected {:#010x}",
                    aew.effective_work, real
                );
                panic!("effective-work bookkeeping desynchronized");
            }
            assert!(aew.effective_work <= worst_effective_work);
        }

        job.tree.compute();
        let commit = CoinbaseCommit {
            magic: COINBASE_MAGIC,
            ann_least_work_target: worst_effective_work,
            merkle_root: *job.tree.root(),
            num_anns: next_count,
        };
        job.coinbase = commit;
        job.effective_target = get_effective_target(next_target, worst_effective_work, next_count);
        sched.currently_mining = next_height;
        sched.state = State::Locked;
        info!(
            "locked for height {next_height}: {next_count} anns, effective target {:#010x}",
            job.effective_target
        );
        Ok(LockResult { commit })
    }

    /// Begin mining the given header. The miner must be locked; the header
    /// must embed the commitment returned by `lock_for_mining`.
    pub fn start(&self, header: &BlockHeader) -> Result<(), StateError> {
        let mut sched = self.shared.sched.lock();
        match sched.state {
            State::Unlocked => return Err(StateError::NotLocked),
            State::Mining => return Err(StateError::AlreadyMining),
            State::Locked => {}
        }
        sched.state = State::Mining;
        self.shared.job.write().header = *header;
        {
            let _park = self.shared.park.lock();
            for w in &self.shared.workers {
                w.req_state.store(RUNNING, Ordering::Relaxed);
            }
            self.shared.cond.notify_all();
        }
        Self::post_lock_cleanup(&mut sched);
        let height = sched.currently_mining;
        let job = self.shared.job.read();
        self.prepare_next_block(&mut sched, &job, height);
        Ok(())
    }

    fn request_all(&self, state: u32) {
        let _park = self.shared.park.lock();
        for w in &self.shared.workers {
            w.req_state.store(state, Ordering::Relaxed);
        }
        self.shared.cond.notify_all();
    }

    fn wait_stopped(&self) {
        for _ in 0..100_000 {
            let stopped = self
                .shared
                .workers
                .iter()
                .all(|w| w.worker_state.load(Ordering::Relaxed) != RUNNING);
            if stopped {
                return;
            }
            thread::sleep(Duration::from_micros(100));
        }
        panic!("workers did not stop within ten seconds");
    }

    fn stop_locked(&self, sched: &mut Sched) {
        self.request_all(STOPPED);
        self.wait_stopped();
        sched.state = State::Unlocked;
        sched.currently_mining = 0;
    }

    /// Stop mining, or just unlock if no mining had started. No shares are
    /// produced after this returns.
    pub fn stop(&self) -> Result<(), StateError> {
        let mut sched = self.shared.sched.lock();
        match sched.state {
            State::Unlocked => Err(StateError::NotLocked),
            State::Locked => {
                sched.state = State::Unlocked;
                warn!("unlocked the miner without mining");
                Self::post_lock_cleanup(&mut sched);
                let height = sched.currently_mining;
                let job = self.shared.job.read();
                self.prepare_next_block(&mut sched, &job, height);
                sched.currently_mining = 0;
                Ok(())
            }
            State::Mining => {
                self.stop_locked(&mut sched);
                Ok(())
            }
        }
    }

    pub fn hashes_per_second(&self) -> u64 {
        self.shared
            .workers
            .iter()
            .map(|w| u64::from(w.hashes_per_second.load(Ordering::Relaxed)))
            .sum()
    }

    /// Raw hash rate times the announcement multiplier.
    pub fn effective_hash_rate(&self) -> f64 {
        let coinbase = self.shared.job.read().coinbase;
        let hrm =
            get_hash_rate_multiplier(coinbase.ann_least_work_target, coinbase.num_anns) as f64;
        self.hashes_per_second() as f64 * hrm
    }
}

impl Drop for BlockMiner {
    fn drop(&mut self) {
        self.request_all(SHUTDOWN);
        self.wait_stopped();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn wall_clock_secs() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as u32)
}

fn worker_thread(shared: Arc<Shared>, num: usize, nonce_id: u32) {
    let ctl = &shared.workers[num];
    let mut low_nonce = 0u32;
    let mut guard = shared.park.lock();
    loop {
        let rs = ctl.req_state.load(Ordering::Relaxed);
        ctl.worker_state.store(rs, Ordering::Relaxed);
        match rs {
            RUNNING => {
                drop(guard);
                mine(&shared, ctl, nonce_id, &mut low_nonce);
                guard = shared.park.lock();
            }
            STOPPED => {
                shared.cond.wait(&mut guard);
            }
            _ => return,
        }
    }
}

/// Mine until a share is found or a state change is requested.
fn mine(shared: &Shared, ctl: &WorkerCtl, nonce_id: u32, low_nonce: &mut u32) {
    let job = shared.job.read();
    let mut header = job.header;
    header.nonce = nonce_id;
    let mut nonce = *low_nonce;
    let mut begin = Instant::now();
    loop {
        let now = wall_clock_secs();
        if header.time_seconds != now && !shared.deterministic_time {
            nonce = 0;
            header.time_seconds = now;
        }
        let hdr_hash = hash::compress32(&header.to_bytes());

        for _ in 0..HASHES_PER_CYCLE {
            nonce = nonce.wrapping_add(1);
            let mut state = CycleState::init(&hdr_hash, u64::from(nonce));
            let mut items = [0u64; NUM_ANNS];
            for item in items.iter_mut() {
                let idx = state.item_no() % job.ann_count;
                *item = idx;
                state
                    .update(job.anns[idx as usize].as_item(), None, 0, None)
                    .expect("zero-cycle update cannot fail");
            }
            state.smul();
            state.finalize();
            let mut work_hash = [0u8; 32];
            work_hash.copy_from_slice(&state.bytes()[..32]);
            if !work_check(&work_hash, job.effective_target) {
                continue;
            }
            found(shared, &job, &header, nonce, &items);
            *low_nonce = nonce;
            return;
        }

        let micros = (begin.elapsed().as_micros() as u64).max(1);
        let hps = (u64::from(HASHES_PER_CYCLE) * 1024) / (micros / 1024).max(1);
        ctl.hashes_per_second.store(hps as u32, Ordering::Relaxed);
        begin = Instant::now();

        if ctl.req_state.load(Ordering::Relaxed) != RUNNING {
            *low_nonce = nonce;
            return;
        }
    }
}

/// Assemble, self-check and emit a share.
fn found(shared: &Shared, job: &Job, header: &BlockHeader, low_nonce: u32, items: &[u64; NUM_ANNS]) {
    let proof = job.tree.mk_proof(items);

    let mut announcements: [Announcement; NUM_ANNS] = Default::default();
    let mut hashes = [[0u8; 32]; NUM_ANNS];
    for i in 0..NUM_ANNS {
        announcements[i] = job.anns[items[i] as usize].clone();
        hashes[i] = hash::compress32(announcements[i].as_bytes());
    }

    let share = Share {
        coinbase: job.coinbase,
        hap: HeaderAndProof {
            header: *header,
            nonce2: low_nonce,
            announcements,
            proof: proof.clone(),
        },
    };

    // a share that does not re-verify is a bug, not bad luck
    let root = hash_proof(&hashes, job.ann_count, items, &proof)
        .expect("freshly built proof must verify");
    assert_eq!(&root, job.tree.root(), "proof root diverged from the tree");

    debug!("share found at nonce {low_nonce}");
    let bytes = share.encode();
    let res = if shared.send_ptr {
        let size = bytes.len() as u64;
        shared.output.write_record(&pointer_record(bytes, size))
    } else {
        shared.output.write_record(&bytes)
    };
    if let Err(e) = res {
        error!("failed to write share: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemorySink;

    fn synthetic_anns(count: usize) -> Vec<Announcement> {
        (0..count)
            .map(|i| {
                let mut ann = Announcement::default();
                ann.set_work_bits(0x2000_0fff);
                // distinct bodies so the tree keys do not collide
                ann.0[100] = i as u8;
                ann.0[101] = 0xa5;
                ann
            })
            .collect()
    }

    /// Lock over synthetic announcements, mine a share, and replay the
    /// validator's hash chain and proof over the output.
    #[test]
    fn test_mined_share_proof_verifies() {
        let _ = env_logger::builder().is_test(true).try_init();
        let sink = Arc::new(MemorySink::new());
        let miner = BlockMiner::new(
            BlockMinerConfig {
                max_anns: 64,
                miner_id: 3,
                threads: 1,
                send_ptr: false,
                deterministic_time: true,
            },
            Box::new(Arc::clone(&sink)),
        );
        miner.add_anns(synthetic_anns(16)).expect("add");
        let lock = miner.lock_for_mining(10, 0x207f_ffff).expect("lock");
        assert_eq!(lock.commit.magic, COINBASE_MAGIC);
        assert!(lock.commit.num_anns >= 1);

        let header = BlockHeader {
            version: 1,
            work_bits: 0x207f_ffff,
            time_seconds: 1_000_000,
            ..Default::default()
        };
        miner.start(&header).expect("start");
        for _ in 0..1200 {
            if !sink.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        miner.stop().expect("stop");
        let records = sink.records();
        assert!(!records.is_empty(), "no share produced");

        let share = Share::decode(&records[0]).expect("share decodes");
        assert_eq!(share.coinbase.merkle_root, lock.commit.merkle_root);
        assert_eq!(share.coinbase.num_anns, lock.commit.num_anns);
        assert_eq!(share.hap.header.nonce, 3);

        // replay the packetcrypt hash chain the way a validator does
        let hdr_hash = hash::compress32(&share.hap.header.to_bytes());
        let mut state = CycleState::init(&hdr_hash, u64::from(share.hap.nonce2));
        let mut idxs = [0u64; NUM_ANNS];
        let mut hashes = [[0u8; 32]; NUM_ANNS];
        for j in 0..NUM_ANNS {
            idxs[j] = state.item_no();
            state.update(share.hap.announcements[j].as_item(), None, 0, None).expect("update");
            hashes[j] = hash::compress32(share.hap.announcements[j].as_bytes());
        }
        state.smul();
        state.finalize();
        let mut work_hash = [0u8; 32];
        work_hash.copy_from_slice(&state.bytes()[..32]);
        let effective = get_effective_target(
            0x207f_ffff,
            share.coinbase.ann_least_work_target,
            share.coinbase.num_anns,
        );
        assert!(work_check(&work_hash, effective));

        let root = hash_proof(&hashes, share.coinbase.num_anns, &idxs, &share.hap.proof)
            .expect("proof verifies");
        assert_eq!(root, share.coinbase.merkle_root);
    }

    #[test]
    fn test_lock_keeps_the_strongest_subset() {
        let miner = BlockMiner::new(
            BlockMinerConfig { max_anns: 8, threads: 1, ..Default::default() },
            Box::new(MemorySink::new()),
        );
        // fill past capacity; the weakest announcements must be evicted
        miner.add_anns(synthetic_anns(8)).expect("add");
        let first = miner.lock_for_mining(10, 0x207f_ffff).expect("lock");
        miner.start(&BlockHeader::default()).expect("start");
        miner.stop().expect("stop");

        let mut stronger = synthetic_anns(8);
        for (i, ann) in stronger.iter_mut().enumerate() {
            // harder target -> more work
            ann.set_work_bits(0x2000_0f0f);
            ann.0[102] = i as u8;
        }
        miner.add_anns(stronger).expect("add");
        let second = miner.lock_for_mining(10, 0x207f_ffff).expect("lock");
        // the committed least-work target tightened
        assert!(second.commit.ann_least_work_target < first.commit.ann_least_work_target);
    }

    #[test]
    fn test_state_machine_guards() {
        let miner =
            BlockMiner::new(BlockMinerConfig { threads: 1, ..Default::default() }, Box::new(MemorySink::new()));
        // cannot start or stop before locking
        assert_eq!(miner.start(&BlockHeader::default()), Err(StateError::NotLocked));
        assert_eq!(miner.stop(), Err(StateError::NotLocked));
        // locking with no announcements fails
        assert_eq!(
            miner.lock_for_mining(10, 0x207f_ffff).unwrap_err(),
            StateError::NoAnns
        );
    }

    #[test]
    fn test_add_anns_neutralizes_high_soft_nonces() {
        let miner =
            BlockMiner::new(BlockMinerConfig { threads: 1, ..Default::default() }, Box::new(MemorySink::new()));
        let mut ann = Announcement::default();
        ann.set_work_bits(0x207f_ffff);
        // soft nonce far above the bound for an easy target
        ann.set_soft_nonce(0x00ff_ffff);
        miner.add_anns(vec![ann]).expect("add");
        let sched = miner.shared.sched.lock();
        assert_eq!(sched.queue[0][0].work_bits(), 0xffff_ffff);
    }
}
