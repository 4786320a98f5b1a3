//! The announcement miner: a pool of workers, each owning an 8192-item
//! table (~8 MiB) and searching soft nonces over it in 512-hash cycles.
//! Output is routed across sinks by announcement hash so pools can shard
//! verification.

use crate::ann::item::{ann_crypt, create_prog, mk_item, mk_item2};
use crate::ann::merkle::{new_table, AnnMerkle, TABLE_SZ};
use crate::config::{AnnMinerConfig, ANN_RANDHASH_CYCLES};
use crate::consensus::validate::check_ann;
use crate::consensus::work::{ann_soft_nonce_max, work_check};
use crate::crypto::{hash, CycleState, Item};
use crate::output::{pointer_record, RecordSink};
use crate::protocol::{AnnounceHeader, Announcement, ANN_HDR_SZ, ANN_SZ};
use crate::randprog::Program;
use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const HASHES_PER_CYCLE: u32 = 512;

const STOPPED: u32 = 0;
const RUNNING: u32 = 1;
const SHUTDOWN: u32 = 2;

/// The 84-byte mining request handed down by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnnMinerRequest {
    /// nBits target an announcement hash must beat.
    pub work_target: u32,
    /// Height of the most recent block.
    pub parent_block_height: u32,
    /// Hash of the most recent block, committed by every announcement.
    pub parent_block_hash: [u8; 32],
    /// Zero when announcements need not be signed.
    pub signing_key: [u8; 32],
    /// Carried for the wire layout; throttling happens upstream.
    pub max_anns_per_second: u32,
    pub content_type: u32,
    pub content_len: u32,
}

pub const ANN_MINER_REQUEST_SZ: usize = 84;

impl AnnMinerRequest {
    pub fn to_bytes(&self) -> [u8; ANN_MINER_REQUEST_SZ] {
        let mut out = [0u8; ANN_MINER_REQUEST_SZ];
        out[..4].copy_from_slice(&self.work_target.to_le_bytes());
        out[4..8].copy_from_slice(&self.parent_block_height.to_le_bytes());
        out[8..40].copy_from_slice(&self.parent_block_hash);
        out[40..72].copy_from_slice(&self.signing_key);
        out[72..76].copy_from_slice(&self.max_anns_per_second.to_le_bytes());
        out[76..80].copy_from_slice(&self.content_type.to_le_bytes());
        out[80..84].copy_from_slice(&self.content_len.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; ANN_MINER_REQUEST_SZ]) -> Self {
        AnnMinerRequest {
            work_target: u32::from_le_bytes(b[..4].try_into().unwrap()),
            parent_block_height: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            parent_block_hash: b[8..40].try_into().unwrap(),
            signing_key: b[40..72].try_into().unwrap(),
            max_anns_per_second: u32::from_le_bytes(b[72..76].try_into().unwrap()),
            content_type: u32::from_le_bytes(b[76..80].try_into().unwrap()),
            content_len: u32::from_le_bytes(b[80..84].try_into().unwrap()),
        }
    }
}

/// An announcement header plus a 64-byte hash carrier: the parent block
/// hash when handed to workers, the merkle root once a job is built.
#[derive(Clone, PartialEq, Eq, Debug)]
struct HeaderAndHash {
    hdr: AnnounceHeader,
    hash: [u8; 64],
}

impl HeaderAndHash {
    fn zeroed() -> Self {
        HeaderAndHash { hdr: AnnounceHeader::default(), hash: [0u8; 64] }
    }

    fn to_bytes(&self) -> [u8; ANN_HDR_SZ + 64] {
        let mut out = [0u8; ANN_HDR_SZ + 64];
        out[..ANN_HDR_SZ].copy_from_slice(&self.hdr.to_bytes());
        out[ANN_HDR_SZ..].copy_from_slice(&self.hash);
        out
    }
}

struct WorkerCtl {
    req_state: AtomicU32,
    worker_state: AtomicU32,
    hashes_per_second: AtomicU32,
}

struct MasterJob {
    hah: HeaderAndHash,
    content: Arc<Vec<u8>>,
}

struct Shared {
    lock: Mutex<MasterJob>,
    cond: Condvar,
    /// Bumped whenever the master job changes; workers drop their nonce
    /// space and rebuild when they see a new value.
    generation: AtomicU64,
    workers: Vec<WorkerCtl>,
    outputs: Vec<Box<dyn RecordSink>>,
    send_ptr: bool,
    paranoia: bool,
    miner_id: u32,
}

struct WorkerJob {
    table: Vec<Item>,
    merkle: AnnMerkle,
    /// Base job as copied from the master, before nonce striping.
    base_hah: HeaderAndHash,
    /// Working job: `hash` carries the merkle root.
    hah: HeaderAndHash,
    hard_nonce: u32,
    ann_hash1: [u8; 64],
    parent_block_hash: [u8; 32],
    content: Arc<Vec<u8>>,
    soft_nonce: u32,
    soft_nonce_max: u32,
    generation: u64,
}

struct Worker {
    shared: Arc<Shared>,
    num: usize,
    job: WorkerJob,
    prog: Program,
    ann: Announcement,
}

fn populate_table_v0(table: &mut [Item], ann_hash0: &[u8; 64]) {
    let seed: [u8; 32] = ann_hash0[..32].try_into().unwrap();
    for (i, item) in table.iter_mut().enumerate() {
        *item = mk_item(i as u64, &seed);
    }
}

fn populate_table_v1(table: &mut [Item], seed64: &[u8; 64], prog: &mut Program) -> bool {
    let prog_seed: [u8; 32] = seed64[..32].try_into().unwrap();
    let item_seed: [u8; 32] = seed64[32..].try_into().unwrap();
    if create_prog(prog, &prog_seed).is_err() {
        return false;
    }
    for (i, item) in table.iter_mut().enumerate() {
        match mk_item2(i as u64, &item_seed, prog) {
            Ok(it) => *item = it,
            Err(_) => return false,
        }
    }
    true
}

impl Worker {
    fn ctl(&self) -> &WorkerCtl {
        &self.shared.workers[self.num]
    }

    /// Copy the master job (striping the hard nonce across workers on a
    /// fresh job, advancing it by the worker count on a rebuild of the same
    /// one) and derive the item table, tree and job hashes.
    fn next_job(&mut self) {
        loop {
            let (master, content, generation) = {
                let guard = self.shared.lock.lock();
                (
                    guard.hah.clone(),
                    Arc::clone(&guard.content),
                    self.shared.generation.load(Ordering::Relaxed),
                )
            };
            if self.job.base_hah != master {
                self.job.base_hah = master.clone();
                self.job.hard_nonce = master.hdr.hard_nonce.wrapping_add(self.num as u32);
            } else {
                self.job.hard_nonce =
                    self.job.hard_nonce.wrapping_add(self.shared.workers.len() as u32);
            }
            self.job.generation = generation;
            self.job.content = content;

            let mut hah = self.job.base_hah.clone();
            hah.hdr.hard_nonce = self.job.hard_nonce;
            let ann_hash0 = hash::compress64(&hah.to_bytes());

            let v1 = hah.hdr.version > 0;
            if v1 {
                if !populate_table_v1(&mut self.job.table, &ann_hash0, &mut self.prog) {
                    continue;
                }
            } else {
                populate_table_v0(&mut self.job.table, &ann_hash0);
            }
            self.job.merkle.build(&self.job.table);

            let root = *self.job.merkle.root();
            self.job.parent_block_hash = hah.hash[..32].try_into().unwrap();
            hah.hash = root;
            let ann_hash1 = hash::compress64(&hah.to_bytes());

            self.job.soft_nonce_max = ann_soft_nonce_max(hah.hdr.work_bits);
            self.job.soft_nonce = 0;

            if v1 {
                // the mining table derives from the root, while the merkle
                // branches prove the original encoding
                let mut buf = [0u8; 128];
                buf[..64].copy_from_slice(&root);
                buf[64..].copy_from_slice(&ann_hash0);
                let derived = hash::compress64(&buf);
                if !populate_table_v1(&mut self.job.table, &derived, &mut self.prog) {
                    continue;
                }
            }

            self.job.hah = hah;
            self.job.ann_hash1 = ann_hash1;
            return;
        }
    }

    /// One soft-nonce attempt; true when an announcement was produced.
    fn ann_hash(&mut self, nonce: u32) -> bool {
        let seed: [u8; 32] = self.job.ann_hash1[..32].try_into().unwrap();
        let mut state = CycleState::init(&seed, u64::from(nonce));
        let rand_hash_cycles =
            if self.job.hah.hdr.version > 0 { 0 } else { ANN_RANDHASH_CYCLES };
        let mut item_no = 0usize;
        for _ in 0..4 {
            item_no = (state.item_no() % TABLE_SZ as u64) as usize;
            let item = &self.job.table[item_no];
            if state.update(item, None, rand_hash_cycles, Some(&mut self.prog)).is_err() {
                return false;
            }
        }
        state.finalize();

        let mut work_hash = [0u8; 32];
        work_hash.copy_from_slice(&state.bytes()[..32]);
        if !work_check(&work_hash, self.job.hah.hdr.work_bits) {
            return false;
        }

        self.ann.set_header(&self.job.hah.hdr);
        self.ann.set_soft_nonce(nonce);
        let branch = self.job.merkle.branch(item_no as u16);
        self.ann.merkle_proof_mut().copy_from_slice(&branch);
        if self.job.hah.hdr.version > 0 {
            self.ann.last_ann_pfx_mut().fill(0);
            ann_crypt(&mut self.ann, &state);
        } else {
            let pfx: [u8; 40] = self.job.table[item_no][..40].try_into().unwrap();
            self.ann.last_ann_pfx_mut().copy_from_slice(&pfx);
        }
        true
    }

    fn emit(&mut self) {
        if self.shared.paranoia {
            if let Err(e) = check_ann(&self.ann, &self.job.parent_block_hash, &mut self.prog) {
                error!("freshly mined announcement failed validation: {e}");
                panic!("internal error: check_ann rejected our own announcement");
            }
        }

        // route by hash so pool servers can insist announcements shard
        let ann_hash = hash::compress32(self.ann.as_bytes());
        let shard = u64::from_le_bytes(ann_hash[..8].try_into().unwrap());
        let out = &self.shared.outputs[(shard % self.shared.outputs.len() as u64) as usize];

        let content_len = self.ann.content_length() as usize;
        let res = if self.shared.send_ptr || content_len > 32 {
            let mut buf = Vec::with_capacity(ANN_SZ + content_len);
            buf.extend_from_slice(self.ann.as_bytes());
            if content_len > 32 {
                buf.extend_from_slice(&self.job.content[..content_len]);
            }
            if self.shared.send_ptr {
                out.write_record(&pointer_record(buf, ANN_SZ as u64))
            } else {
                out.write_record(&buf)
            }
        } else {
            out.write_record(self.ann.as_bytes())
        };
        if let Err(e) = res {
            error!("failed to write announcement: {e}");
        }
    }

    fn search(&mut self) {
        let begin = Instant::now();
        let mut nonce = self.job.soft_nonce;
        for _ in 1..HASHES_PER_CYCLE {
            let found = self.ann_hash(nonce);
            nonce = nonce.wrapping_add(1);
            if found {
                self.emit();
            }
        }
        self.job.soft_nonce = nonce;

        let micros = (begin.elapsed().as_micros() as u64).max(1);
        let hps = (u64::from(HASHES_PER_CYCLE) * 1024) / (micros / 1024).max(1);
        self.ctl().hashes_per_second.store(hps as u32, Ordering::Relaxed);
    }

    /// Park until the requested state leaves `STOPPED`; true on shutdown.
    fn check_stop(&self) -> bool {
        let mut guard = self.shared.lock.lock();
        loop {
            let rts = self.ctl().req_state.load(Ordering::Relaxed);
            self.ctl().worker_state.store(rts, Ordering::Relaxed);
            if rts != STOPPED {
                drop(guard);
                return rts == SHUTDOWN;
            }
            self.shared.cond.wait(&mut guard);
        }
    }

    fn run(mut self) {
        loop {
            if self.ctl().req_state.load(Ordering::Relaxed) != RUNNING && self.check_stop() {
                return;
            }
            if self.shared.generation.load(Ordering::Relaxed) != self.job.generation {
                // new master job: drop the remaining nonce space
                self.job.soft_nonce_max = 0;
            }
            if self.job.soft_nonce + HASHES_PER_CYCLE > self.job.soft_nonce_max {
                self.next_job();
            }
            self.search();
        }
    }
}

/// Multi-worker announcement miner.
pub struct AnnMiner {
    shared: Arc<Shared>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl AnnMiner {
    /// Spawn the worker pool. Workers start parked; call [`start`] to mine.
    ///
    /// [`start`]: AnnMiner::start
    pub fn new(cfg: AnnMinerConfig, outputs: Vec<Box<dyn RecordSink>>) -> Self {
        assert!(cfg.threads > 0, "at least one worker required");
        assert!(!outputs.is_empty(), "at least one output sink required");
        let shared = Arc::new(Shared {
            lock: Mutex::new(MasterJob {
                hah: HeaderAndHash::zeroed(),
                content: Arc::new(Vec::new()),
            }),
            cond: Condvar::new(),
            generation: AtomicU64::new(0),
            workers: (0..cfg.threads)
                .map(|_| WorkerCtl {
                    req_state: AtomicU32::new(STOPPED),
                    worker_state: AtomicU32::new(STOPPED),
                    hashes_per_second: AtomicU32::new(0),
                })
                .collect(),
            outputs,
            send_ptr: cfg.send_ptr,
            paranoia: cfg.paranoia,
            miner_id: cfg.miner_id,
        });
        let handles = (0..cfg.threads)
            .map(|num| {
                let worker = Worker {
                    shared: Arc::clone(&shared),
                    num,
                    job: WorkerJob {
                        table: new_table(),
                        merkle: AnnMerkle::new(),
                        base_hah: HeaderAndHash::zeroed(),
                        hah: HeaderAndHash::zeroed(),
                        hard_nonce: 0,
                        ann_hash1: [0u8; 64],
                        parent_block_hash: [0u8; 32],
                        content: Arc::new(Vec::new()),
                        soft_nonce: 0,
                        soft_nonce_max: 0,
                        generation: u64::MAX,
                    },
                    prog: Program::new(),
                    ann: Announcement::default(),
                };
                thread::Builder::new()
                    .name(format!("ann-worker-{num}"))
                    .spawn(move || worker.run())
                    .expect("spawn announcement worker")
            })
            .collect();
        AnnMiner { shared, handles }
    }

    fn request_all(&self, state: u32) {
        for w in &self.shared.workers {
            w.req_state.store(state, Ordering::Relaxed);
        }
    }

    fn wait_stopped(&self) {
        loop {
            let all_stopped = self
                .shared
                .workers
                .iter()
                .all(|w| w.worker_state.load(Ordering::Relaxed) != RUNNING);
            if all_stopped {
                return;
            }
            thread::sleep(Duration::from_micros(100));
        }
    }

    /// Begin mining `req` with the given content. A request identical to
    /// the current one keeps the workers' nonce cursors so the same space
    /// is not searched twice.
    pub fn start(&self, req: &AnnMinerRequest, content: &[u8], version: u8) {
        self.request_all(STOPPED);
        self.wait_stopped();
        assert!(version <= 1, "unknown announcement version");

        let mut hah = HeaderAndHash::zeroed();
        hah.hdr.version = version;
        hah.hdr.hard_nonce = self.shared.miner_id;
        hah.hdr.work_bits = req.work_target;
        hah.hdr.parent_block_height = req.parent_block_height;
        hah.hdr.content_type = req.content_type;
        hah.hdr.content_length = req.content_len;
        hah.hdr.signing_key = req.signing_key;
        hah.hash[..32].copy_from_slice(&req.parent_block_hash);

        if req.content_len > 0 {
            assert!(content.len() >= req.content_len as usize);
            if req.content_len <= 32 {
                hah.hdr.content_hash[..req.content_len as usize]
                    .copy_from_slice(&content[..req.content_len as usize]);
            } else {
                hah.hdr.content_hash =
                    crate::ann::content::compute(&content[..req.content_len as usize]);
            }
        }

        {
            let mut guard = self.shared.lock.lock();
            if guard.hah != hah {
                guard.hah = hah;
                guard.content = Arc::new(content.to_vec());
                self.shared.generation.fetch_add(1, Ordering::Relaxed);
                debug!("new announcement job at height {}", req.parent_block_height);
            }
            self.request_all(RUNNING);
            self.shared.cond.notify_all();
        }
    }

    /// Stop mining; no announcements are produced after this returns.
    pub fn stop(&self) {
        self.request_all(STOPPED);
        self.wait_stopped();
    }

    /// Approximate hash rate summed over workers; readings may lag a cycle.
    pub fn hashes_per_second(&self) -> u64 {
        self.shared
            .workers
            .iter()
            .map(|w| u64::from(w.hashes_per_second.load(Ordering::Relaxed)))
            .sum()
    }
}

impl Drop for AnnMiner {
    fn drop(&mut self) {
        {
            let _guard = self.shared.lock.lock();
            self.request_all(SHUTDOWN);
            self.shared.cond.notify_all();
        }
        self.wait_stopped();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemorySink;

    fn test_shared(outputs: Vec<Box<dyn RecordSink>>) -> Arc<Shared> {
        Arc::new(Shared {
            lock: Mutex::new(MasterJob {
                hah: HeaderAndHash::zeroed(),
                content: Arc::new(Vec::new()),
            }),
            cond: Condvar::new(),
            generation: AtomicU64::new(0),
            workers: vec![WorkerCtl {
                req_state: AtomicU32::new(STOPPED),
                worker_state: AtomicU32::new(STOPPED),
                hashes_per_second: AtomicU32::new(0),
            }],
            outputs,
            send_ptr: false,
            paranoia: false,
            miner_id: 7,
        })
    }

    /// Drive one worker by hand: build a job, search soft nonces, and run
    /// the produced announcement through full validation.
    #[test]
    fn test_mined_v0_announcement_validates() {
        let _ = env_logger::builder().is_test(true).try_init();
        let parent_block_hash = [0x11u8; 32];
        let shared = test_shared(vec![Box::new(MemorySink::new())]);
        {
            let mut guard = shared.lock.lock();
            guard.hah.hdr.version = 0;
            guard.hah.hdr.hard_nonce = shared.miner_id;
            guard.hah.hdr.work_bits = 0x207f_ffff;
            guard.hah.hdr.parent_block_height = 1;
            guard.hah.hash[..32].copy_from_slice(&parent_block_hash);
        }
        let mut worker = Worker {
            shared: Arc::clone(&shared),
            num: 0,
            job: WorkerJob {
                table: new_table(),
                merkle: AnnMerkle::new(),
                base_hah: HeaderAndHash::zeroed(),
                hah: HeaderAndHash::zeroed(),
                hard_nonce: 0,
                ann_hash1: [0u8; 64],
                parent_block_hash: [0u8; 32],
                content: Arc::new(Vec::new()),
                soft_nonce: 0,
                soft_nonce_max: 0,
                generation: u64::MAX,
            },
            prog: Program::new(),
            ann: Announcement::default(),
        };
        worker.next_job();
        assert_eq!(worker.job.parent_block_hash, parent_block_hash);
        assert_eq!(worker.job.hah.hdr.hard_nonce, shared.miner_id);

        let max = worker.job.soft_nonce_max;
        let mut found_nonce = None;
        for nonce in 0..=max {
            if worker.ann_hash(nonce) {
                found_nonce = Some(nonce);
                break;
            }
        }
        let nonce = found_nonce.expect("an easy target yields an announcement");
        assert!(nonce <= max);
        assert_eq!(worker.ann.soft_nonce(), nonce);

        let work_hash = check_ann(&worker.ann, &parent_block_hash, &mut worker.prog)
            .expect("mined announcement passes validation");
        assert!(work_check(&work_hash, 0x207f_ffff));

        // a different parent hash must not validate
        assert!(check_ann(&worker.ann, &[0x12u8; 32], &mut worker.prog).is_err());

        // any mutation of the proof region invalidates it
        let mut bent = worker.ann.clone();
        bent.merkle_proof_mut()[200] ^= 1;
        assert!(check_ann(&bent, &parent_block_hash, &mut worker.prog).is_err());

        // so does a shifted soft nonce
        let mut shifted = worker.ann.clone();
        shifted.set_soft_nonce(nonce.wrapping_add(1) & 0x00ff_ffff);
        assert!(check_ann(&shifted, &parent_block_hash, &mut worker.prog).is_err());
    }

    /// Workers spawn parked and shut down cleanly without ever mining.
    #[test]
    fn test_worker_pool_lifecycle() {
        let sink = Arc::new(MemorySink::new());
        let miner = AnnMiner::new(
            AnnMinerConfig { miner_id: 1, threads: 2, send_ptr: false, paranoia: false },
            vec![Box::new(Arc::clone(&sink))],
        );
        assert_eq!(miner.hashes_per_second(), 0);
        // stop on a parked pool is a no-op that must not wedge
        miner.stop();
        drop(miner);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_request_round_trip() {
        let req = AnnMinerRequest {
            work_target: 0x2000_0fff,
            parent_block_height: 7,
            parent_block_hash: [0x11; 32],
            signing_key: [0x22; 32],
            max_anns_per_second: 100,
            content_type: 3,
            content_len: 64,
        };
        assert_eq!(AnnMinerRequest::from_bytes(&req.to_bytes()), req);
    }

    #[test]
    fn test_header_and_hash_compare() {
        let mut a = HeaderAndHash::zeroed();
        let b = HeaderAndHash::zeroed();
        assert_eq!(a, b);
        a.hdr.hard_nonce = 1;
        assert_ne!(a, b);
    }
}
