//! A bounded work queue of file paths.
//!
//! A master thread scans a directory and mirrors matching filenames into
//! free slots; worker threads claim slots, process the files outside the
//! lock, and mark them done. A file must be seen on two consecutive scans
//! before it is queued, which debounces files still being written.

use log::warn;
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

pub const QUEUE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Done,
    Todo,
    InProgress,
}

struct Slot {
    state: SlotState,
    name: String,
}

struct Inner {
    slots: Vec<Slot>,
    should_stop: bool,
}

/// A claimed unit of work; hand it back to `worker_get_work` when finished.
pub struct WorkHandle {
    slot: usize,
    pub path: PathBuf,
}

pub struct WorkQueue {
    dir: PathBuf,
    prefix: String,
    inner: Mutex<Inner>,
    cond: Condvar,
    /// Master-private mirror of discovered names, indexed like the slots.
    master: Mutex<Vec<String>>,
}

impl WorkQueue {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        WorkQueue {
            dir: dir.into(),
            prefix: prefix.to_string(),
            inner: Mutex::new(Inner {
                slots: (0..QUEUE_SIZE)
                    .map(|_| Slot { state: SlotState::Done, name: String::new() })
                    .collect(),
                should_stop: false,
            }),
            cond: Condvar::new(),
            master: Mutex::new(vec![String::new(); QUEUE_SIZE]),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Mark `completed` done (if any) and block for the next TODO slot.
    /// `None` once the queue is stopping.
    pub fn worker_get_work(&self, completed: Option<WorkHandle>) -> Option<WorkHandle> {
        let mut inner = self.inner.lock();
        if let Some(done) = completed {
            inner.slots[done.slot].state = SlotState::Done;
        }
        loop {
            if inner.should_stop {
                return None;
            }
            self.cond.wait(&mut inner);
            for (i, slot) in inner.slots.iter_mut().enumerate() {
                if slot.state != SlotState::Todo {
                    continue;
                }
                slot.state = SlotState::InProgress;
                return Some(WorkHandle { slot: i, path: self.dir.join(&slot.name) });
            }
        }
    }

    /// One master pass: scan the directory, remember matching names, and
    /// promote names seen on a previous pass into free slots. Returns true
    /// when there was nothing to pick up (the caller may sleep).
    pub fn master_scan(&self) -> bool {
        let mut seen_known = false;
        {
            let mut master = self.master.lock();
            let entries = match std::fs::read_dir(&self.dir) {
                Ok(e) => e,
                Err(e) => {
                    warn!("cannot scan {}: {e}", self.dir.display());
                    return true;
                }
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with(&self.prefix) {
                    continue;
                }
                let mut empty_slot = None;
                let mut exists = false;
                for (i, slot_name) in master.iter().enumerate() {
                    if slot_name.is_empty() {
                        empty_slot = Some(i);
                    } else if *slot_name == name {
                        exists = true;
                        break;
                    }
                }
                if !exists {
                    if let Some(i) = empty_slot {
                        master[i] = name;
                    }
                }
                seen_known |= exists;
            }
            if !seen_known {
                return true;
            }

            let mut inner = self.inner.lock();
            for i in 0..QUEUE_SIZE {
                if inner.slots[i].state != SlotState::Done {
                    continue;
                }
                if master[i].is_empty() {
                    // nothing here
                } else if inner.slots[i].name == master[i] {
                    // this file has been processed; forget it
                    master[i].clear();
                } else {
                    inner.slots[i].state = SlotState::Todo;
                    inner.slots[i].name = master[i].clone();
                }
            }
            self.cond.notify_all();
        }
        false
    }

    /// Ask workers to exit at their next wake-up.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.should_stop = true;
        self.cond.notify_all();
    }
}

/// Spawn `count` workers draining the queue through `handler`.
pub fn spawn_workers<F>(
    queue: Arc<WorkQueue>,
    count: usize,
    handler: F,
) -> Vec<thread::JoinHandle<()>>
where
    F: Fn(&Path) + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    (0..count)
        .map(|i| {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            thread::Builder::new()
                .name(format!("queue-worker-{i}"))
                .spawn(move || {
                    let mut completed = None;
                    while let Some(work) = queue.worker_get_work(completed.take()) {
                        handler(&work.path);
                        completed = Some(work);
                    }
                })
                .expect("spawn queue worker")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_scan_debounces_new_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("anns_1.bin"), b"a").expect("write");
        let q = WorkQueue::new(dir.path(), "anns_");
        // first sighting: remembered but not queued
        assert!(q.master_scan());
        // second sighting: queued
        assert!(!q.master_scan());
        let inner = q.inner.lock();
        assert!(inner.slots.iter().any(|s| s.state == SlotState::Todo && s.name == "anns_1.bin"));
    }

    #[test]
    fn test_nonmatching_files_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("other.bin"), b"x").expect("write");
        let q = WorkQueue::new(dir.path(), "anns_");
        assert!(q.master_scan());
        assert!(q.master_scan());
    }

    #[test]
    fn test_workers_process_and_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("anns_{i}.bin")), b"a").expect("write");
        }
        let q = Arc::new(WorkQueue::new(dir.path(), "anns_"));
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let handles = {
            let seen = Arc::clone(&seen);
            let count = Arc::clone(&count);
            spawn_workers(Arc::clone(&q), 3, move |path| {
                seen.lock().insert(path.file_name().unwrap().to_string_lossy().into_owned());
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        // drive the master until everything has been handed out
        for _ in 0..200 {
            q.master_scan();
            if count.load(Ordering::SeqCst) >= 5 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        q.stop();
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(seen.lock().len(), 5);
    }
}
