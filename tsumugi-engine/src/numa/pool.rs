//! Structured fork-join worker pool.
//!
//! One long-lived worker per tid, bound to its core for the process
//! lifetime. The calling thread is tid 0 and takes iteration 0 itself, so
//! state touched by tid 0 stays in the main-thread node. A region is a
//! data-parallel loop whose iteration `i` always runs on worker `i`; the
//! completion latch at region exit is the only synchronization.

use super::ThreadMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type JobRef = &'static (dyn Fn(usize) + Sync);

enum Msg {
    Run(JobRef),
    Exit,
}

struct Latch {
    pending: Mutex<usize>,
    done: Condvar,
    poisoned: AtomicBool,
}

pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Msg>>,
    latch: Arc<Latch>,
    handles: Vec<thread::JoinHandle<()>>,
    n_threads: usize,
}

fn pin_to_cpu(cpu: u32) {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = cpu;
}

impl WorkerPool {
    /// Spawn workers for tids `1..n_threads` and pin the calling thread to
    /// the tid 0 core.
    pub fn spawn(map: &ThreadMap) -> WorkerPool {
        let latch = Arc::new(Latch {
            pending: Mutex::new(0),
            done: Condvar::new(),
            poisoned: AtomicBool::new(false),
        });

        if let Some(&cpu) = map.tid_to_proc_id.first() {
            pin_to_cpu(cpu);
        }

        let mut senders = Vec::new();
        let mut handles = Vec::new();
        for tid in 1..map.n_threads {
            let (tx, rx) = mpsc::channel::<Msg>();
            let cpu = map.tid_to_proc_id[tid];
            let latch = Arc::clone(&latch);
            let handle = thread::Builder::new()
                .name(format!("tsumugi-w{tid}"))
                .spawn(move || {
                    pin_to_cpu(cpu);
                    while let Ok(msg) = rx.recv() {
                        match msg {
                            Msg::Run(job) => {
                                let r = std::panic::catch_unwind(
                                    std::panic::AssertUnwindSafe(|| job(tid)),
                                );
                                if r.is_err() {
                                    latch.poisoned.store(true, Ordering::SeqCst);
                                }
                                let mut pending = latch.pending.lock().unwrap();
                                *pending -= 1;
                                if *pending == 0 {
                                    latch.done.notify_all();
                                }
                            }
                            Msg::Exit => break,
                        }
                    }
                })
                .expect("worker spawn failed");
            senders.push(tx);
            handles.push(handle);
        }

        WorkerPool {
            senders,
            latch,
            handles,
            n_threads: map.n_threads,
        }
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Run `f(tid)` for `tid` in `0..n`, iteration `i` on worker `i`.
    /// The call returns only after every iteration has finished; the
    /// borrow of `f` therefore outlives every use on the workers.
    pub fn parallel_for<F: Fn(usize) + Sync>(&self, n: usize, f: F) {
        let n = n.min(self.n_threads).max(1);
        if n == 1 {
            f(0);
            return;
        }

        let f_ref: &(dyn Fn(usize) + Sync) = &f;
        // lifetime erased; the latch wait below bounds every use
        let job: JobRef = unsafe { std::mem::transmute(f_ref) };

        {
            let mut pending = self.latch.pending.lock().unwrap();
            *pending = n - 1;
        }
        for tx in &self.senders[..n - 1] {
            tx.send(Msg::Run(job)).expect("worker channel closed");
        }

        f(0);

        let mut pending = self.latch.pending.lock().unwrap();
        while *pending != 0 {
            pending = self.latch.done.wait(pending).unwrap();
        }
        drop(pending);

        if self.latch.poisoned.swap(false, Ordering::SeqCst) {
            panic!("worker panicked inside a parallel region");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for tx in &self.senders {
            let _ = tx.send(Msg::Exit);
        }
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::Topology;
    use std::sync::atomic::AtomicUsize;

    fn pool(n: usize) -> WorkerPool {
        let topo = Topology {
            n_nodes: 1,
            mt_node: 0,
            n_procs: n,
            proc_list: (0..n as u32).collect(),
            proc_node: vec![0; n],
            node_nprocs: vec![n],
        };
        let map = ThreadMap::new(&topo, n as i32, 1);
        WorkerPool::spawn(&map)
    }

    #[test]
    fn test_every_tid_runs_once() {
        let p = pool(4);
        let hits: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();
        p.parallel_for(4, |tid| {
            hits[tid].fetch_add(1, Ordering::SeqCst);
        });
        for h in &hits {
            assert_eq!(h.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_disjoint_slice_writes() {
        let p = pool(3);
        let mut out = vec![0u32; 12];
        let base = out.as_mut_ptr() as usize;
        p.parallel_for(3, |tid| {
            // each tid owns rows [tid*4, tid*4+4)
            let slice =
                unsafe { std::slice::from_raw_parts_mut((base as *mut u32).add(tid * 4), 4) };
            for (i, v) in slice.iter_mut().enumerate() {
                *v = (tid * 100 + i) as u32;
            }
        });
        assert_eq!(out[0], 0);
        assert_eq!(out[5], 101);
        assert_eq!(out[11], 203);
    }

    #[test]
    fn test_iteration_count_below_thread_count() {
        let p = pool(4);
        let hits: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();
        p.parallel_for(2, |tid| {
            hits[tid].fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits[0].load(Ordering::SeqCst), 1);
        assert_eq!(hits[1].load(Ordering::SeqCst), 1);
        assert_eq!(hits[2].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_regions_are_sequential() {
        let p = pool(4);
        let counter = AtomicUsize::new(0);
        for _ in 0..50 {
            p.parallel_for(4, |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }
}
