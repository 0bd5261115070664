//! Row-sharded weight storage.
//!
//! A `WDat` describes one logical `[z][y][x]` block (z enumerates layers,
//! and layer*expert slots for MoE). Rows are partitioned contiguously over
//! the worker tids; each shard lives in the memory node of its owner thread,
//! shards of one node fused into a single allocation so a thread's stride
//! across layers is the per-node total.

use crate::error::{Result, RtError};
use crate::kernels::{SIMD_LV, WType};
use crate::numa::ThreadMap;
use std::io::Read;
use std::ptr::NonNull;
#[cfg(target_os = "linux")]
use tracing::debug;

// ---------------------------------------------------------------------------
// node-bound allocation

/// A zeroed, 32-byte-aligned allocation placed (best effort) in one memory
/// node.
pub(crate) struct NodeBlock {
    ptr: NonNull<u8>,
    size: usize,
    #[cfg(target_os = "linux")]
    mapped: bool,
}

unsafe impl Send for NodeBlock {}
unsafe impl Sync for NodeBlock {}

impl NodeBlock {
    pub fn alloc(size: usize, node: usize) -> Result<NodeBlock> {
        let size = size.max(1);
        #[cfg(target_os = "linux")]
        {
            let p = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if p == libc::MAP_FAILED {
                return Err(RtError::Model(format!("node {node} alloc of {size} bytes failed")));
            }
            // bind pages to the node; advisory, first-touch decides otherwise
            let mask: u64 = 1 << (node as u64);
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_mbind,
                    p,
                    size,
                    2, // MPOL_BIND
                    &mask as *const u64,
                    64usize,
                    0,
                )
            };
            if rc != 0 {
                debug!("mbind to node {node} unavailable");
            }
            Ok(NodeBlock {
                ptr: NonNull::new(p as *mut u8).unwrap(),
                size,
                mapped: true,
            })
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = node;
            let layout = std::alloc::Layout::from_size_align(size, 32)
                .map_err(|e| RtError::Model(e.to_string()))?;
            let p = unsafe { std::alloc::alloc_zeroed(layout) };
            match NonNull::new(p) {
                Some(ptr) => Ok(NodeBlock { ptr, size }),
                None => Err(RtError::Model(format!("alloc of {size} bytes failed"))),
            }
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for NodeBlock {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if self.mapped {
                unsafe {
                    libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        unsafe {
            let layout = std::alloc::Layout::from_size_align_unchecked(self.size, 32);
            std::alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

/// A zeroed f32 run-state buffer, 32-byte aligned, placed in one node.
pub struct AlignedF32 {
    block: NodeBlock,
    len: usize,
}

impl AlignedF32 {
    pub fn zeroed(len: usize, node: usize) -> Result<AlignedF32> {
        let block = NodeBlock::alloc(len * 4, node)?;
        Ok(AlignedF32 { block, len })
    }
}

impl std::ops::Deref for AlignedF32 {
    type Target = [f32];
    fn deref(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.block.as_ptr() as *const f32, self.len) }
    }
}

impl std::ops::DerefMut for AlignedF32 {
    fn deref_mut(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.block.as_ptr() as *mut f32, self.len) }
    }
}

// ---------------------------------------------------------------------------
// sharded weight tensor

/// One tid's view of a `WDat`: shard base pointer and per-z byte stride.
struct WPart {
    ptr: *mut u8,
    sz_l: usize,
}

pub struct WDat {
    pub d_type: WType,
    pub wx: usize,
    pub wy: usize,
    pub nz: usize,
    /// Row split size per tid.
    pub dy: usize,
    /// Elements loaded so far; a complete load holds `nz * wy * wx`.
    pub ne: usize,
    blocks: Vec<NodeBlock>,
    parts: Vec<WPart>,
}

// Shards are written only by the loader; afterwards all access is read-only.
unsafe impl Send for WDat {}
unsafe impl Sync for WDat {}

impl WDat {
    /// Placeholder for an absent optional tensor; holds no memory.
    pub fn unallocated() -> WDat {
        WDat {
            d_type: WType::F32,
            wx: 0,
            wy: 0,
            nz: 0,
            dy: 0,
            ne: 0,
            blocks: Vec::new(),
            parts: Vec::new(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.wx != 0
    }

    /// Row size in bytes.
    pub fn row_bytes(&self) -> usize {
        self.d_type.byte_len(self.wx)
    }

    /// Allocate row-sharded storage. `mm_split` shards rows over the worker
    /// tids; otherwise the whole block lives in the main-thread node.
    pub fn alloc(
        map: &ThreadMap,
        nz: usize,
        wy: usize,
        wx: usize,
        d_type: WType,
        mm_split: bool,
    ) -> Result<WDat> {
        if d_type == WType::F12 && wx % SIMD_LV != 0 {
            return Err(RtError::Model(format!(
                "tensor row size {wx} not a multiple of {SIMD_LV}, required for f12 packing"
            )));
        }

        let n_thrd = if mm_split { map.n_threads } else { 1 };
        let dy = wy.div_ceil(n_thrd);
        let sz_wx = d_type.byte_len(wx);

        // rows stored per node and the node used by each tid
        let n_nodes = map
            .tid_to_node_id
            .iter()
            .map(|&n| n as usize + 1)
            .max()
            .unwrap_or(1)
            .max(map.mt_node + 1);
        let mut dy_node = vec![0usize; n_nodes];
        let mut tid_node = vec![usize::MAX; n_thrd];
        for tid in 0..n_thrd {
            let y = tid * dy;
            let dyt = ThreadMap::shard_rows(y, dy, wy);
            if dyt > 0 {
                let node = if mm_split {
                    map.tid_to_node_id[tid] as usize
                } else {
                    map.mt_node
                };
                dy_node[node] += dyt;
                tid_node[tid] = node;
            }
        }

        // one allocation per populated node
        let mut blocks = Vec::new();
        let mut node_cursor: Vec<Option<(*mut u8, usize)>> = vec![None; n_nodes];
        for (node, &rows) in dy_node.iter().enumerate() {
            if rows > 0 {
                let sz_l = rows * sz_wx;
                let block = NodeBlock::alloc(nz * sz_l, node)?;
                node_cursor[node] = Some((block.as_ptr(), sz_l));
                blocks.push(block);
            }
        }

        // tid shard pointers; rows of one node pack in tid order
        let mut parts = Vec::with_capacity(n_thrd);
        for &node in &tid_node {
            if node == usize::MAX {
                parts.push(WPart {
                    ptr: std::ptr::null_mut(),
                    sz_l: 0,
                });
                continue;
            }
            let cursor = node_cursor[node].as_mut().unwrap();
            parts.push(WPart {
                ptr: cursor.0,
                sz_l: cursor.1,
            });
            cursor.0 = unsafe { cursor.0.add(dy * sz_wx) };
        }

        Ok(WDat {
            d_type,
            wx,
            wy,
            nz,
            dy,
            ne: 0,
            blocks,
            parts,
        })
    }

    /// Number of rows owned by `tid`.
    pub fn rows_of(&self, tid: usize) -> usize {
        if tid >= self.parts.len() {
            return 0;
        }
        ThreadMap::shard_rows(tid * self.dy, self.dy, self.wy)
    }

    /// Shard count that can carry matmul work.
    pub fn n_parts(&self) -> usize {
        self.parts.len()
    }

    /// Bytes of `tid`'s shard for slot `z`.
    pub fn part_slice(&self, tid: usize, z: usize) -> &[u8] {
        let rows = self.rows_of(tid);
        if rows == 0 {
            return &[];
        }
        let p = &self.parts[tid];
        unsafe { std::slice::from_raw_parts(p.ptr.add(z * p.sz_l), rows * self.row_bytes()) }
    }

    /// Single-part f32 row for slot `z` (norm weights, biases, rope tables).
    pub fn row_f32(&self, z: usize) -> &[f32] {
        debug_assert_eq!(self.d_type, WType::F32);
        debug_assert_eq!(self.parts.len(), 1);
        let p = &self.parts[0];
        unsafe { std::slice::from_raw_parts(p.ptr.add(z * p.sz_l) as *const f32, self.wx) }
    }

    /// Raw bytes of embedding-like row `y` of slot 0, across shards.
    pub fn emb_row(&self, y: usize) -> &[u8] {
        let tid = (y / self.dy).min(self.parts.len() - 1);
        let r = y - tid * self.dy;
        let p = &self.parts[tid];
        let sz_wx = self.row_bytes();
        unsafe { std::slice::from_raw_parts(p.ptr.add(r * sz_wx), sz_wx) }
    }

    fn part_slice_mut(&mut self, tid: usize, z: usize) -> &mut [u8] {
        let rows = self.rows_of(tid);
        if rows == 0 {
            return &mut [];
        }
        let sz_wx = self.row_bytes();
        let p = &self.parts[tid];
        unsafe { std::slice::from_raw_parts_mut(p.ptr.add(z * p.sz_l), rows * sz_wx) }
    }

    /// Copy one z slot from a contiguous buffer into the shards.
    pub fn copy_z(&mut self, z: usize, src: &[u8]) {
        let sz_wx = self.row_bytes();
        debug_assert!(src.len() >= self.wy * sz_wx);
        if self.blocks.len() == 1 {
            // single node: shards are contiguous in tid order
            let dst = unsafe {
                std::slice::from_raw_parts_mut(
                    self.parts[0].ptr.add(z * self.parts[0].sz_l),
                    self.wy * sz_wx,
                )
            };
            dst.copy_from_slice(&src[..self.wy * sz_wx]);
        } else {
            let mut ofs = 0usize;
            for tid in 0..self.parts.len() {
                let rows = self.rows_of(tid);
                if rows == 0 {
                    continue;
                }
                let n = rows * sz_wx;
                self.part_slice_mut(tid, z).copy_from_slice(&src[ofs..ofs + n]);
                ofs += n;
            }
        }
        self.ne += self.wy * self.wx;
    }

    /// Stream one z slot from a reader straight into the shards.
    pub fn read_z(&mut self, z: usize, r: &mut impl Read) -> Result<()> {
        if self.blocks.len() == 1 {
            let sz_wx = self.row_bytes();
            let dst = unsafe {
                std::slice::from_raw_parts_mut(
                    self.parts[0].ptr.add(z * self.parts[0].sz_l),
                    self.wy * sz_wx,
                )
            };
            r.read_exact(dst)?;
        } else {
            for tid in 0..self.parts.len() {
                if self.rows_of(tid) == 0 {
                    continue;
                }
                r.read_exact(self.part_slice_mut(tid, z))?;
            }
        }
        self.ne += self.wy * self.wx;
        Ok(())
    }

    /// Verify every element was loaded.
    pub fn assert_loaded(&self, name: &str) -> Result<()> {
        let want = self.nz * self.wy * self.wx;
        if self.ne != want {
            return Err(RtError::Model(format!(
                "incomplete weight load for {name}: {} of {want} elements",
                self.ne
            )));
        }
        Ok(())
    }
}
