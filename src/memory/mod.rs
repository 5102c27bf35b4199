//! Packet buffer pools with huge page support and NUMA tagging
//!
//! Each pool owns one contiguous mapping holding the mbuf descriptors and
//! their data areas. Allocation is a lock-free free-list pop; buffers carry
//! a back-pointer to their owning pool so they can be released from any
//! thread, and a reference count so the duplicate impairment can clone a
//! frame without copying it.

use crate::{Error, Result};
use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_HUGETLB, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use nix::unistd::{sysconf, SysconfVar};
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Cache line size for descriptor alignment
pub const CACHE_LINE_SIZE: usize = 64;

/// Memory buffer (mbuf) descriptor
#[repr(C, align(64))]
pub struct Mbuf {
    /// Data pointer
    pub data: *mut u8,
    /// Frame length
    pub len: usize,
    /// Total buffer size
    pub buf_len: usize,
    /// Receive timestamp in nanoseconds, 0 when unset
    pub timestamp: u64,
    /// Reference count; the buffer returns to the pool when it reaches zero
    refcnt: AtomicU32,
    /// Owning pool
    pool: *const MbufPool,
    /// Free-list link
    next: AtomicPtr<Mbuf>,
}

impl Mbuf {
    /// Get data as slice
    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    /// Get mutable data as slice over the full buffer
    #[inline]
    pub fn buf_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.buf_len) }
    }

    /// Append data to the frame
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > self.buf_len {
            return Err(Error::MemoryAllocation("mbuf overflow".to_string()));
        }
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.data.add(self.len), data.len());
        }
        self.len += data.len();
        Ok(())
    }

    /// Reset frame state for reuse
    pub fn reset(&mut self) {
        self.len = 0;
        self.timestamp = 0;
    }

    /// NUMA node of the owning pool
    #[inline]
    pub fn numa_node(&self) -> usize {
        unsafe { (*self.pool).numa_node() }
    }
}

unsafe impl Send for Mbuf {}
unsafe impl Sync for Mbuf {}

/// Bump the reference count and return the same buffer
///
/// # Safety
/// `mbuf` must point to a live allocation from an `MbufPool`.
#[inline]
pub unsafe fn mbuf_clone(mbuf: *mut Mbuf) -> *mut Mbuf {
    (*mbuf).refcnt.fetch_add(1, Ordering::Relaxed);
    mbuf
}

/// Drop one reference; the buffer returns to its pool at zero
///
/// # Safety
/// `mbuf` must point to a live allocation from an `MbufPool`, and the caller
/// must own one reference.
#[inline]
pub unsafe fn mbuf_free(mbuf: *mut Mbuf) {
    if mbuf.is_null() {
        return;
    }
    if (*mbuf).refcnt.fetch_sub(1, Ordering::Release) == 1 {
        std::sync::atomic::fence(Ordering::Acquire);
        let pool = (*mbuf).pool;
        (*pool).release(mbuf);
    }
}

/// Huge-page-backed region, with a transparent fallback to regular pages
struct MappedRegion {
    base: *mut u8,
    len: usize,
    huge: bool,
}

impl MappedRegion {
    fn new(size: usize) -> Result<Self> {
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .unwrap_or(Some(4096))
            .unwrap_or(4096) as usize;
        let huge_size = page_size * 512; // 2 MB huge pages
        let aligned = (size + huge_size - 1) / huge_size * huge_size;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_HUGETLB,
                -1,
                0,
            )
        };

        if ptr != MAP_FAILED {
            return Ok(Self {
                base: ptr as *mut u8,
                len: aligned,
                huge: true,
            });
        }

        // Fallback to regular pages if huge pages fail
        let aligned = (size + page_size - 1) / page_size * page_size;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == MAP_FAILED {
            return Err(Error::MemoryAllocation(
                "failed to map pool memory".to_string(),
            ));
        }

        Ok(Self {
            base: ptr as *mut u8,
            len: aligned,
            huge: false,
        })
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, self.len);
        }
    }
}

/// Memory pool for mbufs, tagged with the NUMA node it serves
pub struct MbufPool {
    /// Pool name
    name: String,
    /// Pool size in mbufs
    size: usize,
    /// Buffer size
    buf_size: usize,
    /// NUMA node this pool serves
    numa_node: usize,
    /// Backing mapping
    region: MappedRegion,
    /// Free list head
    free_head: AtomicPtr<Mbuf>,
    /// Available mbufs
    available: AtomicUsize,
}

unsafe impl Send for MbufPool {}
unsafe impl Sync for MbufPool {}

impl MbufPool {
    /// Create a new pool; descriptors and data areas share one mapping
    pub fn new(name: String, size: usize, buf_size: usize, numa_node: usize) -> Result<Arc<Self>> {
        if size == 0 || buf_size == 0 {
            return Err(Error::InvalidConfig(
                "pool size and buffer size must be non-zero".to_string(),
            ));
        }

        let desc_bytes = size * std::mem::size_of::<Mbuf>();
        let total = desc_bytes + size * buf_size;
        let region = MappedRegion::new(total)?;

        let pool = Arc::new(Self {
            name,
            size,
            buf_size,
            numa_node,
            region,
            free_head: AtomicPtr::new(ptr::null_mut()),
            available: AtomicUsize::new(size),
        });

        let mbufs = pool.region.base as *mut Mbuf;
        let data_base = unsafe { pool.region.base.add(desc_bytes) };
        let pool_ptr = Arc::as_ptr(&pool);

        let mut head: *mut Mbuf = ptr::null_mut();
        for i in (0..size).rev() {
            unsafe {
                let mbuf = mbufs.add(i);
                ptr::write(
                    mbuf,
                    Mbuf {
                        data: data_base.add(i * buf_size),
                        len: 0,
                        buf_len: buf_size,
                        timestamp: 0,
                        refcnt: AtomicU32::new(0),
                        pool: pool_ptr,
                        next: AtomicPtr::new(head),
                    },
                );
                head = mbuf;
            }
        }
        pool.free_head.store(head, Ordering::Release);

        log::debug!(
            "pool '{}': {} x {} B on node {} ({})",
            pool.name,
            size,
            buf_size,
            numa_node,
            if pool.region.huge { "huge pages" } else { "regular pages" }
        );

        Ok(pool)
    }

    /// Allocate an mbuf; `Err` maps to a drop counter at the call site
    pub fn alloc(&self) -> Result<*mut Mbuf> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            if head.is_null() {
                return Err(Error::MemoryAllocation(format!(
                    "pool '{}' exhausted",
                    self.name
                )));
            }

            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            if self
                .free_head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                unsafe {
                    (*head).len = 0;
                    (*head).timestamp = 0;
                    (*head).refcnt.store(1, Ordering::Relaxed);
                }
                self.available.fetch_sub(1, Ordering::Relaxed);
                return Ok(head);
            }
        }
    }

    /// Push a zero-reference mbuf back onto the free list
    fn release(&self, mbuf: *mut Mbuf) {
        unsafe {
            (*mbuf).reset();
        }
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            unsafe {
                (*mbuf).next.store(head, Ordering::Relaxed);
            }
            if self
                .free_head
                .compare_exchange_weak(head, mbuf, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                self.available.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    pub fn numa_node(&self) -> usize {
        self.numa_node
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let available = self.available.load(Ordering::Relaxed);
        PoolStats {
            name: self.name.clone(),
            size: self.size,
            buf_size: self.buf_size,
            numa_node: self.numa_node,
            available,
            in_use: self.size - available.min(self.size),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub name: String,
    pub size: usize,
    pub buf_size: usize,
    pub numa_node: usize,
    pub available: usize,
    pub in_use: usize,
}

/// One pool per NUMA node touched by the worker core set
pub struct PoolManager {
    pools: HashMap<usize, Arc<MbufPool>>,
    default_node: usize,
}

impl PoolManager {
    /// Create pools for every NUMA node the given cores live on
    pub fn new(worker_cores: &[usize], pool_size: usize, buf_size: usize) -> Result<Self> {
        let topo = crate::utils::cpu::CpuTopology::detect();
        let mut pools = HashMap::new();
        let mut default_node = usize::MAX;

        for &core in worker_cores {
            let node = topo.numa_node_of(core);
            if default_node == usize::MAX {
                default_node = node;
            }
            if !pools.contains_key(&node) {
                let pool = MbufPool::new(format!("pool_node{}", node), pool_size, buf_size, node)?;
                pools.insert(node, pool);
            }
        }

        if pools.is_empty() {
            return Err(Error::Init("no pools could be created".to_string()));
        }

        Ok(Self {
            pools,
            default_node,
        })
    }

    /// Pool local to the given NUMA node, falling back to the default node
    pub fn pool_for_node(&self, node: usize) -> &Arc<MbufPool> {
        self.pools
            .get(&node)
            .unwrap_or_else(|| &self.pools[&self.default_node])
    }

    /// Allocate from the node-local pool
    pub fn alloc_on(&self, node: usize) -> Result<*mut Mbuf> {
        self.pool_for_node(node).alloc()
    }

    /// Statistics for every pool
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools.values().map(|p| p.stats()).collect();
        stats.sort_by_key(|s| s.numa_node);
        stats
    }
}
