use quark::logging::{self, Logger};
use std::cmp;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Default size classes and their share of the configured buffer total.
pub const DEFAULT_ALLOCATIONS: &[(usize, f64)] = &[
    (256, 0.40),
    (512, 0.25),
    (1024, 0.15),
    (2048, 0.10),
    (4096, 0.05),
    (8192, 0.03),
    (16384, 0.02),
];

const DEFAULT_TOTAL_BUFFERS: usize = 1024;

// Elastic capacity bounds
const GROW_STEP_CAP: usize = 1024;
const MAX_CAPACITY: usize = 8192;
const SHRINK_STEP: usize = 20;
const SHRINK_MARGIN: usize = 16;

/// Buffer pool sizing: the buffer total and how it is split across the size
/// classes. Fractions must not sum above 1.0.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub total_buffers: usize,
    pub allocations: Vec<(usize, f64)>,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            total_buffers: DEFAULT_TOTAL_BUFFERS,
            allocations: DEFAULT_ALLOCATIONS.to_vec(),
        }
    }
}

struct SubPool {
    size: usize,
    shelf: Mutex<Vec<Box<[u8]>>>,
    capacity: AtomicUsize,
    min_capacity: usize,
    misses: AtomicUsize,
}

/// Point-in-time counters for one size class.
#[derive(Copy, Clone, Debug)]
pub struct PoolStats {
    pub size: usize,
    pub free: usize,
    pub capacity: usize,
    pub misses: usize,
}

/// Size-segmented pool of byte buffers with elastic per-class capacity.
/// Buffers are zeroed when returned, never when rented. The pool is a
/// cheap-to-clone handle over shared state; leases keep the state alive.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    pools: Vec<SubPool>,
    log: Logger,
}

impl BufferPool {
    /// Allocates the sub-pools up front according to the configuration.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: &PoolConfig, log: L) -> BufferPool {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("subsystem" => "buffer_pool")),
            None => logging::discard(),
        };

        let mut allocations = config.allocations.clone();
        allocations.sort_by_key(|&(size, _)| size);

        let total_share: f64 = allocations.iter().map(|&(_, fraction)| fraction).sum();
        if total_share > 1.0 + 1e-9 {
            panic!("Buffer allocation fractions sum to {}, must be <= 1.0", total_share);
        }

        let pools = allocations
            .into_iter()
            .map(|(size, fraction)| {
                let count = cmp::max(1, (config.total_buffers as f64 * fraction) as usize);
                let shelf = (0..count)
                    .map(|_| vec![0u8; size].into_boxed_slice())
                    .collect::<Vec<_>>();

                SubPool {
                    size,
                    shelf: Mutex::new(shelf),
                    capacity: AtomicUsize::new(count),
                    min_capacity: count,
                    misses: AtomicUsize::new(0),
                }
            })
            .collect();

        BufferPool {
            shared: Arc::new(PoolShared { pools, log }),
        }
    }

    /// Rents a buffer at least `size` bytes large from the smallest adequate
    /// size class. Requests above the largest class are served with one-off
    /// unpooled allocations of the exact size.
    pub fn rent(&self, size: usize) -> BufferLease {
        let class = match self.class_for(size) {
            Some(class) => class,
            None => {
                return BufferLease {
                    pool: None,
                    class: 0,
                    buf: Some(vec![0u8; size].into_boxed_slice()),
                    len: 0,
                };
            }
        };

        let pool = &self.shared.pools[class];

        let (buf, free) = {
            let mut shelf = pool.shelf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            (shelf.pop(), shelf.len())
        };

        let buf = match buf {
            Some(buf) => buf,
            None => {
                pool.misses.fetch_add(1, Ordering::Relaxed);
                vec![0u8; pool.size].into_boxed_slice()
            }
        };

        // Running low on pooled buffers triggers an elastic capacity raise
        if free * 4 <= pool.capacity.load(Ordering::Relaxed) {
            self.shared.grow(class);
        }

        BufferLease {
            pool: Some(self.shared.clone()),
            class,
            buf: Some(buf),
            len: 0,
        }
    }

    /// Counters for the size class serving `size`.
    pub fn stats(&self, size: usize) -> Option<PoolStats> {
        let class = self.class_for(size)?;
        let pool = &self.shared.pools[class];

        let free = pool.shelf.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len();

        Some(PoolStats {
            size: pool.size,
            free,
            capacity: pool.capacity.load(Ordering::Relaxed),
            misses: pool.misses.load(Ordering::Relaxed),
        })
    }

    fn class_for(&self, size: usize) -> Option<usize> {
        self.shared.pools.iter().position(|pool| pool.size >= size)
    }
}

impl PoolShared {
    fn grow(&self, class: usize) {
        let pool = &self.pools[class];
        let capacity = pool.capacity.load(Ordering::Relaxed);

        let step = cmp::min(
            GROW_STEP_CAP,
            cmp::max(4, capacity.next_power_of_two() / 4),
        );
        let raised = cmp::min(capacity + step, MAX_CAPACITY);

        if raised != capacity {
            pool.capacity.store(raised, Ordering::Relaxed);

            logging::debug!(self.log, "sub-pool capacity raised";
                            "context" => "grow",
                            "size" => pool.size,
                            "capacity" => raised);
        }
    }

    fn give_back(&self, class: usize, mut buf: Box<[u8]>) {
        for byte in buf.iter_mut() {
            *byte = 0;
        }

        let pool = &self.pools[class];
        let capacity = pool.capacity.load(Ordering::Relaxed);

        let mut shelf = pool.shelf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if shelf.len() < capacity {
            shelf.push(buf);
        }

        // A persistently idle surplus lowers the capacity back down and
        // releases the now-excess buffers
        if shelf.len() > capacity * 3 / 4 + SHRINK_MARGIN {
            let step = cmp::min(SHRINK_STEP, capacity - pool.min_capacity);

            if step > 0 {
                let lowered = capacity - step;
                pool.capacity.store(lowered, Ordering::Relaxed);
                shelf.truncate(lowered);

                logging::debug!(self.log, "sub-pool capacity lowered";
                                "context" => "shrink",
                                "size" => pool.size,
                                "capacity" => lowered);
            }
        }
    }
}

/// Ownership handle for a rented buffer range. Dropping the lease zeroes the
/// buffer and returns it to its sub-pool.
pub struct BufferLease {
    pool: Option<Arc<PoolShared>>,
    class: usize,
    buf: Option<Box<[u8]>>,
    len: usize,
}

impl std::fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("class", &self.class)
            .field("capacity", &self.buf.as_ref().map(|buf| buf.len()))
            .field("len", &self.len)
            .finish()
    }
}

impl BufferLease {
    /// Total capacity of the underlying buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().expect("Lease already released").len()
    }

    /// Length of the filled region.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks the first `len` bytes as filled.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        if len > self.capacity() {
            panic!("Fill length {} exceeds lease capacity {}", len, self.capacity());
        }

        self.len = len;
    }

    /// The filled region.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        let len = self.len;
        &self.buf.as_ref().expect("Lease already released")[..len]
    }

    /// The full writable buffer, irrespective of the filled length.
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("Lease already released")
    }

    /// Copies `data` into the start of the buffer and marks it filled.
    #[inline]
    pub fn fill_from(&mut self, data: &[u8]) {
        self.buffer_mut()[..data.len()].copy_from_slice(data);
        self.len = data.len();
    }
}

impl Deref for BufferLease {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Some(pool) = self.pool.take() {
                pool.give_back(self.class, buf);
            }
        }
    }
}
