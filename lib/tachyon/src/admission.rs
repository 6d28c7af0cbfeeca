//! Per-IP connection admission. Tracks concurrent and daily connection
//! counts per remote address and denies connects above the configured cap.

use hashbrown::HashMap;
use quark::clock;
use quark::logging::{self, Logger};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const MS_PER_DAY: u64 = 86_400_000;
/// Zero-connection entries older than this are dropped by the cleanup.
const IDLE_EVICT_MS: u64 = 300_000;
/// Cleanup cadence enforced by the endpoint housekeeping.
pub const CLEANUP_INTERVAL_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub max_connections_per_ip: u32,
}

impl Default for AdmissionConfig {
    fn default() -> AdmissionConfig {
        AdmissionConfig {
            max_connections_per_ip: 32,
        }
    }
}

/// Per-address counters.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionInfo {
    pub current: u32,
    pub total_today: u32,
    pub last_seen_ms: u64,
    pub first_today_ms: u64,
}

/// Concurrent-connection limiter keyed by remote IP.
pub struct AdmissionControl {
    config: AdmissionConfig,
    table: Mutex<HashMap<IpAddr, ConnectionInfo>>,
    cleanup_running: AtomicBool,
    log: Logger,
}

impl AdmissionControl {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: AdmissionConfig, log: L) -> AdmissionControl {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("subsystem" => "admission")),
            None => logging::discard(),
        };

        AdmissionControl {
            config,
            table: Mutex::new(HashMap::new()),
            cleanup_running: AtomicBool::new(false),
            log,
        }
    }

    /// Records a connection attempt. Returns false when the address is at
    /// its concurrency cap; the counters are only advanced on admission.
    pub fn is_connection_allowed(&self, addr: IpAddr) -> bool {
        self.is_connection_allowed_at(addr, clock::unix_millis())
    }

    /// Deterministic variant taking an explicit timestamp.
    pub fn is_connection_allowed_at(&self, addr: IpAddr, now_ms: u64) -> bool {
        let mut table = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let info = table.entry(addr).or_insert(ConnectionInfo {
            current: 0,
            total_today: 0,
            last_seen_ms: now_ms,
            first_today_ms: now_ms,
        });

        // Daily counters reset when the calendar day rolls over
        if now_ms / MS_PER_DAY != info.last_seen_ms / MS_PER_DAY {
            info.total_today = 0;
            info.first_today_ms = now_ms;
        }

        if info.current >= self.config.max_connections_per_ip {
            info.last_seen_ms = now_ms;

            logging::debug!(self.log, "connection denied";
                            "context" => "admission",
                            "remote_ip" => %addr,
                            "current" => info.current,
                            "cap" => self.config.max_connections_per_ip);

            return false;
        }

        info.current += 1;
        info.total_today += 1;
        info.last_seen_ms = now_ms;

        true
    }

    /// Releases one connection slot for the address, clamped at zero.
    pub fn connection_closed(&self, addr: IpAddr) {
        let mut table = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(info) = table.get_mut(&addr) {
            info.current = info.current.saturating_sub(1);
        }
    }

    /// Drops idle zero-connection entries. At most one cleanup runs at a
    /// time; overlapping calls return immediately.
    pub fn cleanup(&self, now_ms: u64) {
        if self
            .cleanup_running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let removed = {
            let mut table = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

            let before = table.len();
            table.retain(|_, info| {
                info.current > 0 || now_ms.saturating_sub(info.last_seen_ms) < IDLE_EVICT_MS
            });
            before - table.len()
        };

        if removed > 0 {
            logging::debug!(self.log, "admission table cleaned";
                            "context" => "cleanup",
                            "removed" => removed);
        }

        self.cleanup_running.store(false, Ordering::Release);
    }

    /// Current counters for an address, if tracked.
    pub fn info(&self, addr: IpAddr) -> Option<ConnectionInfo> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&addr)
            .copied()
    }
}
