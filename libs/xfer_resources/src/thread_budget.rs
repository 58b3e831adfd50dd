//! Thread budget sizing and allocation (C5, spec §4.4).
//!
//! The engine treats worker threads as a single process-wide pool:
//! [`ResourceManager::total_budget`] computes how large that pool is from
//! core count and available memory, and [`ResourceManager::allocate`] /
//! [`ResourceManager::release`] hand out slices of it per transfer.

use parking_lot::Mutex;
use xfer_utils::{MAX_THREADS, MEMORY_PER_THREAD_BYTES, MIN_THREADS};

/// `cpu * 2`, floored at [`MIN_THREADS`], ceilinged at [`MAX_THREADS`], and
/// further capped so that `threads * MEMORY_PER_THREAD_BYTES` never exceeds
/// the memory budget the caller reports as available.
pub fn total_thread_budget(cpu_count: usize, available_memory_bytes: u64) -> usize {
    let cpu_bound = (cpu_count.saturating_mul(2)).clamp(MIN_THREADS, MAX_THREADS);
    let memory_bound = (available_memory_bytes / MEMORY_PER_THREAD_BYTES) as usize;
    cpu_bound.min(memory_bound.max(MIN_THREADS))
}

/// Example allocation table from spec §4.4: thread count by file size.
/// The 100 MiB-500 MiB gap is not covered by the source examples; this
/// port fills it with the next step down (2 threads) so the table stays
/// monotonic rather than jumping straight from 1 to 4 (see DESIGN.md).
fn base_threads_for_size(file_size: u64) -> usize {
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;
    match file_size {
        s if s < 100 * MIB => 1,
        s if s < 500 * MIB => 2,
        s if s < GIB => 4,
        s if s < 5 * GIB => 8,
        s if s < 10 * GIB => 12,
        _ => 16,
    }
}

/// Applies "aggressive mode": for files >= 1 GiB, multiply the base
/// allocation by up to 2x, bounded by the number of CPU cores.
fn apply_aggressive(base: usize, file_size: u64, cpu_count: usize, aggressive: bool) -> usize {
    const GIB: u64 = 1024 * 1024 * 1024;
    if aggressive && file_size >= GIB {
        (base * 2).min(cpu_count.max(MIN_THREADS))
    } else {
        base
    }
}

/// Desired worker-thread count for a transfer of `file_size` bytes, before
/// clamping against the remaining pool budget.
pub fn desired_threads_for_transfer(file_size: u64, cpu_count: usize, aggressive: bool) -> usize {
    let base = base_threads_for_size(file_size);
    apply_aggressive(base, file_size, cpu_count, aggressive)
}

/// A reservation of worker threads from the process-wide pool. Dropping
/// without calling [`ResourceManager::release`] leaks the reservation for
/// the lifetime of the manager (callers are expected to release
/// explicitly in a `finally`-style path); this mirrors the teacher's
/// `ConcurrencyLimiter` permits, which are scoped to the holder instead.
#[derive(Debug, Clone, Copy)]
pub struct ThreadAllocation {
    pub threads: usize,
}

struct PoolState {
    total: usize,
    available: usize,
}

/// Process-wide thread budget. One instance is expected per embedder
/// process, shared across every concurrent upload/download.
pub struct ResourceManager {
    state: Mutex<PoolState>,
    cpu_count: usize,
}

impl ResourceManager {
    pub fn new(cpu_count: usize, available_memory_bytes: u64) -> Self {
        let total = total_thread_budget(cpu_count, available_memory_bytes);
        Self {
            state: Mutex::new(PoolState {
                total,
                available: total,
            }),
            cpu_count,
        }
    }

    pub fn total_threads(&self) -> usize {
        self.state.lock().total
    }

    pub fn available_threads(&self) -> usize {
        self.state.lock().available
    }

    /// Reserves threads for one transfer, never returning more than the
    /// pool has free and never fewer than 1 (a transfer always gets at
    /// least one worker, even under full contention).
    pub fn allocate(&self, file_size: u64, aggressive: bool) -> ThreadAllocation {
        let desired = desired_threads_for_transfer(file_size, self.cpu_count, aggressive);
        let mut state = self.state.lock();
        let granted = desired.min(state.available).max(1).min(state.total);
        state.available = state.available.saturating_sub(granted);
        tracing::debug!(desired, granted, available = state.available, "allocated transfer threads");
        ThreadAllocation { threads: granted }
    }

    pub fn release(&self, allocation: ThreadAllocation) {
        let mut state = self.state.lock();
        state.available = (state.available + allocation.threads).min(state.total);
    }

    /// Grants one additional thread beyond an existing allocation, for a
    /// transfer whose [`crate::ThroughputMonitor`] reports it could use
    /// more concurrency mid-flight. Returns `false` if the pool is fully
    /// committed.
    pub fn try_acquire_one(&self) -> bool {
        let mut state = self.state.lock();
        if state.available == 0 {
            return false;
        }
        state.available -= 1;
        true
    }

    /// Returns a single thread acquired via [`Self::try_acquire_one`].
    pub fn release_one(&self) {
        let mut state = self.state.lock();
        state.available = (state.available + 1).min(state.total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_bound_dominates_for_small_memory() {
        let budget = total_thread_budget(4, 1024 * 1024 * 1024); // 1 GiB / 128 MiB = 8
        assert_eq!(budget, 8.min(8)); // cpu_bound = 8, memory_bound = 8
    }

    #[test]
    fn memory_bound_caps_even_with_many_cores() {
        let budget = total_thread_budget(64, 256 * 1024 * 1024); // memory_bound = 2
        assert_eq!(budget, 2);
    }

    #[test]
    fn floor_and_ceiling_hold() {
        assert!(total_thread_budget(0, u64::MAX) >= MIN_THREADS);
        assert!(total_thread_budget(1000, u64::MAX) <= MAX_THREADS);
    }

    #[rstest::rstest]
    #[case(50 * 1024 * 1024, 1)]
    #[case(600 * 1024 * 1024, 4)]
    #[case(2 * 1024 * 1024 * 1024, 8)]
    #[case(7 * 1024 * 1024 * 1024, 12)]
    #[case(20 * 1024 * 1024 * 1024, 16)]
    fn allocation_table_matches_spec_examples(#[case] size: u64, #[case] expected: usize) {
        assert_eq!(base_threads_for_size(size), expected);
    }

    #[test]
    fn aggressive_mode_doubles_large_files_bounded_by_cores() {
        let size = 2 * 1024 * 1024 * 1024;
        let normal = desired_threads_for_transfer(size, 32, false);
        let aggressive = desired_threads_for_transfer(size, 32, true);
        assert_eq!(aggressive, (normal * 2).min(32));
    }

    #[test]
    fn allocate_and_release_round_trip() {
        let manager = ResourceManager::new(4, 4 * 1024 * 1024 * 1024);
        let total = manager.total_threads();
        let alloc = manager.allocate(2 * 1024 * 1024 * 1024, false);
        assert!(manager.available_threads() < total);
        manager.release(alloc);
        assert_eq!(manager.available_threads(), total);
    }

    #[test]
    fn allocation_never_exceeds_available_pool() {
        let manager = ResourceManager::new(2, 256 * 1024 * 1024); // total budget likely small
        let huge = 100 * 1024 * 1024 * 1024;
        let alloc = manager.allocate(huge, true);
        assert!(alloc.threads <= manager.total_threads());
    }
}
