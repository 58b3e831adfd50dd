//! Dynamic part-size selection (C5, spec §4.4): balances memory-per-worker
//! against HTTP overhead, returning a part size in `[MIN_PART_SIZE,
//! MAX_PART_SIZE]` rounded to an AES-block multiple so the orchestrator
//! can hand it straight to the v2 CBC-chained encryptor without further
//! adjustment (spec §4.5: every non-final part must be block-aligned).

use xfer_utils::{AES_BLOCK_SIZE, DEFAULT_PART_SIZE, MAX_PART_SIZE, MIN_PART_SIZE};

/// Chooses a part size for a file of `file_size` bytes split across
/// `threads` workers. Small files that don't need multiple parts still
/// get the default so the multipart-vs-single-part decision stays with
/// the orchestrator, not this function.
pub fn dynamic_part_size(file_size: u64, threads: usize) -> u64 {
    if file_size == 0 {
        return DEFAULT_PART_SIZE;
    }
    let threads = threads.max(1) as u64;
    // Aim for enough parts to keep every worker busy without shrinking
    // parts below the floor (too much HTTP overhead) or growing them
    // past the ceiling (too much memory per worker).
    let target = file_size / (threads * 4).max(1);
    let clamped = target.clamp(MIN_PART_SIZE, MAX_PART_SIZE);
    round_down_to_block(clamped).max(AES_BLOCK_SIZE as u64)
}

fn round_down_to_block(size: u64) -> u64 {
    size - (size % AES_BLOCK_SIZE as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_file_gets_default_part_size() {
        assert_eq!(dynamic_part_size(0, 4), DEFAULT_PART_SIZE);
    }

    #[test]
    fn result_is_always_within_bounds() {
        for size in [1u64, 1_000, 10 * 1024 * 1024, 50 * 1024 * 1024 * 1024] {
            for threads in [1usize, 4, 16, 32] {
                let part = dynamic_part_size(size, threads);
                assert!(part >= MIN_PART_SIZE, "size={size} threads={threads} part={part}");
                assert!(part <= MAX_PART_SIZE);
                assert_eq!(part % AES_BLOCK_SIZE as u64, 0, "part size must be block-aligned");
            }
        }
    }

    #[test]
    fn more_threads_does_not_increase_part_size() {
        let size = 10u64 * 1024 * 1024 * 1024;
        let few = dynamic_part_size(size, 2);
        let many = dynamic_part_size(size, 16);
        assert!(many <= few);
    }
}
