//! Retry-safe progress reader (spec §4.6, §9): wraps one already-buffered
//! ciphertext part (parts are fully materialized in memory by the
//! encryption stage before upload, spec §9 buffer pooling) and reports
//! accumulated bytes read at a coarse threshold. Because retry logic
//! rewinds the body, `Seek(0, Start)` emits a **negative** delta equal to
//! everything previously reported, so a retried part never double-counts
//! progress (testable property 5).

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use xfer_utils::PROGRESS_REPORT_THRESHOLD_BYTES;

pub trait ProgressSink: Send + Sync {
    /// `delta` is signed: positive for newly-read bytes, negative when a
    /// retry rewinds the stream and un-reports what was already counted.
    fn report(&self, delta: i64);
}

/// Lets a type-erased sink be used as `ProgressReader`'s `S` type
/// parameter, so callers that only have a `dyn ProgressSink` (e.g. because
/// they picked the sink at runtime) don't need their own wrapper type.
impl ProgressSink for Arc<dyn ProgressSink> {
    fn report(&self, delta: i64) {
        (**self).report(delta)
    }
}

pub struct ProgressReader<S: ProgressSink> {
    data: bytes::Bytes,
    pos: usize,
    /// Bytes reported to `sink` since the last threshold flush or rewind;
    /// reset to 0 on every report.
    unreported: u64,
    /// Total bytes reported for this buffer since the last rewind —
    /// exactly what a `Seek(0, Start)` must negate.
    reported_since_rewind: u64,
    sink: S,
}

impl<S: ProgressSink> ProgressReader<S> {
    pub fn new(data: bytes::Bytes, sink: S) -> Self {
        Self {
            data,
            pos: 0,
            unreported: 0,
            reported_since_rewind: 0,
            sink,
        }
    }

    fn maybe_flush(&mut self, force: bool) {
        if self.unreported == 0 {
            return;
        }
        if force || self.unreported >= PROGRESS_REPORT_THRESHOLD_BYTES {
            self.sink.report(self.unreported as i64);
            self.reported_since_rewind += self.unreported;
            self.unreported = 0;
        }
    }
}

impl<S: ProgressSink> Read for ProgressReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        self.unreported += n as u64;
        let at_eof = self.pos == self.data.len();
        self.maybe_flush(at_eof);
        Ok(n)
    }
}

impl<S: ProgressSink> Seek for ProgressReader<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(0) => {
                // Flush whatever's pending, then negate everything
                // reported for this buffer so a retry can't double-count.
                self.maybe_flush(true);
                if self.reported_since_rewind > 0 {
                    self.sink.report(-(self.reported_since_rewind as i64));
                    self.reported_since_rewind = 0;
                }
                self.pos = 0;
                Ok(0)
            }
            SeekFrom::Start(n) => {
                self.pos = n as usize;
                Ok(n)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "ProgressReader only supports rewinding to the start",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct VecSink(Arc<Mutex<Vec<i64>>>);
    impl ProgressSink for VecSink {
        fn report(&self, delta: i64) {
            self.0.lock().unwrap().push(delta);
        }
    }

    #[test]
    fn reports_full_length_on_eof_even_under_threshold() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reader = ProgressReader::new(bytes::Bytes::from_static(b"hello world"), VecSink(Arc::clone(&log)));
        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(*log.lock().unwrap(), vec![11]);
    }

    #[test]
    fn retry_rewind_emits_negative_delta_matching_prior_reports() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let data = bytes::Bytes::from(vec![7u8; 5 * 1024 * 1024]);
        let mut reader = ProgressReader::new(data, VecSink(Arc::clone(&log)));
        let mut buf = vec![0u8; 2 * 1024 * 1024];
        reader.read(&mut buf).unwrap(); // 2 MiB, crosses the 1 MiB threshold

        reader.seek(SeekFrom::Start(0)).unwrap();

        let reported: i64 = log.lock().unwrap().iter().sum();
        assert_eq!(reported, 0, "net progress must be zero after a full rewind");
    }

    #[test]
    fn full_read_after_rewind_reports_the_same_total_again() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let data = bytes::Bytes::from(vec![1u8; 1024]);
        let mut reader = ProgressReader::new(data.clone(), VecSink(Arc::clone(&log)));
        let mut buf = vec![0u8; 1024];
        reader.read(&mut buf).unwrap();
        reader.seek(SeekFrom::Start(0)).unwrap();
        reader.read(&mut buf).unwrap();

        let net: i64 = log.lock().unwrap().iter().sum();
        assert_eq!(net, 1024);
    }
}
