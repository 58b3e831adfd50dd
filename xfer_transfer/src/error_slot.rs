//! `setError` helper (spec §4.7: "on first error any worker calls a
//! `setError` helper (idempotent) that cancels the context"). Only the
//! first error is kept; later ones are dropped on the floor since the
//! caller only ever surfaces the first.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use xfer_utils::TransferError;

#[derive(Default)]
pub struct ErrorSlot {
    error: Mutex<Option<TransferError>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, cancel: &CancellationToken, err: TransferError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        cancel.cancel();
    }

    pub fn take(&self) -> Option<TransferError> {
        self.error.lock().take()
    }
}
