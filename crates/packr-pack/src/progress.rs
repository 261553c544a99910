//! Progress counters and the cancellation channel.

use std::ops::ControlFlow;

/// Snapshot of indexing progress, delivered to the observer.
///
/// `received_*` counters advance during `append`; `indexed_*` counters
/// advance as identities become known (plain objects while streaming,
/// deltas during resolution). `total_deltas` is zero until commit freezes
/// it as `total_objects - indexed_objects`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub received_bytes: u64,
    pub received_objects: u32,
    pub indexed_objects: u32,
    pub indexed_deltas: u32,
    pub total_objects: u32,
    pub total_deltas: u32,
}

/// Observer callback. Returning `ControlFlow::Break(())` aborts the
/// indexer at the next operation boundary with
/// [`PackError::Cancelled`](crate::PackError::Cancelled).
pub type ProgressObserver = Box<dyn FnMut(&Progress) -> ControlFlow<()>>;

/// Emit a snapshot to the observer, mapping a break to `Cancelled`.
pub(crate) fn emit(
    observer: &mut Option<ProgressObserver>,
    progress: &Progress,
) -> Result<(), crate::PackError> {
    match observer {
        Some(cb) => match cb(progress) {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(()) => Err(crate::PackError::Cancelled),
        },
        None => Ok(()),
    }
}
