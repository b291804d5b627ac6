//! Per-request resource accumulator
//!
//! Every item vended during a request is recorded together with its vendor.
//! When the request completes, [`Accumulator::finished`] hands each item back
//! in accumulation order, passing the request outcome along. A failing release
//! never stops the ones after it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use func_runner_sdk::Releasable;
use tracing::Span;

use super::guard::contain;

/// Outcome of releasing a request's resources
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Items released successfully
    pub released: usize,
    /// Items whose release failed (logged)
    pub failed: usize,
}

/// Append-only list of vended items awaiting release
#[derive(Default)]
pub struct Accumulator {
    pending: Mutex<Vec<Box<dyn Releasable>>>,
    finished: AtomicBool,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vended item. Safe to call from several threads at once.
    pub fn accumulate(&self, pair: Box<dyn Releasable>) {
        if self.is_finished() {
            tracing::warn!(item = %pair.describe(), "Accumulated after the request finished; dropping it unreleased");
            return;
        }
        tracing::trace!(item = %pair.describe(), "Accumulating");
        self.pending().push(pair);
    }

    /// Number of items waiting for release
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Release every recorded item with the request outcome.
    ///
    /// Runs once; later calls are logged and ignored.
    pub fn finished(&self, success: bool, logger: &Span) -> ReleaseReport {
        logger.in_scope(|| {
            if self.finished.swap(true, Ordering::SeqCst) {
                tracing::warn!("Request already finished; ignoring repeated release");
                return ReleaseReport::default();
            }

            let pairs = std::mem::take(&mut *self.pending());
            tracing::debug!(success, count = pairs.len(), "Finished, releasing resources");

            let mut report = ReleaseReport::default();
            for pair in pairs {
                let item = pair.describe();
                tracing::trace!(item = %item, "Releasing");
                match contain(|| pair.release(success)) {
                    Ok(()) => report.released += 1,
                    Err(failure) => {
                        tracing::warn!(item = %item, error = %failure, "Exception releasing item");
                        report.failed += 1;
                    }
                }
            }
            report
        })
    }

    fn pending(&self) -> MutexGuard<'_, Vec<Box<dyn Releasable>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accumulator")
            .field("pending", &self.pending_count())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use func_runner_sdk::FuncError;
    use std::sync::Arc;
    use tracing_test::traced_test;

    type Log = Arc<Mutex<Vec<(u32, bool)>>>;

    struct Recorded {
        id: u32,
        log: Log,
        fail: bool,
    }

    impl Releasable for Recorded {
        fn release(self: Box<Self>, success: bool) -> Result<(), FuncError> {
            self.log.lock().unwrap().push((self.id, success));
            if self.fail {
                return Err(FuncError::resource(format!("cannot release {}", self.id)));
            }
            Ok(())
        }

        fn describe(&self) -> String {
            format!("item-{}", self.id)
        }
    }

    struct Panicking;

    impl Releasable for Panicking {
        fn release(self: Box<Self>, _success: bool) -> Result<(), FuncError> {
            panic!("vendor blew up")
        }

        fn describe(&self) -> String {
            "panicking".to_string()
        }
    }

    fn item(id: u32, log: &Log, fail: bool) -> Box<dyn Releasable> {
        Box::new(Recorded { id, log: Arc::clone(log), fail })
    }

    #[test]
    fn test_releases_in_order_with_outcome() {
        let log = Log::default();
        let acc = Accumulator::new();
        for id in 0..3 {
            acc.accumulate(item(id, &log, false));
        }
        assert_eq!(acc.pending_count(), 3);

        let report = acc.finished(false, &Span::none());

        assert_eq!(report, ReleaseReport { released: 3, failed: 0 });
        assert_eq!(*log.lock().unwrap(), vec![(0, false), (1, false), (2, false)]);
        assert_eq!(acc.pending_count(), 0);
    }

    #[traced_test]
    #[test]
    fn test_failures_do_not_stop_later_releases() {
        let log = Log::default();
        let acc = Accumulator::new();
        acc.accumulate(item(0, &log, true));
        acc.accumulate(Box::new(Panicking));
        acc.accumulate(item(2, &log, false));

        let report = acc.finished(true, &Span::none());

        assert_eq!(report, ReleaseReport { released: 1, failed: 2 });
        assert_eq!(*log.lock().unwrap(), vec![(0, true), (2, true)]);
        assert!(logs_contain("Exception releasing item"));
    }

    #[test]
    fn test_finished_runs_once() {
        let log = Log::default();
        let acc = Accumulator::new();
        acc.accumulate(item(0, &log, false));

        acc.finished(true, &Span::none());
        let again = acc.finished(true, &Span::none());

        assert_eq!(again, ReleaseReport::default());
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(acc.is_finished());
    }

    #[test]
    fn test_accumulate_after_finish_is_dropped() {
        let log = Log::default();
        let acc = Accumulator::new();
        acc.finished(true, &Span::none());

        acc.accumulate(item(9, &log, false));
        assert_eq!(acc.pending_count(), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_accumulate() {
        let log = Log::default();
        let acc = Arc::new(Accumulator::new());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let acc = Arc::clone(&acc);
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        acc.accumulate(item(t * 100 + i, &log, false));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let report = acc.finished(true, &Span::none());
        assert_eq!(report.released, 100);
        assert_eq!(log.lock().unwrap().len(), 100);
    }
}
