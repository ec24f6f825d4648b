//! OperationSummary: the counters and per-error accounting the trailing
//! summary line is built from (spec §7).

use std::fmt;

use parking_lot::Mutex;

/// Shared, mutex-protected counters (spec §4.5.6: "all mutations of shared
/// counters... must be serialized under a single mutex").
#[derive(Default)]
pub struct SummaryCounters {
    inner: Mutex<Counters>,
}

#[derive(Default, Clone)]
struct Counters {
    examined: u64,
    transferred: u64,
    skipped_ignored: u64,
    skipped_up_to_date: u64,
    deleted: u64,
    errors: u64,
    error_messages: Vec<String>,
}

impl SummaryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn examine(&self) {
        self.inner.lock().examined += 1;
    }

    pub fn transfer(&self) {
        self.examine();
        self.inner.lock().transferred += 1;
    }

    pub fn skip_ignored(&self) {
        self.examine();
        self.inner.lock().skipped_ignored += 1;
    }

    pub fn skip_up_to_date(&self) {
        self.examine();
        self.inner.lock().skipped_up_to_date += 1;
    }

    pub fn delete(&self) {
        self.inner.lock().deleted += 1;
    }

    pub fn error(&self, message: impl Into<String>) {
        self.examine();
        let mut c = self.inner.lock();
        c.errors += 1;
        c.error_messages.push(message.into());
    }

    pub fn snapshot(&self) -> OperationSummary {
        let c = self.inner.lock().clone();
        OperationSummary {
            examined: c.examined,
            transferred: c.transferred,
            skipped_ignored: c.skipped_ignored,
            skipped_up_to_date: c.skipped_up_to_date,
            deleted: c.deleted,
            errors: c.errors,
            error_messages: c.error_messages,
        }
    }
}

/// A frozen snapshot of [`SummaryCounters`] returned to the caller at the end
/// of `Reconcile` (spec §6.6).
#[derive(Debug, Clone, Default)]
pub struct OperationSummary {
    pub examined: u64,
    pub transferred: u64,
    pub skipped_ignored: u64,
    pub skipped_up_to_date: u64,
    pub deleted: u64,
    pub errors: u64,
    pub error_messages: Vec<String>,
}

impl fmt::Display for OperationSummary {
    /// Spec §7's trailing summary line format. `deleted` is tracked on the
    /// struct for callers that need it (e.g. dry-run logging) but isn't part
    /// of this line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={}, transferred={}, skipped(ignored)={}, skipped(up-to-date)={}, errors={}",
            self.examined, self.transferred, self.skipped_ignored, self.skipped_up_to_date, self.errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_spec_7_format() {
        let counters = SummaryCounters::new();
        counters.transfer();
        counters.skip_ignored();
        counters.skip_up_to_date();
        counters.error("boom");
        let summary = counters.snapshot();
        assert_eq!(
            summary.to_string(),
            "examined=4, transferred=1, skipped(ignored)=1, skipped(up-to-date)=1, errors=1"
        );
    }
}
