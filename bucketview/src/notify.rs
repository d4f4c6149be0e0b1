use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Tags every user-facing notification with the component that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    Listing,
    Versions,
    Upload,
    Deletion,
    Folder,
    Download,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorSource::Listing => "listing",
            ErrorSource::Versions => "versions",
            ErrorSource::Upload => "upload",
            ErrorSource::Deletion => "deletion",
            ErrorSource::Folder => "folder",
            ErrorSource::Download => "download",
        };
        f.write_str(name)
    }
}

/// The single surface user-facing failures and progress are funneled through.
pub trait Notifier: Send + Sync {
    fn error(&self, source: ErrorSource, message: &str);

    fn warning(&self, source: ErrorSource, message: &str);

    fn progress(&self, _key: &str, _percent: u8) {}
}

/// Forwards notifications to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn error(&self, source: ErrorSource, message: &str) {
        tracing::error!(%source, "{message}");
    }

    fn warning(&self, source: ErrorSource, message: &str) {
        tracing::warn!(%source, "{message}");
    }

    fn progress(&self, key: &str, percent: u8) {
        tracing::trace!(key, percent, "upload progress");
    }
}

/// Externally persisted "last known object count" per bucket, used only to
/// pick the pagination strategy.
pub trait CountHintStore: Send + Sync {
    fn load(&self, bucket: &str) -> Option<u64>;

    fn store(&self, bucket: &str, count: u64);
}

#[derive(Debug, Default)]
pub struct MemoryCountHints {
    counts: Mutex<HashMap<String, u64>>,
}

impl MemoryCountHints {
    pub fn with_count(bucket: impl Into<String>, count: u64) -> Self {
        let hints = Self::default();
        hints.store(&bucket.into(), count);
        hints
    }
}

impl CountHintStore for MemoryCountHints {
    fn load(&self, bucket: &str) -> Option<u64> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bucket)
            .copied()
    }

    fn store(&self, bucket: &str, count: u64) {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bucket.to_string(), count);
    }
}
