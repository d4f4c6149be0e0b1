use std::sync::{Arc, Mutex};

use bucketview_core::MemoryStorage;

use super::{Browser, BrowserObject};
use crate::config::BrowserConfig;
use crate::notify::{ErrorSource, MemoryCountHints, Notifier};

mod deletion;
mod uploads;

#[derive(Default)]
pub(super) struct RecordingNotifier {
    errors: Mutex<Vec<(ErrorSource, String)>>,
    warnings: Mutex<Vec<(ErrorSource, String)>>,
    progress: Mutex<Vec<(String, u8)>>,
}

impl RecordingNotifier {
    pub(super) fn errors(&self) -> Vec<(ErrorSource, String)> {
        self.errors.lock().unwrap().clone()
    }

    pub(super) fn errors_from(&self, source: ErrorSource) -> Vec<String> {
        self.errors()
            .into_iter()
            .filter(|(s, _)| *s == source)
            .map(|(_, message)| message)
            .collect()
    }

    pub(super) fn warnings(&self) -> Vec<(ErrorSource, String)> {
        self.warnings.lock().unwrap().clone()
    }

    pub(super) fn progress(&self) -> Vec<(String, u8)> {
        self.progress.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn error(&self, source: ErrorSource, message: &str) {
        self.errors.lock().unwrap().push((source, message.to_string()));
    }

    fn warning(&self, source: ErrorSource, message: &str) {
        self.warnings
            .lock()
            .unwrap()
            .push((source, message.to_string()));
    }

    fn progress(&self, key: &str, percent: u8) {
        self.progress.lock().unwrap().push((key.to_string(), percent));
    }
}

pub(super) struct Harness {
    pub browser: Browser,
    pub storage: Arc<MemoryStorage>,
    pub notifier: Arc<RecordingNotifier>,
    pub hints: Arc<MemoryCountHints>,
}

pub(super) fn harness(storage: MemoryStorage, config: BrowserConfig) -> Harness {
    harness_with_hints(storage, config, MemoryCountHints::default())
}

pub(super) fn harness_with_hints(
    storage: MemoryStorage,
    config: BrowserConfig,
    hints: MemoryCountHints,
) -> Harness {
    let storage = Arc::new(storage);
    let notifier = Arc::new(RecordingNotifier::default());
    let hints = Arc::new(hints);
    let browser = Browser::with_parts(config, notifier.clone(), hints.clone());
    browser.init(storage.clone());
    Harness {
        browser,
        storage,
        notifier,
        hints,
    }
}

pub(super) fn keys(rows: &[BrowserObject]) -> Vec<String> {
    rows.iter().map(|row| row.key.clone()).collect()
}

pub(super) fn row(browser: &Browser, key: &str) -> BrowserObject {
    browser
        .snapshot()
        .files
        .into_iter()
        .find(|row| row.key == key)
        .unwrap_or_else(|| panic!("row {key} not listed"))
}
