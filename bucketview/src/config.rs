use std::time::Duration;

const DEFAULT_PAGE_LIMIT: u32 = 10;
const DEFAULT_BATCH_SIZE: u32 = 1000;
const DEFAULT_NATIVE_PAGE_SIZE: u32 = 1000;
const DEFAULT_WINDOWED_THRESHOLD: u64 = 10_000;
const DEFAULT_MAX_OBJECT_SIZE: u64 = 30 * 1024 * 1024 * 1024;
const DEFAULT_PART_SIZE: u64 = 64 * 1024 * 1024;
const DEFAULT_PART_CONCURRENCY: usize = 4;
const DEFAULT_DELETE_WORKERS: usize = 3;
const DEFAULT_VERSION_LOOKUP_KEYS: u32 = 100;
const DEFAULT_PRESIGN_SECS: u64 = 3600;
const MAX_DUPLICATES_REPORTED: usize = 5;
const MAX_DUPLICATE_CANDIDATES: usize = 100;

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Rows per UI page.
    pub page_limit: u32,
    /// Keys fetched per round trip in windowed pagination.
    pub batch_size: u32,
    /// Page size used when draining a prefix to count it.
    pub native_page_size: u32,
    /// Object counts above this switch a bucket to windowed pagination.
    pub windowed_threshold: u64,
    pub max_object_size: u64,
    pub part_size: u64,
    pub part_concurrency: usize,
    pub delete_workers: usize,
    pub max_duplicates: usize,
    pub duplicate_scan_limit: usize,
    pub version_lookup_keys: u32,
    pub presign_expiry: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
            native_page_size: DEFAULT_NATIVE_PAGE_SIZE,
            windowed_threshold: DEFAULT_WINDOWED_THRESHOLD,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            part_size: DEFAULT_PART_SIZE,
            part_concurrency: DEFAULT_PART_CONCURRENCY,
            delete_workers: DEFAULT_DELETE_WORKERS,
            max_duplicates: MAX_DUPLICATES_REPORTED,
            duplicate_scan_limit: MAX_DUPLICATE_CANDIDATES,
            version_lookup_keys: DEFAULT_VERSION_LOOKUP_KEYS,
            presign_expiry: Duration::from_secs(DEFAULT_PRESIGN_SECS),
        }
    }
}

impl BrowserConfig {
    pub fn from_env() -> Self {
        Self {
            page_limit: read_u64_env("BUCKETVIEW_PAGE_LIMIT", DEFAULT_PAGE_LIMIT.into()) as u32,
            batch_size: read_u64_env("BUCKETVIEW_BATCH_SIZE", DEFAULT_BATCH_SIZE.into()) as u32,
            native_page_size: read_u64_env(
                "BUCKETVIEW_NATIVE_PAGE_SIZE",
                DEFAULT_NATIVE_PAGE_SIZE.into(),
            ) as u32,
            windowed_threshold: read_u64_env(
                "BUCKETVIEW_WINDOWED_THRESHOLD",
                DEFAULT_WINDOWED_THRESHOLD,
            ),
            max_object_size: read_u64_env("BUCKETVIEW_MAX_OBJECT_SIZE", DEFAULT_MAX_OBJECT_SIZE),
            part_size: read_u64_env("BUCKETVIEW_PART_SIZE", DEFAULT_PART_SIZE),
            part_concurrency: read_u64_env(
                "BUCKETVIEW_PART_CONCURRENCY",
                DEFAULT_PART_CONCURRENCY as u64,
            ) as usize,
            delete_workers: read_u64_env("BUCKETVIEW_DELETE_WORKERS", DEFAULT_DELETE_WORKERS as u64)
                as usize,
            version_lookup_keys: read_u64_env(
                "BUCKETVIEW_VERSION_LOOKUP_KEYS",
                DEFAULT_VERSION_LOOKUP_KEYS.into(),
            ) as u32,
            presign_expiry: Duration::from_secs(read_u64_env(
                "BUCKETVIEW_PRESIGN_SECS",
                DEFAULT_PRESIGN_SECS,
            )),
            ..Self::default()
        }
    }

    /// Windowed batches always hold a whole number of UI pages.
    pub fn batch_len(&self, limit: u32) -> u32 {
        let limit = limit.max(1);
        (self.batch_size / limit).max(1) * limit
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    parse_positive(std::env::var(name).ok().as_deref()).unwrap_or(default)
}

fn parse_positive(value: Option<&str>) -> Option<u64> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}
