use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime cache configuration, already parsed from the config file.
///
/// A zero `cleanup_interval` or `auto_save` disables the corresponding
/// background task.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Entries older than this are removed by the eviction task.
    pub ttl: Duration,
    /// How often the eviction task runs.
    pub cleanup_interval: Duration,
    /// How often the full snapshot is written to disk.
    pub auto_save: Duration,
    /// Path of the embedded store file.
    pub db_path: PathBuf,
    /// Entity type → name of the field the hash-derived ID is computed from.
    pub cached_fields: HashMap<String, String>,
}

impl CacheConfig {
    /// Baseline configuration: `host` and `group` hashed by their `name`.
    pub fn with_defaults(db_path: PathBuf) -> Self {
        CacheConfig {
            ttl: Duration::from_secs(3 * 24 * 3600),
            cleanup_interval: Duration::from_secs(12 * 3600),
            auto_save: Duration::from_secs(600),
            db_path,
            cached_fields: HashMap::from([
                ("host".to_string(), "name".to_string()),
                ("group".to_string(), "name".to_string()),
            ]),
        }
    }
}
