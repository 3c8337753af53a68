use std::path::PathBuf;
use std::time::Duration;

use crate::{UploadError, UploadResult};

/// Environment prefix read by [`UploadConfig::from_env`]
pub const ENV_PREFIX: &str = "DOG_UPLOAD__";

/// Configuration for chunked upload assembly
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Root directory for the local filesystem store (staging + public)
    pub storage_root: PathBuf,

    /// Prefix of the public reference handed out on completion
    pub public_base_url: String,

    /// Per-chunk and per-session bounds
    pub limits: UploadLimits,

    /// Sessions idle longer than this are expired by the reaper
    pub idle_timeout: Duration,

    /// How often the reaper sweeps
    pub reaper_interval: Duration,

    /// How long a completed upload is remembered so late retries stay idempotent
    pub completed_retention: Duration,

    /// Consecutive promote failures before a session is marked failed
    pub max_finalize_attempts: u32,

    /// Capacity of the upload event broadcast channel
    pub event_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("uploads"),
            public_base_url: "/uploads/video".to_string(),
            limits: UploadLimits::default(),
            idle_timeout: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(60),
            completed_retention: Duration::from_secs(10 * 60),
            max_finalize_attempts: 3,
            event_capacity: 1000,
        }
    }
}

/// Bounds enforced on incoming chunks and on each session's memory
#[derive(Debug, Clone)]
pub struct UploadLimits {
    /// Max characters in a caller-supplied upload id
    pub max_id_len: usize,

    /// Upper bound on a declared chunk count
    pub max_total_chunks: u32,

    /// Max payload bytes in a single chunk
    pub max_chunk_bytes: usize,

    /// Max chunks held ahead of the cursor for one session
    pub max_buffered_chunks: usize,

    /// Max bytes held ahead of the cursor for one session
    pub max_buffered_bytes: usize,

    /// Absolute max size of an assembled upload
    pub max_upload_bytes: u64,

    /// Max characters in a sanitized public name
    pub max_target_name_len: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_id_len: 128,
            max_total_chunks: 10_000,
            max_chunk_bytes: 8 * 1024 * 1024, // 8MB
            max_buffered_chunks: 64,
            max_buffered_bytes: 64 * 1024 * 1024, // 64MB
            max_upload_bytes: 5 * 1024 * 1024 * 1024, // 5GB
            max_target_name_len: 128,
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load defaults, then apply `DOG_UPLOAD__*` environment overrides.
    ///
    /// `DOG_UPLOAD__LIMITS__MAX_CHUNK_BYTES=1048576` sets `limits.max_chunk_bytes`.
    pub fn from_env() -> UploadResult<Self> {
        Self::from_vars(ENV_PREFIX, std::env::vars())
    }

    /// Apply overrides from any `(key, value)` source carrying `prefix`.
    ///
    /// Keys are normalized by stripping the prefix, lowercasing and mapping
    /// `__` to `.`. Unknown keys are ignored.
    pub fn from_vars<I, K, V>(prefix: &str, vars: I) -> UploadResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            if let Some(stripped) = key.as_ref().strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                config.set(&normalized, value.as_ref())?;
            }
        }
        Ok(config)
    }

    /// Set a single option by its dotted key
    pub fn set(&mut self, key: &str, value: &str) -> UploadResult<()> {
        match key {
            "storage.root" => self.storage_root = PathBuf::from(value),
            "public.base_url" => self.public_base_url = value.trim_end_matches('/').to_string(),
            "idle_timeout_secs" => self.idle_timeout = Duration::from_secs(parse(key, value)?),
            "reaper.interval_secs" => {
                let secs: u64 = parse(key, value)?;
                if secs == 0 {
                    return Err(UploadError::config(key, "reaper interval must be at least 1 second"));
                }
                self.reaper_interval = Duration::from_secs(secs)
            }
            "completed_retention_secs" => {
                self.completed_retention = Duration::from_secs(parse(key, value)?)
            }
            "finalize.max_attempts" => self.max_finalize_attempts = parse(key, value)?,
            "events.capacity" => self.event_capacity = parse(key, value)?,
            "limits.max_id_len" => self.limits.max_id_len = parse(key, value)?,
            "limits.max_total_chunks" => self.limits.max_total_chunks = parse(key, value)?,
            "limits.max_chunk_bytes" => self.limits.max_chunk_bytes = parse(key, value)?,
            "limits.max_buffered_chunks" => self.limits.max_buffered_chunks = parse(key, value)?,
            "limits.max_buffered_bytes" => self.limits.max_buffered_bytes = parse(key, value)?,
            "limits.max_upload_bytes" => self.limits.max_upload_bytes = parse(key, value)?,
            "limits.max_target_name_len" => self.limits.max_target_name_len = parse(key, value)?,
            _ => tracing::debug!("Ignoring unknown upload config key: {}", key),
        }
        Ok(())
    }

    /// Set the storage root
    pub fn with_storage_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.storage_root = root.into();
        self
    }

    /// Set the public reference prefix
    pub fn with_public_base_url<S: Into<String>>(mut self, base: S) -> Self {
        self.public_base_url = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the limits
    pub fn with_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the reaper interval
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Set how long completed uploads are remembered
    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }

    /// Set max consecutive promote failures
    pub fn with_max_finalize_attempts(mut self, attempts: u32) -> Self {
        self.max_finalize_attempts = attempts.max(1);
        self
    }
}

impl UploadLimits {
    /// Create new limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max chunk payload size
    pub fn with_max_chunk_bytes(mut self, bytes: usize) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    /// Set max declared chunk count
    pub fn with_max_total_chunks(mut self, max: u32) -> Self {
        self.max_total_chunks = max;
        self
    }

    /// Set the out-of-order buffer budget
    pub fn with_buffer_budget(mut self, chunks: usize, bytes: usize) -> Self {
        self.max_buffered_chunks = chunks;
        self.max_buffered_bytes = bytes;
        self
    }

    /// Set the max assembled size
    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> UploadResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| UploadError::config(key, format!("{value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("DOG_UPLOAD__STORAGE__ROOT", "/var/lib/uploads"),
            ("DOG_UPLOAD__PUBLIC__BASE_URL", "https://cdn.example.com/media/"),
            ("DOG_UPLOAD__LIMITS__MAX_CHUNK_BYTES", "1048576"),
            ("DOG_UPLOAD__IDLE_TIMEOUT_SECS", "90"),
            ("UNRELATED", "ignored"),
        ];

        let config = UploadConfig::from_vars(ENV_PREFIX, vars).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/var/lib/uploads"));
        assert_eq!(config.public_base_url, "https://cdn.example.com/media");
        assert_eq!(config.limits.max_chunk_bytes, 1_048_576);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.limits.max_total_chunks, 10_000);
    }

    #[test]
    fn test_invalid_override_is_reported() {
        let vars = vec![("DOG_UPLOAD__LIMITS__MAX_TOTAL_CHUNKS", "many")];
        let err = UploadConfig::from_vars(ENV_PREFIX, vars).unwrap_err();
        assert!(matches!(err, UploadError::Config { ref key, .. } if key == "limits.max_total_chunks"));
    }

    #[test]
    fn test_zero_reaper_interval_is_rejected() {
        let vars = vec![("DOG_UPLOAD__REAPER__INTERVAL_SECS", "0")];
        let err = UploadConfig::from_vars(ENV_PREFIX, vars).unwrap_err();
        assert!(matches!(err, UploadError::Config { ref key, .. } if key == "reaper.interval_secs"));

        let vars = vec![("DOG_UPLOAD__REAPER__INTERVAL_SECS", "5")];
        let config = UploadConfig::from_vars(ENV_PREFIX, vars).unwrap();
        assert_eq!(config.reaper_interval, Duration::from_secs(5));
    }
}
