/// Configuration for a [`BlobCache`](crate::BlobCache) instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of hash slots per region (default: 1024)
    pub max_entries: u32,

    /// Byte capacity of each data region, including its 4-byte magic
    /// (default: 16MB)
    pub max_bytes: u32,

    /// Wipe and recreate the cache files on open (default: false)
    pub reset: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_bytes: 16 * 1024 * 1024, // 16MB
            reset: false,
        }
    }
}

impl CacheConfig {
    /// Create a config with the given capacity limits
    pub fn new(max_entries: u32, max_bytes: u32) -> Self {
        Self {
            max_entries,
            max_bytes,
            ..Default::default()
        }
    }

    /// Set the number of hash slots per region
    pub fn max_entries(mut self, count: u32) -> Self {
        self.max_entries = count;
        self
    }

    /// Set the byte capacity of each data region
    pub fn max_bytes(mut self, bytes: u32) -> Self {
        self.max_bytes = bytes;
        self
    }

    /// Wipe and recreate the cache files on open
    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 1024);
        assert_eq!(config.max_bytes, 16 * 1024 * 1024);
        assert!(!config.reset);
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new(64, 4096).reset(true);
        assert_eq!(config.max_entries, 64);
        assert_eq!(config.max_bytes, 4096);
        assert!(config.reset);

        let config = CacheConfig::default().max_entries(10).max_bytes(204);
        assert_eq!(config.max_entries, 10);
        assert_eq!(config.max_bytes, 204);
    }
}
