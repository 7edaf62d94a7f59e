//! Tree configuration (§6).

/// Tunables for a [`crate::tree::Tree`]. Defaults match the reference
/// deployment's defaults described in §6.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Number of frames in the buffer pool's fixed arena.
    pub pool_capacity: usize,
    /// Number of WAL entries between checkpoints.
    pub checkpoint_interval: u64,
    /// The version the tree starts counting from when no prior state exists.
    pub initial_version: u64,
    /// Whether checkpoints run on the background thread (`true`) or inline
    /// with the triggering `SaveVersion` call (`false`).
    pub async_checkpoint: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 500_000,
            checkpoint_interval: 10_000,
            initial_version: 0,
            async_checkpoint: true,
        }
    }
}

impl TreeConfig {
    pub fn builder() -> TreeConfigBuilder {
        TreeConfigBuilder::default()
    }
}

/// Builder for [`TreeConfig`], so callers can override a single field
/// without repeating the others.
#[derive(Debug, Clone, Default)]
pub struct TreeConfigBuilder {
    inner: Option<TreeConfig>,
}

impl TreeConfigBuilder {
    fn base(&mut self) -> &mut TreeConfig {
        self.inner.get_or_insert_with(TreeConfig::default)
    }

    pub fn pool_capacity(mut self, n: usize) -> Self {
        self.base().pool_capacity = n;
        self
    }

    pub fn checkpoint_interval(mut self, n: u64) -> Self {
        self.base().checkpoint_interval = n;
        self
    }

    pub fn initial_version(mut self, n: u64) -> Self {
        self.base().initial_version = n;
        self
    }

    pub fn async_checkpoint(mut self, enabled: bool) -> Self {
        self.base().async_checkpoint = enabled;
        self
    }

    pub fn build(self) -> TreeConfig {
        self.inner.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = TreeConfig::default();
        assert_eq!(cfg.pool_capacity, 500_000);
        assert_eq!(cfg.checkpoint_interval, 10_000);
        assert_eq!(cfg.initial_version, 0);
        assert!(cfg.async_checkpoint);
    }

    #[test]
    fn builder_overrides_single_field() {
        let cfg = TreeConfig::builder().pool_capacity(16).build();
        assert_eq!(cfg.pool_capacity, 16);
        assert_eq!(cfg.checkpoint_interval, 10_000);
    }
}
