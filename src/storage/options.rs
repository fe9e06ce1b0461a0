use std::path::Path;

use serde::Deserialize;

use crate::storage::block::SizeLadder;
use crate::types::{BigMapError, Result};

/// Smallest accepted maximum block size.
pub const MIN_BLOCK_SIZE: usize = 64;
/// Largest accepted maximum block size (record offsets must fit the layout).
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Configuration options supplied when opening a [`super::BigSortedMap`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Largest capacity a block may grow to, in bytes.
    pub max_block_size: usize,
    /// Capacity of freshly created blocks; must be a size-ladder class.
    pub initial_block_size: usize,
    /// Memory ceiling in bytes; writes are refused once it is reached.
    pub max_memory: Option<u64>,
    /// Tombstone ratio above which a block compacts on its own.
    pub compaction_ratio: f64,
    /// Fraction of the maximum block size two neighbours must fit in to merge.
    pub merge_ratio: f64,
    /// Whether the arena keeps a table of live regions to catch mismatches.
    pub track_allocations: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_block_size: 4096,
            initial_block_size: 256,
            max_memory: None,
            compaction_ratio: 0.25,
            merge_ratio: 0.5,
            track_allocations: false,
        }
    }
}

impl EngineOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let options: EngineOptions = toml::from_str(src)?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path)?;
        tracing::debug!(target: "bigmap::engine", path = %path.display(), "loaded engine options");
        Self::from_toml_str(&src)
    }

    /// Sets the maximum block size.
    pub fn max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes;
        self
    }

    /// Sets the initial block size.
    pub fn initial_block_size(mut self, bytes: usize) -> Self {
        self.initial_block_size = bytes;
        self
    }

    /// Sets the memory ceiling.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Sets the tombstone ratio that triggers compaction.
    pub fn compaction_ratio(mut self, ratio: f64) -> Self {
        self.compaction_ratio = ratio;
        self
    }

    /// Sets the merge ratio.
    pub fn merge_ratio(mut self, ratio: f64) -> Self {
        self.merge_ratio = ratio;
        self
    }

    /// Enables or disables allocation tracking in the arena.
    pub fn track_allocations(mut self, enabled: bool) -> Self {
        self.track_allocations = enabled;
        self
    }

    /// Returns the size ladder implied by `max_block_size`.
    pub fn ladder(&self) -> SizeLadder {
        SizeLadder::new(self.max_block_size)
    }

    /// Checks that the options describe a usable engine.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.max_block_size)
            || self.max_block_size % 16 != 0
        {
            return Err(BigMapError::Config(format!(
                "max_block_size must be a multiple of 16 in {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}, got {}",
                self.max_block_size
            )));
        }
        if !self.ladder().contains(self.initial_block_size) {
            return Err(BigMapError::Config(format!(
                "initial_block_size {} is not a size class of max_block_size {}",
                self.initial_block_size, self.max_block_size
            )));
        }
        for (name, ratio) in [
            ("compaction_ratio", self.compaction_ratio),
            ("merge_ratio", self.merge_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(BigMapError::Config(format!(
                    "{name} must be in (0, 1], got {ratio}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineOptions::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let options = EngineOptions::from_toml_str(
            r#"
            max_block_size = 8192
            initial_block_size = 1024
            max_memory = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(options.max_block_size, 8192);
        assert_eq!(options.initial_block_size, 1024);
        assert_eq!(options.max_memory, Some(1 << 20));
        assert_eq!(options.compaction_ratio, 0.25);
    }

    #[test]
    fn rejects_initial_size_off_the_ladder() {
        let err = EngineOptions::new().initial_block_size(300).validate();
        assert!(matches!(err, Err(BigMapError::Config(_))));
    }

    #[test]
    fn loads_options_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bigmap.toml");
        std::fs::write(&path, "max_block_size = 2048\nmerge_ratio = 0.75\n").unwrap();
        let options = EngineOptions::from_toml_path(&path).unwrap();
        assert_eq!(options.max_block_size, 2048);
        assert_eq!(options.merge_ratio, 0.75);
        assert_eq!(options.initial_block_size, 256);

        let missing = EngineOptions::from_toml_path(dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(BigMapError::Io(_))));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(EngineOptions::from_toml_str("block = 1").is_err());
    }
}
