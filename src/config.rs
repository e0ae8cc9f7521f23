// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use getset::CopyGetters;

/// The default size of a copy area is 16KiB, a handful of average objects per
/// round trip.
pub const DEFAULT_COPY_AREA_SIZE: usize = 16 << 10;
/// A single object may grow the copy area up to 16MiB.
pub const DEFAULT_MAX_COPY_AREA_SIZE: usize = 16 << 20;
pub const DEFAULT_AREA_ALIGNMENT: usize = 8;
/// Lockset inputs longer than this are deduplicated through a hash set.
pub const DEFAULT_DEDUP_HASH_THRESHOLD: usize = 32;
pub const DEFAULT_TEMP_OID_LIMIT: u32 = i32::MAX as u32 - 2;
pub const DEFAULT_LOCKSET_BATCH_LIMIT: usize = 64;

/// Knobs of a locator session.
#[derive(Debug, Clone, Copy, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct LocatorConfig {
    /// Initial capacity of the flush buffer, in bytes.
    copy_area_size: usize,
    /// Largest size the flush buffer may grow to for a single object.
    max_copy_area_size: usize,
    /// Object bytes in a copy area start on multiples of this.
    area_alignment: usize,
    dedup_hash_threshold: usize,
    /// How many temporary oids can be live before a full flush recycles them.
    temp_oid_limit: u32,
    /// Objects per lockset round trip. Sessions never read it; the server
    /// decides its own batch size, and `LoopbackServer::with_config` takes it
    /// from here.
    lockset_batch_limit: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        LocatorConfigBuilder::new().build()
    }
}

#[derive(Clone, Copy)]
pub struct LocatorConfigBuilder {
    copy_area_size: usize,
    max_copy_area_size: usize,
    area_alignment: usize,
    dedup_hash_threshold: usize,
    temp_oid_limit: u32,
    lockset_batch_limit: usize,
}

impl LocatorConfigBuilder {
    pub fn new() -> Self {
        Self {
            copy_area_size: DEFAULT_COPY_AREA_SIZE,
            max_copy_area_size: DEFAULT_MAX_COPY_AREA_SIZE,
            area_alignment: DEFAULT_AREA_ALIGNMENT,
            dedup_hash_threshold: DEFAULT_DEDUP_HASH_THRESHOLD,
            temp_oid_limit: DEFAULT_TEMP_OID_LIMIT,
            lockset_batch_limit: DEFAULT_LOCKSET_BATCH_LIMIT,
        }
    }

    pub fn copy_area_size(&mut self, copy_area_size: usize) -> &mut Self {
        self.copy_area_size = copy_area_size;
        self
    }

    pub fn max_copy_area_size(&mut self, max_copy_area_size: usize) -> &mut Self {
        self.max_copy_area_size = max_copy_area_size;
        self
    }

    pub fn area_alignment(&mut self, area_alignment: usize) -> &mut Self {
        self.area_alignment = area_alignment;
        self
    }

    pub fn dedup_hash_threshold(&mut self, dedup_hash_threshold: usize) -> &mut Self {
        self.dedup_hash_threshold = dedup_hash_threshold;
        self
    }

    pub fn temp_oid_limit(&mut self, temp_oid_limit: u32) -> &mut Self {
        self.temp_oid_limit = temp_oid_limit;
        self
    }

    pub fn lockset_batch_limit(&mut self, lockset_batch_limit: usize) -> &mut Self {
        self.lockset_batch_limit = lockset_batch_limit;
        self
    }

    pub fn build(self) -> LocatorConfig {
        LocatorConfig {
            copy_area_size: self.copy_area_size,
            max_copy_area_size: self.max_copy_area_size.max(self.copy_area_size),
            area_alignment: self.area_alignment.max(1).next_power_of_two(),
            dedup_hash_threshold: self.dedup_hash_threshold,
            temp_oid_limit: self.temp_oid_limit.max(1),
            lockset_batch_limit: self.lockset_batch_limit.max(1),
        }
    }
}

impl Default for LocatorConfigBuilder {
    fn default() -> Self {
        LocatorConfigBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LocatorConfig::default();
        assert_eq!(cfg.copy_area_size(), DEFAULT_COPY_AREA_SIZE);
        assert_eq!(cfg.temp_oid_limit(), DEFAULT_TEMP_OID_LIMIT);
    }

    #[test]
    fn test_builder_normalizes() {
        let cfg = LocatorConfigBuilder::default()
            .copy_area_size(4096)
            .max_copy_area_size(1024)
            .area_alignment(6)
            .temp_oid_limit(0)
            .build();
        assert_eq!(cfg.max_copy_area_size(), 4096, "max never drops below the initial size");
        assert_eq!(cfg.area_alignment(), 8);
        assert_eq!(cfg.temp_oid_limit(), 1);
    }
}
