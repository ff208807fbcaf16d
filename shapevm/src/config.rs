use std::time::Duration;

use crate::{SettingsError, StructurePolicy};

/// Tunables of one [`VM`](crate::VM) instance.
#[derive(Debug, Clone)]
pub struct VMSettings {
    /// Reserved size of the register file in value slots.
    pub register_file_capacity: usize,
    /// Slots committed at a time when the register file grows. Must divide
    /// `register_file_capacity`.
    pub register_segment_size: usize,
    /// Nesting limit for host code calling back into the interpreter.
    pub max_reentry_depth: usize,
    /// Entries of a polymorphic property cache before it goes generic.
    pub poly_cache_size: usize,
    /// Add-property chain length after which objects go dictionary.
    pub max_transition_length: u32,
    /// Mismatched writes a structure tolerates before it stops recording
    /// specific function values.
    pub specific_function_thrash_threshold: u32,
    /// Inline property slots of ordinary objects.
    pub inline_capacity: u32,
    /// Cells allocated between two collections.
    pub gc_threshold: usize,
    /// Loop back-edges and call prologues before the watchdog fires.
    pub watchdog_tick_limit: Option<u64>,
    /// Wall clock budget of one top-level evaluation.
    pub watchdog_time_limit: Option<Duration>,
}

impl Default for VMSettings {
    fn default() -> Self {
        Self {
            register_file_capacity: 1 << 20, // 8 MB of slots
            register_segment_size: 4096,
            max_reentry_depth: 128,
            poly_cache_size: 8,
            max_transition_length: 64,
            specific_function_thrash_threshold: 3,
            inline_capacity: 6,
            gc_threshold: 16_384,
            watchdog_tick_limit: None,
            watchdog_time_limit: None,
        }
    }
}

impl VMSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.register_segment_size == 0 || self.register_file_capacity == 0 {
            return Err(SettingsError::ZeroSize("register file"));
        }
        if !self
            .register_file_capacity
            .is_multiple_of(self.register_segment_size)
        {
            return Err(SettingsError::SegmentMismatch {
                capacity: self.register_file_capacity,
                segment: self.register_segment_size,
            });
        }
        if self.poly_cache_size < 2 || self.poly_cache_size > 64 {
            return Err(SettingsError::OutOfRange {
                name: "poly_cache_size",
                value: self.poly_cache_size as u64,
            });
        }
        if self.max_transition_length == 0 {
            return Err(SettingsError::ZeroSize("max_transition_length"));
        }
        if self.max_reentry_depth == 0 {
            return Err(SettingsError::ZeroSize("max_reentry_depth"));
        }
        if self.gc_threshold == 0 {
            return Err(SettingsError::ZeroSize("gc_threshold"));
        }
        if self.watchdog_tick_limit == Some(0) {
            return Err(SettingsError::ZeroSize("watchdog_tick_limit"));
        }
        Ok(())
    }

    pub fn structure_policy(&self) -> StructurePolicy {
        StructurePolicy {
            max_transition_length: self.max_transition_length,
            specific_function_thrash_threshold: self
                .specific_function_thrash_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(VMSettings::default().validate().is_ok());
    }

    #[test]
    fn misaligned_segments_are_rejected() {
        let settings = VMSettings {
            register_file_capacity: 1000,
            register_segment_size: 300,
            ..VMSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::SegmentMismatch { .. })
        ));
    }

    #[test]
    fn tiny_poly_caches_are_rejected() {
        let settings = VMSettings {
            poly_cache_size: 1,
            ..VMSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
