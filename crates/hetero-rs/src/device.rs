use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Family tag of the always-present host CPU backend.
pub const CPU_FAMILY: &str = "cpu";

/// Broad class of a physical compute unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// Identity of one physical compute unit.
///
/// Devices are enumerated by their family when it is registered and never change afterwards; the
/// pair `(family, ordinal)` is unique across the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    family: Arc<str>,
    ordinal: usize,
    kind: DeviceKind,
}

impl Device {
    pub fn new(family: impl Into<Arc<str>>, ordinal: usize, kind: DeviceKind) -> Self {
        Self {
            family: family.into(),
            ordinal,
            kind,
        }
    }

    pub fn cpu() -> Self {
        Self::new(CPU_FAMILY, 0, DeviceKind::Cpu)
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.ordinal)
    }
}

/// Free/total memory snapshot of a device in bytes.
///
/// Best effort: concurrent allocations elsewhere in the process may already have changed it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub free: usize,
    pub total: usize,
}

impl MemoryInfo {
    pub fn used(&self) -> usize {
        self.total.saturating_sub(self.free)
    }
}

/// Per-device introspection exposed by every backend family.
///
/// Ordinals must lie in `0..count()`; passing anything else is a programming error and panics.
pub trait DeviceQuery {
    /// Number of devices the family enumerates.
    fn count(&self) -> usize;

    /// Human-readable device description (for example the marketing name of a GPU).
    fn describe(&self, ordinal: usize) -> String;

    fn memory(&self, ordinal: usize) -> MemoryInfo;

    /// Writes the description into a caller-owned, NUL-terminated byte buffer.
    ///
    /// Returns the number of description bytes written, excluding the terminator.
    fn write_description(&self, ordinal: usize, out: &mut [u8]) -> usize {
        write_c_string(&self.describe(ordinal), out)
    }
}

/// Copies `src` into `out` as a NUL-terminated string, truncating on a UTF-8 boundary.
///
/// At most `out.len() - 1` bytes of text are written; an empty buffer is left untouched.
pub fn write_c_string(src: &str, out: &mut [u8]) -> usize {
    let Some(limit) = out.len().checked_sub(1) else {
        return 0;
    };
    let mut len = src.len().min(limit);
    while !src.is_char_boundary(len) {
        len -= 1;
    }
    out[..len].copy_from_slice(&src.as_bytes()[..len]);
    out[len] = 0;
    len
}

/// Panics unless `ordinal` addresses one of `count` devices of `family`.
#[track_caller]
pub fn check_ordinal(family: &str, ordinal: usize, count: usize) {
    assert!(
        ordinal < count,
        "{family} device ordinal {ordinal} out of range (device count {count})"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_without_splitting_multibyte_chars() {
        let mut out = [0xffu8; 6];
        // "é" is two bytes; five text bytes would cut it in half.
        let written = write_c_string("abcdé", &mut out);
        assert_eq!(written, 4);
        assert_eq!(&out[..5], b"abcd\0");
        assert_eq!(out[5], 0xff);
    }

    #[test]
    fn zero_capacity_writes_nothing() {
        let mut out: [u8; 0] = [];
        assert_eq!(write_c_string("gpu", &mut out), 0);
    }

    #[test]
    fn display_uses_family_and_ordinal() {
        assert_eq!(Device::new("cuda", 3, DeviceKind::Gpu).to_string(), "cuda:3");
        assert_eq!(Device::cpu().to_string(), "cpu:0");
    }
}
