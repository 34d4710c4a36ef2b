#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of one fixed-size region of the on-device journal.
///
/// Log groups are the unit of checkpoint and reclamation: once a group
/// fills, the mutations its records describe are flushed and the region is
/// zeroed for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogGroupId(pub u32);

/// Identifier of one logical-to-physical address map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapId(pub u32);

/// Index of one metadata page (mpage) within a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MpageNum(pub u64);

/// Identifier of a host-visible volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub u32);

impl fmt::Display for LogGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MpageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decode a NUL-padded fixed-size region into a trimmed string.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_group_id_orders_numerically() {
        let mut ids = vec![LogGroupId(3), LogGroupId(0), LogGroupId(1)];
        ids.sort();
        assert_eq!(ids, vec![LogGroupId(0), LogGroupId(1), LogGroupId(3)]);
    }

    #[test]
    fn display_is_plain_number() {
        assert_eq!(LogGroupId(7).to_string(), "7");
        assert_eq!(MapId(2).to_string(), "2");
        assert_eq!(MpageNum(1024).to_string(), "1024");
        assert_eq!(VolumeId(0).to_string(), "0");
    }

    #[test]
    fn trim_nul_padded_stops_at_first_nul() {
        let mut region = b"{\"volumes\":[]}".to_vec();
        region.extend(std::iter::repeat(0_u8).take(32));
        assert_eq!(trim_nul_padded(&region), "{\"volumes\":[]}");
    }

    #[test]
    fn trim_nul_padded_handles_unpadded_input() {
        assert_eq!(trim_nul_padded(b"  abc  "), "abc");
        assert_eq!(trim_nul_padded(b""), "");
    }
}
