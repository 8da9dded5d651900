//! Datatype bits and durability levels.

/// Value is JSON.
pub const DATATYPE_JSON: u8 = 0x01;
/// Value is snappy compressed.
pub const DATATYPE_COMPRESSED: u8 = 0x02;
/// Value is prefixed with extended attributes.
pub const DATATYPE_XATTR: u8 = 0x04;

/// Synchronous replication level requested on a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    Majority = 0x01,
    MajorityAndPersistOnMaster = 0x02,
    PersistToMajority = 0x03,
}

impl DurabilityLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Majority),
            0x02 => Some(Self::MajorityAndPersistOnMaster),
            0x03 => Some(Self::PersistToMajority),
            _ => None,
        }
    }
}
