//! HELLO feature codes.

use std::fmt;

/// A feature code exchanged during HELLO negotiation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HelloFeature(pub u16);

macro_rules! features {
    ($($name:ident = $val:literal, $text:literal;)*) => {
        impl HelloFeature {
            $(pub const $name: HelloFeature = HelloFeature($val);)*

            pub fn name(self) -> &'static str {
                match self.0 {
                    $($val => $text,)*
                    _ => "Unknown",
                }
            }
        }
    };
}

features! {
    DATATYPE = 0x01, "Datatype";
    TLS = 0x02, "TLS";
    TCP_NODELAY = 0x03, "TCPNoDelay";
    SEQNO = 0x04, "MutationSeqno";
    TCP_DELAY = 0x05, "TCPDelay";
    XATTR = 0x06, "Xattr";
    XERROR = 0x07, "XError";
    SELECT_BUCKET = 0x08, "SelectBucket";
    SNAPPY = 0x0a, "Snappy";
    JSON = 0x0b, "JSON";
    DUPLEX = 0x0c, "Duplex";
    CLUSTER_MAP_NOTIF = 0x0d, "ClusterMapChangeNotification";
    UNORDERED_EXEC = 0x0e, "UnorderedExecution";
    DURATIONS = 0x0f, "Tracing";
    ALT_REQUESTS = 0x10, "AltRequestSupport";
    SYNC_REPLICATION = 0x11, "SyncReplication";
    COLLECTIONS = 0x12, "Collections";
    OPEN_TRACING = 0x13, "OpenTracing";
    PRESERVE_EXPIRY = 0x14, "PreserveTTL";
    PITR = 0x16, "PiTR";
    CREATE_AS_DELETED = 0x17, "CreateAsDeleted";
    REPLACE_BODY_WITH_XATTR = 0x19, "ReplaceBodyWithXattr";
}

impl fmt::Debug for HelloFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name(), self.0)
    }
}

impl fmt::Display for HelloFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encodes a feature list as a HELLO request value.
pub fn encode_features(features: &[HelloFeature]) -> Vec<u8> {
    let mut out = Vec::with_capacity(features.len() * 2);
    for f in features {
        out.extend_from_slice(&f.0.to_be_bytes());
    }
    out
}

/// Decodes the feature list of a HELLO response. A trailing odd byte is ignored.
pub fn decode_features(value: &[u8]) -> Vec<HelloFeature> {
    value
        .chunks_exact(2)
        .map(|c| HelloFeature(u16::from_be_bytes([c[0], c[1]])))
        .collect()
}
