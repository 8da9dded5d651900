//! Packet magic and command opcodes.

use std::fmt;

/// First byte of every packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Magic {
    /// Client request.
    Req = 0x80,
    /// Server response.
    Res = 0x81,
    /// Client request carrying framing extras.
    AltReq = 0x08,
    /// Server response carrying framing extras.
    AltRes = 0x18,
    /// Server-initiated request (cluster map notifications).
    ServerReq = 0x82,
    /// Client reply to a server-initiated request.
    ServerRes = 0x83,
}

impl Magic {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x80 => Some(Self::Req),
            0x81 => Some(Self::Res),
            0x08 => Some(Self::AltReq),
            0x18 => Some(Self::AltRes),
            0x82 => Some(Self::ServerReq),
            0x83 => Some(Self::ServerRes),
            _ => None,
        }
    }

    /// True for the two magics that carry a status code instead of a vbucket.
    pub fn is_response(self) -> bool {
        matches!(self, Self::Res | Self::AltRes | Self::ServerRes)
    }

    /// True when the header uses the split frame-length/key-length layout.
    pub fn is_alt(self) -> bool {
        matches!(self, Self::AltReq | Self::AltRes)
    }
}

/// A command opcode.
///
/// Kept open (a newtype rather than an enum) so that packets with opcodes the
/// client does not know about still decode and can be reported.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u8);

macro_rules! opcodes {
    ($($name:ident = $val:literal, $text:literal;)*) => {
        impl Opcode {
            $(pub const $name: Opcode = Opcode($val);)*

            /// Human readable command name.
            pub fn name(self) -> &'static str {
                match self.0 {
                    $($val => $text,)*
                    _ => "Unknown",
                }
            }
        }
    };
}

opcodes! {
    GET = 0x00, "Get";
    SET = 0x01, "Set";
    ADD = 0x02, "Add";
    REPLACE = 0x03, "Replace";
    DELETE = 0x04, "Delete";
    INCREMENT = 0x05, "Increment";
    DECREMENT = 0x06, "Decrement";
    NOOP = 0x0a, "Noop";
    APPEND = 0x0e, "Append";
    PREPEND = 0x0f, "Prepend";
    STAT = 0x10, "Stat";
    TOUCH = 0x1c, "Touch";
    GAT = 0x1d, "GetAndTouch";
    HELLO = 0x1f, "Hello";
    SASL_LIST_MECHS = 0x20, "SASLListMechs";
    SASL_AUTH = 0x21, "SASLAuth";
    SASL_STEP = 0x22, "SASLStep";
    GET_ALL_VB_SEQNOS = 0x48, "GetAllVBSeqnos";
    DCP_OPEN_CONNECTION = 0x50, "DcpOpenConnection";
    DCP_ADD_STREAM = 0x51, "DcpAddStream";
    DCP_CLOSE_STREAM = 0x52, "DcpCloseStream";
    DCP_STREAM_REQ = 0x53, "DcpStreamReq";
    DCP_GET_FAILOVER_LOG = 0x54, "DcpGetFailoverLog";
    DCP_STREAM_END = 0x55, "DcpStreamEnd";
    DCP_SNAPSHOT_MARKER = 0x56, "DcpSnapshotMarker";
    DCP_MUTATION = 0x57, "DcpMutation";
    DCP_DELETION = 0x58, "DcpDeletion";
    DCP_EXPIRATION = 0x59, "DcpExpiration";
    DCP_FLUSH = 0x5a, "DcpFlush";
    DCP_NOOP = 0x5c, "DcpNoop";
    DCP_BUFFER_ACK = 0x5d, "DcpBufferAck";
    DCP_CONTROL = 0x5e, "DcpControl";
    DCP_SYSTEM_EVENT = 0x5f, "DcpSystemEvent";
    DCP_SEQNO_ADVANCED = 0x64, "DcpSeqnoAdvanced";
    DCP_OSO_SNAPSHOT = 0x65, "DcpOsoSnapshot";
    GET_REPLICA = 0x83, "GetReplica";
    SELECT_BUCKET = 0x89, "SelectBucket";
    OBSERVE_SEQNO = 0x91, "ObserveSeqNo";
    OBSERVE = 0x92, "Observe";
    GET_LOCKED = 0x94, "GetLocked";
    UNLOCK = 0x95, "Unlock";
    GET_META = 0xa0, "GetMeta";
    SET_META = 0xa2, "SetMeta";
    DEL_META = 0xa8, "DelMeta";
    GET_CLUSTER_CONFIG = 0xb5, "GetClusterConfig";
    GET_RANDOM = 0xb6, "GetRandom";
    COLLECTIONS_GET_MANIFEST = 0xba, "CollectionsGetManifest";
    COLLECTIONS_GET_ID = 0xbb, "CollectionsGetID";
    SUBDOC_GET = 0xc5, "SubDocGet";
    SUBDOC_EXISTS = 0xc6, "SubDocExists";
    SUBDOC_DICT_ADD = 0xc7, "SubDocDictAdd";
    SUBDOC_DICT_SET = 0xc8, "SubDocDictSet";
    SUBDOC_DELETE = 0xc9, "SubDocDelete";
    SUBDOC_REPLACE = 0xca, "SubDocReplace";
    SUBDOC_ARRAY_PUSH_LAST = 0xcb, "SubDocArrayPushLast";
    SUBDOC_ARRAY_PUSH_FIRST = 0xcc, "SubDocArrayPushFirst";
    SUBDOC_ARRAY_INSERT = 0xcd, "SubDocArrayInsert";
    SUBDOC_ARRAY_ADD_UNIQUE = 0xce, "SubDocArrayAddUnique";
    SUBDOC_COUNTER = 0xcf, "SubDocCounter";
    SUBDOC_MULTI_LOOKUP = 0xd0, "SubDocMultiLookup";
    SUBDOC_MULTI_MUTATION = 0xd1, "SubDocMultiMutation";
    SUBDOC_GET_COUNT = 0xd2, "SubDocGetCount";
    SUBDOC_REPLACE_BODY_WITH_XATTR = 0xd3, "SubDocReplaceBodyWithXattr";
    GET_ERROR_MAP = 0xfe, "GetErrorMap";
}

/// Server-initiated command carried under [`Magic::ServerReq`].
pub const CLUSTER_MAP_CHANGE_NOTIFICATION: Opcode = Opcode(0x01);

impl Opcode {
    /// Whether the key of this command is prefixed with a collection id once
    /// collections have been negotiated.
    pub fn is_collection_encoded(self) -> bool {
        matches!(
            self,
            Self::GET
                | Self::SET
                | Self::ADD
                | Self::REPLACE
                | Self::DELETE
                | Self::INCREMENT
                | Self::DECREMENT
                | Self::APPEND
                | Self::PREPEND
                | Self::TOUCH
                | Self::GAT
                | Self::GET_REPLICA
                | Self::GET_LOCKED
                | Self::UNLOCK
                | Self::GET_META
                | Self::SET_META
                | Self::DEL_META
                | Self::DCP_MUTATION
                | Self::DCP_DELETION
                | Self::DCP_EXPIRATION
        ) || (self.0 >= Self::SUBDOC_GET.0 && self.0 <= Self::SUBDOC_REPLACE_BODY_WITH_XATTR.0)
    }

    /// Whether the request value may be snappy compressed on the way out.
    pub fn is_compressible(self) -> bool {
        matches!(
            self,
            Self::SET | Self::ADD | Self::REPLACE | Self::APPEND | Self::PREPEND
        )
    }

    /// Whether the command changes a document. Used to decide timeout ambiguity.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::SET
                | Self::ADD
                | Self::REPLACE
                | Self::DELETE
                | Self::INCREMENT
                | Self::DECREMENT
                | Self::APPEND
                | Self::PREPEND
                | Self::TOUCH
                | Self::GAT
                | Self::UNLOCK
                | Self::SET_META
                | Self::DEL_META
                | Self::SUBDOC_MULTI_MUTATION
        ) || (self.0 >= Self::SUBDOC_DICT_ADD.0 && self.0 <= Self::SUBDOC_COUNTER.0)
    }

    /// Whether this is one of the change-stream event commands.
    pub fn is_dcp_event(self) -> bool {
        matches!(
            self,
            Self::DCP_SNAPSHOT_MARKER
                | Self::DCP_MUTATION
                | Self::DCP_DELETION
                | Self::DCP_EXPIRATION
                | Self::DCP_STREAM_END
                | Self::DCP_SYSTEM_EVENT
                | Self::DCP_SEQNO_ADVANCED
                | Self::DCP_OSO_SNAPSHOT
        )
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name(), self.0)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
