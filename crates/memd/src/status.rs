//! Response status codes.

use std::fmt;

/// A response status code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Status(pub u16);

macro_rules! statuses {
    ($($name:ident = $val:literal, $text:literal;)*) => {
        impl Status {
            $(pub const $name: Status = Status($val);)*

            /// Human readable status name.
            pub fn name(self) -> &'static str {
                match self.0 {
                    $($val => $text,)*
                    _ => "Unknown",
                }
            }
        }
    };
}

statuses! {
    SUCCESS = 0x00, "Success";
    KEY_NOT_FOUND = 0x01, "KeyNotFound";
    KEY_EXISTS = 0x02, "KeyExists";
    TOO_BIG = 0x03, "TooBig";
    INVALID_ARGS = 0x04, "InvalidArgs";
    NOT_STORED = 0x05, "NotStored";
    BAD_DELTA = 0x06, "BadDelta";
    NOT_MY_VBUCKET = 0x07, "NotMyVBucket";
    NO_BUCKET = 0x08, "NoBucket";
    LOCKED = 0x09, "Locked";
    CONFIG_ONLY = 0x0d, "ConfigOnly";
    NOT_LOCKED = 0x0e, "NotLocked";
    AUTH_STALE = 0x1f, "AuthStale";
    AUTH_ERROR = 0x20, "AuthError";
    AUTH_CONTINUE = 0x21, "AuthContinue";
    RANGE_ERROR = 0x22, "RangeError";
    ROLLBACK = 0x23, "Rollback";
    ACCESS_ERROR = 0x24, "AccessError";
    NOT_INITIALIZED = 0x25, "NotInitialized";
    RATE_LIMITED_NETWORK_INGRESS = 0x30, "RateLimitedNetworkIngress";
    RATE_LIMITED_NETWORK_EGRESS = 0x31, "RateLimitedNetworkEgress";
    RATE_LIMITED_MAX_CONNECTIONS = 0x32, "RateLimitedMaxConnections";
    RATE_LIMITED_MAX_COMMANDS = 0x33, "RateLimitedMaxCommands";
    UNKNOWN_COMMAND = 0x81, "UnknownCommand";
    OUT_OF_MEMORY = 0x82, "OutOfMemory";
    NOT_SUPPORTED = 0x83, "NotSupported";
    INTERNAL_ERROR = 0x84, "InternalError";
    BUSY = 0x85, "Busy";
    TMP_FAIL = 0x86, "TemporaryFailure";
    COLLECTION_UNKNOWN = 0x88, "CollectionUnknown";
    SCOPE_UNKNOWN = 0x8c, "ScopeUnknown";
    DCP_STREAM_ID_INVALID = 0x8d, "DcpStreamIdInvalid";
    DURABILITY_INVALID_LEVEL = 0xa0, "DurabilityInvalidLevel";
    DURABILITY_IMPOSSIBLE = 0xa1, "DurabilityImpossible";
    SYNC_WRITE_IN_PROGRESS = 0xa2, "SyncWriteInProgress";
    SYNC_WRITE_AMBIGUOUS = 0xa3, "SyncWriteAmbiguous";
    SYNC_WRITE_RECOMMIT_IN_PROGRESS = 0xa4, "SyncWriteReCommitInProgress";
    SUBDOC_PATH_NOT_FOUND = 0xc0, "SubDocPathNotFound";
    SUBDOC_PATH_MISMATCH = 0xc1, "SubDocPathMismatch";
    SUBDOC_PATH_INVALID = 0xc2, "SubDocPathInvalid";
    SUBDOC_PATH_TOO_BIG = 0xc3, "SubDocPathTooBig";
    SUBDOC_DOC_TOO_DEEP = 0xc4, "SubDocDocTooDeep";
    SUBDOC_CANT_INSERT = 0xc5, "SubDocCantInsert";
    SUBDOC_NOT_JSON = 0xc6, "SubDocNotJSON";
    SUBDOC_BAD_RANGE = 0xc7, "SubDocBadRange";
    SUBDOC_BAD_DELTA = 0xc8, "SubDocBadDelta";
    SUBDOC_PATH_EXISTS = 0xc9, "SubDocPathExists";
    SUBDOC_VALUE_TOO_DEEP = 0xca, "SubDocValueTooDeep";
    SUBDOC_BAD_COMBO = 0xcb, "SubDocBadCombo";
    SUBDOC_MULTI_PATH_FAILURE = 0xcc, "SubDocMultiPathFailure";
    SUBDOC_SUCCESS_DELETED = 0xcd, "SubDocSuccessDeleted";
    SUBDOC_XATTR_INVALID_FLAG_COMBO = 0xce, "SubDocXattrInvalidFlagCombo";
    SUBDOC_XATTR_INVALID_KEY_COMBO = 0xcf, "SubDocXattrInvalidKeyCombo";
    SUBDOC_XATTR_UNKNOWN_MACRO = 0xd0, "SubDocXattrUnknownMacro";
    SUBDOC_XATTR_UNKNOWN_VATTR = 0xd1, "SubDocXattrUnknownVAttr";
    SUBDOC_XATTR_CANNOT_MODIFY_VATTR = 0xd2, "SubDocXattrCannotModifyVAttr";
    SUBDOC_MULTI_PATH_FAILURE_DELETED = 0xd3, "SubDocMultiPathFailureDeleted";
    SUBDOC_INVALID_XATTR_ORDER = 0xd4, "SubDocInvalidXattrOrder";
    SUBDOC_XATTR_UNKNOWN_VATTR_MACRO = 0xd5, "SubDocXattrUnknownVattrMacro";
    SUBDOC_CAN_ONLY_REVIVE_DELETED = 0xd6, "SubDocCanOnlyReviveDeletedDocuments";
    SUBDOC_DELETED_DOC_CANT_HAVE_VALUE = 0xd7, "SubDocDeletedDocumentCantHaveValue";
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Statuses that still carry a usable sub-document body.
    pub fn is_subdoc_success(self) -> bool {
        matches!(
            self,
            Self::SUCCESS
                | Self::SUBDOC_SUCCESS_DELETED
                | Self::SUBDOC_MULTI_PATH_FAILURE
                | Self::SUBDOC_MULTI_PATH_FAILURE_DELETED
        )
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#06x})", self.name(), self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.name(), self.0)
    }
}
