//! Mapping from response status codes to error kinds.

use cbcore_memd::{Opcode, Status};

use crate::kind::ErrorKind;

/// Classifies a raw status code. Returns `None` for success.
pub fn kind_for_status(status: Status) -> Option<ErrorKind> {
    let kind = match status {
        Status::SUCCESS => return None,
        Status::KEY_NOT_FOUND => ErrorKind::DocumentNotFound,
        Status::KEY_EXISTS => ErrorKind::DocumentExists,
        Status::TOO_BIG => ErrorKind::ValueTooLarge,
        Status::INVALID_ARGS => ErrorKind::InvalidArgument,
        Status::NOT_STORED => ErrorKind::NotStored,
        Status::BAD_DELTA => ErrorKind::DeltaInvalid,
        Status::NOT_MY_VBUCKET => ErrorKind::NotMyVbucket,
        Status::NO_BUCKET => ErrorKind::NoBucket,
        Status::LOCKED => ErrorKind::DocumentLocked,
        Status::CONFIG_ONLY => ErrorKind::ConfigOnly,
        Status::NOT_LOCKED => ErrorKind::DocumentNotLocked,
        Status::AUTH_STALE | Status::AUTH_ERROR => ErrorKind::AuthenticationFailure,
        Status::AUTH_CONTINUE => ErrorKind::AuthContinue,
        Status::RANGE_ERROR => ErrorKind::RangeError,
        Status::ROLLBACK => ErrorKind::Rollback,
        Status::ACCESS_ERROR => ErrorKind::AccessDenied,
        Status::NOT_INITIALIZED => ErrorKind::NotInitialized,
        Status::RATE_LIMITED_NETWORK_INGRESS
        | Status::RATE_LIMITED_NETWORK_EGRESS
        | Status::RATE_LIMITED_MAX_CONNECTIONS
        | Status::RATE_LIMITED_MAX_COMMANDS => ErrorKind::RateLimited,
        Status::UNKNOWN_COMMAND | Status::NOT_SUPPORTED => ErrorKind::UnsupportedOperation,
        Status::OUT_OF_MEMORY => ErrorKind::OutOfMemory,
        Status::INTERNAL_ERROR => ErrorKind::InternalServerFailure,
        Status::BUSY | Status::TMP_FAIL => ErrorKind::TemporaryFailure,
        Status::COLLECTION_UNKNOWN => ErrorKind::CollectionNotFound,
        Status::SCOPE_UNKNOWN => ErrorKind::ScopeNotFound,
        Status::DCP_STREAM_ID_INVALID => ErrorKind::DcpStreamIdInvalid,
        Status::DURABILITY_INVALID_LEVEL => ErrorKind::DurabilityLevelNotAvailable,
        Status::DURABILITY_IMPOSSIBLE => ErrorKind::DurabilityImpossible,
        Status::SYNC_WRITE_IN_PROGRESS => ErrorKind::SyncWriteInProgress,
        Status::SYNC_WRITE_AMBIGUOUS => ErrorKind::DurabilityAmbiguous,
        Status::SYNC_WRITE_RECOMMIT_IN_PROGRESS => ErrorKind::SyncWriteRecommitInProgress,
        Status::SUBDOC_PATH_NOT_FOUND => ErrorKind::PathNotFound,
        Status::SUBDOC_PATH_MISMATCH => ErrorKind::PathMismatch,
        Status::SUBDOC_PATH_INVALID => ErrorKind::PathInvalid,
        Status::SUBDOC_PATH_TOO_BIG => ErrorKind::PathTooBig,
        Status::SUBDOC_DOC_TOO_DEEP => ErrorKind::PathTooDeep,
        Status::SUBDOC_CANT_INSERT => ErrorKind::ValueInvalid,
        Status::SUBDOC_NOT_JSON => ErrorKind::DocumentNotJson,
        Status::SUBDOC_BAD_RANGE => ErrorKind::NumberTooBig,
        Status::SUBDOC_BAD_DELTA => ErrorKind::DeltaInvalid,
        Status::SUBDOC_PATH_EXISTS => ErrorKind::PathExists,
        Status::SUBDOC_VALUE_TOO_DEEP => ErrorKind::ValueTooDeep,
        Status::SUBDOC_BAD_COMBO => ErrorKind::SubdocBadCombo,
        Status::SUBDOC_MULTI_PATH_FAILURE | Status::SUBDOC_MULTI_PATH_FAILURE_DELETED => {
            ErrorKind::SubdocMultiPathFailure
        }
        Status::SUBDOC_XATTR_INVALID_FLAG_COMBO => ErrorKind::XattrInvalidFlagCombo,
        Status::SUBDOC_XATTR_INVALID_KEY_COMBO => ErrorKind::XattrInvalidKeyCombo,
        Status::SUBDOC_XATTR_UNKNOWN_MACRO | Status::SUBDOC_XATTR_UNKNOWN_VATTR_MACRO => {
            ErrorKind::XattrUnknownMacro
        }
        Status::SUBDOC_XATTR_UNKNOWN_VATTR => ErrorKind::XattrUnknownVirtualAttribute,
        Status::SUBDOC_XATTR_CANNOT_MODIFY_VATTR => ErrorKind::XattrCannotModifyVirtualAttribute,
        Status::SUBDOC_INVALID_XATTR_ORDER => ErrorKind::XattrInvalidOrder,
        Status::SUBDOC_CAN_ONLY_REVIVE_DELETED => ErrorKind::CannotReviveLivingDocument,
        Status::SUBDOC_DELETED_DOC_CANT_HAVE_VALUE => ErrorKind::DeletedDocumentCantHaveValue,
        _ => ErrorKind::Unknown,
    };
    Some(kind)
}

/// Classifies a status in the context of the command that produced it.
///
/// `KeyExists` means "document exists" only for inserts; for every other
/// command it reports a CAS conflict. `NotStored` on append/prepend means the
/// target document is missing.
pub fn kind_for_response(command: Opcode, status: Status) -> Option<ErrorKind> {
    if is_success_for(command, status) {
        return None;
    }
    let kind = kind_for_status(status)?;
    Some(match (kind, command) {
        (ErrorKind::DocumentExists, Opcode::ADD) => ErrorKind::DocumentExists,
        (ErrorKind::DocumentExists, _) => ErrorKind::CasMismatch,
        (ErrorKind::NotStored, Opcode::APPEND | Opcode::PREPEND) => ErrorKind::DocumentNotFound,
        (ErrorKind::NotStored, Opcode::ADD) => ErrorKind::DocumentExists,
        (k, _) => k,
    })
}

/// Whether `status` completes `command` successfully. Multi-path
/// sub-document statuses carry per-path results and count as success, as do
/// the SASL continue step and a DCP rollback, whose bodies the caller decodes.
pub fn is_success_for(command: Opcode, status: Status) -> bool {
    if status.is_success() {
        return true;
    }
    (matches!(command, Opcode::SUBDOC_MULTI_LOOKUP | Opcode::SUBDOC_MULTI_MUTATION)
        && status.is_subdoc_success())
        || (matches!(command, Opcode::SASL_AUTH | Opcode::SASL_STEP) && status == Status::AUTH_CONTINUE)
        || (command == Opcode::DCP_STREAM_REQ && status == Status::ROLLBACK)
        || (command.0 >= Opcode::SUBDOC_GET.0
            && command.0 <= Opcode::SUBDOC_GET_COUNT.0
            && status == Status::SUBDOC_SUCCESS_DELETED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exists_depends_on_command() {
        assert_eq!(kind_for_response(Opcode::ADD, Status::KEY_EXISTS), Some(ErrorKind::DocumentExists));
        assert_eq!(kind_for_response(Opcode::SET, Status::KEY_EXISTS), Some(ErrorKind::CasMismatch));
        assert_eq!(kind_for_response(Opcode::REPLACE, Status::KEY_EXISTS), Some(ErrorKind::CasMismatch));
    }

    #[test]
    fn test_body_carrying_statuses_are_success() {
        assert!(is_success_for(Opcode::SASL_AUTH, Status::AUTH_CONTINUE));
        assert!(is_success_for(Opcode::DCP_STREAM_REQ, Status::ROLLBACK));
        assert!(!is_success_for(Opcode::GET, Status::ROLLBACK));
    }

    #[test]
    fn test_not_stored_on_append() {
        assert_eq!(kind_for_response(Opcode::APPEND, Status::NOT_STORED), Some(ErrorKind::DocumentNotFound));
    }

    #[test]
    fn test_subdoc_multi_path_is_success() {
        assert!(is_success_for(Opcode::SUBDOC_MULTI_LOOKUP, Status::SUBDOC_MULTI_PATH_FAILURE));
        assert!(is_success_for(Opcode::SUBDOC_MULTI_MUTATION, Status::SUBDOC_SUCCESS_DELETED));
        assert!(!is_success_for(Opcode::GET, Status::SUBDOC_MULTI_PATH_FAILURE));
        assert_eq!(kind_for_response(Opcode::SUBDOC_MULTI_LOOKUP, Status::SUBDOC_MULTI_PATH_FAILURE), None);
    }

    #[test]
    fn test_unknown_status() {
        assert_eq!(kind_for_status(Status(0x7777)), Some(ErrorKind::Unknown));
        assert_eq!(kind_for_status(Status::SUCCESS), None);
    }

    #[test]
    fn test_unsupported_covers_unknown_command() {
        assert_eq!(kind_for_status(Status::UNKNOWN_COMMAND), Some(ErrorKind::UnsupportedOperation));
        assert_eq!(kind_for_status(Status::NOT_SUPPORTED), Some(ErrorKind::UnsupportedOperation));
    }
}
