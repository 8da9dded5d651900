//! Sub-document flag bits.

/// Create intermediate path components.
pub const SUBDOC_FLAG_MKDIR_P: u8 = 0x01;
/// Path refers to an extended attribute.
pub const SUBDOC_FLAG_XATTR_PATH: u8 = 0x04;
/// Expand server macros in the value.
pub const SUBDOC_FLAG_EXPAND_MACROS: u8 = 0x10;

/// Create the document if it does not exist.
pub const SUBDOC_DOC_FLAG_MKDOC: u8 = 0x01;
/// Fail if the document exists.
pub const SUBDOC_DOC_FLAG_ADD: u8 = 0x02;
/// Operate on a tombstone.
pub const SUBDOC_DOC_FLAG_ACCESS_DELETED: u8 = 0x04;
/// Create the document as a tombstone.
pub const SUBDOC_DOC_FLAG_CREATE_AS_DELETED: u8 = 0x08;
/// Bring a tombstone back to life.
pub const SUBDOC_DOC_FLAG_REVIVE_DOCUMENT: u8 = 0x10;
