//! cbcore-memd - binary key/value protocol
//!
//! Packet model, command and status vocabularies, HELLO features,
//! alt-request framing extras and a `tokio_util` codec.

pub mod codec;
pub mod datatype;
pub mod error;
pub mod feature;
pub mod leb128;
pub mod opcode;
pub mod packet;
pub mod status;
pub mod subdoc;

pub use codec::MemdCodec;
pub use datatype::{DATATYPE_COMPRESSED, DATATYPE_JSON, DATATYPE_XATTR, DurabilityLevel};
pub use error::{MemdError, MemdResult};
pub use feature::HelloFeature;
pub use opcode::{CLUSTER_MAP_CHANGE_NOTIFICATION, Magic, Opcode};
pub use packet::{DurabilityFrame, HEADER_SIZE, Packet};
pub use status::Status;
