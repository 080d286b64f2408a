//! Broker wire protocol.
//!
//! - **messages**: typed request/response records
//! - **frame**: length-prefixed JSON framing, plus the size-hinted path for
//!   large replies

pub mod frame;
pub mod messages;

pub use frame::{read_frame, write_frame, Outgoing};
pub use messages::{
    AsyncHandle, ExecRequest, ExecResult, Message, CAP_ALL, CAP_COMPRESSION, CAP_DATA_INFO,
};
