//! Wire protocol for the spate media driver.
//!
//! Every UDP datagram and every frame in a term buffer starts with the same
//! 8-byte prefix (`frame_length`, `version`, `flags`, `frame_type`), all
//! fields little-endian. The codecs here are plain copy-in/copy-out structs:
//! decode pulls the fixed fields out of a received datagram, encode lays a
//! frame down into a send buffer. Nothing in this crate touches shared
//! memory ordering — `frame_length` stores into term buffers go through the
//! log-buffer crate, which releases them.

pub mod frame;

pub use frame::{
    DataHeader, ErrorHeader, FrameError, FrameHeader, NakHeader, RttMeasurementHeader,
    SetupHeader, StatusMessageHeader,
};
pub use frame::{
    frame_type, frame_type_name, BEGIN_FLAG, CURRENT_VERSION, DATA_EOS_FLAG, DATA_HEADER_LENGTH,
    END_FLAG,
    ERROR_HEADER_LENGTH, FRAME_ALIGNMENT, FRAME_HEADER_LENGTH, NAK_HEADER_LENGTH,
    RTTM_HEADER_LENGTH, RTTM_REPLY_FLAG, SETUP_HEADER_LENGTH, SM_EOS_FLAG, SM_HEADER_LENGTH,
    SM_SEND_SETUP_FLAG, UNFRAGMENTED,
};
