//! Wire layer for the two-pipe protocol.
//!
//! # Architecture
//!
//! - **types**: typed payloads (numeric arrays, string arrays, ranges)
//! - **protocol**: message and request types
//! - **codec**: binary framing codec for AsyncRead/AsyncWrite
//! - **transport**: descriptor endpoints handed over by the launcher

pub mod codec;
pub mod protocol;
pub mod transport;
pub mod types;
