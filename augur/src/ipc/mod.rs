//! IPC bridge between the runtime and the predictor child process.
//!
//! - **protocol**: tagged message types flowing in both directions
//! - **codec**: length-prefixed JSON framing over AsyncRead/AsyncWrite
//! - **channel**: Unix socket endpoints with a mutex-guarded write side

pub mod channel;
pub mod codec;
pub mod protocol;
