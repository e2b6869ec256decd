//! Dispatcher transports: HTTP/SSE and newline-delimited JSON on stdio.

pub mod http;
pub mod stdio;
