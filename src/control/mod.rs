//! Control protocol: outbound request correlation and inbound dispatch.

pub mod correlator;
pub mod dispatcher;
pub mod handshake;
pub mod mcp;
pub mod registry;
