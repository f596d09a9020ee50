//! Process transport: NDJSON framing, the stdin writer, the stdout reader,
//! and the process supervisor.

pub mod codec;
pub mod reader;
pub mod spawner;
pub mod writer;
