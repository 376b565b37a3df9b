//! Wire-format types for the two protocols this proxy speaks, plus a small
//! incremental SSE parser shared by the upstream client and the broadcaster.

pub mod anthropic;
pub mod openai;
pub mod sse;
