//! Worker-side components: RPC client, sampling seam, autonomous loop,
//! lifecycle management.

pub mod client;
pub mod lifecycle;
pub mod processor;
pub mod sampling;
