// cowrite-common: shared types, the operation codec, and the peer wire
// protocol for the Cowrite synchronization engine.

pub mod op;
pub mod protocol;
pub mod types;
