// cowrite-engine: the real-time document synchronization engine.
//
// Replicated text documents that converge without a central authority,
// ephemeral presence, peer session lifecycle, and the editor binding
// boundary. Everything network-facing is reached through narrow traits;
// concrete transports live with the embedding application.

pub mod binding;
pub mod config;
pub mod engine;
pub mod session;
