// ── rssh-scp / scp module ─────────────────────────────────────────────────────
//
// SCP (Secure Copy Protocol) client:
//   • `types`    – modes, request kinds and pending-request metadata
//   • `stream`   – the byte-stream seam, implemented for `Channel`
//   • `protocol` – the C / D / E / T message state machine
//   • `context`  – `ScpContext`, bound to one session channel

pub mod context;
pub mod protocol;
pub mod stream;
pub mod types;

pub use context::ScpContext;
pub use protocol::ScpProtocol;
pub use stream::ScpStream;
pub use types::*;
