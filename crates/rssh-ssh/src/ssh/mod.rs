// ===============================
// SSH session / channel engine
// ===============================

pub mod channel;
pub mod config;
pub mod connect;
pub mod key;
pub mod known_hosts;
pub(crate) mod link;
pub mod options;
pub mod paths;
pub mod session;
pub(crate) mod status;
pub mod types;

pub use channel::Channel;
pub use config::{HostSettings, SshConfig};
pub use connect::RawSocketHandle;
pub use key::{Key, KeyType};
pub use options::{Compression, SessionOption, SessionOptions};
pub use session::{DependentRank, Session, SessionDependent, SessionHandle};
pub use types::*;
