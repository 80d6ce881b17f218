//! # rssh – SCP
//!
//! Secure copy over a session channel:
//!   • `ScpContext` in write mode pushes files and directories (`scp -t`)
//!   • `ScpContext` in read mode pulls them request by request (`scp -f`)
//!   • The wire state machine runs over any `ScpStream`, so it is testable
//!     without a server

pub mod scp;
