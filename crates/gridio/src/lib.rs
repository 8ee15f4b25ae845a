//! `gridio`: small byte-stream helpers for telnet-style terminal sessions.
//!
//! - Telnet IAC stripping with refusal replies and NAWS window-size reports,
//! - CR/LF/CRNUL line splitting over the decoded stream.

pub mod line;
pub mod telnet;
