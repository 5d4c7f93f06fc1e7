pub mod connection;
pub mod parser;

use regex::bytes::Regex;

// socket buffer size for both directions
pub const BUF_SIZE: usize = 16384;
// bounded capacity of the per-connection queues
pub const CHANNEL_BUFFER: usize = 100;

/// Per-process settings shared by every connection task.
pub struct ProxyConfig {
    pub master_host: String,
    pub master_port: u16,
    pub key_pattern: Regex,
}

/// One replication-level frame together with its verbatim bytes, so frames
/// can be forwarded without re-encoding.
#[derive(Debug, PartialEq)]
pub struct RespCommand {
    pub raw: Vec<u8>,
    pub kind: RespKind,
}

/// The frame shapes the proxy distinguishes on the replication socket.
/// Anything inside a bulk body is opaque at this level.
#[derive(Debug, PartialEq)]
pub enum RespKind {
    /// bare `\n` or `\r\n`
    Empty,
    /// `+text` inline reply
    Reply(String),
    /// `$<n>` bulk header; during SYNC this announces the RDB body
    Bulk(i64),
    /// `*<k>` multi-bulk command, or a bare line as a single token
    Command(Vec<Vec<u8>>),
}
