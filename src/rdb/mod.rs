pub mod filter;
pub mod lzf;

use crc::{Crc, CRC_64_REDIS};
use thiserror::Error;

pub use filter::{filter_rdb, RdbFilter};

pub const RDB_MAGIC: &[u8] = b"REDIS";

// checksum appended to RDB files of version 5 and up
pub static RDB_CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

/// A chunk of bytes bound for the slave socket. `None` asks the writer to
/// flush its buffer instead of writing data; the filter itself only ever
/// produces data chunks.
pub type Chunk = Option<Vec<u8>>;

pub mod op_code {
    pub const SELECTDB: u8 = 0xFE;
    pub const EXPIRETIME: u8 = 0xFD;
    pub const EXPIRETIME_MS: u8 = 0xFC;
    pub const EOF: u8 = 0xFF;
}

pub mod value_type {
    pub const STRING: u8 = 0x00;
    pub const LIST: u8 = 0x01;
    pub const SET: u8 = 0x02;
    pub const ZSET: u8 = 0x03;
    pub const HASH: u8 = 0x04;
    pub const ZIPMAP: u8 = 0x09;
    pub const ZIPLIST: u8 = 0x0A;
    pub const INTSET: u8 = 0x0B;
    pub const ZSET_ZIPLIST: u8 = 0x0C;
    pub const HASH_ZIPLIST: u8 = 0x0D;
}

pub mod length_encode_code {
    pub const SIX_BITS: u8 = 0;
    pub const FOURTEEN_BITS: u8 = 1;
    pub const FOUR_BYTES: u8 = 2;
    pub const ENCODED: u8 = 3;
}

#[derive(Debug, Error)]
pub enum RdbError {
    #[error("rdb: wrong signature")]
    WrongSignature,

    #[error("rdb: version {0} unsupported")]
    VersionUnsupported(u32),

    #[error("rdb: unsupported opcode {0:#04x}")]
    UnsupportedOp(u8),

    #[error("rdb: unsupported string encoding {0}")]
    UnsupportedStringEnc(u8),

    #[error("rdb: truncated input")]
    Truncated,

    #[error("rdb: lzf decompression failed: {0}")]
    Decompression(&'static str),

    #[error("rdb: output channel closed")]
    SinkClosed,

    #[error("rdb: {0}")]
    Io(#[from] std::io::Error),
}
