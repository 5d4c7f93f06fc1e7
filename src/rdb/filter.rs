use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crc::Digest;
use std::io;
use std::mem;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use super::{length_encode_code, lzf, op_code, value_type, Chunk, RdbError, RDB_CRC64, RDB_MAGIC};

const MAX_RDB_VERSION: u32 = 6;
const PADDING_CHUNK: i64 = 4096;

/// Filter the RDB snapshot read from `reader`, sending kept records through
/// `output` as they complete. `keep_key` decides per key whether its record
/// survives; `original_length` is the byte length the master advertised, and
/// the emitted stream is padded with 0xFF up to exactly that length so the
/// slave sees the size it was promised. The CRC64 trailer is recomputed over
/// the emitted bytes.
pub async fn filter_rdb<R, F>(
    reader: &mut R,
    output: mpsc::Sender<Chunk>,
    keep_key: F,
    original_length: i64,
) -> Result<(), RdbError>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> bool,
{
    RdbFilter::new(reader, output, keep_key, original_length)
        .run()
        .await
}

#[derive(Clone, Copy)]
enum State {
    Magic,
    Op,
    Db,
    ExpirySec,
    ExpiryMs,
    Key,
    SkipString,
    SkipSetOrList,
    SkipZset,
    SkipHash,
    Crc64Trailer,
    Padding,
}

/// Streaming filter over one RDB snapshot. Created per transfer, driven to
/// completion by `run`, then discarded.
pub struct RdbFilter<'a, R, F> {
    reader: &'a mut R,
    output: mpsc::Sender<Chunk>,
    keep_key: F,
    original_length: i64,
    length: i64,
    crc: Digest<'static, u64>,
    saved: Vec<u8>,
    version: u32,
    value_state: State,
    current_op: u8,
    should_keep: bool,
}

impl<'a, R, F> RdbFilter<'a, R, F>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> bool,
{
    pub fn new(
        reader: &'a mut R,
        output: mpsc::Sender<Chunk>,
        keep_key: F,
        original_length: i64,
    ) -> Self {
        RdbFilter {
            reader,
            output,
            keep_key,
            original_length,
            length: 0,
            crc: RDB_CRC64.digest(),
            saved: Vec::new(),
            version: 0,
            value_state: State::SkipString,
            current_op: 0,
            should_keep: true,
        }
    }

    pub async fn run(mut self) -> Result<(), RdbError> {
        let mut state = Some(State::Magic);

        while let Some(current) = state {
            state = self.step(current).await?;
        }

        Ok(())
    }

    async fn step(&mut self, state: State) -> Result<Option<State>, RdbError> {
        match state {
            State::Magic => self.state_magic().await,
            State::Op => self.state_op().await,
            State::Db => self.state_db().await,
            State::ExpirySec => self.state_expiry(op_code::EXPIRETIME, 4).await,
            State::ExpiryMs => self.state_expiry(op_code::EXPIRETIME_MS, 8).await,
            State::Key => self.state_key().await,
            State::SkipString => self.state_skip_string().await,
            State::SkipSetOrList => self.state_skip_set_or_list().await,
            State::SkipZset => self.state_skip_zset().await,
            State::SkipHash => self.state_skip_hash().await,
            State::Crc64Trailer => self.state_crc64().await,
            State::Padding => self.state_padding().await,
        }
    }

    async fn read_byte(&mut self) -> Result<u8, RdbError> {
        self.reader.read_u8().await.map_err(map_eof)
    }

    // read exactly n bytes
    async fn safe_read(&mut self, n: usize) -> Result<Vec<u8>, RdbError> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).await.map_err(map_eof)?;
        Ok(buf)
    }

    // accumulate bytes of the current record; no-op once the record is doomed
    fn write(&mut self, data: &[u8]) {
        if !self.should_keep {
            return;
        }
        self.saved.extend_from_slice(data);
    }

    // emit or drop the accumulated record, then reset for the next one
    async fn keep_or_discard(&mut self) -> Result<(), RdbError> {
        if self.should_keep && !self.saved.is_empty() {
            let chunk = mem::take(&mut self.saved);
            self.crc.update(&chunk);
            self.length += chunk.len() as i64;
            self.send(chunk).await?;
        }
        self.saved.clear();
        self.should_keep = true;
        Ok(())
    }

    async fn send(&mut self, chunk: Vec<u8>) -> Result<(), RdbError> {
        self.output
            .send(Some(chunk))
            .await
            .map_err(|_| RdbError::SinkClosed)
    }

    // read a length-encoded prefix; `Some(tag)` means a special string
    // encoding instead of a length
    async fn read_length(&mut self) -> Result<(u32, Option<u8>), RdbError> {
        let prefix = self.read_byte().await?;
        self.write(&[prefix]);

        match (prefix & 0xC0) >> 6 {
            length_encode_code::SIX_BITS => Ok(((prefix & 0x3F) as u32, None)),
            length_encode_code::FOURTEEN_BITS => {
                let next = self.read_byte().await?;
                self.write(&[next]);
                Ok(((((prefix & 0x3F) as u32) << 8) | next as u32, None))
            }
            length_encode_code::FOUR_BYTES => {
                let data = self.safe_read(4).await?;
                self.write(&data);
                Ok((BigEndian::read_u32(&data), None))
            }
            _ => Ok((0, Some(prefix & 0x3F))),
        }
    }

    // read a string and return its decoded bytes; only keys need this
    async fn read_string(&mut self) -> Result<Vec<u8>, RdbError> {
        let (length, encoding) = self.read_length().await?;

        match encoding {
            // length-prefixed string
            None => {
                let data = self.safe_read(length as usize).await?;
                self.write(&data);
                Ok(data)
            }
            // integer as string, rendered as unsigned decimal
            Some(enc @ 0..=2) => {
                let data = self.safe_read(1usize << enc).await?;
                self.write(&data);

                let num = match enc {
                    0 => data[0] as u32,
                    1 => LittleEndian::read_u16(&data) as u32,
                    _ => LittleEndian::read_u32(&data),
                };

                Ok(num.to_string().into_bytes())
            }
            // compressed string
            Some(3) => {
                let (clength, _) = self.read_length().await?;
                let (ulength, _) = self.read_length().await?;
                let data = self.safe_read(clength as usize).await?;
                self.write(&data);

                lzf::decompress(&data, ulength as usize)
            }
            Some(enc) => Err(RdbError::UnsupportedStringEnc(enc)),
        }
    }

    // skip (copy) a string without decoding it
    async fn skip_string(&mut self) -> Result<(), RdbError> {
        let (length, encoding) = self.read_length().await?;

        match encoding {
            // length-prefixed string
            None => {
                let data = self.safe_read(length as usize).await?;
                self.write(&data);
            }
            // integer as string
            Some(enc @ 0..=2) => {
                let data = self.safe_read(1usize << enc).await?;
                self.write(&data);
            }
            // compressed string, copied verbatim
            Some(3) => {
                let (clength, _) = self.read_length().await?;
                self.read_length().await?;
                let data = self.safe_read(clength as usize).await?;
                self.write(&data);
            }
            Some(enc) => return Err(RdbError::UnsupportedStringEnc(enc)),
        }

        Ok(())
    }

    // the 9-byte preamble is always kept; the predicate has no say here
    async fn state_magic(&mut self) -> Result<Option<State>, RdbError> {
        let signature = self.safe_read(5).await?;
        if signature != RDB_MAGIC {
            return Err(RdbError::WrongSignature);
        }
        self.write(&signature);

        let version_raw = self.safe_read(4).await?;
        let version = std::str::from_utf8(&version_raw)
            .ok()
            .and_then(|digits| digits.parse::<u32>().ok())
            .ok_or(RdbError::WrongSignature)?;

        if version > MAX_RDB_VERSION {
            return Err(RdbError::VersionUnsupported(version));
        }

        self.version = version;
        self.write(&version_raw);
        self.keep_or_discard().await?;

        Ok(Some(State::Op))
    }

    // main selector of operations
    async fn state_op(&mut self) -> Result<Option<State>, RdbError> {
        let op = self.read_byte().await?;
        self.current_op = op;

        match op {
            op_code::SELECTDB => {
                self.keep_or_discard().await?;
                Ok(Some(State::Db))
            }
            op_code::EXPIRETIME => Ok(Some(State::ExpirySec)),
            op_code::EXPIRETIME_MS => Ok(Some(State::ExpiryMs)),
            value_type::STRING
            | value_type::ZIPMAP
            | value_type::ZIPLIST
            | value_type::INTSET
            | value_type::ZSET_ZIPLIST
            | value_type::HASH_ZIPLIST => {
                self.value_state = State::SkipString;
                Ok(Some(State::Key))
            }
            value_type::LIST | value_type::SET => {
                self.value_state = State::SkipSetOrList;
                Ok(Some(State::Key))
            }
            value_type::ZSET => {
                self.value_state = State::SkipZset;
                Ok(Some(State::Key))
            }
            value_type::HASH => {
                self.value_state = State::SkipHash;
                Ok(Some(State::Key))
            }
            op_code::EOF => {
                self.keep_or_discard().await?;
                self.write(&[op_code::EOF]);
                self.keep_or_discard().await?;

                if self.version > 4 {
                    Ok(Some(State::Crc64Trailer))
                } else {
                    Ok(Some(State::Padding))
                }
            }
            _ => Err(RdbError::UnsupportedOp(op)),
        }
    }

    // DB selector records are always kept
    async fn state_db(&mut self) -> Result<Option<State>, RdbError> {
        self.write(&[op_code::SELECTDB]);
        self.read_length().await?;
        self.keep_or_discard().await?;

        Ok(Some(State::Op))
    }

    // expiry stays in the buffer so it commits or drops with the value
    // record it annotates
    async fn state_expiry(&mut self, op: u8, width: usize) -> Result<Option<State>, RdbError> {
        let expiry = self.safe_read(width).await?;

        self.write(&[op]);
        self.write(&expiry);

        Ok(Some(State::Op))
    }

    // the type byte is accumulated here so discarded records leave no trace
    async fn state_key(&mut self) -> Result<Option<State>, RdbError> {
        self.write(&[self.current_op]);
        let key = self.read_string().await?;

        self.should_keep = (self.keep_key)(&key);

        Ok(Some(self.value_state))
    }

    async fn state_skip_string(&mut self) -> Result<Option<State>, RdbError> {
        self.skip_string().await?;

        self.keep_or_discard().await?;
        Ok(Some(State::Op))
    }

    async fn state_skip_set_or_list(&mut self) -> Result<Option<State>, RdbError> {
        let (length, _) = self.read_length().await?;

        for _ in 0..length {
            self.skip_string().await?;
        }

        self.keep_or_discard().await?;
        Ok(Some(State::Op))
    }

    async fn state_skip_zset(&mut self) -> Result<Option<State>, RdbError> {
        let (length, _) = self.read_length().await?;

        for _ in 0..length {
            self.skip_string().await?;

            let dlen = self.read_byte().await?;
            self.write(&[dlen]);

            // 0xFD/0xFE/0xFF are the +inf/-inf/nan sentinels, no score bytes
            if dlen < 0xFD {
                let score = self.safe_read(dlen as usize).await?;
                self.write(&score);
            }
        }

        self.keep_or_discard().await?;
        Ok(Some(State::Op))
    }

    async fn state_skip_hash(&mut self) -> Result<Option<State>, RdbError> {
        let (length, _) = self.read_length().await?;

        for _ in 0..length {
            // field
            self.skip_string().await?;
            // value
            self.skip_string().await?;
        }

        self.keep_or_discard().await?;
        Ok(Some(State::Op))
    }

    // the original trailer is stale once records were dropped; emit ours
    async fn state_crc64(&mut self) -> Result<Option<State>, RdbError> {
        self.safe_read(8).await?;

        let digest = mem::replace(&mut self.crc, RDB_CRC64.digest());
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, digest.finalize());

        self.send(buf.to_vec()).await?;
        self.length += 8;

        Ok(Some(State::Padding))
    }

    // pad with 0xFF up to the length the master advertised
    async fn state_padding(&mut self) -> Result<Option<State>, RdbError> {
        let mut remaining = self.original_length - self.length;

        while remaining > 0 {
            let n = remaining.min(PADDING_CHUNK) as usize;
            self.send(vec![0xFF; n]).await?;
            remaining -= n as i64;
        }

        Ok(None)
    }
}

fn map_eof(err: io::Error) -> RdbError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        RdbError::Truncated
    } else {
        RdbError::Io(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // captured from a 2.8 master: two string records per prefix plus an
    // expiring compressed one, version 6 trailer
    const SIMPLE: &[u8] = b"REDIS0006\xfe\x00\x00\x03b_1\x04kuku\x00\x03a_1\x04lala\x00\x03b_3\xc3\x09@\xb3\x01aa\xe0\xa6\x00\x01aa\xfc\xdb\x82\xb0\x5cB\x01\x00\x00\x00\x03b_2\x0d2343545345345\x00\x03a_2\xc0!\xffT\x81\xe9\x86\xcc\x9f\x1f\xc4";

    // version 1 dump with every pre-ziplist value type and empty databases
    const MANY_TYPES: &[u8] = include_bytes!("../../files/many_types.rdb");

    // version 6 dump holding one compressed list
    const LIST: &[u8] = b"REDIS0006\xfe\x00\x0a\x06mylist\xc3A\xbeE\x83\x04\x83\x05\x00\x00t \x03\x04d\x00\x00\x0c0\xe0\x00\x00\x0270\x0e\xe0\x02\x0d\x0115\xe0\x03\x0d\x0124\xe0\x03\x0d\x0198\xe0\x03\x0d\x0137\xe0\x03\x0d\x008\xe0\x04)\x0119\xe0\x03\x1b\x0121\xe0\x03\x0d\x0173\xe0\x03\x0d\x002\xe0\x04)\x0142\xe0\x03\x1b\x003\xe0\x04\x1b\x009\xe0\x04a\x0186\xe0\x03)\x002\xe0\x04\x0d\x001\xe0\x12E\x006\xe0\x04\xc3\x007\xe0\x047\x006\xe1\x04\x09\x003\xe0\x04E\x009\xe0\x04\x8b\x005\xe0\x04\x8b\x005\xe0\x04\xdf\x000\xe0\x04\xdf\x001\xe0\x04\x1b\xe1\x05%\x008\xe0\x05\x8b\xe0\x05\x0d\xe0\x04\x99\x000\xe0\x04\x1b\x008\xe1\x04y\x005\xe0\x04\xb5\x004\xe0\x04}\x006\xe0\x04\xa7\x003\xe0\x04\x0d\x006\xe0\x04E\x001\xe0\x04\x1b\x004\xe2\x04\x05\x005\xe0\x04\x8b\x008\xe1\x05\x17\xe0\x04)\xe2\x05/\x005\xe0\x05a\xe0\x04\x99\xe1\x06\xf7\xe0\x04a\x000\xe0\x04S\x003\xe0\x04\x1b\x002\xe0\x04S\xe1\x05O\x002\xe0\x047\x009\xe0\x04o\xe0\x05S\x008\xe1\x04\x95\x009\xe0\x04a\xe3\x05\x0f\x006\xe0\x04\xed\xe2\x05\xbb\xe1\x06\x17\xe1\x04\x87\x009\xe0\x04a\xe2\x06\x9f\xe0\x04\x99\xe1\x05\x87\x006\xe2\x05g\xe1\x04\xf7\x002\xe0\x04\x8b\x000\xe0\x04\x0d\xe1\x05O\x003\xe1\x04\x09\xe0\x05a\x002\xe0\x05}\xe0\x04E\x003\xe0\x04\xc3\xe1\x05\xe9\xe0\x05a\xe0\x05S\xe3\x05U\xe2\x05\xf3\xe1\x05\xbf\x007\xe0\x04o\xe1\x05\x17\x004\xe0\x04}\xe0\x05\x1b\x006\xe0\x04\xb5\x005\xe1\x04%\x009\xe0\x057\xe2\x04!\xe0\x05\xdf\xe4\x05\x89\x004\xe0\x05E\xe0\x04\x99\xe4\x05_\xe1\x05O\xe2\x05Y\xe5\x051\x007\xe0\x04}\xe0\x05E\x0283\xff\xffy\xaa\x8e\x05\xb8\xd6\xecX";

    // keys stored under the 8/16/32-bit integer encodings
    const INTEGER_KEYS: &[u8] = b"REDIS0006\xfe\x00\x00\xc1aS\x03cde\x00\xc0\x0c\x03abc\x00\xc2\x87\xd6\x12\x00\x03fgh\xff\xe9 \xb4\xe35e\x99\x92";

    // keys stored under the LZF compressed encoding
    const LZF_KEYS: &[u8] = b"REDIS0006\xfe\x00\x00\xc3\x12/\x01aa \x00\x00d\xe0\x0a\x00\x00e\xe0\x0a\x00\x01ee\x02x3\x00\xc3\x120\x01bb\xe0\x07\x00\x00a\xe0\x09\x00\x00c\xc0\x00\x01cc\x02x2\x00\xc3\x130\x01aa\xe0\x07\x00\x00b\xe0\x08\x00\x00c\xe0\x00\x00\x01cc\x02x1\xff\x83J\xb9\xf9mX\x8a\xa6";

    async fn run_filter<F>(input: &[u8], keep_key: F) -> Result<Vec<u8>, RdbError>
    where
        F: Fn(&[u8]) -> bool,
    {
        let (tx, mut rx) = mpsc::channel::<super::Chunk>(100);
        let mut reader = input;
        let length = input.len() as i64;

        let collect = async {
            let mut received = Vec::new();
            while let Some(chunk) = rx.recv().await {
                if let Some(data) = chunk {
                    received.extend_from_slice(&data);
                }
            }
            received
        };

        let (result, received) =
            tokio::join!(filter_rdb(&mut reader, tx, keep_key, length), collect);
        result?;

        Ok(received)
    }

    fn with_padding(prefix: &[u8], padding: usize) -> Vec<u8> {
        let mut expected = prefix.to_vec();
        expected.resize(prefix.len() + padding, 0xFF);
        expected
    }

    #[tokio::test]
    async fn accept_all_is_identity() {
        let out = run_filter(SIMPLE, |_| true).await.unwrap();
        assert_eq!(out, SIMPLE);
    }

    #[tokio::test]
    async fn prefix_filter_recomputes_crc_and_pads() {
        let out = run_filter(SIMPLE, |key| key.starts_with(b"a_")).await.unwrap();

        let expected = with_padding(
            b"REDIS0006\xfe\x00\x00\x03a_1\x04lala\x00\x03a_2\xc0!\xff\xad}0`\xa6\xf4\xa1\xab",
            56,
        );
        assert_eq!(out.len(), SIMPLE.len());
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn accept_all_many_types_is_identity() {
        let out = run_filter(MANY_TYPES, |_| true).await.unwrap();
        assert_eq!(out, MANY_TYPES);
    }

    #[tokio::test]
    async fn reject_all_keeps_only_db_markers() {
        let out = run_filter(MANY_TYPES, |_| false).await.unwrap();

        // version 1, so no trailer; the EOF marker is followed by padding
        let expected = with_padding(
            b"REDIS0001\xfe\x00\xfe\x06\xfe\x07\xfe\x08\xfe\x09\xfe\x0b\xfe\x0e\xfe\x0f\xff",
            1546,
        );
        assert_eq!(out.len(), MANY_TYPES.len());
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn prefix_filter_many_types() {
        let out = run_filter(MANY_TYPES, |key| key.starts_with(b"v02"))
            .await
            .unwrap();

        let expected = with_padding(
            b"REDIS0001\xfe\x00\xfe\x06\x02\x0bv02d_um_109\x01 86756ab85811f6603e59c6d5911c858c\x02\x0bv02e_um_108\x01 86756ab85811f6603e59c6d5911c858c\xfe\x07\xfe\x08\xfe\x09\xfe\x0b\xfe\x0e\xfe\x0f\x02\x0bv02e_um_108\x01 86756ab85811f6603e59c6d5911c858c\x02\x0bv02d_um_109\x01 86756ab85811f6603e59c6d5911c858c\xff",
            1358,
        );
        assert_eq!(out.len(), MANY_TYPES.len());
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn accept_all_list_is_identity() {
        let out = run_filter(LIST, |_| true).await.unwrap();
        assert_eq!(out, LIST);
    }

    #[tokio::test]
    async fn integer_keys_decode_as_decimal() {
        // 0xc0 0x0c is key "12", 0xc2 ... is key "1234567"; both start with '1'
        let out = run_filter(INTEGER_KEYS, |key| key.starts_with(b"1"))
            .await
            .unwrap();

        let expected = with_padding(
            b"REDIS0006\xfe\x00\x00\xc0\x0c\x03abc\x00\xc2\x87\xd6\x12\x00\x03fgh\xffQ\x07\xb5\x09\xfb\xe8\xc9\xa6",
            8,
        );
        assert_eq!(out.len(), INTEGER_KEYS.len());
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn compressed_keys_are_decoded_for_matching() {
        let out = run_filter(LZF_KEYS, |key| key.starts_with(b"aaaa"))
            .await
            .unwrap();

        let expected = with_padding(
            b"REDIS0006\xfe\x00\x00\xc3\x12/\x01aa \x00\x00d\xe0\x0a\x00\x00e\xe0\x0a\x00\x01ee\x02x3\x00\xc3\x130\x01aa\xe0\x07\x00\x00b\xe0\x08\x00\x00c\xe0\x00\x00\x01cc\x02x1\xff\x8f\xa2\xae\xd9\xa0Y\xa8N",
            25,
        );
        assert_eq!(out.len(), LZF_KEYS.len());
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn wrong_signature() {
        let err = run_filter(b"NOTREDIS", |_| true).await.unwrap_err();
        assert!(matches!(err, RdbError::WrongSignature));
    }

    #[tokio::test]
    async fn version_unsupported() {
        let err = run_filter(b"REDIS0007", |_| true).await.unwrap_err();
        assert!(matches!(err, RdbError::VersionUnsupported(7)));
    }

    #[tokio::test]
    async fn truncated_in_key() {
        let err = run_filter(b"REDIS0006\xfe\x00\x00\x03", |_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, RdbError::Truncated));
    }

    #[tokio::test]
    async fn truncated_in_db_index() {
        let err = run_filter(b"REDIS0006\xfe", |_| true).await.unwrap_err();
        assert!(matches!(err, RdbError::Truncated));
    }

    #[tokio::test]
    async fn truncated_after_header() {
        let err = run_filter(b"REDIS0006", |_| true).await.unwrap_err();
        assert!(matches!(err, RdbError::Truncated));
    }

    #[tokio::test]
    async fn truncated_in_version() {
        let err = run_filter(b"REDIS00", |_| true).await.unwrap_err();
        assert!(matches!(err, RdbError::Truncated));
    }

    #[tokio::test]
    async fn unsupported_opcode() {
        let err = run_filter(b"REDIS0006\x42", |_| true).await.unwrap_err();
        assert!(matches!(err, RdbError::UnsupportedOp(0x42)));
    }
}
