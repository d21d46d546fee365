//! Reader and writer for the `lcevcbin` container: a concatenation of
//! length-delimited blocks carrying out-of-band enhancement payloads together
//! with their decode and presentation indices.

use std::io;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use nutype_enum::nutype_enum;

/// Magic bytes at the start of a BIN container.
pub const BIN_MAGIC: [u8; 8] = *b"lcevcbin";

/// The only container version this reader understands.
pub const BIN_VERSION: u32 = 1;

/// Size of the per-block payload header (decode + presentation index).
const PAYLOAD_HEADER_SIZE: u32 = 16;

nutype_enum! {
    /// Block types in a BIN container.
    pub enum BinBlockType(u16) {
        /// An LCEVC enhancement payload block.
        Payload = 0,
        /// Reserved extension block.
        Extension = 0xffff,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BinError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("bad BIN header")]
    BadHeader,
    #[error("unsupported BIN version {0}")]
    UnsupportedVersion(u32),
    #[error("unrecognized BIN block type {0:#06x}")]
    UnknownBlock(u16),
    #[error("BIN block too short: {0} bytes")]
    ShortBlock(u32),
}

/// One enhancement payload read from a BIN container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinBlock {
    pub decode_index: i64,
    pub presentation_index: i64,
    pub payload: Bytes,
}

/// Reads `lcevcbin` containers from any [`io::Read`] source. The header is
/// validated on construction.
pub struct BinReader<R> {
    inner: R,
}

impl<R: io::Read> BinReader<R> {
    pub fn new(mut inner: R) -> Result<Self, BinError> {
        let mut magic = [0u8; 8];
        inner.read_exact(&mut magic).map_err(|_| BinError::BadHeader)?;
        if magic != BIN_MAGIC {
            tracing::error!("bad BIN magic");
            return Err(BinError::BadHeader);
        }
        let version = inner.read_u32::<BigEndian>().map_err(|_| BinError::BadHeader)?;
        if version != BIN_VERSION {
            tracing::error!(version, "unsupported BIN version");
            return Err(BinError::UnsupportedVersion(version));
        }
        Ok(Self { inner })
    }

    /// Reads the next payload block, or `None` at a clean end of stream.
    pub fn read_block(&mut self) -> Result<Option<BinBlock>, BinError> {
        let block_type = match self.read_block_type()? {
            Some(block_type) => block_type,
            None => return Ok(None),
        };

        let size = self.inner.read_u32::<BigEndian>()?;
        if block_type != BinBlockType::Payload {
            return Err(BinError::UnknownBlock(block_type.0));
        }
        if size < PAYLOAD_HEADER_SIZE {
            return Err(BinError::ShortBlock(size));
        }

        let decode_index = self.inner.read_i64::<BigEndian>()?;
        let presentation_index = self.inner.read_i64::<BigEndian>()?;

        let mut payload = vec![0u8; (size - PAYLOAD_HEADER_SIZE) as usize];
        self.inner.read_exact(&mut payload)?;

        Ok(Some(BinBlock {
            decode_index,
            presentation_index,
            payload: Bytes::from(payload),
        }))
    }

    /// Reads the big-endian block type, distinguishing a clean end of stream
    /// (nothing to read) from a short block header.
    fn read_block_type(&mut self) -> Result<Option<BinBlockType>, BinError> {
        let mut first = [0u8; 1];
        loop {
            match self.inner.read(&mut first) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let second = self.inner.read_u8()?;
        Ok(Some(BinBlockType::from(u16::from_be_bytes([
            first[0], second,
        ]))))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes `lcevcbin` containers. The header is emitted on construction.
pub struct BinWriter<W> {
    inner: W,
}

impl<W: io::Write> BinWriter<W> {
    pub fn new(mut inner: W) -> Result<Self, BinError> {
        inner.write_all(&BIN_MAGIC)?;
        inner.write_u32::<BigEndian>(BIN_VERSION)?;
        Ok(Self { inner })
    }

    pub fn write_block(
        &mut self,
        decode_index: i64,
        presentation_index: i64,
        payload: &[u8],
    ) -> Result<(), BinError> {
        self.inner.write_u16::<BigEndian>(BinBlockType::Payload.0)?;
        self.inner
            .write_u32::<BigEndian>(PAYLOAD_HEADER_SIZE + payload.len() as u32)?;
        self.inner.write_i64::<BigEndian>(decode_index)?;
        self.inner.write_i64::<BigEndian>(presentation_index)?;
        self.inner.write_all(payload)?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn round_trip() {
        let mut writer = BinWriter::new(Vec::new()).expect("header");
        writer.write_block(0, 1000, b"first").expect("block");
        writer.write_block(1, 2000, b"second").expect("block");
        let bytes = writer.into_inner();

        let mut reader = BinReader::new(Cursor::new(bytes)).expect("header");
        let first = reader.read_block().expect("read").expect("block");
        assert_eq!(first.decode_index, 0);
        assert_eq!(first.presentation_index, 1000);
        assert_eq!(&first.payload[..], b"first");

        let second = reader.read_block().expect("read").expect("block");
        assert_eq!(second.decode_index, 1);
        assert_eq!(second.presentation_index, 2000);
        assert_eq!(&second.payload[..], b"second");

        assert!(reader.read_block().expect("read").is_none());
    }

    #[test]
    fn bad_magic() {
        assert!(matches!(
            BinReader::new(Cursor::new(b"notlcevc\x00\x00\x00\x01".to_vec())),
            Err(BinError::BadHeader)
        ));
    }

    #[test]
    fn unsupported_version() {
        let mut bytes = BIN_MAGIC.to_vec();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        assert!(matches!(
            BinReader::new(Cursor::new(bytes)),
            Err(BinError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn short_block_is_an_error() {
        let mut bytes = BIN_MAGIC.to_vec();
        bytes.extend_from_slice(&BIN_VERSION.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]);

        let mut reader = BinReader::new(Cursor::new(bytes)).expect("header");
        assert!(matches!(reader.read_block(), Err(BinError::ShortBlock(4))));
    }

    #[test]
    fn unknown_block_type() {
        let mut bytes = BIN_MAGIC.to_vec();
        bytes.extend_from_slice(&BIN_VERSION.to_be_bytes());
        bytes.extend_from_slice(&7u16.to_be_bytes());
        bytes.extend_from_slice(&16u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 16]);

        let mut reader = BinReader::new(Cursor::new(bytes)).expect("header");
        assert!(matches!(reader.read_block(), Err(BinError::UnknownBlock(7))));
    }

    #[test]
    fn truncated_payload() {
        let mut writer = BinWriter::new(Vec::new()).expect("header");
        writer.write_block(0, 0, b"payload").expect("block");
        let mut bytes = writer.into_inner();
        bytes.truncate(bytes.len() - 3);

        let mut reader = BinReader::new(Cursor::new(bytes)).expect("header");
        assert!(matches!(reader.read_block(), Err(BinError::Io(_))));
    }
}
