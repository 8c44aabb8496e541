//! Ingest decompression with magic-byte autodetection.

use std::io::{self, Read, Seek, SeekFrom};

use anyhow::Result;
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use xz2::read::XzDecoder;

use crate::error::StoreError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Reader over the uncompressed form of an image archive.
pub enum DecompressingReader<R: Read> {
    Plain(R),
    Gzip(GzDecoder<R>),
    Bzip2(BzDecoder<R>),
    Xz(XzDecoder<R>),
}

impl<R: Read> Read for DecompressingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Gzip(r) => r.read(buf),
            Self::Bzip2(r) => r.read(buf),
            Self::Xz(r) => r.read(buf),
        }
    }
}

/// Wrap a seekable stream in the decoder matching its leading magic bytes,
/// or pass it through untouched when no known magic is present.
///
/// # Errors
///
/// Fails with [`StoreError::Decompression`] when the stream cannot be
/// sniffed or rewound.
pub fn decompressing_reader<R: Read + Seek>(mut r: R) -> Result<DecompressingReader<R>> {
    let mut magic = [0u8; XZ_MAGIC.len()];
    let sniffed = read_up_to(&mut r, &mut magic)
        .map_err(|err| StoreError::Decompression(format!("failed to sniff stream: {err}")))?;
    r.seek(SeekFrom::Start(0))
        .map_err(|err| StoreError::Decompression(format!("failed to rewind stream: {err}")))?;

    let magic = &magic[..sniffed];
    if magic.starts_with(&GZIP_MAGIC) {
        Ok(DecompressingReader::Gzip(GzDecoder::new(r)))
    } else if magic.starts_with(&BZIP2_MAGIC) {
        Ok(DecompressingReader::Bzip2(BzDecoder::new(r)))
    } else if magic.starts_with(&XZ_MAGIC) {
        Ok(DecompressingReader::Xz(XzDecoder::new(r)))
    } else {
        Ok(DecompressingReader::Plain(r))
    }
}

fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = r.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
