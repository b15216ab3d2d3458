//! Container codec: signature, optional salt, stream header, sealed chunks
//!
//! ```text
//! symmetric:  [11: "zDKO6XYXioc"][16: salt][24: stream header][chunk]*[final chunk]
//! asymmetric: [11: "hTWKbfoikeg"][24: stream header][chunk]*[final chunk]
//! chunk:      chunk_size + 17 bytes; the FINAL chunk may be shorter
//! ```
//!
//! Chunks carry no length prefix, so encryptor and decryptor must agree on
//! `chunk_size`. The legacy v1 signature is recognised only so callers can
//! ask the user to upgrade; its layout is not decoded.

use std::io::{self, Read, Write};

use crate::error::CryptoError;
use crate::kdf::SessionKey;
use crate::secretstream::{PullStream, PushStream, StreamHeader, Tag};
use crate::{ABYTES, HEADER_SIZE, SALT_SIZE};

pub const SIGNATURE_SIZE: usize = 11;
pub const LEGACY_SIGNATURE_SIZE: usize = 22;

pub const SIGNATURE_SYMMETRIC: &[u8; SIGNATURE_SIZE] = b"zDKO6XYXioc";
pub const SIGNATURE_ASYMMETRIC: &[u8; SIGNATURE_SIZE] = b"hTWKbfoikeg";
pub const SIGNATURE_LEGACY: &[u8; LEGACY_SIGNATURE_SIZE] = b"Encrypted Using Hat.sh";

/// Offset of the first chunk in a symmetric container (51).
pub const SYMMETRIC_DATA_OFFSET: usize = SIGNATURE_SIZE + SALT_SIZE + HEADER_SIZE;
/// Offset of the first chunk in an asymmetric container (35).
pub const ASYMMETRIC_DATA_OFFSET: usize = SIGNATURE_SIZE + HEADER_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("unrecognized file format")]
    UnrecognizedFormat,

    #[error("file was encrypted with an older version; upgrade required")]
    LegacyFormat,

    #[error("container is truncated")]
    Truncated,

    #[error("data found after the final chunk")]
    TrailingData,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Symmetric,
    Asymmetric,
    Legacy,
    Unrecognized,
}

impl ContainerKind {
    /// Offset of the first chunk, for the kinds that can be decoded.
    pub fn data_offset(self) -> Option<usize> {
        match self {
            ContainerKind::Symmetric => Some(SYMMETRIC_DATA_OFFSET),
            ContainerKind::Asymmetric => Some(ASYMMETRIC_DATA_OFFSET),
            ContainerKind::Legacy | ContainerKind::Unrecognized => None,
        }
    }
}

impl std::fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerKind::Symmetric => write!(f, "symmetric-v2 (password)"),
            ContainerKind::Asymmetric => write!(f, "asymmetric-v2 (key pair)"),
            ContainerKind::Legacy => write!(f, "legacy-v1"),
            ContainerKind::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// Match the leading bytes of a file against the known signatures.
///
/// `signature` is the first 11 bytes, `legacy` the first 22; the legacy
/// signature is only consulted when the short one is unknown.
pub fn detect(signature: &[u8], legacy: &[u8]) -> ContainerKind {
    if signature == SIGNATURE_SYMMETRIC {
        ContainerKind::Symmetric
    } else if signature == SIGNATURE_ASYMMETRIC {
        ContainerKind::Asymmetric
    } else if legacy == SIGNATURE_LEGACY {
        ContainerKind::Legacy
    } else {
        ContainerKind::Unrecognized
    }
}

/// `detect` over a single prefix buffer of any length.
pub fn detect_prefix(prefix: &[u8]) -> ContainerKind {
    let signature = &prefix[..prefix.len().min(SIGNATURE_SIZE)];
    let legacy = &prefix[..prefix.len().min(LEGACY_SIGNATURE_SIZE)];
    detect(signature, legacy)
}

/// Size on disk of a container holding `plain_len` bytes.
pub fn encrypted_len(kind: ContainerKind, plain_len: u64, chunk_size: usize) -> Option<u64> {
    let offset = kind.data_offset()? as u64;
    let chunks = plain_len.div_ceil(chunk_size as u64).max(1);
    Some(offset + plain_len + chunks * ABYTES as u64)
}

/// Parsed container prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerHeader {
    Symmetric {
        salt: [u8; SALT_SIZE],
        header: StreamHeader,
    },
    Asymmetric {
        header: StreamHeader,
    },
}

impl ContainerHeader {
    pub fn kind(&self) -> ContainerKind {
        match self {
            ContainerHeader::Symmetric { .. } => ContainerKind::Symmetric,
            ContainerHeader::Asymmetric { .. } => ContainerKind::Asymmetric,
        }
    }

    pub fn stream_header(&self) -> &StreamHeader {
        match self {
            ContainerHeader::Symmetric { header, .. } | ContainerHeader::Asymmetric { header } => {
                header
            }
        }
    }

    pub fn salt(&self) -> Option<&[u8; SALT_SIZE]> {
        match self {
            ContainerHeader::Symmetric { salt, .. } => Some(salt),
            ContainerHeader::Asymmetric { .. } => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            ContainerHeader::Symmetric { .. } => SYMMETRIC_DATA_OFFSET,
            ContainerHeader::Asymmetric { .. } => ASYMMETRIC_DATA_OFFSET,
        }
    }

    /// Signature, salt (symmetric only), then the stream header.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        match self {
            ContainerHeader::Symmetric { salt, header } => {
                out.extend_from_slice(SIGNATURE_SYMMETRIC);
                out.extend_from_slice(salt);
                out.extend_from_slice(header.as_bytes());
            }
            ContainerHeader::Asymmetric { header } => {
                out.extend_from_slice(SIGNATURE_ASYMMETRIC);
                out.extend_from_slice(header.as_bytes());
            }
        }
        out
    }

    /// Parse a container prefix. The signature is matched before any other
    /// byte is interpreted.
    pub fn parse(prefix: &[u8]) -> Result<Self, ContainerError> {
        let kind = detect_prefix(prefix);
        let offset = match kind {
            ContainerKind::Legacy => return Err(ContainerError::LegacyFormat),
            ContainerKind::Unrecognized if prefix.len() < SIGNATURE_SIZE => {
                return Err(ContainerError::Truncated)
            }
            ContainerKind::Unrecognized => return Err(ContainerError::UnrecognizedFormat),
            ContainerKind::Symmetric => SYMMETRIC_DATA_OFFSET,
            ContainerKind::Asymmetric => ASYMMETRIC_DATA_OFFSET,
        };
        if prefix.len() < offset {
            return Err(ContainerError::Truncated);
        }

        let header = StreamHeader::from_slice(&prefix[offset - HEADER_SIZE..offset])?;
        Ok(match kind {
            ContainerKind::Symmetric => {
                let mut salt = [0u8; SALT_SIZE];
                salt.copy_from_slice(&prefix[SIGNATURE_SIZE..SIGNATURE_SIZE + SALT_SIZE]);
                ContainerHeader::Symmetric { salt, header }
            }
            _ => ContainerHeader::Asymmetric { header },
        })
    }
}

/// Writes a container to any `Write`, one sealed chunk per call.
pub struct ContainerWriter<W: Write> {
    inner: W,
    stream: PushStream,
    bytes_written: u64,
}

impl<W: Write> ContainerWriter<W> {
    /// Start a container; `salt` selects the symmetric layout.
    pub fn new(
        mut inner: W,
        key: &SessionKey,
        salt: Option<[u8; SALT_SIZE]>,
    ) -> Result<Self, ContainerError> {
        let (stream, header) = PushStream::init(key)?;
        let prefix = match salt {
            Some(salt) => ContainerHeader::Symmetric { salt, header },
            None => ContainerHeader::Asymmetric { header },
        }
        .encode();
        inner.write_all(&prefix)?;
        Ok(Self {
            inner,
            stream,
            bytes_written: prefix.len() as u64,
        })
    }

    pub fn write_chunk(&mut self, plaintext: &[u8], last: bool) -> Result<(), ContainerError> {
        let sealed = self.stream.push(plaintext, Tag::from_last(last))?;
        self.inner.write_all(&sealed)?;
        self.bytes_written += sealed.len() as u64;
        Ok(())
    }

    /// Read `reader` to the end in `chunk_size` slices, marking the last one FINAL.
    pub fn write_all_from<R: Read>(
        &mut self,
        reader: &mut R,
        chunk_size: usize,
    ) -> Result<(), ContainerError> {
        let mut current = vec![0u8; chunk_size];
        let mut filled = fill(reader, &mut current)?;
        loop {
            let mut next = vec![0u8; chunk_size];
            let next_filled = if filled == chunk_size {
                fill(reader, &mut next)?
            } else {
                0
            };
            let last = next_filled == 0;
            self.write_chunk(&current[..filled], last)?;
            if last {
                return Ok(());
            }
            current = next;
            filled = next_filled;
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush and return the writer. Fails with `Truncated` if no FINAL chunk was written.
    pub fn finish(mut self) -> Result<W, ContainerError> {
        if !self.stream.is_finished() {
            return Err(ContainerError::Truncated);
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Reads and verifies a container from any `Read`.
pub struct ContainerReader<R: Read> {
    inner: R,
    header: ContainerHeader,
    chunk_size: usize,
}

impl<R: Read> ContainerReader<R> {
    /// Read and parse the prefix.
    pub fn open(mut inner: R, chunk_size: usize) -> Result<Self, ContainerError> {
        let mut prefix = vec![0u8; LEGACY_SIGNATURE_SIZE];
        let n = fill(&mut inner, &mut prefix[..SIGNATURE_SIZE])?;
        prefix.truncate(n);

        let needed = match detect_prefix(&prefix) {
            ContainerKind::Symmetric => SYMMETRIC_DATA_OFFSET,
            ContainerKind::Asymmetric => ASYMMETRIC_DATA_OFFSET,
            _ => {
                // only now is it worth reading the longer legacy signature
                let mut rest = vec![0u8; LEGACY_SIGNATURE_SIZE - prefix.len()];
                let m = fill(&mut inner, &mut rest)?;
                prefix.extend_from_slice(&rest[..m]);
                return Err(ContainerHeader::parse(&prefix)
                    .err()
                    .unwrap_or(ContainerError::UnrecognizedFormat));
            }
        };

        let start = prefix.len();
        prefix.resize(needed, 0);
        let m = fill(&mut inner, &mut prefix[start..])?;
        prefix.truncate(start + m);

        let header = ContainerHeader::parse(&prefix)?;
        Ok(Self {
            inner,
            header,
            chunk_size,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Decrypt every chunk into `out`, returning the plaintext length.
    ///
    /// Fails with `Truncated` if the input ends before a FINAL chunk and with
    /// `TrailingData` if bytes follow it.
    pub fn decrypt_to<W: Write>(mut self, key: &SessionKey, out: &mut W) -> Result<u64, ContainerError> {
        let mut stream = PullStream::init(key, self.header.stream_header().as_bytes())?;
        let mut buf = vec![0u8; self.chunk_size + ABYTES];
        let mut total = 0u64;

        loop {
            let n = fill(&mut self.inner, &mut buf)?;
            if n == 0 {
                return Err(ContainerError::Truncated);
            }
            let (plain, tag) = stream.pull(&buf[..n])?;
            out.write_all(&plain)?;
            total += plain.len() as u64;

            if tag.is_final() {
                let mut probe = [0u8; 1];
                if fill(&mut self.inner, &mut probe)? != 0 {
                    return Err(ContainerError::TrailingData);
                }
                out.flush()?;
                return Ok(total);
            }
        }
    }
}

/// Read until `buf` is full or EOF, returning the number of bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
