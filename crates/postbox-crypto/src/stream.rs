//! Streaming authenticated envelope codec.
//!
//! An envelope is laid out as:
//!
//! ```text
//! nonce (24) || 0x00 || enc(header block) || enc(body chunks...) || tag (16)
//! ```
//!
//! The header block is a sequence of `Key: Value\n` lines terminated by an
//! empty line and is encrypted in the same XChaCha20 keystream as the body.
//! A single Poly1305 tag is computed incrementally over the whole ciphertext
//! following the RFC 8439 AEAD construction without associated data, so the
//! bytes after the separator are identical to a one-shot XChaCha20-Poly1305
//! encryption of `header || plaintext`.
//!
//! Decoding requires a seekable source: the tag is verified over the full
//! ciphertext first and plaintext is only released afterwards.

use std::io::{self, Read, Seek, SeekFrom};

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::XChaCha20;
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::Poly1305;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::symmetric::{ContentKey, Nonce, NONCE_SIZE, TAG_SIZE};
use crate::{CryptoError, Result};

/// Byte separating the nonce from the ciphertext.
pub const SEPARATOR: u8 = 0x00;

/// Plaintext is read and encrypted in chunks of this size.
pub const CHUNK_SIZE: usize = 512;

/// Maximum size of the decrypted header block.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Size of the unencrypted envelope prefix (nonce plus separator).
pub const PREFIX_SIZE: usize = NONCE_SIZE + 1;

/// Smallest possible envelope: prefix, empty header line and tag.
pub const MIN_ENVELOPE_SIZE: usize = PREFIX_SIZE + 1 + TAG_SIZE;

const POLY1305_BLOCK: usize = 16;
const CHACHA_BLOCK: u64 = 64;

/// Ordered `Key: Value` fields stored in front of the encrypted body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    fields: Vec<(String, String)>,
}

impl EnvelopeHeader {
    /// Create a header without any fields.
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    /// Create a header with a single `Type` field.
    pub fn with_type(kind: &str) -> Result<Self> {
        let mut header = Self::empty();
        header.insert("Type", kind)?;
        Ok(header)
    }

    /// Set a field, replacing an existing one with the same name.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEnvelope` if the name or value would break the
    /// line format.
    pub fn insert(&mut self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() || name.contains([':', '\n', '\r']) || name.trim() != name {
            return Err(CryptoError::MalformedEnvelope(format!(
                "invalid header name {name:?}"
            )));
        }
        if value.contains(['\n', '\r']) {
            return Err(CryptoError::MalformedEnvelope(format!(
                "invalid value for header {name:?}"
            )));
        }
        match self.fields.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.fields.push((name.to_string(), value.to_string())),
        }
        Ok(())
    }

    /// Look up a field by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the header has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize to the header block, including the terminating empty line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out
    }

    /// Parse header lines (without the terminating empty line).
    fn parse_lines(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| CryptoError::MalformedEnvelope("header is not UTF-8".into()))?;
        let mut header = Self::empty();
        for line in text.lines() {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                CryptoError::MalformedEnvelope(format!("header line without colon: {line:?}"))
            })?;
            header.insert(name.trim(), value.strip_prefix(' ').unwrap_or(value))?;
        }
        Ok(header)
    }
}

impl Default for EnvelopeHeader {
    fn default() -> Self {
        Self {
            fields: vec![("Type".to_string(), "message".to_string())],
        }
    }
}

/// Incremental Poly1305 over ciphertext fed in arbitrary slices.
struct EnvelopeMac {
    mac: Poly1305,
    partial: [u8; POLY1305_BLOCK],
    partial_len: usize,
    total: u64,
}

impl EnvelopeMac {
    fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;

        if self.partial_len > 0 {
            let take = (POLY1305_BLOCK - self.partial_len).min(data.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];
            if self.partial_len < POLY1305_BLOCK {
                return;
            }
            let block = poly1305::Block::clone_from_slice(&self.partial);
            self.mac.update(&[block]);
            self.partial_len = 0;
        }

        let mut blocks = data.chunks_exact(POLY1305_BLOCK);
        for block in &mut blocks {
            self.mac.update(&[poly1305::Block::clone_from_slice(block)]);
        }
        let rest = blocks.remainder();
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }

    fn finalize(mut self) -> [u8; TAG_SIZE] {
        self.mac.update_padded(&self.partial[..self.partial_len]);

        // length block: associated data length (always zero), ciphertext length
        let mut lengths = poly1305::Block::default();
        lengths[8..].copy_from_slice(&self.total.to_le_bytes());
        self.mac.update(&[lengths]);

        self.partial.zeroize();
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(self.mac.finalize().as_slice());
        tag
    }
}

/// XChaCha20 positioned at the first body block, together with its MAC.
fn init_cipher(key: &ContentKey, nonce: &Nonce) -> (XChaCha20, EnvelopeMac) {
    let mut cipher = XChaCha20::new(
        chacha20::Key::from_slice(key.as_bytes()),
        chacha20::XNonce::from_slice(nonce.as_bytes()),
    );
    let mut mac_key = poly1305::Key::default();
    cipher.apply_keystream(&mut mac_key);
    let mac = Poly1305::new(&mac_key);
    mac_key.zeroize();
    cipher.seek(CHACHA_BLOCK);
    (
        cipher,
        EnvelopeMac {
            mac,
            partial: [0u8; POLY1305_BLOCK],
            partial_len: 0,
            total: 0,
        },
    )
}

fn keystream_error() -> CryptoError {
    CryptoError::Encryption("keystream exhausted".into())
}

/// Encrypting reader producing the envelope bytes.
///
/// Reading drains, in order, the prefix and encrypted header, one encrypted
/// chunk per plaintext read, and finally the tag.
pub struct EnvelopeEncoder<R> {
    source: R,
    state: Option<(XChaCha20, EnvelopeMac)>,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<R: Read> EnvelopeEncoder<R> {
    pub(crate) fn new(
        key: &ContentKey,
        nonce: Nonce,
        source: R,
        header: &EnvelopeHeader,
    ) -> Result<Self> {
        let (mut cipher, mut mac) = init_cipher(key, &nonce);

        let mut block = header.to_bytes();
        cipher
            .try_apply_keystream(&mut block)
            .map_err(|_| keystream_error())?;
        mac.update(&block);

        let mut pending = Vec::with_capacity(PREFIX_SIZE + block.len());
        pending.extend_from_slice(nonce.as_bytes());
        pending.push(SEPARATOR);
        pending.extend_from_slice(&block);

        Ok(Self {
            source,
            state: Some((cipher, mac)),
            pending,
            pending_pos: 0,
        })
    }

    /// Whether the tag has been produced.
    pub fn is_finished(&self) -> bool {
        self.state.is_none()
    }

    fn fill_next(&mut self) -> io::Result<bool> {
        if self.state.is_none() {
            return Ok(false);
        }

        let mut chunk = vec![0u8; CHUNK_SIZE];
        let n = read_chunk(&mut self.source, &mut chunk)?;
        if n == 0 {
            if let Some((_, mac)) = self.state.take() {
                self.pending = mac.finalize().to_vec();
            }
        } else if let Some((cipher, mac)) = self.state.as_mut() {
            chunk.truncate(n);
            cipher
                .try_apply_keystream(&mut chunk)
                .map_err(|_| io::Error::other(keystream_error()))?;
            mac.update(&chunk);
            self.pending = chunk;
        }
        self.pending_pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for EnvelopeEncoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let available = self.pending.len() - self.pending_pos;
            if available > 0 {
                let n = available.min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                return Ok(n);
            }
            if !self.fill_next()? {
                return Ok(0);
            }
        }
    }
}

impl<R> std::fmt::Debug for EnvelopeEncoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeEncoder")
            .field("finished", &self.state.is_none())
            .finish_non_exhaustive()
    }
}

/// Read up to one chunk, retrying short reads until EOF or the chunk is full.
fn read_chunk<R: Read>(source: &mut R, chunk: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < chunk.len() {
        match source.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Start encrypting `plaintext` under a fresh content key and nonce.
///
/// Returns the key together with a reader producing the envelope.
pub fn encode<R: Read>(
    plaintext: R,
    header: &EnvelopeHeader,
) -> Result<(ContentKey, EnvelopeEncoder<R>)> {
    let key = ContentKey::generate();
    let encoder = EnvelopeEncoder::new(&key, Nonce::generate(), plaintext, header)?;
    Ok((key, encoder))
}

/// Encrypt an in-memory plaintext into a complete envelope.
pub fn encode_to_vec(plaintext: &[u8], header: &EnvelopeHeader) -> Result<(ContentKey, Vec<u8>)> {
    let (key, mut encoder) = encode(plaintext, header)?;
    let mut out = Vec::with_capacity(MIN_ENVELOPE_SIZE + header.to_bytes().len() + plaintext.len());
    encoder.read_to_end(&mut out)?;
    Ok((key, out))
}

/// Verified plaintext stream of a decoded envelope.
pub struct PlaintextReader<R> {
    inner: io::Take<R>,
    cipher: XChaCha20,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<R: Read> Read for PlaintextReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let available = self.pending.len() - self.pending_pos;
        if available > 0 {
            let n = available.min(buf.len());
            buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
            self.pending_pos += n;
            return Ok(n);
        }
        let n = self.inner.read(buf)?;
        self.cipher
            .try_apply_keystream(&mut buf[..n])
            .map_err(|_| io::Error::other(keystream_error()))?;
        Ok(n)
    }
}

impl<R> std::fmt::Debug for PlaintextReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaintextReader")
            .field("remaining", &(self.inner.limit() as usize + self.pending.len() - self.pending_pos))
            .finish_non_exhaustive()
    }
}

/// Result of a successful decode: the header and the plaintext stream.
#[derive(Debug)]
pub struct DecodedEnvelope<R> {
    /// Header fields from the envelope.
    pub header: EnvelopeHeader,
    /// Reader over the verified plaintext.
    pub plaintext: PlaintextReader<R>,
}

impl<R: Read> DecodedEnvelope<R> {
    /// Read the whole plaintext into memory.
    pub fn read_to_vec(mut self) -> Result<(EnvelopeHeader, Vec<u8>)> {
        let mut out = Vec::new();
        self.plaintext.read_to_end(&mut out)?;
        Ok((self.header, out))
    }
}

/// Verify and open an envelope starting at the current position of `envelope`.
///
/// # Errors
///
/// - `MalformedEnvelope` for a truncated envelope, a missing separator or an
///   unterminated or oversized header block
/// - `Integrity` if the tag does not match the ciphertext under `key`
pub fn decode<R: Read + Seek>(mut envelope: R, key: &ContentKey) -> Result<DecodedEnvelope<R>> {
    let start = envelope.stream_position()?;
    let end = envelope.seek(SeekFrom::End(0))?;
    let total = end.saturating_sub(start);
    if total < MIN_ENVELOPE_SIZE as u64 {
        return Err(CryptoError::MalformedEnvelope(format!(
            "envelope too short: {total} bytes"
        )));
    }
    let body_len = total - PREFIX_SIZE as u64 - TAG_SIZE as u64;

    envelope.seek(SeekFrom::Start(start))?;
    let mut prefix = [0u8; PREFIX_SIZE];
    envelope.read_exact(&mut prefix)?;
    if prefix[NONCE_SIZE] != SEPARATOR {
        return Err(CryptoError::MalformedEnvelope("missing separator".into()));
    }
    let nonce = Nonce::from_bytes(&prefix[..NONCE_SIZE])?;

    envelope.seek(SeekFrom::Start(start + PREFIX_SIZE as u64 + body_len))?;
    let mut tag = [0u8; TAG_SIZE];
    envelope.read_exact(&mut tag)?;

    // verification pass
    envelope.seek(SeekFrom::Start(start + PREFIX_SIZE as u64))?;
    let (_, mut mac) = init_cipher(key, &nonce);
    let mut body = (&mut envelope).take(body_len);
    let mut chunk = vec![0u8; CHUNK_SIZE * 8];
    loop {
        let n = body.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        mac.update(&chunk[..n]);
    }
    if body.limit() != 0 {
        return Err(CryptoError::MalformedEnvelope("envelope truncated while reading".into()));
    }
    let expected = mac.finalize();
    if !bool::from(expected[..].ct_eq(&tag[..])) {
        return Err(CryptoError::Integrity);
    }

    // decryption pass
    envelope.seek(SeekFrom::Start(start + PREFIX_SIZE as u64))?;
    let (mut cipher, _) = init_cipher(key, &nonce);
    let mut inner = envelope.take(body_len);
    let mut header_buf: Vec<u8> = Vec::new();
    let header_end = loop {
        if let Some(end) = header_terminator(&header_buf) {
            break end;
        }
        if header_buf.len() > MAX_HEADER_SIZE {
            return Err(CryptoError::MalformedEnvelope("header block too large".into()));
        }
        let n = inner.read(&mut chunk[..CHUNK_SIZE])?;
        if n == 0 {
            return Err(CryptoError::MalformedEnvelope("unterminated header block".into()));
        }
        cipher
            .try_apply_keystream(&mut chunk[..n])
            .map_err(|_| keystream_error())?;
        header_buf.extend_from_slice(&chunk[..n]);
    };
    chunk.zeroize();
    if header_end > MAX_HEADER_SIZE {
        return Err(CryptoError::MalformedEnvelope("header block too large".into()));
    }

    let pending = header_buf.split_off(header_end);
    let header = EnvelopeHeader::parse_lines(&header_buf[..header_end - 1])?;
    header_buf.zeroize();

    Ok(DecodedEnvelope {
        header,
        plaintext: PlaintextReader {
            inner,
            cipher,
            pending,
            pending_pos: 0,
        },
    })
}

/// Decode an in-memory envelope.
pub fn decode_slice(envelope: &[u8], key: &ContentKey) -> Result<(EnvelopeHeader, Vec<u8>)> {
    decode(io::Cursor::new(envelope), key)?.read_to_vec()
}

/// Offset just past the empty line terminating the header block.
fn header_terminator(buf: &[u8]) -> Option<usize> {
    if buf.first() == Some(&b'\n') {
        return Some(1);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
}
