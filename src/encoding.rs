//! Inline document encoding for the model transport.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Bytes handed to the encoder per step.
pub const CHUNK_SIZE: usize = 32_768;

/// Encode a document as standard base64, walking the buffer in
/// [`CHUNK_SIZE`] steps.
///
/// Chunk boundaries do not fall on 3-byte groups, so up to two trailing bytes
/// are carried into the next step. Output is identical to encoding the whole
/// buffer at once.
pub fn encode_document(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    let mut buf: Vec<u8> = Vec::with_capacity(CHUNK_SIZE + 2);
    let mut carry: Vec<u8> = Vec::with_capacity(2);

    for chunk in bytes.chunks(CHUNK_SIZE) {
        buf.clear();
        buf.extend_from_slice(&carry);
        buf.extend_from_slice(chunk);

        let aligned = buf.len() - buf.len() % 3;
        BASE64.encode_string(&buf[..aligned], &mut out);

        carry.clear();
        carry.extend_from_slice(&buf[aligned..]);
    }

    if !carry.is_empty() {
        BASE64.encode_string(&carry, &mut out);
    }

    out
}
