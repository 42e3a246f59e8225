//! Canonical binary encoding.
//!
//! The canonical form is wire-normative: block ids, header signatures and
//! finality certificates are all derived from it, so every node must produce
//! byte-identical output for the same value. The rules are fixed field
//! order, big-endian fixed-width integers and u32-length-prefixed variable
//! fields.

use crate::hash::{Address, Hash};
use thiserror::Error;

/// Errors raised while reading canonical bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    #[error("Trailing bytes after value: {0} remaining")]
    TrailingBytes(usize),

    #[error("Declared length {declared} exceeds remaining input {remaining}")]
    LengthOverflow { declared: usize, remaining: usize },

    #[error("String field is not valid UTF-8")]
    InvalidUtf8,

    #[error("Undecodable payload")]
    InvalidPayload,
}

/// Append-only writer for the canonical form.
#[derive(Default)]
pub struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_hash(&mut self, value: &Hash) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn put_address(&mut self, value: &Address) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Raw bytes of statically known width. No length prefix.
    pub fn put_fixed(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    /// Variable-width bytes, prefixed with their u32 big-endian length.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Cursor-based reader mirroring [`CanonicalWriter`].
pub struct CanonicalReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> CanonicalReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.input.len() {
            return Err(CodecError::UnexpectedEof(self.pos));
        }
        let slice = &self.input[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn get_hash(&mut self) -> Result<Hash, CodecError> {
        let bytes: [u8; 32] = self.take(32)?.try_into().unwrap();
        Ok(Hash(bytes))
    }

    pub fn get_address(&mut self) -> Result<Address, CodecError> {
        let bytes: [u8; 20] = self.take(20)?.try_into().unwrap();
        Ok(Address(bytes))
    }

    pub fn get_fixed<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.get_u32()? as usize;
        let remaining = self.input.len() - self.pos;
        if len > remaining {
            return Err(CodecError::LengthOverflow {
                declared: len,
                remaining,
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    /// Assert the whole input was consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.pos != self.input.len() {
            return Err(CodecError::TrailingBytes(self.input.len() - self.pos));
        }
        Ok(())
    }
}
