// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire format for memory operations.
//!
//! ```text
//!  0        1                 9            13                          32
//!  +--------+-----------------+------------+---------------------------+---------+-------+
//!  | op u8  | destination u64 | length u32 | reserved (19 bytes, zero) | payload | crc32 |
//!  +--------+-----------------+------------+---------------------------+---------+-------+
//! ```
//!
//! All integers are little-endian. The trailing CRC-32 (IEEE) covers the payload only and is
//! present whenever a command crosses a process or node boundary ([`encode_framed`] /
//! [`decode_framed`]). [`encode`] / [`decode`] handle the bare header + payload form.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the fixed command header
pub const HEADER_LEN: usize = 32;

/// Size of the trailing checksum on framed commands
pub const CHECKSUM_LEN: usize = 4;

const RESERVED_LEN: usize = HEADER_LEN - 1 - 8 - 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Operation {
    /// Copy the payload to the destination
    Copy = 1,
    /// Fill `data_size` bytes at the destination with the first payload byte
    Set = 2,
}

impl Operation {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Operation {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Operation::Copy),
            2 => Ok(Operation::Set),
            other => Err(CodecError::UnknownOperation(other)),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Copy => write!(f, "copy"),
            Operation::Set => write!(f, "set"),
        }
    }
}

/// Opaque 64-bit destination. Only the address map and the local address space interpret it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressHandle(u64);

impl AddressHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Handle `offset` bytes past this one, or `None` on overflow
    pub fn checked_add(self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }
}

impl From<u64> for AddressHandle {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for AddressHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressHandle({:#x})", self.0)
    }
}

impl fmt::Display for AddressHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Coarse classification used for counters and log fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    Format,
    SizeMismatch,
    Checksum,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("format error: buffer of {len} bytes is shorter than the 32-byte header")]
    HeaderTooShort { len: usize },

    #[error("format error: unknown operation code {0}")]
    UnknownOperation(u8),

    #[error("size mismatch: frame needs {required} bytes but only {available} are present")]
    SizeMismatch { required: usize, available: usize },

    #[error("checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("payload of {0} bytes does not fit the 32-bit length field")]
    PayloadTooLarge(usize),
}

impl CodecError {
    pub fn kind(&self) -> CodecErrorKind {
        match self {
            CodecError::HeaderTooShort { .. }
            | CodecError::UnknownOperation(_)
            | CodecError::PayloadTooLarge(_) => CodecErrorKind::Format,
            CodecError::SizeMismatch { .. } => CodecErrorKind::SizeMismatch,
            CodecError::ChecksumMismatch { .. } => CodecErrorKind::Checksum,
        }
    }
}

/// CRC-32 (IEEE) of a payload
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// A single memory operation.
///
/// `data_size` is always the payload length. `checksum` is the CRC the sender claimed; for
/// commands built with [`MemoryOpCommand::new`] it is computed from the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOpCommand {
    operation: Operation,
    destination: AddressHandle,
    checksum: u32,
    payload: Bytes,
}

impl MemoryOpCommand {
    pub fn new(
        operation: Operation,
        destination: impl Into<AddressHandle>,
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        Self {
            operation,
            destination: destination.into(),
            checksum: checksum(&payload),
            payload,
        }
    }

    /// Shorthand for a [`Operation::Copy`] command
    pub fn copy(destination: impl Into<AddressHandle>, payload: impl Into<Bytes>) -> Self {
        Self::new(Operation::Copy, destination, payload)
    }

    /// A [`Operation::Set`] command that fills `len` bytes with `value`
    pub fn fill(destination: impl Into<AddressHandle>, value: u8, len: usize) -> Self {
        Self::new(Operation::Set, destination, vec![value; len])
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn destination(&self) -> AddressHandle {
        self.destination
    }

    pub fn data_size(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Same operation, destination and payload with the checksum computed afresh
    pub fn with_fresh_checksum(&self) -> Self {
        Self {
            checksum: checksum(&self.payload),
            ..self.clone()
        }
    }

    pub fn verify_checksum(&self) -> Result<(), CodecError> {
        let actual = checksum(&self.payload);
        if actual != self.checksum {
            return Err(CodecError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Length of this command in framed wire form
    pub fn framed_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + CHECKSUM_LEN
    }
}

/// Decoded header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub operation: Operation,
    pub destination: AddressHandle,
    pub data_size: u32,
}

/// Parse the fixed header. Reserved bytes are ignored.
pub fn decode_header(buf: &[u8]) -> Result<Header, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::HeaderTooShort { len: buf.len() });
    }
    let mut header = &buf[..HEADER_LEN];
    let operation = Operation::try_from(header.get_u8())?;
    let destination = AddressHandle(header.get_u64_le());
    let data_size = header.get_u32_le();
    Ok(Header {
        operation,
        destination,
        data_size,
    })
}

fn put_header(dst: &mut BytesMut, cmd: &MemoryOpCommand) {
    dst.put_u8(cmd.operation.code());
    dst.put_u64_le(cmd.destination.raw());
    dst.put_u32_le(cmd.data_size());
    dst.put_bytes(0, RESERVED_LEN);
}

fn check_payload_len(cmd: &MemoryOpCommand) -> Result<(), CodecError> {
    if cmd.payload.len() > u32::MAX as usize {
        return Err(CodecError::PayloadTooLarge(cmd.payload.len()));
    }
    Ok(())
}

/// Header + payload
pub fn encode(cmd: &MemoryOpCommand) -> Result<Bytes, CodecError> {
    check_payload_len(cmd)?;
    let mut dst = BytesMut::with_capacity(HEADER_LEN + cmd.payload.len());
    put_header(&mut dst, cmd);
    dst.put_slice(&cmd.payload);
    Ok(dst.freeze())
}

/// Header + payload + little-endian CRC-32 of the payload
pub fn encode_framed(cmd: &MemoryOpCommand) -> Result<Bytes, CodecError> {
    check_payload_len(cmd)?;
    let mut dst = BytesMut::with_capacity(cmd.framed_len());
    put_header(&mut dst, cmd);
    dst.put_slice(&cmd.payload);
    dst.put_u32_le(cmd.checksum);
    Ok(dst.freeze())
}

/// Inverse of [`encode`]. The checksum of the returned command is computed locally.
pub fn decode(buf: &[u8]) -> Result<MemoryOpCommand, CodecError> {
    let header = decode_header(buf)?;
    let end = HEADER_LEN + header.data_size as usize;
    if buf.len() < end {
        return Err(CodecError::SizeMismatch {
            required: end,
            available: buf.len(),
        });
    }
    Ok(MemoryOpCommand::new(
        header.operation,
        header.destination,
        Bytes::copy_from_slice(&buf[HEADER_LEN..end]),
    ))
}

/// Inverse of [`encode_framed`]; fails with [`CodecError::ChecksumMismatch`] when the trailer
/// does not match the payload.
pub fn decode_framed(buf: &[u8]) -> Result<MemoryOpCommand, CodecError> {
    let header = decode_header(buf)?;
    let payload_end = HEADER_LEN + header.data_size as usize;
    let frame_end = payload_end + CHECKSUM_LEN;
    if buf.len() < frame_end {
        return Err(CodecError::SizeMismatch {
            required: frame_end,
            available: buf.len(),
        });
    }

    let payload = &buf[HEADER_LEN..payload_end];
    let expected = (&buf[payload_end..frame_end]).get_u32_le();
    let actual = checksum(payload);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    Ok(MemoryOpCommand {
        operation: header.operation,
        destination: header.destination,
        checksum: expected,
        payload: Bytes::copy_from_slice(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_header_layout() {
        let cmd = MemoryOpCommand::copy(0x1122_3344_5566_7788u64, vec![0xAA, 0xBB]);
        let wire = encode(&cmd).unwrap();

        assert_eq!(wire.len(), HEADER_LEN + 2);
        assert_eq!(wire[0], 1);
        assert_eq!(&wire[1..9], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&wire[9..13], &2u32.to_le_bytes());
        assert!(wire[13..32].iter().all(|b| *b == 0));
        assert_eq!(&wire[32..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_framed_trailer_is_payload_crc() {
        let cmd = MemoryOpCommand::fill(0x40u64, 0x7F, 8);
        let wire = encode_framed(&cmd).unwrap();
        let trailer = u32::from_le_bytes(wire[wire.len() - 4..].try_into().unwrap());
        assert_eq!(trailer, crc32fast::hash(&[0x7F; 8]));
        assert_eq!(trailer, cmd.checksum());
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one_short(31)]
    fn test_short_header_is_format_error(#[case] len: usize) {
        let err = decode(&vec![1u8; len]).unwrap_err();
        assert_eq!(err, CodecError::HeaderTooShort { len });
        assert_eq!(err.kind(), CodecErrorKind::Format);
    }

    #[test]
    fn test_unknown_operation_is_format_error() {
        let mut wire = encode(&MemoryOpCommand::copy(1u64, vec![1])).unwrap().to_vec();
        wire[0] = 9;
        let err = decode(&wire).unwrap_err();
        assert_eq!(err, CodecError::UnknownOperation(9));
        assert_eq!(err.kind(), CodecErrorKind::Format);
    }

    #[test]
    fn test_declared_length_beyond_buffer() {
        let wire = encode(&MemoryOpCommand::copy(1u64, vec![0u8; 16])).unwrap();
        let err = decode(&wire[..HEADER_LEN + 10]).unwrap_err();
        assert_eq!(
            err,
            CodecError::SizeMismatch {
                required: HEADER_LEN + 16,
                available: HEADER_LEN + 10
            }
        );
    }

    #[test]
    fn test_missing_trailer_is_size_mismatch() {
        let cmd = MemoryOpCommand::copy(1u64, vec![3u8; 4]);
        let bare = encode(&cmd).unwrap();
        let err = decode_framed(&bare).unwrap_err();
        assert_eq!(err.kind(), CodecErrorKind::SizeMismatch);
    }

    #[test]
    fn test_reserved_and_trailing_bytes_ignored() {
        let cmd = MemoryOpCommand::copy(0xdead_0000u64, b"hello".to_vec());
        let mut wire = encode_framed(&cmd).unwrap().to_vec();
        wire[20] = 0xFF;
        wire.extend_from_slice(&[0xEE; 7]);
        assert_eq!(decode_framed(&wire).unwrap(), cmd);
    }

    #[test]
    fn test_corrupt_checksum_field_detected() {
        let cmd = MemoryOpCommand::copy(1u64, b"payload".to_vec());
        let mut wire = encode_framed(&cmd).unwrap().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert_eq!(
            decode_framed(&wire).unwrap_err().kind(),
            CodecErrorKind::Checksum
        );
    }

    #[test]
    fn test_fresh_checksum_repairs_command() {
        let cmd = MemoryOpCommand {
            operation: Operation::Copy,
            destination: AddressHandle::new(7),
            checksum: 0,
            payload: Bytes::from_static(b"abc"),
        };
        assert!(cmd.verify_checksum().is_err());
        assert!(cmd.with_fresh_checksum().verify_checksum().is_ok());
    }

    fn arb_command() -> impl Strategy<Value = MemoryOpCommand> {
        (
            prop_oneof![Just(Operation::Copy), Just(Operation::Set)],
            any::<u64>(),
            proptest::collection::vec(any::<u8>(), 0..512),
        )
            .prop_map(|(op, dst, payload)| MemoryOpCommand::new(op, dst, payload))
    }

    proptest! {
        #[test]
        fn prop_round_trip(cmd in arb_command()) {
            prop_assert_eq!(decode(&encode(&cmd).unwrap()).unwrap(), cmd.clone());
            prop_assert_eq!(decode_framed(&encode_framed(&cmd).unwrap()).unwrap(), cmd);
        }

        #[test]
        fn prop_single_payload_bit_flip_rejected(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let cmd = MemoryOpCommand::copy(0x1000u64, payload);
            let mut wire = encode_framed(&cmd).unwrap().to_vec();
            let offset = HEADER_LEN + index.index(cmd.payload().len());
            wire[offset] ^= 1 << bit;

            let err = decode_framed(&wire).unwrap_err();
            prop_assert_eq!(err.kind(), CodecErrorKind::Checksum);
        }
    }
}
