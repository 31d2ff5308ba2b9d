//! cairn wire format: the three datagram kinds exchanged between peers.
//!
//! These types ARE the protocol. Every datagram is exactly
//! `max_packet_size` bytes on the wire; the logical fields come first and
//! everything after them is zero padding. FILE_META and ACK carry an
//! HMAC-SHA1 seal computed over the whole zero-normalized buffer;
//! DATA_TRANSFER does not (its authenticity is bounded by the sealed
//! FILE_META that announced the file and the key-addressed ack loop).
//!
//! All multi-byte integers are network byte order.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

type HmacSha1 = Hmac<Sha1>;

// ── Opcodes ──────────────────────────────────────────────────────────────────

/// Inventory announcement for one file.
pub const OP_FILE_META: u8 = 0x01;
/// One chunk of a file's byte stream.
pub const OP_DATA_TRANSFER: u8 = 0x02;
/// Acknowledgment of one received chunk.
pub const OP_ACK: u8 = 0x03;

// ── Field sizes ──────────────────────────────────────────────────────────────

/// MD5 digest length: the size of a [`FileKey`] on the wire.
pub const HASH_SIZE: usize = 16;
/// HMAC-SHA1 output length.
pub const HMAC_SIZE: usize = 20;
/// Sequence number field length.
pub const SEQ_NUM_SIZE: usize = 2;
/// Data-length field length.
pub const DATA_SIZE_SIZE: usize = 2;
/// Filename-length field length.
pub const NAME_SIZE_SIZE: usize = 4;
/// Timestamp field length.
pub const TIMESTAMP_SIZE: usize = 8;

/// Fixed bytes of a DATA_TRANSFER before the payload:
/// opcode, seqnum, key, has_next, data_length.
pub const DATA_HEADER_SIZE: usize = 1 + SEQ_NUM_SIZE + HASH_SIZE + 1 + DATA_SIZE_SIZE;

/// Bytes of a FILE_META that are not the filename:
/// opcode, key, name_length, has_next, seal.
pub const META_FIXED_SIZE: usize = 1 + HASH_SIZE + NAME_SIZE_SIZE + 1 + HMAC_SIZE;

/// Offset of the seal in an ACK datagram (everything before it is fixed).
const ACK_SEAL_OFFSET: usize = 1 + SEQ_NUM_SIZE + HASH_SIZE + TIMESTAMP_SIZE;

/// Logical length of an ACK datagram before padding.
pub const ACK_FIXED_SIZE: usize = ACK_SEAL_OFFSET + HMAC_SIZE;

// ── Sentinel ─────────────────────────────────────────────────────────────────

/// Reserved key carried by the empty-directory sentinel ACK.
/// Never produced by the inventory scanner; on receipt the peer clears its
/// remote view.
pub const EMPTY_DIR_KEY: FileKey = FileKey([
    0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
    0x89,
]);

/// Wire sequence number of the sentinel ACK: one below the first data
/// sequence number, wrapped into the 16-bit field.
pub const fn sentinel_seq(init_seq: u16) -> u16 {
    init_seq.wrapping_sub(1)
}

// ── File identity ────────────────────────────────────────────────────────────

/// 16-byte file identity: MD5 of `filename || creation_time_ms`.
///
/// Identifies a file across the peer pair. Collisions are treated as
/// identity (same logical file). Rendered lowercase hex in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey(pub [u8; HASH_SIZE]);

impl FileKey {
    /// Compute the key for a file. The creation time is hashed as eight
    /// big-endian bytes after the UTF-8 filename.
    pub fn compute(filename: &str, created_ms: u64) -> Self {
        let mut hasher = Md5::new();
        hasher.update(filename.as_bytes());
        hasher.update(created_ms.to_be_bytes());
        FileKey(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ── Logical frames ───────────────────────────────────────────────────────────

/// FILE_META: one inventory record. `has_next = false` terminates a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaFrame {
    pub key: FileKey,
    pub filename: String,
    pub has_next: bool,
}

/// DATA_TRANSFER: one chunk of a file. `has_next = false` marks the final
/// chunk; its payload may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub key: FileKey,
    pub seqnum: u16,
    pub has_next: bool,
    pub payload: Bytes,
}

/// ACK: acknowledges one received chunk. Non-cumulative. The timestamp is
/// the receiver's clock in ms since the epoch, diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub key: FileKey,
    pub seqnum: u16,
    pub timestamp_ms: u64,
}

impl AckFrame {
    /// The empty-directory sentinel announced by a peer with no files.
    pub fn sentinel(init_seq: u16, timestamp_ms: u64) -> Self {
        AckFrame {
            key: EMPTY_DIR_KEY,
            seqnum: sentinel_seq(init_seq),
            timestamp_ms,
        }
    }

    /// Whether this ACK is the empty-directory sentinel.
    pub fn is_sentinel(&self, init_seq: u16) -> bool {
        self.key == EMPTY_DIR_KEY && self.seqnum == sentinel_seq(init_seq)
    }
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Meta(MetaFrame),
    Data(DataFrame),
    Ack(AckFrame),
}

// ── Fixed ACK layout ─────────────────────────────────────────────────────────

/// Logical fields of an ACK datagram, before the seal and padding.
/// Wire size: 27 bytes.
#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct AckWire {
    opcode: u8,
    seqnum: U16<BigEndian>,
    key: [u8; HASH_SIZE],
    timestamp: U64<BigEndian>,
}

// Compile-time guard: the ACK layout must not drift.
assert_eq_size!(AckWire, [u8; ACK_SEAL_OFFSET]);

// ── Errors ───────────────────────────────────────────────────────────────────

/// Everything that can make a datagram malformed. Malformed packets are
/// dropped silently by the receiver; the protocol is lossy and the peer
/// retransmits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("datagram length {got} does not match the packet size {want}")]
    BadLength { got: usize, want: usize },

    #[error("length field {len} exceeds the {remaining} bytes available")]
    LengthOverflow { len: usize, remaining: usize },

    #[error("filename is not valid UTF-8")]
    BadName,

    #[error("filename of {0} bytes does not fit in a packet")]
    NameTooLong(usize),

    #[error("payload of {len} bytes exceeds the {max} byte data budget")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("HMAC verification failed")]
    HmacMismatch,
}

// ── Codec ────────────────────────────────────────────────────────────────────

/// Encodes and decodes cairn datagrams for one deployment (one packet size,
/// one shared HMAC key).
#[derive(Clone)]
pub struct Codec {
    max_packet_size: usize,
    key: Vec<u8>,
}

impl Codec {
    pub fn new(max_packet_size: usize, key: impl Into<Vec<u8>>) -> Self {
        Codec {
            max_packet_size,
            key: key.into(),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Longest filename that still fits in a FILE_META datagram.
    pub fn max_filename_len(&self) -> usize {
        self.max_packet_size - META_FIXED_SIZE
    }

    /// Largest DATA_TRANSFER payload this packet size can carry.
    pub fn max_payload_len(&self) -> usize {
        self.max_packet_size - DATA_HEADER_SIZE
    }

    pub fn encode_meta(&self, frame: &MetaFrame) -> Result<Bytes, WireError> {
        let name = frame.filename.as_bytes();
        if name.len() > self.max_filename_len() {
            return Err(WireError::NameTooLong(name.len()));
        }

        let mut buf = BytesMut::with_capacity(self.max_packet_size);
        buf.put_u8(OP_FILE_META);
        buf.put_slice(&frame.key.0);
        buf.put_u32(name.len() as u32);
        buf.put_slice(name);
        buf.put_u8(frame.has_next as u8);
        let seal_offset = buf.len();
        buf.resize(self.max_packet_size, 0);

        let seal = self.seal(&buf);
        buf[seal_offset..seal_offset + HMAC_SIZE].copy_from_slice(&seal);
        Ok(buf.freeze())
    }

    pub fn encode_data(&self, frame: &DataFrame) -> Result<Bytes, WireError> {
        if frame.payload.len() > self.max_payload_len() {
            return Err(WireError::PayloadTooLarge {
                len: frame.payload.len(),
                max: self.max_payload_len(),
            });
        }

        let mut buf = BytesMut::with_capacity(self.max_packet_size);
        buf.put_u8(OP_DATA_TRANSFER);
        buf.put_u16(frame.seqnum);
        buf.put_slice(&frame.key.0);
        buf.put_u8(frame.has_next as u8);
        buf.put_u16(frame.payload.len() as u16);
        buf.put_slice(&frame.payload);
        buf.resize(self.max_packet_size, 0);
        Ok(buf.freeze())
    }

    pub fn encode_ack(&self, frame: &AckFrame) -> Bytes {
        let wire = AckWire {
            opcode: OP_ACK,
            seqnum: U16::new(frame.seqnum),
            key: frame.key.0,
            timestamp: U64::new(frame.timestamp_ms),
        };

        let mut buf = BytesMut::with_capacity(self.max_packet_size);
        buf.put_slice(wire.as_bytes());
        buf.resize(self.max_packet_size, 0);

        let seal = self.seal(&buf);
        buf[ACK_SEAL_OFFSET..ACK_SEAL_OFFSET + HMAC_SIZE].copy_from_slice(&seal);
        buf.freeze()
    }

    /// Decode one datagram. Seal verification happens before any
    /// variable-length field is interpreted.
    pub fn decode(&self, datagram: &[u8]) -> Result<Packet, WireError> {
        if datagram.len() != self.max_packet_size {
            return Err(WireError::BadLength {
                got: datagram.len(),
                want: self.max_packet_size,
            });
        }

        match datagram[0] {
            OP_FILE_META => self.decode_meta(datagram),
            OP_DATA_TRANSFER => self.decode_data(datagram),
            OP_ACK => self.decode_ack(datagram),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }

    fn decode_meta(&self, datagram: &[u8]) -> Result<Packet, WireError> {
        let mut cur = &datagram[1..];
        let mut key = [0u8; HASH_SIZE];
        cur.copy_to_slice(&mut key);
        let name_len = cur.get_u32() as usize;
        if name_len > self.max_filename_len() {
            return Err(WireError::LengthOverflow {
                len: name_len,
                remaining: self.max_filename_len(),
            });
        }

        let seal_offset = 1 + HASH_SIZE + NAME_SIZE_SIZE + name_len + 1;
        self.verify_seal(datagram, seal_offset)?;

        let name = &cur[..name_len];
        let has_next = cur[name_len] != 0;
        let filename = std::str::from_utf8(name)
            .map_err(|_| WireError::BadName)?
            .to_owned();

        Ok(Packet::Meta(MetaFrame {
            key: FileKey(key),
            filename,
            has_next,
        }))
    }

    fn decode_data(&self, datagram: &[u8]) -> Result<Packet, WireError> {
        let mut cur = &datagram[1..];
        let seqnum = cur.get_u16();
        let mut key = [0u8; HASH_SIZE];
        cur.copy_to_slice(&mut key);
        let has_next = cur.get_u8() != 0;
        let data_len = cur.get_u16() as usize;
        if data_len > self.max_payload_len() {
            return Err(WireError::LengthOverflow {
                len: data_len,
                remaining: self.max_payload_len(),
            });
        }

        Ok(Packet::Data(DataFrame {
            key: FileKey(key),
            seqnum,
            has_next,
            payload: Bytes::copy_from_slice(&cur[..data_len]),
        }))
    }

    fn decode_ack(&self, datagram: &[u8]) -> Result<Packet, WireError> {
        self.verify_seal(datagram, ACK_SEAL_OFFSET)?;

        // Length was checked in decode(); the fixed prefix is always there.
        let wire = AckWire::read_from_prefix(datagram).ok_or(WireError::BadLength {
            got: datagram.len(),
            want: ACK_SEAL_OFFSET,
        })?;

        Ok(Packet::Ack(AckFrame {
            key: FileKey(wire.key),
            seqnum: wire.seqnum.get(),
            timestamp_ms: wire.timestamp.get(),
        }))
    }

    /// HMAC-SHA1 over the full buffer. The caller guarantees the seal
    /// region and all padding are zero.
    fn seal(&self, buf: &[u8]) -> [u8; HMAC_SIZE] {
        let mut mac = HmacSha1::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(buf);
        mac.finalize().into_bytes().into()
    }

    /// Recompute the seal over the zero-normalized buffer and compare it
    /// against the received one in constant time.
    fn verify_seal(&self, datagram: &[u8], seal_offset: usize) -> Result<(), WireError> {
        let mut normalized = datagram.to_vec();
        normalized[seal_offset..seal_offset + HMAC_SIZE].fill(0);

        let mut mac = HmacSha1::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(&normalized);
        mac.verify_slice(&datagram[seal_offset..seal_offset + HMAC_SIZE])
            .map_err(|_| WireError::HmacMismatch)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const PACKET_SIZE: usize = 512;

    fn codec() -> Codec {
        Codec::new(PACKET_SIZE, b"test-shared-key".to_vec())
    }

    #[test]
    fn file_key_is_deterministic() {
        let a = FileKey::compute("notes.txt", 1_700_000_000_000);
        let b = FileKey::compute("notes.txt", 1_700_000_000_000);
        let c = FileKey::compute("notes.txt", 1_700_000_000_001);
        let d = FileKey::compute("other.txt", 1_700_000_000_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn file_key_renders_lowercase_hex() {
        let key = FileKey([0xAB; HASH_SIZE]);
        assert_eq!(key.to_string(), "ab".repeat(HASH_SIZE));
    }

    #[test]
    fn sentinel_constants() {
        assert_eq!(
            hex::encode(EMPTY_DIR_KEY.0),
            "abcdef0123456789abcdef0123456789"
        );
        assert_eq!(sentinel_seq(0), u16::MAX);
        assert_eq!(sentinel_seq(7), 6);
    }

    #[test]
    fn meta_round_trip() {
        let c = codec();
        let frame = MetaFrame {
            key: FileKey::compute("hello.bin", 42),
            filename: "hello.bin".to_owned(),
            has_next: true,
        };

        let bytes = c.encode_meta(&frame).unwrap();
        assert_eq!(bytes.len(), PACKET_SIZE);
        assert_eq!(c.decode(&bytes).unwrap(), Packet::Meta(frame));
    }

    #[test]
    fn meta_terminator_round_trip() {
        let c = codec();
        let frame = MetaFrame {
            key: FileKey::compute("z", 1),
            filename: "z".to_owned(),
            has_next: false,
        };
        let bytes = c.encode_meta(&frame).unwrap();
        assert_eq!(c.decode(&bytes).unwrap(), Packet::Meta(frame));
    }

    #[test]
    fn data_round_trip() {
        let c = codec();
        let frame = DataFrame {
            key: FileKey::compute("big.dat", 9),
            seqnum: 3,
            has_next: true,
            payload: Bytes::from(vec![0x5a; 100]),
        };
        let bytes = c.encode_data(&frame).unwrap();
        assert_eq!(bytes.len(), PACKET_SIZE);
        assert_eq!(c.decode(&bytes).unwrap(), Packet::Data(frame));
    }

    #[test]
    fn data_empty_payload_round_trip() {
        let c = codec();
        let frame = DataFrame {
            key: FileKey::compute("empty", 0),
            seqnum: 0,
            has_next: false,
            payload: Bytes::new(),
        };
        let bytes = c.encode_data(&frame).unwrap();
        assert_eq!(c.decode(&bytes).unwrap(), Packet::Data(frame));
    }

    #[test]
    fn ack_round_trip() {
        let c = codec();
        let frame = AckFrame {
            key: FileKey::compute("a", 1),
            seqnum: 17,
            timestamp_ms: 1_700_000_123_456,
        };
        let bytes = c.encode_ack(&frame);
        assert_eq!(bytes.len(), PACKET_SIZE);
        assert_eq!(c.decode(&bytes).unwrap(), Packet::Ack(frame));
    }

    #[test]
    fn sentinel_ack_round_trip() {
        let c = codec();
        let frame = AckFrame::sentinel(0, 1234);
        assert!(frame.is_sentinel(0));
        let bytes = c.encode_ack(&frame);
        match c.decode(&bytes).unwrap() {
            Packet::Ack(ack) => assert!(ack.is_sentinel(0)),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn meta_seal_rejects_bit_flips() {
        let c = codec();
        let frame = MetaFrame {
            key: FileKey::compute("flip.txt", 5),
            filename: "flip.txt".to_owned(),
            has_next: false,
        };
        let sealed = c.encode_meta(&frame).unwrap();

        // Flip one bit in every authenticated byte position in turn.
        for pos in [0usize, 1, 17, 21, 21 + "flip.txt".len()] {
            let mut tampered = sealed.to_vec();
            tampered[pos] ^= 0x01;
            assert!(
                matches!(
                    c.decode(&tampered),
                    Err(WireError::HmacMismatch)
                        | Err(WireError::UnknownOpcode(_))
                        | Err(WireError::LengthOverflow { .. })
                ),
                "tampered byte {pos} was accepted"
            );
        }
    }

    #[test]
    fn ack_seal_rejects_padding_tamper() {
        let c = codec();
        let bytes = c.encode_ack(&AckFrame {
            key: FileKey::compute("p", 1),
            seqnum: 0,
            timestamp_ms: 0,
        });
        let mut tampered = bytes.to_vec();
        *tampered.last_mut().unwrap() ^= 0x80;
        assert_eq!(c.decode(&tampered), Err(WireError::HmacMismatch));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let frame = AckFrame {
            key: FileKey::compute("k", 2),
            seqnum: 1,
            timestamp_ms: 99,
        };
        let bytes = codec().encode_ack(&frame);
        let other = Codec::new(PACKET_SIZE, b"another-key".to_vec());
        assert_eq!(other.decode(&bytes), Err(WireError::HmacMismatch));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let c = codec();
        let mut datagram = vec![0u8; PACKET_SIZE];
        datagram[0] = 0x7f;
        assert_eq!(c.decode(&datagram), Err(WireError::UnknownOpcode(0x7f)));
    }

    #[test]
    fn wrong_length_is_rejected() {
        let c = codec();
        let datagram = vec![OP_ACK; PACKET_SIZE - 1];
        assert!(matches!(
            c.decode(&datagram),
            Err(WireError::BadLength { .. })
        ));
    }

    #[test]
    fn oversized_name_length_is_rejected() {
        let c = codec();
        let mut datagram = vec![0u8; PACKET_SIZE];
        datagram[0] = OP_FILE_META;
        datagram[17..21].copy_from_slice(&(PACKET_SIZE as u32).to_be_bytes());
        assert!(matches!(
            c.decode(&datagram),
            Err(WireError::LengthOverflow { .. })
        ));
    }

    #[test]
    fn oversized_data_length_is_rejected() {
        let c = codec();
        let mut datagram = vec![0u8; PACKET_SIZE];
        datagram[0] = OP_DATA_TRANSFER;
        datagram[20..22].copy_from_slice(&(PACKET_SIZE as u16).to_be_bytes());
        assert!(matches!(
            c.decode(&datagram),
            Err(WireError::LengthOverflow { .. })
        ));
    }

    #[test]
    fn name_too_long_fails_encoding() {
        let c = codec();
        let frame = MetaFrame {
            key: FileKey::compute("x", 1),
            filename: "x".repeat(PACKET_SIZE),
            has_next: true,
        };
        assert!(matches!(
            c.encode_meta(&frame),
            Err(WireError::NameTooLong(_))
        ));
    }

    #[test]
    fn payload_too_large_fails_encoding() {
        let c = codec();
        let frame = DataFrame {
            key: FileKey::compute("x", 1),
            seqnum: 0,
            has_next: true,
            payload: Bytes::from(vec![0u8; PACKET_SIZE]),
        };
        assert!(matches!(
            c.encode_data(&frame),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn padding_is_zero_after_logical_end() {
        let c = codec();
        let frame = DataFrame {
            key: FileKey::compute("pad", 3),
            seqnum: 1,
            has_next: true,
            payload: Bytes::from_static(b"abc"),
        };
        let bytes = c.encode_data(&frame).unwrap();
        assert!(bytes[DATA_HEADER_SIZE + 3..].iter().all(|&b| b == 0));
    }
}
