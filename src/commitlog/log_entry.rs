use crate::backend::EntryId;
use crate::replica::Term;
use crate::replication::OperationKind;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Byte representation of a single entry (big-endian):
///
/// ```text
/// | 0 .. 8          | 8 .. 12   | 12 .. 20             | 20 .. 24             | 24 ..           |
/// +-----------------+-----------+----------------------+----------------------+-------------...-+
/// | Index (8 bytes) | Term (4)  | EntryId (8 bytes)    | RequestCode (4)      | Change record   |
/// +-----------------+-----------+----------------------+----------------------+-------------...-+
/// ```
///
/// A batch entry uses the first contained entry's index and term, [RequestCode::BATCH], and a
/// payload made of sections:
///
/// ```text
/// +------------------+---------------------------+------------------+
/// | Length (8 bytes) | Header (24 bytes)         | Change record    |  ... repeated
/// +------------------+---------------------------+------------------+
/// ```
///
/// `Length` counts the 24 byte header plus the change record, not the length field itself.
#[derive(Clone, PartialEq, Eq)]
pub struct RaftLogEntry {
    pub index: u64,
    pub term: Term,
    pub entry_id: EntryId,
    pub request_code: RequestCode,
    pub payload: Bytes,
}

pub const LOG_ENTRY_HEADER_LEN: usize = 8 + 4 + 8 + 4;
const SECTION_LENGTH_LEN: usize = 8;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct RequestCode(u32);

impl RequestCode {
    /// First entry of a new leader's term. Carries no change record.
    pub const NO_OP: RequestCode = RequestCode(0);
    pub const ADD: RequestCode = RequestCode(0x68);
    pub const MODIFY: RequestCode = RequestCode(0x66);
    pub const DELETE: RequestCode = RequestCode(0x4a);
    pub const BATCH: RequestCode = RequestCode(0xFFFF_FFFF);

    pub fn new(code: u32) -> Self {
        RequestCode(code)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn for_operation(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Add => Self::ADD,
            OperationKind::Modify => Self::MODIFY,
            OperationKind::Delete => Self::DELETE,
        }
    }

    pub fn operation(&self) -> Option<OperationKind> {
        match *self {
            Self::ADD => Some(OperationKind::Add),
            Self::MODIFY => Some(OperationKind::Modify),
            Self::DELETE => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Debug for RequestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NO_OP => write!(f, "NoOp"),
            Self::BATCH => write!(f, "Batch"),
            other => match other.operation() {
                Some(kind) => write!(f, "{:?}", kind),
                None => write!(f, "{:#x}", other.0),
            },
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    #[error("buffer of {len} bytes is shorter than the 24 byte entry header")]
    ShortHeader { len: usize },
    #[error("batch section at offset {offset} declares {declared} bytes but only {remaining} remain")]
    SectionOverrun {
        offset: usize,
        declared: u64,
        remaining: usize,
    },
    #[error("entry with request code {0:?} is not a batch")]
    NotABatch(RequestCode),
    #[error("batch holds no entries")]
    EmptyBatch,
}

impl RaftLogEntry {
    pub fn new(index: u64, term: Term, request_code: RequestCode, payload: Bytes) -> Self {
        RaftLogEntry {
            index,
            term,
            entry_id: EntryId::for_log_index(index),
            request_code,
            payload,
        }
    }

    pub fn is_batch(&self) -> bool {
        self.request_code == RequestCode::BATCH
    }

    pub fn packed_len(&self) -> usize {
        LOG_ENTRY_HEADER_LEN + self.payload.len()
    }

    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.packed_len());
        self.put_into(&mut buf);
        buf.freeze()
    }

    /// Decode a packed entry. The payload is copied out of `bytes`.
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < LOG_ENTRY_HEADER_LEN {
            return Err(CodecError::ShortHeader { len: bytes.len() });
        }

        let mut buf = bytes;
        let index = buf.get_u64();
        let term = Term::new(buf.get_u32());
        let entry_id = EntryId::new(buf.get_u64());
        let request_code = RequestCode::new(buf.get_u32());

        Ok(RaftLogEntry {
            index,
            term,
            entry_id,
            request_code,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Pack several entries into a single batch entry.
    pub fn pack_batch(entries: &[RaftLogEntry]) -> Result<RaftLogEntry, CodecError> {
        let first = entries.first().ok_or(CodecError::EmptyBatch)?;

        let payload_len = entries.iter().map(|e| SECTION_LENGTH_LEN + e.packed_len()).sum();
        let mut payload = BytesMut::with_capacity(payload_len);
        for entry in entries {
            payload.put_u64(entry.packed_len() as u64);
            entry.put_into(&mut payload);
        }

        Ok(RaftLogEntry::new(
            first.index,
            first.term,
            RequestCode::BATCH,
            payload.freeze(),
        ))
    }

    pub fn unpack_batch(&self) -> Result<Vec<RaftLogEntry>, CodecError> {
        if !self.is_batch() {
            return Err(CodecError::NotABatch(self.request_code));
        }
        if self.payload.is_empty() {
            return Err(CodecError::EmptyBatch);
        }

        let bytes = self.payload.as_ref();
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let remaining = bytes.len() - offset;
            if remaining < SECTION_LENGTH_LEN {
                return Err(CodecError::SectionOverrun {
                    offset,
                    declared: SECTION_LENGTH_LEN as u64,
                    remaining,
                });
            }

            let mut length_field = &bytes[offset..offset + SECTION_LENGTH_LEN];
            let declared = length_field.get_u64();
            let section_start = offset + SECTION_LENGTH_LEN;
            let available = bytes.len() - section_start;
            if declared > available as u64 {
                return Err(CodecError::SectionOverrun {
                    offset,
                    declared,
                    remaining: available,
                });
            }

            let section_end = section_start + declared as usize;
            entries.push(Self::unpack(&bytes[section_start..section_end])?);
            offset = section_end;
        }

        Ok(entries)
    }

    /// Flatten a received entry: a batch yields its sections, anything else yields itself.
    pub fn into_entries(self) -> Result<Vec<RaftLogEntry>, CodecError> {
        if self.is_batch() {
            self.unpack_batch()
        } else {
            Ok(vec![self])
        }
    }

    fn put_into(&self, buf: &mut BytesMut) {
        buf.put_u64(self.index);
        buf.put_u32(self.term.as_u32());
        buf.put_u64(self.entry_id.as_u64());
        buf.put_u32(self.request_code.as_u32());
        buf.put_slice(&self.payload);
    }
}

impl fmt::Debug for RaftLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftLogEntry")
            .field("index", &self.index)
            .field("term", &self.term)
            .field("entry_id", &self.entry_id)
            .field("request_code", &self.request_code)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u32, code: RequestCode, payload_len: usize) -> RaftLogEntry {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
        RaftLogEntry::new(index, Term::new(term), code, Bytes::from(payload))
    }

    #[test]
    fn header_layout_is_big_endian() {
        let e = RaftLogEntry {
            index: 0x0102030405060708,
            term: Term::new(0x0A0B0C0D),
            entry_id: EntryId::new(0x1112131415161718),
            request_code: RequestCode::MODIFY,
            payload: Bytes::from_static(b"xy"),
        };

        let packed = e.pack();
        assert_eq!(
            packed.as_ref(),
            &[
                1, 2, 3, 4, 5, 6, 7, 8, 0x0A, 0x0B, 0x0C, 0x0D, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0, 0,
                0, 0x66, b'x', b'y'
            ][..]
        );
        assert_eq!(RaftLogEntry::unpack(&packed), Ok(e));
    }

    #[test]
    fn entry_id_is_derived_from_index() {
        let e = entry(42, 1, RequestCode::ADD, 0);
        assert_eq!(e.entry_id, EntryId::for_log_index(42));
        assert!(e.entry_id.is_log_entry());
    }

    #[test]
    fn unpack_rejects_short_buffer() {
        let packed = entry(1, 1, RequestCode::ADD, 0).pack();
        assert_eq!(packed.len(), LOG_ENTRY_HEADER_LEN);
        assert_eq!(
            RaftLogEntry::unpack(&packed[..LOG_ENTRY_HEADER_LEN - 1]),
            Err(CodecError::ShortHeader { len: 23 })
        );
        assert_eq!(RaftLogEntry::unpack(&[]), Err(CodecError::ShortHeader { len: 0 }));
    }

    #[test]
    fn batch_of_three_records() {
        let records = vec![
            entry(5, 2, RequestCode::ADD, 10),
            entry(6, 2, RequestCode::MODIFY, 0),
            entry(7, 2, RequestCode::DELETE, 25),
        ];

        let batch = RaftLogEntry::pack_batch(&records).unwrap();
        assert_eq!(batch.index, 5);
        assert_eq!(batch.term, Term::new(2));
        assert!(batch.is_batch());

        // Batches travel packed like any other entry.
        let received = RaftLogEntry::unpack(&batch.pack()).unwrap();
        let unpacked = received.unpack_batch().unwrap();
        assert_eq!(unpacked.iter().map(|e| e.index).collect::<Vec<_>>(), vec![5, 6, 7]);
        assert_eq!(
            unpacked.iter().map(|e| e.payload.len()).collect::<Vec<_>>(),
            vec![10, 0, 25]
        );
        assert_eq!(unpacked, records);
    }

    #[test]
    fn batch_section_overrun_is_an_error() {
        let records = vec![entry(5, 2, RequestCode::ADD, 10), entry(6, 2, RequestCode::ADD, 10)];
        let batch = RaftLogEntry::pack_batch(&records).unwrap();

        // Chop the last section short.
        let mut truncated = batch.clone();
        truncated.payload = batch.payload.slice(..batch.payload.len() - 3);
        assert!(matches!(
            truncated.unpack_batch(),
            Err(CodecError::SectionOverrun { declared: 34, remaining: 31, .. })
        ));

        // Dangling partial length prefix.
        let mut dangling = BytesMut::from(batch.payload.as_ref());
        dangling.put_slice(&[0, 0, 0]);
        let mut bad = batch.clone();
        bad.payload = dangling.freeze();
        assert!(matches!(bad.unpack_batch(), Err(CodecError::SectionOverrun { .. })));

        // Section shorter than an entry header.
        let mut tiny = BytesMut::new();
        tiny.put_u64(4);
        tiny.put_slice(&[1, 2, 3, 4]);
        bad.payload = tiny.freeze();
        assert_eq!(bad.unpack_batch(), Err(CodecError::ShortHeader { len: 4 }));
    }

    #[test]
    fn batch_guards() {
        assert_eq!(RaftLogEntry::pack_batch(&[]), Err(CodecError::EmptyBatch));
        let empty = RaftLogEntry::new(4, Term::new(1), RequestCode::BATCH, Bytes::new());
        assert_eq!(empty.unpack_batch(), Err(CodecError::EmptyBatch));
        assert_eq!(empty.into_entries(), Err(CodecError::EmptyBatch));
        let single = entry(1, 1, RequestCode::ADD, 3);
        assert_eq!(single.unpack_batch(), Err(CodecError::NotABatch(RequestCode::ADD)));
        assert_eq!(single.clone().into_entries(), Ok(vec![single]));
    }
}
