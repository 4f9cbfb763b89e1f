//! Binary codec for record and index-node payloads.
//!
//! Everything on disk is length-prefixed little-endian. A vector record is
//!
//! ```text
//! u32 id_len | id | u16 dim | f32[dim] | u32 metadata_len | metadata
//! | u64 created_at | u8 flags (bit0 = tombstone)
//! ```
//!
//! where metadata is a sequence of `u16 key_len | key | u8 tag | value`
//! entries. An HNSW node is
//!
//! ```text
//! u64 slot | u8 level | for each level 0..=level: u32 count | u64[count]
//! ```
//!
//! Unknown metadata tags fail decode with `SchemaMismatch`; structural damage
//! surfaces as `Corruption` and the store layer stamps in the page id.

use std::convert::TryInto;

use crate::error::{CorruptionKind, Result, VettoreError};
use crate::model::{Metadata, MetadataValue, VectorRecord};
use crate::types::{PageId, Slot, NULL_PAGE};

const FLAG_TOMBSTONE: u8 = 0b0000_0001;

const TAG_STRING: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_BOOL: u8 = 3;

fn truncated() -> VettoreError {
    VettoreError::corruption(NULL_PAGE, CorruptionKind::BadState)
}

/// Re-stamps a codec corruption error with the page it was decoded from.
pub(crate) fn at_page(err: VettoreError, page_id: PageId) -> VettoreError {
    match err {
        VettoreError::Corruption { kind, .. } => VettoreError::corruption(page_id, kind),
        other => other,
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(truncated)?;
        if end > self.buf.len() {
            return Err(truncated());
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    pub(crate) fn str(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| truncated())
    }

    pub(crate) fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

pub fn encode_metadata(metadata: &Metadata) -> Vec<u8> {
    let mut buf = Vec::new();
    for (key, value) in metadata {
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        match value {
            MetadataValue::String(s) => {
                buf.push(TAG_STRING);
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            MetadataValue::Int(v) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            MetadataValue::Float(v) => {
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            MetadataValue::Bool(v) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*v));
            }
        }
    }
    buf
}

pub fn decode_metadata(buf: &[u8]) -> Result<Metadata> {
    let mut reader = Reader::new(buf);
    let mut metadata = Metadata::new();
    while !reader.done() {
        let key_len = reader.u16()? as usize;
        let key = reader.str(key_len)?;
        let tag = reader.u8()?;
        let value = match tag {
            TAG_STRING => {
                let len = reader.u32()? as usize;
                MetadataValue::String(reader.str(len)?)
            }
            TAG_INT => MetadataValue::Int(i64::from_le_bytes(
                reader.take(8)?.try_into().expect("8 bytes"),
            )),
            TAG_FLOAT => MetadataValue::Float(f64::from_le_bytes(
                reader.take(8)?.try_into().expect("8 bytes"),
            )),
            TAG_BOOL => MetadataValue::Bool(reader.u8()? != 0),
            unknown => {
                return Err(VettoreError::SchemaMismatch(format!(
                    "unknown metadata type tag 0x{unknown:02X} for key {key:?}"
                )))
            }
        };
        metadata.insert(key, value);
    }
    Ok(metadata)
}

pub fn encode_record(record: &VectorRecord) -> Vec<u8> {
    let metadata = encode_metadata(&record.metadata);
    let mut buf = Vec::with_capacity(
        4 + record.id.len() + 2 + record.vector.len() * 4 + 4 + metadata.len() + 9,
    );
    buf.extend_from_slice(&(record.id.len() as u32).to_le_bytes());
    buf.extend_from_slice(record.id.as_bytes());
    buf.extend_from_slice(&(record.vector.len() as u16).to_le_bytes());
    for value in &record.vector {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    buf.extend_from_slice(&metadata);
    buf.extend_from_slice(&record.created_at.to_le_bytes());
    buf.push(if record.tombstone { FLAG_TOMBSTONE } else { 0 });
    buf
}

pub fn decode_record(buf: &[u8]) -> Result<VectorRecord> {
    let mut reader = Reader::new(buf);
    let id_len = reader.u32()? as usize;
    let id = reader.str(id_len)?;
    let dim = reader.u16()? as usize;
    let mut vector = Vec::with_capacity(dim);
    for chunk in reader.take(dim * 4)?.chunks_exact(4) {
        vector.push(f32::from_le_bytes(chunk.try_into().expect("4 bytes")));
    }
    let metadata_len = reader.u32()? as usize;
    let metadata = decode_metadata(reader.take(metadata_len)?)?;
    let created_at = reader.u64()?;
    let flags = reader.u8()?;
    if !reader.done() {
        return Err(truncated());
    }
    Ok(VectorRecord {
        id,
        vector,
        metadata,
        created_at,
        tombstone: flags & FLAG_TOMBSTONE != 0,
    })
}

/// Decoded form of one persisted HNSW node: `neighbors[l]` holds the level-`l`
/// neighbor list, for `l` in `0..=level`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HnswNodeWire {
    pub slot: Slot,
    pub neighbors: Vec<Vec<Slot>>,
}

pub fn encode_hnsw_node(node: &HnswNodeWire) -> Vec<u8> {
    debug_assert!(!node.neighbors.is_empty());
    let mut buf = Vec::new();
    buf.extend_from_slice(&node.slot.0.to_le_bytes());
    buf.push((node.neighbors.len() - 1) as u8);
    for level in &node.neighbors {
        buf.extend_from_slice(&(level.len() as u32).to_le_bytes());
        for neighbor in level {
            buf.extend_from_slice(&neighbor.0.to_le_bytes());
        }
    }
    buf
}

pub fn decode_hnsw_node(buf: &[u8]) -> Result<HnswNodeWire> {
    let mut reader = Reader::new(buf);
    let slot = Slot(reader.u64()?);
    let level = reader.u8()? as usize;
    let mut neighbors = Vec::with_capacity(level + 1);
    for _ in 0..=level {
        let count = reader.u32()? as usize;
        let mut list = Vec::with_capacity(count);
        for chunk in reader.take(count * 8)?.chunks_exact(8) {
            list.push(Slot(u64::from_le_bytes(chunk.try_into().expect("8 bytes"))));
        }
        neighbors.push(list);
    }
    if !reader.done() {
        return Err(truncated());
    }
    Ok(HnswNodeWire { slot, neighbors })
}
