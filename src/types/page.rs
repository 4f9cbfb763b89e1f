//! On-disk page header layout.
//!
//! Every page in a paged file starts with a fixed 32-byte header followed by
//! the payload. The checksum is CRC32C over the whole payload region so a
//! single flipped byte anywhere after the header is detected on read.

use std::convert::TryInto;
use std::ops::Range;

use crate::error::{CorruptionKind, Result, VettoreError};
use crate::types::PageId;

/// "VDBV" in little-endian byte order.
pub const PAGE_MAGIC: u32 = 0x5644_5642;

/// On-disk format revision readers of this crate understand.
pub const PAGE_FORMAT_VERSION: u16 = 1;

/// Size of the fixed page header in bytes.
pub const PAGE_HDR_LEN: usize = 32;

const HDR_MAGIC: Range<usize> = 0..4;
const HDR_VERSION: Range<usize> = 4..6;
const HDR_KIND: usize = 6;
const HDR_FLAGS: usize = 7;
const HDR_CRC32: Range<usize> = 8..12;
const HDR_NEXT_PAGE: Range<usize> = 12..20;
const HDR_PAYLOAD_LEN: Range<usize> = 20..24;
const HDR_RESERVED: Range<usize> = 24..32;

/// Marks the first page of a record chain.
pub const PAGE_FLAG_CHAIN_HEAD: u8 = 0b0000_0001;

/// Role of a page within its file.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageKind {
    Meta = 0x00,
    VectorData = 0x01,
    HnswNode = 0x02,
    Free = 0x03,
}

impl PageKind {
    pub fn from_byte(byte: u8, page_id: PageId) -> Result<Self> {
        match byte {
            0x00 => Ok(Self::Meta),
            0x01 => Ok(Self::VectorData),
            0x02 => Ok(Self::HnswNode),
            0x03 => Ok(Self::Free),
            _ => Err(VettoreError::corruption(page_id, CorruptionKind::BadHeader)),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Decoded page header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageHeader {
    pub kind: PageKind,
    pub flags: u8,
    pub crc32: u32,
    pub next_page: PageId,
    pub payload_len: u32,
}

impl PageHeader {
    pub fn new(kind: PageKind) -> Self {
        Self {
            kind,
            flags: 0,
            crc32: 0,
            next_page: PageId(0),
            payload_len: 0,
        }
    }

    pub fn is_chain_head(&self) -> bool {
        self.flags & PAGE_FLAG_CHAIN_HEAD != 0
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < PAGE_HDR_LEN {
            return Err(VettoreError::corruption(
                PageId(0),
                CorruptionKind::BadHeader,
            ));
        }
        buf[HDR_MAGIC].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
        buf[HDR_VERSION].copy_from_slice(&PAGE_FORMAT_VERSION.to_le_bytes());
        buf[HDR_KIND] = self.kind.to_byte();
        buf[HDR_FLAGS] = self.flags;
        buf[HDR_CRC32].copy_from_slice(&self.crc32.to_le_bytes());
        buf[HDR_NEXT_PAGE].copy_from_slice(&self.next_page.0.to_le_bytes());
        buf[HDR_PAYLOAD_LEN].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[HDR_RESERVED].fill(0);
        Ok(())
    }

    /// Decodes and validates the header of `page_id` without touching the
    /// payload checksum; callers verify that separately via [`verify_page`].
    pub fn decode(buf: &[u8], page_id: PageId) -> Result<Self> {
        if buf.len() < PAGE_HDR_LEN {
            return Err(VettoreError::corruption(page_id, CorruptionKind::Truncated));
        }
        let magic = u32::from_le_bytes(buf[HDR_MAGIC].try_into().expect("4-byte slice"));
        if magic != PAGE_MAGIC {
            return Err(VettoreError::corruption(page_id, CorruptionKind::BadMagic));
        }
        let version = u16::from_le_bytes(buf[HDR_VERSION].try_into().expect("2-byte slice"));
        if version != PAGE_FORMAT_VERSION {
            return Err(VettoreError::UnsupportedVersion(version));
        }
        let kind = PageKind::from_byte(buf[HDR_KIND], page_id)?;
        let flags = buf[HDR_FLAGS];
        let crc32 = u32::from_le_bytes(buf[HDR_CRC32].try_into().expect("4-byte slice"));
        let next_page = PageId(u64::from_le_bytes(
            buf[HDR_NEXT_PAGE].try_into().expect("8-byte slice"),
        ));
        let payload_len =
            u32::from_le_bytes(buf[HDR_PAYLOAD_LEN].try_into().expect("4-byte slice"));
        Ok(Self {
            kind,
            flags,
            crc32,
            next_page,
            payload_len,
        })
    }
}

/// CRC32C over the payload region of a page buffer.
pub fn payload_crc(page: &[u8]) -> u32 {
    crc32c::crc32c(&page[PAGE_HDR_LEN..])
}

/// Stamps `header` into `page`, recomputing the payload checksum.
pub fn seal_page(page: &mut [u8], mut header: PageHeader) -> Result<()> {
    header.crc32 = payload_crc(page);
    header.encode(page)
}

/// Decodes the header of `page` and verifies payload integrity.
pub fn verify_page(page: &[u8], page_id: PageId) -> Result<PageHeader> {
    let header = PageHeader::decode(page, page_id)?;
    if header.payload_len as usize > page.len() - PAGE_HDR_LEN {
        return Err(VettoreError::corruption(page_id, CorruptionKind::BadHeader));
    }
    if payload_crc(page) != header.crc32 {
        return Err(VettoreError::corruption(
            page_id,
            CorruptionKind::BadChecksum,
        ));
    }
    Ok(header)
}
