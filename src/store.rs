//! Per-collection durable vector storage.
//!
//! Records are encoded through the codec and laid into page chains; the head
//! page of each chain carries the record's slot as an 8-byte prefix so the
//! in-memory maps can be rebuilt by scanning the file at open. The scan is
//! deliberately lenient: a damaged page does not keep the collection from
//! opening, it poisons the affected slots so the first read against them
//! reports the corruption with the offending page id.

use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::codec;
use crate::error::{CorruptionKind, Result, VettoreError};
use crate::model::VectorRecord;
use crate::pager::Pager;
use crate::types::page::verify_page;
use crate::types::{PageHeader, PageId, PageKind, Slot};

const SLOT_PREFIX_LEN: usize = 8;

pub struct VectorStore {
    pager: Arc<Pager>,
    dimensions: usize,
    max_metadata_bytes: usize,
    by_id: FxHashMap<String, Slot>,
    by_slot: FxHashMap<Slot, PageId>,
    dead: FxHashMap<Slot, PageId>,
    poisoned: Vec<PageId>,
    next_slot: u64,
}

impl VectorStore {
    /// Wraps a freshly created pager with empty maps.
    pub fn new(pager: Pager, dimensions: usize, max_metadata_bytes: usize) -> Self {
        Self {
            pager: Arc::new(pager),
            dimensions,
            max_metadata_bytes,
            by_id: FxHashMap::default(),
            by_slot: FxHashMap::default(),
            dead: FxHashMap::default(),
            poisoned: Vec::new(),
            next_slot: 1,
        }
    }

    /// Opens an existing file and rebuilds the id and slot maps by scanning
    /// every record chain.
    pub fn open(pager: Pager, dimensions: usize, max_metadata_bytes: usize) -> Result<Self> {
        let mut store = Self::new(pager, dimensions, max_metadata_bytes);
        store.scan()?;
        Ok(store)
    }

    fn scan(&mut self) -> Result<()> {
        let total = self.pager.page_count();
        for page_no in 1..total {
            let page_id = PageId(page_no);
            let raw = self.pager.read_raw(page_id)?;
            let header = match PageHeader::decode(&raw, page_id) {
                Ok(header) => header,
                Err(err @ VettoreError::UnsupportedVersion(_)) => return Err(err),
                Err(_) => {
                    warn!(page = page_no, "unreadable page header, poisoning");
                    self.poisoned.push(page_id);
                    continue;
                }
            };
            if header.kind != PageKind::VectorData || !header.is_chain_head() {
                continue;
            }
            if verify_page(&raw, page_id).is_err() {
                self.poison_head(page_id, &raw, header);
                continue;
            }
            match self.decode_head(page_id) {
                Ok((slot, record)) => {
                    self.next_slot = self.next_slot.max(slot.0 + 1);
                    if record.tombstone {
                        self.dead.insert(slot, page_id);
                    } else {
                        self.by_id.insert(record.id.clone(), slot);
                        self.by_slot.insert(slot, page_id);
                    }
                }
                Err(err) => {
                    warn!(page = page_no, %err, "record chain damaged, poisoning");
                    self.poison_head(page_id, &raw, header);
                }
            }
        }
        if !self.poisoned.is_empty() {
            warn!(
                poisoned = self.poisoned.len(),
                "opened with damaged pages; affected reads will fail"
            );
        }
        debug!(
            live = self.by_id.len(),
            tombstones = self.dead.len(),
            "store scan complete"
        );
        Ok(())
    }

    /// Best-effort registration of a damaged head page so lookups against it
    /// report corruption instead of absence. The slot and id prefix are
    /// parsed without checksum protection.
    fn poison_head(&mut self, page_id: PageId, raw: &[u8], header: PageHeader) {
        self.poisoned.push(page_id);
        let payload_end = crate::types::PAGE_HDR_LEN
            + (header.payload_len as usize).min(raw.len() - crate::types::PAGE_HDR_LEN);
        let payload = &raw[crate::types::PAGE_HDR_LEN..payload_end];
        if payload.len() < SLOT_PREFIX_LEN + 4 {
            return;
        }
        let slot = Slot(u64::from_le_bytes(
            payload[..SLOT_PREFIX_LEN].try_into().expect("8 bytes"),
        ));
        let id_len =
            u32::from_le_bytes(payload[8..12].try_into().expect("4 bytes")) as usize;
        let id_end = 12 + id_len;
        if id_end > payload.len() {
            return;
        }
        if let Ok(id) = std::str::from_utf8(&payload[12..id_end]) {
            self.next_slot = self.next_slot.max(slot.0 + 1);
            self.by_id.insert(id.to_string(), slot);
            self.by_slot.insert(slot, page_id);
        }
    }

    fn decode_head(&self, head: PageId) -> Result<(Slot, VectorRecord)> {
        let chain = self.pager.read_chain(head)?;
        if chain.len() < SLOT_PREFIX_LEN {
            return Err(VettoreError::corruption(head, CorruptionKind::BadState));
        }
        let slot = Slot(u64::from_le_bytes(
            chain[..SLOT_PREFIX_LEN].try_into().expect("8 bytes"),
        ));
        let record = codec::decode_record(&chain[SLOT_PREFIX_LEN..])
            .map_err(|err| codec::at_page(err, head))?;
        Ok((slot, record))
    }

    fn encode_chain_payload(slot: Slot, record: &VectorRecord) -> Vec<u8> {
        let body = codec::encode_record(record);
        let mut payload = Vec::with_capacity(SLOT_PREFIX_LEN + body.len());
        payload.extend_from_slice(&slot.0.to_le_bytes());
        payload.extend_from_slice(&body);
        payload
    }

    fn check_dimensions(&self, record: &VectorRecord) -> Result<()> {
        if record.vector.len() != self.dimensions {
            return Err(VettoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: record.vector.len(),
            });
        }
        Ok(())
    }

    fn check_metadata_budget(&self, record: &VectorRecord) -> Result<()> {
        if codec::encode_metadata(&record.metadata).len() > self.max_metadata_bytes {
            return Err(VettoreError::CapacityExceeded("record metadata"));
        }
        Ok(())
    }

    /// Stores a new record; rejects a duplicate live id.
    pub fn insert(&mut self, record: &VectorRecord) -> Result<Slot> {
        self.check_dimensions(record)?;
        self.check_metadata_budget(record)?;
        if self.by_id.contains_key(&record.id) {
            return Err(VettoreError::AlreadyExists("record id"));
        }
        let slot = Slot(self.next_slot);
        let payload = Self::encode_chain_payload(slot, record);
        let head = self.pager.write_chain(PageKind::VectorData, &payload)?;
        self.next_slot += 1;
        self.by_id.insert(record.id.clone(), slot);
        self.by_slot.insert(slot, head);
        Ok(slot)
    }

    /// Inserts, tombstoning any existing record under the same id first.
    /// Returns the new slot and the replaced slot, if any.
    pub fn upsert(&mut self, record: &VectorRecord) -> Result<(Slot, Option<Slot>)> {
        self.check_dimensions(record)?;
        self.check_metadata_budget(record)?;
        let replaced = match self.by_id.get(&record.id).copied() {
            Some(old_slot) => {
                self.tombstone(old_slot)?;
                Some(old_slot)
            }
            None => None,
        };
        let slot = self.insert(record)?;
        Ok((slot, replaced))
    }

    /// Soft-deletes by id; pages are reclaimed only by compaction.
    pub fn delete(&mut self, id: &str) -> Result<Slot> {
        let slot = self
            .by_id
            .get(id)
            .copied()
            .ok_or(VettoreError::NotFound("record"))?;
        self.tombstone(slot)?;
        self.by_id.remove(id);
        Ok(slot)
    }

    fn tombstone(&mut self, slot: Slot) -> Result<()> {
        let head = self
            .by_slot
            .remove(&slot)
            .ok_or(VettoreError::NotFound("record slot"))?;
        let (stored_slot, mut record) = self.decode_head(head)?;
        if stored_slot != slot {
            return Err(VettoreError::corruption(head, CorruptionKind::BadState));
        }
        record.tombstone = true;
        let payload = Self::encode_chain_payload(slot, &record);
        self.pager.rewrite_chain(head, &payload)?;
        self.dead.insert(slot, head);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<VectorRecord> {
        match self.by_id.get(id) {
            Some(slot) => self.get_by_slot(*slot),
            None if self.poisoned.is_empty() => Err(VettoreError::NotFound("record")),
            // A damaged page may be hiding this id; absence is unprovable.
            None => Err(VettoreError::corruption(
                self.poisoned[0],
                CorruptionKind::BadChecksum,
            )),
        }
    }

    pub fn get_by_slot(&self, slot: Slot) -> Result<VectorRecord> {
        let head = self
            .by_slot
            .get(&slot)
            .copied()
            .ok_or(VettoreError::NotFound("record slot"))?;
        let (stored_slot, record) = self.decode_head(head)?;
        if stored_slot != slot || record.tombstone {
            return Err(VettoreError::corruption(head, CorruptionKind::BadState));
        }
        Ok(record)
    }

    /// Tombstoned slots still occupying pages, ascending.
    pub fn dead_slots(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self.dead.keys().copied().collect();
        slots.sort_unstable();
        slots
    }

    /// Reads a tombstoned record; graph indexes need the vector for
    /// navigation until compaction drops the slot.
    pub fn get_tombstoned(&self, slot: Slot) -> Result<VectorRecord> {
        let head = self
            .dead
            .get(&slot)
            .copied()
            .ok_or(VettoreError::NotFound("record slot"))?;
        let (stored_slot, record) = self.decode_head(head)?;
        if stored_slot != slot {
            return Err(VettoreError::corruption(head, CorruptionKind::BadState));
        }
        Ok(record)
    }

    /// Stable snapshot of live slots in ascending order.
    pub fn live_slots(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self.by_slot.keys().copied().collect();
        slots.sort_unstable();
        slots
    }

    /// Lazily decodes live records in slot order from a snapshot taken now.
    pub fn iter_live(&self) -> impl Iterator<Item = Result<(Slot, VectorRecord)>> + '_ {
        self.live_slots()
            .into_iter()
            .map(move |slot| self.get_by_slot(slot).map(|record| (slot, record)))
    }

    pub fn vector_count(&self) -> u64 {
        self.by_slot.len() as u64
    }

    pub fn tombstone_count(&self) -> u64 {
        self.dead.len() as u64
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// Shared handle used to sync outside the collection lock.
    pub fn pager_handle(&self) -> Arc<Pager> {
        Arc::clone(&self.pager)
    }

    /// Copies live records into `scratch`, swaps it over this store's file,
    /// and reopens through `reopen`. Tombstoned chains and the free list are
    /// left behind in the old file; the caller advances the epoch.
    pub fn compact(
        &mut self,
        scratch: Pager,
        reopen: impl FnOnce() -> Result<Pager>,
        token: &CancelToken,
    ) -> Result<()> {
        let target = self.pager.path().to_path_buf();
        let scratch_path = scratch.path().to_path_buf();
        let mut new_heads = FxHashMap::default();
        for slot in self.live_slots() {
            token.check()?;
            let record = self.get_by_slot(slot)?;
            let payload = Self::encode_chain_payload(slot, &record);
            let head = scratch.write_chain(PageKind::VectorData, &payload)?;
            new_heads.insert(slot, head);
        }
        scratch.sync()?;
        drop(scratch);
        self.pager.release_cache(false)?;
        std::fs::rename(&scratch_path, &target)?;
        self.pager = Arc::new(reopen()?);
        let reclaimed = self.dead.len();
        self.by_slot = new_heads;
        self.dead.clear();
        self.poisoned.clear();
        info!(live = self.by_slot.len(), reclaimed, "store compacted");
        Ok(())
    }

    /// Validates every allocated page in the backing file.
    pub fn verify(&self) -> Result<u64> {
        self.pager.verify()
    }

    pub fn sync(&self) -> Result<()> {
        self.pager.sync()
    }

    pub fn write_free_checkpoint(&self, path: &Path) -> Result<()> {
        self.pager.write_free_checkpoint(path)
    }
}
