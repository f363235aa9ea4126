use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::alloc::{node_slice, validate_node, SlabAlloc};
use super::array::ReadArray;
use super::mapping::Mapping;
use super::node::{Encoding, NodeHeader, RefOrTagged};
use super::tree::{subtree_len, ReadTree};
use crate::api::*;

/// How a store is opened: whether missing files are created, and the key for
/// the encrypted page layer (none = plaintext file).
#[derive(Default)]
pub struct StoreOptions {
    key: Option<EncryptionKey>,
    create: bool,
}

impl StoreOptions {
    pub fn new() -> StoreOptions { StoreOptions { key: None, create: true } }

    pub fn encryption_key(mut self, key: EncryptionKey) -> StoreOptions {
        self.key = Some(key);
        self
    }

    pub fn create(mut self, create: bool) -> StoreOptions {
        self.create = create;
        self
    }
}

/// The durable 24-byte file header: two top-ref slots, the selector naming
/// the live one, the format version, and the logical data end.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct DurableHeader {
    slots: [u64; 2],
    selector: u8,
    data_end: usize,
}

impl DurableHeader {
    fn parse(raw: &[u8; FILE_HEADER_SIZE]) -> Result<DurableHeader> {
        if raw[17] != FILE_FORMAT_VERSION {
            return Err(Error::CorruptedFile("unsupported file format version"));
        }
        if raw[16] > 1 {
            return Err(Error::CorruptedFile("top-ref selector out of range"));
        }
        let mut end48 = [0u8; 8];
        end48[..6].copy_from_slice(&raw[18..24]);
        Ok(DurableHeader {
            slots: [
                u64::from_le_bytes(raw[0..8].try_into().unwrap()),
                u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            ],
            selector: raw[16],
            data_end: u64::from_le_bytes(end48) as usize,
        })
    }

    fn to_bytes(self) -> [u8; FILE_HEADER_SIZE] {
        let mut raw = [0u8; FILE_HEADER_SIZE];
        raw[0..8].copy_from_slice(&self.slots[0].to_le_bytes());
        raw[8..16].copy_from_slice(&self.slots[1].to_le_bytes());
        raw[16] = self.selector;
        raw[17] = FILE_FORMAT_VERSION;
        raw[18..24].copy_from_slice(&(self.data_end as u64).to_le_bytes()[..6]);
        raw
    }

    fn top_ref(&self) -> Ref { self.slots[self.selector as usize] as Ref }
}

struct VersionTracker {
    /// monotonic per open store; bumped on every commit we make or observe
    current: u64,
    top_ref: Ref,
    durable: DurableHeader,
    /// pinned version -> reader count
    readers: BTreeMap<u64, usize>,
}

impl VersionTracker {
    fn min_pinned(&self) -> u64 {
        self.readers.keys().next().copied().unwrap_or(self.current)
    }
}

struct StoreShared {
    map: Arc<Mapping>,
    path: PathBuf,
    writer: Mutex<SlabAlloc>,
    versions: Mutex<VersionTracker>,
    commit_cv: Condvar,
}

/// One open backing file: many concurrent readers, at most one writer, a
/// version advanced by flipping the header's selector byte.
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Store> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(options.create)
            .open(&path)?;
        let fresh = file.metadata()?.len() == 0;
        let map = Arc::new(Mapping::open(file, options.key.as_ref())?);

        let durable = if fresh {
            let header = DurableHeader {
                slots: [NULL_REF as u64; 2],
                selector: 0,
                data_end: FILE_HEADER_SIZE,
            };
            map.write_header(0, &header.to_bytes())?;
            log::info!("formatted fresh store at {}", path.display());
            header
        } else {
            let header = DurableHeader::parse(&map.read_header_fresh()?)?;
            if header.data_end < FILE_HEADER_SIZE || header.data_end > map.data_len() {
                return Err(Error::CorruptedFile("data end outside the file"));
            }
            if header.top_ref() != NULL_REF {
                validate_node(&map, header.top_ref())?;
            }
            header
        };
        log::info!(
            "opened {} (encrypted: {}, top {:#x}, end {:#x})",
            path.display(),
            map.is_encrypted(),
            durable.top_ref(),
            durable.data_end
        );

        let shared = StoreShared {
            writer: Mutex::new(SlabAlloc::new(map.clone(), durable.data_end)),
            versions: Mutex::new(VersionTracker {
                current: 1,
                top_ref: durable.top_ref(),
                durable,
                readers: BTreeMap::new(),
            }),
            commit_cv: Condvar::new(),
            map,
            path,
        };
        Ok(Store { shared: Arc::new(shared) })
    }

    pub fn path(&self) -> &Path { &self.shared.path }

    /// Pin the current version for reading. Never blocks on the writer.
    pub fn begin_read(&self) -> Result<ReadTxn> {
        self.shared.observe_external_commits()?;
        let mut vers = self.shared.versions.lock();
        let version = vers.current;
        let top_ref = vers.top_ref;
        *vers.readers.entry(version).or_insert(0) += 1;
        Ok(ReadTxn { shared: self.shared.clone(), version, top_ref })
    }

    /// Start the (single) mutating transaction, blocking until both the
    /// in-process writer mutex and the inter-process file lock are ours.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        let alloc = self.shared.writer.lock();
        self.writer_locked(alloc, true)
    }

    /// Non-blocking variant: fails with `WriterLockUnavailable` when another
    /// transaction (in this process or another) is in progress.
    pub fn try_begin_write(&self) -> Result<WriteTxn<'_>> {
        let alloc =
            self.shared.writer.try_lock().ok_or(Error::WriterLockUnavailable)?;
        self.writer_locked(alloc, false)
    }

    fn writer_locked<'a>(
        &'a self,
        mut alloc: MutexGuard<'a, SlabAlloc>,
        blocking: bool,
    ) -> Result<WriteTxn<'a>> {
        flock_exclusive(self.shared.map.file(), blocking)?;
        if let Err(e) = self.shared.observe_external_commits() {
            flock_unlock(self.shared.map.file());
            return Err(e);
        }
        let (base_version, top_ref, min_pinned, durable_end) = {
            let vers = self.shared.versions.lock();
            (vers.current, vers.top_ref, vers.min_pinned(), vers.durable.data_end)
        };
        // catch the allocator up with the durable end and with any free
        // space whose readers have all moved on
        alloc.adopt_end(durable_end);
        alloc.reclaim(min_pinned);
        log::debug!("write transaction open on version {}", base_version);
        Ok(WriteTxn {
            shared: &*self.shared,
            alloc,
            top_ref,
            base_version,
            finished: false,
        })
    }

    /// Block until a version newer than `last_seen` has committed in this
    /// process, returning the new version number.
    pub fn wait_for_commit(&self, last_seen: u64) -> u64 {
        let mut vers = self.shared.versions.lock();
        while vers.current <= last_seen {
            self.shared.commit_cv.wait(&mut vers);
        }
        vers.current
    }

    /// Current version number (advances on every commit observed).
    pub fn current_version(&self) -> u64 { self.shared.versions.lock().current }
}

impl StoreShared {
    /// Compare the on-disk header with the one we last saw; if another
    /// process committed, adopt its state and drop stale cached plaintext.
    fn observe_external_commits(&self) -> Result<()> {
        self.map.sync_size()?;
        let on_disk = DurableHeader::parse(&self.map.read_header_fresh()?)?;
        let mut vers = self.versions.lock();
        if on_disk != vers.durable {
            log::debug!("adopting external commit (top {:#x})", on_disk.top_ref());
            self.map.invalidate_clean();
            vers.durable = on_disk;
            vers.top_ref = on_disk.top_ref();
            vers.current += 1;
            self.commit_cv.notify_all();
        }
        Ok(())
    }

    fn release_read_pin(&self, version: u64) {
        let mut vers = self.versions.lock();
        if let Some(count) = vers.readers.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                vers.readers.remove(&version);
            }
        }
    }
}

/// A pinned, immutable snapshot: everything reachable from `top_ref` reads
/// exactly as it was when the transaction began, regardless of later commits.
pub struct ReadTxn {
    shared: Arc<StoreShared>,
    version: u64,
    top_ref: Ref,
}

impl ReadTxn {
    pub fn version(&self) -> u64 { self.version }

    pub fn top_ref(&self) -> Ref { self.top_ref }

    pub fn array(&self, r: Ref) -> Result<ReadArray<'_>> {
        ReadArray::from_ref(&self.shared.map, r)
    }

    pub fn tree(&self, root: Ref) -> ReadTree<'_> {
        ReadTree::new(&self.shared.map, root)
    }

    /// Payload of a byte-blob node.
    pub fn blob(&self, r: Ref) -> Result<&[u8]> {
        blob_bytes(&self.shared.map, r)
    }

    /// Raw ref translation: the node's bytes (header included) after the
    /// plausibility checks.
    pub fn node_bytes(&self, r: Ref) -> Result<&[u8]> {
        node_slice(&self.shared.map, r)
    }

    /// Walk everything reachable from the pinned top-ref and check the node
    /// invariants: parseable 8-aligned headers, sizes inside the file, tree
    /// totals consistent with their children.
    pub fn verify(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        if self.top_ref != NULL_REF {
            verify_node(&self.shared.map, self.top_ref, &mut seen)?;
        }
        log::debug!("verify: {} reachable nodes ok", seen.len());
        Ok(())
    }
}

impl Drop for ReadTxn {
    fn drop(&mut self) {
        self.shared.release_read_pin(self.version);
    }
}

fn verify_node(
    map: &Mapping,
    r: Ref,
    seen: &mut std::collections::BTreeSet<Ref>,
) -> Result<()> {
    if !seen.insert(r) {
        return Ok(());
    }
    validate_node(map, r)?;
    let node = node_slice(map, r)?;
    if !NodeHeader::has_refs(node) {
        return Ok(());
    }
    let arr = ReadArray::from_ref(map, r)?;
    let mut children_total = 0usize;
    for i in 0..arr.len() {
        if let RefOrTagged::Ref(child) = arr.get_slot(i)? {
            if child != NULL_REF {
                verify_node(map, child, seen)?;
                if NodeHeader::is_inner_bptree(node) && i > 0 && i < arr.len() - 1 {
                    children_total += subtree_len(map, child)?;
                }
            }
        }
    }
    if NodeHeader::is_inner_bptree(node) {
        let stored = arr.get_slot(arr.len() - 1)?.as_tagged()? as usize;
        if stored != children_total {
            log::error!("inner node {:#x}: total {} != children {}", r, stored, children_total);
            return Err(Error::CorruptedFile("tree total disagrees with children"));
        }
    }
    Ok(())
}

fn blob_bytes(map: &Mapping, r: Ref) -> Result<&[u8]> {
    let node = node_slice(map, r)?;
    if NodeHeader::encoding(node)? != Encoding::WTypIgn {
        return Err(Error::InvalidArgument("node is not a byte blob"));
    }
    let len = NodeHeader::size(node);
    Ok(&node[NODE_HEADER_SIZE..NODE_HEADER_SIZE + len])
}

/// The single mutating transaction. All node creation goes through the
/// embedded allocator; `commit` makes the new top-ref durable, `abort` (or
/// drop) releases everything the transaction touched.
pub struct WriteTxn<'a> {
    shared: &'a StoreShared,
    alloc: MutexGuard<'a, SlabAlloc>,
    top_ref: Ref,
    base_version: u64,
    finished: bool,
}

impl<'a> WriteTxn<'a> {
    /// The allocator, for building arrays and trees inside this transaction.
    pub fn allocator(&mut self) -> &mut SlabAlloc { &mut self.alloc }

    pub fn top_ref(&self) -> Ref { self.top_ref }

    /// Name the root of the version this transaction will publish.
    pub fn set_top_ref(&mut self, r: Ref) { self.top_ref = r; }

    pub fn array(&self, r: Ref) -> Result<ReadArray<'_>> {
        ReadArray::from_ref(self.alloc.mapping(), r)
    }

    pub fn blob(&self, r: Ref) -> Result<&[u8]> {
        blob_bytes(self.alloc.mapping(), r)
    }

    /// Raw ref translation within the transaction's view of the file.
    pub fn node_bytes(&self, r: Ref) -> Result<&[u8]> {
        node_slice(self.alloc.mapping(), r)
    }

    /// Allocate a byte-blob node holding `bytes`.
    pub fn create_blob(&mut self, bytes: &[u8]) -> Result<Ref> {
        if bytes.len() > MAX_ARRAY_SIZE {
            return Err(Error::InvalidArgument("blob too large"));
        }
        let size = NodeHeader::calc_byte_size(Encoding::WTypIgn, bytes.len(), 8);
        let r = self.alloc.alloc(size)?;
        let map = self.alloc.mapping();
        let node = map.slice_mut(r, size)?;
        let cap = NodeHeader::capacity(&node[..NODE_HEADER_SIZE]);
        NodeHeader::init(node, Encoding::WTypIgn, super::node::NodeFlags::empty(), 0, bytes.len());
        NodeHeader::set_capacity(node, cap);
        node[NODE_HEADER_SIZE..NODE_HEADER_SIZE + bytes.len()].copy_from_slice(bytes);
        Ok(r)
    }

    /// Replace a blob's contents copy-on-write: the old node is freed and the
    /// new ref returned (which may equal the old one only if the blob was
    /// created inside this transaction and the new contents fit).
    pub fn update_blob(&mut self, r: Ref, bytes: &[u8]) -> Result<Ref> {
        let size = NodeHeader::calc_byte_size(Encoding::WTypIgn, bytes.len(), 8);
        if self.alloc.is_txn_local(r) {
            let map = self.alloc.mapping();
            let cap = NodeHeader::capacity(map.slice(r, NODE_HEADER_SIZE)?);
            if size <= cap {
                let node = map.slice_mut(r, cap)?;
                NodeHeader::set_size(node, bytes.len());
                node[NODE_HEADER_SIZE..NODE_HEADER_SIZE + bytes.len()].copy_from_slice(bytes);
                return Ok(r);
            }
        }
        let new_ref = self.create_blob(bytes)?;
        self.alloc.free(r)?;
        Ok(new_ref)
    }

    /// Release a node this version no longer references.
    pub fn free_node(&mut self, r: Ref) -> Result<()> { self.alloc.free(r) }

    /// Publish: flush data, persist the new top-ref in the alternate slot,
    /// then flip the selector. Three ordered fsyncs make the flip the single
    /// atomic point of the protocol.
    pub fn commit(mut self) -> Result<u64> {
        // a transaction that changed nothing publishes nothing: the file
        // stays bit-identical and the version does not advance
        let unchanged = {
            let vers = self.shared.versions.lock();
            self.top_ref == vers.top_ref && !self.alloc.has_changes()
        };
        if unchanged {
            self.finished = true;
            flock_unlock(self.shared.map.file());
            return Ok(self.base_version);
        }

        self.alloc.mapping().flush()?;
        self.alloc.mapping().file().sync_data()?;

        let durable = self.shared.versions.lock().durable;
        let alt = 1 - durable.selector;
        let mut staged = durable;
        staged.slots[alt as usize] = self.top_ref as u64;
        staged.data_end = self.alloc.data_end();
        self.shared.map.write_header(0, &staged.to_bytes())?;

        staged.selector = alt;
        self.shared.map.write_header(0, &staged.to_bytes())?;

        let new_version;
        {
            let mut vers = self.shared.versions.lock();
            vers.current += 1;
            new_version = vers.current;
            vers.top_ref = self.top_ref;
            vers.durable = staged;
            self.alloc.note_commit(new_version);
            self.shared.commit_cv.notify_all();
        }
        log::debug!("committed version {} (top {:#x})", new_version, self.top_ref);

        self.finished = true;
        flock_unlock(self.shared.map.file());
        Ok(new_version)
    }

    /// Drop every node allocated by this transaction and leave the previous
    /// version in place.
    pub fn abort(mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        self.alloc.note_abort();
        self.shared.map.discard_dirty();
        log::debug!("write transaction aborted (version {} stands)", self.base_version);
        self.finished = true;
        flock_unlock(self.shared.map.file());
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort_inner();
        }
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File, blocking: bool) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let mut op = libc::LOCK_EX;
    if !blocking {
        op |= libc::LOCK_NB;
    }
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if !blocking && err.kind() == std::io::ErrorKind::WouldBlock {
        Err(Error::WriterLockUnavailable)
    } else {
        Err(err.into())
    }
}

#[cfg(unix)]
fn flock_unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
}
