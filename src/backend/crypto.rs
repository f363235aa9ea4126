use std::fs::File;
use std::os::unix::fs::FileExt;

use aes::Aes256;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha224;
use subtle::ConstantTimeEq;

use crate::api::*;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha224 = Hmac<Sha224>;

pub(crate) const HMAC_LEN: usize = 28;
/// One `IvTable` per data page: current and previous (IV, tag) pairs.
pub(crate) const METADATA_SIZE: usize = 64;
/// How many data pages share one interleaved metadata page.
pub(crate) const PAGES_PER_METADATA_PAGE: usize = PAGE_SIZE / METADATA_SIZE;

// We only know which 4k page is dirty, never which bytes, so writes are whole
// pages, and the IV for a page cannot live next to the page itself without
// doubling the file. The IVs go into separate metadata pages instead, which
// means a crash can land between the IV write and the data write. Keeping the
// previous (IV, tag) pair beside the current one resolves that: whichever tag
// authenticates the on-disk ciphertext names the IV to decrypt with.

/// Per-page encryption metadata. Two slots: slot 1 is the pair for the most
/// recent write, slot 2 the pair before it.
#[derive(Clone, Copy, Default)]
pub(crate) struct IvTable {
    pub iv1: u32,
    pub hmac1: [u8; HMAC_LEN],
    pub iv2: u32,
    pub hmac2: [u8; HMAC_LEN],
}

impl IvTable {
    pub fn to_bytes(&self) -> [u8; METADATA_SIZE] {
        let mut out = [0u8; METADATA_SIZE];
        out[0..4].copy_from_slice(&self.iv1.to_le_bytes());
        out[4..32].copy_from_slice(&self.hmac1);
        out[32..36].copy_from_slice(&self.iv2.to_le_bytes());
        out[36..64].copy_from_slice(&self.hmac2);
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut t = IvTable::default();
        t.iv1 = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        t.hmac1.copy_from_slice(&raw[4..32]);
        t.iv2 = u32::from_le_bytes(raw[32..36].try_into().unwrap());
        t.hmac2.copy_from_slice(&raw[36..64]);
        t
    }
}

/// Map a data offset to its location in the physical file, accounting for the
/// metadata page interleaved before every `PAGES_PER_METADATA_PAGE` data pages.
pub(crate) fn real_offset(pos: usize) -> usize {
    let page_index = pos / PAGE_SIZE;
    let metadata_page_count = page_index / PAGES_PER_METADATA_PAGE + 1;
    pos + metadata_page_count * PAGE_SIZE
}

/// Inverse of `real_offset` for positions inside data pages.
pub(crate) fn fake_offset(pos: usize) -> usize {
    let page_index = pos / PAGE_SIZE;
    let metadata_page_count =
        (page_index + PAGES_PER_METADATA_PAGE) / (PAGES_PER_METADATA_PAGE + 1);
    pos - metadata_page_count * PAGE_SIZE
}

/// Physical location of the `IvTable` slot for a data offset.
pub(crate) fn iv_table_pos(pos: usize) -> usize {
    let page_index = pos / PAGE_SIZE;
    let metadata_block = page_index / PAGES_PER_METADATA_PAGE;
    let metadata_index = page_index & (PAGES_PER_METADATA_PAGE - 1);
    metadata_block * (PAGES_PER_METADATA_PAGE + 1) * PAGE_SIZE + metadata_index * METADATA_SIZE
}

/// Page-granular AES-256-CBC with HMAC-SHA-224 integrity. Holds the key
/// material and a cache of the per-page IV tables.
pub(crate) struct AesCryptor {
    key: EncryptionKey,
    iv_buffer: Vec<IvTable>,
}

impl AesCryptor {
    pub fn new(key: &EncryptionKey) -> Self {
        AesCryptor { key: key.clone(), iv_buffer: Vec::new() }
    }

    /// Drop cached IV tables so the next access re-reads them from disk.
    /// Called when another process may have committed behind our back.
    pub fn invalidate_iv_cache(&mut self) { self.iv_buffer.clear(); }

    fn hmac(&self, ciphertext: &[u8]) -> [u8; HMAC_LEN] {
        let mut mac = HmacSha224::new_from_slice(self.key.hmac_key())
            .expect("hmac accepts any key length");
        mac.update(ciphertext);
        let mut out = [0u8; HMAC_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    fn check_hmac(&self, ciphertext: &[u8], tag: &[u8; HMAC_LEN]) -> bool {
        self.hmac(ciphertext)[..].ct_eq(&tag[..]).into()
    }

    /// The CBC IV mixes the 32-bit stored IV with the page's data offset, so
    /// identical plaintext on different pages never encrypts alike.
    fn cbc_iv(stored_iv: u32, pos: usize) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[0..4].copy_from_slice(&stored_iv.to_le_bytes());
        iv[4..12].copy_from_slice(&(pos as u64).to_le_bytes());
        iv
    }

    fn encrypt(&self, pos: usize, stored_iv: u32, src: &[u8], dst: &mut [u8]) {
        let iv = Self::cbc_iv(stored_iv, pos);
        Aes256CbcEnc::new_from_slices(self.key.cipher_key(), &iv)
            .expect("fixed key and iv lengths")
            .encrypt_padded_b2b_mut::<NoPadding>(src, dst)
            .expect("page size is a multiple of the block size");
    }

    fn decrypt(&self, pos: usize, stored_iv: u32, src: &[u8], dst: &mut [u8]) {
        let iv = Self::cbc_iv(stored_iv, pos);
        Aes256CbcDec::new_from_slices(self.key.cipher_key(), &iv)
            .expect("fixed key and iv lengths")
            .decrypt_padded_b2b_mut::<NoPadding>(src, dst)
            .expect("page size is a multiple of the block size");
    }

    /// Fetch (and cache) the IV table slot for a data position. Metadata is
    /// read one whole page at a time; slots past EOF stay zeroed, which reads
    /// as "never written".
    fn get_iv_table(&mut self, file: &File, data_pos: usize) -> Result<&mut IvTable> {
        let idx = data_pos / PAGE_SIZE;
        if idx >= self.iv_buffer.len() {
            let old_len = self.iv_buffer.len();
            let new_len =
                (idx / PAGES_PER_METADATA_PAGE + 1) * PAGES_PER_METADATA_PAGE;
            self.iv_buffer.resize(new_len, IvTable::default());

            let mut raw = [0u8; PAGE_SIZE];
            for base in (old_len..new_len).step_by(PAGES_PER_METADATA_PAGE) {
                let read = read_up_to(file, iv_table_pos(base * PAGE_SIZE) as u64, &mut raw)?;
                for (slot, chunk) in self.iv_buffer[base..base + PAGES_PER_METADATA_PAGE]
                    .iter_mut()
                    .zip(raw[..read - read % METADATA_SIZE].chunks_exact(METADATA_SIZE))
                {
                    *slot = IvTable::from_bytes(chunk);
                }
                if read < PAGE_SIZE {
                    break;
                }
            }
        }
        Ok(&mut self.iv_buffer[idx])
    }

    /// Decrypt the page at `data_pos` into `dst`. A page never written (both
    /// IV slots zero, or physically past EOF) yields all zeroes.
    pub fn read_page(&mut self, file: &File, data_pos: usize, dst: &mut [u8]) -> Result<()> {
        debug_assert!(data_pos % PAGE_SIZE == 0 && dst.len() == PAGE_SIZE);
        let mut buffer = [0u8; PAGE_SIZE];
        let bytes_read = read_up_to(file, real_offset(data_pos) as u64, &mut buffer)?;
        if bytes_read == 0 {
            dst.fill(0);
            return Ok(());
        }

        let iv = *self.get_iv_table(file, data_pos)?;
        if iv.iv1 == 0 {
            // never written; the space is only pre-allocated
            dst.fill(0);
            return Ok(());
        }

        if self.check_hmac(&buffer[..bytes_read], &iv.hmac1) {
            self.decrypt(data_pos, iv.iv1, &buffer, dst);
            return Ok(());
        }

        // Either corruption, or a crash fell between the IV write and the
        // data write. The previous slot tells the two apart.
        if iv.iv2 == 0 {
            // the very first write of this page was interrupted
            dst.fill(0);
            return Ok(());
        }
        if self.check_hmac(&buffer[..bytes_read], &iv.hmac2) {
            log::warn!(
                "page {}: current IV slot does not authenticate, un-bumping to previous",
                data_pos / PAGE_SIZE
            );
            let slot = self.get_iv_table(file, data_pos)?;
            slot.iv1 = slot.iv2;
            slot.hmac1 = slot.hmac2;
            self.decrypt(data_pos, iv.iv2, &buffer, dst);
            return Ok(());
        }

        log::error!("page {}: both IV slots fail authentication", data_pos / PAGE_SIZE);
        Err(Error::DecryptionFailed)
    }

    /// Encrypt and persist one page: demote the current (IV, tag) pair to the
    /// previous slot, pick a fresh IV, write the slot, fsync, then write the
    /// ciphertext. The fsync between the two writes is what pins down which
    /// states a torn write can leave behind.
    pub fn write_page(&mut self, file: &File, data_pos: usize, src: &[u8]) -> Result<()> {
        let (slot_bytes, ciphertext) = self.stage_page(file, data_pos, src)?;
        file.write_all_at(&slot_bytes, iv_table_pos(data_pos) as u64)?;
        file.sync_data()?;
        file.write_all_at(&ciphertext, real_offset(data_pos) as u64)?;
        Ok(())
    }

    /// Compute the next (IV table, ciphertext) pair for a page and commit it
    /// to the in-memory table, without touching the file. Split out from
    /// `write_page` so the torn-write path is testable.
    pub(crate) fn stage_page(
        &mut self,
        file: &File,
        data_pos: usize,
        src: &[u8],
    ) -> Result<([u8; METADATA_SIZE], Box<[u8]>)> {
        debug_assert!(data_pos % PAGE_SIZE == 0 && src.len() == PAGE_SIZE);
        let mut iv = *self.get_iv_table(file, data_pos)?;
        iv.iv2 = iv.iv1;
        iv.hmac2 = iv.hmac1;

        let mut ciphertext = vec![0u8; PAGE_SIZE].into_boxed_slice();
        loop {
            iv.iv1 = iv.iv1.wrapping_add(1);
            if iv.iv1 == 0 {
                // 0 is reserved for never-been-written
                iv.iv1 = 1;
            }
            self.encrypt(data_pos, iv.iv1, src, &mut ciphertext);
            iv.hmac1 = self.hmac(&ciphertext);
            // If both slots happened to land on the same leading tag bytes a
            // reader could not tell them apart, so bump until they differ.
            if iv.hmac1[..4] != iv.hmac2[..4] {
                break;
            }
        }

        *self.get_iv_table(file, data_pos)? = iv;
        Ok((iv.to_bytes(), ciphertext))
    }
}

/// `read_at` until the buffer is full or EOF; short reads past the end of the
/// physical file are normal for freshly grown space.
fn read_up_to(file: &File, pos: u64, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], pos + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    buf[total..].fill(0);
    Ok(total)
}
