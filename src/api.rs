use zeroize::Zeroize;

/// A `Ref` names a node by its byte offset from the start of the logical data
/// space. Offset 0 is reserved as the null ref (the file header lives there,
/// so no node can ever have it). In slots of an array with `has_refs` set the
/// least significant bit distinguishes a ref (0) from an inline tagged
/// integer (1); refs proper are always 8-byte aligned so the bit is free.
pub type Ref = usize;

/// The null ref. Dereferencing it is always an `InvalidArgument` error.
pub const NULL_REF: Ref = 0;

/// Size of the file header: two top-ref slots, the selector byte, the format
/// version, and the 48-bit logical data end. The first node starts here.
pub const FILE_HEADER_SIZE: usize = 24;

/// On-disk format version written to header byte 17.
pub const FILE_FORMAT_VERSION: u8 = 1;

/// Every node starts with an 8-byte header.
pub const NODE_HEADER_SIZE: usize = 8;

/// Maximum number of elements in a single array node. Also caps index
/// arithmetic well below any point where it could wrap.
pub const MAX_ARRAY_SIZE: usize = 0x00FF_FFFF;

/// Maximum payload bytes a node header can describe once aligned.
pub const MAX_ARRAY_PAYLOAD: usize = 0x07FF_FFC0;

/// Granularity of the encrypted page layer.
pub const PAGE_SIZE: usize = 4096;

/// Total length of an encryption key: AES-256 key followed by the HMAC key.
pub const ENCRYPTION_KEY_LEN: usize = 64;

/// Key material for the encrypted page layer. First 32 bytes key the AES-256
/// cipher, the last 32 bytes key the HMAC-SHA-224 tags. Wiped on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct EncryptionKey(pub [u8; ENCRYPTION_KEY_LEN]);

impl EncryptionKey {
    pub fn new(bytes: [u8; ENCRYPTION_KEY_LEN]) -> Self { EncryptionKey(bytes) }

    pub(crate) fn cipher_key(&self) -> &[u8] { &self.0[..32] }

    pub(crate) fn hmac_key(&self) -> &[u8] { &self.0[32..] }
}

/// Errors escape to the transaction boundary; nothing below recovers locally.
/// A failed mutation unwinds its allocations and leaves the previous version
/// intact, so every variant here is a clean "this call did not happen".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The file could not grow and no free-list entry fits the request.
    #[error("storage exhausted: cannot grow file or satisfy allocation")]
    SpaceExhausted,

    /// A header, free-list or tree invariant does not hold. The message names
    /// the check that failed; the backing file should be considered suspect.
    #[error("corrupted file: {0}")]
    CorruptedFile(&'static str),

    /// Neither IV slot of a page authenticates the stored ciphertext.
    #[error("page decryption failed: HMAC mismatch in both IV slots")]
    DecryptionFailed,

    /// Out-of-range index, malformed width, or a tagged slot used as a ref.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Another writer holds the file lock and a non-blocking begin was asked.
    #[error("write transaction already in progress on this file")]
    WriterLockUnavailable,

    /// The OS failed a read, write or fsync.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
