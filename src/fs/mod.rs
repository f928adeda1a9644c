//! Read-only file image reader.
//!
//! The image is a flat sequence of 4 KiB blocks living in kernel memory:
//! a boot block (directory entries and counts), one block per inode, then
//! the data blocks. The image is trusted and never written.

use spin::Mutex;

pub mod demo;

/// Stored length of a directory entry name. Names are not necessarily
/// null-terminated.
pub const NAME_LENGTH: usize = 32;
/// Size of every block in the image.
pub const BLOCK_SIZE: usize = 4096;
/// The boot block holds at most this many directory entries.
pub const MAX_DENTRIES: usize = 63;

/// Byte offset of a dentry's type word inside its 64-byte record.
const DENTRY_TYPE_OFFSET: usize = 32;
/// Byte offset of a dentry's inode word inside its 64-byte record.
const DENTRY_INODE_OFFSET: usize = 36;
/// Size of one directory entry record.
const DENTRY_SIZE: usize = 64;
/// Directory entries start after the three counts and the reserved area.
const DENTRY_BASE: usize = 64;

/// File type stored in a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Character device stub, backed by the RTC driver.
    Rtc,
    /// The (single) directory.
    Directory,
    /// Regular file.
    Regular,
}

impl FileType {
    /// Decode the type word of a directory entry.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Rtc),
            1 => Some(Self::Directory),
            2 => Some(Self::Regular),
            _ => None,
        }
    }
}

/// A directory entry copied out of the boot block.
#[derive(Debug, Clone, Copy)]
pub struct Dentry {
    /// Stored name, padded with zeros when shorter than 32 bytes.
    pub name: [u8; NAME_LENGTH],
    /// Raw type word; decode with [`FileType::from_raw`].
    pub file_type: u32,
    /// Index of the backing inode (meaningless for the directory and RTC).
    pub inode: u32,
}

/// Errors of the image reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Inode index is outside the image's inode count.
    BadInode,
}

/// A parsed view over an image kept in memory.
#[derive(Clone, Copy)]
pub struct Image<'a> {
    bytes: &'a [u8],
}

impl<'a> Image<'a> {
    /// Wrap an image. The slice must hold at least the boot block.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Number of directory entries in the boot block.
    #[must_use]
    pub fn dentry_count(&self) -> u32 {
        self.u32_at(0)
    }

    /// Number of inode blocks following the boot block.
    #[must_use]
    pub fn inode_count(&self) -> u32 {
        self.u32_at(4)
    }

    /// Number of data blocks following the inode blocks.
    #[must_use]
    pub fn data_block_count(&self) -> u32 {
        self.u32_at(8)
    }

    /// Find a directory entry by name, scanning in directory order.
    ///
    /// The stored 32-byte name must match the query both as a prefix and
    /// over the full field: a query that is a strict prefix of a longer
    /// stored name does not match, and a query longer than 32 bytes never
    /// matches anything.
    #[must_use]
    pub fn dentry_by_name(&self, name: &[u8]) -> Option<Dentry> {
        if name.len() > NAME_LENGTH {
            return None;
        }

        (0..self.dentry_count())
            .map(|i| self.dentry_at(i as usize))
            .find(|dentry| name_matches(&dentry.name, name))
    }

    /// Directory entry at the given index, or `None` past the end.
    #[must_use]
    pub fn dentry_by_index(&self, index: u32) -> Option<Dentry> {
        if index >= self.dentry_count() {
            return None;
        }
        Some(self.dentry_at(index as usize))
    }

    /// Read up to `buf.len()` bytes of the file starting at `offset`.
    ///
    /// Returns the number of bytes copied: 0 when `offset` is at or past the
    /// end of the file, otherwise `min(buf.len(), size - offset)`. Data block
    /// indices recorded in the inode are trusted.
    ///
    /// # Errors
    /// [`FsError::BadInode`] when `inode` is outside the image's inode count.
    pub fn read_data(&self, inode: u32, offset: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        if inode >= self.inode_count() {
            return Err(FsError::BadInode);
        }

        let inode_base = BLOCK_SIZE * (inode as usize + 1);
        let file_size = self.u32_at(inode_base) as usize;
        let offset = offset as usize;

        if offset >= file_size {
            return Ok(0);
        }

        let end = core::cmp::min(offset + buf.len(), file_size);
        let data_base = BLOCK_SIZE * (self.inode_count() as usize + 1);

        let mut cur = offset;
        let mut copied = 0;
        while cur != end {
            let block_index = self.u32_at(inode_base + 4 + 4 * (cur / BLOCK_SIZE)) as usize;
            let within = cur % BLOCK_SIZE;
            let chunk = core::cmp::min(BLOCK_SIZE - within, end - cur);

            let src = data_base + block_index * BLOCK_SIZE + within;
            buf[copied..copied + chunk].copy_from_slice(&self.bytes[src..src + chunk]);

            cur += chunk;
            copied += chunk;
        }

        Ok(copied)
    }

    /// Size in bytes of the file behind the given inode.
    ///
    /// # Errors
    /// [`FsError::BadInode`] when `inode` is outside the image's inode count.
    pub fn file_size(&self, inode: u32) -> Result<usize, FsError> {
        if inode >= self.inode_count() {
            return Err(FsError::BadInode);
        }
        Ok(self.u32_at(BLOCK_SIZE * (inode as usize + 1)) as usize)
    }

    fn dentry_at(&self, index: usize) -> Dentry {
        let base = DENTRY_BASE + index * DENTRY_SIZE;
        let mut name = [0_u8; NAME_LENGTH];
        name.copy_from_slice(&self.bytes[base..base + NAME_LENGTH]);
        Dentry {
            name,
            file_type: self.u32_at(base + DENTRY_TYPE_OFFSET),
            inode: self.u32_at(base + DENTRY_INODE_OFFSET),
        }
    }

    fn u32_at(&self, offset: usize) -> u32 {
        let mut word = [0_u8; 4];
        word.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(word)
    }
}

/// Match a stored 32-byte name against a query without terminator.
///
/// The query must equal the stored prefix, and the stored name must end
/// right there (or both fill the whole field).
fn name_matches(stored: &[u8; NAME_LENGTH], query: &[u8]) -> bool {
    if stored[..query.len()] != *query {
        return false;
    }
    query.len() == NAME_LENGTH || stored[query.len()] == 0
}

/// The mounted image, installed once at boot.
static FS_IMAGE: Mutex<Option<Image<'static>>> = Mutex::new(None);

/// Mount an image for the rest of the kernel.
pub fn init(bytes: &'static [u8]) {
    *FS_IMAGE.lock() = Some(Image::new(bytes));
}

/// The mounted image, if any.
#[must_use]
pub fn image() -> Option<Image<'static>> {
    *FS_IMAGE.lock()
}

#[cfg(test)]
mod tests {
    use super::demo::ImageBuilder;
    use super::{FileType, FsError, Image, BLOCK_SIZE, NAME_LENGTH};

    /// Boot block + 4 inode blocks + 3 data blocks.
    const FIXTURE_BLOCKS: usize = 8;

    static mut FIXTURE_STORAGE: [u8; FIXTURE_BLOCKS * BLOCK_SIZE] =
        [0; FIXTURE_BLOCKS * BLOCK_SIZE];

    fn sample_image() -> Image<'static> {
        // SAFETY:
        // Tests run single-threaded; the fixture is rebuilt from scratch on
        // every call and only read afterwards.
        let storage = unsafe {
            FIXTURE_STORAGE = [0; FIXTURE_BLOCKS * BLOCK_SIZE];
            &mut *(&raw mut FIXTURE_STORAGE)
        };

        let mut builder = ImageBuilder::new(storage, 4);
        builder.add_directory(b".");
        builder.add_device(b"rtc");
        builder.add_file(b"greeting", b"hello, image reader");
        builder.add_file(b"big", &[0xAB_u8; 5000]);
        Image::new(builder.finish())
    }

    #[test_case]
    fn test_lookup_finds_stored_names() {
        let image = sample_image();

        let dentry = image
            .dentry_by_name(b"greeting")
            .expect("stored name should be found.");
        assert_eq!(
            FileType::from_raw(dentry.file_type),
            Some(FileType::Regular),
            "greeting should be a regular file.",
        );
    }

    #[test_case]
    fn test_lookup_rejects_prefix_of_longer_name() {
        let image = sample_image();

        assert!(
            image.dentry_by_name(b"greet").is_none(),
            "A strict prefix of a stored name must not match.",
        );
    }

    #[test_case]
    fn test_lookup_rejects_query_longer_than_name_field() {
        let image = sample_image();

        let long_query = [b'a'; NAME_LENGTH + 5];
        assert!(
            image.dentry_by_name(&long_query).is_none(),
            "Queries longer than 32 bytes never match.",
        );
    }

    #[test_case]
    fn test_stat_by_index_is_bounded() {
        let image = sample_image();

        assert!(image.dentry_by_index(0).is_some(), "Index 0 exists.");
        assert!(
            image.dentry_by_index(image.dentry_count()).is_none(),
            "Index == dentry count is out of range.",
        );
    }

    #[test_case]
    fn test_read_data_round_trip() {
        let image = sample_image();
        let dentry = image.dentry_by_name(b"greeting").expect("file exists.");

        let mut buf = [0_u8; 32];
        let read = image
            .read_data(dentry.inode, 0, &mut buf)
            .expect("inode is valid.");
        assert_eq!(read, 19, "Short file read returns the file size.");
        assert_eq!(&buf[..read], b"hello, image reader", "Contents round-trip.");
    }

    #[test_case]
    fn test_read_data_concatenates_across_block_boundary() {
        let image = sample_image();
        let dentry = image.dentry_by_name(b"big").expect("file exists.");

        // Read the 5000-byte file in two chunks that straddle the 4 KiB block.
        let mut first = [0_u8; 3000];
        let mut second = [0_u8; 3000];
        let n1 = image
            .read_data(dentry.inode, 0, &mut first)
            .expect("inode is valid.");
        let n2 = image
            .read_data(dentry.inode, 3000, &mut second)
            .expect("inode is valid.");

        assert_eq!(n1, 3000, "First chunk is full.");
        assert_eq!(n2, 2000, "Second chunk is clipped to the file size.");
        assert!(
            first.iter().all(|&b| b == 0xAB) && second[..2000].iter().all(|&b| b == 0xAB),
            "Concatenated reads reconstruct the file.",
        );
    }

    #[test_case]
    fn test_read_data_at_and_past_end_returns_zero() {
        let image = sample_image();
        let dentry = image.dentry_by_name(b"greeting").expect("file exists.");

        let mut buf = [0_u8; 8];
        assert_eq!(
            image.read_data(dentry.inode, 19, &mut buf),
            Ok(0),
            "offset == size reads nothing.",
        );
        assert_eq!(
            image.read_data(dentry.inode, 40, &mut buf),
            Ok(0),
            "offset > size reads nothing.",
        );
    }

    #[test_case]
    fn test_read_data_rejects_bad_inode() {
        let image = sample_image();

        let mut buf = [0_u8; 8];
        assert_eq!(
            image.read_data(image.inode_count(), 0, &mut buf),
            Err(FsError::BadInode),
            "Inode index must be below the inode count.",
        );
    }
}
