//! In-memory demo image.
//!
//! Real deployments hand the kernel an image produced by external tooling;
//! the demo image assembled here carries working Ring 3 programs (the shell
//! and the commands it can launch) plus a couple of text files, and doubles
//! as the test suite's fixture with known contents.

use super::{BLOCK_SIZE, DENTRY_BASE, DENTRY_INODE_OFFSET, DENTRY_SIZE, DENTRY_TYPE_OFFSET};
use crate::{paging, user_programs};

/// Blocks in the demo image: boot block + 8 inodes + data.
const DEMO_BLOCKS: usize = 16;
const DEMO_INODES: usize = 8;

static mut DEMO_STORAGE: [u8; DEMO_BLOCKS * BLOCK_SIZE] = [0; DEMO_BLOCKS * BLOCK_SIZE];

const FRAME0: &[u8] = b"\
       o\n\
     o\n\
   o   .:/\n\
      ;MMM:\n\
    ::MMMMM::\n\
  <x.MMMMMMM.x>\n\
    ::MMMMM::\n\
      ;MMM:\n\
       ':/\n";

const FRAME1: &[u8] = b"\
   o\n\
     o\n\
       o .:/\n\
        ;MMM:\n\
      ::MMMMM::\n\
    <x.MMMMMMM.x>\n\
      ::MMMMM::\n\
        ;MMM:\n\
         ':/\n";

/// Assemble the demo image and return it as the mountable byte slice.
///
/// Must only be called from the boot path, before interrupts are enabled.
pub fn build_demo_image() -> &'static [u8] {
    // SAFETY:
    // Single-threaded boot code; nothing else references DEMO_STORAGE yet,
    // and the returned shared slice is never written again.
    let storage = unsafe { &mut *(&raw mut DEMO_STORAGE) };

    let mut builder = ImageBuilder::new(storage, DEMO_INODES);
    builder.add_directory(b".");
    builder.add_device(b"rtc");
    builder.add_file(b"shell", &program_file(user_programs::shell));
    builder.add_file(b"ls", &program_file(user_programs::ls));
    builder.add_file(b"cat", &program_file(user_programs::cat));
    builder.add_file(b"counter", &program_file(user_programs::counter));
    builder.add_file(b"pingpong", &program_file(user_programs::pingpong));
    builder.add_file(b"frame0.txt", FRAME0);
    builder.add_file(b"frame1.txt", FRAME1);
    builder.finish()
}

/// File offset (and entry offset into the user window) of a program's code.
const PROGRAM_LOAD_OFFSET: usize = 0x94;
/// Bytes copied out of a program routine; every routine is shorter.
const PROGRAM_CODE_LEN: usize = 512;
const PROGRAM_FILE_LEN: usize = PROGRAM_LOAD_OFFSET + PROGRAM_CODE_LEN;

/// Wrap one Ring 3 routine in a loadable file: header with magic and entry
/// point, code at the load offset.
fn program_file(program: unsafe extern "C" fn() -> !) -> [u8; PROGRAM_FILE_LEN] {
    let mut file = [0_u8; PROGRAM_FILE_LEN];
    file[0] = 0x7F;
    file[1] = b'E';
    file[2] = b'L';
    file[3] = b'F';
    // Class/data/version identification bytes; the loader ignores them.
    file[4] = 2;
    file[5] = 1;
    file[6] = 1;

    let entry = (paging::USER_PROG + paging::PROG_OFFSET + PROGRAM_LOAD_OFFSET as u64) as u32;
    file[24..28].copy_from_slice(&entry.to_le_bytes());

    // The routines are position-independent, so their kernel-text bytes run
    // unchanged at the user load address. The copy may extend past a
    // routine's final instruction into neighboring text; those trailing
    // bytes sit after an unconditional jump or a halt and are never reached.
    //
    // SAFETY:
    // Kernel text is mapped and readable for the whole copied range.
    unsafe {
        core::ptr::copy_nonoverlapping(
            program as usize as *const u8,
            file[PROGRAM_LOAD_OFFSET..].as_mut_ptr(),
            PROGRAM_CODE_LEN,
        );
    }
    file
}

/// Writes a boot-block/inode/data-block image into a caller-provided buffer.
///
/// The inode capacity is fixed up front because the data region starts right
/// after the inode blocks.
pub struct ImageBuilder<'a> {
    bytes: &'a mut [u8],
    inode_capacity: usize,
    dentries: usize,
    next_inode: usize,
    next_data_block: usize,
}

impl<'a> ImageBuilder<'a> {
    /// Start a fresh image. `bytes` must be zeroed and hold at least the
    /// boot block plus `inode_capacity` inode blocks.
    pub fn new(bytes: &'a mut [u8], inode_capacity: usize) -> Self {
        let mut builder = Self {
            bytes,
            inode_capacity,
            dentries: 0,
            next_inode: 0,
            next_data_block: 0,
        };
        builder.put_u32(4, inode_capacity as u32);
        builder
    }

    /// Add the directory entry (type 1).
    pub fn add_directory(&mut self, name: &[u8]) {
        self.push_dentry(name, 1, 0);
    }

    /// Add a character-device entry (type 0).
    pub fn add_device(&mut self, name: &[u8]) {
        self.push_dentry(name, 0, 0);
    }

    /// Add a regular file (type 2) with the given contents.
    pub fn add_file(&mut self, name: &[u8], contents: &[u8]) {
        let inode = self.next_inode;
        assert!(inode < self.inode_capacity, "demo image out of inodes");
        self.next_inode += 1;

        let inode_base = BLOCK_SIZE * (inode + 1);
        self.put_u32(inode_base, contents.len() as u32);

        let data_base = BLOCK_SIZE * (self.inode_capacity + 1);
        for (i, chunk) in contents.chunks(BLOCK_SIZE).enumerate() {
            let block = self.next_data_block;
            self.next_data_block += 1;
            self.put_u32(inode_base + 4 + 4 * i, block as u32);

            let dst = data_base + block * BLOCK_SIZE;
            self.bytes[dst..dst + chunk.len()].copy_from_slice(chunk);
        }
        self.put_u32(8, self.next_data_block as u32);

        self.push_dentry(name, 2, inode as u32);
    }

    /// Finish and return the assembled image.
    pub fn finish(self) -> &'a [u8] {
        self.bytes
    }

    fn push_dentry(&mut self, name: &[u8], file_type: u32, inode: u32) {
        assert!(name.len() <= super::NAME_LENGTH, "demo name too long");
        assert!(self.dentries < super::MAX_DENTRIES, "demo image out of dentries");

        let base = DENTRY_BASE + self.dentries * DENTRY_SIZE;
        self.bytes[base..base + name.len()].copy_from_slice(name);
        self.put_u32(base + DENTRY_TYPE_OFFSET, file_type);
        self.put_u32(base + DENTRY_INODE_OFFSET, inode);

        self.dentries += 1;
        self.put_u32(0, self.dentries as u32);
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::{program_file, PROGRAM_LOAD_OFFSET};
    use crate::{paging, user_programs};

    #[test_case]
    fn test_program_files_carry_the_loader_contract() {
        let file = program_file(user_programs::shell);

        assert_eq!(
            &file[..4],
            &[0x7F, b'E', b'L', b'F'],
            "Program files start with the loadable magic.",
        );

        let mut word = [0_u8; 4];
        word.copy_from_slice(&file[24..28]);
        assert_eq!(
            u64::from(u32::from_le_bytes(word)),
            paging::USER_PROG + paging::PROG_OFFSET + PROGRAM_LOAD_OFFSET as u64,
            "The entry point names the code's load address.",
        );

        assert!(
            file[PROGRAM_LOAD_OFFSET..].iter().any(|&b| b != 0),
            "The routine's code is behind the header.",
        );
    }
}
