//! VirtualBox VDI header construction.
//!
//! Builds the fixed 512-byte binary header plus its trailing identity block
//! map, exactly as laid out in `TVdiFileHeader` (little-endian, packed). The
//! header is built once at session start and never resized; writes into its
//! region are diverted to the cache's VDI-header shadow (`crate::cache`).

use rand::RngCore;

pub const VDI_FILE_COMMENT: &str = "<<< This is a virtual VDI image >>>";
pub const VDI_HEADER_COMMENT_PREFIX: &str = "This VDI was emulated using xmount-rs v";
pub const VDI_IMAGE_SIGNATURE: u32 = 0xBEDA_107F;
pub const VDI_IMAGE_VERSION: u32 = 0x0001_0001;
pub const VDI_IMAGE_TYPE_FIXED: u32 = 0x0000_0002;
pub const VDI_IMAGE_FLAGS: u32 = 0;
pub const VDI_IMAGE_BLOCK_SIZE: u64 = 1024 * 1024;
pub const VDI_CB_HEADER: u32 = 0x0000_0180;
pub const VDI_HEADER_SIZE: u64 = 512;

/// Number of 1 MiB blocks needed to cover `disk_size` bytes.
pub fn block_entries(disk_size: u64) -> u32 {
    (disk_size.div_ceil(VDI_IMAGE_BLOCK_SIZE)) as u32
}

/// In-memory representation of the VDI header plus its block map. Both are
/// serialized together by [`VdiHeader::to_bytes`] since the block map
/// immediately follows the header on disk (`offBlocks == sizeof(header)`).
pub struct VdiHeader {
    comment: String,
    disk_size: u64,
    block_entries: u32,
    uuid_create: [u8; 16],
    uuid_modify: [u8; 16],
}

impl VdiHeader {
    /// Builds a header for an input image of `disk_size` bytes. `uuid_create`
    /// is the session's identity hash; `uuid_modify` is freshly randomized,
    /// matching the reference's once-seeded PRNG draw.
    pub fn new(disk_size: u64, uuid_create: [u8; 16]) -> Self {
        let mut uuid_modify = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut uuid_modify);
        Self {
            comment: format!("{VDI_HEADER_COMMENT_PREFIX}{}", env!("CARGO_PKG_VERSION")),
            disk_size,
            block_entries: block_entries(disk_size),
            uuid_create,
            uuid_modify,
        }
    }

    pub fn block_entries(&self) -> u32 {
        self.block_entries
    }

    pub fn off_blocks(&self) -> u32 {
        VDI_HEADER_SIZE as u32
    }

    pub fn off_data(&self) -> u32 {
        VDI_HEADER_SIZE as u32 + self.block_entries * 4
    }

    /// Total size of header + block map, i.e. the byte offset at which the
    /// input image's own bytes begin in the virtual VDI file.
    pub fn total_size(&self) -> u64 {
        VDI_HEADER_SIZE + self.block_entries as u64 * 4
    }

    /// Serializes the header and its identity block map (entry *i* == *i*)
    /// into a single little-endian, packed byte buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.total_size() as usize];

        let file_info = VDI_FILE_COMMENT.as_bytes();
        buf[0..file_info.len().min(64)].copy_from_slice(&file_info[..file_info.len().min(64)]);

        buf[64..68].copy_from_slice(&VDI_IMAGE_SIGNATURE.to_le_bytes());
        buf[68..72].copy_from_slice(&VDI_IMAGE_VERSION.to_le_bytes());
        buf[72..76].copy_from_slice(&VDI_CB_HEADER.to_le_bytes());
        buf[76..80].copy_from_slice(&VDI_IMAGE_TYPE_FIXED.to_le_bytes());
        buf[80..84].copy_from_slice(&VDI_IMAGE_FLAGS.to_le_bytes());

        let comment = self.comment.as_bytes();
        let n = comment.len().min(255);
        buf[84..84 + n].copy_from_slice(&comment[..n]);

        buf[340..344].copy_from_slice(&self.off_blocks().to_le_bytes());
        buf[344..348].copy_from_slice(&self.off_data().to_le_bytes());
        // cCylinders/cHeads/cSectors stay zero at [348, 360).
        buf[360..364].copy_from_slice(&512u32.to_le_bytes()); // cbSector
        // u32Dummy stays zero at [364, 368).
        buf[368..376].copy_from_slice(&self.disk_size.to_le_bytes()); // cbDisk
        buf[376..380].copy_from_slice(&(VDI_IMAGE_BLOCK_SIZE as u32).to_le_bytes()); // cbBlock
        // cbBlockExtra stays zero at [380, 384), per the open question in the design notes.
        buf[384..388].copy_from_slice(&self.block_entries.to_le_bytes()); // cBlocks
        buf[388..392].copy_from_slice(&self.block_entries.to_le_bytes()); // cBlocksAllocated
        buf[392..408].copy_from_slice(&self.uuid_create); // uuidCreate_l/h
        buf[408..424].copy_from_slice(&self.uuid_modify); // uuidModify_l/h
        // uuidLinkage, uuidParentModify and the final padding stay zero at [424, 512).

        let map_start = self.off_blocks() as usize;
        for i in 0..self.block_entries {
            let entry_start = map_start + i as usize * 4;
            buf[entry_start..entry_start + 4].copy_from_slice(&i.to_le_bytes());
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_comment_and_signature_land_at_the_right_offsets() {
        let header = VdiHeader::new(3 * 1024 * 1024, [0xAB; 16]);
        let bytes = header.to_bytes();

        assert_eq!(&bytes[0..VDI_FILE_COMMENT.len()], VDI_FILE_COMMENT.as_bytes());
        assert_eq!(&bytes[64..68], &[0x7F, 0x10, 0xDA, 0xBE]);
        assert_eq!(u32::from_le_bytes(bytes[68..72].try_into().unwrap()), VDI_IMAGE_VERSION);
        assert_eq!(u32::from_le_bytes(bytes[76..80].try_into().unwrap()), VDI_IMAGE_TYPE_FIXED);
    }

    #[test]
    fn block_map_is_an_identity_mapping() {
        let header = VdiHeader::new(5 * 1024 * 1024, [0u8; 16]);
        assert_eq!(header.block_entries(), 5);
        let bytes = header.to_bytes();
        let map_start = header.off_blocks() as usize;
        for i in 0..5u32 {
            let start = map_start + i as usize * 4;
            let entry = u32::from_le_bytes(bytes[start..start + 4].try_into().unwrap());
            assert_eq!(entry, i);
        }
    }

    #[test]
    fn total_size_accounts_for_non_aligned_disk_sizes() {
        // 2.5 MiB disk needs 3 blocks (ceil).
        let header = VdiHeader::new(5 * 1024 * 1024 / 2, [0u8; 16]);
        assert_eq!(header.block_entries(), 3);
        assert_eq!(header.off_data(), VDI_HEADER_SIZE as u32 + 12);
        assert_eq!(header.total_size(), VDI_HEADER_SIZE + 12);
    }
}
