//! The persistent copy-on-write block cache.
//!
//! A single host file holds a 512-byte header, a packed block-index array
//! (one `assigned:u32, data_offset:u64` entry per 1 MiB block of the input),
//! and an append-only payload region. The crash-consistency contract is:
//! write the block payload, flush, only then mark the index entry assigned
//! and persist it, flush again. A reader that observes `assigned == 1` may
//! trust the referenced range unconditionally.
//!
//! On-disk layout matches `TCacheFileHeader` in the reference header,
//! including the always-zero `VhdFileHeaderCached`/`pVhdFileHeader` fields
//! kept purely so the 512-byte header lands at the same offsets; VHD output
//! itself is out of scope here.

use crate::image::InputImage;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

pub const CACHE_BLOCK_SIZE: u64 = 1024 * 1024;
pub const CACHE_FILE_SIGNATURE: u64 = 0xFFFF_746E_756F_6D78;
pub const CACHE_FILE_VERSION: u32 = 2;
pub const CACHE_HEADER_SIZE: u64 = 512;
const BLOCK_INDEX_ENTRY_SIZE: u64 = 12; // assigned:u32 + data_offset:u64

/// Number of 1 MiB blocks needed to cover `input_size` bytes.
pub fn block_count(input_size: u64) -> u64 {
    input_size.div_ceil(CACHE_BLOCK_SIZE)
}

#[derive(Clone, Copy)]
struct BlockIndexEntry {
    assigned: bool,
    data_offset: u64,
}

struct CacheHeader {
    block_count: u64,
    vdi_header_cached: bool,
    p_vdi_header: u64,
    vmdk_file_cached: bool,
    vmdk_file_size: u64,
    p_vmdk_file: u64,
}

impl CacheHeader {
    fn fresh(block_count: u64) -> Self {
        Self {
            block_count,
            vdi_header_cached: false,
            p_vdi_header: 0,
            vmdk_file_cached: false,
            vmdk_file_size: 0,
            p_vmdk_file: 0,
        }
    }

    fn to_bytes(&self) -> [u8; CACHE_HEADER_SIZE as usize] {
        let mut buf = [0u8; CACHE_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&CACHE_FILE_SIGNATURE.to_le_bytes());
        buf[8..12].copy_from_slice(&CACHE_FILE_VERSION.to_le_bytes());
        buf[12..20].copy_from_slice(&CACHE_BLOCK_SIZE.to_le_bytes());
        buf[20..28].copy_from_slice(&self.block_count.to_le_bytes());
        buf[28..36].copy_from_slice(&CACHE_HEADER_SIZE.to_le_bytes()); // pBlockIndex
        buf[36..40].copy_from_slice(&(self.vdi_header_cached as u32).to_le_bytes());
        buf[40..48].copy_from_slice(&self.p_vdi_header.to_le_bytes());
        buf[48..52].copy_from_slice(&(self.vmdk_file_cached as u32).to_le_bytes());
        buf[52..60].copy_from_slice(&self.vmdk_file_size.to_le_bytes());
        buf[60..68].copy_from_slice(&self.p_vmdk_file.to_le_bytes());
        // VhdFileHeaderCached/pVhdFileHeader at [68, 80) stay zero: VHD output is out of scope.
        // HeaderPadding[432] at [80, 512) stays zero.
        buf
    }

    fn from_bytes(buf: &[u8; CACHE_HEADER_SIZE as usize]) -> Result<Self, String> {
        let signature = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if signature != CACHE_FILE_SIGNATURE {
            return Err("cache file signature mismatch".to_string());
        }

        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version == 1 {
            return Err(
                "cache file uses the obsolete version 1 layout; migrate it with an older xmount \
                 release before mounting it here"
                    .to_string(),
            );
        }
        if version != CACHE_FILE_VERSION {
            return Err(format!("unsupported cache file version {version}"));
        }

        let block_size = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        if block_size != CACHE_BLOCK_SIZE {
            return Err(format!(
                "cache file block size {block_size} does not match the expected {CACHE_BLOCK_SIZE}"
            ));
        }

        Ok(Self {
            block_count: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            vdi_header_cached: u32::from_le_bytes(buf[36..40].try_into().unwrap()) != 0,
            p_vdi_header: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            vmdk_file_cached: u32::from_le_bytes(buf[48..52].try_into().unwrap()) != 0,
            vmdk_file_size: u64::from_le_bytes(buf[52..60].try_into().unwrap()),
            p_vmdk_file: u64::from_le_bytes(buf[60..68].try_into().unwrap()),
        })
    }
}

/// A single host file backing the COW block cache, opened for the lifetime
/// of a writable mount session.
pub struct CacheFile {
    file: File,
    header: CacheHeader,
    index: Vec<BlockIndexEntry>,
}

impl CacheFile {
    /// Opens (or creates) the cache at `path`. `overwrite` truncates any
    /// existing file; otherwise an existing, non-empty file is parsed and
    /// validated per the format's fatal-at-startup checks.
    pub fn open(path: &str, overwrite: bool, expected_block_count: u64) -> Result<Self, String> {
        if overwrite {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| e.to_string())?;
            return Self::init_fresh(file, expected_block_count);
        }

        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(_) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)
                    .map_err(|e| e.to_string())?;
                return Self::init_fresh(file, expected_block_count);
            }
        };

        let len = file.metadata().map_err(|e| e.to_string())?.len();
        if len == 0 {
            return Self::init_fresh(file, expected_block_count);
        }

        Self::open_existing(file)
    }

    fn init_fresh(mut file: File, count: u64) -> Result<Self, String> {
        let header = CacheHeader::fresh(count);
        let index = vec![
            BlockIndexEntry {
                assigned: false,
                data_offset: 0,
            };
            count as usize
        ];

        file.seek(SeekFrom::Start(0)).map_err(|e| e.to_string())?;
        file.write_all(&header.to_bytes()).map_err(|e| e.to_string())?;
        for entry in &index {
            file.write_all(&encode_index_entry(entry)).map_err(|e| e.to_string())?;
        }
        file.flush().map_err(|e| e.to_string())?;

        Ok(Self { file, header, index })
    }

    fn open_existing(mut file: File) -> Result<Self, String> {
        file.seek(SeekFrom::Start(0)).map_err(|e| e.to_string())?;
        let mut header_buf = [0u8; CACHE_HEADER_SIZE as usize];
        file.read_exact(&mut header_buf).map_err(|e| e.to_string())?;
        let header = CacheHeader::from_bytes(&header_buf)?;

        let mut index = Vec::with_capacity(header.block_count as usize);
        let mut raw = vec![0u8; (header.block_count * BLOCK_INDEX_ENTRY_SIZE) as usize];
        file.read_exact(&mut raw).map_err(|e| e.to_string())?;
        for chunk in raw.chunks_exact(BLOCK_INDEX_ENTRY_SIZE as usize) {
            index.push(decode_index_entry(chunk));
        }

        Ok(Self { file, header, index })
    }

    pub fn block_count(&self) -> u64 {
        self.header.block_count
    }

    pub fn is_assigned(&self, block: u64) -> bool {
        self.index[block as usize].assigned
    }

    pub fn vdi_header_cached(&self) -> bool {
        self.header.vdi_header_cached
    }

    /// Reads `buf.len()` bytes from an already-assigned block at `in_block_offset`.
    pub fn read_block(&mut self, block: u64, in_block_offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let entry = self.index[block as usize];
        self.file
            .seek(SeekFrom::Start(entry.data_offset + in_block_offset))?;
        self.file.read(buf)
    }

    /// Overwrites an intersected range of an already-assigned block in place.
    pub fn overwrite_block(&mut self, block: u64, in_block_offset: u64, data: &[u8]) -> io::Result<()> {
        let entry = self.index[block as usize];
        self.file
            .seek(SeekFrom::Start(entry.data_offset + in_block_offset))?;
        self.file.write_all(data)?;
        self.file.flush()
    }

    /// Synthesizes a complete block from `image` around the caller's bytes
    /// and persists it, following the crash-consistency ordering: payload
    /// first (flushed), index entry second (flushed again).
    pub fn fill_block(
        &mut self,
        block: u64,
        in_block_offset: u64,
        data: &[u8],
        image: &mut InputImage,
        input_size: u64,
    ) -> io::Result<()> {
        let block_start = block * CACHE_BLOCK_SIZE;
        let data_offset = self.file.seek(SeekFrom::End(0))?;

        if in_block_offset > 0 {
            let mut prefix = vec![0u8; in_block_offset as usize];
            let read = image.read_at(block_start, &mut prefix)?;
            if (read as u64) < in_block_offset {
                prefix[read..].fill(0);
            }
            self.file.write_all(&prefix)?;
        }

        self.file.write_all(data)?;

        let suffix_start_in_block = in_block_offset + data.len() as u64;
        if suffix_start_in_block < CACHE_BLOCK_SIZE {
            let suffix_len = CACHE_BLOCK_SIZE - suffix_start_in_block;
            let suffix_global_start = block_start + suffix_start_in_block;
            let mut suffix = vec![0u8; suffix_len as usize];
            if suffix_global_start < input_size {
                let avail = ((input_size - suffix_global_start).min(suffix_len)) as usize;
                let read = image.read_at(suffix_global_start, &mut suffix[..avail])?;
                if read < avail {
                    suffix[read..avail].fill(0);
                }
            }
            self.file.write_all(&suffix)?;
        }

        self.file.flush()?;

        self.index[block as usize] = BlockIndexEntry {
            assigned: true,
            data_offset,
        };
        self.flush_index_entry(block)?;
        self.file.flush()
    }

    fn flush_index_entry(&mut self, block: u64) -> io::Result<()> {
        let offset = CACHE_HEADER_SIZE + block * BLOCK_INDEX_ENTRY_SIZE;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&encode_index_entry(&self.index[block as usize]))?;
        self.file.flush()
    }

    fn flush_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        self.file.flush()
    }

    /// Reads `len` bytes of the shadow-cached VDI header region.
    pub fn read_vdi_header_shadow(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(self.header.p_vdi_header))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes into the VDI header region: builds a whole shadow copy (from
    /// the existing shadow, or from `in_memory_header` on first touch),
    /// patches in the caller's bytes, appends it, and republishes the
    /// global cache header pointing at the new copy.
    pub fn write_vdi_header_shadow(
        &mut self,
        in_memory_header: &[u8],
        write_offset: u64,
        data: &[u8],
    ) -> io::Result<()> {
        let mut full = if self.header.vdi_header_cached {
            self.read_vdi_header_shadow(in_memory_header.len())?
        } else {
            in_memory_header.to_vec()
        };

        let end = write_offset as usize + data.len();
        if end > full.len() {
            full.resize(end, 0);
        }
        full[write_offset as usize..end].copy_from_slice(data);

        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&full)?;
        self.file.flush()?;

        self.header.vdi_header_cached = true;
        self.header.p_vdi_header = offset;
        self.flush_header()
    }
}

fn encode_index_entry(entry: &BlockIndexEntry) -> [u8; BLOCK_INDEX_ENTRY_SIZE as usize] {
    let mut buf = [0u8; BLOCK_INDEX_ENTRY_SIZE as usize];
    buf[0..4].copy_from_slice(&(entry.assigned as u32).to_le_bytes());
    buf[4..12].copy_from_slice(&entry.data_offset.to_le_bytes());
    buf
}

fn decode_index_entry(buf: &[u8]) -> BlockIndexEntry {
    BlockIndexEntry {
        assigned: u32::from_le_bytes(buf[0..4].try_into().unwrap()) != 0,
        data_offset: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::InputVariant;
    use std::io::Write as _;
    use tempfile::{tempdir, NamedTempFile};

    fn image_of(bytes: &[u8]) -> (NamedTempFile, InputImage) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        let image = InputImage::open(file.path().to_str().unwrap(), InputVariant::Raw).unwrap();
        (file, image)
    }

    #[test]
    fn fresh_cache_has_no_assigned_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache");
        let cache = CacheFile::open(path.to_str().unwrap(), false, 3).unwrap();
        assert_eq!(cache.block_count(), 3);
        for b in 0..3 {
            assert!(!cache.is_assigned(b));
        }
    }

    #[test]
    fn fill_then_read_round_trips_and_persists() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("cache");
        let (_img_file, mut image) = image_of(&[0xAAu8; 3 * 1024 * 1024]);

        {
            let mut cache = CacheFile::open(cache_path.to_str().unwrap(), false, 3).unwrap();
            cache
                .fill_block(0, 0, &[0xBB, 0xBB], &mut image, 3 * 1024 * 1024)
                .unwrap();
            assert!(cache.is_assigned(0));
            assert!(!cache.is_assigned(1));

            let mut buf = [0u8; 2];
            cache.read_block(0, 0, &mut buf).unwrap();
            assert_eq!(buf, [0xBB, 0xBB]);

            // Unwritten tail of the block was filled from the image.
            let mut tail = [0u8; 4];
            cache.read_block(0, 2, &mut tail).unwrap();
            assert_eq!(tail, [0xAA, 0xAA, 0xAA, 0xAA]);
        }

        // Persistence: reopen without --owcache and confirm the write survives.
        let mut cache = CacheFile::open(cache_path.to_str().unwrap(), false, 3).unwrap();
        assert!(cache.is_assigned(0));
        let mut buf = [0u8; 2];
        cache.read_block(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xBB, 0xBB]);
    }

    #[test]
    fn last_block_past_eof_is_zero_padded() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("cache");
        // 1.5 MiB input: block 1 only has 512 KiB of real data.
        let input_size = CACHE_BLOCK_SIZE + CACHE_BLOCK_SIZE / 2;
        let (_img_file, mut image) = image_of(&vec![0xCCu8; input_size as usize]);

        let mut cache = CacheFile::open(cache_path.to_str().unwrap(), false, 2).unwrap();
        cache.fill_block(1, 0, &[0xDD], &mut image, input_size).unwrap();

        let mut tail = vec![0u8; 10];
        cache.read_block(1, CACHE_BLOCK_SIZE / 2, &mut tail).unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn version_one_cache_is_rejected_with_migration_message() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache");
        let mut file = File::create(&path).unwrap();
        let mut header = [0u8; CACHE_HEADER_SIZE as usize];
        header[0..8].copy_from_slice(&CACHE_FILE_SIGNATURE.to_le_bytes());
        header[8..12].copy_from_slice(&1u32.to_le_bytes());
        file.write_all(&header).unwrap();
        drop(file);

        let err = CacheFile::open(path.to_str().unwrap(), false, 3).unwrap_err();
        assert!(err.contains("version 1"));
    }
}
