//! Composes the image reader, virtual-format framing and the COW cache into
//! a single logical byte stream with `size()`/`read()`/`write()` (§4.4).

use crate::cache::{CacheFile, CACHE_BLOCK_SIZE};
use crate::image::InputImage;
use crate::vdi::VdiHeader;
use crate::vmdk_descriptor::{VmdkBus, VmdkDescriptor};
use std::io;

/// Which on-the-fly rendering the virtual image presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualFormat {
    Raw,
    Vdi,
    VmdkIde,
    VmdkScsi,
}

impl VirtualFormat {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "dd" => Ok(VirtualFormat::Raw),
            "vdi" => Ok(VirtualFormat::Vdi),
            "vmdk" => Ok(VirtualFormat::VmdkIde),
            "vmdks" => Ok(VirtualFormat::VmdkScsi),
            other => Err(format!(
                "unknown output format '{other}', expected one of: dd, vdi, vmdk, vmdks"
            )),
        }
    }

    pub fn has_vmdk_descriptor(self) -> bool {
        matches!(self, VirtualFormat::VmdkIde | VirtualFormat::VmdkScsi)
    }

    pub fn extension(self) -> &'static str {
        match self {
            VirtualFormat::Raw | VirtualFormat::VmdkIde | VirtualFormat::VmdkScsi => "dd",
            VirtualFormat::Vdi => "vdi",
        }
    }
}

pub struct VirtualImageView {
    image: InputImage,
    format: VirtualFormat,
    input_size: u64,
    vdi_header_plain: Vec<u8>,
    pub vmdk_descriptor: Option<VmdkDescriptor>,
    cache: Option<CacheFile>,
}

impl VirtualImageView {
    pub fn new(
        mut image: InputImage,
        format: VirtualFormat,
        identity_hash: [u8; 16],
        raw_filename: &str,
        cache: Option<CacheFile>,
    ) -> Result<Self, String> {
        let input_size = image.size().map_err(|e| e.to_string())?;

        let vdi_header_plain = if format == VirtualFormat::Vdi {
            VdiHeader::new(input_size, identity_hash).to_bytes()
        } else {
            Vec::new()
        };

        let vmdk_descriptor = match format {
            VirtualFormat::VmdkIde => Some(VmdkDescriptor::new(input_size, raw_filename, VmdkBus::Ide)),
            VirtualFormat::VmdkScsi => Some(VmdkDescriptor::new(input_size, raw_filename, VmdkBus::Scsi)),
            _ => None,
        };

        Ok(Self {
            image,
            format,
            input_size,
            vdi_header_plain,
            vmdk_descriptor,
            cache,
        })
    }

    pub fn is_writable(&self) -> bool {
        self.cache.is_some()
    }

    pub fn format(&self) -> VirtualFormat {
        self.format
    }

    /// Logical size of `/<name>.<ext>`: just the input for Raw/VMDK, or the
    /// input plus the VDI header + block map for VDI.
    pub fn size(&self) -> u64 {
        match self.format {
            VirtualFormat::Vdi => self.input_size + self.vdi_header_plain.len() as u64,
            _ => self.input_size,
        }
    }

    fn header_region_bytes(&mut self) -> io::Result<Vec<u8>> {
        if let Some(cache) = self.cache.as_mut() {
            if cache.vdi_header_cached() {
                return cache.read_vdi_header_shadow(self.vdi_header_plain.len());
            }
        }
        Ok(self.vdi_header_plain.clone())
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let total_size = self.size();
        if offset >= total_size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((total_size - offset) as usize);

        let mut filled = 0usize;
        let mut cur_offset = offset;

        let header_size = if self.format == VirtualFormat::Vdi {
            self.vdi_header_plain.len() as u64
        } else {
            0
        };

        if cur_offset < header_size {
            let n = ((header_size - cur_offset).min((want - filled) as u64)) as usize;
            let header_bytes = self.header_region_bytes()?;
            let start = cur_offset as usize;
            buf[filled..filled + n].copy_from_slice(&header_bytes[start..start + n]);
            filled += n;
            cur_offset += n as u64;
        }

        while filled < want {
            let image_offset = cur_offset - header_size;
            if image_offset >= self.input_size {
                break;
            }
            let block = image_offset / CACHE_BLOCK_SIZE;
            let in_block_offset = image_offset % CACHE_BLOCK_SIZE;
            let room_in_block = (CACHE_BLOCK_SIZE - in_block_offset) as usize;
            let room_in_image = (self.input_size - image_offset) as usize;
            let n = (want - filled).min(room_in_block).min(room_in_image);
            if n == 0 {
                break;
            }

            let assigned = self.cache.as_ref().is_some_and(|c| c.is_assigned(block));
            if assigned {
                let cache = self.cache.as_mut().unwrap();
                cache.read_block(block, in_block_offset, &mut buf[filled..filled + n])?;
            } else {
                self.image.read_at(image_offset, &mut buf[filled..filled + n])?;
            }

            filled += n;
            cur_offset += n as u64;
        }

        Ok(filled)
    }

    /// Writable mode only; the caller (the filesystem surface) is expected
    /// to have already rejected opens for write against a read-only mount.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let total_size = self.size();
        if offset >= total_size {
            return Ok(0); // past-end writes are clamped, never extend the image.
        }
        let want = data.len().min((total_size - offset) as usize);

        let mut filled = 0usize;
        let mut cur_offset = offset;

        let header_size = if self.format == VirtualFormat::Vdi {
            self.vdi_header_plain.len() as u64
        } else {
            0
        };

        if cur_offset < header_size {
            let n = ((header_size - cur_offset).min((want - filled) as u64)) as usize;
            let header_plain = self.vdi_header_plain.clone();
            let cache = self.cache.as_mut().ok_or_else(not_writable)?;
            cache.write_vdi_header_shadow(&header_plain, cur_offset, &data[filled..filled + n])?;
            filled += n;
            cur_offset += n as u64;
        }

        while filled < want {
            let image_offset = cur_offset - header_size;
            if image_offset >= self.input_size {
                break;
            }
            let block = image_offset / CACHE_BLOCK_SIZE;
            let in_block_offset = image_offset % CACHE_BLOCK_SIZE;
            let n = ((want - filled) as u64).min(CACHE_BLOCK_SIZE - in_block_offset) as usize;

            let input_size = self.input_size;
            let cache = self.cache.as_mut().ok_or_else(not_writable)?;
            if cache.is_assigned(block) {
                cache.overwrite_block(block, in_block_offset, &data[filled..filled + n])?;
            } else {
                cache.fill_block(
                    block,
                    in_block_offset,
                    &data[filled..filled + n],
                    &mut self.image,
                    input_size,
                )?;
            }

            filled += n;
            cur_offset += n as u64;
        }

        Ok(filled)
    }
}

fn not_writable() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "mount is read-only")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::InputVariant;
    use std::io::Write as _;
    use tempfile::{tempdir, NamedTempFile};

    fn raw_image(bytes: &[u8]) -> (NamedTempFile, InputImage) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        let image = InputImage::open(file.path().to_str().unwrap(), InputVariant::Raw).unwrap();
        (file, image)
    }

    #[test]
    fn raw_passthrough_has_no_cache_file() {
        let (_f, image) = raw_image(&[0xAAu8; 3 * 1024 * 1024]);
        let mut view = VirtualImageView::new(image, VirtualFormat::Raw, [0u8; 16], "img.dd", None).unwrap();
        assert_eq!(view.size(), 3 * 1024 * 1024);

        let mut buf = vec![0u8; 3 * 1024 * 1024];
        let n = view.read(0, &mut buf).unwrap();
        assert_eq!(n, buf.len());
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn vdi_framing_matches_signature_and_offsets() {
        let (_f, image) = raw_image(&[0xAAu8; 3 * 1024 * 1024]);
        let mut view = VirtualImageView::new(image, VirtualFormat::Vdi, [0u8; 16], "img.dd", None).unwrap();

        let mut sig = [0u8; 4];
        view.read(0, &mut sig).unwrap();
        assert_eq!(sig, [0x3C, 0x3C, 0x3C, 0x20]); // "<<< " of the file-info comment

        let mut magic = [0u8; 4];
        view.read(64, &mut magic).unwrap();
        assert_eq!(magic, [0x7F, 0x10, 0xDA, 0xBE]);

        let header_size = view.size() - 3 * 1024 * 1024;
        let mut byte = [0u8; 1];
        view.read(header_size + 1, &mut byte).unwrap();
        assert_eq!(byte, [0xAA]);
    }

    #[test]
    fn cow_write_then_read_returns_the_new_bytes() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("cache");
        let (_f, image) = raw_image(&[0xAAu8; 3 * 1024 * 1024]);
        let cache = crate::cache::CacheFile::open(cache_path.to_str().unwrap(), false, 3).unwrap();
        let mut view =
            VirtualImageView::new(image, VirtualFormat::Raw, [0u8; 16], "img.dd", Some(cache)).unwrap();

        view.write(0, &[0xBB, 0xBB]).unwrap();
        let mut buf = [0u8; 2];
        view.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xBB, 0xBB]);

        // Untouched range still reads from the input.
        let mut rest = [0u8; 4];
        view.read(2, &mut rest).unwrap();
        assert!(rest.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn reads_past_end_are_short() {
        let (_f, image) = raw_image(&[0xAAu8; 10]);
        let mut view = VirtualImageView::new(image, VirtualFormat::Raw, [0u8; 16], "img.dd", None).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(view.read(10, &mut buf).unwrap(), 0);
    }
}
