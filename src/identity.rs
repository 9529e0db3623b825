//! Identity hash computation.
//!
//! The identity hash is the MD5 digest of the first 10 MiB (or the whole
//! image, if shorter) of the input. It seeds the VDI `uuidCreate` field so
//! VirtualBox treats the emulated disk as a legitimate fresh disk, and ties a
//! cache file to the image it was built against.

use crate::image::InputImage;
use std::io;

/// Number of leading bytes of the input image folded into the identity hash.
pub const IDENTITY_HASH_WINDOW: u64 = 10 * 1024 * 1024;

/// A 128-bit MD5 digest over [`IDENTITY_HASH_WINDOW`] bytes of the input.
pub type IdentityHash = [u8; 16];

/// Computes the identity hash by reading the image in fixed-size chunks and
/// folding them through an incremental MD5 context.
pub fn compute_identity_hash(image: &mut InputImage) -> io::Result<IdentityHash> {
    let mut context = md5::Context::new();
    let size = image.size()?;
    let window = IDENTITY_HASH_WINDOW.min(size);

    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;
    while offset < window {
        let want = ((window - offset) as usize).min(buf.len());
        let read = image.read_at(offset, &mut buf[..want])?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
        offset += read as u64;
    }

    Ok(context.compute().0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{InputImage, InputVariant};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn matches_direct_md5_for_small_image() {
        let mut file = NamedTempFile::new().unwrap();
        let data = vec![0xAAu8; 3 * 1024 * 1024];
        file.write_all(&data).unwrap();

        let mut image = InputImage::open(file.path().to_str().unwrap(), InputVariant::Raw).unwrap();
        let got = compute_identity_hash(&mut image).unwrap();

        let expected = md5::compute(&data).0;
        assert_eq!(got, expected);
    }

    #[test]
    fn only_folds_first_ten_mebibytes() {
        let mut file = NamedTempFile::new().unwrap();
        let mut data = vec![0xAAu8; IDENTITY_HASH_WINDOW as usize];
        data.extend(vec![0xBBu8; 1024]);
        file.write_all(&data).unwrap();

        let mut image = InputImage::open(file.path().to_str().unwrap(), InputVariant::Raw).unwrap();
        let got = compute_identity_hash(&mut image).unwrap();

        let expected = md5::compute(&data[..IDENTITY_HASH_WINDOW as usize]).0;
        assert_eq!(got, expected);
    }
}
