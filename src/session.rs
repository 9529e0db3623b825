//! The Mount Session (F): owns configuration, the identity hash, and the
//! init/teardown order of components A-E (§4.6).

use crate::cache::{block_count, CacheFile};
use crate::fs::{derive_names, XmountFs};
use crate::identity::compute_identity_hash;
use crate::image::{InputImage, InputVariant};
use crate::info::build_info_file;
use crate::view::{VirtualFormat, VirtualImageView};
use log::info;

/// Runtime configuration, immutable once the session enters its serving
/// loop. Mirrors the reference's `TXMountConfData`.
pub struct SessionConfig {
    pub input_path: String,
    pub input_variant: InputVariant,
    pub output_format: VirtualFormat,
    pub cache_path: Option<String>,
    pub overwrite_cache: bool,
}

impl SessionConfig {
    pub fn writable(&self) -> bool {
        self.cache_path.is_some()
    }
}

/// Builds the filesystem ready to be handed to `fuser::mount2`. Performs, in
/// order: opening the Image Reader, computing the identity hash, deriving
/// virtual file names, building the info file, building the VDI header or
/// VMDK descriptor (inside `VirtualImageView::new`), and opening the cache
/// if the mount is writable. Any failure here is fatal-at-startup (§7) and
/// is returned to the caller to report and exit(1).
pub fn build_filesystem(config: &SessionConfig) -> Result<XmountFs, String> {
    let mut image = InputImage::open(&config.input_path, config.input_variant)?;
    image.print_info();

    let identity_hash = compute_identity_hash(&mut image).map_err(|e| e.to_string())?;
    info!("identity hash: {:x?}", identity_hash);

    let (image_name, info_name, vmdk_name) = derive_names(&config.input_path, config.output_format);
    let info_text = build_info_file(image.ewf_metadata());

    let input_size = image.size().map_err(|e| e.to_string())?;
    let cache = match &config.cache_path {
        Some(path) => Some(CacheFile::open(path, config.overwrite_cache, block_count(input_size))?),
        None => None,
    };

    let raw_filename = image_name.clone();
    let view = VirtualImageView::new(image, config.output_format, identity_hash, &raw_filename, cache)?;

    Ok(XmountFs::new(image_name, info_name, vmdk_name, info_text, view))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn read_only_session_builds_without_a_cache() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xAAu8; 3 * 1024 * 1024]).unwrap();

        let config = SessionConfig {
            input_path: file.path().to_str().unwrap().to_string(),
            input_variant: InputVariant::Raw,
            output_format: VirtualFormat::Raw,
            cache_path: None,
            overwrite_cache: false,
        };
        assert!(!config.writable());
        build_filesystem(&config).unwrap();
    }

    #[test]
    fn writable_session_opens_a_fresh_cache() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xAAu8; 3 * 1024 * 1024]).unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache_path = cache_dir.path().join("cache");

        let config = SessionConfig {
            input_path: file.path().to_str().unwrap().to_string(),
            input_variant: InputVariant::Raw,
            output_format: VirtualFormat::Vdi,
            cache_path: Some(cache_path.to_str().unwrap().to_string()),
            overwrite_cache: true,
        };
        assert!(config.writable());
        build_filesystem(&config).unwrap();
    }
}
