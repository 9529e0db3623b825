//! Uniform byte-addressable view over the input forensic image.
//!
//! [`InputImage`] hides the differences between the raw/dd, EWF and AFF4
//! back-ends behind a single `size()`/`read_at()` contract: random-access
//! reads that clamp at end-of-image instead of erroring.

use crate::aff4::AFF4;
use crate::ewf::EWF;
use crate::raw::RAW;
use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};

/// Which on-disk container the input file(s) are encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputVariant {
    Raw,
    Ewf,
    Aff,
}

impl InputVariant {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "dd" => Ok(InputVariant::Raw),
            "ewf" => Ok(InputVariant::Ewf),
            "aff" => Ok(InputVariant::Aff),
            other => Err(format!(
                "unknown input format '{other}', expected one of: dd, ewf, aff"
            )),
        }
    }
}

enum Inner {
    Raw(RAW),
    Ewf(EWF),
    Aff(AFF4),
}

/// Read-only, random-access handle over the input image. Immutable for the
/// life of the mount session; the total size is queried lazily and memoized.
pub struct InputImage {
    inner: Inner,
    cached_size: Option<u64>,
}

impl InputImage {
    /// Opens `path` as the given input variant. Failure here is fatal at
    /// session start (§4.6): the caller is expected to log and exit.
    pub fn open(path: &str, variant: InputVariant) -> Result<Self, String> {
        let inner = match variant {
            InputVariant::Raw => Inner::Raw(RAW::new(path).map_err(|e| e.to_string())?),
            InputVariant::Ewf => Inner::Ewf(EWF::new(path)?),
            InputVariant::Aff => Inner::Aff(AFF4::new(path)?),
        };
        Ok(Self {
            inner,
            cached_size: None,
        })
    }

    /// Total byte length of the input image, memoized after the first call.
    pub fn size(&mut self) -> io::Result<u64> {
        if let Some(size) = self.cached_size {
            return Ok(size);
        }
        let size = match &self.inner {
            Inner::Raw(r) => r.size()?,
            Inner::Ewf(e) => e.size(),
            Inner::Aff(a) => a.size(),
        };
        self.cached_size = Some(size);
        Ok(size)
    }

    /// Random-access read. Clamps at end-of-image: a request that starts at
    /// or past `size()` returns `Ok(0)`, one that overlaps the end returns a
    /// short read, never an error.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.size()?;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);
        let buf = &mut buf[..want];

        match &mut self.inner {
            Inner::Raw(r) => {
                r.seek(SeekFrom::Start(offset))?;
                read_fully(r, buf)
            }
            Inner::Ewf(e) => {
                e.seek(SeekFrom::Start(offset))?;
                read_fully(e, buf)
            }
            Inner::Aff(a) => {
                a.seek(SeekFrom::Start(offset))?;
                read_fully(a, buf)
            }
        }
    }

    /// Logs a human-readable summary of the underlying container, when the
    /// back-end has one to offer (EWF acquisition metadata, AFF4 stream
    /// layout). Raw images carry no intrinsic metadata.
    pub fn print_info(&self) {
        match &self.inner {
            Inner::Raw(_) => {}
            Inner::Ewf(e) => e.print_info(),
            Inner::Aff(a) => a.print_info(),
        }
    }

    /// EWF acquisition metadata, when the input is an EWF image.
    pub fn ewf_metadata(&self) -> Option<&HashMap<String, String>> {
        match &self.inner {
            Inner::Ewf(e) => Some(e.metadata()),
            _ => None,
        }
    }
}

/// Reads until `buf` is full or the underlying reader runs dry, matching the
/// short-read-at-EOF behaviour expected of `read_at`.
fn read_fully<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn raw_read_at_clamps_at_eof() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xAAu8; 100]).unwrap();

        let mut image = InputImage::open(file.path().to_str().unwrap(), InputVariant::Raw).unwrap();
        assert_eq!(image.size().unwrap(), 100);

        let mut buf = [0u8; 32];
        let n = image.read_at(90, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert!(buf[..10].iter().all(|&b| b == 0xAA));

        let n = image.read_at(100, &mut buf).unwrap();
        assert_eq!(n, 0);

        let n = image.read_at(200, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn parse_variant_rejects_unknown_strings() {
        assert!(InputVariant::parse("dd").is_ok());
        assert!(InputVariant::parse("ewf").is_ok());
        assert!(InputVariant::parse("aff").is_ok());
        assert!(InputVariant::parse("vhd").is_err());
    }
}
