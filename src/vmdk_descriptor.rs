//! VMware VMDK descriptor text construction.
//!
//! Unlike the VDI header, the descriptor is small, mutable, and owned
//! entirely in memory: a hypervisor is free to rewrite or extend it once the
//! mount is live (§4.5). Its length is always whatever `buffer.len()` says —
//! never recomputed with a C-string scan, resolving the tracked-vs-`strlen`
//! ambiguity noted in the design notes in favour of the tracked variant.

/// Bus adapter the descriptor advertises the extent under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmdkBus {
    Ide,
    Scsi,
}

impl VmdkBus {
    fn as_str(self) -> &'static str {
        match self {
            VmdkBus::Ide => "ide",
            VmdkBus::Scsi => "scsi",
        }
    }
}

/// Renders the literal monolithicFlat descriptor template, substituting the
/// sector count, the sibling raw file's basename, and the bus adapter.
pub fn render(sectors: u64, raw_filename: &str, bus: VmdkBus) -> String {
    format!(
        "# Disk DescriptorFile\n\
         version=1\n\
         CID=fffffffe\n\
         parentCID=ffffffff\n\
         createType=\"monolithicFlat\"\n\
         \n\
         # Extent description\n\
         RW {sectors} FLAT \"{raw_filename}\" 0\n\
         \n\
         # The Disk Data Base\n\
         #DDB\n\
         ddb.virtualHWVersion = \"3\"\n\
         ddb.adapterType = \"{bus}\"\n\
         ddb.geometry.cylinders = \"0\"\n\
         ddb.geometry.heads = \"0\"\n\
         ddb.geometry.sectors = \"0\"\n",
        sectors = sectors,
        raw_filename = raw_filename,
        bus = bus.as_str(),
    )
}

/// Mutable in-memory descriptor buffer backing `/<name>.vmdk`.
pub struct VmdkDescriptor {
    buffer: Vec<u8>,
}

impl VmdkDescriptor {
    pub fn new(disk_size: u64, raw_filename: &str, bus: VmdkBus) -> Self {
        let sectors = disk_size.div_ceil(512);
        Self {
            buffer: render(sectors, raw_filename, bus).into_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let offset = offset as usize;
        if offset >= self.buffer.len() {
            return 0;
        }
        let n = buf.len().min(self.buffer.len() - offset);
        buf[..n].copy_from_slice(&self.buffer[offset..offset + n]);
        n
    }

    /// Overwrites (and extends, if needed) the descriptor at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> usize {
        let offset = offset as usize;
        let end = offset + data.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[offset..end].copy_from_slice(data);
        data.len()
    }

    pub fn truncate(&mut self, new_len: u64) {
        self.buffer.truncate(new_len as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_requested_bus_and_sector_count() {
        let text = render(6144, "img.dd", VmdkBus::Scsi);
        assert!(text.contains("RW 6144 FLAT \"img.dd\" 0"));
        assert!(text.contains("ddb.adapterType = \"scsi\""));
        assert!(text.contains("createType=\"monolithicFlat\""));
    }

    #[test]
    fn write_past_end_extends_length() {
        let mut d = VmdkDescriptor::new(3 * 1024 * 1024, "img.dd", VmdkBus::Ide);
        let original_len = d.len();
        d.write_at(original_len as u64, b"extra");
        assert_eq!(d.len(), original_len + 5);

        let mut buf = [0u8; 5];
        let n = d.read_at(original_len as u64, &mut buf);
        assert_eq!(n, 5);
        assert_eq!(&buf, b"extra");
    }

    #[test]
    fn read_at_end_is_a_short_read() {
        let d = VmdkDescriptor::new(1024, "img.dd", VmdkBus::Ide);
        let mut buf = [0u8; 16];
        let n = d.read_at(d.len() as u64, &mut buf);
        assert_eq!(n, 0);
    }
}
