//! In-memory state backing VMware's lock directory/file dance (§4.5).
//!
//! A hypervisor attaching a VMDK creates a lock directory, sometimes one
//! nested directory inside it, and a single lock file whose contents it
//! writes and rereads to arbitrate ownership. None of this is ever
//! persisted; it lives only as long as the mount and is forgotten on
//! unmount, unlike the cache or the VDI/VMDK framing.

/// Narrow error set mapped directly onto POSIX errno by the filesystem
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    Exists,
    NotFound,
    NotEmpty,
    Denied,
}

struct LockFile {
    name: String,
    data: Vec<u8>,
}

/// The three-tuple from §3: lock directory, nested lock directory, lock
/// file, the last carrying an in-memory byte buffer.
#[derive(Default)]
pub struct VmdkLockState {
    lock_dir: bool,
    nested_dir: Option<String>,
    lock_file: Option<LockFile>,
}

impl VmdkLockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_dir_exists(&self) -> bool {
        self.lock_dir
    }

    pub fn nested_dir_name(&self) -> Option<&str> {
        self.nested_dir.as_deref()
    }

    pub fn lock_file_name(&self) -> Option<&str> {
        self.lock_file.as_ref().map(|f| f.name.as_str())
    }

    pub fn create_lock_dir(&mut self) -> Result<(), LockError> {
        if self.lock_dir {
            return Err(LockError::Exists);
        }
        self.lock_dir = true;
        Ok(())
    }

    pub fn remove_lock_dir(&mut self) -> Result<(), LockError> {
        if !self.lock_dir {
            return Err(LockError::NotFound);
        }
        if self.nested_dir.is_some() || self.lock_file.is_some() {
            return Err(LockError::NotEmpty);
        }
        self.lock_dir = false;
        Ok(())
    }

    /// VMware occasionally nests a second directory inside the lock
    /// directory; at most one is tolerated.
    pub fn create_nested_dir(&mut self, name: &str) -> Result<(), LockError> {
        if !self.lock_dir {
            return Err(LockError::Denied);
        }
        if self.nested_dir.is_some() {
            return Err(LockError::Exists);
        }
        self.nested_dir = Some(name.to_string());
        Ok(())
    }

    pub fn remove_nested_dir(&mut self, name: &str) -> Result<(), LockError> {
        match &self.nested_dir {
            Some(existing) if existing == name => {
                self.nested_dir = None;
                Ok(())
            }
            _ => Err(LockError::NotFound),
        }
    }

    pub fn create_lock_file(&mut self, name: &str) -> Result<(), LockError> {
        if !self.lock_dir {
            return Err(LockError::Denied);
        }
        if self.lock_file.is_some() {
            return Err(LockError::Exists);
        }
        self.lock_file = Some(LockFile {
            name: name.to_string(),
            data: Vec::new(),
        });
        Ok(())
    }

    pub fn remove_lock_file(&mut self, name: &str) -> Result<(), LockError> {
        match &self.lock_file {
            Some(f) if f.name == name => {
                self.lock_file = None;
                Ok(())
            }
            _ => Err(LockError::NotFound),
        }
    }

    pub fn rename_lock_file(&mut self, old: &str, new: &str) -> Result<(), LockError> {
        match &mut self.lock_file {
            Some(f) if f.name == old => {
                f.name = new.to_string();
                Ok(())
            }
            _ => Err(LockError::NotFound),
        }
    }

    pub fn lock_file_len(&self, name: &str) -> Option<usize> {
        self.lock_file
            .as_ref()
            .filter(|f| f.name == name)
            .map(|f| f.data.len())
    }

    pub fn read(&self, name: &str, offset: u64, buf: &mut [u8]) -> usize {
        let Some(f) = self.lock_file.as_ref().filter(|f| f.name == name) else {
            return 0;
        };
        let offset = offset as usize;
        if offset >= f.data.len() {
            return 0;
        }
        let n = buf.len().min(f.data.len() - offset);
        buf[..n].copy_from_slice(&f.data[offset..offset + n]);
        n
    }

    pub fn write(&mut self, name: &str, offset: u64, data: &[u8]) -> Result<usize, LockError> {
        let f = self
            .lock_file
            .as_mut()
            .filter(|f| f.name == name)
            .ok_or(LockError::NotFound)?;
        let offset = offset as usize;
        let end = offset + data.len();
        if end > f.data.len() {
            f.data.resize(end, 0);
        }
        f.data[offset..end].copy_from_slice(data);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle_matches_the_vmware_dance() {
        let mut state = VmdkLockState::new();
        state.create_lock_dir().unwrap();
        assert_eq!(state.create_lock_dir(), Err(LockError::Exists));

        state.create_lock_file("M12345.lck").unwrap();
        assert_eq!(state.remove_lock_dir(), Err(LockError::NotEmpty));

        state.write("M12345.lck", 0, b"owner-pid").unwrap();
        let mut buf = [0u8; 9];
        assert_eq!(state.read("M12345.lck", 0, &mut buf), 9);
        assert_eq!(&buf, b"owner-pid");

        state.remove_lock_file("M12345.lck").unwrap();
        state.remove_lock_dir().unwrap();
    }

    #[test]
    fn lock_file_requires_the_lock_dir_first() {
        let mut state = VmdkLockState::new();
        assert_eq!(state.create_lock_file("x.lck"), Err(LockError::Denied));
    }

    #[test]
    fn only_one_nested_dir_is_tolerated() {
        let mut state = VmdkLockState::new();
        state.create_lock_dir().unwrap();
        state.create_nested_dir("a").unwrap();
        assert_eq!(state.create_nested_dir("b"), Err(LockError::Exists));
        state.remove_nested_dir("a").unwrap();
        state.create_nested_dir("b").unwrap();
    }
}
