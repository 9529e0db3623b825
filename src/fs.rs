//! The `fuser::Filesystem` binding: maps path-based callbacks onto the
//! Virtual Image View (D) and the VMDK lock state (§4.5).
//!
//! `fuser`'s low-level API is inode-addressed rather than path-addressed, so
//! a small deterministic inode table sits in front of the path namespace
//! spec.md describes: root = 1, image = 2, info = 3, vmdk descriptor = 4
//! when present, and lock directory/nested directory/lock file allocated
//! from a monotonic counter the first time a hypervisor creates them.

use crate::lockstate::{LockError, VmdkLockState};
use crate::view::{VirtualFormat, VirtualImageView};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request,
};
use libc::{EACCES, EEXIST, EIO, ENOENT, ENOTEMPTY};
use log::{debug, warn};
use std::ffi::OsStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

const ROOT_INO: u64 = 1;
const IMAGE_INO: u64 = 2;
const INFO_INO: u64 = 3;
const VMDK_INO: u64 = 4;
const FIRST_DYNAMIC_INO: u64 = 5;

const TTL: Duration = Duration::from_secs(1);

/// Held behind `mu_image_rw`: the Virtual Image View, the VMDK descriptor it
/// owns, and the VMDK lock state, plus the small inode table needed to name
/// the lock directory/file once they exist.
struct Shared {
    view: VirtualImageView,
    lock_state: VmdkLockState,
    lock_dir_ino: Option<u64>,
    nested_dir_ino: Option<u64>,
    lock_file_ino: Option<u64>,
    next_ino: u64,
}

pub struct XmountFs {
    image_name: String, // "/<name>.<ext>" without the leading slash
    info_name: String,
    vmdk_name: Option<String>, // Some only in VMDK output modes
    lock_dir_name: Option<String>,
    info_text: String,
    uid: u32,
    gid: u32,
    shared: Mutex<Shared>,
    info_lock: Mutex<()>,
}

impl XmountFs {
    pub fn new(
        image_name: String,
        info_name: String,
        vmdk_name: Option<String>,
        info_text: String,
        view: VirtualImageView,
    ) -> Self {
        let lock_dir_name = vmdk_name.as_ref().map(|n| format!("{n}.lck"));
        Self {
            image_name,
            info_name,
            vmdk_name,
            lock_dir_name,
            info_text,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            shared: Mutex::new(Shared {
                view,
                lock_state: VmdkLockState::new(),
                lock_dir_ino: None,
                nested_dir_ino: None,
                lock_file_ino: None,
                next_ino: FIRST_DYNAMIC_INO,
            }),
            info_lock: Mutex::new(()),
        }
    }

    fn file_attr(&self, ino: u64, kind: FileType, size: u64, perm: u16) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn root_attr(&self) -> FileAttr {
        self.file_attr(ROOT_INO, FileType::Directory, 0, 0o777)
    }

    fn lock_errno(err: LockError) -> i32 {
        match err {
            LockError::Exists => EEXIST,
            LockError::NotFound => ENOENT,
            LockError::NotEmpty => ENOTEMPTY,
            LockError::Denied => EACCES,
        }
    }
}

impl Filesystem for XmountFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy();
        let shared = self.shared.lock().unwrap();

        if parent == ROOT_INO {
            if name == self.image_name {
                let attr = self.file_attr(
                    IMAGE_INO,
                    FileType::RegularFile,
                    shared.view.size(),
                    if shared.view.is_writable() { 0o666 } else { 0o444 },
                );
                reply.entry(&TTL, &attr, 0);
                return;
            }
            if name == self.info_name {
                let attr = self.file_attr(INFO_INO, FileType::RegularFile, self.info_text.len() as u64, 0o444);
                reply.entry(&TTL, &attr, 0);
                return;
            }
            if self.vmdk_name.as_deref() == Some(name.as_ref()) {
                let len = shared.view.vmdk_descriptor.as_ref().map(|d| d.len()).unwrap_or(0);
                let attr = self.file_attr(VMDK_INO, FileType::RegularFile, len as u64, 0o666);
                reply.entry(&TTL, &attr, 0);
                return;
            }
            if self.lock_dir_name.as_deref() == Some(name.as_ref()) {
                if let Some(ino) = shared.lock_dir_ino {
                    reply.entry(&TTL, &self.file_attr(ino, FileType::Directory, 0, 0o777), 0);
                    return;
                }
            }
            reply.error(ENOENT);
            return;
        }

        if Some(parent) == shared.lock_dir_ino {
            if shared.nested_dir_ino.is_some() && shared.lock_state.nested_dir_name() == Some(name.as_ref()) {
                let ino = shared.nested_dir_ino.unwrap();
                reply.entry(&TTL, &self.file_attr(ino, FileType::Directory, 0, 0o777), 0);
                return;
            }
            if shared.lock_file_ino.is_some() && shared.lock_state.lock_file_name() == Some(name.as_ref()) {
                let ino = shared.lock_file_ino.unwrap();
                let len = shared.lock_state.lock_file_len(name.as_ref()).unwrap_or(0);
                reply.entry(&TTL, &self.file_attr(ino, FileType::RegularFile, len as u64, 0o666), 0);
                return;
            }
        }

        reply.error(ENOENT);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &self.root_attr());
            return;
        }

        let shared = self.shared.lock().unwrap();
        match ino {
            IMAGE_INO => {
                let perm = if shared.view.is_writable() { 0o666 } else { 0o444 };
                reply.attr(&TTL, &self.file_attr(ino, FileType::RegularFile, shared.view.size(), perm));
            }
            INFO_INO => {
                reply.attr(&TTL, &self.file_attr(ino, FileType::RegularFile, self.info_text.len() as u64, 0o444));
            }
            VMDK_INO if self.vmdk_name.is_some() => {
                let len = shared.view.vmdk_descriptor.as_ref().map(|d| d.len()).unwrap_or(0);
                reply.attr(&TTL, &self.file_attr(ino, FileType::RegularFile, len as u64, 0o666));
            }
            _ if Some(ino) == shared.lock_dir_ino => {
                reply.attr(&TTL, &self.file_attr(ino, FileType::Directory, 0, 0o777));
            }
            _ if Some(ino) == shared.nested_dir_ino => {
                reply.attr(&TTL, &self.file_attr(ino, FileType::Directory, 0, 0o777));
            }
            _ if Some(ino) == shared.lock_file_ino => {
                let name = shared.lock_state.lock_file_name().unwrap_or("").to_string();
                let len = shared.lock_state.lock_file_len(&name).unwrap_or(0);
                reply.attr(&TTL, &self.file_attr(ino, FileType::RegularFile, len as u64, 0o666));
            }
            _ => reply.error(ENOENT),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let shared = self.shared.lock().unwrap();
        let mut entries: Vec<(u64, FileType, String)> = Vec::new();

        if ino == ROOT_INO {
            entries.push((ROOT_INO, FileType::Directory, ".".to_string()));
            entries.push((ROOT_INO, FileType::Directory, "..".to_string()));
            entries.push((IMAGE_INO, FileType::RegularFile, self.image_name.clone()));
            entries.push((INFO_INO, FileType::RegularFile, self.info_name.clone()));
            if let Some(vmdk_name) = &self.vmdk_name {
                entries.push((VMDK_INO, FileType::RegularFile, vmdk_name.clone()));
            }
            if let (Some(ino), Some(name)) = (shared.lock_dir_ino, &self.lock_dir_name) {
                entries.push((ino, FileType::Directory, name.clone()));
            }
        } else if Some(ino) == shared.lock_dir_ino {
            entries.push((ino, FileType::Directory, ".".to_string()));
            entries.push((ROOT_INO, FileType::Directory, "..".to_string()));
            if let (Some(nested_ino), Some(name)) = (shared.nested_dir_ino, shared.lock_state.nested_dir_name()) {
                entries.push((nested_ino, FileType::Directory, name.to_string()));
            }
            if let (Some(file_ino), Some(name)) = (shared.lock_file_ino, shared.lock_state.lock_file_name()) {
                entries.push((file_ino, FileType::RegularFile, name.to_string()));
            }
        } else {
            reply.error(ENOENT);
            return;
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let wants_write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        if ino == IMAGE_INO {
            let shared = self.shared.lock().unwrap();
            if wants_write && !shared.view.is_writable() {
                reply.error(EACCES);
                return;
            }
        }
        reply.opened(ino, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = offset.max(0) as u64;
        let mut buf = vec![0u8; size as usize];

        if ino == INFO_INO {
            let _guard = self.info_lock.lock().unwrap();
            let bytes = self.info_text.as_bytes();
            let n = if offset >= bytes.len() as u64 {
                0
            } else {
                let n = buf.len().min(bytes.len() - offset as usize);
                buf[..n].copy_from_slice(&bytes[offset as usize..offset as usize + n]);
                n
            };
            reply.data(&buf[..n]);
            return;
        }

        let mut shared = self.shared.lock().unwrap();
        let n = match ino {
            IMAGE_INO => match shared.view.read(offset, &mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!("image read failed: {e}");
                    reply.error(EIO);
                    return;
                }
            },
            VMDK_INO => shared
                .view
                .vmdk_descriptor
                .as_ref()
                .map(|d| d.read_at(offset, &mut buf))
                .unwrap_or(0),
            _ if Some(ino) == shared.lock_file_ino => {
                let name = shared.lock_state.lock_file_name().unwrap_or("").to_string();
                shared.lock_state.read(&name, offset, &mut buf)
            }
            _ => {
                reply.error(ENOENT);
                return;
            }
        };
        reply.data(&buf[..n]);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = offset.max(0) as u64;
        let mut shared = self.shared.lock().unwrap();

        let n = match ino {
            IMAGE_INO => match shared.view.write(offset, data) {
                Ok(n) => n,
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        reply.error(EACCES);
                    } else {
                        warn!("image write failed: {e}");
                        reply.error(EIO);
                    }
                    return;
                }
            },
            VMDK_INO => {
                if let Some(d) = shared.view.vmdk_descriptor.as_mut() {
                    d.write_at(offset, data)
                } else {
                    reply.error(EACCES);
                    return;
                }
            }
            _ if Some(ino) == shared.lock_file_ino => {
                let name = shared.lock_state.lock_file_name().unwrap_or("").to_string();
                match shared.lock_state.write(&name, offset, data) {
                    Ok(n) => n,
                    Err(e) => {
                        reply.error(Self::lock_errno(e));
                        return;
                    }
                }
            }
            _ => {
                reply.error(EACCES);
                return;
            }
        };
        reply.written(n as u32);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_string_lossy().to_string();
        let mut shared = self.shared.lock().unwrap();

        if Some(parent) != shared.lock_dir_ino {
            reply.error(EACCES);
            return;
        }
        match shared.lock_state.create_lock_file(&name) {
            Ok(()) => {
                let ino = shared.next_ino;
                shared.next_ino += 1;
                shared.lock_file_ino = Some(ino);
                reply.entry(&TTL, &self.file_attr(ino, FileType::RegularFile, 0, 0o666), 0);
            }
            Err(e) => reply.error(Self::lock_errno(e)),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let name = name.to_string_lossy().to_string();
        let mut shared = self.shared.lock().unwrap();

        if parent == ROOT_INO && self.lock_dir_name.as_deref() == Some(name.as_str()) {
            if shared.lock_dir_ino.is_some() {
                reply.error(EEXIST);
                return;
            }
            if let Err(e) = shared.lock_state.create_lock_dir() {
                reply.error(Self::lock_errno(e));
                return;
            }
            let ino = shared.next_ino;
            shared.next_ino += 1;
            shared.lock_dir_ino = Some(ino);
            reply.entry(&TTL, &self.file_attr(ino, FileType::Directory, 0, 0o777), 0);
            return;
        }

        if Some(parent) == shared.lock_dir_ino {
            match shared.lock_state.create_nested_dir(&name) {
                Ok(()) => {
                    let ino = shared.next_ino;
                    shared.next_ino += 1;
                    shared.nested_dir_ino = Some(ino);
                    reply.entry(&TTL, &self.file_attr(ino, FileType::Directory, 0, 0o777), 0);
                }
                Err(e) => reply.error(Self::lock_errno(e)),
            }
            return;
        }

        reply.error(EACCES);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy();
        let mut shared = self.shared.lock().unwrap();

        if Some(parent) == shared.lock_dir_ino {
            match shared.lock_state.remove_lock_file(&name) {
                Ok(()) => {
                    shared.lock_file_ino = None;
                    reply.ok();
                }
                Err(e) => reply.error(Self::lock_errno(e)),
            }
            return;
        }
        reply.error(ENOENT);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy();
        let mut shared = self.shared.lock().unwrap();

        if parent == ROOT_INO && self.lock_dir_name.as_deref() == Some(name.as_ref()) {
            match shared.lock_state.remove_lock_dir() {
                Ok(()) => {
                    shared.lock_dir_ino = None;
                    reply.ok();
                }
                Err(e) => reply.error(Self::lock_errno(e)),
            }
            return;
        }

        if Some(parent) == shared.lock_dir_ino {
            match shared.lock_state.remove_nested_dir(&name) {
                Ok(()) => {
                    shared.nested_dir_ino = None;
                    reply.ok();
                }
                Err(e) => reply.error(Self::lock_errno(e)),
            }
            return;
        }

        reply.error(ENOENT);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy();
        let newname = newname.to_string_lossy();
        let mut shared = self.shared.lock().unwrap();

        if parent != newparent || Some(parent) != shared.lock_dir_ino {
            reply.error(EACCES);
            return;
        }
        match shared.lock_state.rename_lock_file(&name, &newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Self::lock_errno(e)),
        }
    }
}

/// Derives `/<name>.<ext>`-style virtual file names from the input path and
/// the requested output variant (§6, "Virtual file naming").
pub fn derive_names(input_path: &str, format: VirtualFormat) -> (String, String, Option<String>) {
    let base = std::path::Path::new(input_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| input_path.to_string());

    let image_ext = format.extension();
    let image_name = format!("{base}.{image_ext}");
    let info_name = format!("{base}.info");
    let vmdk_name = if format.has_vmdk_descriptor() {
        Some(format!("{base}.vmdk"))
    } else {
        None
    };

    debug!("derived virtual names: image={image_name} info={info_name} vmdk={vmdk_name:?}");
    (image_name, info_name, vmdk_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_output_has_no_vmdk_sibling() {
        let (image, info, vmdk) = derive_names("/evidence/img.dd", VirtualFormat::Raw);
        assert_eq!(image, "img.dd");
        assert_eq!(info, "img.info");
        assert!(vmdk.is_none());
    }

    #[test]
    fn vdi_output_uses_vdi_extension() {
        let (image, _info, vmdk) = derive_names("img.E01", VirtualFormat::Vdi);
        assert_eq!(image, "img.vdi");
        assert!(vmdk.is_none());
    }

    #[test]
    fn vmdk_output_adds_a_descriptor_sibling() {
        let (image, _info, vmdk) = derive_names("img.dd", VirtualFormat::VmdkScsi);
        assert_eq!(image, "img.dd");
        assert_eq!(vmdk, Some("img.vmdk".to_string()));
    }
}
