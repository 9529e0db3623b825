//! Library surface for the `xmount` binary: the Image Reader, Virtual Header
//! Builder, Cache Store, Virtual Image View, Virtual Filesystem Surface and
//! Mount Session described in the design, plus the VMDK lock state that
//! backs the filesystem's auxiliary mutable files.

pub mod aff4;
pub mod cache;
pub mod ewf;
pub mod fs;
pub mod identity;
pub mod image;
pub mod info;
pub mod lockstate;
pub mod raw;
pub mod session;
pub mod vdi;
pub mod view;
pub mod vmdk_descriptor;
