//! Kernel version and page size discovery.

use std::{ffi::CStr, fs, mem};

lazy_static::lazy_static! {
    static ref PAGE_SIZE: u32 = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u32;
}

pub(crate) fn page_size() -> u32 {
    *PAGE_SIZE
}

/// The version of the running kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
}

impl KernelVersion {
    pub const fn new(major: u8, minor: u8, patch: u16) -> KernelVersion {
        KernelVersion {
            major,
            minor,
            patch,
        }
    }

    /// The packed `KERNEL_VERSION(a, b, c)` representation; the patch level
    /// saturates at 255, as it does in the kernel macro.
    pub fn code(&self) -> u32 {
        (self.major as u32) << 16 | (self.minor as u32) << 8 | self.patch.min(255) as u32
    }

    /// The version of the running kernel, or `None` when it cannot be
    /// determined.
    pub fn current() -> Option<KernelVersion> {
        // Ubuntu kernels report the version they are based on in
        // /proc/version_signature; uname reports the ABI version instead.
        if let Ok(signature) = fs::read_to_string("/proc/version_signature") {
            if let Some(version) = parse_version_signature(signature.trim()) {
                return parse_version(&version);
            }
        }

        let mut uname = unsafe { mem::zeroed::<libc::utsname>() };
        if unsafe { libc::uname(&mut uname) } != 0 {
            return None;
        }
        let release = unsafe { CStr::from_ptr(uname.release.as_ptr()) };
        parse_version(release.to_str().ok()?)
    }
}

fn parse_version_signature(signature: &str) -> Option<String> {
    let parts: Vec<_> = signature.split(' ').collect();
    if parts.len() != 3 {
        return None;
    }
    parts.last().map(|v| String::from(*v))
}

fn parse_version(version: &str) -> Option<KernelVersion> {
    let version = version.splitn(2, '-').next()?;
    let version = version.splitn(2, '+').next()?;

    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some(KernelVersion::new(major, minor, patch))
}
