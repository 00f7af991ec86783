//! Kernel pseudo-filesystem detection via statfs magic numbers.

use std::collections::HashMap;
use std::path::Path;

/// statfs f_type magics of filesystems that expose kernel state rather
/// than disk contents: binfmt, bpf, cgroup, cgroup2, debugfs, devpts,
/// proc, pstore, securityfs, selinux, sysfs, tracefs.
#[cfg(target_os = "linux")]
const KERNFS_MAGICS: [u64; 12] = [
    0x42494e4d, // binfmt_misc
    0xcafe4a11, // bpf
    0x0027e0eb, // cgroup
    0x63677270, // cgroup2
    0x64626720, // debugfs
    0x00001cd1, // devpts
    0x00009fa0, // proc
    0x6165676c, // pstore
    0x73636673, // securityfs
    0xf97cff8c, // selinuxfs
    0x62656572, // sysfs
    0x74726163, // tracefs
];

/// Per-device cache of kernfs classification. A filesystem's type cannot
/// change mid-scan, so one statfs per device suffices.
#[derive(Debug, Default)]
pub struct KernfsCache {
    by_dev: HashMap<u64, bool>,
}

impl KernfsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the filesystem holding `path` (device `dev`) is a kernel
    /// pseudo-filesystem. statfs failures classify as not-kernfs.
    #[cfg(target_os = "linux")]
    pub fn is_kernfs(&mut self, dev: u64, path: &Path) -> bool {
        if let Some(&cached) = self.by_dev.get(&dev) {
            return cached;
        }
        let hit = statfs_type(path).is_some_and(|t| KERNFS_MAGICS.contains(&t));
        self.by_dev.insert(dev, hit);
        hit
    }

    #[cfg(not(target_os = "linux"))]
    pub fn is_kernfs(&mut self, _dev: u64, _path: &Path) -> bool {
        false
    }
}

#[cfg(target_os = "linux")]
fn statfs_type(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(c_path.as_ptr(), &mut buf) };
    if rc != 0 {
        return None;
    }
    Some(buf.f_type as u64)
}
