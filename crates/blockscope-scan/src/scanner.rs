//! Single-threaded depth-first directory scanner.
//!
//! The scanner walks one directory at a time, projecting OS metadata into
//! compact [`Stat`] records and pushing them into a [`Sink`] (the tree
//! builder or the dump exporter). It yields to the caller's
//! [`ScanFeedback`] hook once per entry; there are no other suspension
//! points and no worker threads.

use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use blockscope_core::util::{clamp_mtime, clamp_nlink, truncate_mode, MAX_BLOCKS};
use blockscope_core::{Ext, ScanConfig, ScanError, Sink, Special, Stat};

use crate::kernfs::KernfsCache;
use crate::progress::ScanFeedback;

/// First 43 bytes of a CACHEDIR.TAG file, per the cache-directory
/// tagging standard.
const CACHEDIR_TAG_SIG: &[u8; 43] = b"Signature: 8a477f597d28d172789f06886806bc55";

/// Scan the tree rooted at `path`, feeding every entry into `sink`.
///
/// The path is canonicalized first; a root that is not a directory fails
/// with [`ScanError::NotADirectory`]. Per-entry errors never abort the
/// scan: they are recorded on the offending node and surface as `suberr`
/// on its ancestors.
pub fn scan_root<S: Sink>(
    path: &Path,
    sink: &mut S,
    config: &ScanConfig,
    feedback: &mut dyn ScanFeedback,
) -> Result<(), ScanError> {
    let root = path
        .canonicalize()
        .map_err(|e| ScanError::io(path, e))?;
    let meta = fs::symlink_metadata(&root).map_err(|e| ScanError::io(&root, e))?;
    if !meta.is_dir() {
        return Err(ScanError::NotADirectory { path: root });
    }
    let stat = project_stat(&meta, config.extended);

    let mut walker = Walker {
        config,
        sink,
        feedback,
        kernfs: KernfsCache::new(),
        path: root.clone(),
    };
    walker.sink.push_name(&os_bytes(root.as_os_str()));
    let listing = fs::read_dir(&root);
    walker.walk_children(listing, &stat)
}

struct Walker<'a, S: Sink> {
    config: &'a ScanConfig,
    sink: &'a mut S,
    feedback: &'a mut dyn ScanFeedback,
    kernfs: KernfsCache,
    /// Shared path buffer; components are pushed and popped around each
    /// entry.
    path: PathBuf,
}

impl<S: Sink> Walker<'_, S> {
    /// Emit the directory whose name is already pushed, then its
    /// children. A failed listing marks the directory before any child
    /// is emitted.
    fn walk_children(
        &mut self,
        listing: std::io::Result<fs::ReadDir>,
        stat: &Stat,
    ) -> Result<(), ScanError> {
        let (names, failed) = match listing {
            Ok(rd) => collect_names(rd),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot list directory");
                (Vec::new(), true)
            }
        };
        self.sink.set_stat(stat);
        self.sink.enter_dir();
        if failed {
            self.sink.listing_error();
        }
        for name in names {
            self.walk_entry(&name, stat.dev)?;
        }
        self.sink.leave_dir();
        Ok(())
    }

    fn walk_entry(&mut self, name: &OsStr, parent_dev: u64) -> Result<(), ScanError> {
        self.path.push(name);
        let result = self.process_entry(name, parent_dev);
        self.path.pop();
        result
    }

    fn process_entry(&mut self, name: &OsStr, parent_dev: u64) -> Result<(), ScanError> {
        if !self.feedback.tick(&self.path) {
            return Err(ScanError::Interrupted);
        }
        let name_bytes = os_bytes(name);

        if self.config.is_excluded(&os_bytes(self.path.as_os_str())) {
            debug!(path = %self.path.display(), "excluded by pattern");
            self.emit_special(&name_bytes, Special::Excluded);
            return Ok(());
        }

        let meta = match fs::symlink_metadata(&self.path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "stat failed");
                self.emit_special(&name_bytes, Special::Err);
                return Ok(());
            }
        };
        let mut stat = project_stat(&meta, self.config.extended);

        if self.config.same_fs && stat.dev != parent_dev {
            debug!(path = %self.path.display(), "different filesystem");
            self.emit_special(&name_bytes, Special::OtherFs);
            return Ok(());
        }

        if self.config.follow_symlinks && meta.file_type().is_symlink() {
            if let Ok(followed) = fs::metadata(&self.path) {
                // Directory targets are never followed; everything else
                // takes the target's stat.
                if !followed.is_dir() {
                    stat = project_stat(&followed, self.config.extended);
                    // A target on another device breaks hard-link
                    // counting there; treat it as a singly-linked file.
                    if stat.hlinkc && stat.dev != parent_dev {
                        stat.hlinkc = false;
                        stat.nlink = 1;
                    }
                }
            }
        }

        if stat.is_dir {
            match fs::read_dir(&self.path) {
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "cannot open directory");
                    self.emit_special(&name_bytes, Special::Err);
                    Ok(())
                }
                Ok(rd) => {
                    if self.config.exclude_kernfs && self.kernfs.is_kernfs(stat.dev, &self.path) {
                        debug!(path = %self.path.display(), "kernel pseudo-filesystem");
                        self.emit_special(&name_bytes, Special::KernFs);
                        return Ok(());
                    }
                    if self.config.exclude_caches && has_cachedir_tag(&self.path) {
                        debug!(path = %self.path.display(), "CACHEDIR.TAG present");
                        self.emit_special(&name_bytes, Special::Excluded);
                        return Ok(());
                    }
                    self.sink.push_name(&name_bytes);
                    self.walk_children(Ok(rd), &stat)
                }
            }
        } else {
            self.sink.push_name(&name_bytes);
            self.sink.set_stat(&stat);
            Ok(())
        }
    }

    fn emit_special(&mut self, name: &[u8], special: Special) {
        self.sink.push_name(name);
        self.sink.set_special(special);
    }
}

/// Read a directory to completion. An iteration error terminates the
/// listing and flags it as failed; entries read so far are kept.
fn collect_names(rd: fs::ReadDir) -> (Vec<OsString>, bool) {
    let mut names = Vec::new();
    for entry in rd {
        match entry {
            Ok(e) => names.push(e.file_name()),
            Err(_) => return (names, true),
        }
    }
    (names, false)
}

/// Project OS metadata into the compact stat record fed to sinks.
fn project_stat(meta: &fs::Metadata, extended: bool) -> Stat {
    let nlink = get_nlink(meta);
    let is_dir = meta.is_dir();
    Stat {
        is_dir,
        is_reg: meta.file_type().is_file(),
        hlinkc: nlink > 1 && !is_dir,
        blocks: get_blocks(meta).min(MAX_BLOCKS),
        size: meta.len(),
        dev: get_dev(meta),
        ino: get_ino(meta),
        nlink: clamp_nlink(nlink),
        ext: extended.then(|| Ext {
            mtime: clamp_mtime(get_mtime(meta)),
            uid: get_uid(meta),
            gid: get_gid(meta),
            mode: truncate_mode(get_mode(meta)),
        }),
    }
}

/// Whether `dir` carries a CACHEDIR.TAG with the standard signature.
fn has_cachedir_tag(dir: &Path) -> bool {
    let mut f = match fs::File::open(dir.join("CACHEDIR.TAG")) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut buf = [0u8; CACHEDIR_TAG_SIG.len()];
    match f.read_exact(&mut buf) {
        Ok(()) => &buf == CACHEDIR_TAG_SIG,
        Err(_) => false,
    }
}

#[cfg(unix)]
fn os_bytes(s: &OsStr) -> Cow<'_, [u8]> {
    use std::os::unix::ffi::OsStrExt;
    Cow::Borrowed(s.as_bytes())
}

#[cfg(not(unix))]
fn os_bytes(s: &OsStr) -> Cow<'_, [u8]> {
    Cow::Owned(s.to_string_lossy().into_owned().into_bytes())
}

// Cross-platform metadata helpers

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

#[cfg(unix)]
fn get_dev(meta: &fs::Metadata) -> u64 {
    meta.dev()
}

#[cfg(not(unix))]
fn get_dev(_meta: &fs::Metadata) -> u64 {
    0
}

#[cfg(unix)]
fn get_ino(meta: &fs::Metadata) -> u64 {
    meta.ino()
}

#[cfg(not(unix))]
fn get_ino(_meta: &fs::Metadata) -> u64 {
    0
}

#[cfg(unix)]
fn get_nlink(meta: &fs::Metadata) -> u64 {
    meta.nlink()
}

#[cfg(not(unix))]
fn get_nlink(_meta: &fs::Metadata) -> u64 {
    1
}

#[cfg(unix)]
fn get_blocks(meta: &fs::Metadata) -> u64 {
    meta.blocks()
}

#[cfg(not(unix))]
fn get_blocks(meta: &fs::Metadata) -> u64 {
    meta.len().div_ceil(512)
}

#[cfg(unix)]
fn get_mtime(meta: &fs::Metadata) -> i64 {
    meta.mtime()
}

#[cfg(not(unix))]
fn get_mtime(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn get_uid(meta: &fs::Metadata) -> u32 {
    meta.uid()
}

#[cfg(not(unix))]
fn get_uid(_meta: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn get_gid(meta: &fs::Metadata) -> u32 {
    meta.gid()
}

#[cfg(not(unix))]
fn get_gid(_meta: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn get_mode(meta: &fs::Metadata) -> u32 {
    meta.mode()
}

#[cfg(not(unix))]
fn get_mode(_meta: &fs::Metadata) -> u32 {
    0
}
