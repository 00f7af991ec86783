//! The push interface shared by the scanner and the dump importer.

use crate::entry::Ext;

/// Compact projection of OS stat data, as fed into a [`Sink`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub is_dir: bool,
    /// Regular file. False for symlinks, sockets, devices, fifos.
    pub is_reg: bool,
    /// Hard-link candidate: `nlink > 1` and not a directory.
    pub hlinkc: bool,
    /// 512-byte blocks, clamped to the 60-bit field.
    pub blocks: u64,
    /// Apparent size in bytes.
    pub size: u64,
    pub dev: u64,
    pub ino: u64,
    /// Reported link count; 0 means unknown.
    pub nlink: u32,
    /// Extended metadata, when captured.
    pub ext: Option<Ext>,
}

/// Classification of an entry that is not counted normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    /// stat or opendir failed.
    Err,
    /// Different filesystem than the parent directory.
    OtherFs,
    /// Kernel pseudo-filesystem.
    KernFs,
    /// Matched an exclude pattern or CACHEDIR.TAG.
    Excluded,
}

/// Push API driven by the scanner and the importer.
///
/// Call order per element: `push_name`, then exactly one of `set_stat` or
/// `set_special`. After a `set_stat` whose stat is a directory, the driver
/// calls `enter_dir`, optionally `listing_error` (before any child), the
/// children's sequences, and finally `leave_dir`.
pub trait Sink {
    /// Begin an element with the given raw name bytes.
    fn push_name(&mut self, name: &[u8]);

    /// Terminal for the current element: normal metadata.
    fn set_stat(&mut self, stat: &Stat);

    /// Terminal for the current element: uncounted special.
    fn set_special(&mut self, special: Special);

    /// Descend into the directory most recently given to `set_stat`.
    fn enter_dir(&mut self);

    /// Unwind past the innermost open directory.
    fn leave_dir(&mut self);

    /// Mark the innermost open directory as failed to list. Arrives after
    /// `enter_dir` and before any child.
    fn listing_error(&mut self);
}
