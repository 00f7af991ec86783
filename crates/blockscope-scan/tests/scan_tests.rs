#![cfg(unix)]

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tempfile::TempDir;

use blockscope_core::{ScanConfig, Tree, TreeBuilder};
use blockscope_scan::{scan_root, NullFeedback};

fn scan(path: &Path, config: &ScanConfig) -> Tree {
    let mut builder = TreeBuilder::new(config.extended);
    scan_root(path, &mut builder, config, &mut NullFeedback).unwrap();
    builder.finish()
}

fn scan_default(path: &Path) -> Tree {
    scan(path, &ScanConfig::default())
}

#[test]
fn test_empty_dir() {
    let temp = TempDir::new().unwrap();
    let meta = fs::metadata(temp.path()).unwrap();

    let t = scan_default(temp.path());
    let root = t.root().unwrap();
    let e = t.entry(root);

    assert!(t.children(root).next().is_none());
    assert_eq!(e.as_dir().unwrap().items, 0);
    // Only the directory's own stat contributes.
    assert_eq!(e.size, meta.len());
    assert_eq!(e.blocks, meta.blocks());
}

#[test]
fn test_single_regular_file() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("data.bin");
    fs::write(&file, vec![0u8; 4096]).unwrap();
    let fmeta = fs::metadata(&file).unwrap();
    let dmeta = fs::metadata(temp.path()).unwrap();

    let t = scan_default(temp.path());
    let root = t.root().unwrap();
    assert_eq!(t.entry(root).as_dir().unwrap().items, 1);
    assert_eq!(t.entry(root).size, 4096 + dmeta.len());
    assert_eq!(t.entry(root).blocks, fmeta.blocks() + dmeta.blocks());

    let f = t.child_named(root, b"data.bin").unwrap();
    assert_eq!(t.entry(f).size, 4096);
    assert_eq!(t.entry(f).blocks, fmeta.blocks());
    assert!(!t.entry(f).as_file().unwrap().notreg);
}

#[test]
fn test_hardlinks_fully_inside_tree() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("d1")).unwrap();
    fs::create_dir(temp.path().join("d2")).unwrap();
    let f1 = temp.path().join("d1/f");
    fs::write(&f1, vec![7u8; 2048]).unwrap();
    fs::hard_link(&f1, temp.path().join("d2/f")).unwrap();
    let fmeta = fs::metadata(&f1).unwrap();
    assert_eq!(fmeta.nlink(), 2);

    let t = scan_default(temp.path());
    let root = t.root().unwrap();
    let d1 = t.child_named(root, b"d1").unwrap();
    let link = t.child_named(d1, b"f").unwrap();
    assert!(t.entry(link).is_link());
    assert_eq!(t.entry(link).as_link().unwrap().nlink, 2);

    // Both links inside root: counted once, nothing shared out of root.
    assert_eq!(t.entry(root).as_dir().unwrap().shared_blocks, 0);
    assert_eq!(t.entry(root).as_dir().unwrap().shared_size, 0);
    let dirs_own: u64 = [temp.path(), &temp.path().join("d1"), &temp.path().join("d2")]
        .iter()
        .map(|p| fs::metadata(p).unwrap().len())
        .sum();
    assert_eq!(t.entry(root).size, 2048 + dirs_own);

    // Each subdir shares its copy out.
    assert_eq!(t.entry(d1).as_dir().unwrap().shared_blocks, fmeta.blocks());
}

#[test]
fn test_hardlink_peer_excluded() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("keep")).unwrap();
    fs::create_dir(temp.path().join("skip")).unwrap();
    let f1 = temp.path().join("keep/f");
    fs::write(&f1, vec![7u8; 2048]).unwrap();
    fs::hard_link(&f1, temp.path().join("skip/f")).unwrap();
    let fmeta = fs::metadata(&f1).unwrap();

    let config = ScanConfig::builder()
        .exclude_patterns(vec!["skip".to_string()])
        .build()
        .unwrap();
    let t = scan(temp.path(), &config);
    let root = t.root().unwrap();

    // Only one of two occurrences is visible: still shared out of root.
    assert_eq!(t.entry(root).as_dir().unwrap().shared_blocks, fmeta.blocks());
    assert_eq!(t.entry(root).as_dir().unwrap().shared_size, 2048);

    let skip = t.child_named(root, b"skip").unwrap();
    assert!(t.entry(skip).as_file().unwrap().excluded);
}

#[test]
fn test_cachedir_tag_prunes_directory() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    fs::create_dir(&cache).unwrap();
    fs::write(
        cache.join("CACHEDIR.TAG"),
        "Signature: 8a477f597d28d172789f06886806bc55",
    )
    .unwrap();
    fs::write(cache.join("blob"), vec![0u8; 8192]).unwrap();

    let config = ScanConfig::builder().exclude_caches(true).build().unwrap();
    let t = scan(temp.path(), &config);
    let root = t.root().unwrap();

    let c = t.child_named(root, b"cache").unwrap();
    let f = t.entry(c).as_file().unwrap();
    assert!(f.excluded);
    assert!(!t.entry(c).is_dir());
    // Nothing below the tagged directory was descended into.
    assert_eq!(t.entry(root).as_dir().unwrap().items, 1);
}

#[test]
fn test_cachedir_tag_wrong_signature_is_kept() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    fs::create_dir(&cache).unwrap();
    fs::write(cache.join("CACHEDIR.TAG"), "not a signature").unwrap();

    let config = ScanConfig::builder().exclude_caches(true).build().unwrap();
    let t = scan(temp.path(), &config);
    let root = t.root().unwrap();
    let c = t.child_named(root, b"cache").unwrap();
    assert!(t.entry(c).is_dir());
}

#[test]
fn test_symlink_is_notreg_by_default() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("target"), vec![1u8; 1000]).unwrap();
    std::os::unix::fs::symlink("target", temp.path().join("ln")).unwrap();

    let t = scan_default(temp.path());
    let root = t.root().unwrap();
    let ln = t.child_named(root, b"ln").unwrap();
    assert!(t.entry(ln).as_file().unwrap().notreg);
    // Apparent size is the link's own, not the target's.
    assert_eq!(t.entry(ln).size, "target".len() as u64);
}

#[test]
fn test_follow_symlinks_takes_target_stat() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("target"), vec![1u8; 1000]).unwrap();
    std::os::unix::fs::symlink("target", temp.path().join("ln")).unwrap();
    // Directory targets stay unfollowed.
    fs::create_dir(temp.path().join("sub")).unwrap();
    std::os::unix::fs::symlink("sub", temp.path().join("dln")).unwrap();

    let config = ScanConfig::builder().follow_symlinks(true).build().unwrap();
    let t = scan(temp.path(), &config);
    let root = t.root().unwrap();

    let ln = t.child_named(root, b"ln").unwrap();
    assert_eq!(t.entry(ln).size, 1000);
    assert!(!t.entry(ln).as_file().unwrap().notreg);

    let dln = t.child_named(root, b"dln").unwrap();
    assert!(!t.entry(dln).is_dir());
    assert!(t.entry(dln).as_file().unwrap().notreg);
}

#[test]
fn test_extended_metadata_capture() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("f");
    fs::write(&file, "x").unwrap();
    let meta = fs::metadata(&file).unwrap();

    let config = ScanConfig::builder().extended(true).build().unwrap();
    let t = scan(temp.path(), &config);
    let root = t.root().unwrap();
    let f = t.child_named(root, b"f").unwrap();

    let ext = t.entry(f).ext.unwrap();
    assert_eq!(ext.mtime, meta.mtime().max(0) as u64);
    assert_eq!(ext.uid, meta.uid());
    assert_eq!(ext.gid, meta.gid());
    assert_eq!(ext.mode, meta.mode() as u16);
}

#[test]
fn test_non_utf8_names_survive() {
    let temp = TempDir::new().unwrap();
    let name = std::ffi::OsStr::from_bytes(b"caf\xe9.txt");
    fs::write(temp.path().join(name), "x").unwrap();

    let t = scan_default(temp.path());
    let root = t.root().unwrap();
    assert!(t.child_named(root, b"caf\xe9.txt").is_some());
}

#[test]
fn test_unreadable_dir_sets_suberr() {
    use std::os::unix::fs::PermissionsExt;

    // Dropping permissions has no effect when running as root.
    if unsafe { libc::geteuid() } == 0 {
        return;
    }

    let temp = TempDir::new().unwrap();
    let locked = temp.path().join("locked");
    fs::create_dir(&locked).unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

    let t = scan_default(temp.path());
    let root = t.root().unwrap();
    let l = t.child_named(root, b"locked").unwrap();
    assert!(t.entry(l).has_err());
    assert!(t.entry(root).as_dir().unwrap().suberr);

    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
}
