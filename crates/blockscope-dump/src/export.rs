//! Streaming JSON dump writer.
//!
//! The exporter is a [`Sink`]: the scanner pushes entries straight into
//! it and the dump is written as the scan progresses, so the full tree is
//! never materialized. Names are emitted byte-verbatim: bytes >= 0x20
//! pass through unescaped even when they are not valid UTF-8, which is a
//! deliberate deviation from strict JSON to keep filenames byte-exact.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use blockscope_core::util::blocks_to_bytes;
use blockscope_core::{Sink, Special, Stat};

/// Format version written in the dump header.
pub const FORMAT_MAJOR: u64 = 1;
pub const FORMAT_MINOR: u64 = 2;

/// Sink that streams the `[1,2,{metadata},rootElement]` dump document.
///
/// I/O errors are latched on first occurrence; subsequent sink calls
/// become no-ops and [`JsonExporter::finish`] reports the error.
pub struct JsonExporter<W: Write> {
    out: W,
    pending_name: Vec<u8>,
    /// Device of each open directory, for delta-encoding `dev`.
    dev_stack: Vec<u64>,
    last_dir_dev: u64,
    /// The most recent directory object still awaits its closing brace,
    /// so a listing error can be appended to it.
    obj_open: bool,
    error: Option<io::Error>,
}

impl<W: Write> JsonExporter<W> {
    /// Write the dump header and return the exporter.
    pub fn new(out: W) -> io::Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut exporter = Self {
            out,
            pending_name: Vec::new(),
            dev_stack: Vec::new(),
            last_dir_dev: 0,
            obj_open: false,
            error: None,
        };
        write!(
            exporter.out,
            "[{},{},{{\"progname\":\"blockscope\",\"progver\":\"{}\",\"timestamp\":{}}}",
            FORMAT_MAJOR,
            FORMAT_MINOR,
            env!("CARGO_PKG_VERSION"),
            timestamp
        )?;
        Ok(exporter)
    }

    /// Close the document and flush. Returns the latched error, if any.
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.out.write_all(b"]\n")?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn latch(&mut self, f: impl FnOnce(&mut Self) -> io::Result<()>) {
        if self.error.is_none() {
            if let Err(e) = f(self) {
                self.error = Some(e);
            }
        }
    }

    fn close_obj(&mut self) -> io::Result<()> {
        if self.obj_open {
            self.out.write_all(b"}")?;
            self.obj_open = false;
        }
        Ok(())
    }

    fn begin_element(&mut self) -> io::Result<()> {
        self.close_obj()?;
        self.out.write_all(b",\n")
    }

    fn write_stat(&mut self, stat: &Stat) -> io::Result<()> {
        self.begin_element()?;
        if stat.is_dir {
            self.out.write_all(b"[")?;
        }
        self.out.write_all(b"{\"name\":")?;
        let name = std::mem::take(&mut self.pending_name);
        write_string(&mut self.out, &name)?;
        self.pending_name = name;

        write!(
            self.out,
            ",\"asize\":{},\"dsize\":{}",
            stat.size,
            blocks_to_bytes(stat.blocks)
        )?;
        if stat.is_dir && self.dev_stack.last() != Some(&stat.dev) {
            write!(self.out, ",\"dev\":{}", stat.dev)?;
        }
        if stat.hlinkc {
            write!(
                self.out,
                ",\"ino\":{},\"hlnkc\":true,\"nlink\":{}",
                stat.ino, stat.nlink
            )?;
        }
        if !stat.is_dir && !stat.is_reg {
            self.out.write_all(b",\"notreg\":true")?;
        }
        if let Some(ext) = stat.ext {
            write!(
                self.out,
                ",\"uid\":{},\"gid\":{},\"mode\":{},\"mtime\":{}",
                ext.uid, ext.gid, ext.mode, ext.mtime
            )?;
        }
        if stat.is_dir {
            self.obj_open = true;
            self.last_dir_dev = stat.dev;
        } else {
            self.out.write_all(b"}")?;
        }
        Ok(())
    }

    fn write_special(&mut self, special: Special) -> io::Result<()> {
        self.begin_element()?;
        self.out.write_all(b"{\"name\":")?;
        let name = std::mem::take(&mut self.pending_name);
        write_string(&mut self.out, &name)?;
        self.pending_name = name;
        match special {
            Special::Err => self.out.write_all(b",\"read_error\":true}"),
            Special::OtherFs => self.out.write_all(b",\"excluded\":\"othfs\"}"),
            Special::KernFs => self.out.write_all(b",\"excluded\":\"kernfs\"}"),
            Special::Excluded => self.out.write_all(b",\"excluded\":\"pattern\"}"),
        }
    }
}

impl<W: Write> Sink for JsonExporter<W> {
    fn push_name(&mut self, name: &[u8]) {
        self.pending_name.clear();
        self.pending_name.extend_from_slice(name);
    }

    fn set_stat(&mut self, stat: &Stat) {
        let stat = *stat;
        self.latch(|this| this.write_stat(&stat));
    }

    fn set_special(&mut self, special: Special) {
        self.latch(|this| this.write_special(special));
    }

    fn enter_dir(&mut self) {
        let dev = self.last_dir_dev;
        self.dev_stack.push(dev);
    }

    fn leave_dir(&mut self) {
        self.latch(|this| {
            this.close_obj()?;
            this.out.write_all(b"]")
        });
        self.dev_stack.pop();
    }

    fn listing_error(&mut self) {
        self.latch(|this| {
            if this.obj_open {
                this.out.write_all(b",\"read_error\":true")?;
            }
            Ok(())
        });
    }
}

/// Write a dump string: the five named escapes, `\uXXXX` for remaining
/// control bytes and DEL, everything else verbatim.
fn write_string<W: Write>(out: &mut W, s: &[u8]) -> io::Result<()> {
    out.write_all(b"\"")?;
    for &c in s {
        match c {
            b'"' => out.write_all(b"\\\"")?,
            b'\\' => out.write_all(b"\\\\")?,
            0x08 => out.write_all(b"\\b")?,
            b'\t' => out.write_all(b"\\t")?,
            b'\n' => out.write_all(b"\\n")?,
            0x0c => out.write_all(b"\\f")?,
            b'\r' => out.write_all(b"\\r")?,
            0x00..=0x1f | 0x7f => write!(out, "\\u{c:04x}")?,
            _ => out.write_all(&[c])?,
        }
    }
    out.write_all(b"\"")
}
