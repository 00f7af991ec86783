//! Recursive-descent reader for the JSON dump format.
//!
//! A bespoke parser rather than an off-the-shelf one: dump strings may
//! carry raw non-UTF-8 bytes, and names are parsed into a bounded buffer
//! instead of materializing arbitrary string values. The parser drives
//! the same [`Sink`] interface as the scanner.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use blockscope_core::util::{clamp_nlink, truncate_mode, MAX_BLOCKS};
use blockscope_core::{Ext, Sink, Special, Stat};

use crate::reader::ByteReader;

/// Names longer than this are rejected.
const MAX_NAME_LEN: usize = 32 * 1024;

/// Errors raised while reading a dump.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("read error: {0}")]
    Io(#[from] io::Error),

    /// Malformed input, with a 1-based position.
    #[error("parse error at {line}:{col}: {message}")]
    Parse {
        line: u32,
        col: u32,
        message: String,
    },

    /// The dump was written by an incompatible major format version.
    #[error("unsupported dump format version {major}")]
    UnsupportedVersion { major: u64 },
}

/// Read a dump from `path`, `-` meaning stdin, into `sink`.
pub fn import_file<S: Sink>(path: &Path, sink: &mut S) -> Result<(), ImportError> {
    if path == Path::new("-") {
        import_root(io::stdin().lock(), sink)
    } else {
        import_root(File::open(path)?, sink)
    }
}

/// Parse a dump document from `input` and replay it into `sink`.
pub fn import_root<R: Read, S: Sink>(input: R, sink: &mut S) -> Result<(), ImportError> {
    Parser::new(input).run(sink)
}

/// Attribute keys the format defines; anything else is skipped.
enum Key {
    Name,
    Asize,
    Dsize,
    Dev,
    Ino,
    Hlnkc,
    Nlink,
    Notreg,
    Excluded,
    ReadError,
    Uid,
    Gid,
    Mode,
    Mtime,
    Unknown,
}

/// Attributes staged while parsing one item object.
#[derive(Default)]
struct ItemData {
    name: Vec<u8>,
    have_name: bool,
    asize: u64,
    dsize: u64,
    dev: Option<u64>,
    ino: u64,
    hlnkc: bool,
    nlink: u32,
    notreg: bool,
    read_error: bool,
    excluded: Option<Special>,
    uid: Option<u32>,
    gid: Option<u32>,
    mode: Option<u16>,
    mtime: Option<u64>,
}

impl ItemData {
    fn stat(&self, is_dir: bool, dev: u64) -> Stat {
        Stat {
            is_dir,
            is_reg: !self.notreg,
            hlinkc: self.hlnkc && !is_dir,
            blocks: (self.dsize >> 9).min(MAX_BLOCKS),
            size: self.asize,
            dev,
            ino: self.ino,
            nlink: self.nlink,
            ext: self.ext(),
        }
    }

    fn ext(&self) -> Option<Ext> {
        if self.uid.is_none() && self.gid.is_none() && self.mode.is_none() && self.mtime.is_none()
        {
            return None;
        }
        Some(Ext {
            mtime: self.mtime.unwrap_or(0),
            uid: self.uid.unwrap_or(0),
            gid: self.gid.unwrap_or(0),
            mode: self.mode.unwrap_or(0),
        })
    }
}

struct Parser<R> {
    r: ByteReader<R>,
    /// Device of each open directory; items without a `dev` attribute
    /// inherit the innermost one.
    dev_stack: Vec<u64>,
}

impl<R: Read> Parser<R> {
    fn new(input: R) -> Self {
        Self {
            r: ByteReader::new(input),
            dev_stack: Vec::new(),
        }
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T, ImportError> {
        Err(ImportError::Parse {
            line: self.r.line(),
            col: self.r.col(),
            message: message.into(),
        })
    }

    fn run<S: Sink>(&mut self, sink: &mut S) -> Result<(), ImportError> {
        self.expect(b'[')?;
        let major = self.parse_uint()?;
        if major != 1 {
            return Err(ImportError::UnsupportedVersion { major });
        }
        self.expect(b',')?;
        // Minor versions above ours only add attributes, which we skip.
        let minor = self.parse_uint()?;
        debug!(major, minor, "reading dump");
        self.expect(b',')?;
        self.skip_ws()?;
        if self.r.peek()? != Some(b'{') {
            return self.err("expected metadata object");
        }
        self.skip_value()?;
        self.expect(b',')?;
        self.skip_ws()?;
        if self.r.peek()? != Some(b'[') {
            return self.err("root item must be a directory");
        }
        self.parse_element(sink)?;

        // Trailing elements after the root are reserved for future format
        // versions; read and discard them.
        loop {
            self.skip_ws()?;
            match self.r.next()? {
                Some(b',') => self.skip_value()?,
                Some(b']') => return Ok(()),
                Some(c) => return self.err(unexpected(c)),
                None => return self.err("unexpected end of input"),
            }
        }
    }

    fn parse_element<S: Sink>(&mut self, sink: &mut S) -> Result<(), ImportError> {
        self.skip_ws()?;
        match self.r.peek()? {
            Some(b'[') => {
                self.r.next()?;
                self.expect(b'{')?;
                let item = self.parse_item_object()?;
                sink.push_name(&item.name);
                if let Some(special) = item.excluded {
                    sink.set_special(special);
                    // A pruned directory keeps no children.
                    self.skip_dir_tail()?;
                    return Ok(());
                }
                let dev = item.dev.unwrap_or_else(|| self.current_dev());
                sink.set_stat(&item.stat(true, dev));
                sink.enter_dir();
                if item.read_error {
                    sink.listing_error();
                }
                self.dev_stack.push(dev);
                loop {
                    self.skip_ws()?;
                    match self.r.next()? {
                        Some(b',') => self.parse_element(sink)?,
                        Some(b']') => break,
                        Some(c) => return self.err(unexpected(c)),
                        None => return self.err("unexpected end of input"),
                    }
                }
                self.dev_stack.pop();
                sink.leave_dir();
                Ok(())
            }
            Some(b'{') => {
                self.r.next()?;
                let item = self.parse_item_object()?;
                sink.push_name(&item.name);
                if let Some(special) = item.excluded {
                    sink.set_special(special);
                } else if item.read_error {
                    sink.set_special(Special::Err);
                } else {
                    let dev = item.dev.unwrap_or_else(|| self.current_dev());
                    sink.set_stat(&item.stat(false, dev));
                }
                Ok(())
            }
            Some(c) => self.err(unexpected(c)),
            None => self.err("unexpected end of input"),
        }
    }

    fn current_dev(&self) -> u64 {
        self.dev_stack.last().copied().unwrap_or(0)
    }

    /// Consume the remaining children and closing bracket of a directory
    /// element whose contents are discarded.
    fn skip_dir_tail(&mut self) -> Result<(), ImportError> {
        loop {
            self.skip_ws()?;
            match self.r.next()? {
                Some(b',') => self.skip_value()?,
                Some(b']') => return Ok(()),
                Some(c) => return self.err(unexpected(c)),
                None => return self.err("unexpected end of input"),
            }
        }
    }

    fn parse_item_object(&mut self) -> Result<ItemData, ImportError> {
        let mut item = ItemData::default();
        self.skip_ws()?;
        if self.r.peek()? == Some(b'}') {
            return self.err("item without a name");
        }
        loop {
            self.skip_ws()?;
            let key = self.parse_key()?;
            self.expect(b':')?;
            match key {
                Key::Name => {
                    if item.have_name {
                        return self.err("duplicate \"name\"");
                    }
                    self.parse_string(&mut item.name, MAX_NAME_LEN)?;
                    item.have_name = true;
                }
                Key::Asize => item.asize = self.parse_uint()?,
                Key::Dsize => item.dsize = self.parse_uint()?,
                Key::Dev => item.dev = Some(self.parse_uint()?),
                Key::Ino => item.ino = self.parse_uint()?,
                Key::Hlnkc => item.hlnkc = self.parse_bool()?,
                Key::Nlink => item.nlink = clamp_nlink(self.parse_uint()?),
                Key::Notreg => item.notreg = self.parse_bool()?,
                Key::ReadError => item.read_error = self.parse_bool()?,
                Key::Excluded => {
                    let mut tag = Vec::new();
                    self.parse_string(&mut tag, 32)?;
                    item.excluded = Some(match tag.as_slice() {
                        b"othfs" | b"otherfs" => Special::OtherFs,
                        b"kernfs" => Special::KernFs,
                        _ => Special::Excluded,
                    });
                }
                Key::Uid => item.uid = Some(self.parse_uint()?.min(u32::MAX as u64) as u32),
                Key::Gid => item.gid = Some(self.parse_uint()?.min(u32::MAX as u64) as u32),
                Key::Mode => item.mode = Some(truncate_mode(self.parse_uint()? as u32)),
                Key::Mtime => item.mtime = Some(self.parse_uint()?),
                Key::Unknown => self.skip_value()?,
            }
            self.skip_ws()?;
            match self.r.next()? {
                Some(b',') => continue,
                Some(b'}') => break,
                Some(c) => return self.err(unexpected(c)),
                None => return self.err("unexpected end of input"),
            }
        }
        if !item.have_name {
            return self.err("item without a name");
        }
        Ok(item)
    }

    /// Parse an attribute key into its dispatch tag. Keys longer than any
    /// known key, or containing escapes, are unknown by construction.
    fn parse_key(&mut self) -> Result<Key, ImportError> {
        let mut buf = [0u8; 16];
        let mut len = 0;
        let mut unknown = false;
        self.expect(b'"')?;
        loop {
            let Some(c) = self.r.next()? else {
                return self.err("unterminated string");
            };
            match c {
                b'"' => break,
                b'\\' => {
                    self.r.next()?;
                    unknown = true;
                }
                _ => {
                    if len < buf.len() {
                        buf[len] = c;
                        len += 1;
                    } else {
                        unknown = true;
                    }
                }
            }
        }
        if unknown {
            return Ok(Key::Unknown);
        }
        Ok(match &buf[..len] {
            b"name" => Key::Name,
            b"asize" => Key::Asize,
            b"dsize" => Key::Dsize,
            b"dev" => Key::Dev,
            b"ino" => Key::Ino,
            b"hlnkc" => Key::Hlnkc,
            b"nlink" => Key::Nlink,
            b"notreg" => Key::Notreg,
            b"excluded" => Key::Excluded,
            b"read_error" => Key::ReadError,
            b"uid" => Key::Uid,
            b"gid" => Key::Gid,
            b"mode" => Key::Mode,
            b"mtime" => Key::Mtime,
            _ => Key::Unknown,
        })
    }

    /// Parse a string value into `buf`, enforcing `cap`. Raw bytes 0x20
    /// and above are accepted verbatim even when not valid UTF-8.
    fn parse_string(&mut self, buf: &mut Vec<u8>, cap: usize) -> Result<(), ImportError> {
        self.expect(b'"')?;
        buf.clear();
        loop {
            let Some(c) = self.r.next()? else {
                return self.err("unterminated string");
            };
            match c {
                b'"' => return Ok(()),
                b'\\' => {
                    let Some(e) = self.r.next()? else {
                        return self.err("unterminated string");
                    };
                    match e {
                        b'"' | b'\\' | b'/' => buf.push(e),
                        b'b' => buf.push(0x08),
                        b'f' => buf.push(0x0c),
                        b'n' => buf.push(b'\n'),
                        b'r' => buf.push(b'\r'),
                        b't' => buf.push(b'\t'),
                        b'u' => {
                            let cp = self.parse_codepoint()?;
                            let mut utf8 = [0u8; 4];
                            buf.extend_from_slice(cp.encode_utf8(&mut utf8).as_bytes());
                        }
                        _ => return self.err("invalid escape"),
                    }
                }
                0x00..=0x1f => return self.err("bad character in string"),
                _ => buf.push(c),
            }
            if buf.len() > cap {
                return self.err("string too long");
            }
        }
    }

    /// Parse the `XXXX` of a `\uXXXX` escape, combining surrogate pairs.
    fn parse_codepoint(&mut self) -> Result<char, ImportError> {
        let hi = self.parse_hex4()?;
        let cp = if (0xd800..0xdc00).contains(&hi) {
            if self.r.next()? != Some(b'\\') || self.r.next()? != Some(b'u') {
                return self.err("unpaired surrogate");
            }
            let lo = self.parse_hex4()?;
            if !(0xdc00..0xe000).contains(&lo) {
                return self.err("unpaired surrogate");
            }
            0x10000 + ((hi - 0xd800) << 10) + (lo - 0xdc00)
        } else if (0xdc00..0xe000).contains(&hi) {
            return self.err("unpaired surrogate");
        } else {
            hi
        };
        match char::from_u32(cp) {
            Some(c) => Ok(c),
            None => self.err("invalid unicode escape"),
        }
    }

    fn parse_hex4(&mut self) -> Result<u32, ImportError> {
        let mut v: u32 = 0;
        for _ in 0..4 {
            let Some(c) = self.r.next()? else {
                return self.err("unterminated string");
            };
            let d = match c {
                b'0'..=b'9' => c - b'0',
                b'a'..=b'f' => c - b'a' + 10,
                b'A'..=b'F' => c - b'A' + 10,
                _ => return self.err("invalid unicode escape"),
            };
            v = v * 16 + d as u32;
        }
        Ok(v)
    }

    /// Parse an unsigned integer, rejecting overflow. A fractional or
    /// exponent tail is consumed and discarded (mtimes may carry one).
    fn parse_uint(&mut self) -> Result<u64, ImportError> {
        self.skip_ws()?;
        let mut v: u64 = 0;
        let mut any = false;
        while let Some(c) = self.r.peek()? {
            if !c.is_ascii_digit() {
                break;
            }
            self.r.next()?;
            any = true;
            v = match v
                .checked_mul(10)
                .and_then(|x| x.checked_add((c - b'0') as u64))
            {
                Some(v) => v,
                None => return self.err("number out of range"),
            };
        }
        if !any {
            return self.err("expected a number");
        }
        if self.r.peek()? == Some(b'.') {
            self.r.next()?;
            while self.r.peek()?.is_some_and(|c| c.is_ascii_digit()) {
                self.r.next()?;
            }
        }
        if matches!(self.r.peek()?, Some(b'e' | b'E')) {
            self.r.next()?;
            if matches!(self.r.peek()?, Some(b'+' | b'-')) {
                self.r.next()?;
            }
            while self.r.peek()?.is_some_and(|c| c.is_ascii_digit()) {
                self.r.next()?;
            }
        }
        Ok(v)
    }

    fn parse_bool(&mut self) -> Result<bool, ImportError> {
        self.skip_ws()?;
        match self.r.peek()? {
            Some(b't') => {
                self.parse_literal(b"true")?;
                Ok(true)
            }
            Some(b'f') => {
                self.parse_literal(b"false")?;
                Ok(false)
            }
            _ => self.err("expected a boolean"),
        }
    }

    fn parse_literal(&mut self, lit: &[u8]) -> Result<(), ImportError> {
        for &want in lit {
            if self.r.next()? != Some(want) {
                return self.err("invalid literal");
            }
        }
        Ok(())
    }

    /// Structurally consume any JSON value, without materializing it.
    fn skip_value(&mut self) -> Result<(), ImportError> {
        self.skip_ws()?;
        match self.r.peek()? {
            Some(b'"') => self.skip_string(),
            Some(b'{') => {
                self.r.next()?;
                self.skip_ws()?;
                if self.r.peek()? == Some(b'}') {
                    self.r.next()?;
                    return Ok(());
                }
                loop {
                    self.skip_ws()?;
                    self.skip_string()?;
                    self.expect(b':')?;
                    self.skip_value()?;
                    self.skip_ws()?;
                    match self.r.next()? {
                        Some(b',') => continue,
                        Some(b'}') => return Ok(()),
                        Some(c) => return self.err(unexpected(c)),
                        None => return self.err("unexpected end of input"),
                    }
                }
            }
            Some(b'[') => {
                self.r.next()?;
                self.skip_ws()?;
                if self.r.peek()? == Some(b']') {
                    self.r.next()?;
                    return Ok(());
                }
                loop {
                    self.skip_value()?;
                    self.skip_ws()?;
                    match self.r.next()? {
                        Some(b',') => continue,
                        Some(b']') => return Ok(()),
                        Some(c) => return self.err(unexpected(c)),
                        None => return self.err("unexpected end of input"),
                    }
                }
            }
            Some(b't') => self.parse_literal(b"true"),
            Some(b'f') => self.parse_literal(b"false"),
            Some(b'n') => self.parse_literal(b"null"),
            Some(c) if c.is_ascii_digit() || c == b'-' => {
                while self
                    .r
                    .peek()?
                    .is_some_and(|c| c.is_ascii_digit() || matches!(c, b'-' | b'+' | b'.' | b'e' | b'E'))
                {
                    self.r.next()?;
                }
                Ok(())
            }
            Some(c) => self.err(unexpected(c)),
            None => self.err("unexpected end of input"),
        }
    }

    /// Consume a string without buffering it.
    fn skip_string(&mut self) -> Result<(), ImportError> {
        self.expect(b'"')?;
        loop {
            match self.r.next()? {
                Some(b'"') => return Ok(()),
                Some(b'\\') => {
                    self.r.next()?;
                }
                Some(_) => {}
                None => return self.err("unterminated string"),
            }
        }
    }

    fn skip_ws(&mut self) -> Result<(), ImportError> {
        while matches!(self.r.peek()?, Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.r.next()?;
        }
        Ok(())
    }

    fn expect(&mut self, want: u8) -> Result<(), ImportError> {
        self.skip_ws()?;
        match self.r.next()? {
            Some(c) if c == want => Ok(()),
            Some(c) => self.err(format!("expected '{}', found {}", want as char, found(c))),
            None => self.err(format!("expected '{}', found end of input", want as char)),
        }
    }
}

fn unexpected(c: u8) -> String {
    format!("unexpected {}", found(c))
}

fn found(c: u8) -> String {
    if c.is_ascii_graphic() {
        format!("'{}'", c as char)
    } else {
        format!("byte 0x{c:02x}")
    }
}
