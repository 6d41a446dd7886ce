//! On-disk layout of a method trace.
//!
//! A trace file starts with a text key naming the threads and methods that
//! appear in it, terminated by `*end`. The binary part follows: a fixed
//! 32-byte header and `entries` records of [`RECORD_LEN`] bytes each, all
//! little endian.

use std::io::{self, Write};

use thiserror::Error;

use crate::{MethodId, ThreadId};

pub const TRACE_MAGIC: u32 = 0x574f_4c53;
pub const TRACE_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 32;
pub const RECORD_LEN: usize = 9;
pub const TOKEN_CHAR: char = '*';

/// The two low bits of an encoded method word.
pub const METHOD_ACTION_MASK: u32 = 0b11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MethodAction {
    Enter = 0,
    Exit = 1,
    /// Method left by exception unwinding.
    Unwind = 2,
}

impl MethodAction {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits & METHOD_ACTION_MASK {
            0 => Some(MethodAction::Enter),
            1 => Some(MethodAction::Exit),
            2 => Some(MethodAction::Unwind),
            _ => None,
        }
    }
}

#[inline]
pub fn combine(method: MethodId, action: MethodAction) -> u32 {
    (method.raw() & !METHOD_ACTION_MASK) | action as u32
}

#[inline]
pub fn method_id(encoded: u32) -> MethodId {
    MethodId::from_raw(encoded & !METHOD_ACTION_MASK)
}

#[inline]
pub fn method_action(encoded: u32) -> u32 {
    encoded & METHOD_ACTION_MASK
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("trace key is missing the `{0}` section")]
    MissingSection(&'static str),
    #[error("malformed key line: {0:?}")]
    MalformedKey(String),
    #[error("bad trace magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported trace version {0}")]
    UnsupportedVersion(u16),
    #[error("trace data truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("record {index} carries reserved action bits")]
    ReservedAction { index: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadEntry {
    pub id: ThreadId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodEntry {
    pub id: MethodId,
    pub class: String,
    pub name: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
    pub version: u16,
    /// Microseconds since the UNIX epoch.
    pub start_usec: u64,
    pub overflow: u32,
    pub entries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub thread: ThreadId,
    pub method: MethodId,
    pub action: MethodAction,
    /// Microseconds since the session started.
    pub elapsed_usec: u32,
}

/// A fully decoded trace file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFile {
    pub overflowed: bool,
    pub threads: Vec<ThreadEntry>,
    pub methods: Vec<MethodEntry>,
    pub header: TraceHeader,
    pub records: Vec<TraceRecord>,
}

impl TraceHeader {
    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&TRACE_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
        buf[8..16].copy_from_slice(&self.start_usec.to_le_bytes());
        buf[16..20].copy_from_slice(&self.overflow.to_le_bytes());
        buf[20..24].copy_from_slice(&self.entries.to_le_bytes());
        out.write_all(&buf)
    }

    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), FormatError> {
        if bytes.len() < 8 {
            return Err(FormatError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        let magic = read_u32(bytes, 0);
        if magic != TRACE_MAGIC {
            return Err(FormatError::BadMagic(magic));
        }
        let version = read_u16(bytes, 4);
        if version != TRACE_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let header_len = read_u16(bytes, 6) as usize;
        if header_len < 24 || bytes.len() < header_len {
            return Err(FormatError::Truncated {
                needed: header_len.max(24),
                available: bytes.len(),
            });
        }
        let header = Self {
            version,
            start_usec: read_u64(bytes, 8),
            overflow: read_u32(bytes, 16),
            entries: read_u32(bytes, 20),
        };
        Ok((header, header_len))
    }
}

impl TraceRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0] = self.thread.0;
        buf[1..5].copy_from_slice(&combine(self.method, self.action).to_le_bytes());
        buf[5..9].copy_from_slice(&self.elapsed_usec.to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8], index: usize) -> Result<Self, FormatError> {
        let encoded = read_u32(bytes, 1);
        let action = MethodAction::from_bits(encoded)
            .ok_or(FormatError::ReservedAction { index })?;
        Ok(Self {
            thread: ThreadId(bytes[0]),
            method: method_id(encoded),
            action,
            elapsed_usec: read_u32(bytes, 5),
        })
    }
}

/// Write the text key that precedes the binary data.
pub fn write_key(
    out: &mut impl Write,
    overflow: u32,
    threads: &[ThreadEntry],
    methods: &[MethodEntry],
) -> io::Result<()> {
    writeln!(out, "{TOKEN_CHAR}version")?;
    writeln!(out, "{TRACE_VERSION}")?;
    writeln!(out, "data-file-overflow={}", overflow != 0)?;
    writeln!(out, "overflow-count={overflow}")?;
    writeln!(out, "clock=global")?;
    writeln!(out, "vm=regvm")?;
    writeln!(out, "{TOKEN_CHAR}threads")?;
    for thread in threads {
        writeln!(out, "{}\t{}", thread.id.0, thread.name)?;
    }
    writeln!(out, "{TOKEN_CHAR}methods")?;
    for method in methods {
        writeln!(
            out,
            "{:#010x}\t{}\t{}\t{}",
            method.id.raw(),
            method.class,
            method.name,
            method.signature
        )?;
    }
    writeln!(out, "{TOKEN_CHAR}end")
}

impl TraceFile {
    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        write_key(out, self.header.overflow, &self.threads, &self.methods)?;
        self.header.write_to(out)?;
        for record in &self.records {
            out.write_all(&record.encode())?;
        }
        Ok(())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut overflowed = false;
        let mut threads = Vec::new();
        let mut methods = Vec::new();

        #[derive(PartialEq)]
        enum Section {
            None,
            Version,
            Threads,
            Methods,
        }
        let mut section = Section::None;
        let mut pos = 0;
        let mut saw_version = false;
        let mut saw_end = false;

        while pos < bytes.len() {
            let line_end = bytes[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|n| pos + n)
                .ok_or(FormatError::MissingSection("end"))?;
            let line = String::from_utf8_lossy(&bytes[pos..line_end]).into_owned();
            pos = line_end + 1;

            if let Some(token) = line.strip_prefix(TOKEN_CHAR) {
                section = match token {
                    "version" => {
                        saw_version = true;
                        Section::Version
                    }
                    "threads" => Section::Threads,
                    "methods" => Section::Methods,
                    "end" => {
                        saw_end = true;
                        break;
                    }
                    _ => return Err(FormatError::MalformedKey(line)),
                };
                continue;
            }

            match section {
                Section::None => return Err(FormatError::MissingSection("version")),
                Section::Version => {
                    if let Some(value) = line.strip_prefix("data-file-overflow=") {
                        overflowed = value == "true";
                    }
                }
                Section::Threads => {
                    let (id, name) = line
                        .split_once('\t')
                        .ok_or_else(|| FormatError::MalformedKey(line.clone()))?;
                    let id = id
                        .parse::<u8>()
                        .map_err(|_| FormatError::MalformedKey(line.clone()))?;
                    threads.push(ThreadEntry {
                        id: ThreadId(id),
                        name: name.to_string(),
                    });
                }
                Section::Methods => {
                    let mut fields = line.split('\t');
                    let (Some(id), Some(class), Some(name), Some(signature)) =
                        (fields.next(), fields.next(), fields.next(), fields.next())
                    else {
                        return Err(FormatError::MalformedKey(line));
                    };
                    let id = id
                        .strip_prefix("0x")
                        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                        .ok_or_else(|| FormatError::MalformedKey(line.clone()))?;
                    methods.push(MethodEntry {
                        id: MethodId::from_raw(id),
                        class: class.to_string(),
                        name: name.to_string(),
                        signature: signature.to_string(),
                    });
                }
            }
        }

        if !saw_version {
            return Err(FormatError::MissingSection("version"));
        }
        if !saw_end {
            return Err(FormatError::MissingSection("end"));
        }

        let data = &bytes[pos..];
        let (header, header_len) = TraceHeader::parse(data)?;
        let needed = header_len + header.entries as usize * RECORD_LEN;
        if data.len() < needed {
            return Err(FormatError::Truncated {
                needed,
                available: data.len(),
            });
        }

        let records = data[header_len..needed]
            .chunks_exact(RECORD_LEN)
            .enumerate()
            .map(|(index, chunk)| TraceRecord::decode(chunk, index))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            overflowed,
            threads,
            methods,
            header,
            records,
        })
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodEntry> {
        self.methods.iter().find(|m| m.id == id)
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_occupies_the_low_two_bits() {
        let id = MethodId::from_raw(0x1234_5670);
        let encoded = combine(id, MethodAction::Unwind);
        assert_eq!(encoded, 0x1234_5672);
        assert_eq!(method_id(encoded), id);
        assert_eq!(method_action(encoded), 2);
        assert_eq!(MethodAction::from_bits(3), None);
    }

    #[test]
    fn header_layout_is_fixed() {
        let header = TraceHeader {
            version: TRACE_VERSION,
            start_usec: 0x0102_0304_0506_0708,
            overflow: 7,
            entries: 3,
        };
        let mut out = Vec::new();
        header.write_to(&mut out).unwrap();

        assert_eq!(out.len(), HEADER_LEN);
        assert_eq!(&out[0..4], b"SLOW");
        assert_eq!(&out[4..8], &[1, 0, 32, 0]);
        assert_eq!(&out[16..20], &[7, 0, 0, 0]);
        assert!(out[24..].iter().all(|&b| b == 0));
        assert_eq!(TraceHeader::parse(&out).unwrap(), (header, HEADER_LEN));
    }

    #[test]
    fn record_layout_is_nine_bytes() {
        let record = TraceRecord {
            thread: ThreadId(3),
            method: MethodId::from_raw(0x10),
            action: MethodAction::Exit,
            elapsed_usec: 0x0a0b_0c0d,
        };
        assert_eq!(record.encode(), [3, 0x11, 0, 0, 0, 0x0d, 0x0c, 0x0b, 0x0a]);
    }

    #[test]
    fn parses_key_and_records() {
        let file = TraceFile {
            overflowed: false,
            threads: vec![ThreadEntry {
                id: ThreadId(1),
                name: "main".into(),
            }],
            methods: vec![MethodEntry {
                id: MethodId::from_raw(0x8),
                class: "LDemo;".into(),
                name: "run".into(),
                signature: "()V".into(),
            }],
            header: TraceHeader {
                version: TRACE_VERSION,
                start_usec: 99,
                overflow: 0,
                entries: 2,
            },
            records: vec![
                TraceRecord {
                    thread: ThreadId(1),
                    method: MethodId::from_raw(0x8),
                    action: MethodAction::Enter,
                    elapsed_usec: 1,
                },
                TraceRecord {
                    thread: ThreadId(1),
                    method: MethodId::from_raw(0x8),
                    action: MethodAction::Exit,
                    elapsed_usec: 5,
                },
            ],
        };
        let mut out = Vec::new();
        file.write_to(&mut out).unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("*version\n1\ndata-file-overflow=false\n"));
        assert!(text.contains("*methods\n0x00000008\tLDemo;\trun\t()V\n*end\n"));

        let parsed = TraceFile::parse(&out).unwrap();
        assert_eq!(parsed, file);
        assert_eq!(parsed.method(MethodId::from_raw(0x8)).unwrap().name, "run");
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let mut out = Vec::new();
        write_key(&mut out, 0, &[], &[]).unwrap();
        let key_len = out.len();
        out.extend_from_slice(b"NOPE0000");
        assert!(matches!(
            TraceFile::parse(&out),
            Err(FormatError::BadMagic(_))
        ));

        out.truncate(key_len);
        TraceHeader {
            version: TRACE_VERSION,
            start_usec: 0,
            overflow: 0,
            entries: 4,
        }
        .write_to(&mut out)
        .unwrap();
        assert!(matches!(
            TraceFile::parse(&out),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn reserved_action_is_rejected() {
        let mut out = Vec::new();
        write_key(&mut out, 0, &[], &[]).unwrap();
        TraceHeader {
            version: TRACE_VERSION,
            start_usec: 0,
            overflow: 0,
            entries: 1,
        }
        .write_to(&mut out)
        .unwrap();
        out.extend_from_slice(&[1, 0x13, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            TraceFile::parse(&out),
            Err(FormatError::ReservedAction { index: 0 })
        ));
    }
}
