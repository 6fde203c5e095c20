//! GGUF metadata reader
//!
//! Reads the header and key/value metadata of GGUF model and adapter files
//! without touching tensor data. Used for fast-fail validation before the
//! native loader runs, adapter architecture checks and `model_info`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Alignment of the tensor data section when the file does not declare one
pub const DEFAULT_ALIGNMENT: u32 = 32;

const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;
const MAX_ARRAY_LEN: u64 = 1 << 28;
const MAX_TENSOR_DIMS: u32 = 4;

/// Errors that can occur while reading GGUF files
#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,

    #[error("Unknown GGUF value type {0}")]
    UnknownValueType(u32),

    #[error("Corrupt GGUF metadata: {0}")]
    Corrupt(String),
}

/// Header fields of a GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// A single metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            GgufValue::U8(v) => Some(v as u64),
            GgufValue::U16(v) => Some(v as u64),
            GgufValue::U32(v) => Some(v as u64),
            GgufValue::U64(v) => Some(v),
            GgufValue::I8(v) if v >= 0 => Some(v as u64),
            GgufValue::I16(v) if v >= 0 => Some(v as u64),
            GgufValue::I32(v) if v >= 0 => Some(v as u64),
            GgufValue::I64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            GgufValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn fmt_scalar(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GgufValue::U8(v) => write!(f, "{v}"),
            GgufValue::I8(v) => write!(f, "{v}"),
            GgufValue::U16(v) => write!(f, "{v}"),
            GgufValue::I16(v) => write!(f, "{v}"),
            GgufValue::U32(v) => write!(f, "{v}"),
            GgufValue::I32(v) => write!(f, "{v}"),
            GgufValue::U64(v) => write!(f, "{v}"),
            GgufValue::I64(v) => write!(f, "{v}"),
            GgufValue::F32(v) => write!(f, "{v:.6}"),
            GgufValue::F64(v) => write!(f, "{v:.6}"),
            GgufValue::Bool(v) => write!(f, "{v}"),
            GgufValue::String(s) => f.write_str(s),
            GgufValue::Array(_) => f.write_str("???"),
        }
    }
}

/// Renders values the way llama.cpp prints metadata: strings raw, arrays
/// bracketed with quoted string elements, nested arrays elided.
impl fmt::Display for GgufValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GgufValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match item {
                        GgufValue::String(s) => {
                            write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))?
                        }
                        other => other.fmt_scalar(f)?,
                    }
                }
                f.write_str("]")
            }
            scalar => scalar.fmt_scalar(f),
        }
    }
}

/// Parsed metadata of a GGUF file
#[derive(Debug, Clone)]
pub struct GgufFile {
    pub header: GgufHeader,
    /// Metadata in file order
    pub metadata: Vec<(String, GgufValue)>,
    pub alignment: u32,
    /// Byte offset of the tensor data section
    pub data_offset: u64,
}

impl GgufFile {
    /// Reads header, metadata and tensor infos of the file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GgufError> {
        let file = File::open(path)?;
        let mut reader = CountingReader::new(BufReader::new(file));

        let header = read_header(&mut reader)?;
        let mut metadata = Vec::with_capacity(header.metadata_kv_count.min(4096) as usize);
        for _ in 0..header.metadata_kv_count {
            let key = reader.string()?;
            let type_id = reader.u32()?;
            let value = reader.value(type_id, 0)?;
            metadata.push((key, value));
        }

        let alignment = metadata
            .iter()
            .find(|(k, _)| k == "general.alignment")
            .and_then(|(_, v)| v.as_u64())
            .map(|a| a as u32)
            .filter(|a| *a > 0 && a.is_power_of_two())
            .unwrap_or(DEFAULT_ALIGNMENT);

        for _ in 0..header.tensor_count {
            reader.string()?;
            let n_dims = reader.u32()?;
            if n_dims > MAX_TENSOR_DIMS {
                return Err(GgufError::Corrupt(format!("tensor with {n_dims} dimensions")));
            }
            for _ in 0..n_dims {
                reader.u64()?;
            }
            reader.u32()?; // ggml type
            reader.u64()?; // offset
        }

        let align = alignment as u64;
        let data_offset = reader.pos.div_ceil(align) * align;

        Ok(Self {
            header,
            metadata,
            alignment,
            data_offset,
        })
    }

    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Value of `general.architecture`
    pub fn architecture(&self) -> Option<&str> {
        self.get("general.architecture").and_then(GgufValue::as_str)
    }
}

/// Validates that a file is a valid GGUF file and extracts its header.
///
/// # Arguments
/// * `path` - Path to the GGUF file
///
/// # Returns
/// * `Ok(GgufHeader)` - Header of a valid GGUF file
/// * `Err(GgufError)` - If the file is not a valid GGUF file
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let mut file = File::open(path)?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(GgufError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    read_header(&mut CountingReader::new(file))
}

/// Flattens GGUF metadata into display strings.
///
/// The map holds the file-level entries `version`, `alignment`, `data_offset`
/// and `kv_count` plus every metadata key not listed in `skip`.
pub fn model_info<P: AsRef<Path>>(
    path: P,
    skip: &[String],
) -> Result<BTreeMap<String, String>, GgufError> {
    let gguf = GgufFile::open(path)?;

    let mut info = BTreeMap::new();
    info.insert("version".to_string(), gguf.header.version.to_string());
    info.insert("alignment".to_string(), gguf.alignment.to_string());
    info.insert("data_offset".to_string(), gguf.data_offset.to_string());
    info.insert(
        "kv_count".to_string(),
        gguf.header.metadata_kv_count.to_string(),
    );

    for (key, value) in &gguf.metadata {
        if skip.iter().any(|s| s == key) {
            continue;
        }
        info.insert(key.clone(), value.to_string());
    }
    Ok(info)
}

fn read_header<R: Read>(reader: &mut CountingReader<R>) -> Result<GgufHeader, GgufError> {
    let magic = match reader.u32() {
        Ok(m) => m,
        Err(GgufError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(GgufError::FileTooSmall)
        }
        Err(e) => return Err(e),
    };
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic(magic));
    }

    // GGUF v2 and v3 are supported
    let version = reader.u32()?;
    if !(2..=3).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let tensor_count = reader.u64()?;
    let metadata_kv_count = reader.u64()?;

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

/// Little-endian reader that tracks its byte position
struct CountingReader<R> {
    inner: R,
    pos: u64,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, pos: 0 }
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], GgufError> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        self.pos += N as u64;
        Ok(buf)
    }

    fn u32(&mut self) -> Result<u32, GgufError> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> Result<u64, GgufError> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn string(&mut self) -> Result<String, GgufError> {
        let len = self.u64()?;
        if len > MAX_STRING_LEN {
            return Err(GgufError::Corrupt(format!("string of {len} bytes")));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        self.pos += len;
        String::from_utf8(buf).map_err(|e| GgufError::Corrupt(e.to_string()))
    }

    fn value(&mut self, type_id: u32, depth: u8) -> Result<GgufValue, GgufError> {
        Ok(match type_id {
            0 => GgufValue::U8(u8::from_le_bytes(self.bytes()?)),
            1 => GgufValue::I8(i8::from_le_bytes(self.bytes()?)),
            2 => GgufValue::U16(u16::from_le_bytes(self.bytes()?)),
            3 => GgufValue::I16(i16::from_le_bytes(self.bytes()?)),
            4 => GgufValue::U32(self.u32()?),
            5 => GgufValue::I32(i32::from_le_bytes(self.bytes()?)),
            6 => GgufValue::F32(f32::from_le_bytes(self.bytes()?)),
            7 => {
                let [b] = self.bytes::<1>()?;
                GgufValue::Bool(b != 0)
            }
            8 => GgufValue::String(self.string()?),
            9 => {
                if depth > 0 {
                    return Err(GgufError::Corrupt("nested arrays are not supported".into()));
                }
                let elem_type = self.u32()?;
                let count = self.u64()?;
                if count > MAX_ARRAY_LEN {
                    return Err(GgufError::Corrupt(format!("array of {count} elements")));
                }
                let mut items = Vec::with_capacity(count.min(1 << 16) as usize);
                for _ in 0..count {
                    items.push(self.value(elem_type, depth + 1)?);
                }
                GgufValue::Array(items)
            }
            10 => GgufValue::U64(self.u64()?),
            11 => GgufValue::I64(i64::from_le_bytes(self.bytes()?)),
            12 => GgufValue::F64(f64::from_le_bytes(self.bytes()?)),
            other => return Err(GgufError::UnknownValueType(other)),
        })
    }
}
