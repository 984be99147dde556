//! Self-describing multi-array container.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! b"MFAC" | version: u32 | header_len: u64 | header (JSON) | array blobs
//! ```
//!
//! The JSON header lists free-form attributes and, for every array, its name,
//! element type, shape and byte range inside the blob section.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"MFAC";
pub const CONTAINER_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    U8,
}

impl DType {
    fn size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::U8 => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ArrayData {
    F32(Vec<f32>),
    U8(Vec<u8>),
}

impl ArrayData {
    fn dtype(&self) -> DType {
        match self {
            ArrayData::F32(_) => DType::F32,
            ArrayData::U8(_) => DType::U8,
        }
    }

    fn len(&self) -> usize {
        match self {
            ArrayData::F32(v) => v.len(),
            ArrayData::U8(v) => v.len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    pub shape: Vec<usize>,
    pub data: ArrayData,
}

#[derive(Serialize, Deserialize)]
struct ArrayEntry {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    offset: u64,
    length: u64,
}

#[derive(Serialize, Deserialize)]
struct Header {
    attributes: BTreeMap<String, Value>,
    arrays: Vec<ArrayEntry>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayContainer {
    attributes: BTreeMap<String, Value>,
    arrays: BTreeMap<String, Array>,
}

impl ArrayContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_attribute<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        self.attributes.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn attribute<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .attributes
            .get(key)
            .ok_or_else(|| Error::InvalidContainer(format!("missing attribute '{}'", key)))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn insert_f32(&mut self, name: &str, shape: &[usize], data: Vec<f32>) -> Result<()> {
        self.insert(name, shape, ArrayData::F32(data))
    }

    pub fn insert_u8(&mut self, name: &str, shape: &[usize], data: Vec<u8>) -> Result<()> {
        self.insert(name, shape, ArrayData::U8(data))
    }

    fn insert(&mut self, name: &str, shape: &[usize], data: ArrayData) -> Result<()> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::InvalidContainer(format!(
                "array '{}' has {} elements, shape {:?} needs {}",
                name,
                data.len(),
                shape,
                expected
            )));
        }
        self.arrays.insert(
            name.to_string(),
            Array {
                shape: shape.to_vec(),
                data,
            },
        );
        Ok(())
    }

    pub fn array(&self, name: &str) -> Result<&Array> {
        self.arrays
            .get(name)
            .ok_or_else(|| Error::InvalidContainer(format!("missing array '{}'", name)))
    }

    pub fn f32(&self, name: &str) -> Result<(&[usize], &[f32])> {
        match self.array(name)? {
            Array {
                shape,
                data: ArrayData::F32(values),
            } => Ok((shape, values)),
            _ => Err(Error::InvalidContainer(format!("array '{}' is not f32", name))),
        }
    }

    pub fn u8(&self, name: &str) -> Result<(&[usize], &[u8])> {
        match self.array(name)? {
            Array {
                shape,
                data: ArrayData::U8(values),
            } => Ok((shape, values)),
            _ => Err(Error::InvalidContainer(format!("array '{}' is not u8", name))),
        }
    }

    pub fn array_names(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(String::as_str)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut offset = 0u64;
        let mut entries = Vec::with_capacity(self.arrays.len());
        for (name, array) in &self.arrays {
            let length = (array.data.len() * array.data.dtype().size()) as u64;
            entries.push(ArrayEntry {
                name: name.clone(),
                dtype: array.data.dtype(),
                shape: array.shape.clone(),
                offset,
                length,
            });
            offset += length;
        }

        let header = serde_json::to_vec(&Header {
            attributes: self.attributes.clone(),
            arrays: entries,
        })?;

        writer.write_all(MAGIC)?;
        writer.write_all(&CONTAINER_VERSION.to_le_bytes())?;
        writer.write_all(&(header.len() as u64).to_le_bytes())?;
        writer.write_all(&header)?;

        for array in self.arrays.values() {
            match &array.data {
                ArrayData::F32(values) => {
                    for value in values {
                        writer.write_all(&value.to_le_bytes())?;
                    }
                }
                ArrayData::U8(values) => writer.write_all(values)?,
            }
        }

        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::InvalidContainer("bad magic".into()));
        }

        let mut word = [0u8; 4];
        reader.read_exact(&mut word)?;
        let version = u32::from_le_bytes(word);
        if version != CONTAINER_VERSION {
            return Err(Error::InvalidContainer(format!(
                "unsupported container version {}",
                version
            )));
        }

        let mut long = [0u8; 8];
        reader.read_exact(&mut long)?;
        let header_len = u64::from_le_bytes(long);
        let mut header = Vec::new();
        (&mut *reader).take(header_len).read_to_end(&mut header)?;
        if header.len() as u64 != header_len {
            return Err(Error::InvalidContainer("header is truncated".into()));
        }
        let header: Header = serde_json::from_slice(&header)?;

        let mut blobs = Vec::new();
        reader.read_to_end(&mut blobs)?;

        let mut arrays = BTreeMap::new();
        for entry in header.arrays {
            let truncated = || Error::InvalidContainer(format!("array '{}' is truncated", entry.name));
            let start = usize::try_from(entry.offset).map_err(|_| truncated())?;
            let end = usize::try_from(entry.length)
                .ok()
                .and_then(|length| start.checked_add(length))
                .ok_or_else(truncated)?;
            let bytes = blobs.get(start..end).ok_or_else(truncated)?;
            let data = match entry.dtype {
                DType::F32 => ArrayData::F32(
                    bytes
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ),
                DType::U8 => ArrayData::U8(bytes.to_vec()),
            };
            let expected: usize = entry.shape.iter().product();
            if expected != data.len() {
                return Err(Error::InvalidContainer(format!(
                    "array '{}' does not match its shape {:?}",
                    entry.name, entry.shape
                )));
            }
            arrays.insert(
                entry.name,
                Array {
                    shape: entry.shape,
                    data,
                },
            );
        }

        Ok(Self {
            attributes: header.attributes,
            arrays,
        })
    }

    /// Write to `path` through a temporary sibling file and a rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, |writer| self.write_to(writer))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }
}

/// Write through `path.tmp` then rename, so readers never see a partial file.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    let written = File::create(&tmp).map_err(Error::from).and_then(|file| {
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    });
    if let Err(err) = written.and_then(|()| fs::rename(&tmp, path).map_err(Error::from)) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
