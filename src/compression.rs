//! Compression codecs, looked up through an explicit registry keyed by file
//! extension.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::storage::{Folder, StorageFolder};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionMethod {
    #[default]
    Lz4,
    Zstd,
    Zlib,
    Uncompressed,
}

impl CompressionMethod {
    pub fn extension(self) -> &'static str {
        match self {
            CompressionMethod::Lz4 => "lz4",
            CompressionMethod::Zstd => "zst",
            CompressionMethod::Zlib => "zz",
            CompressionMethod::Uncompressed => "",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::Lz4 => "lz4",
            CompressionMethod::Zstd => "zstd",
            CompressionMethod::Zlib => "zlib",
            CompressionMethod::Uncompressed => "none",
        }
    }

    /// Object name for `base` compressed with this method.
    pub fn object_name(self, base: &str) -> String {
        match self {
            CompressionMethod::Uncompressed => base.to_string(),
            other => format!("{base}.{}", other.extension()),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lz4" => Ok(Self::Lz4),
            "zstd" | "zst" => Ok(Self::Zstd),
            "zlib" | "zz" => Ok(Self::Zlib),
            "none" | "" => Ok(Self::Uncompressed),
            other => Err(Error::UnsupportedCompression(other.to_string()).into()),
        }
    }
}

impl Serialize for CompressionMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for CompressionMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| serde::de::Error::custom(format!("unsupported compression method: {raw}")))
    }
}

/// The set of codecs available to a process. Built once and passed to every
/// component that reads or writes compressed objects.
#[derive(Debug, Clone)]
pub struct CompressionRegistry {
    methods: Vec<CompressionMethod>,
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionRegistry {
    pub fn new() -> Self {
        Self {
            methods: vec![
                CompressionMethod::Lz4,
                CompressionMethod::Zstd,
                CompressionMethod::Zlib,
            ],
        }
    }

    pub fn by_extension(&self, extension: &str) -> Option<CompressionMethod> {
        self.methods
            .iter()
            .copied()
            .find(|m| m.extension() == extension)
    }

    /// Splits `part_1.tar.lz4` into (`part_1.tar`, lz4).
    pub fn split_extension<'a>(&self, name: &'a str) -> (&'a str, CompressionMethod) {
        if let Some((base, ext)) = name.rsplit_once('.') {
            if let Some(method) = self.by_extension(ext) {
                return (base, method);
            }
        }
        (name, CompressionMethod::Uncompressed)
    }

    pub fn compress(&self, method: CompressionMethod, data: &[u8]) -> Result<Vec<u8>> {
        match method {
            CompressionMethod::Lz4 => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
                encoder.write_all(data)?;
                encoder
                    .finish()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e).into())
            }
            CompressionMethod::Zstd => Ok(zstd::stream::encode_all(data, 3)?),
            CompressionMethod::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            CompressionMethod::Uncompressed => Ok(data.to_vec()),
        }
    }

    pub fn decompress(
        &self,
        method: CompressionMethod,
        reader: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Read + Send>> {
        Ok(match method {
            CompressionMethod::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
            CompressionMethod::Zstd => Box::new(zstd::stream::Decoder::new(reader)?),
            CompressionMethod::Zlib => Box::new(flate2::read::ZlibDecoder::new(reader)),
            CompressionMethod::Uncompressed => reader,
        })
    }

    /// Opens `base` from `folder`, trying every known extension and finally the
    /// bare name.
    pub fn download_and_decompress(
        &self,
        folder: &StorageFolder,
        base: &str,
    ) -> Result<Box<dyn Read + Send>> {
        for method in self
            .methods
            .iter()
            .copied()
            .chain(std::iter::once(CompressionMethod::Uncompressed))
        {
            let name = method.object_name(base);
            if folder.exists(&name)? {
                debug!(object = %name, method = %method, "download_object");
                return self.decompress(method, folder.read_object(&name)?);
            }
        }
        Err(Error::ArchiveNonExistence(base.to_string()).into())
    }

    pub fn download_all(&self, folder: &StorageFolder, base: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.download_and_decompress(folder, base)?
            .read_to_end(&mut out)?;
        Ok(out)
    }
}
