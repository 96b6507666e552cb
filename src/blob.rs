// Copyright (c) 2019, 2020 Codethink Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use zstd::stream::read::Decoder as ZstdDecoder;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::util::{advise_sequential, sha256_digest, HashingWriter};

const IO_BUF_SIZE: usize = 1024 * 1024;
const GZIP_LEVEL: u32 = 5;
const ZSTD_LEVEL: i32 = 3;

pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// How new layer blobs are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
    Disabled,
}

impl Compression {
    /// Layer media type for this compression, in the docker or OCI family.
    ///
    /// Docker v2 manifests have no zstd layer type, so that pairing fails.
    pub fn layer_media_type(self, docker: bool) -> Result<&'static str> {
        Ok(match (self, docker) {
            (Compression::Gzip, true) => DOCKER_LAYER_GZIP,
            (Compression::Disabled, true) => DOCKER_LAYER,
            (Compression::Gzip, false) => OCI_LAYER_GZIP,
            (Compression::Disabled, false) => OCI_LAYER,
            (Compression::Zstd, false) => OCI_LAYER_ZSTD,
            (Compression::Zstd, true) => {
                bail!("zstd layers cannot be added to a Docker v2 image, use gzip or disabled")
            }
        })
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            "disabled" => Ok(Compression::Disabled),
            other => Err(format!(
                "Compression must be gzip, zstd or disabled, got: {}",
                other
            )),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Disabled => "disabled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    pub annotations: Option<BTreeMap<String, String>>,
}

impl BlobDescriptor {
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "mediaType".to_string(),
            serde_json::Value::String(self.media_type.clone()),
        );
        map.insert("size".to_string(), serde_json::Value::Number(self.size.into()));
        map.insert("digest".to_string(), serde_json::Value::String(self.digest.clone()));
        if let Some(ref a) = self.annotations {
            let annotations = a
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            map.insert("annotations".to_string(), serde_json::Value::Object(annotations));
        }
        serde_json::Value::Object(map)
    }
}

/// Content-addressed bytes plus the descriptor that points at them.
#[derive(Debug, Clone)]
pub struct Blob {
    pub descriptor: BlobDescriptor,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn from_bytes(data: Vec<u8>, media_type: &str) -> Self {
        Blob {
            descriptor: BlobDescriptor {
                media_type: media_type.to_string(),
                size: data.len() as u64,
                digest: sha256_digest(&data),
                annotations: None,
            },
            data,
        }
    }

    /// Compress the tar archive at `archive` into a layer blob.
    ///
    /// Returns the blob together with the layer's diff id, the digest of the
    /// uncompressed tar stream.
    pub fn from_layer_archive(
        archive: &Path,
        compression: Compression,
        media_type: &str,
    ) -> Result<(Self, String)> {
        let inp = fs::File::open(archive)
            .with_context(|| format!("Failed to open layer archive {:?}", archive))?;
        advise_sequential(&inp);
        let mut reader = BufReader::with_capacity(IO_BUF_SIZE, inp);

        // Stack: tar -> HashingWriter(diff_id) -> compressor -> Vec
        let (data, diff_digest) = match compression {
            Compression::Gzip => {
                let encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(GZIP_LEVEL));
                let mut diff_hasher = HashingWriter::new(encoder);
                io::copy(&mut reader, &mut diff_hasher)?;
                let (encoder, diff_digest) = diff_hasher.finish()?;
                (encoder.finish()?, diff_digest)
            }
            Compression::Zstd => {
                let encoder = ZstdEncoder::new(Vec::new(), ZSTD_LEVEL)?;
                let mut diff_hasher = HashingWriter::new(encoder);
                io::copy(&mut reader, &mut diff_hasher)?;
                let (encoder, diff_digest) = diff_hasher.finish()?;
                (encoder.finish()?, diff_digest)
            }
            Compression::Disabled => {
                let mut diff_hasher = HashingWriter::new(Vec::new());
                io::copy(&mut reader, &mut diff_hasher)?;
                let (data, diff_digest) = diff_hasher.finish()?;
                (data, diff_digest)
            }
        };

        Ok((
            Blob::from_bytes(data, media_type),
            format!("sha256:{}", diff_digest),
        ))
    }
}

/// Reader over the uncompressed tar stream of a layer blob.
pub fn layer_reader<'a>(data: &'a [u8], media_type: &str) -> Result<Box<dyn Read + 'a>> {
    let reader: Box<dyn Read + 'a> = if media_type.ends_with("gzip") {
        Box::new(GzDecoder::new(data))
    } else if media_type.ends_with("zstd") {
        Box::new(ZstdDecoder::new(data)?)
    } else if media_type.ends_with(".tar") || media_type.ends_with("tar+encrypted") {
        Box::new(data)
    } else {
        bail!("Unsupported layer media type: {}", media_type);
    };
    Ok(reader)
}
