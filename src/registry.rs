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

//! Transfer of images to and from registries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use tracing::{debug, info};

use crate::blob::{Blob, BlobDescriptor};
use crate::image::{Image, ImageParts, OCI_MANIFEST};
use crate::keychain::Keychain;

pub const DEFAULT_JOBS: usize = 4;

/// A place images are pulled from and pushed to.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn pull(&self, reference: &str, insecure: bool, keychain: &Keychain) -> Result<Image>;

    async fn push(
        &self,
        image: &Image,
        reference: &str,
        insecure: bool,
        keychain: &Keychain,
    ) -> Result<()>;
}

/// Registry access over the distribution HTTP API.
///
/// Blob transfers run up to `jobs` at a time.
#[derive(Debug, Clone)]
pub struct RemoteRegistry {
    jobs: usize,
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        RemoteRegistry::new(DEFAULT_JOBS)
    }
}

impl RemoteRegistry {
    /// `jobs` of zero falls back to the default.
    pub fn new(jobs: usize) -> Self {
        let jobs = if jobs == 0 { DEFAULT_JOBS } else { jobs };
        RemoteRegistry { jobs }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    fn client(&self, reference: &Reference, insecure: bool) -> Client {
        Client::new(client_config(reference, insecure))
    }
}

fn client_config(reference: &Reference, insecure: bool) -> ClientConfig {
    let protocol = if insecure {
        ClientProtocol::HttpsExcept(vec![reference.registry().to_string()])
    } else {
        ClientProtocol::Https
    };
    ClientConfig {
        protocol,
        accept_invalid_certificates: insecure,
        platform_resolver: Some(Box::new(linux_platform_resolver)),
        ..Default::default()
    }
}

fn parse_reference(reference: &str) -> Result<Reference> {
    reference
        .parse::<Reference>()
        .with_context(|| format!("Invalid image reference {:?}", reference))
}

fn registry_auth(reference: &Reference, keychain: &Keychain) -> RegistryAuth {
    keychain
        .resolve(reference.resolve_registry())
        .to_registry_auth()
}

fn blob_descriptor(descriptor: &OciDescriptor) -> BlobDescriptor {
    BlobDescriptor {
        media_type: descriptor.media_type.clone(),
        size: descriptor.size.max(0) as u64,
        digest: descriptor.digest.clone(),
        annotations: descriptor
            .annotations
            .as_ref()
            .map(|a| a.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    }
}

#[async_trait]
impl ImageRegistry for RemoteRegistry {
    async fn pull(&self, reference: &str, insecure: bool, keychain: &Keychain) -> Result<Image> {
        let oci_ref = parse_reference(reference)?;
        let client = self.client(&oci_ref, insecure);
        let auth = registry_auth(&oci_ref, keychain);

        let (manifest, digest) = client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .with_context(|| format!("Failed to pull manifest for {}", oci_ref))?;
        debug!(reference = %oci_ref, %digest, layers = manifest.layers.len(), "Pulled manifest");

        let mut config = Vec::new();
        client
            .pull_blob(&oci_ref, &manifest.config, &mut config)
            .await
            .with_context(|| format!("Failed to pull config blob {}", manifest.config.digest))?;

        let pulls: Vec<_> = manifest
            .layers
            .iter()
            .map(|descriptor| pull_layer(&client, &oci_ref, descriptor))
            .collect();
        let layers: Vec<Blob> = stream::iter(pulls)
            .buffered(self.jobs)
            .try_collect()
            .await?;

        Image::from_parts(ImageParts {
            media_type: manifest
                .media_type
                .clone()
                .unwrap_or_else(|| OCI_MANIFEST.to_string()),
            annotations: manifest
                .annotations
                .as_ref()
                .map(|a| a.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            config_media_type: manifest.config.media_type.clone(),
            config,
            layers,
        })
        .with_context(|| format!("Invalid image {}", oci_ref))
    }

    async fn push(
        &self,
        image: &Image,
        reference: &str,
        insecure: bool,
        keychain: &Keychain,
    ) -> Result<()> {
        let oci_ref = parse_reference(reference)?;
        let client = self.client(&oci_ref, insecure);
        let auth = registry_auth(&oci_ref, keychain);

        client
            .auth(&oci_ref, &auth, RegistryOperation::Push)
            .await
            .with_context(|| format!("Failed to authenticate to {}", oci_ref.registry()))?;

        let pushes: Vec<_> = image
            .layers()
            .iter()
            .map(|layer| push_layer(&client, &oci_ref, &layer.blob))
            .collect();
        stream::iter(pushes)
            .buffer_unordered(self.jobs)
            .try_collect::<Vec<_>>()
            .await?;

        let config = image.config_blob()?;
        client
            .push_blob(&oci_ref, &config.data, &config.descriptor.digest)
            .await
            .with_context(|| format!("Failed to push config blob {}", config.descriptor.digest))?;

        // The manifest goes up byte for byte so the registry computes the
        // same digest as `Image::digest`.
        let url = client
            .push_manifest_raw(&oci_ref, image.manifest_bytes()?, image.media_type().parse()?)
            .await
            .with_context(|| format!("Failed to push manifest to {}", oci_ref))?;

        info!(reference = %oci_ref, manifest_url = %url, "Image pushed");
        Ok(())
    }
}

async fn pull_layer(client: &Client, oci_ref: &Reference, descriptor: &OciDescriptor) -> Result<Blob> {
    debug!(digest = %descriptor.digest, size = descriptor.size, "Pulling layer");
    let mut data = Vec::new();
    client
        .pull_blob(oci_ref, descriptor, &mut data)
        .await
        .with_context(|| format!("Failed to pull layer {}", descriptor.digest))?;
    Ok(Blob {
        descriptor: blob_descriptor(descriptor),
        data,
    })
}

async fn push_layer(client: &Client, oci_ref: &Reference, blob: &Blob) -> Result<()> {
    let descriptor = &blob.descriptor;
    debug!(digest = %descriptor.digest, size = descriptor.size, "Pushing layer");
    client
        .push_blob(oci_ref, &blob.data, &descriptor.digest)
        .await
        .with_context(|| format!("Failed to push layer {}", descriptor.digest))?;
    Ok(())
}

/// Pick the linux entry matching the host architecture from an image index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
