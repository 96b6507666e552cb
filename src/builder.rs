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

//! The build pipeline: pull, package, append, configure, push.

use std::collections::BTreeMap;
use std::path::Path;

use tempfile::TempPath;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info};

use crate::error::{BuildError, Result};
use crate::image::{Image, LayerAddendum};
use crate::keychain::Keychain;
use crate::layer_builder::create_layer;
use crate::options::BuildOptions;
use crate::ownership::HostOwnership;
use crate::path_spec::PathSpec;
use crate::registry::{ImageRegistry, RemoteRegistry};

/// Runs builds against one registry implementation.
#[derive(Debug, Clone, Default)]
pub struct Builder<R> {
    registry: R,
}

impl Builder<RemoteRegistry> {
    pub fn remote(jobs: usize) -> Self {
        Builder::new(RemoteRegistry::new(jobs))
    }
}

impl<R: ImageRegistry> Builder<R> {
    pub fn new(registry: R) -> Self {
        Builder { registry }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Run the full build and return the digest of the pushed image.
    ///
    /// Log events go to `options.output`. Packaging and compression run on
    /// tokio's blocking pool, so this needs a tokio runtime. Layer archives
    /// staged on disk are removed before this returns, whether or not the
    /// build succeeds.
    pub async fn build(&self, options: &BuildOptions, specs: &[PathSpec]) -> Result<String> {
        self.run(options, specs)
            .with_subscriber(options.output.clone())
            .await
    }

    async fn run(&self, options: &BuildOptions, specs: &[PathSpec]) -> Result<String> {
        info!(base = %options.base, insecure = options.pull_insecure, "Pulling base image");
        let base = self.pull_base(options).await?;

        info!(layers = specs.len(), "Composing layers");
        let image = compose(base, options, specs).await?;
        let image = configure(image, options)?;

        info!(target = %options.target, insecure = options.push_insecure, "Pushing image");
        let push_failed = |source| BuildError::Push {
            reference: options.target.clone(),
            source,
        };
        let keychain = Keychain::select(options.push_config_dir.as_deref());
        self.registry
            .push(&image, &options.target, options.push_insecure, &keychain)
            .await
            .map_err(push_failed)?;
        let digest = image.digest().map_err(push_failed)?;

        info!(%digest, "Build complete");
        Ok(digest)
    }

    async fn pull_base(&self, options: &BuildOptions) -> Result<Image> {
        if options.is_scratch() {
            debug!("Starting from an empty image");
            return Ok(Image::empty());
        }
        let keychain = Keychain::select(options.pull_config_dir.as_deref());
        self.registry
            .pull(&options.base, options.pull_insecure, &keychain)
            .await
            .map_err(|source| BuildError::Pull {
                reference: options.base.clone(),
                source,
            })
    }
}

/// Package and append on the blocking pool, logging to the build's output.
async fn compose(base: Image, options: &BuildOptions, specs: &[PathSpec]) -> Result<Image> {
    let task = {
        let options = options.clone();
        let specs = specs.to_vec();
        tokio::task::spawn_blocking(move || {
            tracing::dispatcher::with_default(&options.output.clone(), || {
                let archives = package_all(&options, &specs)?;
                append_archives(base, &archives, &options)
            })
        })
    };
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(BuildError::Composition {
            base: base_name(options),
            layers: specs.len(),
            source: e.into(),
        }),
    }
}

fn base_name(options: &BuildOptions) -> String {
    if options.is_scratch() {
        "scratch".to_string()
    } else {
        options.base.clone()
    }
}

/// One archive per spec, in order. On failure the archives created so far
/// are dropped, which deletes them.
fn package_all(options: &BuildOptions, specs: &[PathSpec]) -> Result<Vec<TempPath>> {
    let temp_dir = options.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
    specs
        .iter()
        .map(|spec| {
            debug!(%spec, recursive = options.recursive, "Packaging");
            create_layer(
                Path::new(&spec.local_path),
                &spec.target_path,
                options.recursive,
                &temp_dir,
                &HostOwnership,
            )
            .map_err(|source| BuildError::Packaging {
                spec: spec.to_string(),
                source,
            })
        })
        .collect()
}

fn append_archives(base: Image, archives: &[TempPath], options: &BuildOptions) -> Result<Image> {
    let last = archives.len().saturating_sub(1);
    let addenda: Vec<LayerAddendum> = archives
        .iter()
        .enumerate()
        .map(|(i, archive)| LayerAddendum {
            archive: archive.to_path_buf(),
            annotations: if i == last {
                options.annotations.clone()
            } else {
                BTreeMap::new()
            },
        })
        .collect();
    base.append_layers(&addenda, options.compression)
        .map_err(|source| BuildError::Composition {
            base: base_name(options),
            layers: archives.len(),
            source,
        })
}

fn configure(image: Image, options: &BuildOptions) -> Result<Image> {
    options
        .config_patches()
        .into_iter()
        .try_fold(image, |image, patch| {
            debug!(%patch, "Mutating config");
            image
                .mutate_config(&patch)
                .map_err(|source| BuildError::ConfigMutation {
                    patch: patch.to_string(),
                    source,
                })
        })
}

/// Validate `specs` for the host OS, then build against remote registries.
///
/// No work starts unless every spec parses.
pub async fn build<S: AsRef<str>>(options: &BuildOptions, specs: &[S]) -> Result<String> {
    let specs = specs
        .iter()
        .map(|spec| spec.as_ref().parse())
        .collect::<Result<Vec<PathSpec>>>()?;
    Builder::remote(options.jobs).build(options, &specs).await
}
