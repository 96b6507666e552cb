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
use std::path::PathBuf;

use tracing::Dispatch;

use crate::blob::Compression;
use crate::error::BuildError;
use crate::image::ConfigPatch;
use crate::registry::DEFAULT_JOBS;

/// Everything one build needs besides the path specs.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Base image reference. Empty or `scratch` starts from an empty image.
    pub base: String,
    pub target: String,
    pub pull_insecure: bool,
    pub push_insecure: bool,
    pub pull_config_dir: Option<PathBuf>,
    pub push_config_dir: Option<PathBuf>,
    /// Added to the descriptor of the last new layer.
    pub annotations: BTreeMap<String, String>,
    pub recursive: bool,
    pub clear_entrypoint: bool,
    /// Empty leaves the configured user alone.
    pub run_as: String,
    pub jobs: usize,
    pub compression: Compression,
    /// Where layer archives are staged. Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Receives the build's log events.
    pub output: Dispatch,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            base: String::new(),
            target: String::new(),
            pull_insecure: false,
            push_insecure: false,
            pull_config_dir: None,
            push_config_dir: None,
            annotations: BTreeMap::new(),
            recursive: false,
            clear_entrypoint: false,
            run_as: String::new(),
            jobs: DEFAULT_JOBS,
            compression: Compression::default(),
            temp_dir: None,
            output: Dispatch::none(),
        }
    }
}

impl BuildOptions {
    pub fn is_scratch(&self) -> bool {
        self.base.is_empty() || self.base == "scratch"
    }

    /// Config changes to apply, entrypoint first.
    pub fn config_patches(&self) -> Vec<ConfigPatch> {
        let mut patches = Vec::new();
        if self.clear_entrypoint {
            patches.push(ConfigPatch::ClearEntrypoint);
        }
        if !self.run_as.is_empty() {
            patches.push(ConfigPatch::User(self.run_as.clone()));
        }
        patches
    }
}

/// Parse `key=value` pairs. The value may itself contain `=`.
pub fn parse_annotations<S: AsRef<str>>(
    annotations: &[S],
) -> Result<BTreeMap<String, String>, BuildError> {
    let mut parsed = BTreeMap::new();
    for annotation in annotations {
        let annotation = annotation.as_ref();
        match annotation.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                parsed.insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(BuildError::MalformedAnnotation {
                    annotation: annotation.to_string(),
                })
            }
        }
    }
    Ok(parsed)
}
