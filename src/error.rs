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

//! Errors surfaced by a build.
//!
//! Every fatal variant names the stage that failed and the input it was
//! working on; the underlying cause is chained as the error source.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("wrong format for path spec {spec:?} (expected \"local:remote\")")]
    MalformedPathSpec { spec: String },

    #[error("wrong format for annotation {annotation:?} (expected \"key=value\")")]
    MalformedAnnotation { annotation: String },

    #[error("cannot package {spec} as a layer archive")]
    Packaging {
        spec: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not pull base image {reference}")]
    Pull {
        reference: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not append {layers} layer(s) to base image {base}")]
    Composition {
        base: String,
        layers: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not apply config change ({patch})")]
    ConfigMutation {
        patch: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not push image {reference}")]
    Push {
        reference: String,
        #[source]
        source: anyhow::Error,
    },
}

impl BuildError {
    /// Name of the pipeline stage the error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            BuildError::MalformedPathSpec { .. } | BuildError::MalformedAnnotation { .. } => {
                "validate"
            }
            BuildError::Pull { .. } => "pull",
            BuildError::Packaging { .. } => "package",
            BuildError::Composition { .. } => "append",
            BuildError::ConfigMutation { .. } => "configure",
            BuildError::Push { .. } => "push",
        }
    }
}
