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

//! Build container images without a daemon: package local files as layers,
//! append them to a base image and push the result to a registry.

pub mod blob;
pub mod builder;
pub mod error;
pub mod image;
pub mod keychain;
pub mod layer_builder;
pub mod options;
pub mod ownership;
pub mod path_spec;
pub mod registry;
mod util;

pub use blob::Compression;
pub use builder::{build, Builder};
pub use error::BuildError;
pub use image::{ConfigPatch, Image};
pub use keychain::{Credentials, Keychain};
pub use options::{parse_annotations, BuildOptions};
pub use path_spec::PathSpec;
pub use registry::{ImageRegistry, RemoteRegistry};
