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

use std::fmt;
use std::str::FromStr;

use crate::error::BuildError;

/// A `local:remote` mapping from a host path to a destination inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    pub local_path: String,
    pub target_path: String,
}

impl PathSpec {
    /// Parse a spec the way it is written on a host running `os`
    /// (a `std::env::consts::OS` value).
    ///
    /// On Windows a drive-qualified local path such as `C:\src:/app` is
    /// accepted even though it contains an extra colon.
    pub fn parse(spec: &str, os: &str) -> Result<Self, BuildError> {
        let malformed = || BuildError::MalformedPathSpec {
            spec: spec.to_string(),
        };

        let parts: Vec<&str> = spec.split(':').collect();
        let (local_path, target_path) = match parts.as_slice() {
            [local, target] => (local.to_string(), target.to_string()),
            [drive, rest, target] if os == "windows" && is_drive_qualified(drive, rest) => {
                (format!("{}:{}", drive, rest), target.to_string())
            }
            _ => return Err(malformed()),
        };

        if local_path.is_empty() || target_path.is_empty() {
            return Err(malformed());
        }

        Ok(PathSpec {
            local_path,
            target_path,
        })
    }
}

fn is_drive_qualified(drive: &str, rest: &str) -> bool {
    let mut chars = drive.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_alphabetic())
        && (rest.starts_with('\\') || rest.starts_with('/'))
}

impl FromStr for PathSpec {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathSpec::parse(s, std::env::consts::OS)
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local_path, self.target_path)
    }
}
