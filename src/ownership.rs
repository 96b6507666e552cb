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

//! Host file metadata that differs per platform: owner ids and permission bits.

use std::fs::Metadata;

/// Reads the owner and group of a file from its metadata.
///
/// Returns `None` when the platform has no numeric ownership to report.
pub trait OwnershipReader {
    fn read(&self, meta: &Metadata) -> Option<(u64, u64)>;
}

/// The ownership reader for the platform this binary was built for.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostOwnership;

#[cfg(unix)]
impl OwnershipReader for HostOwnership {
    fn read(&self, meta: &Metadata) -> Option<(u64, u64)> {
        use std::os::unix::fs::MetadataExt;
        Some((meta.uid() as u64, meta.gid() as u64))
    }
}

#[cfg(not(unix))]
impl OwnershipReader for HostOwnership {
    fn read(&self, _meta: &Metadata) -> Option<(u64, u64)> {
        None
    }
}

/// Permission bits only, without the file type or setuid/setgid/sticky bits.
#[cfg(unix)]
pub fn permission_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
pub fn permission_bits(meta: &Metadata) -> u32 {
    let base = if meta.is_dir() { 0o755 } else { 0o644 };
    if meta.permissions().readonly() {
        base & 0o555
    } else {
        base
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    #[test]
    fn reads_file_owner() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let meta = file.as_file().metadata().unwrap();
        let (uid, gid) = HostOwnership.read(&meta).unwrap();
        assert_eq!(uid, meta.uid() as u64);
        assert_eq!(gid, meta.gid() as u64);
    }

    #[test]
    fn strips_special_bits() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o2750)).unwrap();
        let meta = std::fs::metadata(file.path()).unwrap();
        assert_eq!(permission_bits(&meta), 0o750);
    }
}
