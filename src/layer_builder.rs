// Copyright (c) 2019 Codethink Ltd.
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

//! Packaging of a host file or directory into an uncompressed layer tarball.

use std::ffi::OsStr;
use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use jwalk::WalkDir;
use tempfile::TempPath;
use tracing::{debug, warn};

use crate::ownership::{permission_bits, OwnershipReader};
use crate::util::advise_sequential;

/// Package `local_path` into a fresh tar file under `temp_dir`, placing its
/// entries below `target_path` inside the image.
///
/// A regular file becomes a single entry named after its base name. A
/// directory contributes its immediate non-directory children, or its whole
/// subtree when `recursive` is set. The archive is removed when the returned
/// [`TempPath`] is dropped.
pub fn create_layer<O: OwnershipReader>(
    local_path: &Path,
    target_path: &str,
    recursive: bool,
    temp_dir: &Path,
    ownership: &O,
) -> Result<TempPath> {
    let layer_file = tempfile::Builder::new()
        .prefix("strata-layer-")
        .suffix(".tar")
        .tempfile_in(temp_dir)
        .with_context(|| format!("Failed to create layer archive in {:?}", temp_dir))?;
    let (file, archive_path) = layer_file.into_parts();

    let meta = fs::metadata(local_path)
        .with_context(|| format!("Failed to stat {:?}", local_path))?;

    let mut writer = LayerWriter::new(BufWriter::new(file), ownership);
    if !meta.is_dir() {
        let base_name = local_path
            .file_name()
            .with_context(|| format!("No file name in {:?}", local_path))?;
        writer.append_regular(local_path, &archive_name(target_path, Path::new(base_name)))?;
    } else if recursive {
        writer.append_tree(local_path, target_path)?;
    } else {
        writer.append_children(local_path, target_path)?;
    }

    let entries = writer.entries;
    let buf_writer = writer.builder.into_inner()?;
    buf_writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("bufwriter: {}", e))?
        .sync_all()?;

    debug!(
        source = %local_path.display(),
        archive = %archive_path.display(),
        entries,
        "Packaged layer archive"
    );
    Ok(archive_path)
}

struct LayerWriter<'a, O> {
    builder: tar::Builder<BufWriter<File>>,
    ownership: &'a O,
    entries: usize,
    ownership_warned: bool,
}

impl<'a, O: OwnershipReader> LayerWriter<'a, O> {
    fn new(output: BufWriter<File>, ownership: &'a O) -> Self {
        let mut builder = tar::Builder::new(output);
        builder.follow_symlinks(false);
        LayerWriter {
            builder,
            ownership,
            entries: 0,
            ownership_warned: false,
        }
    }

    fn header(&mut self, meta: &Metadata, entry_type: tar::EntryType, name: &Path) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(permission_bits(meta));
        match self.ownership.read(meta) {
            Some((uid, gid)) => {
                header.set_uid(uid);
                header.set_gid(gid);
            }
            None => {
                if !self.ownership_warned {
                    warn!(entry = %name.display(), "Could not read UID/GID, assuming root ownership");
                    self.ownership_warned = true;
                }
                header.set_uid(0);
                header.set_gid(0);
            }
        }
        header.set_mtime(mtime(meta));
        header.set_size(0);
        header
    }

    /// Write a regular file, following `path` if it is a link.
    fn append_regular(&mut self, path: &Path, name: &Path) -> Result<()> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        advise_sequential(&file);
        let meta = file
            .metadata()
            .with_context(|| format!("Failed to stat {:?}", path))?;

        let mut header = self.header(&meta, tar::EntryType::Regular, name);
        header.set_size(meta.len());
        header.set_cksum();
        self.builder
            .append_data(&mut header, name, file)
            .with_context(|| format!("Failed to write {:?} to layer archive", path))?;
        self.entries += 1;
        Ok(())
    }

    fn append_directory(&mut self, meta: &Metadata, name: &Path) -> Result<()> {
        if name.as_os_str().is_empty() {
            // The image root itself needs no entry.
            return Ok(());
        }
        let mut dir_name = name.as_os_str().to_owned();
        dir_name.push("/");
        let dir_name = PathBuf::from(dir_name);
        let mut header = self.header(meta, tar::EntryType::Directory, &dir_name);
        header.set_cksum();
        self.builder
            .append_data(&mut header, &dir_name, io::empty())
            .with_context(|| format!("Failed to write directory {:?} to layer archive", dir_name))?;
        self.entries += 1;
        Ok(())
    }

    fn append_symlink(&mut self, path: &Path, meta: &Metadata, name: &Path) -> Result<()> {
        let target = fs::read_link(path).with_context(|| format!("Failed to read link {:?}", path))?;
        let mut header = self.header(meta, tar::EntryType::Symlink, name);
        self.builder
            .append_link(&mut header, name, &target)
            .with_context(|| format!("Failed to write link {:?} to layer archive", path))?;
        self.entries += 1;
        Ok(())
    }

    /// Write one non-root entry found while listing a directory. `meta` must
    /// not follow links.
    fn append_entry(&mut self, path: &Path, meta: &Metadata, name: &Path) -> Result<()> {
        let file_type = meta.file_type();
        if file_type.is_dir() {
            self.append_directory(meta, name)
        } else if file_type.is_symlink() {
            self.append_symlink(path, meta, name)
        } else if file_type.is_file() {
            self.append_regular(path, name)
        } else {
            warn!(path = %path.display(), "Skipping special file");
            Ok(())
        }
    }

    /// Immediate children of `dir` that are not directories, in name order.
    fn append_children(&mut self, dir: &Path, target_path: &str) -> Result<()> {
        let mut children = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
            let entry = entry.with_context(|| format!("Failed to list {:?}", dir))?;
            children.push(entry.file_name());
        }
        children.sort();

        for child in children {
            let path = dir.join(&child);
            let meta = fs::symlink_metadata(&path)
                .with_context(|| format!("Failed to stat {:?}", path))?;
            if meta.is_dir() {
                continue;
            }
            let name = archive_name(target_path, Path::new(&child));
            self.append_entry(&path, &meta, &name)?;
        }
        Ok(())
    }

    /// The whole subtree below `dir`, root first, in sorted depth-first order.
    fn append_tree(&mut self, dir: &Path, target_path: &str) -> Result<()> {
        let root = if fs::symlink_metadata(dir)?.file_type().is_symlink() {
            fs::canonicalize(dir).with_context(|| format!("Failed to resolve {:?}", dir))?
        } else {
            dir.to_path_buf()
        };

        let walk = WalkDir::new(&root)
            .sort(true)
            .skip_hidden(false)
            .follow_links(false);
        for entry in walk {
            let entry = entry.with_context(|| format!("Failed to walk {:?}", root))?;
            let path = entry.path();
            let rel = path.strip_prefix(&root).unwrap_or(Path::new(""));
            let name = archive_name(target_path, rel);

            if entry.depth == 0 {
                let meta = fs::metadata(&path).with_context(|| format!("Failed to stat {:?}", path))?;
                self.append_directory(&meta, &name)?;
                continue;
            }
            let meta = fs::symlink_metadata(&path)
                .with_context(|| format!("Failed to stat {:?}", path))?;
            self.append_entry(&path, &meta, &name)?;
        }
        Ok(())
    }
}

fn mtime(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Join `rel` onto the in-image `target` and clean the result into a
/// root-relative archive name: `/app` + `a/b` gives `app/a/b`. Targets are
/// always taken from the image root, so `..` never climbs above it. Host
/// name bytes are kept as they are.
pub fn archive_name(target: &str, rel: &Path) -> PathBuf {
    let target_parts = target.split('/').map(OsStr::new);
    let rel_parts = rel.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part),
        Component::ParentDir => Some(OsStr::new("..")),
        _ => None,
    });

    let mut parts: Vec<&OsStr> = Vec::new();
    for part in target_parts.chain(rel_parts) {
        if part == OsStr::new("..") {
            parts.pop();
        } else if !part.is_empty() && part != OsStr::new(".") {
            parts.push(part);
        }
    }
    parts.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::HostOwnership;
    use sha2::{Digest, Sha256};
    use std::io::Read;
    use tempfile::TempDir;

    struct NoOwnership;

    impl OwnershipReader for NoOwnership {
        fn read(&self, _meta: &Metadata) -> Option<(u64, u64)> {
            None
        }
    }

    struct Entry {
        name: String,
        entry_type: tar::EntryType,
        mode: u32,
        uid: u64,
        data: Vec<u8>,
    }

    fn read_entries(path: &Path) -> Vec<Entry> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = String::from_utf8_lossy(&e.path_bytes()).to_string();
                let entry_type = e.header().entry_type();
                let mode = e.header().mode().unwrap();
                let uid = e.header().uid().unwrap();
                let mut data = Vec::new();
                e.read_to_end(&mut data).unwrap();
                Entry {
                    name,
                    entry_type,
                    mode,
                    uid,
                    data,
                }
            })
            .collect()
    }

    fn write_file(path: &Path, content: &[u8]) {
        fs::write(path, content).unwrap();
    }

    #[test]
    fn single_file_entry() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let file = src.path().join("hello.txt");
        write_file(&file, b"\n\tThis is for simple testing\n\t");

        let archive = create_layer(&file, "/path/to/target", false, out.path(), &HostOwnership).unwrap();
        let entries = read_entries(&archive);

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "path/to/target/hello.txt");
        assert_eq!(entries[0].entry_type, tar::EntryType::Regular);
        assert_eq!(
            Sha256::digest(&entries[0].data),
            Sha256::digest(fs::read(&file).unwrap())
        );
    }

    #[cfg(unix)]
    #[test]
    fn single_file_keeps_mode_and_owner() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let file = src.path().join("secret.txt");
        write_file(&file, b"data");
        fs::set_permissions(&file, fs::Permissions::from_mode(0o400)).unwrap();

        let archive = create_layer(&file, "/app", false, out.path(), &HostOwnership).unwrap();
        let entries = read_entries(&archive);

        assert_eq!(entries[0].mode, 0o400);
        assert_eq!(entries[0].uid, fs::metadata(&file).unwrap().uid() as u64);
    }

    #[test]
    fn missing_ownership_defaults_to_root() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let file = src.path().join("a.txt");
        write_file(&file, b"a");

        let archive = create_layer(&file, "/app", false, out.path(), &NoOwnership).unwrap();
        let mut reader = tar::Archive::new(File::open(&archive).unwrap());
        let entry = reader.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().uid().unwrap(), 0);
        assert_eq!(entry.header().gid().unwrap(), 0);
    }

    #[test]
    fn flat_directory_skips_nested_dirs() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_file(&src.path().join("b.txt"), b"b");
        write_file(&src.path().join("a.txt"), b"a");
        fs::create_dir(src.path().join("nested")).unwrap();
        write_file(&src.path().join("nested").join("c.txt"), b"c");

        let archive = create_layer(src.path(), "/app", false, out.path(), &HostOwnership).unwrap();
        let names: Vec<String> = read_entries(&archive).into_iter().map(|e| e.name).collect();

        assert_eq!(names, vec!["app/a.txt", "app/b.txt"]);
    }

    #[test]
    fn recursive_directory_entries() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::create_dir(src.path().join("dir2")).unwrap();
        fs::create_dir(src.path().join("dir3")).unwrap();
        write_file(&src.path().join("dir2").join("file.txt"), b"nested");
        write_file(&src.path().join("top.txt"), b"top");

        let archive = create_layer(src.path(), "/path/to/target", true, out.path(), &HostOwnership).unwrap();
        let entries = read_entries(&archive);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(
            names,
            vec![
                "path/to/target/",
                "path/to/target/dir2/",
                "path/to/target/dir2/file.txt",
                "path/to/target/dir3/",
                "path/to/target/top.txt",
            ]
        );
        assert_eq!(entries[1].entry_type, tar::EntryType::Directory);
        assert!(entries[1].data.is_empty());
        assert_eq!(entries[2].data, b"nested");
    }

    #[test]
    fn recursive_into_image_root_has_no_root_entry() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_file(&src.path().join("a.txt"), b"a");

        let archive = create_layer(src.path(), "/", true, out.path(), &HostOwnership).unwrap();
        let names: Vec<String> = read_entries(&archive).into_iter().map(|e| e.name).collect();

        assert_eq!(names, vec!["a.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_preserved() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_file(&src.path().join("real.txt"), b"real");
        std::os::unix::fs::symlink("real.txt", src.path().join("link.txt")).unwrap();

        let archive = create_layer(src.path(), "/app", true, out.path(), &HostOwnership).unwrap();
        let mut archive_reader = tar::Archive::new(File::open(&archive).unwrap());
        let link = archive_reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path_bytes().as_ref() == b"app/link.txt")
            .unwrap();

        assert_eq!(link.header().entry_type(), tar::EntryType::Symlink);
        assert_eq!(link.link_name().unwrap().unwrap(), Path::new("real.txt"));
    }

    #[test]
    fn packaging_is_deterministic() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        write_file(&src.path().join("sub").join("x"), b"x");
        write_file(&src.path().join("y"), b"y");

        let first = create_layer(src.path(), "/app", true, out.path(), &HostOwnership).unwrap();
        let second = create_layer(src.path(), "/app", true, out.path(), &HostOwnership).unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn missing_source_fails_and_cleans_up() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let result = create_layer(&src.path().join("absent"), "/app", false, out.path(), &HostOwnership);

        assert!(result.is_err());
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn dropping_archive_removes_it() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_file(&src.path().join("a"), b"a");

        let archive = create_layer(src.path(), "/app", false, out.path(), &HostOwnership).unwrap();
        let path = archive.to_path_buf();
        assert!(path.exists());
        drop(archive);
        assert!(!path.exists());
    }

    #[test]
    fn archive_names() {
        let name = |target: &str, rel: &str| archive_name(target, Path::new(rel));
        assert_eq!(name("/path/to/target", "file.txt"), Path::new("path/to/target/file.txt"));
        assert_eq!(name("/app/", "a/b"), Path::new("app/a/b"));
        assert_eq!(name(".", "file"), Path::new("file"));
        assert_eq!(name("/", ""), Path::new(""));
        assert_eq!(name("/app", ""), Path::new("app"));
        assert_eq!(name("/app/../opt", "x"), Path::new("opt/x"));
        assert_eq!(name("/../x", "y"), Path::new("x/y"));
        assert_eq!(name("../x", "y"), Path::new("x/y"));
        assert_eq!(name("/app", "a/../b"), Path::new("app/b"));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_names_are_kept() {
        use std::os::unix::ffi::OsStrExt;

        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_file(&src.path().join(OsStr::from_bytes(b"a\xffx")), b"one");
        write_file(&src.path().join(OsStr::from_bytes(b"a\xfex")), b"two");

        let archive = create_layer(src.path(), "/app", false, out.path(), &HostOwnership).unwrap();
        let mut reader = tar::Archive::new(File::open(&archive).unwrap());
        let mut names: Vec<Vec<u8>> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path_bytes().into_owned())
            .collect();
        names.sort();

        assert_eq!(names, vec![b"app/a\xfex".to_vec(), b"app/a\xffx".to_vec()]);
    }

    #[cfg(unix)]
    #[test]
    fn entries_keep_mtime_and_group() {
        use std::os::unix::fs::MetadataExt;

        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let file = src.path().join("a.txt");
        write_file(&file, b"a");
        let meta = fs::metadata(&file).unwrap();
        let modified = meta.modified().unwrap().duration_since(UNIX_EPOCH).unwrap().as_secs();

        let archive = create_layer(&file, "/app", false, out.path(), &HostOwnership).unwrap();
        let mut reader = tar::Archive::new(File::open(&archive).unwrap());
        let entry = reader.entries().unwrap().next().unwrap().unwrap();

        assert_eq!(entry.header().mtime().unwrap(), modified);
        assert_eq!(entry.header().gid().unwrap(), meta.gid() as u64);
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn missing_ownership_warns_once_per_archive() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        for name in ["a", "b", "c"] {
            write_file(&src.path().join(name), name.as_bytes());
        }

        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            create_layer(src.path(), "/app", false, out.path(), &NoOwnership).unwrap();
            create_layer(src.path(), "/app", false, out.path(), &NoOwnership).unwrap();
        });

        let logged = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(logged.matches("Could not read UID/GID").count(), 2, "{}", logged);
        assert!(logged.contains("WARN"), "{}", logged);
    }
}
