//! Zip container handling.
//!
//! `mimetype` must be the first entry and stored uncompressed; readers sniff
//! it at a fixed offset. Everything else is deflated.

use crate::error::PipelineError;
use crate::persist::TMP_SUFFIX;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{MIMETYPE, MIMETYPE_FILE};

fn epub_err(path: &Path, detail: impl std::fmt::Display) -> PipelineError {
    PipelineError::Epub {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Archive names of every file under `dir`, `/`-separated.
fn collect_entries(dir: &Path, into: &mut BTreeMap<String, PathBuf>) {
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        if rel.to_string_lossy().ends_with(TMP_SUFFIX) {
            continue;
        }
        let name = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        into.insert(name, entry.path().to_path_buf());
    }
}

fn pack_blocking(layers: &[PathBuf], dest: &Path) -> Result<usize, PipelineError> {
    let mut entries = BTreeMap::new();
    for layer in layers {
        collect_entries(layer, &mut entries);
    }
    entries.remove(MIMETYPE_FILE);

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::persistence(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}{}", dest.display(), TMP_SUFFIX));
    let file = std::fs::File::create(&tmp).map_err(|e| PipelineError::persistence(&tmp, e))?;
    let mut zip = ZipWriter::new(file);

    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(MIMETYPE_FILE, stored)
        .map_err(|e| epub_err(dest, e))?;
    zip.write_all(MIMETYPE.as_bytes())
        .map_err(|e| PipelineError::persistence(&tmp, e))?;

    for (name, path) in &entries {
        let bytes = std::fs::read(path).map_err(|e| PipelineError::persistence(path, e))?;
        zip.start_file(name.as_str(), deflated)
            .map_err(|e| epub_err(dest, e))?;
        zip.write_all(&bytes)
            .map_err(|e| PipelineError::persistence(&tmp, e))?;
    }
    zip.finish().map_err(|e| epub_err(dest, e))?;

    std::fs::rename(&tmp, dest).map_err(|e| PipelineError::persistence(dest, e))?;
    Ok(entries.len() + 1)
}

/// Zip `layers` into `dest`. A file in a later layer replaces the file with
/// the same relative path in an earlier one. The `mimetype` entry is always
/// written from [`MIMETYPE`].
pub async fn pack(layers: Vec<PathBuf>, dest: &Path) -> Result<(), PipelineError> {
    let target = dest.to_path_buf();
    let count = tokio::task::spawn_blocking(move || pack_blocking(&layers, &target))
        .await
        .map_err(|e| PipelineError::Internal(format!("pack task panicked: {e}")))??;
    info!("Packed {} entries into {}", count, dest.display());
    Ok(())
}

/// Upper bound on the buffer reserved from an entry's declared size. The
/// header is untrusted; larger entries still read fine, they just grow.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

fn prealloc_capacity(declared: u64) -> usize {
    declared.min(MAX_PREALLOC) as usize
}

fn unpack_blocking(src: &Path, dest: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let file = std::fs::File::open(src).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PipelineError::FileNotFound {
            path: src.to_path_buf(),
        },
        _ => PipelineError::persistence(src, e),
    })?;
    let mut archive = ZipArchive::new(file).map_err(|e| epub_err(src, e))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| epub_err(src, e))?;
        let Some(rel) = entry.enclosed_name() else {
            debug!("Skipping unsafe entry name {}", entry.name());
            continue;
        };
        let out = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out).map_err(|e| PipelineError::persistence(&out, e))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::persistence(parent, e))?;
        }
        let mut bytes = Vec::with_capacity(prealloc_capacity(entry.size()));
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| epub_err(src, format!("{}: {e}", entry.name())))?;
        std::fs::write(&out, &bytes).map_err(|e| PipelineError::persistence(&out, e))?;
        written.push(out);
    }
    Ok(written)
}

/// Extract `src` into `dest` and return the files written. Entries that
/// would escape `dest` are skipped.
pub async fn unpack(src: &Path, dest: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let (from, to) = (src.to_path_buf(), dest.to_path_buf());
    let files = tokio::task::spawn_blocking(move || unpack_blocking(&from, &to))
        .await
        .map_err(|e| PipelineError::Internal(format!("unpack task panicked: {e}")))??;
    info!("Unpacked {} file(s) from {}", files.len(), src.display());
    Ok(files)
}

/// Relative path of the package document, read from `META-INF/container.xml`.
pub async fn rootfile_path(book_dir: &Path) -> Result<PathBuf, PipelineError> {
    let container = book_dir.join(super::CONTAINER_FILE);
    let xml = tokio::fs::read_to_string(&container)
        .await
        .map_err(|e| PipelineError::persistence(&container, e))?;
    let rel = super::nav::rootfile(&xml)
        .map_err(|e| epub_err(&container, e))?
        .ok_or_else(|| epub_err(&container, "no rootfile element"))?;
    Ok(PathBuf::from(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, body).unwrap();
    }

    #[tokio::test]
    async fn mimetype_is_first_and_stored() {
        let dir = tempfile::tempdir().unwrap();
        let book = dir.path().join("book");
        write(&book, "mimetype", "ignored");
        write(&book, "text/chapter_1.html", "<html/>");
        let dest = dir.path().join("out.epub");
        pack(vec![book], &dest).await.unwrap();

        let mut archive = ZipArchive::new(std::fs::File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut first = archive.by_index(0).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), CompressionMethod::Stored);
        let mut body = String::new();
        first.read_to_string(&mut body).unwrap();
        assert_eq!(body, MIMETYPE);
    }

    #[tokio::test]
    async fn later_layers_override_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let translated = dir.path().join("translated");
        write(&source, "text/a.html", "original a");
        write(&source, "text/b.html", "original b");
        write(&translated, "text/a.html", "translated a");
        let dest = dir.path().join("book.epub");
        pack(vec![source, translated], &dest).await.unwrap();

        let out = dir.path().join("unpacked");
        let files = unpack(&dest, &out).await.unwrap();
        assert_eq!(files.len(), 3);
        assert!(files.contains(&out.join("text/b.html")));
        assert_eq!(std::fs::read_to_string(out.join("text/a.html")).unwrap(), "translated a");
        assert_eq!(std::fs::read_to_string(out.join("text/b.html")).unwrap(), "original b");
        assert!(!dir.path().join("book.epub.tmp").exists());
    }

    #[tokio::test]
    async fn unpack_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = unpack(&dir.path().join("nope.epub"), dir.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound { .. }));
    }

    #[test]
    fn declared_entry_size_does_not_drive_allocation() {
        assert_eq!(prealloc_capacity(512), 512);
        assert_eq!(prealloc_capacity(u64::MAX), MAX_PREALLOC as usize);
    }

    #[tokio::test]
    async fn rootfile_is_read_from_container() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "META-INF/container.xml", super::super::CONTAINER_XML);
        assert_eq!(rootfile_path(dir.path()).await.unwrap(), PathBuf::from("content.opf"));
    }
}
