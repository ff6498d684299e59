//! External tool seam.
//!
//! Every operation the pipeline delegates to a "tool" (compression, checksum,
//! encryption) goes through [`ToolRunner`]. [`SystemTools`] is the production
//! implementation: tar and the codecs run in-process, SHA-256 via `sha2`, and
//! encryption through the `gpg` binary.

pub mod codec;
pub mod gpg;

use crate::archive::CompressionFormat;
use crate::utils::errors::{LifecycleError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub use gpg::{EncryptionKey, GpgCli};

/// Where an archive member's content comes from.
#[derive(Debug, Clone)]
pub enum MemberSource {
    /// A file, directory or symlink on disk (symlinks are stored, not followed).
    Path(PathBuf),
    /// Generated content, stored as a regular file.
    Bytes(Vec<u8>),
}

/// One entry to write into an archive.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    /// Path inside the archive.
    pub archived_as: PathBuf,
    pub source: MemberSource,
    /// Belongs to an optional manifest entry: a file that vanished or became
    /// unreadable since collection is dropped instead of failing the stream.
    pub optional: bool,
}

impl ArchiveMember {
    pub fn path(archived_as: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            archived_as: archived_as.into(),
            source: MemberSource::Path(path.into()),
            optional: false,
        }
    }

    pub fn bytes(archived_as: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            archived_as: archived_as.into(),
            source: MemberSource::Bytes(bytes),
            optional: false,
        }
    }
}

/// An optional member left out of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedMember {
    pub archived_as: PathBuf,
    pub source: PathBuf,
    pub reason: String,
}

/// Produces the members written after all others, once the dropped set is known.
pub type Trailer<'a> = &'a mut dyn FnMut(&[DroppedMember]) -> Result<Vec<ArchiveMember>>;

/// Trailer for streams with nothing to append.
pub fn no_trailer(_dropped: &[DroppedMember]) -> Result<Vec<ArchiveMember>> {
    Ok(Vec::new())
}

pub trait ToolRunner {
    /// Write `members`, then whatever `trailer` returns, as a compressed tar
    /// stream to `dest`.
    fn compress(
        &self,
        members: &[ArchiveMember],
        trailer: Trailer<'_>,
        dest: &Path,
        format: CompressionFormat,
    ) -> Result<()>;

    /// Unpack `archive` into `dest_dir`.
    fn decompress(&self, archive: &Path, format: CompressionFormat, dest_dir: &Path) -> Result<()>;

    /// Decode the whole archive and return its member paths without extracting.
    fn list(&self, archive: &Path, format: CompressionFormat) -> Result<Vec<PathBuf>>;

    /// Lowercase hex SHA-256 of a file.
    fn checksum(&self, path: &Path) -> Result<String>;

    /// Fail with `ToolUnavailable` unless `encrypt` can run for `key`.
    fn check_encryption(&self, key: &EncryptionKey) -> Result<()>;

    fn encrypt(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<()>;

    fn decrypt(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<()>;
}

/// Production tool runner.
#[derive(Debug, Clone, Default)]
pub struct SystemTools {
    gpg: GpgCli,
}

impl SystemTools {
    pub fn new(gpg: GpgCli) -> Self {
        Self { gpg }
    }
}

impl ToolRunner for SystemTools {
    fn compress(
        &self,
        members: &[ArchiveMember],
        trailer: Trailer<'_>,
        dest: &Path,
        format: CompressionFormat,
    ) -> Result<()> {
        let file = File::create(dest)?;
        let encoder = codec::Encoder::new(format, file)
            .map_err(|e| LifecycleError::Compression(format!("{} encoder: {}", format, e)))?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut dropped = Vec::new();
        for member in members {
            if let Some(missing) = append_member(&mut builder, member)? {
                dropped.push(missing);
            }
        }
        for member in trailer(&dropped)? {
            append_member(&mut builder, &member)?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| LifecycleError::Compression(format!("failed to finish tar stream: {}", e)))?;
        let file = encoder
            .finish()
            .map_err(|e| LifecycleError::Compression(format!("failed to finish {} stream: {}", format, e)))?;
        file.sync_all()?;
        Ok(())
    }

    fn decompress(&self, archive: &Path, format: CompressionFormat, dest_dir: &Path) -> Result<()> {
        let reader = codec::decoder(format, File::open(archive)?)?;
        let mut tar = tar::Archive::new(reader);
        tar.set_preserve_permissions(true);
        tar.set_preserve_mtime(true);
        tar.set_overwrite(true);
        tar.unpack(dest_dir).map_err(|e| {
            LifecycleError::Integrity(format!("failed to extract {}: {}", archive.display(), e))
        })
    }

    fn list(&self, archive: &Path, format: CompressionFormat) -> Result<Vec<PathBuf>> {
        let corrupted = |e: io::Error| {
            LifecycleError::Integrity(format!("{} is not a valid {} archive: {}", archive.display(), format, e))
        };

        let reader = codec::decoder(format, File::open(archive)?).map_err(corrupted)?;
        let mut tar = tar::Archive::new(reader);
        let mut paths = Vec::new();
        for entry in tar.entries().map_err(corrupted)? {
            let entry = entry.map_err(corrupted)?;
            paths.push(entry.path().map_err(corrupted)?.into_owned());
        }

        // The tar end marker comes before the compressor trailer; drain the
        // rest so trailer checksums are validated too.
        let mut rest = tar.into_inner();
        io::copy(&mut rest, &mut io::sink()).map_err(corrupted)?;

        Ok(paths)
    }

    fn checksum(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    fn check_encryption(&self, key: &EncryptionKey) -> Result<()> {
        self.gpg.ensure_ready(key)
    }

    fn encrypt(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<()> {
        self.gpg.encrypt(input, output, key)
    }

    fn decrypt(&self, input: &Path, output: &Path, key: &EncryptionKey) -> Result<()> {
        self.gpg.decrypt(input, output, key)
    }
}

/// Append one member. Returns the drop record when an optional source is gone
/// or unreadable; nothing has been written to the stream in that case.
fn append_member<W: Write>(builder: &mut tar::Builder<W>, member: &ArchiveMember) -> Result<Option<DroppedMember>> {
    let failed = |what: &Path, e: io::Error| {
        LifecycleError::Compression(format!("failed to add {} to archive: {}", what.display(), e))
    };

    match &member.source {
        MemberSource::Path(path) => {
            let opened = fs::symlink_metadata(path).and_then(|meta| {
                if meta.is_file() {
                    File::open(path).map(Some)
                } else {
                    Ok(None)
                }
            });
            match opened {
                Ok(Some(mut file)) => builder
                    .append_file(&member.archived_as, &mut file)
                    .map_err(|e| failed(path, e))?,
                Ok(None) => builder
                    .append_path_with_name(path, &member.archived_as)
                    .map_err(|e| failed(path, e))?,
                Err(e) if member.optional && is_skippable(&e) => {
                    return Ok(Some(DroppedMember {
                        archived_as: member.archived_as.clone(),
                        source: path.clone(),
                        reason: e.to_string(),
                    }));
                }
                Err(e) => return Err(failed(path, e)),
            }
        }
        MemberSource::Bytes(bytes) => {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
            builder
                .append_data(&mut header, &member.archived_as, bytes.as_slice())
                .map_err(|e| failed(&member.archived_as, e))?;
        }
    }
    Ok(None)
}

fn is_skippable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_checksum_matches_known_digest() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("abc");
        fs::write(&path, b"abc")?;
        assert_eq!(
            SystemTools::default().checksum(&path)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }

    #[test]
    fn test_list_reports_members_without_extracting() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), b"0123456789")?;
        let archive = dir.path().join("out.tar.xz");
        let members = vec![
            ArchiveMember::path("top", dir.path()),
            ArchiveMember::path("top/a.txt", dir.path().join("a.txt")),
            ArchiveMember::bytes("top/generated.json", b"{}".to_vec()),
        ];

        let tools = SystemTools::default();
        tools.compress(&members, &mut no_trailer, &archive, CompressionFormat::Xz)?;
        let listed = tools.list(&archive, CompressionFormat::Xz)?;
        assert_eq!(listed.len(), 3);
        assert!(listed.contains(&PathBuf::from("top/generated.json")));
        Ok(())
    }

    #[test]
    fn test_vanished_optional_member_is_dropped() -> Result<()> {
        let dir = TempDir::new()?;
        let archive = dir.path().join("out.tar.gz");
        fs::write(dir.path().join("kept.txt"), b"kept")?;
        let gone = dir.path().join("gone.db-journal");

        let mut optional = ArchiveMember::path("top/gone.db-journal", &gone);
        optional.optional = true;
        let members = vec![ArchiveMember::path("top/kept.txt", dir.path().join("kept.txt")), optional];

        let mut seen = Vec::new();
        let mut trailer = |dropped: &[DroppedMember]| -> Result<Vec<ArchiveMember>> {
            seen = dropped.to_vec();
            Ok(vec![ArchiveMember::bytes("top/record.json", format!("{}", dropped.len()).into_bytes())])
        };
        let tools = SystemTools::default();
        tools.compress(&members, &mut trailer, &archive, CompressionFormat::Gzip)?;

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].source, gone);
        let listed = tools.list(&archive, CompressionFormat::Gzip)?;
        assert_eq!(listed, vec![PathBuf::from("top/kept.txt"), PathBuf::from("top/record.json")]);
        Ok(())
    }

    #[test]
    fn test_vanished_required_member_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let members = vec![ArchiveMember::path("top/gone", dir.path().join("gone"))];
        let err = SystemTools::default()
            .compress(&members, &mut no_trailer, &dir.path().join("out.tar.gz"), CompressionFormat::Gzip)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Compression(_)));
        Ok(())
    }

    #[test]
    fn test_list_rejects_garbage() -> Result<()> {
        let dir = TempDir::new()?;
        let archive = dir.path().join("junk.tar.gz");
        fs::write(&archive, b"definitely not gzip")?;
        let err = SystemTools::default()
            .list(&archive, CompressionFormat::Gzip)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Integrity(_)));
        Ok(())
    }
}
