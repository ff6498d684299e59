//! Archive naming, compression formats and the on-disk catalog.
//!
//! Archives are named `<prefix>-<YYYYMMDD-HHMMSS>.<ext>` where `ext` is one of
//! `tar.gz`, `tar.bz2`, `tar.xz` or `tar.zst`, optionally followed by `.gpg`
//! once the Encryption Wrapper has run.

pub mod builder;
pub mod manifest;

use crate::integrity::ChecksumRecord;
use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Suffix appended to encrypted artifacts.
pub const ENCRYPTED_SUFFIX: &str = "gpg";

/// Timestamp layout embedded in archive names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl CompressionFormat {
    pub const ALL: [CompressionFormat; 4] = [
        CompressionFormat::Gzip,
        CompressionFormat::Bzip2,
        CompressionFormat::Xz,
        CompressionFormat::Zstd,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            CompressionFormat::Gzip => "tar.gz",
            CompressionFormat::Bzip2 => "tar.bz2",
            CompressionFormat::Xz => "tar.xz",
            CompressionFormat::Zstd => "tar.zst",
        }
    }

    /// Match a file name (without any `.gpg` suffix) against the known extensions.
    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|format| name.ends_with(&format!(".{}", format.extension())))
    }

    /// Sniff the compression format from the leading magic bytes of a file.
    pub fn detect(path: &Path) -> std::io::Result<Option<Self>> {
        let mut magic = [0u8; 6];
        let mut file = fs::File::open(path)?;
        let mut read = 0;
        while read < magic.len() {
            let n = file.read(&mut magic[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        let magic = &magic[..read];

        let format = if magic.starts_with(&[0x1f, 0x8b]) {
            Some(CompressionFormat::Gzip)
        } else if magic.starts_with(b"BZh") {
            Some(CompressionFormat::Bzip2)
        } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Some(CompressionFormat::Xz)
        } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Some(CompressionFormat::Zstd)
        } else {
            None
        };
        Ok(format)
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionFormat::Gzip => "gzip",
            CompressionFormat::Bzip2 => "bzip2",
            CompressionFormat::Xz => "xz",
            CompressionFormat::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

impl FromStr for CompressionFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(CompressionFormat::Gzip),
            "bzip2" | "bz2" => Ok(CompressionFormat::Bzip2),
            "xz" => Ok(CompressionFormat::Xz),
            "zstd" | "zst" => Ok(CompressionFormat::Zstd),
            other => Err(format!(
                "unsupported compression format '{}' (expected gzip, bzip2, xz or zstd)",
                other
            )),
        }
    }
}

/// Parsed archive file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub prefix: String,
    pub timestamp: NaiveDateTime,
    pub format: CompressionFormat,
    pub encrypted: bool,
}

impl ArchiveName {
    pub fn new(prefix: &str, at: DateTime<Local>, format: CompressionFormat) -> Self {
        // Archive names carry second precision only.
        let stamp = at.format(TIMESTAMP_FORMAT).to_string();
        let timestamp = NaiveDateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| at.naive_local());
        Self {
            prefix: prefix.to_string(),
            timestamp,
            format,
            encrypted: false,
        }
    }

    /// `<prefix>-<timestamp>`, also the name of the archive's top-level directory.
    pub fn stem(&self) -> String {
        format!("{}-{}", self.prefix, self.timestamp.format(TIMESTAMP_FORMAT))
    }

    pub fn file_name(&self) -> String {
        let plain = format!("{}.{}", self.stem(), self.format.extension());
        if self.encrypted {
            format!("{}.{}", plain, ENCRYPTED_SUFFIX)
        } else {
            plain
        }
    }

    pub fn encrypted(&self) -> Self {
        Self {
            encrypted: true,
            ..self.clone()
        }
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let (plain, encrypted) = split_encrypted(file_name);
        let format = CompressionFormat::from_file_name(plain)?;
        let stem = plain.strip_suffix(&format!(".{}", format.extension()))?;

        // "YYYYMMDD-HHMMSS" is 15 characters, preceded by '-'.
        if stem.len() < 17 || !stem.is_char_boundary(stem.len() - 16) {
            return None;
        }
        let (prefix, rest) = stem.split_at(stem.len() - 16);
        let stamp = rest.strip_prefix('-')?;
        let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        if prefix.is_empty() {
            return None;
        }

        Some(Self {
            prefix: prefix.to_string(),
            timestamp,
            format,
            encrypted,
        })
    }
}

/// Split a trailing `.gpg` off a file name.
pub fn split_encrypted(file_name: &str) -> (&str, bool) {
    match file_name.strip_suffix(&format!(".{}", ENCRYPTED_SUFFIX)) {
        Some(plain) => (plain, true),
        None => (file_name, false),
    }
}

/// Format and encryption implied by a file name, if it has a recognized extension.
pub fn classify(file_name: &str) -> Option<(CompressionFormat, bool)> {
    let (plain, encrypted) = split_encrypted(file_name);
    CompressionFormat::from_file_name(plain).map(|format| (format, encrypted))
}

/// A sealed artifact on disk.
#[derive(Debug, Clone)]
pub struct Archive {
    pub path: PathBuf,
    pub name: ArchiveName,
    pub size: u64,
    pub checksum: ChecksumRecord,
}

impl Archive {
    pub fn encrypted(&self) -> bool {
        self.name.encrypted
    }

    pub fn format(&self) -> CompressionFormat {
        self.name.format
    }
}

/// One archive found in an output directory.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub path: PathBuf,
    pub name: ArchiveName,
    pub size: u64,
    pub has_checksum: bool,
}

/// Contents of an output directory.
#[derive(Debug, Default)]
pub struct Catalog {
    /// Archives, newest first.
    pub archives: Vec<CatalogEntry>,
    /// Sidecars whose archive no longer exists.
    pub orphaned_checksums: Vec<PathBuf>,
}

impl Catalog {
    pub fn scan(dir: &Path) -> std::io::Result<Self> {
        let mut catalog = Catalog::default();
        if !dir.exists() {
            return Ok(catalog);
        }

        for entry in fs::read_dir(dir)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }

            if let Some(subject) = ChecksumRecord::subject_of_sidecar(&file_name) {
                if !dir.join(subject).exists() {
                    catalog.orphaned_checksums.push(path);
                }
                continue;
            }

            if let Some(name) = ArchiveName::parse(&file_name) {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                let has_checksum = ChecksumRecord::sidecar_path(&path).exists();
                catalog.archives.push(CatalogEntry {
                    path,
                    name,
                    size,
                    has_checksum,
                });
            }
        }

        catalog
            .archives
            .sort_by(|a, b| b.name.timestamp.cmp(&a.name.timestamp).then_with(|| b.path.cmp(&a.path)));
        catalog.orphaned_checksums.sort();
        Ok(catalog)
    }

    /// Archives with the given prefix, newest first.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a CatalogEntry> + 'a {
        self.archives.iter().filter(move |entry| entry.name.prefix == prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample_name() -> ArchiveName {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        ArchiveName::new("ai-stack", at, CompressionFormat::Gzip)
    }

    #[test]
    fn test_archive_file_name() {
        let name = sample_name();
        assert_eq!(name.stem(), "ai-stack-20240309-140507");
        assert_eq!(name.file_name(), "ai-stack-20240309-140507.tar.gz");
        assert_eq!(name.encrypted().file_name(), "ai-stack-20240309-140507.tar.gz.gpg");
    }

    #[test]
    fn test_parse_round_trips_names() {
        let name = sample_name().encrypted();
        let parsed = ArchiveName::parse(&name.file_name()).unwrap();
        assert_eq!(parsed, name);

        let dashed = ArchiveName::parse("my-ai-stack-20240101-000000.tar.xz").unwrap();
        assert_eq!(dashed.prefix, "my-ai-stack");
        assert_eq!(dashed.format, CompressionFormat::Xz);
        assert!(!dashed.encrypted);
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!(ArchiveName::parse("backup.zip").is_none());
        assert!(ArchiveName::parse("backup.tar.gz").is_none());
        assert!(ArchiveName::parse("-20240101-000000.tar.gz").is_none());
        assert!(ArchiveName::parse("x-20241301-000000.tar.gz").is_none());
    }

    #[test]
    fn test_classify_extensions() {
        assert_eq!(classify("a.tar.bz2"), Some((CompressionFormat::Bzip2, false)));
        assert_eq!(classify("a.tar.zst.gpg"), Some((CompressionFormat::Zstd, true)));
        assert_eq!(classify("a.tgz"), None);
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("GZIP".parse::<CompressionFormat>().unwrap(), CompressionFormat::Gzip);
        assert_eq!("bz2".parse::<CompressionFormat>().unwrap(), CompressionFormat::Bzip2);
        assert!("lz4".parse::<CompressionFormat>().is_err());
    }

    #[test]
    fn test_detect_magic_bytes() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let gz = dir.path().join("x");
        fs::write(&gz, [0x1f, 0x8b, 0x08, 0x00])?;
        assert_eq!(CompressionFormat::detect(&gz)?, Some(CompressionFormat::Gzip));

        let unknown = dir.path().join("y");
        fs::write(&unknown, b"PK")?;
        assert_eq!(CompressionFormat::detect(&unknown)?, None);
        Ok(())
    }

    #[test]
    fn test_catalog_scan_orders_and_flags_orphans() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("ai-stack-20240101-000000.tar.gz"), b"old")?;
        fs::write(dir.path().join("ai-stack-20240102-000000.tar.gz"), b"new")?;
        fs::write(
            dir.path().join("ai-stack-20240102-000000.tar.gz.sha256"),
            b"00  ai-stack-20240102-000000.tar.gz\n",
        )?;
        fs::write(dir.path().join("gone-20240101-000000.tar.gz.sha256"), b"x")?;
        fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let catalog = Catalog::scan(dir.path())?;
        assert_eq!(catalog.archives.len(), 2);
        assert_eq!(
            catalog.archives[0].path.file_name().unwrap(),
            "ai-stack-20240102-000000.tar.gz"
        );
        assert!(catalog.archives[0].has_checksum);
        assert!(!catalog.archives[1].has_checksum);
        assert_eq!(catalog.orphaned_checksums.len(), 1);
        Ok(())
    }
}
