//! Package index extraction - the set of artifacts a synced metadata tree refers to
//!
//! Index files are published in several compression formats. The first
//! candidate found in [`Compression::PRIORITY`] order is used and no other
//! candidate is consulted. A missing index is not an error: the coordinate
//! simply contributes nothing. A file that fails to decompress or decode is
//! logged and also contributes nothing, without affecting its siblings.

use flate2::read::MultiGzDecoder;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use xz2::read::XzDecoder;

use crate::repository::METADATA_ROOT;

/// A path relative to an artifact root, without a leading separator
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactPath(String);

impl ArtifactPath {
    /// Normalise a raw index value; `None` when nothing remains.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let path = trimmed.strip_prefix('/').unwrap_or(trimmed);
        if path.is_empty() {
            None
        } else {
            Some(Self(path.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path relative to `root` when it starts with that segment.
    pub fn relative_to(&self, root: &str) -> &str {
        let root = root.trim_matches('/');
        if root.is_empty() {
            return &self.0;
        }
        self.0
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deduplicated artifacts required by one repository (or one RPM tree)
pub type RequiredArtifactSet = BTreeSet<ArtifactPath>;

/// Compression formats, in lookup priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
    Plain,
}

impl Compression {
    pub const PRIORITY: [Compression; 4] = [
        Compression::Gzip,
        Compression::Xz,
        Compression::Zstd,
        Compression::Plain,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Compression::Gzip => ".gz",
            Compression::Xz => ".xz",
            Compression::Zstd => ".zst",
            Compression::Plain => "",
        }
    }

    fn open(self, path: &Path) -> io::Result<Box<dyn BufRead>> {
        let file = File::open(path)?;
        Ok(match self {
            Compression::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(file))),
            Compression::Xz => Box::new(BufReader::new(XzDecoder::new(file))),
            Compression::Zstd => Box::new(BufReader::new(zstd::stream::read::Decoder::new(file)?)),
            Compression::Plain => Box::new(BufReader::new(file)),
        })
    }

    /// Split a known compression suffix off a file path.
    fn strip(path: &Path) -> (PathBuf, Option<Compression>) {
        let text = path.to_string_lossy();
        for compression in Self::PRIORITY {
            let suffix = compression.suffix();
            if suffix.is_empty() {
                continue;
            }
            if let Some(base) = text.strip_suffix(suffix) {
                return (PathBuf::from(base), Some(compression));
            }
        }
        (path.to_path_buf(), None)
    }
}

/// An index file that exists on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFile {
    pub path: PathBuf,
    pub compression: Compression,
}

/// Find the index for an uncompressed base path, e.g. `.../binary-amd64/Packages`.
pub fn locate(base: &Path) -> Option<IndexFile> {
    Compression::PRIORITY.into_iter().find_map(|compression| {
        let mut candidate = base.as_os_str().to_owned();
        candidate.push(compression.suffix());
        let path = PathBuf::from(candidate);
        path.is_file().then_some(IndexFile { path, compression })
    })
}

/// How artifact paths are recorded in an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    /// Debian `Packages`: one `Filename:` field per stanza
    Packages,
    /// Debian `Sources`: `Directory:` plus the names under `Files:`
    Sources,
    /// RPM `primary.xml`: one `<location href=…/>` per package
    RpmPrimary,
}

const FILENAME_FIELD: &str = "Filename: ";

fn location_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"<location\b[^>]*?\shref="([^"]+)""#).expect("location pattern is valid")
    })
}

fn data_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"<data\b[^>]*?\stype="([^"]+)""#).expect("data pattern is valid")
    })
}

/// Parse an index stream into the artifact paths it references
pub fn parse_index(reader: impl BufRead, format: IndexFormat) -> io::Result<RequiredArtifactSet> {
    match format {
        IndexFormat::Packages => parse_packages(reader),
        IndexFormat::Sources => parse_sources(reader),
        IndexFormat::RpmPrimary => parse_rpm_primary(reader),
    }
}

fn parse_packages(reader: impl BufRead) -> io::Result<RequiredArtifactSet> {
    let mut artifacts = RequiredArtifactSet::new();
    for line in reader.lines() {
        let line = line?;
        if let Some(value) = line.strip_prefix(FILENAME_FIELD) {
            artifacts.extend(ArtifactPath::new(value));
        }
    }
    Ok(artifacts)
}

fn parse_sources(reader: impl BufRead) -> io::Result<RequiredArtifactSet> {
    let mut artifacts = RequiredArtifactSet::new();
    let mut directory: Option<String> = None;
    let mut files: Vec<String> = Vec::new();
    let mut in_files = false;

    let mut flush = |directory: &mut Option<String>, files: &mut Vec<String>| {
        if let Some(dir) = directory.take() {
            let dir = dir.trim_end_matches('/');
            for name in files.iter() {
                artifacts.extend(ArtifactPath::new(&format!("{}/{}", dir, name)));
            }
        }
        files.clear();
    };

    for line in reader.lines() {
        let line = line?;

        if line.trim().is_empty() {
            flush(&mut directory, &mut files);
            in_files = false;
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous field: "<md5> <size> <name>"
            if in_files {
                if let Some(name) = line.split_whitespace().nth(2) {
                    files.push(name.to_string());
                }
            }
            continue;
        }

        in_files = false;
        if let Some(value) = line.strip_prefix("Directory:") {
            directory = Some(value.trim().to_string());
        } else if line.starts_with("Files:") {
            in_files = true;
        }
    }
    flush(&mut directory, &mut files);

    Ok(artifacts)
}

fn parse_rpm_primary(reader: impl BufRead) -> io::Result<RequiredArtifactSet> {
    let mut artifacts = RequiredArtifactSet::new();
    for line in reader.lines() {
        let line = line?;
        for captures in location_pattern().captures_iter(&line) {
            artifacts.extend(ArtifactPath::new(&captures[1]));
        }
    }
    Ok(artifacts)
}

/// Path of the primary metadata file named by a `repomd.xml`, relative to the tree root
pub fn primary_location(repomd: impl BufRead) -> io::Result<Option<String>> {
    let mut in_primary = false;
    for line in repomd.lines() {
        let line = line?;
        if let Some(captures) = data_type_pattern().captures(&line) {
            in_primary = &captures[1] == "primary";
        }
        if in_primary {
            if let Some(captures) = location_pattern().captures(&line) {
                return Ok(Some(captures[1].to_string()));
            }
        }
        if line.contains("</data>") {
            in_primary = false;
        }
    }
    Ok(None)
}

/// One place a package index is published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexCoordinate {
    /// `dists/<suite>/<component>/binary-<arch>/Packages`
    Binary {
        suite: String,
        component: String,
        arch: String,
    },
    /// `dists/<suite>/<component>/source/Sources`
    Source { suite: String, component: String },
    /// An RPM tree root, relative to the repository directory
    Tree { path: String },
}

impl fmt::Display for IndexCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexCoordinate::Binary {
                suite,
                component,
                arch,
            } => write!(f, "{}/{}/binary-{}", suite, component, arch),
            IndexCoordinate::Source { suite, component } => {
                write!(f, "{}/{}/source", suite, component)
            }
            IndexCoordinate::Tree { path } => f.write_str(path),
        }
    }
}

/// Reads synced metadata and reports the artifacts it references
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageIndexExtractor;

impl PackageIndexExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Artifacts referenced by the index at `coordinate` under `repo_dir`.
    ///
    /// Never fails: absent or unreadable indexes contribute an empty set.
    pub fn extract(&self, repo_dir: &Path, coordinate: &IndexCoordinate) -> RequiredArtifactSet {
        match coordinate {
            IndexCoordinate::Binary {
                suite,
                component,
                arch,
            } => {
                let base = repo_dir
                    .join(METADATA_ROOT)
                    .join(suite)
                    .join(component)
                    .join(format!("binary-{}", arch))
                    .join("Packages");
                self.extract_file(&base, IndexFormat::Packages)
            }
            IndexCoordinate::Source { suite, component } => {
                let base = repo_dir
                    .join(METADATA_ROOT)
                    .join(suite)
                    .join(component)
                    .join("source")
                    .join("Sources");
                self.extract_file(&base, IndexFormat::Sources)
            }
            IndexCoordinate::Tree { path } => self.extract_tree(&repo_dir.join(path)),
        }
    }

    fn extract_tree(&self, tree_dir: &Path) -> RequiredArtifactSet {
        let repomd = tree_dir.join("repodata").join("repomd.xml");
        let file = match File::open(&repomd) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("No repomd.xml found in {}", repomd.parent().unwrap_or(tree_dir).display());
                return RequiredArtifactSet::new();
            }
            Err(e) => {
                error!("Failed to open {}: {}", repomd.display(), e);
                return RequiredArtifactSet::new();
            }
        };

        let href = match primary_location(BufReader::new(file)) {
            Ok(Some(href)) => href,
            Ok(None) => {
                warn!("{} does not list primary metadata", repomd.display());
                return RequiredArtifactSet::new();
            }
            Err(e) => {
                error!("Failed to parse {}: {}", repomd.display(), e);
                return RequiredArtifactSet::new();
            }
        };

        let (base, _) = Compression::strip(&tree_dir.join(href.trim_start_matches('/')));
        self.extract_file(&base, IndexFormat::RpmPrimary)
    }

    /// Locate the index for `base` and parse it, isolating any failure to this file.
    pub fn extract_file(&self, base: &Path, format: IndexFormat) -> RequiredArtifactSet {
        let Some(index) = locate(base) else {
            warn!(
                "No {} index found in {}",
                base.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
                base.parent().unwrap_or(base).display()
            );
            return RequiredArtifactSet::new();
        };

        debug!("Parsing {} ({:?})", index.path.display(), index.compression);

        let parsed = index
            .compression
            .open(&index.path)
            .and_then(|reader| parse_index(reader, format));

        match parsed {
            Ok(artifacts) => {
                debug!("  {} artifacts in {}", artifacts.len(), index.path.display());
                artifacts
            }
            Err(e) => {
                error!("Failed to parse {}: {}", index.path.display(), e);
                RequiredArtifactSet::new()
            }
        }
    }

    /// Union of the artifacts referenced at every coordinate
    pub fn extract_all<'a>(
        &self,
        repo_dir: &Path,
        coordinates: impl IntoIterator<Item = &'a IndexCoordinate>,
    ) -> RequiredArtifactSet {
        let mut required = RequiredArtifactSet::new();
        for coordinate in coordinates {
            required.extend(self.extract(repo_dir, coordinate));
        }
        info!("  Found {} unique artifacts in {}", required.len(), repo_dir.display());
        required
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::TempDir;

    fn set(paths: &[&str]) -> RequiredArtifactSet {
        paths.iter().filter_map(|p| ArtifactPath::new(p)).collect()
    }

    fn binary(suite: &str, component: &str, arch: &str) -> IndexCoordinate {
        IndexCoordinate::Binary {
            suite: suite.to_string(),
            component: component.to_string(),
            arch: arch.to_string(),
        }
    }

    #[test]
    fn test_artifact_path_normalisation() {
        assert_eq!(ArtifactPath::new("  /pool/main/a.deb \n").unwrap().as_str(), "pool/main/a.deb");
        assert_eq!(ArtifactPath::new("//x").unwrap().as_str(), "/x");
        assert!(ArtifactPath::new("   ").is_none());
        assert!(ArtifactPath::new("/").is_none());
    }

    #[test]
    fn test_artifact_path_relative_to_root() {
        let path = ArtifactPath::new("pool/main/a/apt/apt.deb").unwrap();
        assert_eq!(path.relative_to("pool"), "main/a/apt/apt.deb");
        assert_eq!(path.relative_to("pool/"), "main/a/apt/apt.deb");
        assert_eq!(path.relative_to(""), "pool/main/a/apt/apt.deb");

        let other = ArtifactPath::new("poolside/x.deb").unwrap();
        assert_eq!(other.relative_to("pool"), "poolside/x.deb");
    }

    #[test]
    fn test_parse_packages() {
        let artifacts = parse_index(PACKAGES.as_bytes(), IndexFormat::Packages).unwrap();
        assert_eq!(artifacts, set(&["pool/main/a.deb", "pool/main/b.deb"]));
    }

    #[test]
    fn test_parse_packages_ignores_similar_fields() {
        let content = "Package: x\nOriginal-Filename: nope.deb\nFilename:nospace.deb\n";
        let artifacts = parse_index(content.as_bytes(), IndexFormat::Packages).unwrap();
        assert!(artifacts.is_empty());
    }

    #[test]
    fn test_parse_sources() {
        let content = "\
Package: hello
Files:
 5c4b2d 1234 hello_2.10-3.dsc
 9a8b7c 72558 hello_2.10.orig.tar.gz
Checksums-Sha256:
 aaaa 1234 hello_2.10-3.dsc
Directory: pool/main/h/hello

Package: zlib
Directory: /pool/main/z/zlib/
Files:
 0f0f 99 zlib_1.3.dsc
";
        let artifacts = parse_index(content.as_bytes(), IndexFormat::Sources).unwrap();
        assert_eq!(
            artifacts,
            set(&[
                "pool/main/h/hello/hello_2.10-3.dsc",
                "pool/main/h/hello/hello_2.10.orig.tar.gz",
                "pool/main/z/zlib/zlib_1.3.dsc",
            ])
        );
    }

    #[test]
    fn test_parse_rpm_primary() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" packages="2">
<package type="rpm">
  <name>bash</name>
  <location href="Packages/b/bash-5.1.8-6.el9.x86_64.rpm"/>
</package>
<package type="rpm">
  <name>libstdc++</name>
  <location xml:base="https://example.org/" href="Packages/l/libstdc++-11.4.1.el9.x86_64.rpm"/>
</package>
</metadata>
"#;
        let artifacts = parse_index(content.as_bytes(), IndexFormat::RpmPrimary).unwrap();
        assert_eq!(
            artifacts,
            set(&[
                "Packages/b/bash-5.1.8-6.el9.x86_64.rpm",
                "Packages/l/libstdc++-11.4.1.el9.x86_64.rpm",
            ])
        );
    }

    #[test]
    fn test_parse_rpm_primary_single_line() {
        let content = concat!(
            r#"<metadata packages="2"><package type="rpm"><name>a</name>"#,
            r#"<location href="Packages/a/a-1.rpm"/></package><package type="rpm">"#,
            r#"<name>b</name><location href="Packages/b/b-1.rpm"/></package></metadata>"#,
        );
        let artifacts = parse_index(content.as_bytes(), IndexFormat::RpmPrimary).unwrap();
        assert_eq!(artifacts, set(&["Packages/a/a-1.rpm", "Packages/b/b-1.rpm"]));
    }

    #[test]
    fn test_primary_location_from_repomd() {
        let repomd = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <data type="primary_db">
    <location href="repodata/aaa-primary.sqlite.bz2"/>
  </data>
  <data type="filelists">
    <location href="repodata/bbb-filelists.xml.gz"/>
  </data>
  <data type="primary">
    <checksum type="sha256">ccc</checksum>
    <location href="repodata/ccc-primary.xml.gz"/>
  </data>
</repomd>
"#;
        assert_eq!(
            primary_location(repomd.as_bytes()).unwrap().as_deref(),
            Some("repodata/ccc-primary.xml.gz")
        );
        assert_eq!(primary_location("<repomd/>".as_bytes()).unwrap(), None);
    }

    #[test]
    fn test_locate_priority_prefers_gzip() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("Packages");
        write_plain(&base, "Filename: plain.deb\n");
        write_xz(&temp.path().join("Packages.xz"), "Filename: xz.deb\n");
        write_gz(&temp.path().join("Packages.gz"), "Filename: gz.deb\n");

        for _ in 0..3 {
            let found = locate(&base).unwrap();
            assert_eq!(found.compression, Compression::Gzip);
            assert_eq!(found.path, temp.path().join("Packages.gz"));
        }

        let extractor = PackageIndexExtractor::new();
        assert_eq!(extractor.extract_file(&base, IndexFormat::Packages), set(&["gz.deb"]));
    }

    #[test]
    fn test_locate_falls_through_formats() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("Packages");
        assert!(locate(&base).is_none());

        write_plain(&base, "Filename: plain.deb\n");
        assert_eq!(locate(&base).unwrap().compression, Compression::Plain);

        write_zst(&temp.path().join("Packages.zst"), "Filename: zst.deb\n");
        assert_eq!(locate(&base).unwrap().compression, Compression::Zstd);

        let extractor = PackageIndexExtractor::new();
        assert_eq!(extractor.extract_file(&base, IndexFormat::Packages), set(&["zst.deb"]));

        write_xz(&temp.path().join("Packages.xz"), "Filename: xz.deb\n");
        assert_eq!(locate(&base).unwrap().compression, Compression::Xz);
        assert_eq!(extractor.extract_file(&base, IndexFormat::Packages), set(&["xz.deb"]));
    }

    #[test]
    fn test_extract_binary_coordinate_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let index = temp.path().join("dists/x/main/binary-amd64/Packages.gz");
        write_gz(&index, PACKAGES);

        let extractor = PackageIndexExtractor::new();
        let first = extractor.extract(temp.path(), &binary("x", "main", "amd64"));
        let second = extractor.extract(temp.path(), &binary("x", "main", "amd64"));

        assert_eq!(first, set(&["pool/main/a.deb", "pool/main/b.deb"]));
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_index_contributes_nothing() {
        let temp = TempDir::new().unwrap();
        let extractor = PackageIndexExtractor::new();
        assert!(extractor.extract(temp.path(), &binary("x", "main", "amd64")).is_empty());
        assert!(extractor
            .extract(temp.path(), &IndexCoordinate::Tree { path: "9/BaseOS/x86_64/os".to_string() })
            .is_empty());
    }

    #[test]
    fn test_corrupt_index_is_isolated() {
        let temp = TempDir::new().unwrap();
        // Not gzip data despite the suffix
        write_plain(
            &temp.path().join("dists/x/main/binary-amd64/Packages.gz"),
            "Filename: pool/main/bogus.deb\n",
        );
        write_xz(
            &temp.path().join("dists/x/main/binary-arm64/Packages.xz"),
            "Filename: pool/main/good.deb\n",
        );
        // Invalid UTF-8 after a valid entry: the whole file is discarded
        let bad_utf8 = temp.path().join("dists/x/contrib/binary-amd64/Packages");
        std::fs::create_dir_all(bad_utf8.parent().unwrap()).unwrap();
        std::fs::write(&bad_utf8, b"Filename: pool/contrib/ok.deb\nFilename: \xff\xfe.deb\n").unwrap();

        let coordinates = vec![
            binary("x", "main", "amd64"),
            binary("x", "main", "arm64"),
            binary("x", "contrib", "amd64"),
        ];
        let extractor = PackageIndexExtractor::new();
        let required = extractor.extract_all(temp.path(), &coordinates);

        assert_eq!(required, set(&["pool/main/good.deb"]));
    }

    #[test]
    fn test_extract_source_coordinate() {
        let temp = TempDir::new().unwrap();
        write_xz(
            &temp.path().join("dists/x/main/source/Sources.xz"),
            "Package: hello\nDirectory: pool/main/h/hello\nFiles:\n abc 1 hello_1.dsc\n",
        );

        let extractor = PackageIndexExtractor::new();
        let required = extractor.extract(
            temp.path(),
            &IndexCoordinate::Source {
                suite: "x".to_string(),
                component: "main".to_string(),
            },
        );
        assert_eq!(required, set(&["pool/main/h/hello/hello_1.dsc"]));
    }

    #[test]
    fn test_extract_tree_coordinate() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("9/BaseOS/x86_64/os");
        write_plain(
            &tree.join("repodata/repomd.xml"),
            "<repomd>\n<data type=\"primary\">\n<location href=\"repodata/123-primary.xml.xz\"/>\n</data>\n</repomd>\n",
        );
        // A gzip sibling wins over the advertised xz file
        write_gz(
            &tree.join("repodata/123-primary.xml.gz"),
            "<package>\n<location href=\"Packages/b/bash.rpm\"/>\n</package>\n",
        );
        write_xz(
            &tree.join("repodata/123-primary.xml.xz"),
            "<package>\n<location href=\"Packages/z/zsh.rpm\"/>\n</package>\n",
        );

        let extractor = PackageIndexExtractor::new();
        let required = extractor.extract(
            temp.path(),
            &IndexCoordinate::Tree {
                path: "9/BaseOS/x86_64/os".to_string(),
            },
        );
        assert_eq!(required, set(&["Packages/b/bash.rpm"]));
    }

    #[test]
    fn test_coordinate_display() {
        assert_eq!(binary("jammy", "main", "amd64").to_string(), "jammy/main/binary-amd64");
        assert_eq!(
            IndexCoordinate::Tree { path: "9/CRB/x86_64/os".to_string() }.to_string(),
            "9/CRB/x86_64/os"
        );
    }
}
