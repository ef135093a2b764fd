//! Firmware package loading.
//!
//! Only the partition-name / file-path / size triples are extracted; the
//! package formats themselves are not interpreted further.

use crate::{Result, VaultError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const SCATTER_SUFFIX: &str = "_Android_scatter.txt";
const RAWPROGRAM_PREFIX: &str = "rawprogram";
const PARTITION_LIST_FILE: &str = "partitions.json";

/// Name fragments of partitions that must not be flashed in safe mode.
const CRITICAL_FRAGMENTS: &[&str] = &[
    "efs", "modem", "persist", "nvram", "nvdata", "secxml", "bootloader", "abl", "xbl",
];

/// Whether a partition name looks like calibration, radio or bootloader
/// data.
pub fn is_critical_partition(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    CRITICAL_FRAGMENTS.iter().any(|f| lower.contains(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareKind {
    /// Qualcomm `rawprogram*.xml` plus images
    QualcommRawProgram,
    /// Folder of `<partition>.img` files
    ImageFolder,
    /// MediaTek scatter file plus images
    MediaTekScatter,
    /// JSON partition list
    PartitionList,
    /// One `<partition>.img`
    SingleImage,
}

/// One image to flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePartition {
    pub partition_name: String,
    pub file_path: PathBuf,
    /// Size on disk when the package was loaded
    pub size: u64,
    /// Raw sector offset, for formats that address by LBA
    pub start_sector: Option<u64>,
    pub is_critical: bool,
    pub selected: bool,
}

impl FirmwarePartition {
    /// Entry for `file_path`, criticality guessed from the name.
    pub fn new(partition_name: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        let partition_name = partition_name.into();
        let file_path = file_path.into();
        Self {
            size: fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0),
            is_critical: is_critical_partition(&partition_name),
            partition_name,
            file_path,
            start_sector: None,
            selected: true,
        }
    }
}

/// Ordered list of images making up a firmware package.
#[derive(Debug, Clone)]
pub struct FirmwareManifest {
    pub name: String,
    pub kind: FirmwareKind,
    pub base_dir: PathBuf,
    pub partitions: Vec<FirmwarePartition>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PartitionListFile {
    Wrapped {
        #[serde(default)]
        name: Option<String>,
        partitions: Vec<ListedPartition>,
    },
    Bare(Vec<ListedPartition>),
}

#[derive(Deserialize)]
struct ListedPartition {
    name: String,
    file: PathBuf,
    #[serde(default)]
    start_sector: Option<u64>,
    #[serde(default)]
    critical: Option<bool>,
    #[serde(default = "default_true")]
    selected: bool,
}

fn default_true() -> bool {
    true
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.display().to_string())
}

impl FirmwareManifest {
    /// Load a package from a folder, a rawprogram or scatter file, a JSON
    /// list, or a single image.
    ///
    /// A folder is checked in order: `partitions.json`, `rawprogram*.xml`,
    /// `*_Android_scatter.txt`, then plain images.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VaultError::NotFound(format!("firmware {}", path.display())));
        }

        if path.is_dir() {
            if path.join(PARTITION_LIST_FILE).is_file() {
                return Self::from_partition_list(&path.join(PARTITION_LIST_FILE));
            }
            if let Some(xml) = find_file(path, is_rawprogram)? {
                return Self::from_rawprogram(&xml);
            }
            if let Some(scatter) = find_file(path, |n| n.ends_with(SCATTER_SUFFIX))? {
                return Self::from_scatter(&scatter);
            }
            return Self::from_image_folder(path);
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let lower = file_name.to_ascii_lowercase();

        if file_name.ends_with(SCATTER_SUFFIX) {
            Self::from_scatter(path)
        } else if is_rawprogram(&file_name) {
            Self::from_rawprogram(path)
        } else if lower.ends_with(".json") {
            Self::from_partition_list(path)
        } else if lower.ends_with(".img") {
            let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            Ok(Self {
                name: file_name,
                kind: FirmwareKind::SingleImage,
                base_dir,
                partitions: vec![FirmwarePartition::new(stem, path)],
            })
        } else {
            Err(VaultError::Parse(format!(
                "unrecognised firmware package {}",
                path.display()
            )))
        }
    }

    /// Every `*.img` directly inside `dir`, sorted by name.
    pub fn from_image_folder(dir: &Path) -> Result<Self> {
        let mut partitions = Vec::new();

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| VaultError::Io(e.into()))?;
            let path = entry.path();
            let is_img = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("img"));
            if !entry.file_type().is_file() || !is_img {
                continue;
            }
            if let Some(stem) = path.file_stem() {
                partitions.push(FirmwarePartition::new(stem.to_string_lossy(), path));
            }
        }

        debug!("Image folder {}: {} images", dir.display(), partitions.len());
        Ok(Self {
            name: dir_name(dir),
            kind: FirmwareKind::ImageFolder,
            base_dir: dir.to_path_buf(),
            partitions,
        })
    }

    /// MediaTek scatter file. Entries with `is_download: false` or no image
    /// file are left out.
    pub fn from_scatter(scatter: &Path) -> Result<Self> {
        let content = fs::read_to_string(scatter)?;
        let base_dir = scatter
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let mut partitions = Vec::new();
        let mut current: Option<ScatterRecord> = None;

        for line in content.lines() {
            let line = line.trim().trim_start_matches('-').trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "partition_index" => {
                    if let Some(record) = current.take() {
                        partitions.extend(record.into_partition(&base_dir));
                    }
                    current = Some(ScatterRecord::default());
                }
                "partition_name" => {
                    current.get_or_insert_with(ScatterRecord::default).name = value.to_string();
                }
                "file_name" => {
                    current.get_or_insert_with(ScatterRecord::default).file_name = value.to_string();
                }
                "is_download" => {
                    current.get_or_insert_with(ScatterRecord::default).skip =
                        value.eq_ignore_ascii_case("false");
                }
                _ => {}
            }
        }
        if let Some(record) = current.take() {
            partitions.extend(record.into_partition(&base_dir));
        }

        debug!("Scatter {}: {} images", scatter.display(), partitions.len());
        Ok(Self {
            name: dir_name(&base_dir),
            kind: FirmwareKind::MediaTekScatter,
            base_dir,
            partitions,
        })
    }

    /// Qualcomm `rawprogram*.xml`. Every `<program>` element with both a
    /// `filename` and a `label` becomes an entry targeting the partition
    /// named by `label`.
    pub fn from_rawprogram(xml: &Path) -> Result<Self> {
        let content = fs::read_to_string(xml)?;
        let base_dir = xml.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

        let mut partitions = Vec::new();
        for attributes in program_elements(&content)? {
            let field = |key: &str| {
                attributes
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
                    .filter(|v| !v.is_empty())
            };
            let (Some(file_name), Some(label)) = (field("filename"), field("label")) else {
                continue;
            };
            partitions.push(FirmwarePartition::new(label, base_dir.join(file_name)));
        }

        debug!("Rawprogram {}: {} images", xml.display(), partitions.len());
        Ok(Self {
            name: dir_name(&base_dir),
            kind: FirmwareKind::QualcommRawProgram,
            base_dir,
            partitions,
        })
    }

    /// JSON list, either a bare array or `{ "name", "partitions": [...] }`.
    /// File paths are relative to the list.
    pub fn from_partition_list(list: &Path) -> Result<Self> {
        let content = fs::read_to_string(list)?;
        let parsed: PartitionListFile =
            serde_json::from_str(&content).map_err(|e| VaultError::Parse(e.to_string()))?;
        let base_dir = list.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

        let (name, listed) = match parsed {
            PartitionListFile::Wrapped { name, partitions } => {
                (name.unwrap_or_else(|| dir_name(&base_dir)), partitions)
            }
            PartitionListFile::Bare(partitions) => (dir_name(&base_dir), partitions),
        };

        let partitions = listed
            .into_iter()
            .map(|p| {
                let mut partition = FirmwarePartition::new(p.name, base_dir.join(&p.file));
                partition.start_sector = p.start_sector;
                if let Some(critical) = p.critical {
                    partition.is_critical = critical;
                }
                partition.selected = p.selected;
                partition
            })
            .collect();

        Ok(Self {
            name,
            kind: FirmwareKind::PartitionList,
            base_dir,
            partitions,
        })
    }

    /// Entries that will be flashed, in order.
    pub fn selected(&self) -> impl Iterator<Item = &FirmwarePartition> {
        self.partitions.iter().filter(|p| p.selected)
    }

    /// Sum of selected image sizes.
    pub fn total_size(&self) -> u64 {
        self.selected().map(|p| p.size).sum()
    }
}

fn is_rawprogram(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    lower.starts_with(RAWPROGRAM_PREFIX) && lower.ends_with(".xml")
}

/// First file directly inside `dir`, by name, whose name matches.
fn find_file(dir: &Path, matches: impl Fn(&str) -> bool) -> Result<Option<PathBuf>> {
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| VaultError::Io(e.into()))?;
        if entry.file_type().is_file() && matches(&entry.file_name().to_string_lossy()) {
            return Ok(Some(entry.into_path()));
        }
    }
    Ok(None)
}

/// Attribute lists of every `<program ...>` element, in document order.
/// Comments are skipped; nothing else about the document is checked.
fn program_elements(xml: &str) -> Result<Vec<Vec<(String, String)>>> {
    let mut elements = Vec::new();
    let mut rest = xml;

    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];

        if let Some(comment) = rest.strip_prefix("!--") {
            let end = comment
                .find("-->")
                .ok_or_else(|| VaultError::Parse("unterminated XML comment".to_string()))?;
            rest = &comment[end + 3..];
            continue;
        }

        let end = rest
            .find('>')
            .ok_or_else(|| VaultError::Parse("unterminated XML tag".to_string()))?;
        let tag = &rest[..end];
        rest = &rest[end + 1..];

        let Some(body) = tag.strip_prefix("program") else {
            continue;
        };
        if body.starts_with(|c: char| c.is_whitespace() || c == '/') || body.is_empty() {
            elements.push(parse_attributes(body)?);
        }
    }

    Ok(elements)
}

fn parse_attributes(mut body: &str) -> Result<Vec<(String, String)>> {
    let mut attributes = Vec::new();
    loop {
        body = body.trim_start();
        if body.is_empty() || body.starts_with('/') {
            return Ok(attributes);
        }

        let malformed = || VaultError::Parse(format!("malformed XML attribute near '{}'", body));
        let (key, value) = body.split_once('=').ok_or_else(malformed)?;
        let value = value.trim_start();
        let quote = value
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(malformed)?;
        let close = value[1..].find(quote).ok_or_else(malformed)?;

        attributes.push((key.trim().to_string(), unescape(&value[1..1 + close])));
        body = &value[close + 2..];
    }
}

fn unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[derive(Default)]
struct ScatterRecord {
    name: String,
    file_name: String,
    skip: bool,
}

impl ScatterRecord {
    fn into_partition(self, base_dir: &Path) -> Option<FirmwarePartition> {
        if self.skip || self.name.is_empty() {
            return None;
        }
        if self.file_name.is_empty() || self.file_name.eq_ignore_ascii_case("NONE") {
            return None;
        }

        let path = base_dir.join(&self.file_name);
        if !path.is_file() {
            warn!("Scatter lists {} but {} is missing", self.name, self.file_name);
            return None;
        }
        Some(FirmwarePartition::new(self.name, path))
    }
}
