use crate::DmgError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

static SIZE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?\s*[KMGTkmgt]?$").expect("size pattern is valid"));

/// Encryption passphrase. Only ever delivered to a tool on standard input.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bytes for the tool's standard input, or `None` when unencrypted.
    pub fn stdin_bytes(&self) -> Option<Vec<u8>> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.as_bytes().to_vec())
        }
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Passphrase(none)")
        } else {
            f.write_str("Passphrase(<redacted>)")
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    WritableToReadOnly,
    ReadOnlyToWritable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CreateMode {
    FromFolder,
    Empty,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Filesystem {
    #[serde(rename = "APFS")]
    Apfs,
    #[serde(rename = "HFS+J")]
    HfsPlusJournaled,
}

impl Filesystem {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Filesystem::Apfs => "APFS",
            Filesystem::HfsPlusJournaled => "HFS+J",
        }
    }
}

/// Container formats understood by `hdiutil`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageFormat {
    /// zlib-compressed, read-only
    #[serde(rename = "UDZO")]
    Compressed,
    /// Read/write, block-editable
    #[serde(rename = "UDRW")]
    ReadWrite,
    /// Sparse read/write, grows as written
    #[serde(rename = "UDSP")]
    Sparse,
}

impl ImageFormat {
    pub fn as_arg(&self) -> &'static str {
        match self {
            ImageFormat::Compressed => "UDZO",
            ImageFormat::ReadWrite => "UDRW",
            ImageFormat::Sparse => "UDSP",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    pub fn format(&self) -> ImageFormat {
        match self {
            Access::ReadOnly => ImageFormat::Compressed,
            Access::ReadWrite => ImageFormat::ReadWrite,
        }
    }
}

/// Validated size for an empty image, e.g. `200m` or `1.5g`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeSpec(String);

impl SizeSpec {
    pub fn parse(text: &str) -> Result<Self, DmgError> {
        let trimmed = text.trim();
        if !SIZE_PATTERN.is_match(trimmed) {
            return Err(DmgError::Validation(format!(
                "invalid size '{}' (examples: 200m, 1g)",
                text
            )));
        }
        // hdiutil wants the unit glued to the number
        Ok(Self(trimmed.split_whitespace().collect()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreationRequest {
    pub mode: CreateMode,
    #[serde(default)]
    pub source_folder: Option<PathBuf>,
    /// Only read for [`CreateMode::Empty`].
    #[serde(default)]
    pub size: String,
    pub volume_name: String,
    pub filesystem: Filesystem,
    pub access: Access,
    pub destination: PathBuf,
    #[serde(default)]
    pub passphrase: Passphrase,
}

/// What a creation request resolved to after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationSource {
    Folder(PathBuf),
    Empty(SizeSpec),
}

impl CreationRequest {
    pub fn validate(&self) -> Result<CreationSource, DmgError> {
        if self.volume_name.trim().is_empty() {
            return Err(DmgError::Validation("volume name is empty".to_string()));
        }
        if self.destination.as_os_str().is_empty() {
            return Err(DmgError::Validation("destination is empty".to_string()));
        }
        match self.mode {
            CreateMode::FromFolder => {
                let folder = self.source_folder.as_ref().ok_or_else(|| {
                    DmgError::Validation("no source folder selected".to_string())
                })?;
                if !folder.is_dir() {
                    return Err(DmgError::Validation(format!(
                        "source folder does not exist: {}",
                        folder.display()
                    )));
                }
                Ok(CreationSource::Folder(folder.clone()))
            }
            CreateMode::Empty => {
                // an empty container is only useful writable
                if self.access == Access::ReadOnly {
                    return Err(DmgError::Validation(
                        "an empty image can only be created read-write".to_string(),
                    ));
                }
                SizeSpec::parse(&self.size).map(CreationSource::Empty)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversionRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub direction: Direction,
    #[serde(default)]
    pub embed_app_icon: bool,
    #[serde(default)]
    pub passphrase: Passphrase,
}

impl ConversionRequest {
    pub fn validate(&self) -> Result<(), DmgError> {
        if !self.source.is_file() {
            return Err(DmgError::Validation(format!(
                "source image does not exist: {}",
                self.source.display()
            )));
        }
        if self.destination.as_os_str().is_empty() {
            return Err(DmgError::Validation("destination is empty".to_string()));
        }
        if crate::mount::same_image(&self.source, &self.destination) {
            return Err(DmgError::Validation(
                "source and destination must differ".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachRequest {
    pub image: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    /// Show the mounted volume in the file browser afterwards.
    #[serde(default)]
    pub reveal: bool,
    #[serde(default)]
    pub passphrase: Passphrase,
}
