//! Artifact kinds and the keys stored artifacts live under.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::digest::IdentifierFingerprint;
use crate::error::{StoreError, StoreResult};

/// Original-name extensions of documents.
const DOCUMENT_EXTENSIONS: [&str; 13] = [
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp", "rtf", "csv", "json",
];

/// Partition of the content store an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Raw HTML as fetched.
    RawPage,
    /// Text extracted from a page.
    PageText,
    /// Converted (Markdown) form of a page or document.
    Converted,
    /// Binary document (PDF, office formats, CSV, ...).
    Document,
}

impl ArtifactKind {
    /// Every kind, in partition order.
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::RawPage,
        ArtifactKind::PageText,
        ArtifactKind::Converted,
        ArtifactKind::Document,
    ];

    /// Stable name used in artifact keys and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::RawPage => "raw_page",
            ArtifactKind::PageText => "page_text",
            ArtifactKind::Converted => "converted",
            ArtifactKind::Document => "document",
        }
    }

    /// Directory holding payloads of this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::RawPage => "raw_pages",
            ArtifactKind::PageText => "page_texts",
            ArtifactKind::Converted => "converted",
            ArtifactKind::Document => "documents",
        }
    }

    /// Directory holding content markers of this kind.
    pub fn marker_dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::RawPage => "raw_pages_markers",
            ArtifactKind::PageText => "page_texts_markers",
            ArtifactKind::Converted => "converted_markers",
            ArtifactKind::Document => "documents_markers",
        }
    }

    /// Kind of a record keyed by a bare identifier hash, as the crawler
    /// pipeline wrote them: documents are recognised by the extension of
    /// their original name, everything else is a raw page.
    pub fn for_bare_key(original_name: &str) -> Self {
        let extension = original_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if DOCUMENT_EXTENSIONS.contains(&extension.as_str()) {
            ArtifactKind::Document
        } else {
            ArtifactKind::RawPage
        }
    }

    /// File extension of stored payloads.
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::RawPage => "html",
            ArtifactKind::PageText => "txt",
            ArtifactKind::Converted => "md",
            ArtifactKind::Document => "bin",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "raw_page" | "html" => Ok(ArtifactKind::RawPage),
            "page_text" | "text" => Ok(ArtifactKind::PageText),
            "converted" | "markdown" => Ok(ArtifactKind::Converted),
            "document" => Ok(ArtifactKind::Document),
            _ => Err(StoreError::UnknownKind(s.to_string())),
        }
    }
}

/// Key of a stored artifact and of its metadata record: the identifier
/// fingerprint scoped to one kind partition. Rendered as `kind/hex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    /// Kind partition.
    pub kind: ArtifactKind,
    /// Identifier fingerprint.
    pub id: IdentifierFingerprint,
}

impl ArtifactKey {
    /// Build a key.
    pub fn new(kind: ArtifactKind, id: IdentifierFingerprint) -> Self {
        Self { kind, id }
    }

    /// Key for a source identifier.
    pub fn for_source(kind: ArtifactKind, source_identifier: &str) -> Self {
        Self::new(kind, IdentifierFingerprint::of_source(source_identifier))
    }

    /// Parse `kind/hex`.
    pub fn parse(s: &str) -> StoreResult<Self> {
        let (kind, id) = s
            .split_once('/')
            .ok_or_else(|| StoreError::InvalidFingerprint(format!("{:?}: missing kind prefix", s)))?;
        Ok(Self::new(kind.parse()?, IdentifierFingerprint::from_hex(id)?))
    }

    /// Parse a stored metadata key: `kind/hex`, or a bare hex identifier
    /// whose kind follows from `original_name`.
    pub fn parse_stored(s: &str, original_name: &str) -> StoreResult<Self> {
        if s.contains('/') {
            return Self::parse(s);
        }
        Ok(Self::new(
            ArtifactKind::for_bare_key(original_name),
            IdentifierFingerprint::from_hex(s)?,
        ))
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl Serialize for ArtifactKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
