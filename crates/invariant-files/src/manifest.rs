//! Directory manifests: the serialized form of a directory's children.
//!
//! A manifest is a JSON array of entries tagged by `kind`. Names are
//! validated against path separators, the `.`/`..` specials, and the DOS
//! device names that make files unrepresentable on Windows hosts.

use serde::{Deserialize, Serialize};

use invariant_content::ContentLink;

use crate::{FileTreeError, Result};

/// The kind discriminator of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Subdirectory.
    Directory,
    /// Symbolic link.
    SymbolicLink,
}

/// Fields shared by every entry kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Entry name within its directory.
    pub name: String,
    /// Creation time, seconds since the epoch.
    #[serde(rename = "createTime", skip_serializing_if = "Option::is_none")]
    pub create_time: Option<u64>,
    /// Last modification time, seconds since the epoch.
    #[serde(rename = "modifyTime", skip_serializing_if = "Option::is_none")]
    pub modify_time: Option<u64>,
    /// Permission mode: `0` followed by one to four octal digits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Entry {
    /// A file with content and size, optionally a MIME type.
    File {
        /// Common metadata.
        #[serde(flatten)]
        meta: EntryMeta,
        /// How to read the file bytes.
        content: ContentLink,
        /// File length in bytes.
        size: u64,
        /// MIME type, `type` on the wire.
        #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
        mime_type: String,
    },
    /// A subdirectory whose manifest lives behind `content`.
    Directory {
        /// Common metadata.
        #[serde(flatten)]
        meta: EntryMeta,
        /// How to read the subdirectory manifest.
        content: ContentLink,
        /// Total size accounted to the subdirectory.
        size: u64,
    },
    /// A symbolic link.
    SymbolicLink {
        /// Common metadata.
        #[serde(flatten)]
        meta: EntryMeta,
        /// Link target path.
        target: String,
    },
}

impl Entry {
    /// The entry's kind.
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::File { .. } => EntryKind::File,
            Entry::Directory { .. } => EntryKind::Directory,
            Entry::SymbolicLink { .. } => EntryKind::SymbolicLink,
        }
    }

    /// The shared metadata.
    pub fn meta(&self) -> &EntryMeta {
        match self {
            Entry::File { meta, .. }
            | Entry::Directory { meta, .. }
            | Entry::SymbolicLink { meta, .. } => meta,
        }
    }

    /// The entry name.
    pub fn name(&self) -> &str {
        &self.meta().name
    }

    /// Check the entry against the manifest rules.
    pub fn validate(&self) -> Result<()> {
        validate_name(self.name())?;
        if let Some(mode) = &self.meta().mode {
            validate_mode(mode)?;
        }
        match self {
            Entry::File { mime_type, .. } => {
                if !mime_type.is_empty() && !is_valid_mime(mime_type) {
                    return Err(FileTreeError::BadRequest(format!(
                        "invalid mime type: {mime_type:?}"
                    )));
                }
            }
            Entry::Directory { .. } => {}
            Entry::SymbolicLink { target, .. } => {
                if target.is_empty() {
                    return Err(FileTreeError::BadRequest(
                        "symbolic link target is empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

const DOS_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Validate an entry name: non-empty, not `.`/`..`, no `/`, not a DOS
/// device name (case-insensitive, with or without an extension).
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FileTreeError::BadRequest(format!("invalid name: {name:?}")));
    }
    let stem = name.split('.').next().unwrap_or(name).to_ascii_uppercase();
    if DOS_DEVICE_NAMES.contains(&stem.as_str()) {
        return Err(FileTreeError::BadRequest(format!(
            "reserved device name: {name:?}"
        )));
    }
    Ok(())
}

/// Validate a mode string: `0` followed by one to four octal digits.
pub fn validate_mode(mode: &str) -> Result<()> {
    let rest = mode
        .strip_prefix('0')
        .ok_or_else(|| FileTreeError::BadRequest(format!("invalid mode: {mode:?}")))?;
    if rest.is_empty() || rest.len() > 4 || !rest.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return Err(FileTreeError::BadRequest(format!("invalid mode: {mode:?}")));
    }
    Ok(())
}

fn is_valid_mime(mime: &str) -> bool {
    let mut parts = mime.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => !major.is_empty() && !minor.is_empty(),
        _ => false,
    }
}

/// Serialize a manifest.
pub fn encode(entries: &[Entry]) -> Result<Vec<u8>> {
    serde_json::to_vec(entries).map_err(|e| FileTreeError::BadRequest(e.to_string()))
}

/// Parse and validate a manifest.
pub fn decode(data: &[u8]) -> Result<Vec<Entry>> {
    let entries: Vec<Entry> = serde_json::from_slice(data)
        .map_err(|e| FileTreeError::MalformedManifest(e.to_string()))?;
    for entry in &entries {
        entry.validate()?;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_entry(name: &str) -> Entry {
        Entry::File {
            meta: EntryMeta {
                name: name.to_string(),
                create_time: Some(1_700_000_000),
                modify_time: Some(1_700_000_100),
                mode: Some("0644".to_string()),
            },
            content: ContentLink::plain("ab".repeat(32)),
            size: 11,
            mime_type: "text/plain".to_string(),
        }
    }

    #[test]
    fn manifest_roundtrips_with_kind_tags() {
        let entries = vec![
            file_entry("notes.txt"),
            Entry::Directory {
                meta: EntryMeta {
                    name: "sub".to_string(),
                    ..EntryMeta::default()
                },
                content: ContentLink::plain("cd".repeat(32)),
                size: 0,
            },
            Entry::SymbolicLink {
                meta: EntryMeta {
                    name: "alias".to_string(),
                    ..EntryMeta::default()
                },
                target: "notes.txt".to_string(),
            },
        ];
        let encoded = encode(&entries).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(json[0]["kind"], "File");
        assert_eq!(json[1]["kind"], "Directory");
        assert_eq!(json[2]["kind"], "SymbolicLink");
        assert_eq!(json[0]["type"], "text/plain");
        assert_eq!(json[0]["createTime"], 1_700_000_000);

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let data = br#"[{"kind":"Socket","name":"s"}]"#;
        assert!(matches!(
            decode(data),
            Err(FileTreeError::MalformedManifest(_))
        ));
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("normal.txt").is_ok());
        assert!(validate_name("..").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("CON").is_err());
        assert!(validate_name("con.txt").is_err());
        assert!(validate_name("Lpt5.log").is_err());
        assert!(validate_name("COM0").is_ok());
        assert!(validate_name("console").is_ok());
    }

    #[test]
    fn mode_rules() {
        assert!(validate_mode("0644").is_ok());
        assert!(validate_mode("07").is_ok());
        assert!(validate_mode("00755").is_ok());
        assert!(validate_mode("644").is_err());
        assert!(validate_mode("0").is_err());
        assert!(validate_mode("089").is_err());
        assert!(validate_mode("012345").is_err());
    }

    #[test]
    fn symlink_requires_target() {
        let entry = Entry::SymbolicLink {
            meta: EntryMeta {
                name: "dangling".to_string(),
                ..EntryMeta::default()
            },
            target: String::new(),
        };
        assert!(entry.validate().is_err());
    }
}
