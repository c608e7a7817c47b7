//! Content links, transforms and block lists: the wire model.

use serde::{Deserialize, Serialize};

/// A transform applied in listed order when reading. Writers record them in
/// inverse-apply order (Decipher, Decompress, Blocks) so readers can
/// iterate blindly forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Transform {
    /// AES-256-CBC decryption with PKCS#7 padding. Key and iv are hex.
    Decipher {
        /// Cipher name; only `aes-256-cbc` is understood.
        algorithm: String,
        /// 32-byte key, hex encoded.
        key: String,
        /// 16-byte initialization vector, hex encoded.
        iv: String,
    },
    /// Decompression with the named algorithm.
    Decompress {
        /// `inflate`, `gzip` (alias `unzip`) or `brotli`.
        algorithm: String,
    },
    /// The blob is a JSON [`BlockList`]; reading concatenates the children
    /// in order.
    Blocks,
}

/// Compression choices on the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Store bytes as-is.
    #[default]
    None,
    /// Raw DEFLATE.
    Inflate,
    /// gzip framing around DEFLATE.
    Gzip,
    /// Brotli.
    Brotli,
}

impl Compression {
    /// The algorithm name recorded in a `Decompress` transform.
    pub fn algorithm(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Inflate => Some("inflate"),
            Compression::Gzip => Some("gzip"),
            Compression::Brotli => Some("brotli"),
        }
    }
}

/// A self-describing recipe for reconstructing a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentLink {
    /// Blob address, or a slot id when `slot` is set.
    pub address: String,
    /// When true, `address` names a slot whose current value is the real
    /// root address.
    #[serde(default, skip_serializing_if = "is_false")]
    pub slot: bool,
    /// Transforms to apply, in listed order, when reading.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<Transform>,
    /// SHA-256 of the final plaintext, hex encoded. Checked at end of
    /// stream when present.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expected: String,
    /// Optional hint: id of a storage peer likely to hold `address`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primary: String,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ContentLink {
    /// A link pointing straight at a blob, no transforms.
    pub fn plain(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// A link whose address is a slot id to resolve first.
    pub fn slot(slot_id: impl Into<String>) -> Self {
        Self {
            address: slot_id.into(),
            slot: true,
            ..Self::default()
        }
    }
}

/// One child of a block list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockListItem {
    /// How to reconstruct this child.
    pub content: ContentLink,
    /// Plaintext length of the child in bytes.
    pub size: u64,
}

/// The JSON blob behind a `Blocks` transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockList {
    /// The children, concatenated in order on read.
    pub blocks: Vec<BlockListItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_wire_format_uses_kind_tag() {
        let t = Transform::Decipher {
            algorithm: "aes-256-cbc".to_string(),
            key: "00".repeat(32),
            iv: "00".repeat(16),
        };
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["kind"], "Decipher");
        assert_eq!(json["algorithm"], "aes-256-cbc");

        let json = serde_json::to_value(Transform::Blocks).unwrap();
        assert_eq!(json["kind"], "Blocks");
    }

    #[test]
    fn link_omits_empty_fields() {
        let link = ContentLink::plain("ab".repeat(32));
        let json = serde_json::to_string(&link).unwrap();
        assert!(!json.contains("slot"));
        assert!(!json.contains("transforms"));
        assert!(!json.contains("expected"));
        assert!(!json.contains("primary"));
    }

    #[test]
    fn link_roundtrips_through_json() {
        let link = ContentLink {
            address: "cd".repeat(32),
            slot: true,
            transforms: vec![
                Transform::Decompress {
                    algorithm: "gzip".to_string(),
                },
                Transform::Blocks,
            ],
            expected: "ef".repeat(32),
            primary: "12".repeat(32),
        };
        let json = serde_json::to_string(&link).unwrap();
        let back: ContentLink = serde_json::from_str(&json).unwrap();
        assert_eq!(back, link);
    }
}
