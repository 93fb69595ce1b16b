//! The fixed attribute vocabulary.
//!
//! Attributes in the `aff4:` namespace are persisted in `properties` members.
//! Attributes in the `aff4volatile:` namespace describe in-process state
//! (archive offsets, secrets, dirty flags) and are never written out.

/// Vocabulary version written into every volume's properties.
pub const VOCABULARY_VERSION: u64 = 1;

pub const NAMESPACE: &str = "aff4:";
pub const VOLATILE_NAMESPACE: &str = "aff4volatile:";

// Object identity and relations
/// Object type tag, see [`ObjectType`](crate::ObjectType).
pub const TYPE: &str = "aff4:type";
/// The container (or backing store) an object lives in.
pub const STORED: &str = "aff4:stored";
/// Objects held in a volume.
pub const CONTAINS: &str = "aff4:contains";
/// Alias target of a link.
pub const TARGET: &str = "aff4:target";
pub const VERSION: &str = "aff4:version";

// Stream attributes
pub const SIZE: &str = "aff4:size";
pub const TIMESTAMP: &str = "aff4:timestamp";
/// BLAKE3 digest of the object's logical content, hex encoded.
pub const HASH: &str = "aff4:hash";
pub const COMPRESSION: &str = "aff4:compression";

// Image attributes
pub const CHUNK_SIZE: &str = "aff4:chunk_size";
pub const CHUNKS_IN_SEGMENT: &str = "aff4:chunks_in_segment";

// Map attributes
pub const IMAGE_PERIOD: &str = "aff4:image_period";
pub const TARGET_PERIOD: &str = "aff4:target_period";

// Encryption attributes
pub const CIPHER: &str = "aff4:cipher";
pub const SALT: &str = "aff4:salt";
/// Digest of the derived key, used to reject a wrong secret up front.
pub const KEY_CHECK: &str = "aff4:key_check";

// Volatile attributes
pub const DIRECTORY_OFFSET: &str = "aff4volatile:directory_offset";
pub const DIRTY: &str = "aff4volatile:dirty";
pub const ZIP_HEADER_OFFSET: &str = "aff4volatile:zip_header_offset";
pub const ZIP_COMPRESSED_SIZE: &str = "aff4volatile:zip_compressed_size";
pub const ZIP_CRC: &str = "aff4volatile:zip_crc";
pub const ZIP_METHOD: &str = "aff4volatile:zip_method";
/// Backing store a merged member was loaded from.
pub const ZIP_BACKING: &str = "aff4volatile:zip_backing";
/// Pre-shared secret for encrypted streams. Never persisted.
pub const SECRET: &str = "aff4volatile:secret";
/// Ed25519 signing key of an identity being written. Never persisted.
pub const SIGNING_KEY: &str = "aff4volatile:signing_key";

/// Attributes mirrored into an identity's signed statement.
pub const SIGNABLE: &[&str] = &[SIZE, HASH];

/// How values of an attribute are typed when loaded from text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Urn,
    String,
    Integer,
    Bytes,
    Timestamp,
}

pub fn is_volatile(attr: &str) -> bool {
    attr.starts_with(VOLATILE_NAMESPACE)
}

pub fn value_kind(attr: &str) -> ValueKind {
    match attr {
        TYPE | COMPRESSION | CIPHER | HASH | KEY_CHECK => ValueKind::String,
        STORED | CONTAINS | TARGET | ZIP_BACKING => ValueKind::Urn,
        SIZE | CHUNK_SIZE | CHUNKS_IN_SEGMENT | IMAGE_PERIOD | TARGET_PERIOD | VERSION
        | DIRECTORY_OFFSET | DIRTY | ZIP_HEADER_OFFSET | ZIP_COMPRESSED_SIZE | ZIP_CRC
        | ZIP_METHOD => ValueKind::Integer,
        SALT | SECRET | SIGNING_KEY => ValueKind::Bytes,
        TIMESTAMP => ValueKind::Timestamp,
        _ => ValueKind::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_namespace() {
        assert!(is_volatile(DIRECTORY_OFFSET));
        assert!(is_volatile(SECRET));
        assert!(!is_volatile(SIZE));
        assert!(!is_volatile(SALT));
    }

    #[test]
    fn unknown_attributes_are_strings() {
        assert_eq!(value_kind("aff4:whatever"), ValueKind::String);
        assert_eq!(value_kind(STORED), ValueKind::Urn);
        assert_eq!(value_kind(SALT), ValueKind::Bytes);
    }
}
