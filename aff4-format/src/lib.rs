//! Evidence containers: a triple store with typed object construction,
//! ZIP volumes, and chunked, mapped and encrypted streams stored in them.

use std::collections::HashMap;

pub mod attrs;
mod compression;
pub mod config;
mod de;
mod encrypted;
mod error;
mod file;
mod identity;
mod image;
mod link;
mod lock;
mod map;
mod object;
pub mod path;
mod resolver;
mod segment;
mod ser;
mod store;
mod urn;
mod value;
pub mod volume;
mod zip;

pub use compression::Compression;
pub use config::ResolverConfig;
pub use encrypted::{Cipher, EncryptedStream};
pub use error::{Error, Result};
pub use file::FileBackingStore;
pub use identity::{verify as verify_identity, Identity, SignedObject, Statement};
pub use image::{ImageStream, INDEX_SENTINEL};
pub use link::Link;
pub use lock::{CancellationToken, Lease, OpenOptions};
pub use map::{pack, Interpolated, MapStream, Point};
pub use object::{Handle, Mode, Object, ObjectType, Stream};
pub use resolver::{Constructor, Draft, Resolver};
pub use segment::Segment;
pub use store::{AttributeStore, PropertySet};
pub use urn::Urn;
pub use value::Value;
pub use volume::ZipVolume;

#[doc(hidden)]
pub use comde;

/// Constructors for every built-in object type.
pub(crate) fn default_registry() -> HashMap<ObjectType, Constructor> {
    let mut registry: HashMap<ObjectType, Constructor> = HashMap::new();
    for &object_type in ObjectType::ALL {
        let constructor: Constructor = match object_type {
            ObjectType::ZipVolume => ZipVolume::construct,
            ObjectType::Segment => Segment::construct,
            ObjectType::Image => ImageStream::construct,
            ObjectType::Map => MapStream::construct,
            ObjectType::Encrypted => EncryptedStream::construct,
            ObjectType::Link => Link::construct,
            ObjectType::Identity => Identity::construct,
            ObjectType::File => FileBackingStore::construct,
        };
        registry.insert(object_type, constructor);
    }
    registry
}
