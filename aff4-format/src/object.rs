use std::any::Any;
use std::fmt;
use std::io::{Read, Seek, Write};
use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};
use crate::lock::Lease;
use crate::resolver::Resolver;
use crate::urn::Urn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Read,
    Write,
}

/// The closed set of object types the resolver can construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    ZipVolume,
    Segment,
    Image,
    Map,
    Encrypted,
    Link,
    Identity,
    File,
}

impl ObjectType {
    pub const ALL: &'static [ObjectType] = &[
        ObjectType::ZipVolume,
        ObjectType::Segment,
        ObjectType::Image,
        ObjectType::Map,
        ObjectType::Encrypted,
        ObjectType::Link,
        ObjectType::Identity,
        ObjectType::File,
    ];

    /// Value of the `aff4:type` attribute.
    pub const fn tag(self) -> &'static str {
        match self {
            ObjectType::ZipVolume => "aff4:zip_volume",
            ObjectType::Segment => "aff4:segment",
            ObjectType::Image => "aff4:image",
            ObjectType::Map => "aff4:map",
            ObjectType::Encrypted => "aff4:encrypted",
            ObjectType::Link => "aff4:link",
            ObjectType::Identity => "aff4:identity",
            ObjectType::File => "aff4:file",
        }
    }

    pub fn from_tag(tag: &str) -> Option<ObjectType> {
        ObjectType::ALL.iter().copied().find(|t| t.tag() == tag)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Seekable byte stream over `[0, size)`.
pub trait Stream: Read + Write + Seek + Send {
    fn size(&self) -> u64;

    /// Shrink the stream to `len` bytes. Append-only streams only accept
    /// their current size.
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

#[doc(hidden)]
pub trait AsObject {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
    fn into_object(self: Box<Self>) -> Box<dyn Object>;
}

impl<T: Object> AsObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn into_object(self: Box<Self>) -> Box<dyn Object> {
        self
    }
}

/// Anything the resolver can hand out under a URN.
pub trait Object: AsObject + Send + 'static {
    fn urn(&self) -> &Urn;

    fn object_type(&self) -> ObjectType;

    fn mode(&self) -> Mode;

    /// Persist the object. Terminal: no I/O is valid afterwards.
    fn close(&mut self) -> Result<()>;

    fn as_stream(&mut self) -> Option<&mut dyn Stream> {
        None
    }
}

/// A locked, open object.
///
/// Every handle must end in [`Handle::close`] or
/// [`Resolver::cache_return`]. Dropping a handle releases the URN lock but
/// neither persists nor caches the object.
pub struct Handle<T: ?Sized + Object> {
    // Always `Some` until the handle is consumed.
    object: Option<Box<T>>,
    lease: Option<Lease>,
    resolver: Resolver,
}

impl<T: ?Sized + Object> Handle<T> {
    pub(crate) fn new(object: Box<T>, lease: Lease, resolver: Resolver) -> Handle<T> {
        Handle {
            object: Some(object),
            lease: Some(lease),
            resolver,
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Close the object and release its URN.
    pub fn close(mut self) -> Result<()> {
        let result = match self.object.as_mut() {
            Some(object) => object.close(),
            None => Ok(()),
        };
        self.object = None;
        self.lease = None;
        result
    }

    pub(crate) fn into_parts(mut self) -> Option<(Box<T>, Lease)> {
        let object = self.object.take()?;
        let lease = self.lease.take()?;
        Some((object, lease))
    }

    pub fn into_object(mut self) -> Handle<dyn Object> {
        let resolver = self.resolver.clone();
        Handle {
            object: self.object.take().map(AsObject::into_object),
            lease: self.lease.take(),
            resolver,
        }
    }

    /// View the object as a byte stream.
    pub fn stream(&mut self) -> Result<&mut dyn Stream> {
        let object = self.deref_mut();
        let urn = object.urn().clone();
        let actual = object.object_type().tag();
        object.as_stream().ok_or(Error::TypeMismatch {
            urn,
            expected: "stream",
            actual,
        })
    }
}

impl Handle<dyn Object> {
    pub fn downcast<T: Object>(mut self) -> Result<Handle<T>> {
        let resolver = self.resolver.clone();
        let lease = self.lease.take();
        let object = match self.object.take() {
            Some(object) => object,
            None => return Err(Error::structural("handle already consumed")),
        };

        if !object.as_any().is::<T>() {
            return Err(Error::TypeMismatch {
                urn: object.urn().clone(),
                expected: std::any::type_name::<T>(),
                actual: object.object_type().tag(),
            });
        }

        let object = object
            .into_any()
            .downcast::<T>()
            .map_err(|_| Error::structural("downcast failed after type check"))?;

        Ok(Handle {
            object: Some(object),
            lease,
            resolver,
        })
    }
}

impl<T: ?Sized + Object> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_deref().expect("handle used after being consumed")
    }
}

impl<T: ?Sized + Object> DerefMut for Handle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object
            .as_deref_mut()
            .expect("handle used after being consumed")
    }
}

impl<T: ?Sized + Object> Drop for Handle<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.as_ref() {
            if object.mode() == Mode::Write {
                tracing::warn!(
                    urn = %object.urn(),
                    "object handle dropped without close() or cache_return(); changes may be lost"
                );
            }
        }
    }
}

impl<T: ?Sized + Object> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object.as_ref() {
            Some(object) => f
                .debug_struct("Handle")
                .field("urn", object.urn())
                .field("type", &object.object_type())
                .field("mode", &object.mode())
                .finish(),
            None => f.write_str("Handle(<consumed>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_round_trip() {
        for ty in ObjectType::ALL {
            assert_eq!(ObjectType::from_tag(ty.tag()), Some(*ty));
        }
        assert_eq!(ObjectType::from_tag("aff4:unknown"), None);
    }
}
