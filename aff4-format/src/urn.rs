use std::fmt;
use std::path::Path;

/// Namespace for URNs minted by this crate.
pub const AFF4_SCHEME: &str = "aff4";

/// A globally unique, scheme-qualified object identifier.
///
/// URNs are opaque apart from their scheme; they never change once an object
/// has been bound to one.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Urn(String);

impl Urn {
    pub fn new<S: Into<String>>(value: S) -> Urn {
        Urn(value.into())
    }

    /// A fresh `aff4://<uuid>` URN.
    pub fn random() -> Urn {
        Urn(format!("{}://{}", AFF4_SCHEME, uuid::Uuid::new_v4()))
    }

    /// A `file://` locator for a local path. Relative paths are made absolute
    /// against the current directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> std::io::Result<Urn> {
        let path = path.as_ref();
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let s = abs.to_str().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path is not valid UTF-8")
        })?;
        Ok(Urn(format!("file://{}", s)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The scheme, e.g. `aff4` or `file`, if the URN has one.
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    /// The local path of a `file://` URN.
    pub fn to_file_path(&self) -> Option<&Path> {
        self.0.strip_prefix("file://").map(Path::new)
    }

    pub fn append<S: AsRef<str>>(&self, component: S) -> Urn {
        let component = component.as_ref().trim_start_matches('/');
        if self.0.ends_with('/') {
            Urn(format!("{}{}", self.0, component))
        } else {
            Urn(format!("{}/{}", self.0, component))
        }
    }

    /// The path of this URN below `base`, if `base` is a proper prefix at a
    /// component boundary.
    pub fn relative_to(&self, base: &Urn) -> Option<&str> {
        let rest = self.0.strip_prefix(base.as_str())?;
        let rest = rest.strip_prefix('/')?;
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    pub fn is_under(&self, base: &Urn) -> bool {
        self.relative_to(base).is_some()
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl From<&str> for Urn {
    fn from(value: &str) -> Self {
        Urn::new(value)
    }
}

impl From<String> for Urn {
    fn from(value: String) -> Self {
        Urn(value)
    }
}

impl AsRef<str> for Urn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
