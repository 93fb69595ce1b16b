//! Signed statements about the streams in a volume.
//!
//! While an identity is open for writing it mirrors every signable
//! attribute (`aff4:size`, `aff4:hash`) set in the resolver into a private
//! shadow store. Closing it signs a JSON statement listing every hashed
//! object of its volume. Verification recomputes those hashes from the live
//! data, so a statement only passes while the data is unchanged.

use std::io;
use std::sync::{Arc, Weak};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::attrs;
use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::object::{Handle, Mode, Object, ObjectType};
use crate::resolver::Resolver;
use crate::segment::Segment;
use crate::ser;
use crate::store::AttributeStore;
use crate::urn::Urn;
use crate::volume::ZipVolume;
use crate::zip;

const STATEMENT: &str = "statement";
const SIGNATURE: &str = "signature";
const PUBLIC_KEY: &str = "public_key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedObject {
    pub urn: String,
    pub size: Option<u64>,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub identity: String,
    pub volume: String,
    pub created: String,
    pub objects: Vec<SignedObject>,
}

pub struct Identity {
    urn: Urn,
    mode: Mode,
    resolver: Resolver,
    volume: Urn,
    signing_key: Option<SigningKey>,
    shadow: Option<Arc<Mutex<AttributeStore>>>,
}

impl Identity {
    pub(crate) fn construct(resolver: &Resolver, urn: &Urn, mode: Mode) -> Result<Box<dyn Object>> {
        let volume = resolver.require_urn(urn, attrs::STORED)?;

        let (signing_key, shadow) = match mode {
            Mode::Read => (None, None),
            Mode::Write => {
                let raw = resolver
                    .resolve_bytes(urn, attrs::SIGNING_KEY)
                    .ok_or_else(|| Error::crypto(format!("no signing key supplied for {}", urn)))?;
                let raw: [u8; 32] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::crypto(format!("signing key of {} is not 32 bytes", urn)))?;

                let shadow = Arc::new(Mutex::new(AttributeStore::new()));
                Identity::mirror_signable(resolver, Arc::downgrade(&shadow));
                (Some(SigningKey::from_bytes(&raw)), Some(shadow))
            }
        };

        Ok(Box::new(Identity {
            urn: urn.clone(),
            mode,
            resolver: resolver.clone(),
            volume,
            signing_key,
            shadow,
        }))
    }

    /// Observers cannot be removed, so this one goes quiet once the
    /// identity is gone.
    fn mirror_signable(resolver: &Resolver, shadow: Weak<Mutex<AttributeStore>>) {
        resolver.observe(move |urn, attr, value| {
            if !attrs::SIGNABLE.contains(&attr) {
                return;
            }
            if let Some(shadow) = shadow.upgrade() {
                shadow.lock().set(urn, attr, value.clone());
            }
        });
    }

    /// Start an identity that signs what is written to `volume` from now on.
    pub fn create_in(resolver: &Resolver, volume: &Urn, key: &SigningKey) -> Result<Handle<Identity>> {
        resolver
            .create(ObjectType::Identity)
            .set(attrs::STORED, volume)
            .set(attrs::SIGNING_KEY, key.to_bytes().to_vec())
            .finish_as::<Identity>()
    }

    pub fn volume(&self) -> &Urn {
        &self.volume
    }

    fn statement(&self, shadow: &AttributeStore) -> Statement {
        let mut subjects: Vec<&Urn> = shadow
            .subjects()
            .filter(|urn| shadow.resolve(urn, attrs::HASH).is_some())
            .filter(|urn| self.resolver.resolve_urn(urn, attrs::STORED).as_ref() == Some(&self.volume))
            .collect();
        subjects.sort();

        let objects = subjects
            .into_iter()
            .filter_map(|urn| {
                let hash = shadow.resolve(urn, attrs::HASH)?.as_str()?.to_string();
                Some(SignedObject {
                    urn: urn.to_string(),
                    size: shadow.resolve(urn, attrs::SIZE).and_then(|v| v.as_u64()),
                    hash,
                })
            })
            .collect();

        Statement {
            identity: self.urn.to_string(),
            volume: self.volume.to_string(),
            created: zip::now().to_rfc3339(),
            objects,
        }
    }

    /// Check the signature, then every signed object against its live data.
    pub fn verify(&self) -> Result<Statement> {
        verify(&self.resolver, &self.urn)
    }
}

/// Verify the identity `urn`. Any bad signature or changed object fails
/// with [`Error::Crypto`].
pub fn verify(resolver: &Resolver, urn: &Urn) -> Result<Statement> {
    let statement = Segment::read_all(resolver, &urn.append(STATEMENT))?;
    let signature = Segment::read_all(resolver, &urn.append(SIGNATURE))?;
    let public_key = Segment::read_all(resolver, &urn.append(PUBLIC_KEY))?;

    let public_key: [u8; 32] = public_key
        .as_slice()
        .try_into()
        .map_err(|_| Error::crypto(format!("public key of {} is malformed", urn)))?;
    let public_key =
        VerifyingKey::from_bytes(&public_key).map_err(|e| Error::crypto(e.to_string()))?;
    let signature = Signature::from_slice(&signature).map_err(|e| Error::crypto(e.to_string()))?;

    if let Err(err) = public_key.verify(&statement, &signature) {
        tracing::warn!(identity = %urn, error = %err, "statement signature does not verify");
        return Err(Error::crypto(format!("signature of {} does not verify", urn)));
    }

    let statement: Statement = serde_json::from_slice(&statement)
        .map_err(|e| Error::crypto(format!("statement of {} is malformed: {}", urn, e)))?;

    for object in &statement.objects {
        let (size, hash) = hash_stream(resolver, &Urn::new(object.urn.as_str()))?;
        if hash != object.hash || object.size.is_some_and(|s| s != size) {
            tracing::warn!(
                identity = %urn,
                object = %object.urn,
                expected = %object.hash,
                actual = %hash,
                "signed object changed"
            );
            return Err(Error::crypto(format!(
                "{} no longer matches the statement of {}",
                object.urn, urn
            )));
        }
    }

    tracing::info!(identity = %urn, objects = statement.objects.len(), "verified statement");
    Ok(statement)
}

fn hash_stream(resolver: &Resolver, urn: &Urn) -> Result<(u64, String)> {
    let mut handle = resolver.open(urn, Mode::Read)?;
    let result = (|| -> Result<(u64, String)> {
        let stream = handle.stream()?;
        stream.seek(io::SeekFrom::Start(0))?;
        let mut hasher = blake3::Hasher::new();
        let size = io::copy(stream, &mut hasher)?;
        Ok((size, hasher.finalize().to_hex().to_string()))
    })();
    resolver.cache_return(handle);
    result
}

impl Object for Identity {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Identity
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn close(&mut self) -> Result<()> {
        let (key, shadow) = match (self.signing_key.take(), self.shadow.take()) {
            (Some(key), Some(shadow)) => (key, shadow),
            _ => return Ok(()),
        };

        let statement = self.statement(&shadow.lock());
        drop(shadow);
        let body = serde_json::to_vec_pretty(&statement)
            .map_err(|e| Error::structural(format!("cannot serialize statement: {}", e)))?;
        let signature = key.sign(&body);

        let mut properties = String::new();
        if let Some(set) = self.resolver.properties(&self.urn) {
            ser::write_properties(&mut properties, &self.urn, &self.urn, &set);
        }

        let mut volume = self
            .resolver
            .open_as::<ZipVolume>(&self.volume, Mode::Write)?;
        let result = (|| -> Result<()> {
            volume.writestr(&self.urn.append(STATEMENT), &body, Compression::Stored)?;
            volume.writestr(
                &self.urn.append(SIGNATURE),
                &signature.to_bytes(),
                Compression::Stored,
            )?;
            volume.writestr(
                &self.urn.append(PUBLIC_KEY),
                key.verifying_key().as_bytes(),
                Compression::Stored,
            )?;
            volume.writestr(
                &self.urn.append("properties"),
                properties.as_bytes(),
                Compression::Stored,
            )
        })();
        self.resolver.cache_return(volume);
        result?;

        tracing::info!(
            identity = %self.urn,
            objects = statement.objects.len(),
            "signed statement"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("urn", &self.urn)
            .field("mode", &self.mode)
            .field("volume", &self.volume)
            .field("signing", &self.signing_key.is_some())
            .finish()
    }
}
