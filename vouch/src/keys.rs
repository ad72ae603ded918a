//! Signing keys published by the identity provider
//!
//! The provider publishes its current signing keys as a JSON object mapping
//! each key identifier to a PEM-encoded X.509 certificate. Only the RSA
//! public key inside each certificate is retained.

use std::{collections::HashMap, fmt, sync::Arc};

use aliri_braid::braid;
use async_trait::async_trait;
use openssl::{rsa::Rsa, x509::X509};
use vouch_clock::DurationSecs;

use crate::{error, jws};

mod local;
#[cfg(feature = "reqwest")]
mod remote;

pub use local::StaticKeySource;
#[cfg(feature = "reqwest")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
pub use remote::RemoteKeySource;

/// The well-known endpoint publishing Google's secure-token signing certificates
pub const DEFAULT_KEY_SOURCE_URL: &str =
    "https://www.googleapis.com/robot/v1/metadata/x509/securetoken@system.gserviceaccount.com";

/// An identifier naming one of the provider's signing keys
#[braid(serde, ref_doc = "A borrowed reference to a [`KeyId`]")]
pub struct KeyId;

/// An RSA public key
///
/// Components are held behind reference counts so that handing a key out
/// of the shared cache does not copy the modulus.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    modulus: Arc<[u8]>,
    exponent: Arc<[u8]>,
}

impl PublicKey {
    /// Imports an RSA public key from PEM
    ///
    /// Accepts an X.509 certificate (`BEGIN CERTIFICATE`), a
    /// SubjectPublicKeyInfo (`BEGIN PUBLIC KEY`), or a PKCS#1 key
    /// (`BEGIN RSA PUBLIC KEY`).
    ///
    /// # Errors
    ///
    /// The PEM is not one of the above, does not hold an RSA key, or holds
    /// an RSA key shorter than 2048 bits.
    pub fn from_pem(pem: &str) -> Result<Self, error::KeyRejected> {
        let bytes = pem.trim().as_bytes();

        let rsa = if pem.contains("BEGIN CERTIFICATE") {
            X509::from_pem(bytes)
                .and_then(|cert| cert.public_key())
                .and_then(|key| key.rsa())
        } else if pem.contains("BEGIN RSA PUBLIC KEY") {
            Rsa::public_key_from_pem_pkcs1(bytes)
        } else {
            Rsa::public_key_from_pem(bytes)
        }
        .map_err(error::key_rejected)?;

        Self::from_components(rsa.n().to_vec(), rsa.e().to_vec())
    }

    /// Constructs a public key from its big-endian modulus and exponent
    ///
    /// # Errors
    ///
    /// The modulus is shorter than 2048 bits or longer than 8192 bits.
    pub fn from_components(
        modulus: impl Into<Vec<u8>>,
        exponent: impl Into<Vec<u8>>,
    ) -> Result<Self, error::KeyRejected> {
        let modulus = modulus.into();
        let exponent = exponent.into();

        if !(256..=1024).contains(&modulus.len()) {
            return Err(error::key_rejected(
                "key modulus must be between 2048 and 8192 bits",
            ));
        }

        if exponent.is_empty() {
            return Err(error::key_rejected("key exponent must not be empty"));
        }

        Ok(Self {
            modulus: modulus.into(),
            exponent: exponent.into(),
        })
    }

    /// The size of the key's modulus in bits
    #[must_use]
    pub fn bits(&self) -> usize {
        self.modulus.len() * 8
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("bits", &self.bits())
            .finish_non_exhaustive()
    }
}

impl jws::Verifier for PublicKey {
    type Error = error::InvalidSignature;

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), Self::Error> {
        let pk = ring::signature::RsaPublicKeyComponents {
            n: &*self.modulus,
            e: &*self.exponent,
        };

        pk.verify(&ring::signature::RSA_PKCS1_2048_8192_SHA256, data, signature)
            .map_err(|_| error::invalid_signature())
    }
}

/// A set of signing keys, indexed by key identifier
///
/// A key set is never modified once built; refreshing replaces the whole
/// set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SigningKeySet {
    keys: HashMap<KeyId, PublicKey>,
}

impl SigningKeySet {
    /// Builds a key set from a mapping of key identifiers to PEM documents
    ///
    /// Entries that cannot be loaded as RSA public keys are skipped.
    pub fn from_pems<I, K, P>(pems: I) -> Self
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<KeyId>,
        P: AsRef<str>,
    {
        let keys = pems
            .into_iter()
            .filter_map(|(kid, pem)| {
                let kid = kid.into();
                match PublicKey::from_pem(pem.as_ref()) {
                    Ok(key) => Some((kid, key)),
                    Err(err) => {
                        let error: &(dyn std::error::Error + 'static) = &err;
                        tracing::warn!(%kid, error, "ignoring unusable signing key");
                        None
                    }
                }
            })
            .collect();

        Self { keys }
    }

    /// Gets the key with the given identifier
    #[must_use]
    pub fn get(&self, kid: &KeyIdRef) -> Option<&PublicKey> {
        self.keys.get(kid)
    }

    /// The number of keys in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterates over the identifiers of the keys in the set
    pub fn key_ids(&self) -> impl Iterator<Item = &KeyIdRef> {
        self.keys.keys().map(AsRef::as_ref)
    }
}

impl FromIterator<(KeyId, PublicKey)> for SigningKeySet {
    fn from_iter<T: IntoIterator<Item = (KeyId, PublicKey)>>(iter: T) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

/// A signing key set as retrieved from a key source
#[derive(Clone, Debug)]
pub struct FetchedKeys {
    /// The retrieved keys
    pub keys: SigningKeySet,

    /// How long the source allows the keys to be cached, if it said
    pub max_age: Option<DurationSecs>,
}

/// A source of signing keys
///
/// Implementations perform the retrieval only; caching is the
/// responsibility of [`KeyCache`][crate::KeyCache].
#[async_trait]
pub trait KeySource: fmt::Debug + Send + Sync + 'static {
    /// Retrieves the current signing key set
    async fn fetch(&self) -> Result<FetchedKeys, error::KeySourceUnavailable>;
}

#[async_trait]
impl<T: KeySource + ?Sized> KeySource for Arc<T> {
    async fn fetch(&self) -> Result<FetchedKeys, error::KeySourceUnavailable> {
        T::fetch(self).await
    }
}

/// Extracts the `max-age` directive from a `Cache-Control` header value
///
/// Absent and unparsable directives are treated alike.
#[cfg_attr(not(feature = "reqwest"), allow(dead_code))]
pub(crate) fn max_age(cache_control: Option<&str>) -> Option<DurationSecs> {
    cache_control?.split(',').find_map(|directive| {
        let (name, value) = directive.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("max-age") {
            value.trim().trim_matches('"').parse().ok().map(DurationSecs)
        } else {
            None
        }
    })
}
