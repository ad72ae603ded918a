//! Helpers for exercising verification in tests
//!
//! Enabled by the `test-util` feature.

use std::{
    string::FromUtf8Error,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::Engine;
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    sign::Signer,
    x509::{X509Builder, X509NameBuilder},
};
use serde_json::json;
use thiserror::Error;
use vouch_clock::UnixTime;

use crate::{
    claims::DEFAULT_ISSUER_PREFIX,
    error,
    jws::TRUSTED_ALGORITHM,
    jwt::{Jwt, BASE64_URL},
    keys::{FetchedKeys, KeyId, KeyIdRef, KeySource, PublicKey, SigningKeySet, StaticKeySource},
};

/// An error raised while generating keys or signing test tokens
#[derive(Debug, Error)]
pub enum TestKeyError {
    /// OpenSSL failed
    #[error(transparent)]
    Openssl(#[from] ErrorStack),

    /// A header or payload could not be serialized
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A PEM document was not UTF-8
    #[error(transparent)]
    Utf8(#[from] FromUtf8Error),

    /// The generated key could not be loaded
    #[error(transparent)]
    Key(#[from] error::KeyRejected),
}

/// An RSA key pair with a self-signed certificate, able to mint tokens
pub struct TestKeyPair {
    kid: KeyId,
    private: PKey<Private>,
    certificate_pem: String,
}

impl std::fmt::Debug for TestKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TestKeyPair")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl TestKeyPair {
    /// Generates a 2048-bit RSA key pair published under `kid`
    ///
    /// # Errors
    ///
    /// OpenSSL could not generate the key or its certificate.
    pub fn generate(kid: impl Into<KeyId>) -> Result<Self, TestKeyError> {
        let private = PKey::from_rsa(Rsa::generate(2048)?)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, "vouch test signer")?;
        let name = name.build();

        let mut cert = X509Builder::new()?;
        cert.set_version(2)?;
        cert.set_serial_number(&*BigNum::from_u32(1)?.to_asn1_integer()?)?;
        cert.set_subject_name(&name)?;
        cert.set_issuer_name(&name)?;
        cert.set_pubkey(&private)?;
        cert.set_not_before(&*Asn1Time::days_from_now(0)?)?;
        cert.set_not_after(&*Asn1Time::days_from_now(1)?)?;
        cert.sign(&private, MessageDigest::sha256())?;

        let certificate_pem = String::from_utf8(cert.build().to_pem()?)?;

        Ok(Self {
            kid: kid.into(),
            private,
            certificate_pem,
        })
    }

    /// The identifier the key is published under
    #[must_use]
    pub fn kid(&self) -> &KeyIdRef {
        &self.kid
    }

    /// The self-signed certificate, as the provider would publish it
    #[must_use]
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// The public key as a SubjectPublicKeyInfo PEM document
    ///
    /// # Errors
    ///
    /// OpenSSL could not encode the key.
    pub fn public_key_pem(&self) -> Result<String, TestKeyError> {
        Ok(String::from_utf8(self.private.public_key_to_pem()?)?)
    }

    /// The public half of the pair
    ///
    /// # Errors
    ///
    /// The certificate could not be loaded.
    pub fn public_key(&self) -> Result<PublicKey, TestKeyError> {
        Ok(PublicKey::from_pem(&self.certificate_pem)?)
    }

    /// A key set containing only this key
    #[must_use]
    pub fn key_set(&self) -> SigningKeySet {
        SigningKeySet::from_pems([(self.kid.clone(), self.certificate_pem.as_str())])
    }

    /// A key source serving only this key
    #[must_use]
    pub fn key_source(&self) -> StaticKeySource {
        StaticKeySource::new(self.key_set())
    }

    /// Signs an arbitrary header and payload
    ///
    /// The signature is always RS256, whatever `alg` the header names.
    ///
    /// # Errors
    ///
    /// The header or payload could not be serialized, or signing failed.
    pub fn sign(
        &self,
        header: &serde_json::Value,
        claims: &serde_json::Value,
    ) -> Result<Jwt, TestKeyError> {
        let message = format!(
            "{}.{}",
            BASE64_URL.encode(serde_json::to_vec(header)?),
            BASE64_URL.encode(serde_json::to_vec(claims)?),
        );

        let mut signer = Signer::new(MessageDigest::sha256(), &self.private)?;
        signer.update(message.as_bytes())?;
        let signature = signer.sign_to_vec()?;

        Ok(Jwt::new(format!(
            "{message}.{}",
            BASE64_URL.encode(signature)
        )))
    }

    /// Signs a payload under a standard RS256 header naming this key
    ///
    /// # Errors
    ///
    /// See [`sign`][Self::sign].
    pub fn sign_claims(&self, claims: &serde_json::Value) -> Result<Jwt, TestKeyError> {
        let header = json!({
            "alg": TRUSTED_ALGORITHM,
            "kid": self.kid,
            "typ": "JWT",
        });

        self.sign(&header, claims)
    }
}

/// A payload that passes validation for `project_id` at `now`
///
/// Expires an hour after `now`.
#[must_use]
pub fn valid_claims(project_id: &str, now: UnixTime) -> serde_json::Value {
    json!({
        "iss": format!("{DEFAULT_ISSUER_PREFIX}{project_id}"),
        "aud": project_id,
        "auth_time": now.0,
        "user_id": "user-1",
        "sub": "user-1",
        "iat": now.0,
        "exp": now.0 + 3600,
        "firebase": { "identities": {}, "sign_in_provider": "custom" },
    })
}

/// A key source that counts how often it is asked for keys
///
/// Each fetch can be slowed down to widen the window in which concurrent
/// callers overlap.
#[derive(Debug)]
pub struct CountingKeySource<S> {
    inner: S,
    delay: Duration,
    fetches: AtomicUsize,
}

impl<S: KeySource> CountingKeySource<S> {
    /// Wraps `inner`
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Delays every fetch by `delay`
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    /// The number of fetches started so far
    #[must_use]
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: KeySource> KeySource for CountingKeySource<S> {
    async fn fetch(&self) -> Result<FetchedKeys, error::KeySourceUnavailable> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.fetch().await
    }
}
