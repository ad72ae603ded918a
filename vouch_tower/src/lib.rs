//! Bearer token verification for `tower_http` and frameworks built on it,
//! including `axum`
//!
//! [`VerifyBearer`] plugs a [`TokenVerifier`][vouch::TokenVerifier] into
//! [`AsyncRequireAuthorizationLayer`][tower_http::auth::AsyncRequireAuthorizationLayer].
//! Requests carrying a valid `Authorization: Bearer <token>` header reach the
//! inner service with their [`ValidatedClaims`][vouch::ValidatedClaims] in
//! the request extensions. All other requests are answered with
//! `401 Unauthorized` by the configured [`OnRejection`] handler.
//!
//! ```no_run
//! use std::convert::Infallible;
//!
//! use http::{Request, Response};
//! use tower::{service_fn, ServiceBuilder};
//! use vouch::{TokenVerifier, ValidatedClaims, VerifierConfig};
//! use vouch_tower::{TerseRejection, VerifyBearer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let verifier = TokenVerifier::from_config(&VerifierConfig::new("my-project"))?;
//!
//! let service = ServiceBuilder::new()
//!     .layer(VerifyBearer::new(verifier, TerseRejection::<String>::new()).layer())
//!     .service(service_fn(|request: Request<String>| async move {
//!         let user = request
//!             .extensions()
//!             .get::<ValidatedClaims>()
//!             .and_then(|claims| claims.user_id())
//!             .map(|user| user.as_str().to_owned())
//!             .unwrap_or_default();
//!
//!         Ok::<_, Infallible>(Response::new(format!("hello, {user}")))
//!     }));
//! # drop(service);
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, marker::PhantomData};

mod bearer;
pub mod util;

pub use crate::bearer::*;

/// Responds to every rejection with a bare `401 Unauthorized`
///
/// The reason for the rejection is logged but not disclosed to the caller.
pub struct TerseRejection<ResBody> {
    _ty: PhantomData<fn() -> ResBody>,
}

impl<ResBody> TerseRejection<ResBody> {
    /// Instantiates a new instance over a given body type
    #[inline]
    pub fn new() -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> fmt::Debug for TerseRejection<ResBody> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("TerseRejection")
    }
}

impl<ResBody> Default for TerseRejection<ResBody> {
    #[inline]
    fn default() -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> Clone for TerseRejection<ResBody> {
    #[inline]
    fn clone(&self) -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> Copy for TerseRejection<ResBody> {}

/// Responds to every rejection with `401 Unauthorized`, describing the
/// failed check in the `www-authenticate` header
///
/// Useful while developing a client. The descriptions reveal which check a
/// token failed, so prefer [`TerseRejection`] for public services.
pub struct VerboseRejection<ResBody> {
    _ty: PhantomData<fn() -> ResBody>,
}

impl<ResBody> VerboseRejection<ResBody> {
    /// Instantiates a new instance over a given body type
    #[inline]
    pub fn new() -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> fmt::Debug for VerboseRejection<ResBody> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("VerboseRejection")
    }
}

impl<ResBody> Default for VerboseRejection<ResBody> {
    #[inline]
    fn default() -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> Clone for VerboseRejection<ResBody> {
    #[inline]
    fn clone(&self) -> Self {
        Self { _ty: PhantomData }
    }
}

impl<ResBody> Copy for VerboseRejection<ResBody> {}
