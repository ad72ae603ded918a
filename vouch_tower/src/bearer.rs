use std::fmt;

use futures::future::BoxFuture;
use http::{header, Request, Response};
use tower_http::auth::{AsyncAuthorizeRequest, AsyncRequireAuthorizationLayer};
use vouch::{TokenVerifier, VerifyError};
use vouch_clock::Clock;

use crate::{util::unauthorized, TerseRejection, VerboseRejection};

/// Authorizes requests by verifying their bearer token
///
/// On success, the token's [`ValidatedClaims`][vouch::ValidatedClaims] are
/// inserted into the request extensions before the request is forwarded. On
/// failure, the request is answered by the rejection handler and never
/// reaches the inner service.
pub struct VerifyBearer<C, OnError> {
    verifier: TokenVerifier<C>,
    on_error: OnError,
}

impl<C, OnError> Clone for VerifyBearer<C, OnError>
where
    C: Clone,
    OnError: Clone,
{
    #[inline]
    fn clone(&self) -> Self {
        Self {
            verifier: self.verifier.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<C, OnError> fmt::Debug for VerifyBearer<C, OnError>
where
    C: fmt::Debug,
    OnError: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VerifyBearer")
            .field("verifier", &self.verifier)
            .field("on_error", &self.on_error)
            .finish()
    }
}

impl<C, OnError> VerifyBearer<C, OnError> {
    /// Constructs an authorizer that rejects requests through `on_error`
    #[inline]
    pub fn new(verifier: TokenVerifier<C>, on_error: OnError) -> Self {
        Self { verifier, on_error }
    }

    /// Replaces the rejection handler
    #[inline]
    pub fn with_error_handler<NewOnError>(
        self,
        on_error: NewOnError,
    ) -> VerifyBearer<C, NewOnError> {
        VerifyBearer {
            verifier: self.verifier,
            on_error,
        }
    }

    /// The verifier applied to each request
    #[inline]
    pub fn verifier(&self) -> &TokenVerifier<C> {
        &self.verifier
    }

    /// Wraps this authorizer in a layer
    #[inline]
    pub fn layer(self) -> AsyncRequireAuthorizationLayer<Self> {
        AsyncRequireAuthorizationLayer::new(self)
    }
}

impl<C, OnError, ReqBody> AsyncAuthorizeRequest<ReqBody> for VerifyBearer<C, OnError>
where
    C: Clock + Clone + Send + Sync + 'static,
    OnError: OnRejection + Clone + Send + Sync + 'static,
    OnError::Body: Send + 'static,
    ReqBody: Send + 'static,
{
    type RequestBody = ReqBody;
    type ResponseBody = OnError::Body;
    type Future = BoxFuture<'static, Result<Request<ReqBody>, Response<OnError::Body>>>;

    fn authorize(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let verifier = self.verifier.clone();
        let on_error = self.on_error.clone();

        Box::pin(async move {
            let authorization = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());

            let result = verifier.verify_authorization(authorization).await;

            match result {
                Ok(claims) => {
                    tracing::trace!("bearer token was valid");
                    let _ = request.extensions_mut().insert(claims);
                    Ok(request)
                }
                Err(err) => Err(on_error.on_rejection(&err)),
            }
        })
    }
}

/// Handler for responding to requests whose bearer token was rejected
pub trait OnRejection {
    /// The body type returned on an error
    type Body;

    /// Response when the bearer token was missing or failed verification
    fn on_rejection(&self, error: &VerifyError) -> Response<Self::Body>;
}

macro_rules! delegate_impls {
    ($($ty:ty)*) => {
        $(
            impl<T> OnRejection for $ty
            where
                T: OnRejection,
            {
                type Body = T::Body;

                fn on_rejection(&self, error: &VerifyError) -> Response<Self::Body> {
                    T::on_rejection(self, error)
                }
            }
        )*
    }
}

delegate_impls!(
    &'_ T
    Box<T>
    std::rc::Rc<T>
    std::sync::Arc<T>
);

impl<ResBody> OnRejection for TerseRejection<ResBody>
where
    ResBody: Default,
{
    type Body = ResBody;

    #[inline]
    fn on_rejection(&self, error: &VerifyError) -> Response<Self::Body> {
        tracing::debug!(kind = %error.kind(), "bearer token rejected");
        unauthorized("")
    }
}

impl<ResBody> OnRejection for VerboseRejection<ResBody>
where
    ResBody: Default,
{
    type Body = ResBody;

    #[inline]
    fn on_rejection(&self, error: &VerifyError) -> Response<Self::Body> {
        let description = describe(error);
        tracing::debug!(kind = %error.kind(), "bearer token rejected: {description}");
        unauthorized(&description)
    }
}

fn describe(error: &VerifyError) -> String {
    let mut description = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(next) = source {
        description.push_str(": ");
        description.push_str(&next.to_string());
        source = next.source();
    }
    description
}
