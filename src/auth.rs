//! Bearer-token authentication for the network transports
//!
//! The token check itself is pluggable: any `Fn(&str) -> bool` can act as the
//! validator. Rejections happen in middleware, before a message reaches the
//! server.

use std::{fmt, sync::Arc};

use axum::{
    extract::{Request, State},
    http::uri::Scheme,
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::errors::AppError;

pub type TokenValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct AuthConfig {
    validator: Option<TokenValidator>,
    require_secure: bool,
    trust_forwarded_proto: bool,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("enabled", &self.is_enabled())
            .field("require_secure", &self.require_secure)
            .field("trust_forwarded_proto", &self.trust_forwarded_proto)
            .finish()
    }
}

impl AuthConfig {
    /// No token required.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn bearer<F>(validator: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            validator: Some(Arc::new(validator)),
            ..Self::default()
        }
    }

    pub fn static_token(token: impl Into<String>) -> Self {
        let expected: Arc<str> = Arc::from(token.into());
        Self::bearer(move |token| token == expected.as_ref())
    }

    pub fn require_secure_transport(mut self, require: bool) -> Self {
        self.require_secure = require;
        self
    }

    /// Accept `x-forwarded-proto: https` as proof of a secure connection.
    /// Only safe behind a proxy that overwrites the header.
    pub fn trust_forwarded_proto(mut self, trust: bool) -> Self {
        self.trust_forwarded_proto = trust;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.validator.is_some()
    }

    pub fn validate(&self, token: &str) -> bool {
        self.validator
            .as_ref()
            .map_or(true, |validator| validator(token))
    }

    /// Checks one request's headers and scheme.
    pub fn authorize(
        &self,
        is_secure: bool,
        bearer: Option<&Authorization<Bearer>>,
    ) -> Result<(), AppError> {
        if self.require_secure && !is_secure {
            return Err(AppError::forbidden(
                "insecure_transport",
                "secure transport required",
            ));
        }

        if !self.is_enabled() {
            return Ok(());
        }

        let Some(auth) = bearer else {
            return Err(AppError::unauthorized(
                "missing_token",
                "missing authorization header",
            ));
        };

        if !self.validate(auth.token()) {
            return Err(AppError::unauthorized(
                "invalid_token",
                "invalid bearer token",
            ));
        }

        Ok(())
    }
}

/// A request counts as secure when it arrived over https directly, or, when
/// `trust_forwarded` is set, through a proxy reporting `x-forwarded-proto: https`.
pub fn is_secure_request(request: &Request, trust_forwarded: bool) -> bool {
    if request.uri().scheme() == Some(&Scheme::HTTPS) {
        return true;
    }
    trust_forwarded
        && request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

pub async fn require_bearer_token(
    State(auth): State<Arc<AuthConfig>>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let bearer = auth_header.map(|TypedHeader(auth)| auth);
    let secure = is_secure_request(&request, auth.trust_forwarded_proto);
    auth.authorize(secure, bearer.as_ref())?;

    Ok(next.run(request).await)
}
