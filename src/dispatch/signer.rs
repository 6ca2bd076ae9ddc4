//! Key-management seam.
//!
//! The service never touches key material itself. Approved decisions are
//! handed to a [`DecisionSigner`], which produces the operation hash or the
//! signature.

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::{AppError, Result};

/// External key-management collaborator invoked after a user approves.
pub trait DecisionSigner: Send + Sync {
    /// Sign and inject `operations` for `source`, returning the operation hash.
    ///
    /// # Errors
    ///
    /// Implementations return `AppError::Unauthorized` for a bad password
    /// and `AppError::Network` for injection failures.
    fn submit_operations<'a>(
        &'a self,
        source: &'a str,
        network: &'a str,
        operations: &'a [Value],
        password: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String>>;

    /// Sign `bytes` with `source`'s key, returning the signature.
    ///
    /// # Errors
    ///
    /// Implementations return `AppError::Unauthorized` for a bad password.
    fn sign<'a>(
        &'a self,
        source: &'a str,
        bytes: &'a str,
        password: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String>>;
}

/// Signer used when no key store is attached; refuses every decision.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeystore;

impl DecisionSigner for NoKeystore {
    fn submit_operations<'a>(
        &'a self,
        source: &'a str,
        _network: &'a str,
        _operations: &'a [Value],
        _password: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            Err(AppError::Unauthorized(format!(
                "no key store attached for {source}"
            )))
        })
    }

    fn sign<'a>(
        &'a self,
        source: &'a str,
        _bytes: &'a str,
        _password: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            Err(AppError::Unauthorized(format!(
                "no key store attached for {source}"
            )))
        })
    }
}
