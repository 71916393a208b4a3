//! Error kinds surfaced by the wallet core.

use thiserror::Error;

/// The failure modes callers must distinguish.
///
/// Every variant wraps its cause; nothing is recovered silently. Note that
/// "no unused invoice secret available" is not an error: `create_invoice`
/// signals it with an empty string.
#[derive(Debug, Error)]
pub enum WalletError {
    /// Backing store failure (I/O, migration, query). Fatal at the caller.
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),

    /// No invoice matches the given payment hash. Receiving a swap for an
    /// unknown hash is a protocol violation upstream.
    #[error("no invoice found for payment hash {payment_hash}")]
    NotFound { payment_hash: String },

    /// The swap failed validation and must not be fulfilled. Callers respond
    /// by asking the server to expire the invoice rather than retrying.
    #[error("swap cannot be fulfilled: {0}")]
    UnfulfillableSwap(String),

    /// Key parsing, derivation, signing or RNG failure.
    #[error("crypto failure: {0:#}")]
    Crypto(anyhow::Error),

    /// bech32 / DER / transaction serialization failure.
    #[error("encoding failure: {0:#}")]
    Encoding(anyhow::Error),
}

impl WalletError {
    pub(crate) fn storage(err: impl Into<anyhow::Error>) -> Self {
        WalletError::Storage(err.into())
    }

    pub(crate) fn not_found(payment_hash: &[u8]) -> Self {
        WalletError::NotFound { payment_hash: hex::encode(payment_hash) }
    }

    pub(crate) fn unfulfillable(reason: impl Into<String>) -> Self {
        WalletError::UnfulfillableSwap(reason.into())
    }

    pub(crate) fn crypto(err: impl Into<anyhow::Error>) -> Self {
        WalletError::Crypto(err.into())
    }

    pub(crate) fn encoding(err: impl Into<anyhow::Error>) -> Self {
        WalletError::Encoding(err.into())
    }
}

impl From<rusqlite::Error> for WalletError {
    fn from(err: rusqlite::Error) -> Self {
        WalletError::storage(err)
    }
}

impl From<bitcoin::bip32::Error> for WalletError {
    fn from(err: bitcoin::bip32::Error) -> Self {
        WalletError::crypto(err)
    }
}

impl From<bitcoin::secp256k1::Error> for WalletError {
    fn from(err: bitcoin::secp256k1::Error) -> Self {
        WalletError::crypto(err)
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;
