//! Top-level wallet handle.
//!
//! Owns the configured database path and network; nothing here is global.
//! Every entry point is synchronous and opens a fresh store handle that is
//! released on all exit paths, so callers can compose these with whatever
//! concurrency primitive they prefer.

use std::path::{Path, PathBuf};

use bitcoin::Network;

use crate::errors::Result;
use crate::invoice::{self, InvoiceOptions, RouteHints};
use crate::keys::{HdPrivateKey, HdPublicKey};
use crate::secrets::{self, InvoiceSecretsBundle};
use crate::store::InvoiceStore;
use crate::swaps::{
    self, IncomingSwap, IncomingSwapFulfillmentData, IncomingSwapFulfillmentResult,
};

pub struct Wallet {
    db_path: PathBuf,
    network: Network,
}

impl Wallet {
    pub fn new(db_path: impl AsRef<Path>, network: Network) -> Self {
        Wallet { db_path: db_path.as_ref().to_path_buf(), network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Mints invoice secrets up to the unused cap. Register the returned
    /// bundle with the server, then call [`Wallet::persist_invoice_secrets`].
    pub fn generate_invoice_secrets(
        &self,
        user_key: &HdPublicKey,
        muun_key: &HdPublicKey,
    ) -> Result<InvoiceSecretsBundle> {
        self.with_store(|store| secrets::generate_invoice_secrets(store, user_key, muun_key))
    }

    pub fn persist_invoice_secrets(&self, bundle: &mut InvoiceSecretsBundle) -> Result<()> {
        self.with_store(|store| secrets::persist_invoice_secrets(store, bundle))
    }

    /// Builds a signed BOLT-11 invoice from the first unused secret, or
    /// returns the empty string when none is available.
    pub fn create_invoice(
        &self,
        user_key: &HdPrivateKey,
        route_hints: &RouteHints,
        options: &InvoiceOptions,
    ) -> Result<String> {
        self.with_store(|store| {
            invoice::create_invoice(store, self.network, user_key, route_hints, options)
        })
    }

    pub fn verify_fulfillable(&self, swap: &IncomingSwap, user_key: &HdPrivateKey) -> Result<()> {
        self.with_store(|store| swaps::verify_fulfillable(store, swap, user_key))
    }

    pub fn fulfill(
        &self,
        swap: &IncomingSwap,
        data: &IncomingSwapFulfillmentData,
        user_key: &HdPrivateKey,
        muun_key: &HdPublicKey,
    ) -> Result<IncomingSwapFulfillmentResult> {
        self.with_store(|store| {
            swaps::fulfill(store, self.network, swap, data, user_key, muun_key)
        })
    }

    pub fn fulfill_full_debt(&self, swap: &IncomingSwap) -> Result<IncomingSwapFulfillmentResult> {
        self.with_store(|store| swaps::fulfill_full_debt(store, swap))
    }

    fn with_store<T>(&self, operation: impl FnOnce(&InvoiceStore) -> Result<T>) -> Result<T> {
        let store = InvoiceStore::open(&self.db_path)?;
        let result = operation(&store);
        store.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::invoice_branch;
    use anyhow::Result;

    #[test]
    fn test_wallet_invoice_lifecycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let wallet = Wallet::new(dir.path().join("wallet.db"), Network::Regtest);

        let user_root = HdPrivateKey::from_seed(&[71u8; 32], Network::Regtest)?;
        let muun_root = HdPrivateKey::from_seed(&[72u8; 32], Network::Regtest)?;
        let user_base = user_root.derive_to(&invoice_branch())?.public();
        let muun_base = muun_root.derive_to(&invoice_branch())?.public();

        let mut bundle = wallet.generate_invoice_secrets(&user_base, &muun_base)?;
        assert_eq!(bundle.len(), crate::secrets::MAX_UNUSED_SECRETS as usize);
        wallet.persist_invoice_secrets(&mut bundle)?;

        // A second generation is a no-op against a full pool.
        assert!(wallet.generate_invoice_secrets(&user_base, &muun_base)?.is_empty());

        let hints = RouteHints {
            node_pubkey: muun_base.raw().to_vec(),
            fee_base_msat: 1000,
            fee_proportional_millionths: 1,
            cltv_expiry_delta: 144,
        };
        let encoded = wallet.create_invoice(
            &user_root,
            &hints,
            &InvoiceOptions { description: "top-up".to_string(), amount_sat: 2100 },
        )?;
        assert!(encoded.starts_with("lnbcrt"));
        Ok(())
    }
}
