//! Generation and persistence of invoice secrets.
//!
//! Secrets are minted in bulk up to a fixed cap of unused records. A freshly
//! generated bundle is NOT persisted: the host registers it with the remote
//! server first and only then calls [`persist_invoice_secrets`], so the
//! store never holds a secret the server doesn't know about.

use anyhow::anyhow;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::errors::{Result, WalletError};
use crate::keys::{HTLC_KEY_CHILD, IDENTITY_KEY_CHILD, HdPublicKey, invoice_key_path};
use crate::store::{InvoiceRecord, InvoiceState, InvoiceStore, SHORT_CHAN_ID_FLAG};

/// Cap on Registered records; generation replenishes up to this many.
pub const MAX_UNUSED_SECRETS: i64 = 5;

/// A freshly generated secret plus the public keys the server needs to
/// register it.
#[derive(Debug, Clone)]
pub struct InvoiceSecret {
    pub record: InvoiceRecord,
    pub identity_key: HdPublicKey,
    pub user_htlc_key: HdPublicKey,
    pub muun_htlc_key: HdPublicKey,
}

/// An ordered batch of generated secrets awaiting registration.
///
/// Exposes length and indexed access so it can cross a value-type boundary
/// into the host application.
#[derive(Debug, Clone, Default)]
pub struct InvoiceSecretsBundle {
    secrets: Vec<InvoiceSecret>,
}

impl InvoiceSecretsBundle {
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&InvoiceSecret> {
        self.secrets.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InvoiceSecret> {
        self.secrets.iter()
    }
}

/// Replenishes the pool of unused invoice secrets up to
/// [`MAX_UNUSED_SECRETS`], returning the newly minted batch. Returns an
/// empty bundle when the pool is already full.
pub fn generate_invoice_secrets(
    store: &InvoiceStore,
    user_key: &HdPublicKey,
    muun_key: &HdPublicKey,
) -> Result<InvoiceSecretsBundle> {
    let unused = store.count_unused()?;
    let missing = MAX_UNUSED_SECRETS - unused;
    if missing <= 0 {
        return Ok(InvoiceSecretsBundle::default());
    }

    let mut secrets = Vec::with_capacity(missing as usize);
    for _ in 0..missing {
        secrets.push(generate_secret(user_key, muun_key)?);
    }
    tracing::debug!(count = secrets.len(), "generated invoice secrets");
    Ok(InvoiceSecretsBundle { secrets })
}

/// Writes every record of a (server-registered) bundle as Registered,
/// assigning row ids in place.
pub fn persist_invoice_secrets(
    store: &InvoiceStore,
    bundle: &mut InvoiceSecretsBundle,
) -> Result<()> {
    for secret in &mut bundle.secrets {
        store.create(&mut secret.record)?;
    }
    tracing::debug!(count = bundle.len(), "persisted invoice secrets");
    Ok(())
}

fn generate_secret(user_key: &HdPublicKey, muun_key: &HdPublicKey) -> Result<InvoiceSecret> {
    let preimage: [u8; 32] = random_bytes()?;
    let payment_hash: [u8; 32] = Sha256::digest(preimage).into();
    let payment_secret: [u8; 32] = random_bytes()?;

    // Two uniform non-hardened levels keep sibling invoices unlinkable.
    let level_bytes: [u8; 8] = random_bytes()?;
    let l1 = u32::from_le_bytes(level_bytes[..4].try_into().unwrap()) & 0x7FFF_FFFF;
    let l2 = u32::from_le_bytes(level_bytes[4..].try_into().unwrap()) & 0x7FFF_FFFF;
    let key_path = invoice_key_path(l1, l2);

    let user_base = user_key.derive_to(&key_path)?;
    let identity_key = user_base.derive_child(IDENTITY_KEY_CHILD)?;
    let user_htlc_key = user_base.derive_child(HTLC_KEY_CHILD)?;
    let muun_htlc_key = muun_key.derive_to(&key_path)?.derive_child(HTLC_KEY_CHILD)?;

    let scid_bytes: [u8; 8] = random_bytes()?;
    let short_chan_id = u64::from_le_bytes(scid_bytes) | SHORT_CHAN_ID_FLAG;

    let now = chrono::Utc::now();
    Ok(InvoiceSecret {
        record: InvoiceRecord {
            id: None,
            preimage,
            payment_hash,
            payment_secret,
            key_path: key_path.to_string(),
            short_chan_id,
            amount_sat: 0,
            state: InvoiceState::Registered,
            used_at: None,
            created_at: now,
            updated_at: now,
        },
        identity_key,
        user_htlc_key,
        muun_htlc_key,
    })
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| WalletError::crypto(anyhow!("system RNG failed: {err}")))?;
    Ok(bytes)
}
