//! Incoming swap verification and fulfillment.
//!
//! An incoming swap is a payment received over Lightning through a
//! cooperating server: the server locks the funds in an on-chain HTLC,
//! relays the payment off-chain and proposes a claim transaction. The core
//! checks the swap against the matching invoice secret, counter-signs the
//! claim and releases the preimage. "Full debt" swaps have no on-chain HTLC
//! (the server credits off-chain from collateral) and only need the
//! preimage.

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Network, Transaction};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, WalletError};
use crate::htlc::IncomingSwapCoin;
use crate::keys::{
    HTLC_KEY_CHILD, HdPrivateKey, HdPublicKey, IDENTITY_KEY_CHILD, KeyPath, parse_invoice_path,
};
use crate::sphinx;
use crate::store::{InvoiceRecord, InvoiceStore};

/// Swap descriptor as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingSwap {
    /// Absent for full-debt swaps.
    pub htlc: Option<IncomingSwapHtlc>,
    /// Empty when no onion was relayed (on-chain-only variants).
    #[serde(with = "hex::serde")]
    pub sphinx_packet: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub payment_hash: Vec<u8>,
    pub payment_amount_sat: i64,
    /// Fee the server deducts from the claim output.
    pub collect_sat: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingSwapHtlc {
    /// Raw transaction carrying the HTLC output.
    #[serde(with = "hex::serde")]
    pub htlc_tx: Vec<u8>,
    pub expiration_height: i64,
    /// The server's HTLC key for this invoice's derivation path.
    #[serde(with = "hex::serde")]
    pub swap_server_public_key: Vec<u8>,
}

/// Server-proposed claim data. The trailing fields are carried by the wire
/// format but unused here; they are accepted and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingSwapFulfillmentData {
    #[serde(with = "hex::serde")]
    pub fulfillment_tx: Vec<u8>,
    /// DER-encoded server signature for the claim input.
    #[serde(with = "hex::serde")]
    pub muun_signature: Vec<u8>,
    pub output_version: i32,
    pub output_path: String,
    #[serde(with = "hex::serde")]
    pub merkle_tree: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub htlc_block: Vec<u8>,
    pub block_height: i64,
    pub confirmation_target: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingSwapFulfillmentResult {
    /// Fully signed claim transaction, witness-serialized. Empty for
    /// full-debt swaps.
    #[serde(with = "hex::serde")]
    pub fulfillment_tx: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub preimage: Vec<u8>,
}

/// Checks that an incoming swap can be fulfilled with a stored secret.
///
/// Failure means the caller should ask the server to expire the invoice;
/// retrying cannot help.
pub fn verify_fulfillable(
    store: &InvoiceStore,
    swap: &IncomingSwap,
    user_key: &HdPrivateKey,
) -> Result<()> {
    checked_swap_record(store, swap, user_key)?;
    Ok(())
}

/// Validates the server's claim proposal, counter-signs it and releases the
/// preimage.
pub fn fulfill(
    store: &InvoiceStore,
    network: Network,
    swap: &IncomingSwap,
    data: &IncomingSwapFulfillmentData,
    user_key: &HdPrivateKey,
    muun_key: &HdPublicKey,
) -> Result<IncomingSwapFulfillmentResult> {
    let htlc = swap
        .htlc
        .as_ref()
        .ok_or_else(|| WalletError::unfulfillable("missing swap htlc data"))?;
    let (record, key_path) = checked_swap_record(store, swap, user_key)?;

    let mut tx: Transaction = bitcoin::consensus::encode::deserialize(&data.fulfillment_tx)
        .map_err(|err| {
            WalletError::unfulfillable(format!("malformed fulfillment transaction: {err}"))
        })?;
    if tx.input.len() != 1 {
        return Err(WalletError::unfulfillable(format!(
            "expected exactly 1 input, got {count}",
            count = tx.input.len()
        )));
    }
    if tx.output.len() != 1 {
        return Err(WalletError::unfulfillable(format!(
            "expected exactly 1 output, got {count}",
            count = tx.output.len()
        )));
    }
    let htlc_tx: Transaction =
        bitcoin::consensus::encode::deserialize(&htlc.htlc_tx).map_err(|err| {
            WalletError::unfulfillable(format!("malformed htlc transaction: {err}"))
        })?;

    let user_htlc_key = user_key.derive_to(&key_path)?.derive_child(HTLC_KEY_CHILD)?;
    let muun_htlc_key = muun_key.derive_to(&key_path)?.derive_child(HTLC_KEY_CHILD)?;
    let swap_server_public_key = PublicKey::from_slice(&htlc.swap_server_public_key)
        .map_err(|err| {
            WalletError::unfulfillable(format!("invalid swap server public key: {err}"))
        })?;

    let coin = IncomingSwapCoin {
        network,
        htlc_tx: &htlc_tx,
        payment_hash: record.payment_hash,
        preimage: record.preimage,
        swap_server_public_key,
        expiration_height: htlc.expiration_height,
        muun_signature: &data.muun_signature,
        verify_output_amount: true,
        collect_sat: swap.collect_sat,
    };
    coin.sign_input(0, &mut tx, &user_htlc_key.secret_key(), &muun_htlc_key.public_key())?;

    tracing::info!(
        payment_hash = %hex::encode(record.payment_hash),
        txid = %tx.compute_txid(),
        "fulfilled incoming swap"
    );
    Ok(IncomingSwapFulfillmentResult {
        fulfillment_tx: bitcoin::consensus::encode::serialize(&tx),
        preimage: record.preimage.to_vec(),
    })
}

/// Fulfillment of a swap with no on-chain HTLC: only the preimage changes
/// hands.
pub fn fulfill_full_debt(
    store: &InvoiceStore,
    swap: &IncomingSwap,
) -> Result<IncomingSwapFulfillmentResult> {
    let payment_hash = payment_hash_32(&swap.payment_hash)?;
    let record = store.find_by_payment_hash(&payment_hash)?;
    tracing::info!(
        payment_hash = %hex::encode(record.payment_hash),
        "fulfilled full-debt incoming swap"
    );
    Ok(IncomingSwapFulfillmentResult {
        fulfillment_tx: Vec::new(),
        preimage: record.preimage.to_vec(),
    })
}

fn checked_swap_record(
    store: &InvoiceStore,
    swap: &IncomingSwap,
    user_key: &HdPrivateKey,
) -> Result<(InvoiceRecord, KeyPath)> {
    let payment_hash = payment_hash_32(&swap.payment_hash)?;
    let record = store.find_by_payment_hash(&payment_hash)?;
    let key_path = parse_invoice_path(&record.key_path)?;
    let identity_key = user_key.derive_to(&key_path)?.derive_child(IDENTITY_KEY_CHILD)?;

    // Underpaying an amounted invoice is rejected; overpaying is accepted.
    if record.amount_sat != 0 && swap.payment_amount_sat < record.amount_sat {
        return Err(WalletError::unfulfillable(format!(
            "payment of {paid} sat is below the invoiced {invoiced} sat",
            paid = swap.payment_amount_sat,
            invoiced = record.amount_sat
        )));
    }

    if !swap.sphinx_packet.is_empty() {
        let amount_msat = u64::try_from(swap.payment_amount_sat)
            .ok()
            .and_then(|sat| sat.checked_mul(1000))
            .ok_or_else(|| {
                WalletError::unfulfillable(format!(
                    "invalid payment amount {amount}",
                    amount = swap.payment_amount_sat
                ))
            })?;
        sphinx::validate(
            &swap.sphinx_packet,
            &payment_hash,
            &record.payment_secret,
            &identity_key.secret_key(),
            amount_msat,
        )?;
    }
    Ok((record, key_path))
}

fn payment_hash_32(payment_hash: &[u8]) -> Result<[u8; 32]> {
    payment_hash.try_into().map_err(|_| {
        WalletError::unfulfillable(format!(
            "payment hash must be 32 bytes, got {len}",
            len = payment_hash.len()
        ))
    })
}
