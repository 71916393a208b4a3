//! BOLT-11 invoice construction from persisted secrets.
//!
//! Invoices are signed with the per-invoice identity key, not a long-lived
//! node key: the receiving "node" only exists as an endpoint behind the
//! routing hint, so each invoice advertises its own node id and a synthetic
//! short channel id pointing at the hinted peer.

use std::time::Duration;

use anyhow::anyhow;
use bitcoin::Network;
use bitcoin::hashes::Hash as _;
use bitcoin::hashes::sha256;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1};
use lightning_invoice::{
    Currency, InvoiceBuilder, PaymentSecret, RouteHint, RouteHintHop, RoutingFees,
};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, WalletError};
use crate::keys::{HdPrivateKey, IDENTITY_KEY_CHILD, parse_invoice_path};
use crate::store::InvoiceStore;

/// Invoices are short-lived; the server re-registers secrets continuously.
pub const INVOICE_EXPIRY: Duration = Duration::from_secs(3600);

/// Final CLTV delta of 72 blocks, roughly half a day.
pub const MIN_FINAL_CLTV_EXPIRY_DELTA: u64 = 72;

/// Routing hint parameters for the single hop between the hinted peer and
/// this wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHints {
    /// Compressed secp256k1 public key of the hinted node (33 bytes).
    #[serde(with = "hex::serde")]
    pub node_pubkey: Vec<u8>,
    pub fee_base_msat: i64,
    pub fee_proportional_millionths: i64,
    pub cltv_expiry_delta: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceOptions {
    pub description: String,
    /// 0 requests an amountless invoice.
    pub amount_sat: i64,
}

/// Builds and signs a BOLT-11 invoice from the first unused secret.
///
/// Returns the empty string when no unused secret is available; that is a
/// signal to replenish, not an error. The consumed record is marked Used
/// before the invoice string is handed back: once the string escapes this
/// function the server must be able to settle it.
pub fn create_invoice(
    store: &InvoiceStore,
    network: Network,
    user_key: &HdPrivateKey,
    route_hints: &RouteHints,
    options: &InvoiceOptions,
) -> Result<String> {
    let Some(record) = store.find_first_unused()? else {
        return Ok(String::new());
    };

    let key_path = parse_invoice_path(&record.key_path)?;
    let identity_key = user_key.derive_to(&key_path)?.derive_child(IDENTITY_KEY_CHILD)?;

    let hinted_node = PublicKey::from_slice(&route_hints.node_pubkey)
        .map_err(|err| WalletError::crypto(anyhow!("invalid route hint node key: {err}")))?;
    let hop = RouteHintHop {
        src_node_id: hinted_node,
        short_channel_id: record.short_chan_id,
        fees: RoutingFees {
            base_msat: u32::try_from(route_hints.fee_base_msat)
                .map_err(|_| WalletError::encoding(anyhow!("fee_base_msat out of range")))?,
            proportional_millionths: u32::try_from(route_hints.fee_proportional_millionths)
                .map_err(|_| {
                    WalletError::encoding(anyhow!("fee_proportional_millionths out of range"))
                })?,
        },
        cltv_expiry_delta: u16::try_from(route_hints.cltv_expiry_delta)
            .map_err(|_| WalletError::encoding(anyhow!("cltv_expiry_delta out of range")))?,
        htlc_minimum_msat: None,
        htlc_maximum_msat: None,
    };

    let payment_hash = sha256::Hash::from_byte_array(record.payment_hash);
    let mut builder = InvoiceBuilder::new(currency(network)?)
        .description(options.description.clone())
        .payment_hash(payment_hash)
        .payment_secret(PaymentSecret(record.payment_secret))
        .current_timestamp()
        .min_final_cltv_expiry_delta(MIN_FINAL_CLTV_EXPIRY_DELTA)
        .expiry_time(INVOICE_EXPIRY)
        .private_route(RouteHint(vec![hop]));

    if options.amount_sat != 0 {
        let amount_msat = u64::try_from(options.amount_sat)
            .map_err(|_| WalletError::encoding(anyhow!("negative invoice amount")))?
            .checked_mul(1000)
            .ok_or_else(|| WalletError::encoding(anyhow!("invoice amount overflow")))?;
        builder = builder.amount_milli_satoshis(amount_msat);
    }

    let secp = Secp256k1::new();
    let secret_key = identity_key.secret_key();
    let invoice = builder
        .build_signed(|hash| {
            secp.sign_ecdsa_recoverable(&Message::from_digest(*hash.as_ref()), &secret_key)
        })
        .map_err(|err| WalletError::encoding(anyhow!("failed to build and sign invoice: {err:?}")))?;

    // The string is about to become known externally; committing the state
    // transition first means a persistence failure aborts delivery.
    let id = record
        .id
        .ok_or_else(|| WalletError::storage(anyhow!("unused record is missing its row id")))?;
    store.mark_used(id, options.amount_sat, chrono::Utc::now())?;

    tracing::info!(
        payment_hash = %hex::encode(record.payment_hash),
        amount_sat = options.amount_sat,
        "created invoice"
    );
    Ok(invoice.to_string())
}

fn currency(network: Network) -> Result<Currency> {
    match network {
        Network::Bitcoin => Ok(Currency::Bitcoin),
        Network::Testnet => Ok(Currency::BitcoinTestnet),
        Network::Signet => Ok(Currency::Signet),
        Network::Regtest => Ok(Currency::Regtest),
        other => Err(WalletError::encoding(anyhow!("unsupported network {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{HdPrivateKey, invoice_branch};
    use crate::secrets::{generate_invoice_secrets, persist_invoice_secrets};
    use crate::store::{InvoiceState, SHORT_CHAN_ID_FLAG};
    use anyhow::Result;
    use lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescriptionRef};
    use std::str::FromStr;

    fn seeded_wallet(dir: &tempfile::TempDir) -> Result<(InvoiceStore, HdPrivateKey)> {
        let store = InvoiceStore::open(&dir.path().join("wallet.db"))?;
        let user_root = HdPrivateKey::from_seed(&[7u8; 32], Network::Regtest)?;
        let muun_root = HdPrivateKey::from_seed(&[8u8; 32], Network::Regtest)?;

        let user_base = user_root.derive_to(&invoice_branch())?.public();
        let muun_base = muun_root.derive_to(&invoice_branch())?.public();
        let mut bundle = generate_invoice_secrets(&store, &user_base, &muun_base)?;
        persist_invoice_secrets(&store, &mut bundle)?;
        Ok((store, user_root))
    }

    fn test_route_hints() -> RouteHints {
        let node = HdPrivateKey::from_seed(&[9u8; 32], Network::Regtest)
            .unwrap()
            .public();
        RouteHints {
            node_pubkey: node.raw().to_vec(),
            fee_base_msat: 1000,
            fee_proportional_millionths: 100,
            cltv_expiry_delta: 144,
        }
    }

    #[test]
    fn test_create_invoice_encodes_the_stored_secret() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, user_root) = seeded_wallet(&dir)?;
        let hints = test_route_hints();

        let record = store.find_first_unused()?.unwrap();
        let options = InvoiceOptions { description: "coffee".to_string(), amount_sat: 1500 };
        let encoded = create_invoice(&store, Network::Regtest, &user_root, &hints, &options)?;
        assert!(encoded.starts_with("lnbcrt"));

        let invoice = Bolt11Invoice::from_str(&encoded)
            .map_err(|err| anyhow::anyhow!("parse failed: {err:?}"))?;
        assert_eq!(invoice.payment_hash().as_byte_array(), &record.payment_hash);
        assert_eq!(invoice.payment_secret().0, record.payment_secret);
        assert_eq!(invoice.amount_milli_satoshis(), Some(1_500_000));
        assert_eq!(invoice.min_final_cltv_expiry_delta(), MIN_FINAL_CLTV_EXPIRY_DELTA);
        assert_eq!(invoice.expiry_time(), INVOICE_EXPIRY);
        match invoice.description() {
            Bolt11InvoiceDescriptionRef::Direct(description) => {
                assert_eq!(description.to_string(), "coffee");
            }
            other => panic!("unexpected description {other:?}"),
        }

        // One private hint: the caller's node, our synthetic channel id.
        let hints_out = invoice.route_hints();
        assert_eq!(hints_out.len(), 1);
        let hop = &hints_out[0].0[0];
        assert_eq!(hop.src_node_id.serialize().to_vec(), hints.node_pubkey);
        assert_eq!(hop.short_channel_id, record.short_chan_id);
        assert_ne!(hop.short_channel_id & SHORT_CHAN_ID_FLAG, 0);
        assert_eq!(hop.cltv_expiry_delta, 144);
        assert_eq!(hop.fees.base_msat, 1000);

        // Signed by the per-invoice identity key.
        let key_path = parse_invoice_path(&record.key_path)?;
        let identity = user_root.derive_to(&key_path)?.derive_child(IDENTITY_KEY_CHILD)?;
        assert_eq!(invoice.recover_payee_pub_key(), identity.public().public_key());

        // The consumed record is now Used with the requested amount.
        let used = store.find_by_payment_hash(&record.payment_hash)?;
        assert_eq!(used.state, InvoiceState::Used);
        assert_eq!(used.amount_sat, 1500);
        assert!(used.used_at.is_some());
        Ok(())
    }

    #[test]
    fn test_create_invoice_amountless() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, user_root) = seeded_wallet(&dir)?;

        let options = InvoiceOptions { description: String::new(), amount_sat: 0 };
        let encoded =
            create_invoice(&store, Network::Regtest, &user_root, &test_route_hints(), &options)?;
        let invoice = Bolt11Invoice::from_str(&encoded)
            .map_err(|err| anyhow::anyhow!("parse failed: {err:?}"))?;
        assert_eq!(invoice.amount_milli_satoshis(), None);
        Ok(())
    }

    #[test]
    fn test_create_invoice_never_reuses_a_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, user_root) = seeded_wallet(&dir)?;
        let hints = test_route_hints();
        let options = InvoiceOptions::default();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let encoded =
                create_invoice(&store, Network::Regtest, &user_root, &hints, &options)?;
            let invoice = Bolt11Invoice::from_str(&encoded)
                .map_err(|err| anyhow::anyhow!("parse failed: {err:?}"))?;
            assert!(seen.insert(*invoice.payment_hash()));
        }

        // Pool exhausted: the empty string signals "generate more secrets".
        let encoded = create_invoice(&store, Network::Regtest, &user_root, &hints, &options)?;
        assert_eq!(encoded, "");
        Ok(())
    }
}
