//! HTLC claim signing for incoming swaps.
//!
//! The swap server locks the payment in a P2WSH output with two branches:
//! a claim path requiring the preimage plus signatures from both the user
//! and the server HTLC keys, and a timeout path returning the funds to the
//! user alone once `expiration_height` passes:
//!
//! ```text
//! <server_htlc_pub> OP_CHECKSIG
//! OP_IF
//!     <user_htlc_pub> OP_CHECKSIGVERIFY
//!     OP_SIZE 32 OP_EQUALVERIFY
//!     OP_SHA256 <payment_hash> OP_EQUAL
//! OP_ELSE
//!     <expiration_height> OP_CHECKLOCKTIMEVERIFY OP_DROP
//!     <user_htlc_pub> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! Fulfillment exercises only the claim path; its witness stack, bottom to
//! top, is `[preimage, user_sig, server_sig, script]`.

use anyhow::anyhow;
use bitcoin::hashes::Hash as _;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY,
    OP_IF, OP_SHA256, OP_SIZE,
};
use bitcoin::script::Builder;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Transaction, Witness};

use crate::errors::{Result, WalletError};

/// Witness script binding the payment hash, both claim keys and the expiry.
pub fn htlc_witness_script(
    payment_hash: &[u8; 32],
    user_htlc_pubkey: &PublicKey,
    server_htlc_pubkey: &PublicKey,
    expiration_height: i64,
) -> ScriptBuf {
    Builder::new()
        .push_slice(server_htlc_pubkey.serialize())
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_IF)
        .push_slice(user_htlc_pubkey.serialize())
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_SIZE)
        .push_int(32)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_SHA256)
        .push_slice(*payment_hash)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_ELSE)
        .push_int(expiration_height)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_slice(user_htlc_pubkey.serialize())
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script()
}

/// Everything needed to validate and counter-sign one HTLC claim input.
pub struct IncomingSwapCoin<'a> {
    pub network: Network,
    pub htlc_tx: &'a Transaction,
    pub payment_hash: [u8; 32],
    pub preimage: [u8; 32],
    pub swap_server_public_key: PublicKey,
    pub expiration_height: i64,
    /// DER signature (no sighash byte) supplied by the server.
    pub muun_signature: &'a [u8],
    pub verify_output_amount: bool,
    /// Fee the server may deduct from the claim output.
    pub collect_sat: i64,
}

impl IncomingSwapCoin<'_> {
    /// Validates the proposed claim of the HTLC output and fills in the
    /// witness for `tx.input[index]`.
    ///
    /// The input must spend the HTLC output of `htlc_tx`, the claim output
    /// must carry the HTLC value minus the collect fee, and the server's
    /// signature must already be valid for the claim sighash; only then is
    /// the user's signature produced.
    pub fn sign_input(
        &self,
        index: usize,
        tx: &mut Transaction,
        user_htlc_key: &SecretKey,
        muun_htlc_pubkey: &PublicKey,
    ) -> Result<()> {
        let secp = Secp256k1::new();
        let user_htlc_pubkey = PublicKey::from_secret_key(&secp, user_htlc_key);
        let witness_script = htlc_witness_script(
            &self.payment_hash,
            &user_htlc_pubkey,
            &self.swap_server_public_key,
            self.expiration_height,
        );
        let htlc_script_pubkey = Address::p2wsh(&witness_script, self.network).script_pubkey();

        let vout = self
            .htlc_tx
            .output
            .iter()
            .position(|output| output.script_pubkey == htlc_script_pubkey)
            .ok_or_else(|| {
                WalletError::unfulfillable("htlc transaction does not pay to the htlc script")
            })?;
        let htlc_value = self.htlc_tx.output[vout].value;

        let input = tx.input.get(index).ok_or_else(|| {
            WalletError::unfulfillable(format!("fulfillment tx has no input {index}"))
        })?;
        let expected_outpoint =
            OutPoint { txid: self.htlc_tx.compute_txid(), vout: vout as u32 };
        if input.previous_output != expected_outpoint {
            return Err(WalletError::unfulfillable(format!(
                "input {index} spends {actual}, expected the htlc outpoint {expected_outpoint}",
                actual = input.previous_output
            )));
        }

        if self.verify_output_amount {
            let collect = u64::try_from(self.collect_sat).map_err(|_| {
                WalletError::unfulfillable("negative collect amount")
            })?;
            let expected_value =
                htlc_value.checked_sub(Amount::from_sat(collect)).ok_or_else(|| {
                    WalletError::unfulfillable("collect amount exceeds the htlc value")
                })?;
            let claim_output = tx.output.first().ok_or_else(|| {
                WalletError::unfulfillable("fulfillment tx has no outputs")
            })?;
            if claim_output.value != expected_value {
                return Err(WalletError::unfulfillable(format!(
                    "fulfillment output pays {actual}, expected {expected_value}",
                    actual = claim_output.value
                )));
            }
        }

        let sighash = SighashCache::new(&*tx)
            .p2wsh_signature_hash(index, &witness_script, htlc_value, EcdsaSighashType::All)
            .map_err(|err| WalletError::encoding(anyhow!("sighash computation failed: {err}")))?;
        let message = Message::from_digest(sighash.to_byte_array());

        let muun_signature = Signature::from_der(self.muun_signature)
            .map_err(|err| WalletError::unfulfillable(format!("malformed muun signature: {err}")))?;
        secp.verify_ecdsa(&message, &muun_signature, muun_htlc_pubkey).map_err(|_| {
            WalletError::unfulfillable("muun signature does not sign the claim sighash")
        })?;

        let user_signature = secp.sign_ecdsa(&message, user_htlc_key);
        let user_element = bitcoin::ecdsa::Signature {
            signature: user_signature,
            sighash_type: EcdsaSighashType::All,
        }
        .to_vec();
        let muun_element = bitcoin::ecdsa::Signature {
            signature: muun_signature,
            sighash_type: EcdsaSighashType::All,
        }
        .to_vec();

        tx.input[index].witness = Witness::from_slice(&[
            self.preimage.as_slice(),
            user_element.as_slice(),
            muun_element.as_slice(),
            witness_script.as_bytes(),
        ]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use bitcoin::hashes::Hash as _;
    use bitcoin::transaction::Version;
    use bitcoin::{Sequence, TxIn, TxOut, absolute};

    const HTLC_VALUE_SAT: u64 = 50_000;
    const COLLECT_SAT: i64 = 1_000;
    const EXPIRATION_HEIGHT: i64 = 800_123;

    struct Fixture {
        user_key: SecretKey,
        user_pub: PublicKey,
        muun_key: SecretKey,
        muun_pub: PublicKey,
        payment_hash: [u8; 32],
        preimage: [u8; 32],
        htlc_tx: Transaction,
        fulfillment_tx: Transaction,
    }

    fn fixture() -> Fixture {
        use sha2::{Digest, Sha256};

        let secp = Secp256k1::new();
        let user_key = SecretKey::from_slice(&[5u8; 32]).unwrap();
        let muun_key = SecretKey::from_slice(&[6u8; 32]).unwrap();
        let user_pub = PublicKey::from_secret_key(&secp, &user_key);
        let muun_pub = PublicKey::from_secret_key(&secp, &muun_key);

        let preimage = [77u8; 32];
        let payment_hash: [u8; 32] = Sha256::digest(preimage).into();

        let witness_script =
            htlc_witness_script(&payment_hash, &user_pub, &muun_pub, EXPIRATION_HEIGHT);
        let htlc_tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: bitcoin::Txid::all_zeros(), vout: 7 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(HTLC_VALUE_SAT),
                script_pubkey: Address::p2wsh(&witness_script, Network::Regtest).script_pubkey(),
            }],
        };

        let fulfillment_tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: htlc_tx.compute_txid(), vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(HTLC_VALUE_SAT - COLLECT_SAT as u64),
                script_pubkey: ScriptBuf::new(),
            }],
        };

        Fixture {
            user_key,
            user_pub,
            muun_key,
            muun_pub,
            payment_hash,
            preimage,
            htlc_tx,
            fulfillment_tx,
        }
    }

    fn server_signature(f: &Fixture) -> Vec<u8> {
        let secp = Secp256k1::new();
        let witness_script = htlc_witness_script(
            &f.payment_hash,
            &f.user_pub,
            &f.muun_pub,
            EXPIRATION_HEIGHT,
        );
        let sighash = SighashCache::new(&f.fulfillment_tx)
            .p2wsh_signature_hash(
                0,
                &witness_script,
                Amount::from_sat(HTLC_VALUE_SAT),
                EcdsaSighashType::All,
            )
            .unwrap();
        let message = Message::from_digest(sighash.to_byte_array());
        secp.sign_ecdsa(&message, &f.muun_key).serialize_der().to_vec()
    }

    fn coin<'a>(f: &'a Fixture, muun_signature: &'a [u8]) -> IncomingSwapCoin<'a> {
        IncomingSwapCoin {
            network: Network::Regtest,
            htlc_tx: &f.htlc_tx,
            payment_hash: f.payment_hash,
            preimage: f.preimage,
            swap_server_public_key: f.muun_pub,
            expiration_height: EXPIRATION_HEIGHT,
            muun_signature,
            verify_output_amount: true,
            collect_sat: COLLECT_SAT,
        }
    }

    #[test]
    fn test_sign_input_builds_the_claim_witness() -> Result<()> {
        let f = fixture();
        let muun_signature = server_signature(&f);
        let mut tx = f.fulfillment_tx.clone();

        coin(&f, &muun_signature).sign_input(0, &mut tx, &f.user_key, &f.muun_pub)?;

        let witness: Vec<_> = tx.input[0].witness.iter().collect();
        assert_eq!(witness.len(), 4);
        assert_eq!(witness[0], f.preimage);
        // Both signature elements carry the SIGHASH_ALL byte.
        assert_eq!(*witness[1].last().unwrap(), EcdsaSighashType::All as u8);
        assert_eq!(witness[2][..witness[2].len() - 1], muun_signature[..]);
        let script = htlc_witness_script(
            &f.payment_hash,
            &f.user_pub,
            &f.muun_pub,
            EXPIRATION_HEIGHT,
        );
        assert_eq!(witness[3], script.as_bytes());

        // The user element signs the same BIP-143 digest the server signed.
        let secp = Secp256k1::new();
        let sighash = SighashCache::new(&f.fulfillment_tx)
            .p2wsh_signature_hash(
                0,
                &script,
                Amount::from_sat(HTLC_VALUE_SAT),
                EcdsaSighashType::All,
            )?;
        let message = Message::from_digest(sighash.to_byte_array());
        let user_sig = Signature::from_der(&witness[1][..witness[1].len() - 1])?;
        secp.verify_ecdsa(&message, &user_sig, &f.user_pub)?;
        Ok(())
    }

    #[test]
    fn test_sign_input_rejects_a_foreign_outpoint() -> Result<()> {
        let f = fixture();
        let muun_signature = server_signature(&f);
        let mut tx = f.fulfillment_tx.clone();
        tx.input[0].previous_output.vout = 1;

        let err = coin(&f, &muun_signature)
            .sign_input(0, &mut tx, &f.user_key, &f.muun_pub)
            .unwrap_err();
        assert!(matches!(err, WalletError::UnfulfillableSwap(_)));
        Ok(())
    }

    #[test]
    fn test_sign_input_rejects_a_short_output() -> Result<()> {
        let f = fixture();
        let muun_signature = server_signature(&f);
        let mut tx = f.fulfillment_tx.clone();
        // Server trying to collect more than agreed.
        tx.output[0].value = Amount::from_sat(HTLC_VALUE_SAT - 2 * COLLECT_SAT as u64);

        let err = coin(&f, &muun_signature)
            .sign_input(0, &mut tx, &f.user_key, &f.muun_pub)
            .unwrap_err();
        assert!(matches!(err, WalletError::UnfulfillableSwap(_)));
        Ok(())
    }

    #[test]
    fn test_sign_input_rejects_an_invalid_muun_signature() -> Result<()> {
        let f = fixture();
        let mut tx = f.fulfillment_tx.clone();

        // Valid DER, wrong key: signed by the user key instead of the server's.
        let secp = Secp256k1::new();
        let script =
            htlc_witness_script(&f.payment_hash, &f.user_pub, &f.muun_pub, EXPIRATION_HEIGHT);
        let sighash = SighashCache::new(&f.fulfillment_tx)
            .p2wsh_signature_hash(
                0,
                &script,
                Amount::from_sat(HTLC_VALUE_SAT),
                EcdsaSighashType::All,
            )?;
        let message = Message::from_digest(sighash.to_byte_array());
        let forged = secp.sign_ecdsa(&message, &f.user_key).serialize_der().to_vec();

        let err = coin(&f, &forged)
            .sign_input(0, &mut tx, &f.user_key, &f.muun_pub)
            .unwrap_err();
        assert!(matches!(err, WalletError::UnfulfillableSwap(_)));

        let err = coin(&f, b"not a signature")
            .sign_input(0, &mut tx, &f.user_key, &f.muun_pub)
            .unwrap_err();
        assert!(matches!(err, WalletError::UnfulfillableSwap(_)));
        Ok(())
    }
}
