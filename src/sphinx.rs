//! Destination-side validation of the Sphinx onion packet.
//!
//! The wallet is always the final hop: it peels exactly one layer. The
//! shared secret comes from ECDH between the packet's ephemeral key and the
//! per-invoice identity key, the packet HMAC is keyed with `mu` and covers
//! the routing blob plus the payment hash (associated data), and the routing
//! blob itself is deobfuscated with a ChaCha20 stream keyed with `rho`.
//! The final-hop TLV payload must carry our payment secret and may not
//! declare more msat than the payment actually delivers.

use anyhow::anyhow;
use bitcoin::secp256k1::ecdh::SharedSecret;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::{Result, WalletError};

type HmacSha256 = Hmac<Sha256>;

const VERSION: u8 = 0;
const ROUTING_INFO_LEN: usize = 1300;
/// version (1) ‖ ephemeral key (33) ‖ routing info (1300) ‖ hmac (32)
pub const ONION_PACKET_LEN: usize = 1 + 33 + ROUTING_INFO_LEN + 32;

const AMT_TO_FORWARD_TYPE: usize = 2;
const PAYMENT_DATA_TYPE: usize = 8;

/// Validates an onion packet addressed to the invoice identity key.
///
/// `amount_msat` is the amount the payment actually delivers; the onion
/// failing any check makes the swap unfulfillable.
pub fn validate(
    sphinx_packet: &[u8],
    payment_hash: &[u8; 32],
    payment_secret: &[u8; 32],
    node_key: &SecretKey,
    amount_msat: u64,
) -> Result<()> {
    let packet: &[u8; ONION_PACKET_LEN] = sphinx_packet.try_into().map_err(|_| {
        WalletError::unfulfillable(format!(
            "onion packet must be {ONION_PACKET_LEN} bytes, got {len}",
            len = sphinx_packet.len()
        ))
    })?;
    if packet[0] != VERSION {
        return Err(WalletError::unfulfillable(format!(
            "unknown onion version {version}",
            version = packet[0]
        )));
    }
    let ephemeral_key = PublicKey::from_slice(&packet[1..34])
        .map_err(|err| WalletError::unfulfillable(format!("bad onion ephemeral key: {err}")))?;
    let routing_info = &packet[34..34 + ROUTING_INFO_LEN];
    let packet_hmac = &packet[34 + ROUTING_INFO_LEN..];

    let shared_secret = SharedSecret::new(&ephemeral_key, node_key).secret_bytes();

    // Authenticity first: nothing in the routing blob is trusted before the
    // mu-keyed HMAC (with the payment hash as associated data) checks out.
    let mu = generate_key(b"mu", &shared_secret)?;
    let mut mac = HmacSha256::new_from_slice(&mu).map_err(|err| WalletError::crypto(anyhow!(err)))?;
    mac.update(routing_info);
    mac.update(payment_hash);
    mac.verify_slice(packet_hmac)
        .map_err(|_| WalletError::unfulfillable("onion hmac does not match"))?;

    let rho = generate_key(b"rho", &shared_secret)?;
    let mut hop_data = routing_info.to_vec();
    let mut cipher = ChaCha20::new(&rho.into(), &[0u8; 12].into());
    cipher.apply_keystream(&mut hop_data);

    let (payload_len, consumed) = read_bigsize(&hop_data)?;
    if payload_len < 2 {
        // 0 and 1 are the legacy fixed-size payload markers.
        return Err(WalletError::unfulfillable("legacy onion payload not supported"));
    }
    let payload_end = consumed
        .checked_add(payload_len)
        .filter(|end| *end <= hop_data.len() - 32)
        .ok_or_else(|| WalletError::unfulfillable("onion payload overruns the packet"))?;
    let payload = &hop_data[consumed..payload_end];
    let next_hmac = &hop_data[payload_end..payload_end + 32];
    if next_hmac.iter().any(|&byte| byte != 0) {
        return Err(WalletError::unfulfillable("onion is not addressed to the final hop"));
    }

    let hop = parse_final_hop_payload(payload)?;
    let Some((secret, total_msat)) = hop.payment_data else {
        return Err(WalletError::unfulfillable("final hop payload has no payment data"));
    };
    if &secret != payment_secret {
        return Err(WalletError::unfulfillable("onion payment secret does not match invoice"));
    }

    // The onion may declare less than the payment delivers (the asymmetry
    // that lets payers overpay) but never more.
    let declared = total_msat.max(hop.amt_to_forward.unwrap_or(0));
    if amount_msat < declared {
        return Err(WalletError::unfulfillable(format!(
            "onion declares {declared} msat but payment delivers {amount_msat} msat"
        )));
    }
    Ok(())
}

struct FinalHopPayload {
    amt_to_forward: Option<u64>,
    payment_data: Option<([u8; 32], u64)>,
}

fn parse_final_hop_payload(payload: &[u8]) -> Result<FinalHopPayload> {
    let mut hop = FinalHopPayload { amt_to_forward: None, payment_data: None };
    let mut offset = 0;
    while offset < payload.len() {
        let (record_type, consumed) = read_bigsize(&payload[offset..])?;
        offset += consumed;
        let (length, consumed) = read_bigsize(&payload[offset..])?;
        offset += consumed;
        let value = offset
            .checked_add(length)
            .and_then(|end| payload.get(offset..end))
            .ok_or_else(|| WalletError::unfulfillable("onion tlv record overruns the payload"))?;
        offset += length;

        match record_type {
            AMT_TO_FORWARD_TYPE => hop.amt_to_forward = Some(read_truncated_u64(value)?),
            PAYMENT_DATA_TYPE => {
                if value.len() < 32 {
                    return Err(WalletError::unfulfillable("onion payment data is too short"));
                }
                let mut secret = [0u8; 32];
                secret.copy_from_slice(&value[..32]);
                let total_msat = read_truncated_u64(&value[32..])?;
                hop.payment_data = Some((secret, total_msat));
            }
            _ => {}
        }
    }
    Ok(hop)
}

/// BOLT-4 per-packet key: HMAC-SHA256 keyed by the ASCII key type over the
/// shared secret.
fn generate_key(key_type: &[u8], shared_secret: &[u8; 32]) -> Result<[u8; 32]> {
    let mut mac =
        HmacSha256::new_from_slice(key_type).map_err(|err| WalletError::crypto(anyhow!(err)))?;
    mac.update(shared_secret);
    Ok(mac.finalize().into_bytes().into())
}

fn read_bigsize(data: &[u8]) -> Result<(usize, usize)> {
    let truncated = || WalletError::unfulfillable("truncated onion varint");
    let first = *data.first().ok_or_else(truncated)?;
    match first {
        0xFD => {
            let bytes: [u8; 2] = data.get(1..3).ok_or_else(truncated)?.try_into().unwrap();
            Ok((u16::from_be_bytes(bytes) as usize, 3))
        }
        0xFE => {
            let bytes: [u8; 4] = data.get(1..5).ok_or_else(truncated)?.try_into().unwrap();
            Ok((u32::from_be_bytes(bytes) as usize, 5))
        }
        0xFF => {
            let bytes: [u8; 8] = data.get(1..9).ok_or_else(truncated)?.try_into().unwrap();
            let value = u64::from_be_bytes(bytes);
            let value = usize::try_from(value)
                .map_err(|_| WalletError::unfulfillable("onion varint out of range"))?;
            Ok((value, 9))
        }
        byte => Ok((byte as usize, 1)),
    }
}

/// Truncated big-endian integer: up to 8 bytes, high zero bytes omitted.
fn read_truncated_u64(value: &[u8]) -> Result<u64> {
    if value.len() > 8 {
        return Err(WalletError::unfulfillable("onion integer wider than 8 bytes"));
    }
    let mut bytes = [0u8; 8];
    bytes[8 - value.len()..].copy_from_slice(value);
    Ok(u64::from_be_bytes(bytes))
}
