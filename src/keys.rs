//! HD key schema for invoice secrets.
//!
//! Every invoice gets its own derivation subtree under
//! `m/schema:1'/recovery:1'/invoices:4/<l1>/<l2>`, with the two trailing
//! levels drawn uniformly from `[0, 2^31)`. Child 0 of the subtree is the
//! invoice identity key (signs the BOLT-11 invoice, decrypts the Sphinx
//! onion); child 1 is the HTLC key, derived by both the user and the server
//! under their respective roots and combined into the swap HTLC script.
//!
//! Path segments carry an optional `name:` prefix (`schema:1'`) so persisted
//! paths stay self-describing; names are ignored for derivation.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use bitcoin::Network;
use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::errors::{Result, WalletError};

/// Child index of the invoice identity key.
pub const IDENTITY_KEY_CHILD: u32 = 0;
/// Child index of the per-invoice HTLC key.
pub const HTLC_KEY_CHILD: u32 = 1;

const HARDENED_MARKER: char = '\'';

/// One level of a textual derivation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub name: Option<String>,
    pub index: u32,
    pub hardened: bool,
}

impl PathSegment {
    fn child_number(&self) -> Result<ChildNumber> {
        let child = if self.hardened {
            ChildNumber::from_hardened_idx(self.index)
        } else {
            ChildNumber::from_normal_idx(self.index)
        }?;
        Ok(child)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{name}:")?;
        }
        write!(f, "{index}", index = self.index)?;
        if self.hardened {
            write!(f, "{HARDENED_MARKER}")?;
        }
        Ok(())
    }
}

/// An absolute derivation path with optionally named segments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyPath {
    segments: Vec<PathSegment>,
}

impl KeyPath {
    /// The root path `m`.
    pub fn root() -> Self {
        KeyPath::default()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Extends the path with an unnamed non-hardened child.
    pub fn child(&self, index: u32) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment { name: None, index, hardened: false });
        KeyPath { segments }
    }

    /// Extends the path with a named child.
    pub fn named_child(&self, name: &str, index: u32, hardened: bool) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment { name: Some(name.to_string()), index, hardened });
        KeyPath { segments }
    }

    /// Whether `prefix` matches the leading levels of this path. Names are
    /// ignored; only index and hardening count.
    pub fn has_prefix(&self, prefix: &KeyPath) -> bool {
        if prefix.segments.len() > self.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(&prefix.segments)
            .all(|(a, b)| a.index == b.index && a.hardened == b.hardened)
    }

    fn suffix_after(&self, prefix: &KeyPath) -> Result<&[PathSegment]> {
        if !self.has_prefix(prefix) {
            return Err(WalletError::crypto(anyhow!(
                "path {self} is not a descendant of {prefix}"
            )));
        }
        Ok(&self.segments[prefix.segments.len()..])
    }
}

impl FromStr for KeyPath {
    type Err = WalletError;

    fn from_str(path: &str) -> Result<Self> {
        let rest = path
            .strip_prefix('m')
            .ok_or_else(|| WalletError::crypto(anyhow!("derivation path must start with 'm': {path}")))?;
        let mut segments = Vec::new();
        for component in rest.split('/').skip(1) {
            if component.is_empty() {
                return Err(WalletError::crypto(anyhow!("empty component in path {path}")));
            }
            let (component, hardened) = match component.strip_suffix(HARDENED_MARKER) {
                Some(stripped) => (stripped, true),
                None => (component, false),
            };
            let (name, index_str) = match component.split_once(':') {
                Some((name, index)) => (Some(name.to_string()), index),
                None => (None, component),
            };
            let index: u32 = index_str
                .parse()
                .with_context(|| format!("invalid path component {component:?} in {path}"))
                .map_err(WalletError::crypto)?;
            if index >= (1 << 31) {
                return Err(WalletError::crypto(anyhow!(
                    "path index {index} out of range in {path}"
                )));
            }
            segments.push(PathSegment { name, index, hardened });
        }
        Ok(KeyPath { segments })
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Base path shared by all invoice subtrees: `m/schema:1'/recovery:1'/invoices:4`.
pub fn invoice_branch() -> KeyPath {
    KeyPath::root()
        .named_child("schema", 1, true)
        .named_child("recovery", 1, true)
        .named_child("invoices", 4, false)
}

/// Full subtree path for one invoice.
pub fn invoice_key_path(l1: u32, l2: u32) -> KeyPath {
    invoice_branch().child(l1).child(l2)
}

/// Parses a persisted invoice key path, rejecting any hardened child beyond
/// the schema prefix (`m/schema:1'/recovery:1'`).
pub fn parse_invoice_path(path: &str) -> Result<KeyPath> {
    let parsed: KeyPath = path.parse()?;
    for segment in parsed.segments.iter().skip(2) {
        if segment.hardened {
            return Err(WalletError::crypto(anyhow!(
                "invoice path {path} has a hardened child beyond the schema prefix"
            )));
        }
    }
    Ok(parsed)
}

/// An extended private key annotated with its absolute derivation path.
///
/// Derivation targets are absolute paths; the key derives the remainder
/// relative to its own position, so callers may hand in the master key or
/// any ancestor of the invoice branch.
#[derive(Debug, Clone)]
pub struct HdPrivateKey {
    xpriv: Xpriv,
    path: KeyPath,
}

impl HdPrivateKey {
    pub fn new(xpriv: Xpriv, path: KeyPath) -> Self {
        HdPrivateKey { xpriv, path }
    }

    /// Builds a master key from seed entropy, positioned at `m`.
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self> {
        let xpriv = Xpriv::new_master(network, seed)?;
        Ok(HdPrivateKey { xpriv, path: KeyPath::root() })
    }

    pub fn path(&self) -> &KeyPath {
        &self.path
    }

    pub fn secret_key(&self) -> SecretKey {
        self.xpriv.private_key
    }

    /// Derives the key at `target`, which must be a descendant of this key's
    /// own path.
    pub fn derive_to(&self, target: &KeyPath) -> Result<HdPrivateKey> {
        let secp = Secp256k1::new();
        let mut xpriv = self.xpriv;
        for segment in target.suffix_after(&self.path)? {
            xpriv = xpriv.derive_priv(&secp, &[segment.child_number()?])?;
        }
        Ok(HdPrivateKey { xpriv, path: target.clone() })
    }

    pub fn derive_child(&self, index: u32) -> Result<HdPrivateKey> {
        self.derive_to(&self.path.child(index))
    }

    pub fn public(&self) -> HdPublicKey {
        let secp = Secp256k1::new();
        HdPublicKey { xpub: Xpub::from_priv(&secp, &self.xpriv), path: self.path.clone() }
    }
}

/// An extended public key annotated with its absolute derivation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdPublicKey {
    xpub: Xpub,
    path: KeyPath,
}

impl HdPublicKey {
    pub fn new(xpub: Xpub, path: KeyPath) -> Self {
        HdPublicKey { xpub, path }
    }

    pub fn path(&self) -> &KeyPath {
        &self.path
    }

    pub fn public_key(&self) -> PublicKey {
        self.xpub.public_key
    }

    /// Compressed SEC1 bytes of the key.
    pub fn raw(&self) -> [u8; 33] {
        self.xpub.public_key.serialize()
    }

    /// Derives the key at `target`. Public derivation cannot cross hardened
    /// levels, so every remaining segment must be non-hardened.
    pub fn derive_to(&self, target: &KeyPath) -> Result<HdPublicKey> {
        let secp = Secp256k1::new();
        let mut xpub = self.xpub;
        for segment in target.suffix_after(&self.path)? {
            if segment.hardened {
                return Err(WalletError::crypto(anyhow!(
                    "cannot publicly derive hardened child {segment} towards {target}"
                )));
            }
            xpub = xpub.derive_pub(&secp, &[segment.child_number()?])?;
        }
        Ok(HdPublicKey { xpub, path: target.clone() })
    }

    pub fn derive_child(&self, index: u32) -> Result<HdPublicKey> {
        self.derive_to(&self.path.child(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_path_round_trip() -> Result<()> {
        let path = invoice_key_path(123, 456);
        assert_eq!(path.to_string(), "m/schema:1'/recovery:1'/invoices:4/123/456");

        let reparsed: KeyPath = path.to_string().parse()?;
        assert_eq!(reparsed, path);
        Ok(())
    }

    #[test]
    fn test_path_prefix_ignores_names() -> Result<()> {
        let named = invoice_key_path(7, 9);
        let bare: KeyPath = "m/1'/1'/4".parse()?;
        assert!(named.has_prefix(&bare));
        assert!(!bare.has_prefix(&named));
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("n/1/2".parse::<KeyPath>().is_err());
        assert!("m//1".parse::<KeyPath>().is_err());
        assert!("m/xyz".parse::<KeyPath>().is_err());
        assert!("m/2147483648".parse::<KeyPath>().is_err());
    }

    #[test]
    fn test_invoice_path_rejects_deep_hardened_children() -> Result<()> {
        parse_invoice_path("m/schema:1'/recovery:1'/invoices:4/5/1")?;
        assert!(parse_invoice_path("m/schema:1'/recovery:1'/invoices:4/5'/1").is_err());
        assert!(parse_invoice_path("m/schema:1'/recovery:1'/invoices:4'/5/1").is_err());
        Ok(())
    }

    #[test]
    fn test_private_and_public_derivation_agree() -> Result<()> {
        let root = HdPrivateKey::from_seed(&[42u8; 32], Network::Regtest)?;
        let base = root.derive_to(&invoice_branch())?;
        let target = invoice_key_path(1000, 2000).child(IDENTITY_KEY_CHILD);

        let via_priv = base.derive_to(&target)?.public();
        let via_pub = base.public().derive_to(&target)?;
        assert_eq!(via_priv.raw(), via_pub.raw());
        assert_eq!(via_pub.path().to_string(), target.to_string());
        Ok(())
    }

    #[test]
    fn test_public_derivation_rejects_hardened() -> Result<()> {
        let root = HdPrivateKey::from_seed(&[42u8; 32], Network::Regtest)?;
        let target = invoice_branch();
        assert!(root.derive_to(&target).is_ok());
        assert!(root.public().derive_to(&target).is_err());
        Ok(())
    }

    #[test]
    fn test_derive_to_rejects_non_descendant() -> Result<()> {
        let root = HdPrivateKey::from_seed(&[42u8; 32], Network::Regtest)?;
        let base = root.derive_to(&invoice_branch())?;
        assert!(base.derive_to(&"m/0/1".parse::<KeyPath>()?).is_err());
        Ok(())
    }
}
