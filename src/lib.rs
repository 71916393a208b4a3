pub mod errors;
pub mod htlc;
pub mod invoice;
pub mod keys;
pub mod secrets;
pub mod sphinx;
pub mod store;
pub mod swaps;
pub mod wallet;

// Re-export the public surface for easier access
pub use errors::{Result, WalletError};

pub use keys::{
    HTLC_KEY_CHILD, HdPrivateKey, HdPublicKey, IDENTITY_KEY_CHILD, KeyPath, invoice_branch,
    invoice_key_path, parse_invoice_path,
};

pub use store::{InvoiceRecord, InvoiceState, InvoiceStore, SHORT_CHAN_ID_FLAG};

pub use secrets::{
    InvoiceSecret, InvoiceSecretsBundle, MAX_UNUSED_SECRETS, generate_invoice_secrets,
    persist_invoice_secrets,
};

pub use invoice::{
    INVOICE_EXPIRY, InvoiceOptions, MIN_FINAL_CLTV_EXPIRY_DELTA, RouteHints, create_invoice,
};

pub use swaps::{
    IncomingSwap, IncomingSwapFulfillmentData, IncomingSwapFulfillmentResult, IncomingSwapHtlc,
    fulfill, fulfill_full_debt, verify_fulfillable,
};

pub use wallet::Wallet;

// Re-export bitcoin types callers need at the boundary
pub use bitcoin::{self, Network};
