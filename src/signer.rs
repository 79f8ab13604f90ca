//! Signer capability.
//!
//! The engine never signs anything itself. File finalization hands the last
//! chain hash to a [`Signer`] and stores whatever comes back.

use crate::error::Result;
use std::fmt::Debug;

/// Length of a signer identity.
pub const IDENTITY_LEN: usize = 20;

/// Identity used by streams without a signer.
pub const NO_IDENTITY: [u8; IDENTITY_LEN] = [0u8; IDENTITY_LEN];

/// Produces signatures over finalized files.
///
/// # Example
///
/// ```rust
/// use hsd::Signer;
///
/// #[derive(Debug)]
/// struct Fixed;
///
/// impl Signer for Fixed {
///     fn sign(&self, message: &[u8]) -> hsd::Result<Vec<u8>> {
///         let mut sig = vec![0xAB; 64];
///         sig.extend_from_slice(message);
///         Ok(sig)
///     }
///
///     fn identity(&self) -> [u8; 20] {
///         [7; 20]
///     }
///
///     fn algorithm(&self) -> &str {
///         "fixed"
///     }
/// }
/// ```
pub trait Signer: Send + Sync + Debug {
    /// Signs `message` (the file's last chain hash).
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// 20-byte signer identity. Its digest is the stream's genesis hash.
    fn identity(&self) -> [u8; IDENTITY_LEN];

    /// Algorithm tag stored in the manifest.
    fn algorithm(&self) -> &str;
}
