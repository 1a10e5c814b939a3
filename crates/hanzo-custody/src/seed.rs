//! Seed derivation from raw private key bytes

use zeroize::{Zeroize, Zeroizing};

use crate::types::SecretBytes;

/// Seed handed to `execute_with_seed` handlers
pub enum Seed<'a> {
    /// The private key bytes are used as the seed as-is
    Raw(&'a [u8]),
    /// A separately allocated seed buffer
    Derived(SecretBytes),
}

impl Seed<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Seed::Raw(bytes) => bytes,
            Seed::Derived(bytes) => bytes.as_slice(),
        }
    }

    /// Wipe a derived buffer. Raw seeds borrow the private key buffer,
    /// which the custodian wipes itself.
    pub fn scrub(&mut self) {
        if let Seed::Derived(bytes) = self {
            bytes.as_mut_slice().zeroize();
        }
    }
}

/// Turns private key bytes into a seed.
pub trait SeedDeriver: Send + Sync {
    fn derive<'a>(&self, private_key: &'a [u8]) -> anyhow::Result<Seed<'a>>;
}

/// Uses the private key bytes directly as the seed
#[derive(Debug, Default, Clone, Copy)]
pub struct RawSeed;

impl SeedDeriver for RawSeed {
    fn derive<'a>(&self, private_key: &'a [u8]) -> anyhow::Result<Seed<'a>> {
        Ok(Seed::Raw(private_key))
    }
}

/// 32-byte seed from BLAKE3 in key derivation mode
#[derive(Debug, Clone)]
pub struct Blake3Seed {
    context: String,
}

impl Blake3Seed {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

impl SeedDeriver for Blake3Seed {
    fn derive<'a>(&self, private_key: &'a [u8]) -> anyhow::Result<Seed<'a>> {
        if private_key.is_empty() {
            anyhow::bail!("cannot derive a seed from an empty key");
        }
        let seed = blake3::derive_key(&self.context, private_key);
        Ok(Seed::Derived(Zeroizing::new(seed.to_vec())))
    }
}
