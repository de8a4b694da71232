//! Block cipher interface used by the Channel Sounding DRBG.
//!
//! The DRBG only needs single-block AES-128 encryption. Controllers usually have a hardware AES
//! engine for that, so the cipher is plugged in through the [`BlockCipher`] trait instead of being
//! implemented here.
//!
//! With the **`aes`** Cargo feature, [`Aes128Cipher`] provides a software implementation backed by
//! the RustCrypto [`aes`] crate.
//!
//! [`BlockCipher`]: trait.BlockCipher.html
//! [`Aes128Cipher`]: struct.Aes128Cipher.html
//! [`aes`]: https://docs.rs/aes

#[cfg(any(feature = "aes", test))]
mod rustcrypto;

#[cfg(any(feature = "aes", test))]
pub use self::rustcrypto::Aes128Cipher;

/// Trait for AES-128 block encryption providers.
pub trait BlockCipher {
    /// Encrypts `block` in place under `key`.
    ///
    /// Both `key` and `block` are passed in the byte order the DRBG keeps them in. Implementations
    /// backed by engines expecting the opposite byte order must reverse them.
    fn encrypt_block(&self, key: &[u8; 16], block: &mut [u8; 16]);
}

impl<'a, C: BlockCipher + ?Sized> BlockCipher for &'a C {
    fn encrypt_block(&self, key: &[u8; 16], block: &mut [u8; 16]) {
        (**self).encrypt_block(key, block)
    }
}
