//! At-rest XOR cipher.
//!
//! A reversible keyed XOR stream — a teaching mechanism, not a security
//! primitive. Applying it twice with the same key restores the original
//! bytes, and "passphrase is non-empty" is the only discriminator between
//! plaintext and ciphertext on disk.

/// XOR `buf` in place with `key` as a repeating byte stream.
///
/// An empty key leaves the buffer untouched.
pub fn xor_cipher(buf: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % key.len()];
    }
}
