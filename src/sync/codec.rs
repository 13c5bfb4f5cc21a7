//! Token codec: AES-256-CBC encryption of short strings into URL-safe tokens.
//!
//! Wire format (must match every peer byte-for-byte):
//! - key = first 32 ASCII bytes of `sha256hex(md5hex(secret))`
//! - iv  = first 16 ASCII bytes of `sha256hex(md5hex(user_agent + client_ip))`
//! - ciphertext is base64-encoded once by the cipher layer, then that text is
//!   base64-encoded again with the `+/=` → `-_,` substitution
//! - the result is wrapped with a separator every [`WRAP_WIDTH`] characters
//!
//! The IV binds a token to the client identity that minted it. Decrypting with a
//! different identity produces garbage or a padding error, never the plaintext.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::Md5;
use sha2::{Digest, Sha256};

use super::error::CodecError;
use super::identity::ClientIdentity;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Column at which encoded tokens are cut.
pub const WRAP_WIDTH: usize = 250;

/// Default separator inserted by the wrap.
pub const WRAP_SEPARATOR: char = '/';

/// AES-256 key length in bytes.
const KEY_LEN: usize = 32;

/// CBC IV length in bytes.
const IV_LEN: usize = 16;

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Derive the AES key from a shared secret.
fn derive_key(secret: &str) -> [u8; KEY_LEN] {
    let digest = sha256_hex(&md5_hex(secret));
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest.as_bytes()[..KEY_LEN]);
    key
}

/// Derive the IV from the client identity (user-agent immediately followed by IP).
fn derive_iv(identity: &ClientIdentity) -> [u8; IV_LEN] {
    let seed = format!("{}{}", identity.user_agent, identity.ip);
    let digest = sha256_hex(&md5_hex(&seed));
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest.as_bytes()[..IV_LEN]);
    iv
}

/// Standard base64 with `+/=` mapped to `-_,`.
pub fn base64_url_encode(input: &[u8]) -> String {
    STANDARD
        .encode(input)
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            '=' => ',',
            other => other,
        })
        .collect()
}

/// Inverse of [`base64_url_encode`].
pub fn base64_url_decode(input: &str) -> Result<Vec<u8>, CodecError> {
    let restored: String = input
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            ',' => '=',
            other => other,
        })
        .collect();
    STANDARD
        .decode(restored.as_bytes())
        .map_err(|e| CodecError::Decode(format!("base64: {e}")))
}

/// Insert `separator` every `width` characters, cutting exactly at the boundary.
pub fn wrap(input: &str, width: usize, separator: char) -> String {
    if width == 0 {
        return input.to_string();
    }
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + input.len() / width);
    for (i, chunk) in chars.chunks(width).enumerate() {
        if i > 0 {
            out.push(separator);
        }
        out.extend(chunk.iter());
    }
    out
}

/// Remove every occurrence of `separator`.
pub fn unwrap(input: &str, separator: char) -> String {
    input.chars().filter(|c| *c != separator).collect()
}

/// Encrypt `plaintext` into an unwrapped URL-safe token.
pub fn encrypt_str(
    plaintext: &str,
    secret: &str,
    identity: &ClientIdentity,
) -> Result<String, CodecError> {
    if secret.is_empty() {
        return Err(CodecError::EmptySecret);
    }
    let key = derive_key(secret);
    let iv = derive_iv(identity);

    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| CodecError::Cipher(format!("cipher init failed: {e}")))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    // The cipher layer emits base64 text; the transport layer encodes that text again.
    let cipher_text = STANDARD.encode(ciphertext);
    Ok(base64_url_encode(cipher_text.as_bytes()))
}

/// Decrypt an unwrapped URL-safe token.
pub fn decrypt_str(
    token: &str,
    secret: &str,
    identity: &ClientIdentity,
) -> Result<String, CodecError> {
    let key = derive_key(secret);
    let iv = derive_iv(identity);

    let cipher_text = base64_url_decode(token.trim())?;
    let ciphertext = STANDARD
        .decode(&cipher_text)
        .map_err(|e| CodecError::Decode(format!("cipher text: {e}")))?;

    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| CodecError::Cipher(format!("cipher init failed: {e}")))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CodecError::Decode("padding mismatch".into()))?;

    String::from_utf8(plaintext).map_err(|_| CodecError::Decode("plaintext is not UTF-8".into()))
}

/// Encrypt and wrap with the default width and separator.
pub fn encrypt(
    plaintext: &str,
    secret: &str,
    identity: &ClientIdentity,
) -> Result<String, CodecError> {
    let token = encrypt_str(plaintext, secret, identity)?;
    Ok(wrap(&token, WRAP_WIDTH, WRAP_SEPARATOR))
}

/// Strip the wrap separator and decrypt.
pub fn decrypt(
    token: &str,
    secret: &str,
    identity: &ClientIdentity,
) -> Result<String, CodecError> {
    decrypt_str(&unwrap(token, WRAP_SEPARATOR), secret, identity)
}
