//! AES-256-CBC with PKCS#7 padding.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::{ContentError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// The only cipher the codec speaks.
pub const AES_256_CBC: &str = "aes-256-cbc";

/// Key length in bytes.
pub const KEY_LEN: usize = 32;

/// IV length in bytes.
pub const IV_LEN: usize = 16;

/// Encrypt `plaintext` under the given key and iv.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt `ciphertext`. Fails on a length that is not a whole number of
/// blocks or on bad padding.
pub fn decrypt(ciphertext: &[u8], key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(ContentError::Cipher(
            "ciphertext is not a multiple of the block size".to_string(),
        ));
    }
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ContentError::Cipher("invalid padding".to_string()))
}

/// Decode the hex key and iv carried by a `Decipher` transform.
pub fn decode_key_iv(key_hex: &str, iv_hex: &str) -> Result<([u8; KEY_LEN], [u8; IV_LEN])> {
    let key = hex::decode(key_hex).map_err(|_| ContentError::Cipher("invalid key hex".to_string()))?;
    let iv = hex::decode(iv_hex).map_err(|_| ContentError::Cipher("invalid iv hex".to_string()))?;
    let key: [u8; KEY_LEN] = key
        .try_into()
        .map_err(|_| ContentError::Cipher(format!("key must be {KEY_LEN} bytes")))?;
    let iv: [u8; IV_LEN] = iv
        .try_into()
        .map_err(|_| ContentError::Cipher(format!("iv must be {IV_LEN} bytes")))?;
    Ok((key, iv))
}
