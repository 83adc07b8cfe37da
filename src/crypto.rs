use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use md5::{Digest, Md5};

use crate::error::QueryError;

const BLOCK: usize = 16;

/// Auth key for the token endpoint: md5 over the shared secret followed by
/// the Unix timestamp in seconds.
pub fn auth_key(secret: &str, timestamp: u64) -> String {
    let digest = Md5::digest(format!("{}{}", secret, timestamp).as_bytes());
    format!("{:x}", digest)
}

/// AES-ECB encrypt with byte-value padding to the next 16-byte boundary,
/// returning the base64 ciphertext. The key is the challenge's secret key
/// and must be 16, 24 or 32 bytes.
pub fn aes_ecb_encrypt(plaintext: &[u8], key: &str) -> Result<String, QueryError> {
    let mut buf = plaintext.to_vec();
    let pad = BLOCK - (buf.len() % BLOCK);
    buf.extend(std::iter::repeat(pad as u8).take(pad));

    each_block(key, &mut buf, true)?;
    Ok(BASE64.encode(buf))
}

/// Inverse of `aes_ecb_encrypt`; used by tests to prove the round trip.
pub fn aes_ecb_decrypt(ciphertext_b64: &str, key: &str) -> Result<Vec<u8>, QueryError> {
    let mut buf = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| QueryError::Crypto(format!("bad base64: {}", e)))?;
    if buf.is_empty() || buf.len() % BLOCK != 0 {
        return Err(QueryError::Crypto("ciphertext not block aligned".into()));
    }

    each_block(key, &mut buf, false)?;

    let pad = *buf.last().unwrap() as usize;
    if pad == 0 || pad > BLOCK || pad > buf.len() {
        return Err(QueryError::Crypto("bad padding".into()));
    }
    buf.truncate(buf.len() - pad);
    Ok(buf)
}

fn each_block(key: &str, buf: &mut [u8], encrypt: bool) -> Result<(), QueryError> {
    macro_rules! run {
        ($cipher:ty) => {{
            let cipher = <$cipher>::new_from_slice(key.as_bytes())
                .map_err(|_| QueryError::Crypto("bad key length".into()))?;
            for chunk in buf.chunks_mut(BLOCK) {
                let block = GenericArray::from_mut_slice(chunk);
                if encrypt {
                    cipher.encrypt_block(block);
                } else {
                    cipher.decrypt_block(block);
                }
            }
        }};
    }
    match key.len() {
        16 => run!(Aes128),
        24 => run!(Aes192),
        32 => run!(Aes256),
        n => return Err(QueryError::Crypto(format!("unsupported key length {}", n))),
    }
    Ok(())
}
