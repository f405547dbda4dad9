//! Crypto Unit (§4.B): field- and whole-body encryption used by the Per-API
//! Pipeline's encryption stages.
//!
//! Grounded in `executor.py`'s `encrypt_gcm`/`encrypt_cbc`/`encrypt_base64`/
//! `encrypt_md5` helpers. Two details are load-bearing for wire compatibility
//! with the rest of the platform and must not be "fixed":
//!
//! - AES-GCM uses a **fixed all-zero 12-byte nonce**, not a random one. This
//!   only holds because each key is meant to be single-use / rotated
//!   out-of-band by the platform; it is not a general-purpose AEAD scheme.
//! - The AES key is normalized by padding with zero bytes up to the nearest
//!   of 16/24/32, or truncating to 32 if longer — never rejected for being
//!   the "wrong" length.

use aes::{Aes192, Aes256};
use aes_gcm::aead::{generic_array::typenum::U12, Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, AesGcm, Aes256Gcm, Nonce};

type Aes192Gcm = AesGcm<Aes192, U12>;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rand::RngCore;
use serde_json::{json, Value};

use crate::errors::EngineError;
use crate::model::{BodyEncRule, EncryptionAlgorithm};

const GCM_NONCE: [u8; 12] = [0u8; 12];

/// Pads with `0x00` up to the nearest of 16/24/32 bytes, or truncates to 32 if
/// longer, matching `key.ljust(klen, b'\x00')` in the source platform.
fn normalize_key(key: &[u8]) -> Vec<u8> {
    let target = if key.len() <= 16 {
        16
    } else if key.len() <= 24 {
        24
    } else {
        32
    };
    let mut out = key.to_vec();
    if out.len() < target {
        out.resize(target, 0u8);
    } else {
        out.truncate(target);
    }
    out
}

/// AES-GCM encrypt with the fixed zero nonce; returns base64(ciphertext||tag).
pub fn aes_gcm_encrypt(key: &[u8], plaintext: &[u8]) -> Result<String, EngineError> {
    let key = normalize_key(key);
    let nonce = Nonce::from_slice(&GCM_NONCE);
    let payload = Payload {
        msg: plaintext,
        aad: &[],
    };
    let ct = match key.len() {
        16 => Aes128Gcm::new_from_slice(&key)
            .map_err(|e| EngineError::config(format!("bad AES-128 key: {e}")))?
            .encrypt(nonce, payload)
            .map_err(|e| EngineError::config(format!("AES-GCM encrypt failed: {e}")))?,
        24 => Aes192Gcm::new_from_slice(&key)
            .map_err(|e| EngineError::config(format!("bad AES-192 key: {e}")))?
            .encrypt(nonce, payload)
            .map_err(|e| EngineError::config(format!("AES-GCM encrypt failed: {e}")))?,
        _ => Aes256Gcm::new_from_slice(&key)
            .map_err(|e| EngineError::config(format!("bad AES-256 key: {e}")))?
            .encrypt(nonce, payload)
            .map_err(|e| EngineError::config(format!("AES-GCM encrypt failed: {e}")))?,
    };
    Ok(BASE64.encode(ct))
}

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// AES-CBC encrypt with a random 16-byte IV and PKCS7 padding. Output is a
/// JSON object `{"iv": base64, "data": base64}` since CBC mode needs the IV
/// transmitted alongside the ciphertext.
pub fn aes_cbc_encrypt(key: &[u8], plaintext: &[u8]) -> Result<Value, EngineError> {
    let mut key32 = normalize_key(key);
    key32.resize(32, 0);
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    let enc = Aes256CbcEnc::new_from_slices(&key32, &iv)
        .map_err(|e| EngineError::config(format!("bad AES-CBC key/iv: {e}")))?;
    let ct = enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    Ok(json!({ "iv": BASE64.encode(iv), "data": BASE64.encode(ct) }))
}

type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut key32 = normalize_key(key);
    key32.resize(32, 0);
    let dec = Aes256CbcDec::new_from_slices(&key32, iv)
        .map_err(|e| EngineError::config(format!("bad AES-CBC key/iv: {e}")))?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| EngineError::config(format!("AES-CBC decrypt failed: {e}")))
}

pub fn base64_encode(plaintext: &[u8]) -> String {
    BASE64.encode(plaintext)
}

pub fn md5_hex(plaintext: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(plaintext);
    format!("{:x}", hasher.finalize())
}

/// Applies one named algorithm to a string payload, used by both field-level
/// and whole-body encryption stages.
pub fn apply_algorithm(
    algorithm: EncryptionAlgorithm,
    key: &str,
    plaintext: &str,
) -> Result<Value, EngineError> {
    match algorithm {
        EncryptionAlgorithm::AesGcm | EncryptionAlgorithm::Aes => {
            Ok(Value::String(aes_gcm_encrypt(key.as_bytes(), plaintext.as_bytes())?))
        }
        EncryptionAlgorithm::Base64 => Ok(Value::String(base64_encode(plaintext.as_bytes()))),
        EncryptionAlgorithm::Md5 => Ok(Value::String(md5_hex(plaintext.as_bytes()))),
    }
}

/// Field-level body encryption (pipeline stage 4, §4.B `apply_body_enc_rules`).
///
/// Each rule's `ssrc` is first substituted through the variable store (so a
/// rule can name either a literal body field or a `{{var}}` template that
/// resolves to one). The resulting name is then looked up, in order, in the
/// variable store and the body map; `json_dumps` controls whether that
/// lookup's *value* is JSON-serialized before encryption, versus the literal
/// name itself. A name that isn't found anywhere, and isn't valid JSON on its
/// own, is serialized as a JSON string. Field-level rules always encrypt with
/// AES-GCM, independent of the API's whole-body `encryption_algorithm` (which
/// this stage supersedes — see §4.H stage 4 vs stage 5).
///
/// A non-object `body` gets a fresh empty object, per §4.B: "Non-map `body`
/// causes the rule list to operate over a fresh empty map."
/// Rules missing `field` or `ssrc` are skipped with a warning.
/// Returns the list of field names that were written, for `TestResult` logging.
pub fn apply_body_enc_rules(
    body: &mut Value,
    rules: &[BodyEncRule],
    default_key: &str,
    vars: &crate::variables::VariableStore,
) -> Result<Vec<String>, EngineError> {
    let mut encrypted_fields = Vec::new();
    if rules.is_empty() {
        return Ok(encrypted_fields);
    }
    if !body.is_object() {
        *body = json!({});
    }
    let snapshot = body.as_object().cloned().unwrap_or_default();
    let obj = body.as_object_mut().expect("just normalized to an object");

    for rule in rules {
        if rule.field.is_empty() || rule.ssrc.is_empty() {
            tracing::warn!(field = %rule.field, ssrc = %rule.ssrc, "body_enc_rule missing field or ssrc, skipping");
            continue;
        }
        let src_name = vars.substitute(&rule.ssrc);
        let source_text = if rule.json_dumps {
            if let Some(v) = vars.get(&src_name) {
                serde_json::to_string(v).unwrap_or_default()
            } else if let Some(v) = snapshot.get(&src_name) {
                serde_json::to_string(v).unwrap_or_default()
            } else if serde_json::from_str::<Value>(&src_name).is_ok() {
                src_name.clone()
            } else {
                serde_json::to_string(&src_name).unwrap_or_default()
            }
        } else {
            src_name.clone()
        };
        let key = rule.raw.as_deref().unwrap_or(default_key);
        let encrypted = aes_gcm_encrypt(key.as_bytes(), source_text.as_bytes())?;
        obj.insert(rule.field.clone(), Value::String(encrypted));
        encrypted_fields.push(rule.field.clone());
    }
    Ok(encrypted_fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalization_rounds_up_to_valid_aes_size() {
        assert_eq!(normalize_key(b"short").len(), 16);
        assert_eq!(normalize_key(&[0u8; 20]).len(), 24);
        assert_eq!(normalize_key(&[0u8; 40]).len(), 32);
        assert_eq!(normalize_key(&[0u8; 16]).len(), 16);
    }

    #[test]
    fn gcm_encrypt_is_deterministic_for_fixed_nonce() {
        let a = aes_gcm_encrypt(b"mykey1234567890", b"hello").unwrap();
        let b = aes_gcm_encrypt(b"mykey1234567890", b"hello").unwrap();
        assert_eq!(a, b, "fixed zero nonce must make encryption deterministic");
    }

    #[test]
    fn gcm_ciphertext_length_invariant() {
        let ct = aes_gcm_encrypt(b"0123456789abcdef", b"hello world").unwrap();
        let decoded = BASE64.decode(ct).unwrap();
        assert_eq!(decoded.len(), "hello world".len() + 16);
    }

    #[test]
    fn cbc_round_trips_with_its_own_iv() {
        let key = b"some-cbc-key";
        let plaintext = b"round trip me";
        let encrypted = aes_cbc_encrypt(key, plaintext).unwrap();
        let iv = BASE64.decode(encrypted["iv"].as_str().unwrap()).unwrap();
        let ct = BASE64.decode(encrypted["data"].as_str().unwrap()).unwrap();
        let decrypted = aes_cbc_decrypt(key, &iv, &ct).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn md5_matches_known_vector() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn base64_roundtrips() {
        assert_eq!(base64_encode(b"abc"), "YWJj");
    }
}
