//! CPU-bound handler for load testing

use microman_worker::{HandlerContext, HandlerError, HandlerResult};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha512;

use super::validate_len;

const ROUNDS: u32 = 10_000;
const KEY_LEN: usize = 512;
const SALT_LEN: usize = 10;

#[derive(Debug, Deserialize)]
struct HeavyRequest {
    password: String,
}

/// PBKDF2-HMAC-SHA512 of `password`, `KEY_LEN` bytes
pub fn derive_key(password: &[u8], salt: &[u8], rounds: u32) -> Vec<u8> {
    let mut key = vec![0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, rounds, &mut key);
    key
}

pub async fn heavy(ctx: HandlerContext) -> HandlerResult {
    let request: HeavyRequest = ctx.payload_as()?;
    let password = validate_len("password", request.password.trim(), 8, 128)?.to_string();
    let salt = hex::encode(&uuid::Uuid::new_v4().as_bytes()[..SALT_LEN]);

    let salt_for_task = salt.clone();
    let encrypted = tokio::task::spawn_blocking(move || {
        derive_key(password.as_bytes(), salt_for_task.as_bytes(), ROUNDS)
    })
    .await
    .map_err(|e| HandlerError::msg(e.to_string()))?;

    ctx.reply(
        "heavy",
        json!({ "encrypted": hex::encode(encrypted), "salt": salt }),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key(b"abcd1234", b"salt", 10);
        let b = derive_key(b"abcd1234", b"salt", 10);
        let c = derive_key(b"abcd1234", b"pepper", 10);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), KEY_LEN);
    }

    #[test]
    fn test_derive_key_matches_pbkdf2_vector() {
        // Published PBKDF2-HMAC-SHA512 vector, first block prefix
        let key = derive_key(b"password", b"salt", 1);
        assert_eq!(hex::encode(&key[..16]), "867f70cf1ade02cff3752599a3a53dc4");
    }
}
