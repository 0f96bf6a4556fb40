//! Setup codes, MQTT credential secrets and password hashing. Plaintext is
//! generated once, handed back to the caller, and only the argon2 hash is
//! stored; verification never learns more than pass/fail.

use anyhow::{Result, anyhow};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use rand::{Rng, distributions::Alphanumeric};

const SETUP_CODE_LEN: usize = 10;
const MQTT_SECRET_LEN: usize = 32;

pub fn generate_setup_code() -> String {
    random_token(SETUP_CODE_LEN).to_uppercase()
}

pub fn generate_mqtt_secret() -> String {
    random_token(MQTT_SECRET_LEN)
}

fn random_token(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

pub fn hash_secret(plaintext: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow!("hashing secret: {e}"))
}

pub fn verify_secret(plaintext: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default().verify_password(plaintext.as_bytes(), &parsed).is_ok()
}

/// QR payload printed on the carton: identity plus the one-shot setup code.
pub fn qr_payload(kind: &str, id: &str, setup_code: &str) -> String {
    format!("HF1:{kind}:{id}:{setup_code}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let code = generate_setup_code();
        let hash = hash_secret(&code).unwrap();
        assert!(verify_secret(&code, &hash));
        assert!(!verify_secret("WRONGCODE1", &hash));
    }

    #[test]
    fn codes_are_unique_enough() {
        let a = generate_setup_code();
        let b = generate_setup_code();
        assert_eq!(a.len(), 10);
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!verify_secret("code", "not-a-phc-string"));
    }
}
