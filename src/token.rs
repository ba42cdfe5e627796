//! Capability tokens binding a study UID to the query restrictions it was
//! looked up under.
//!
//! A token proves that the retrieval URL was minted by this process for this
//! `(study, restrictions)` pair - it is a capability, not an identity proof.
//! The router re-checks the caller's authorization at redemption time.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::AuthorizationError;
use crate::types::QueryRestrictions;

/// Nonce size for AES-256-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// Tokens older than this are rejected at redemption.
const MAX_TOKEN_AGE_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
	uid: String,
	query: QueryRestrictions,
	iat: u64,
}

/// Process-wide capability-token gate.
///
/// Tokens are the AES-256-GCM encryption of the claims JSON under a key
/// derived once at startup, nonce-prefixed and URL-safe base64 encoded so
/// they can travel as a path segment.
pub struct CapabilityTokens {
	cipher: Aes256Gcm,
	/// Minting is idempotent per `(uid, restrictions)` so URLs stay stable
	/// within a session and crypto work is not repeated per lookup.
	minted: Mutex<HashMap<String, String>>,
}

impl CapabilityTokens {
	/// Derives the token key from a passphrase, or from random bytes when no
	/// passphrase is configured (tokens then do not survive restarts).
	pub fn new(passphrase: Option<&str>) -> Self {
		let key: [u8; 32] = match passphrase {
			Some(passphrase) => Sha256::digest(passphrase.as_bytes()).into(),
			None => {
				let mut key = [0u8; 32];
				rand::thread_rng().fill_bytes(&mut key);
				key
			}
		};

		Self {
			cipher: Aes256Gcm::new_from_slice(&key).expect("key is always 32 bytes"),
			minted: Mutex::new(HashMap::new()),
		}
	}

	/// Issues a token binding `uid` to `restrictions`. Idempotent per pair.
	pub fn issue(
		&self,
		uid: &str,
		restrictions: &QueryRestrictions,
	) -> Result<String, AuthorizationError> {
		let memo_key = format!(
			"{uid}|{}",
			serde_json::to_string(restrictions).map_err(|_| AuthorizationError::InvalidToken)?
		);
		if let Some(token) = self.minted.lock().expect("token memo poisoned").get(&memo_key) {
			return Ok(token.clone());
		}

		let claims = TokenClaims {
			uid: uid.to_owned(),
			query: restrictions.clone(),
			iat: unix_now(),
		};
		let plaintext =
			serde_json::to_vec(&claims).map_err(|_| AuthorizationError::InvalidToken)?;

		let mut nonce_bytes = [0u8; NONCE_SIZE];
		rand::thread_rng().fill_bytes(&mut nonce_bytes);
		let nonce = Nonce::from_slice(&nonce_bytes);

		let ciphertext = self
			.cipher
			.encrypt(nonce, plaintext.as_slice())
			.map_err(|_| AuthorizationError::InvalidToken)?;

		let mut raw = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
		raw.extend_from_slice(&nonce_bytes);
		raw.extend_from_slice(&ciphertext);
		let token = URL_SAFE_NO_PAD.encode(raw);

		self.minted
			.lock()
			.expect("token memo poisoned")
			.insert(memo_key, token.clone());
		Ok(token)
	}

	/// Redeems a token against the study UID present in the retrieval path.
	///
	/// Fails with [`AuthorizationError::InvalidToken`] when decryption or
	/// parsing fails, and with [`AuthorizationError::StudyMismatch`] when the
	/// embedded UID differs from `expected_uid`. The caller must still run
	/// [`crate::auth::Authorizer::ensure_query_allowed`] on the returned
	/// restrictions.
	pub fn redeem(
		&self,
		token: &str,
		expected_uid: &str,
	) -> Result<QueryRestrictions, AuthorizationError> {
		let raw = URL_SAFE_NO_PAD
			.decode(token)
			.map_err(|_| AuthorizationError::InvalidToken)?;
		if raw.len() <= NONCE_SIZE {
			return Err(AuthorizationError::InvalidToken);
		}
		let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);

		let plaintext = self
			.cipher
			.decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
			.map_err(|_| AuthorizationError::InvalidToken)?;
		let claims: TokenClaims =
			serde_json::from_slice(&plaintext).map_err(|_| AuthorizationError::InvalidToken)?;

		if unix_now().saturating_sub(claims.iat) > MAX_TOKEN_AGE_SECONDS {
			return Err(AuthorizationError::InvalidToken);
		}
		if claims.uid != expected_uid {
			return Err(AuthorizationError::StudyMismatch {
				bound: claims.uid,
				requested: expected_uid.to_owned(),
			});
		}

		Ok(claims.query)
	}
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn restrictions(tenant: &str, patient: &str) -> QueryRestrictions {
		QueryRestrictions {
			tenant_key: tenant.to_owned(),
			by_patient_id: Some(patient.to_owned()),
			by_patient_identifier: None,
		}
	}

	#[test]
	fn round_trip() {
		let tokens = CapabilityTokens::new(Some("test-passphrase"));
		let query = restrictions("tenant-a", "pat-1");

		let token = tokens.issue("1.2.3", &query).unwrap();
		assert_eq!(tokens.redeem(&token, "1.2.3").unwrap(), query);
	}

	#[test]
	fn minting_is_idempotent_per_pair() {
		let tokens = CapabilityTokens::new(None);
		let query = restrictions("tenant-a", "pat-1");

		let first = tokens.issue("1.2.3", &query).unwrap();
		let second = tokens.issue("1.2.3", &query).unwrap();
		assert_eq!(first, second);

		// A different pair mints a different token.
		let other = tokens.issue("1.2.4", &query).unwrap();
		assert_ne!(first, other);
	}

	#[test]
	fn study_mismatch_is_rejected() {
		let tokens = CapabilityTokens::new(None);
		let token = tokens.issue("1.2.3", &restrictions("tenant-a", "pat-1")).unwrap();

		assert!(matches!(
			tokens.redeem(&token, "9.9.9"),
			Err(AuthorizationError::StudyMismatch { .. })
		));
	}

	#[test]
	fn forged_or_foreign_tokens_are_rejected() {
		let tokens = CapabilityTokens::new(Some("key-one"));
		let other = CapabilityTokens::new(Some("key-two"));
		let token = tokens.issue("1.2.3", &restrictions("tenant-a", "pat-1")).unwrap();

		assert!(matches!(
			other.redeem(&token, "1.2.3"),
			Err(AuthorizationError::InvalidToken)
		));
		assert!(matches!(
			tokens.redeem("not-a-token", "1.2.3"),
			Err(AuthorizationError::InvalidToken)
		));
	}

	#[test]
	fn tokens_are_url_safe() {
		let tokens = CapabilityTokens::new(None);
		let token = tokens.issue("1.2.3", &restrictions("tenant-a", "pat-1")).unwrap();
		assert!(token
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
	}
}
