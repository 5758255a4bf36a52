//! Symmetric encryption for the gossip wire: a 32-byte pre-shared key,
//! base64-encoded at configuration time (§4.7).
//!
//! AES-256-GCM via `ring`, with a random per-message nonce prepended to
//! the ciphertext.

use crate::error::{AppError, AppResult};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

pub const KEY_LEN: usize = 32;

pub struct GossipCipher {
	key: LessSafeKey,
	rng: SystemRandom,
}

impl GossipCipher {
	pub fn from_base64_psk(encoded: &str) -> AppResult<Self> {
		use base64::Engine;
		let raw = base64::engine::general_purpose::STANDARD
			.decode(encoded)
			.map_err(|e| AppError::ConfigInvalid(format!("invalid gossip PSK base64: {e}")))?;
		if raw.len() != KEY_LEN {
			return Err(AppError::ConfigInvalid(format!(
				"gossip PSK must decode to {KEY_LEN} bytes, got {}",
				raw.len()
			)));
		}
		let unbound = UnboundKey::new(&AES_256_GCM, &raw)
			.map_err(|_| AppError::ConfigInvalid("invalid gossip PSK material".into()))?;
		Ok(Self {
			key: LessSafeKey::new(unbound),
			rng: SystemRandom::new(),
		})
	}

	/// Encrypt `plaintext`, returning `nonce || ciphertext || tag`.
	pub fn seal(&self, plaintext: &[u8]) -> AppResult<Vec<u8>> {
		let mut nonce_bytes = [0u8; NONCE_LEN];
		self.rng
			.fill(&mut nonce_bytes)
			.map_err(|_| AppError::Other(anyhow::anyhow!("rng failure generating gossip nonce")))?;
		let nonce = Nonce::assume_unique_for_key(nonce_bytes);

		let mut in_out = plaintext.to_vec();
		self.key
			.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
			.map_err(|_| AppError::Serialization("gossip envelope seal failed".into()))?;

		let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
		out.extend_from_slice(&nonce_bytes);
		out.extend_from_slice(&in_out);
		Ok(out)
	}

	/// Decrypt a `nonce || ciphertext || tag` buffer produced by `seal`.
	pub fn open(&self, sealed: &[u8]) -> AppResult<Vec<u8>> {
		if sealed.len() < NONCE_LEN {
			return Err(AppError::Serialization(
				"gossip envelope too short to contain a nonce".into(),
			));
		}
		let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
		let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
			.map_err(|_| AppError::Serialization("invalid gossip nonce".into()))?;

		let mut buf = ciphertext.to_vec();
		let plaintext = self
			.key
			.open_in_place(nonce, Aad::empty(), &mut buf)
			.map_err(|_| AppError::Serialization("gossip envelope authentication failed".into()))?;
		Ok(plaintext.to_vec())
	}
}
