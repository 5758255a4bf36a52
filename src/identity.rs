//! TOFU-style self-signed credentials for a node (§4.11, C11).
//!
//! Builds on `tls_utils`'s load/parse/expiry helpers and adds generation:
//! a fresh ECDSA (P-256) self-signed leaf when nothing usable exists on
//! disk yet.

use crate::error::{AppError, AppResult};
use rand::RngCore;
use rcgen::{Certificate as RcgenCertificate, CertificateParams, DistinguishedName, DnType, SanType};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_rustls::rustls::{Certificate, PrivateKey};

const VALIDITY_DAYS: i64 = 365;

#[derive(Debug, Clone)]
pub struct Identity {
	pub region: String,
	pub service_token: String,
	cert_path: PathBuf,
	key_path: PathBuf,
	cert_der: Vec<u8>,
	key_der: Vec<u8>,
	fingerprint: String,
	not_after: SystemTime,
}

impl Identity {
	/// SHA-256 of the certificate's DER bytes, hex-encoded.
	pub fn fingerprint(&self) -> &str {
		&self.fingerprint
	}

	/// Stable identifier used on the gossip wire: `<region>-<fp[:12]>`.
	pub fn node_id(&self) -> String {
		format!("{}-{}", self.region, &self.fingerprint[..12])
	}

	/// Numeric identifier for the consensus layer, which keys peers by `u64`
	/// rather than the gossip wire's string id. Derived from the same
	/// fingerprint so it's stable across restarts as long as credentials
	/// aren't rotated.
	pub fn raft_id(&self) -> u64 {
		u64::from_str_radix(&self.fingerprint[..16], 16).unwrap_or(1)
	}

	pub fn certificate(&self) -> Certificate {
		Certificate(self.cert_der.clone())
	}

	pub fn private_key(&self) -> PrivateKey {
		PrivateKey(self.key_der.clone())
	}

	/// True iff the certificate expires within `threshold`, or can't be parsed.
	pub fn needs_rotation(&self, threshold: Duration) -> bool {
		match self.not_after.checked_sub(threshold) {
			Some(deadline) => SystemTime::now() >= deadline,
			None => true,
		}
	}

	/// Load existing credentials from disk, or generate and persist fresh ones.
	pub fn load_or_generate(
		region: &str,
		service_token: &str,
		cert_path: &Path,
		key_path: &Path,
	) -> AppResult<Self> {
		if let Some(existing) = Self::try_load(region, service_token, cert_path, key_path) {
			return Ok(existing);
		}
		Self::generate_and_write(region, service_token, cert_path, key_path)
	}

	fn try_load(
		region: &str,
		service_token: &str,
		cert_path: &Path,
		key_path: &Path,
	) -> Option<Self> {
		let cert_pem = fs::read(cert_path).ok()?;
		let key_pem = fs::read(key_path).ok()?;

		let mut cert_reader = BufReader::new(cert_pem.as_slice());
		let certs = rustls_pemfile::certs(&mut cert_reader).ok()?;
		let cert_der = certs.into_iter().next()?;

		let mut key_reader = BufReader::new(key_pem.as_slice());
		let keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader).ok()?;
		let key_der = keys.into_iter().next()?;

		let cert = Certificate(cert_der.clone());
		if crate::tls_utils::is_cert_expired(&cert).unwrap_or(true) {
			return None;
		}
		let parsed = crate::tls_utils::parse_first_cert_x509(&cert).ok()?;
		let not_after = parsed.validity().not_after.to_datetime();
		let not_after_sys: SystemTime =
			SystemTime::UNIX_EPOCH + Duration::from_secs(not_after.unix_timestamp().max(0) as u64);

		let fingerprint = fingerprint_der(&cert_der);

		Some(Self {
			region: region.to_string(),
			service_token: service_token.to_string(),
			cert_path: cert_path.to_path_buf(),
			key_path: key_path.to_path_buf(),
			cert_der,
			key_der,
			fingerprint,
			not_after: not_after_sys,
		})
	}

	fn generate_and_write(
		region: &str,
		service_token: &str,
		cert_path: &Path,
		key_path: &Path,
	) -> AppResult<Self> {
		let cn = format!("opengslb-agent-{}", region);

		let mut params = CertificateParams::new(vec![cn.clone()]);
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, cn.clone());
		params.distinguished_name = dn;
		params.subject_alt_names = vec![SanType::DnsName(cn.clone())];
		params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
		params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;

		let mut serial = [0u8; 16];
		rand::thread_rng().fill_bytes(&mut serial);
		params.serial_number = Some(serial.to_vec().into());

		let now = time::OffsetDateTime::now_utc();
		params.not_before = now - time::Duration::minutes(5);
		params.not_after = now + time::Duration::days(VALIDITY_DAYS);

		let cert = RcgenCertificate::from_params(params)
			.map_err(|e| AppError::Other(anyhow::anyhow!("generating self-signed cert: {e}")))?;

		let cert_der = cert
			.serialize_der()
			.map_err(|e| AppError::Other(anyhow::anyhow!("serializing cert der: {e}")))?;
		let key_der = cert.serialize_private_key_der();

		if let Err(e) = write_credential(cert_path, &pem_encode_cert(&cert_der), 0o644)
			.and_then(|_| write_credential(key_path, &pem_encode_key(&key_der), 0o600))
		{
			let _ = fs::remove_file(cert_path);
			return Err(AppError::Other(anyhow::anyhow!(
				"writing generated credentials: {e}"
			)));
		}

		let fingerprint = fingerprint_der(&cert_der);
		let not_after_sys = SystemTime::now() + Duration::from_secs(VALIDITY_DAYS as u64 * 86400);

		Ok(Self {
			region: region.to_string(),
			service_token: service_token.to_string(),
			cert_path: cert_path.to_path_buf(),
			key_path: key_path.to_path_buf(),
			cert_der,
			key_der,
			fingerprint,
			not_after: not_after_sys,
		})
	}

	/// Regenerate credentials in place. On failure the previous identity is
	/// left untouched in memory (the caller keeps the old `Identity` value).
	pub fn rotate(&self) -> AppResult<Self> {
		Self::generate_and_write(
			&self.region,
			&self.service_token,
			&self.cert_path,
			&self.key_path,
		)
	}
}

fn fingerprint_der(der: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(der);
	let digest = hasher.finalize();
	digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn pem_encode_cert(der: &[u8]) -> String {
	pem_block("CERTIFICATE", der)
}

fn pem_encode_key(der: &[u8]) -> String {
	pem_block("PRIVATE KEY", der)
}

fn pem_block(label: &str, der: &[u8]) -> String {
	use base64::Engine;
	let encoded = base64::engine::general_purpose::STANDARD.encode(der);
	let mut out = format!("-----BEGIN {label}-----\n");
	for chunk in encoded.as_bytes().chunks(64) {
		out.push_str(std::str::from_utf8(chunk).unwrap());
		out.push('\n');
	}
	out.push_str(&format!("-----END {label}-----\n"));
	out
}

fn write_credential(path: &Path, pem: &str, mode: u32) -> std::io::Result<()> {
	fs::write(path, pem)?;
	let mut perms = fs::metadata(path)?.permissions();
	perms.set_mode(mode);
	fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn load_or_generate_is_idempotent_and_stable() {
		let dir = tempdir().unwrap();
		let cert_path = dir.path().join("node.crt");
		let key_path = dir.path().join("node.key");

		let first =
			Identity::load_or_generate("eu-west", "tok-1", &cert_path, &key_path).unwrap();
		assert!(cert_path.exists());
		assert!(key_path.exists());
		assert_eq!(first.node_id(), format!("eu-west-{}", &first.fingerprint()[..12]));

		let second =
			Identity::load_or_generate("eu-west", "tok-1", &cert_path, &key_path).unwrap();
		assert_eq!(first.fingerprint(), second.fingerprint());
	}

	#[test]
	fn rotate_changes_fingerprint_but_keeps_identity_fields() {
		let dir = tempdir().unwrap();
		let cert_path = dir.path().join("node.crt");
		let key_path = dir.path().join("node.key");

		let first =
			Identity::load_or_generate("us-east", "tok-2", &cert_path, &key_path).unwrap();
		let rotated = first.rotate().unwrap();

		assert_ne!(first.fingerprint(), rotated.fingerprint());
		assert_eq!(rotated.region, "us-east");
		assert_eq!(rotated.service_token, "tok-2");
	}

	#[test]
	fn needs_rotation_true_for_threshold_past_expiry() {
		let dir = tempdir().unwrap();
		let cert_path = dir.path().join("node.crt");
		let key_path = dir.path().join("node.key");
		let id = Identity::load_or_generate("eu-west", "tok", &cert_path, &key_path).unwrap();

		assert!(!id.needs_rotation(Duration::from_secs(3600)));
		assert!(id.needs_rotation(Duration::from_secs(VALIDITY_DAYS as u64 * 86400 * 2)));
	}
}
