//! Certificate parsing helpers backing `identity::Identity` (§4.11, C11).
//!
//! Just the x509 parsing primitives Identity needs; there's no server-side
//! `rustls::ServerConfig` here since gossip uses a PSK envelope and the
//! consensus join API is plain HTTP (§6).

use anyhow::Result;
use tokio_rustls::rustls::Certificate;

/// Parse the DER-encoded certificate bytes and return the x509 parser's `X509Certificate`.
pub fn parse_first_cert_x509<'a>(
	cert: &'a Certificate,
) -> Result<x509_parser::certificate::X509Certificate<'a>> {
	let res = x509_parser::parse_x509_certificate(&cert.0)
		.map_err(|e| anyhow::anyhow!("failed to parse x509 certificate: {:?}", e))?;
	Ok(res.1)
}

/// Return true if the certificate is expired at the current UTC time.
pub fn is_cert_expired(cert: &Certificate) -> Result<bool> {
	let parsed = parse_first_cert_x509(cert)?;
	let not_after = parsed.validity().not_after.to_datetime();
	let now = x509_parser::time::ASN1Time::now().to_datetime();
	Ok(not_after <= now)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_rejects_garbage_der() {
		let cert = Certificate(vec![0u8; 8]);
		assert!(parse_first_cert_x509(&cert).is_err());
	}
}
