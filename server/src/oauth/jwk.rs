use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk, KeyAlgorithm,
};
use jsonwebtoken::EncodingKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use p256::SecretKey;
use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};

/// Generate a fresh P-256 key. One of these is minted per login attempt and
/// stays bound to that session's token lineage.
pub fn generate_key() -> SecretKey {
    SecretKey::random(&mut rand::rngs::OsRng)
}

/// Serialize a key for storage (PKCS#8 PEM).
pub fn key_to_pem(key: &SecretKey) -> Result<String> {
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Key(format!("failed to serialize private key: {e}")))?;
    Ok(pem.to_string())
}

/// Parse a stored PKCS#8 PEM key back into a usable form.
pub fn key_from_pem(pem: &str) -> Result<SecretKey> {
    SecretKey::from_pkcs8_pem(pem).map_err(|e| Error::Key(format!("failed to parse private key: {e}")))
}

/// Signing key handle for `jsonwebtoken`.
pub fn encoding_key(key: &SecretKey) -> Result<EncodingKey> {
    let pem = key_to_pem(key)?;
    Ok(EncodingKey::from_ec_pem(pem.as_bytes())?)
}

/// Generate a key ID from the key's public coordinates.
pub fn generate_key_id(x: &[u8], y: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(x);
    hasher.update(y);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Key ID for a private key, derived from its public coordinates.
pub fn key_id(key: &SecretKey) -> Result<String> {
    let point = key.public_key().to_encoded_point(false);
    match (point.x(), point.y()) {
        (Some(x), Some(y)) => Ok(generate_key_id(x, y)),
        _ => Err(Error::Key("public key missing coordinates".into())),
    }
}

/// Build the public JWK for a key: `kty`/`crv`/`x`/`y` plus a derived `kid`.
/// The private `d` component is never part of this structure.
pub fn public_jwk(key: &SecretKey) -> Result<Jwk> {
    let point = key.public_key().to_encoded_point(false);
    let x = point
        .x()
        .ok_or_else(|| Error::Key("public key missing x coordinate".into()))?;
    let y = point
        .y()
        .ok_or_else(|| Error::Key("public key missing y coordinate".into()))?;

    Ok(Jwk {
        common: CommonParameters {
            key_id: Some(generate_key_id(x, y)),
            key_algorithm: Some(KeyAlgorithm::ES256),
            ..Default::default()
        },
        algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
            key_type: EllipticCurveKeyType::EC,
            curve: EllipticCurve::P256,
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        }),
    })
}
