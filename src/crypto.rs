//! Hashing, canonical encoding and the node's signing keys
//!
//! Every signature in the mesh is taken over a canonical JSON payload and
//! exchanged as hex. Capability tokens are signed with the node's RSA token
//! key (RSA-PSS, SHA-256); transfers, security events and the handshake
//! identity use its secp256k1 node key (ECDSA over SHA-256).

use crate::error::KioskError;
use crate::persistence::JsonFile;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{pss, RsaPrivateKey, RsaPublicKey};
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Modulus size of newly generated token keys.
pub const TOKEN_KEY_BITS: usize = 2048;

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Canonical JSON: object keys sorted, no insignificant whitespace.
///
/// `serde_json::Map` is ordered by key unless `preserve_order` is enabled,
/// so a round trip through `Value` sorts every nested object.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, KioskError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

fn digest(payload: &[u8]) -> Message {
    Message::from_digest(Sha256::digest(payload).into())
}

/// The node's signing identity.
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

/// On-disk form of `node_key.json`.
#[derive(Serialize, Deserialize)]
struct NodeKeyFile {
    secret_key: String,
    public_key: String,
    created_at: i64,
}

impl KeyPair {
    pub fn generate() -> Result<Self, KioskError> {
        let (secret_key, public_key) = SECP.generate_keypair(&mut OsRng);
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, KioskError> {
        let bytes = hex::decode(secret_hex)
            .map_err(|e| KioskError::Crypto(format!("Secret key is not hex: {}", e)))?;
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|e| KioskError::Crypto(format!("Invalid secret key ({} bytes): {}", bytes.len(), e)))?;
        Ok(Self {
            public_key: PublicKey::from_secret_key(&SECP, &secret_key),
            secret_key,
        })
    }

    /// Load the node key from `path`, creating and saving a new one if the
    /// file does not exist. Any failure here is fatal for the node.
    pub fn load_or_create(path: &Path) -> Result<Self, KioskError> {
        let file: JsonFile<NodeKeyFile> = JsonFile::new(path);
        let fatal = |e: KioskError| KioskError::KeyMaterial(format!("{}: {}", path.display(), e));

        if let Some(stored) = file.load().map_err(fatal)? {
            let keypair = Self::from_secret_hex(&stored.secret_key).map_err(fatal)?;
            if keypair.public_key_hex() != stored.public_key {
                return Err(fatal(KioskError::Crypto(
                    "public key does not match the secret key".to_string(),
                )));
            }
            return Ok(keypair);
        }

        let keypair = Self::generate()?;
        file.save(&NodeKeyFile {
            secret_key: hex::encode(keypair.secret_key.secret_bytes()),
            public_key: keypair.public_key_hex(),
            created_at: chrono::Utc::now().timestamp(),
        })
        .map_err(fatal)?;
        info!("Generated node key {}", keypair.public_key_hex());
        Ok(keypair)
    }

    /// Compressed public key, hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Compact ECDSA signature over SHA-256(`payload`), hex.
    pub fn sign_hex(&self, payload: &[u8]) -> Result<String, KioskError> {
        let signature = SECP.sign_ecdsa(&digest(payload), &self.secret_key);
        Ok(hex::encode(signature.serialize_compact()))
    }
}

/// Check a hex signature produced by [`KeyPair::sign_hex`].
pub fn verify_signature_hex(public_key_hex: &str, payload: &[u8], signature_hex: &str) -> Result<(), KioskError> {
    let key_bytes = hex::decode(public_key_hex)
        .map_err(|e| KioskError::Crypto(format!("Public key is not hex: {}", e)))?;
    let public_key = PublicKey::from_slice(&key_bytes)
        .map_err(|e| KioskError::Crypto(format!("Invalid public key: {}", e)))?;
    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| KioskError::Crypto(format!("Signature is not hex: {}", e)))?;
    let signature = Signature::from_compact(&sig_bytes)
        .map_err(|e| KioskError::Crypto(format!("Malformed signature: {}", e)))?;

    SECP.verify_ecdsa(&digest(payload), &signature, &public_key)
        .map_err(|_| KioskError::Crypto("Signature does not match".to_string()))
}

/// The node's RSA key for signing capability tokens.
#[derive(Clone)]
pub struct TokenSigningKey {
    private_key: RsaPrivateKey,
    public_key_pem: String,
}

/// On-disk form of `token_key.json`.
#[derive(Serialize, Deserialize)]
struct TokenKeyFile {
    private_key_pem: String,
    public_key_pem: String,
    created_at: i64,
}

impl std::fmt::Debug for TokenSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigningKey")
            .field("public_key_pem", &self.public_key_pem)
            .finish_non_exhaustive()
    }
}

impl TokenSigningKey {
    pub fn generate() -> Result<Self, KioskError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, TOKEN_KEY_BITS)
            .map_err(|e| KioskError::Crypto(format!("RSA key generation failed: {}", e)))?;
        Self::from_private_key(private_key)
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, KioskError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| KioskError::Crypto(format!("Invalid RSA private key: {}", e)))?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, KioskError> {
        let public_key_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KioskError::Crypto(format!("Cannot encode RSA public key: {}", e)))?;
        Ok(Self {
            private_key,
            public_key_pem,
        })
    }

    /// Load the token key from `path`, creating it on first start. Like the
    /// node key, a key file that cannot be used is fatal.
    pub fn load_or_create(path: &Path) -> Result<Self, KioskError> {
        let file: JsonFile<TokenKeyFile> = JsonFile::new(path);
        let fatal = |e: KioskError| KioskError::KeyMaterial(format!("{}: {}", path.display(), e));

        if let Some(stored) = file.load().map_err(fatal)? {
            let key = Self::from_pkcs8_pem(&stored.private_key_pem).map_err(fatal)?;
            if key.public_key_pem.trim() != stored.public_key_pem.trim() {
                return Err(fatal(KioskError::Crypto(
                    "public key does not match the private key".to_string(),
                )));
            }
            return Ok(key);
        }

        let key = Self::generate()?;
        let private_key_pem = key
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| fatal(KioskError::Crypto(format!("Cannot encode RSA private key: {}", e))))?;
        file.save(&TokenKeyFile {
            private_key_pem: private_key_pem.as_str().to_string(),
            public_key_pem: key.public_key_pem.clone(),
            created_at: chrono::Utc::now().timestamp(),
        })
        .map_err(fatal)?;
        info!("Generated {}-bit token signing key", TOKEN_KEY_BITS);
        Ok(key)
    }

    /// SubjectPublicKeyInfo PEM, as shared with peers.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// RSA-PSS signature over SHA-256(`payload`), hex.
    pub fn sign_pss_hex(&self, payload: &[u8]) -> Result<String, KioskError> {
        let signing_key = pss::SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signing_key
            .try_sign_with_rng(&mut OsRng, payload)
            .map_err(|e| KioskError::Crypto(format!("RSA-PSS signing failed: {}", e)))?;
        Ok(hex::encode(signature.to_bytes()))
    }
}

/// Check a hex signature produced by [`TokenSigningKey::sign_pss_hex`].
pub fn verify_pss_hex(public_key_pem: &str, payload: &[u8], signature_hex: &str) -> Result<(), KioskError> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| KioskError::Crypto(format!("Invalid RSA public key: {}", e)))?;
    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| KioskError::Crypto(format!("Signature is not hex: {}", e)))?;
    let signature = pss::Signature::try_from(sig_bytes.as_slice())
        .map_err(|e| KioskError::Crypto(format!("Malformed signature: {}", e)))?;

    pss::VerifyingKey::<Sha256>::new(public_key)
        .verify(payload, &signature)
        .map_err(|_| KioskError::Crypto("Signature does not match".to_string()))
}
