//! Cryptographic primitives for the sync fabric.
//!
//! Every device in a vault group derives the same 256-bit AEAD key from the
//! shared passphrase. The vault identity is a fingerprint of that key, so
//! proving knowledge of the passphrase never reveals key material. Message
//! payloads are sealed with AES-256-GCM; the relay only ever sees envelopes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SyncError};

type HmacSha256 = Hmac<Sha256>;

/// Fixed application salt for key derivation. Changing this invalidates
/// every existing vault identity, so it is versioned into the string.
const KEY_DERIVATION_SALT: &[u8] = b"vaultsync-key-derivation-v1";

/// PBKDF2 round count. High enough to slow offline guessing, low enough
/// that startup on a phone stays under ~100ms.
const KEY_DERIVATION_ROUNDS: u32 = 100_000;

/// Device token lifetime: 30 days.
pub const DEVICE_TOKEN_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// The vault group key. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey([u8; 32]);

impl VaultKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        VaultKey(bytes)
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.write_str("VaultKey(..)")
    }
}

/// Derive the vault group key from a passphrase.
/// PBKDF2-HMAC-SHA256 with a fixed application salt: two devices given the
/// same passphrase always derive the same key.
pub fn derive_key(passphrase: &str) -> VaultKey {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        KEY_DERIVATION_SALT,
        KEY_DERIVATION_ROUNDS,
        &mut key,
    );
    VaultKey(key)
}

/// Vault identity: first 32 hex chars of SHA-256 over the raw key bytes.
/// Devices that derive the same key compute the same vault id and are
/// grouped by the relay without it ever learning the key.
pub fn vault_id(key: &VaultKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Device identity: first 16 hex chars of SHA-256("hostname:vaultPath").
/// Stable across restarts; distinct per vault on the same machine.
pub fn device_id(host: &str, vault_path: &Path) -> String {
    let input = format!("{}:{}", host, vault_path.display());
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Device identity for this machine, using the local hostname.
pub fn local_device_id(vault_path: &Path) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    device_id(&host, vault_path)
}

/// SHA-256 hex digest of file content.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ── AEAD envelope ───────────────────────────────────────────────────────

/// Sealed form of a protocol message. `ciphertext` includes the GCM tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u8,
    pub nonce: String,
    pub ciphertext: String,
}

/// Seal plaintext with AES-256-GCM under a fresh random 12-byte nonce.
pub fn seal(key: &VaultKey, plaintext: &[u8]) -> Result<Envelope> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| SyncError::crypto(format!("cipher init failed: {}", e)))?;

    let mut nonce_bytes = [0u8; 12];
    rand::rng().fill(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SyncError::crypto("encryption failed"))?;

    Ok(Envelope {
        v: 1,
        nonce: STANDARD.encode(nonce_bytes),
        ciphertext: STANDARD.encode(ciphertext),
    })
}

/// Open a sealed envelope. Fails on version mismatch, malformed base64, or
/// authentication failure (wrong key / tampered ciphertext). The error is
/// deliberately uniform so callers cannot distinguish the cases by message.
pub fn open(key: &VaultKey, envelope: &Envelope) -> Result<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    if envelope.v != 1 {
        return Err(SyncError::crypto("unsupported envelope version"));
    }

    let nonce_bytes = STANDARD
        .decode(&envelope.nonce)
        .map_err(|_| SyncError::crypto("decrypt failed"))?;
    if nonce_bytes.len() != 12 {
        return Err(SyncError::crypto("decrypt failed"));
    }
    let ciphertext = STANDARD
        .decode(&envelope.ciphertext)
        .map_err(|_| SyncError::crypto("decrypt failed"))?;

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| SyncError::crypto("decrypt failed"))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| SyncError::crypto("decrypt failed"))
}

// ── Pairing codes ───────────────────────────────────────────────────────

/// Generate a 6-digit pairing code from CSPRNG bytes.
/// The raw code is shown to the user; only its hash goes on the wire.
pub fn generate_pairing_code() -> String {
    let n: u32 = rand::rng().random_range(0..1_000_000);
    format!("{:06}", n)
}

/// Hash a pairing code for transmission.
pub fn hash_pairing_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

// ── Device tokens ───────────────────────────────────────────────────────

/// Claims carried by a device token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub device_id: String,
    pub vault_id: String,
    /// Expiry, epoch milliseconds.
    pub expires_at: i64,
}

/// Mint a device token: `base64(payloadJSON):hex(HMAC-SHA256(payloadJSON))`.
/// The server secret never leaves the relay; clients treat tokens as opaque.
pub fn mint_device_token(
    device_id: &str,
    vault_id: &str,
    now_ms: i64,
    server_secret: &[u8],
) -> Result<String> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let payload = TokenPayload {
        device_id: device_id.to_string(),
        vault_id: vault_id.to_string(),
        expires_at: now_ms + DEVICE_TOKEN_TTL_MS,
    };
    let json = serde_json::to_string(&payload)?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(server_secret)
        .map_err(|_| SyncError::crypto("invalid server secret"))?;
    mac.update(json.as_bytes());
    let tag = mac.finalize().into_bytes();

    Ok(format!("{}:{}", STANDARD.encode(&json), hex::encode(tag)))
}

/// Verify a device token. HMAC comparison is constant-time; expiry is
/// checked after authenticity so a forged token never reaches the clock.
pub fn verify_device_token(
    token: &str,
    now_ms: i64,
    server_secret: &[u8],
) -> Result<TokenPayload> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let (payload_b64, tag_hex) = token
        .split_once(':')
        .ok_or_else(|| SyncError::Auth("malformed token".to_string()))?;

    let json = STANDARD
        .decode(payload_b64)
        .map_err(|_| SyncError::Auth("malformed token".to_string()))?;
    let tag = hex::decode(tag_hex).map_err(|_| SyncError::Auth("malformed token".to_string()))?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(server_secret)
        .map_err(|_| SyncError::crypto("invalid server secret"))?;
    mac.update(&json);
    mac.verify_slice(&tag)
        .map_err(|_| SyncError::Auth("token signature mismatch".to_string()))?;

    let payload: TokenPayload = serde_json::from_slice(&json)
        .map_err(|_| SyncError::Auth("malformed token payload".to_string()))?;

    if payload.expires_at < now_ms {
        return Err(SyncError::Auth("token expired".to_string()));
    }

    Ok(payload)
}

/// Generate a random 32-byte server secret for token minting.
pub fn generate_server_secret() -> Vec<u8> {
    let mut secret = vec![0u8; 32];
    rand::rng().fill(&mut secret[..]);
    secret
}

/// Current wall-clock time, epoch milliseconds.
pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_passphrase_same_vault_id() {
        let a = derive_key("correct horse battery staple");
        let b = derive_key("correct horse battery staple");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(vault_id(&a), vault_id(&b));
        assert_eq!(vault_id(&a).len(), 32);
    }

    #[test]
    fn different_passphrase_different_vault_id() {
        let a = derive_key("passphrase one");
        let b = derive_key("passphrase two");
        assert_ne!(vault_id(&a), vault_id(&b));
    }

    #[test]
    fn seal_open_round_trip() {
        let key = derive_key("roundtrip");
        for msg in [
            "".as_bytes().to_vec(),
            b"x".to_vec(),
            b"hello world".to_vec(),
            vec![0xAB; 64 * 1024],
        ] {
            let envelope = seal(&key, &msg).unwrap();
            assert_eq!(envelope.v, 1);
            let plain = open(&key, &envelope).unwrap();
            assert_eq!(plain, msg);
        }
    }

    #[test]
    fn fresh_nonce_per_message() {
        let key = derive_key("nonces");
        let a = seal(&key, b"same plaintext").unwrap();
        let b = seal(&key, b"same plaintext").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let key = derive_key("the right key");
        let wrong = derive_key("the wrong key");
        let envelope = seal(&key, b"secret").unwrap();
        assert!(open(&wrong, &envelope).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = derive_key("tamper");
        let mut envelope = seal(&key, b"secret").unwrap();
        envelope.ciphertext = {
            let mut s = envelope.ciphertext.clone().into_bytes();
            s[0] = if s[0] == b'A' { b'B' } else { b'A' };
            String::from_utf8(s).unwrap()
        };
        assert!(open(&key, &envelope).is_err());
    }

    #[test]
    fn device_id_is_16_hex() {
        let id = device_id("myhost", Path::new("/home/me/vault"));
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        // Same inputs, same id
        assert_eq!(id, device_id("myhost", Path::new("/home/me/vault")));
        // Different vault, different id
        assert_ne!(id, device_id("myhost", Path::new("/home/me/other")));
    }

    #[test]
    fn pairing_code_shape_and_hash() {
        for _ in 0..32 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
        let h1 = hash_pairing_code("123456");
        let h2 = hash_pairing_code("123456");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_pairing_code("123457"));
    }

    #[test]
    fn token_mint_verify_round_trip() {
        let secret = generate_server_secret();
        let now = epoch_ms();
        let token = mint_device_token("dev1", "vault1", now, &secret).unwrap();
        let payload = verify_device_token(&token, now, &secret).unwrap();
        assert_eq!(payload.device_id, "dev1");
        assert_eq!(payload.vault_id, "vault1");
        assert_eq!(payload.expires_at, now + DEVICE_TOKEN_TTL_MS);
    }

    #[test]
    fn token_expiry_and_forgery_rejected() {
        let secret = generate_server_secret();
        let now = epoch_ms();
        let token = mint_device_token("dev1", "vault1", now, &secret).unwrap();

        // Expired
        assert!(verify_device_token(&token, now + DEVICE_TOKEN_TTL_MS + 1, &secret).is_err());

        // Wrong secret
        let other = generate_server_secret();
        assert!(verify_device_token(&token, now, &other).is_err());

        // Tampered payload
        let tampered = format!("AAAA{}", &token[4..]);
        assert!(verify_device_token(&tampered, now, &secret).is_err());
    }
}
