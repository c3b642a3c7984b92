//! Follower account credentials
//!
//! Seed decoding, ed25519 key derivation and classic-address encoding for
//! the controlled account. Only ed25519 family seeds (`sEd...`) are
//! supported; secp256k1 family seeds are rejected at validation time.

pub mod signer;

use ed25519_dalek::{Signer as _, SigningKey};
use rand::RngCore;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

/// Payload prefix for ed25519 family seeds
const ED25519_SEED_PREFIX: [u8; 3] = [0x01, 0xE1, 0x4B];
/// Version byte for classic account addresses
const ACCOUNT_ID_PREFIX: u8 = 0x00;

/// Signing credentials for the follower account
pub struct Wallet {
    signing_key: SigningKey,
    /// 33-byte on-ledger public key (0xED prefix + ed25519 public key)
    public_key: [u8; 33],
    /// 20-byte account id (RIPEMD-160 of SHA-256 of the public key)
    account_id: [u8; 20],
    classic_address: String,
}

impl Wallet {
    /// Derive a wallet from an ed25519 family seed
    pub fn from_seed(seed: &str) -> Result<Self> {
        let entropy = decode_seed(seed)?;

        // The raw signing key is the first half of SHA-512 over the entropy
        let raw = sha512_half(&entropy);
        let signing_key = SigningKey::from_bytes(&raw);

        let mut public_key = [0u8; 33];
        public_key[0] = 0xED;
        public_key[1..].copy_from_slice(&signing_key.verifying_key().to_bytes());

        let account_id = account_id_from_public_key(&public_key);
        let classic_address = encode_classic_address(&account_id);

        Ok(Self {
            signing_key,
            public_key,
            account_id,
            classic_address,
        })
    }

    /// Generate a fresh wallet from OS randomness
    pub fn generate() -> Result<(String, Self)> {
        let mut entropy = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        let seed = encode_seed(&entropy);
        let wallet = Self::from_seed(&seed)?;
        Ok((seed, wallet))
    }

    /// Classic address of this wallet (`r...`)
    pub fn classic_address(&self) -> &str {
        &self.classic_address
    }

    /// On-ledger public key bytes (0xED-prefixed)
    pub fn public_key(&self) -> &[u8; 33] {
        &self.public_key
    }

    /// 20-byte account id
    pub fn account_id(&self) -> &[u8; 20] {
        &self.account_id
    }

    /// Sign an arbitrary payload (already prefixed by the caller)
    pub fn sign(&self, payload: &[u8]) -> [u8; 64] {
        self.signing_key.sign(payload).to_bytes()
    }

    #[cfg(test)]
    pub(crate) fn verify(&self, payload: &[u8], signature: &[u8; 64]) -> bool {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        self.signing_key
            .verifying_key()
            .verify_strict(payload, &sig)
            .is_ok()
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak key material through Debug output
        f.debug_struct("Wallet")
            .field("classic_address", &self.classic_address)
            .finish()
    }
}

/// First 32 bytes of SHA-512
pub(crate) fn sha512_half(data: &[u8]) -> [u8; 32] {
    let digest = Sha512::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    out
}

fn decode_seed(seed: &str) -> Result<[u8; 16]> {
    let payload = bs58::decode(seed)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check(None)
        .into_vec()
        .map_err(|e| Error::InvalidSeed(e.to_string()))?;

    if payload.len() != 19 || payload[..3] != ED25519_SEED_PREFIX {
        return Err(Error::InvalidSeed(
            "only ed25519 family seeds (sEd...) are supported".to_string(),
        ));
    }

    let mut entropy = [0u8; 16];
    entropy.copy_from_slice(&payload[3..]);
    Ok(entropy)
}

fn encode_seed(entropy: &[u8; 16]) -> String {
    let mut payload = Vec::with_capacity(19);
    payload.extend_from_slice(&ED25519_SEED_PREFIX);
    payload.extend_from_slice(entropy);
    bs58::encode(payload)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check()
        .into_string()
}

pub(crate) fn account_id_from_public_key(public_key: &[u8; 33]) -> [u8; 20] {
    let sha = Sha256::digest(public_key);
    let digest = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Encode a 20-byte account id as a classic address
pub fn encode_classic_address(account_id: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(ACCOUNT_ID_PREFIX);
    payload.extend_from_slice(account_id);
    bs58::encode(payload)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check()
        .into_string()
}

/// Decode a classic address into its 20-byte account id
pub fn decode_classic_address(address: &str) -> Result<[u8; 20]> {
    let payload = bs58::decode(address)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check(Some(ACCOUNT_ID_PREFIX))
        .into_vec()
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))?;

    if payload.len() != 21 {
        return Err(Error::InvalidAddress(format!(
            "{}: expected 20-byte account id",
            address
        )));
    }

    let mut out = [0u8; 20];
    out.copy_from_slice(&payload[1..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_seed_round_trips() {
        let (seed, wallet) = Wallet::generate().unwrap();
        assert!(seed.starts_with("sEd"));
        let restored = Wallet::from_seed(&seed).unwrap();
        assert_eq!(wallet.classic_address(), restored.classic_address());
    }

    #[test]
    fn test_address_shape() {
        let (_, wallet) = Wallet::generate().unwrap();
        let address = wallet.classic_address();
        assert!(address.starts_with('r'), "got {}", address);
        assert!((25..=35).contains(&address.len()));
    }

    #[test]
    fn test_address_round_trips() {
        let (_, wallet) = Wallet::generate().unwrap();
        let decoded = decode_classic_address(wallet.classic_address()).unwrap();
        assert_eq!(&decoded, wallet.account_id());
        assert_eq!(encode_classic_address(&decoded), wallet.classic_address());
    }

    #[test]
    fn test_bad_seeds_rejected() {
        assert!(Wallet::from_seed("").is_err());
        assert!(Wallet::from_seed("notASeed").is_err());
        // secp256k1 family seed (0x21 prefix) is not supported
        assert!(Wallet::from_seed("sn259rEFXrQrWyx3Q7XneWcwV6dfL").is_err());
    }

    #[test]
    fn test_signature_verifies() {
        let (_, wallet) = Wallet::generate().unwrap();
        let payload = b"signing payload";
        let signature = wallet.sign(payload);
        assert!(wallet.verify(payload, &signature));
        assert!(!wallet.verify(b"other payload", &signature));
    }
}
