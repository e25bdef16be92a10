// src/engine/deposit.rs
use crate::chain::{validate_address, validate_derivation_path};
use crate::error::{MixerError, MixerResult};
use crate::repository::Repository;
use crate::security::{KeyVault, SecretKeyMaterial};
use crate::types::{Currency, DepositAddress};
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tiny_keccak::{Hasher, Keccak};
use uuid::Uuid;

const HARDENED: u32 = 0x8000_0000;

/// Generates one fresh deposit address per mix request. Keys are derived from
/// the HD seed when one is configured, otherwise drawn from the CSPRNG; either
/// way the private key is stored only as a vault envelope, with the
/// derivation path and index retained for recovery.
pub struct DepositAddressGenerator {
    repository: Arc<dyn Repository>,
    vault: KeyVault,
    hd_seed: Option<[u8; 64]>,
    address_index: AtomicU32,
}

impl DepositAddressGenerator {
    pub fn new(
        repository: Arc<dyn Repository>,
        vault: KeyVault,
        seed_phrase: Option<&str>,
    ) -> MixerResult<Self> {
        let hd_seed = match seed_phrase {
            Some(phrase) => {
                let mnemonic = bip39::Mnemonic::parse(phrase)
                    .map_err(|e| MixerError::InputValidation(format!("seed phrase: {e}")))?;
                Some(mnemonic.to_seed(""))
            }
            None => None,
        };
        Ok(Self {
            repository,
            vault,
            hd_seed,
            address_index: AtomicU32::new(0),
        })
    }

    /// Allocates an address for a request, retrying the index on the rare
    /// collision the existence probe reports.
    pub async fn allocate(
        &self,
        mix_request_id: Uuid,
        currency: Currency,
    ) -> MixerResult<DepositAddress> {
        for _ in 0..8 {
            let index = self.address_index.fetch_add(1, Ordering::SeqCst);
            let (secret, derivation_path) = self.derive_key(currency, index)?;
            let address = encode_address(currency, &public_of(&secret));
            if self.repository.exists_by_address(&address).await? {
                continue;
            }
            if let Some(path) = &derivation_path {
                validate_derivation_path(path)?;
            }
            validate_address(currency, &address)?;

            let material = SecretKeyMaterial::new(hex::encode(secret.secret_bytes()));
            let ciphertext = self.vault.encrypt_private_key(&material)?;
            let deposit = DepositAddress {
                id: Uuid::new_v4(),
                mix_request_id,
                currency,
                address,
                private_key_ciphertext: ciphertext,
                derivation_path,
                address_index: index,
                used: false,
                first_used_at: None,
                created_at: chrono::Utc::now(),
            };
            self.repository.insert_deposit_address(&deposit).await?;
            return Ok(deposit);
        }
        Err(MixerError::Fatal(
            "could not allocate a unique deposit address".into(),
        ))
    }

    fn derive_key(
        &self,
        currency: Currency,
        index: u32,
    ) -> MixerResult<(SecretKey, Option<String>)> {
        match &self.hd_seed {
            Some(seed) => {
                let coin = coin_type(currency);
                let path = format!("m/44'/{coin}'/0'/0/{index}");
                let secret = derive_from_seed(seed, coin, index)?;
                Ok((secret, Some(path)))
            }
            None => {
                let secret = crate::crypto::generate_keypair()?.secret;
                Ok((secret, None))
            }
        }
    }
}

fn coin_type(currency: Currency) -> u32 {
    match currency {
        Currency::Btc => 0,
        Currency::Eth | Currency::UsdtErc20 => 60,
        Currency::UsdtTrc20 => 195,
        Currency::Sol => 501,
    }
}

fn derive_from_seed(seed: &[u8; 64], coin: u32, index: u32) -> MixerResult<SecretKey> {
    use hdwallet::{ExtendedPrivKey, KeyIndex};

    let to_err = |e: hdwallet::error::Error| MixerError::Crypto(format!("hd derivation: {e:?}"));
    let mut key = ExtendedPrivKey::with_seed(seed).map_err(to_err)?;
    for step in [
        44 | HARDENED,
        coin | HARDENED,
        HARDENED,
        0,
        index,
    ] {
        let key_index = KeyIndex::from_index(step).map_err(to_err)?;
        key = key.derive_private_key(key_index).map_err(to_err)?;
    }
    SecretKey::from_slice(&key.private_key.secret_bytes())
        .map_err(|e| MixerError::Crypto(format!("derived scalar: {e}")))
}

fn public_of(secret: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(crate::crypto::secp(), secret)
}

/// Renders a public key as an address in the currency's canonical format.
pub fn encode_address(currency: Currency, public: &PublicKey) -> String {
    match currency {
        Currency::Eth | Currency::UsdtErc20 => {
            let uncompressed = public.serialize_uncompressed();
            let mut hasher = Keccak::v256();
            hasher.update(&uncompressed[1..]);
            let mut hash = [0u8; 32];
            hasher.finalize(&mut hash);
            format!("0x{}", hex::encode(&hash[12..]))
        }
        Currency::Btc => base58check(0x00, &hash160(&public.serialize())),
        Currency::UsdtTrc20 => base58check(0x41, &hash160(&public.serialize())),
        Currency::Sol => {
            let digest = Sha256::digest(public.serialize());
            bs58::encode(digest).into_string()
        }
    }
}

/// 20-byte key hash used by the base58check formats.
fn hash160(data: &[u8]) -> [u8; 20] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 20];
    out.copy_from_slice(&second[..20]);
    out
}

fn base58check(version: u8, payload: &[u8; 20]) -> String {
    let mut body = Vec::with_capacity(25);
    body.push(version);
    body.extend_from_slice(payload);
    let checksum = Sha256::digest(Sha256::digest(&body));
    body.extend_from_slice(&checksum[..4]);
    bs58::encode(body).into_string()
}
