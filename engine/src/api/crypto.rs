//! `crypto` namespace: hashing, MACs and per-plugin encryption
//!
//! Encryption uses ChaCha20-Poly1305 with a random nonce per message. Each
//! plugin gets its own key, derived with BLAKE3 from a host master key and the
//! plugin id, so one plugin can never decrypt another plugin's data. The
//! master key is created on first use and persisted in the host store.

use crate::security::integrity::{digest_hex, HashAlgorithm};
use crate::storage::KvStore;
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use sdk::errors::EngineError;
use sdk::host_api::{args, NamespaceImpl};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::OnceCell;
use zeroize::Zeroizing;

const MASTER_KEY: &str = "crypto/master_key";
const PLUGIN_KEY_CONTEXT: &str = "enclave plugin data key v1";
const HMAC_KEY_CONTEXT: &str = "enclave plugin hmac key v1";
const NONCE_LEN: usize = 12;

type Key = Zeroizing<[u8; 32]>;

pub struct CryptoApi {
    store: Arc<dyn KvStore>,
    master: OnceCell<Key>,
}

impl CryptoApi {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            master: OnceCell::new(),
        }
    }

    async fn master_key(&self) -> Result<&Key, EngineError> {
        self.master
            .get_or_try_init(|| async {
                if let Some(Value::String(encoded)) = self.store.get(MASTER_KEY).await? {
                    let bytes = Zeroizing::new(hex::decode(encoded.as_bytes()).map_err(|e| {
                        EngineError::Storage(format!("Corrupt master key: {}", e))
                    })?);
                    let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                        EngineError::Storage("Master key has the wrong length".to_string())
                    })?;
                    return Ok(Zeroizing::new(key));
                }

                let generated = ChaCha20Poly1305::generate_key(&mut OsRng);
                let mut key = Zeroizing::new([0u8; 32]);
                key.copy_from_slice(&generated);
                self.store
                    .set(MASTER_KEY, Value::String(hex::encode(key.as_slice())))
                    .await?;
                tracing::info!("Generated host master key");
                Ok(key)
            })
            .await
    }

    async fn plugin_cipher(&self, plugin_id: &str) -> Result<ChaCha20Poly1305, EngineError> {
        let master = self.master_key().await?;
        let mut material = Zeroizing::new(Vec::with_capacity(32 + plugin_id.len()));
        material.extend_from_slice(master.as_slice());
        material.extend_from_slice(plugin_id.as_bytes());
        let key = Zeroizing::new(blake3::derive_key(PLUGIN_KEY_CONTEXT, &material));
        ChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|e| EngineError::Execution(format!("Invalid key: {}", e)))
    }

    async fn encrypt(&self, plugin_id: &str, plaintext: &str) -> Result<Value, EngineError> {
        let cipher = self.plugin_cipher(plugin_id).await?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| EngineError::Execution("Encryption failed".to_string()))?;
        Ok(json!({
            "nonce": hex::encode(nonce),
            "ciphertext": hex::encode(ciphertext),
        }))
    }

    async fn decrypt(&self, plugin_id: &str, sealed: &Value) -> Result<Value, EngineError> {
        let field = |name: &str| -> Result<Vec<u8>, EngineError> {
            let text = sealed
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::Execution(format!("Missing '{}'", name)))?;
            hex::decode(text).map_err(|_| EngineError::Execution(format!("'{}' is not hex", name)))
        };
        let nonce = field("nonce")?;
        let ciphertext = field("ciphertext")?;
        if nonce.len() != NONCE_LEN {
            return Err(EngineError::Execution("Nonce must be 12 bytes".to_string()));
        }

        let cipher = self.plugin_cipher(plugin_id).await?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| EngineError::Execution("Decryption failed".to_string()))?,
        );
        String::from_utf8(plaintext.to_vec())
            .map(Value::String)
            .map_err(|_| EngineError::Execution("Plaintext is not UTF-8".to_string()))
    }
}

#[async_trait]
impl NamespaceImpl for CryptoApi {
    async fn call(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, EngineError> {
        match method {
            "hash" => {
                let data = args::string(&args, 0, "data")?;
                let name = args::opt_string(&args, 1).unwrap_or_else(|| "sha256".to_string());
                let algorithm = HashAlgorithm::parse(&name).ok_or_else(|| {
                    EngineError::Execution(format!("Unsupported hash algorithm: {}", name))
                })?;
                Ok(Value::String(digest_hex(algorithm, data.as_bytes())))
            }
            "hmac" => {
                let key = Zeroizing::new(args::string(&args, 0, "key")?);
                let data = args::string(&args, 1, "data")?;
                let mac_key = Zeroizing::new(blake3::derive_key(HMAC_KEY_CONTEXT, key.as_bytes()));
                Ok(Value::String(
                    blake3::keyed_hash(&mac_key, data.as_bytes()).to_hex().to_string(),
                ))
            }
            "encrypt" => {
                let plaintext = args::string(&args, 0, "plaintext")?;
                self.encrypt(plugin_id, &plaintext).await
            }
            "decrypt" => self.decrypt(plugin_id, &args::value(&args, 0)).await,
            other => Err(EngineError::Execution(format!(
                "Unknown crypto method: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;

    fn api() -> (Arc<dyn KvStore>, CryptoApi) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let api = CryptoApi::new(Arc::clone(&store));
        (store, api)
    }

    #[tokio::test]
    async fn test_hash() {
        let (_, api) = api();
        let sha = api.call("p", "hash", vec![json!("abc")]).await.unwrap();
        assert_eq!(
            sha,
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        let b3 = api
            .call("p", "hash", vec![json!("abc"), json!("blake3")])
            .await
            .unwrap();
        assert_eq!(b3, json!(blake3::hash(b"abc").to_hex().to_string()));
        assert!(api.call("p", "hash", vec![json!("abc"), json!("md5")]).await.is_err());
    }

    #[tokio::test]
    async fn test_hmac_depends_on_key() {
        let (_, api) = api();
        let a = api.call("p", "hmac", vec![json!("k1"), json!("data")]).await.unwrap();
        let b = api.call("p", "hmac", vec![json!("k2"), json!("data")]).await.unwrap();
        let again = api.call("q", "hmac", vec![json!("k1"), json!("data")]).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a, again);
    }

    #[tokio::test]
    async fn test_encrypt_roundtrip_is_per_plugin() {
        let (store, api) = api();
        let sealed = api.call("p", "encrypt", vec![json!("secret")]).await.unwrap();
        assert!(store.get(MASTER_KEY).await.unwrap().is_some());

        let opened = api.call("p", "decrypt", vec![sealed.clone()]).await.unwrap();
        assert_eq!(opened, json!("secret"));

        assert!(api.call("q", "decrypt", vec![sealed]).await.is_err());
    }

    #[tokio::test]
    async fn test_master_key_survives_restart() {
        let (store, api) = api();
        let sealed = api.call("p", "encrypt", vec![json!("kept")]).await.unwrap();

        let reopened = CryptoApi::new(store);
        assert_eq!(
            reopened.call("p", "decrypt", vec![sealed]).await.unwrap(),
            json!("kept")
        );
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails() {
        let (_, api) = api();
        let mut sealed = api.call("p", "encrypt", vec![json!("secret")]).await.unwrap();
        let ct = sealed["ciphertext"].as_str().unwrap().to_string();
        let flipped = if ct.starts_with('0') { "1" } else { "0" };
        sealed["ciphertext"] = json!(format!("{}{}", flipped, &ct[1..]));
        assert!(api.call("p", "decrypt", vec![sealed]).await.is_err());
    }
}
