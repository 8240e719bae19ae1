use anyhow::{anyhow, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::backend::{CryptoBackend, SessionContext};
use crate::crypto::{self, SECRET_KEY_LEN, XNONCE_LEN};
use crate::error::BackendError;
use crate::handle::Resolver;
use crate::request::{
    Algorithm, CipherArgs, DigestArgs, ExportArgs, ExportedKey, KeyDescriptor, KeyId,
    KeyLookupArgs, KeyType, OperationKind,
};
use crate::settings::{SlotKind, SoftTokenSettings};
use crate::validator::validate_payload;

pub const ED25519: &str = "Ed25519";
pub const XCHACHA20_POLY1305: &str = "XChaCha20-Poly1305";

enum KeyMaterial {
    Signing(SigningKey),
    Secret(Zeroizing<[u8; SECRET_KEY_LEN]>),
}

struct TokenKey {
    descriptor: KeyDescriptor,
    material: KeyMaterial,
}

/// Keys held by the soft token. Built once, then shared read-only.
#[derive(Default)]
pub struct KeyStore {
    keys: Vec<TokenKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &SoftTokenSettings) -> Result<Self> {
        let mut store = Self::new();
        for slot in &settings.slots {
            let material = slot
                .material_hex
                .as_ref()
                .map(|material| crypto::secret_from_hex(material))
                .transpose()?;
            match slot.kind {
                SlotKind::Ed25519 => {
                    let key = match material {
                        Some(seed) => SigningKey::from_bytes(&seed),
                        None => crypto::generate_signing_key(),
                    };
                    store.add_signing_key(&slot.name, key)?;
                }
                SlotKind::Xchacha20poly1305 => {
                    let secret = material.unwrap_or_else(crypto::generate_secret);
                    store.add_secret_key(&slot.name, secret)?;
                }
            }
        }
        info!(keys = store.keys.len(), "soft token key store ready");
        Ok(store)
    }

    pub fn add_signing_key(&mut self, name: &str, key: SigningKey) -> Result<KeyDescriptor> {
        self.insert(
            name,
            KeyType::Private,
            ED25519,
            &["sign"],
            KeyMaterial::Signing(key),
        )
    }

    pub fn add_secret_key(
        &mut self,
        name: &str,
        secret: Zeroizing<[u8; SECRET_KEY_LEN]>,
    ) -> Result<KeyDescriptor> {
        self.insert(
            name,
            KeyType::Secret,
            XCHACHA20_POLY1305,
            &["decrypt"],
            KeyMaterial::Secret(secret),
        )
    }

    fn insert(
        &mut self,
        name: &str,
        key_type: KeyType,
        algorithm: &str,
        usages: &[&str],
        material: KeyMaterial,
    ) -> Result<KeyDescriptor> {
        if self.keys.iter().any(|k| k.descriptor.name == name) {
            return Err(anyhow!("duplicate key name '{name}'"));
        }
        let descriptor = KeyDescriptor {
            id: KeyId::new(format!("soft:{}", self.keys.len())),
            name: name.to_string(),
            key_type,
            algorithm: Algorithm::named(algorithm),
            usages: usages.iter().map(|u| u.to_string()).collect(),
            extractable: false,
        };
        self.keys.push(TokenKey {
            descriptor: descriptor.clone(),
            material,
        });
        Ok(descriptor)
    }

    pub fn descriptors(&self) -> Vec<KeyDescriptor> {
        self.keys.iter().map(|k| k.descriptor.clone()).collect()
    }

    pub fn verifying_key(&self, id: &KeyId) -> Option<VerifyingKey> {
        match self.find(id).ok()?.material {
            KeyMaterial::Signing(ref key) => Some(key.verifying_key()),
            KeyMaterial::Secret(_) => None,
        }
    }

    fn find(&self, id: &KeyId) -> Result<&TokenKey, BackendError> {
        self.keys
            .iter()
            .find(|k| &k.descriptor.id == id)
            .ok_or_else(|| BackendError::new(format!("no key with id '{id}'")))
    }

    fn by_name(&self, name: Option<&str>) -> Result<&TokenKey, BackendError> {
        match name {
            None => self
                .keys
                .first()
                .ok_or_else(|| BackendError::new("token holds no keys")),
            Some(name) => self
                .keys
                .iter()
                .find(|k| k.descriptor.name == name)
                .ok_or_else(|| BackendError::new(format!("no key named '{name}'"))),
        }
    }
}

fn expect_algorithm(algorithm: &Algorithm, expected: &str) -> Result<(), BackendError> {
    if algorithm.name != expected {
        return Err(BackendError::new(format!(
            "unsupported algorithm '{}'",
            algorithm.name
        )));
    }
    Ok(())
}

fn sign(keys: &KeyStore, args: &CipherArgs) -> Result<Vec<u8>, BackendError> {
    expect_algorithm(&args.algorithm, ED25519)?;
    match &keys.find(&args.key.id)?.material {
        KeyMaterial::Signing(key) => Ok(crypto::sign_bytes(key, &args.data).to_bytes().to_vec()),
        KeyMaterial::Secret(_) => Err(BackendError::new("key cannot sign")),
    }
}

fn decrypt(keys: &KeyStore, args: &CipherArgs) -> Result<Vec<u8>, BackendError> {
    expect_algorithm(&args.algorithm, XCHACHA20_POLY1305)?;
    let nonce: [u8; XNONCE_LEN] = args
        .algorithm
        .param("iv")
        .and_then(|iv| validate_payload(iv).ok())
        .and_then(|iv| iv.try_into().ok())
        .ok_or_else(|| BackendError::new(format!("algorithm 'iv' must be {XNONCE_LEN} bytes")))?;
    match &keys.find(&args.key.id)?.material {
        KeyMaterial::Secret(secret) => crypto::decrypt(&secret[..], &nonce, &args.data)
            .map_err(|_| BackendError::new("decryption failed")),
        KeyMaterial::Signing(_) => Err(BackendError::new("key cannot decrypt")),
    }
}

/// Only public halves ever leave the token.
fn export_key(keys: &KeyStore, args: &ExportArgs) -> Result<ExportedKey, BackendError> {
    let key = match &keys.find(&args.key.id)?.material {
        KeyMaterial::Signing(key) => key.verifying_key(),
        KeyMaterial::Secret(_) => return Err(BackendError::new("key is not extractable")),
    };
    match args.format.as_str() {
        "raw" => Ok(ExportedKey::Raw(key.to_bytes().to_vec())),
        "jwk" => Ok(ExportedKey::Jwk(crypto::public_jwk(&key))),
        other => Err(BackendError::new(format!("unsupported export format '{other}'"))),
    }
}

fn settle<T>(resolver: &Resolver<T>, result: Result<T, BackendError>) {
    match result {
        Ok(value) => resolver.resolve(value),
        Err(err) => resolver.reject(err),
    };
}

enum Job {
    Decrypt(CipherArgs, Resolver<Vec<u8>>),
    Sign(CipherArgs, Resolver<Vec<u8>>),
    ExportKey(ExportArgs, Resolver<ExportedKey>),
    GetKeyByName(KeyLookupArgs, Resolver<KeyDescriptor>),
    Digest(DigestArgs, Resolver<String>),
}

impl Job {
    fn kind(&self) -> OperationKind {
        match self {
            Job::Decrypt(..) => OperationKind::Decrypt,
            Job::Sign(..) => OperationKind::Sign,
            Job::ExportKey(..) => OperationKind::ExportKey,
            Job::GetKeyByName(..) => OperationKind::GetKeyByName,
            Job::Digest(..) => OperationKind::Digest,
        }
    }

    fn run(self, keys: &KeyStore) {
        match self {
            Job::Decrypt(args, r) => settle(&r, decrypt(keys, &args)),
            Job::Sign(args, r) => settle(&r, sign(keys, &args)),
            Job::ExportKey(args, r) => settle(&r, export_key(keys, &args)),
            Job::GetKeyByName(args, r) => settle(
                &r,
                keys.by_name(args.name.as_deref())
                    .map(|k| k.descriptor.clone()),
            ),
            Job::Digest(args, r) => settle(&r, Ok(crypto::sha256_hex(args.plaintext.as_bytes()))),
        }
    }

    fn reject(self, err: BackendError) {
        match self {
            Job::Decrypt(_, r) | Job::Sign(_, r) => settle(&r, Err(err)),
            Job::ExportKey(_, r) => settle(&r, Err(err)),
            Job::GetKeyByName(_, r) => settle(&r, Err(err)),
            Job::Digest(_, r) => settle(&r, Err(err)),
        }
    }
}

struct Envelope {
    job: Job,
    ctx: SessionContext,
}

/// Software `CryptoBackend`. One per session.
pub struct SoftToken {
    jobs: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    closed: Arc<AtomicBool>,
}

impl SoftToken {
    /// Starts the worker on the current tokio runtime.
    pub fn start(keys: Arc<KeyStore>) -> Result<Self, BackendError> {
        let runtime = Handle::try_current()
            .map_err(|e| BackendError::new(format!("soft token needs a tokio runtime: {e}")))?;
        Ok(Self::start_on(keys, &runtime))
    }

    pub fn start_on(keys: Arc<KeyStore>, runtime: &Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        runtime.spawn(run_worker(keys, rx, closed.clone()));
        Self {
            jobs: Mutex::new(Some(tx)),
            closed,
        }
    }

    fn submit(&self, job: Job, ctx: &SessionContext) -> Result<(), BackendError> {
        let envelope = Envelope {
            job,
            ctx: ctx.clone(),
        };
        let unsent = match self.jobs.lock().as_ref() {
            Some(tx) => tx.send(envelope).err().map(|e| e.0),
            None => Some(envelope),
        };
        match unsent {
            None => Ok(()),
            Some(_) => Err(BackendError::new("token shut down")),
        }
    }
}

async fn run_worker(
    keys: Arc<KeyStore>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    closed: Arc<AtomicBool>,
) {
    while let Some(Envelope { job, ctx }) = rx.recv().await {
        if closed.load(Ordering::Acquire) || !ctx.is_active() {
            job.reject(BackendError::new("token shut down"));
            continue;
        }
        let keys = keys.clone();
        tokio::task::spawn_blocking(move || {
            debug!(caller = %ctx.caller(), op = %job.kind(), "soft token job");
            job.run(&keys);
        });
    }
    debug!("soft token worker stopped");
}

impl CryptoBackend for SoftToken {
    fn decrypt(
        &self,
        args: CipherArgs,
        resolver: Resolver<Vec<u8>>,
        ctx: &SessionContext,
    ) -> Result<(), BackendError> {
        self.submit(Job::Decrypt(args, resolver), ctx)
    }

    fn sign(
        &self,
        args: CipherArgs,
        resolver: Resolver<Vec<u8>>,
        ctx: &SessionContext,
    ) -> Result<(), BackendError> {
        self.submit(Job::Sign(args, resolver), ctx)
    }

    fn export_key(
        &self,
        args: ExportArgs,
        resolver: Resolver<ExportedKey>,
        ctx: &SessionContext,
    ) -> Result<(), BackendError> {
        self.submit(Job::ExportKey(args, resolver), ctx)
    }

    fn get_key_by_name(
        &self,
        args: KeyLookupArgs,
        resolver: Resolver<KeyDescriptor>,
        ctx: &SessionContext,
    ) -> Result<(), BackendError> {
        self.submit(Job::GetKeyByName(args, resolver), ctx)
    }

    fn digest(
        &self,
        args: DigestArgs,
        resolver: Resolver<String>,
        ctx: &SessionContext,
    ) -> Result<(), BackendError> {
        self.submit(Job::Digest(args, resolver), ctx)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.jobs.lock().take();
        info!("soft token shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ResultHandle;
    use crate::request::KeyReference;
    use crate::session::CallerId;
    use serde_json::{json, Map};

    fn ctx() -> SessionContext {
        SessionContext::new(CallerId::new(1), Arc::new(AtomicBool::new(true)))
    }

    fn key_ref(descriptor: &KeyDescriptor) -> KeyReference {
        KeyReference {
            id: descriptor.id.clone(),
            attributes: Map::new(),
        }
    }

    #[tokio::test]
    async fn signatures_verify_against_exported_key() {
        let mut store = KeyStore::new();
        let desc = store
            .add_signing_key("token-slot-1", crypto::generate_signing_key())
            .unwrap();
        let token = SoftToken::start(Arc::new(store)).unwrap();

        let (signed, r) = ResultHandle::pending();
        token
            .sign(
                CipherArgs {
                    algorithm: Algorithm::named(ED25519),
                    key: key_ref(&desc),
                    data: b"hello".to_vec(),
                },
                r,
                &ctx(),
            )
            .unwrap();
        let sig = signed.completion().await.unwrap();

        let (exported, r) = ResultHandle::pending();
        token
            .export_key(
                ExportArgs {
                    format: "raw".into(),
                    key: key_ref(&desc),
                },
                r,
                &ctx(),
            )
            .unwrap();
        let public = match exported.completion().await.unwrap().as_ref() {
            ExportedKey::Raw(bytes) => bytes.clone(),
            other => panic!("unexpected export {other:?}"),
        };

        let public: [u8; 32] = public.try_into().unwrap();
        let verifying = VerifyingKey::from_bytes(&public).unwrap();
        let sig: [u8; 64] = sig.as_slice().try_into().unwrap();
        crypto::verify_signature(&verifying, b"hello", &ed25519_dalek::Signature::from_bytes(&sig))
            .unwrap();
    }

    #[tokio::test]
    async fn decrypt_round_trips_with_iv_param() {
        let secret = crypto::generate_secret();
        let nonce = crypto::generate_nonce();
        let ciphertext = crypto::encrypt(&secret[..], &nonce, b"attack at dawn").unwrap();

        let mut store = KeyStore::new();
        let desc = store.add_secret_key("vault", secret).unwrap();
        let token = SoftToken::start(Arc::new(store)).unwrap();

        let mut algorithm = Algorithm::named(XCHACHA20_POLY1305);
        algorithm.params.insert("iv".into(), json!(nonce.to_vec()));
        let (handle, r) = ResultHandle::pending();
        token
            .decrypt(
                CipherArgs {
                    algorithm,
                    key: key_ref(&desc),
                    data: ciphertext,
                },
                r,
                &ctx(),
            )
            .unwrap();
        assert_eq!(handle.completion().await.unwrap().as_slice(), b"attack at dawn");
    }

    #[tokio::test]
    async fn secret_keys_are_not_exported() {
        let mut store = KeyStore::new();
        let desc = store.add_secret_key("vault", crypto::generate_secret()).unwrap();
        let token = SoftToken::start(Arc::new(store)).unwrap();

        let (handle, r) = ResultHandle::pending();
        token
            .export_key(
                ExportArgs {
                    format: "raw".into(),
                    key: key_ref(&desc),
                },
                r,
                &ctx(),
            )
            .unwrap();
        let err = handle.completion().await.unwrap_err();
        assert_eq!(err.to_string(), "key is not extractable");
    }

    #[tokio::test]
    async fn lookup_defaults_to_first_slot() {
        let mut store = KeyStore::new();
        let first = store.add_signing_key("a", crypto::generate_signing_key()).unwrap();
        store.add_signing_key("b", crypto::generate_signing_key()).unwrap();
        let token = SoftToken::start(Arc::new(store)).unwrap();

        let (handle, r) = ResultHandle::pending();
        token
            .get_key_by_name(KeyLookupArgs { name: None }, r, &ctx())
            .unwrap();
        assert_eq!(*handle.completion().await.unwrap(), first);

        let (missing, r) = ResultHandle::pending();
        token
            .get_key_by_name(KeyLookupArgs { name: Some("zz".into()) }, r, &ctx())
            .unwrap();
        assert!(missing.completion().await.is_err());
    }

    #[tokio::test]
    async fn jobs_after_shutdown_are_refused() {
        let token = SoftToken::start(Arc::new(KeyStore::new())).unwrap();
        token.shutdown();
        let (handle, r) = ResultHandle::<String>::pending();
        let err = token
            .digest(DigestArgs { plaintext: "x".into() }, r, &ctx())
            .unwrap_err();
        assert_eq!(err.message(), "token shut down");
        // the resolver went down with the refused job
        assert!(handle.completion().await.is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut store = KeyStore::new();
        store.add_signing_key("a", crypto::generate_signing_key()).unwrap();
        assert!(store.add_secret_key("a", crypto::generate_secret()).is_err());
    }

    #[test]
    fn settings_material_is_used_as_seed() {
        let settings = SoftTokenSettings {
            slots: vec![crate::settings::SlotSettings {
                name: "fixed".into(),
                kind: SlotKind::Ed25519,
                material_hex: Some(Zeroizing::new("07".repeat(32))),
            }],
        };
        let a = KeyStore::from_settings(&settings).unwrap();
        let b = KeyStore::from_settings(&settings).unwrap();
        let id = a.descriptors()[0].id.clone();
        assert_eq!(a.verifying_key(&id), b.verifying_key(&id));
    }
}
