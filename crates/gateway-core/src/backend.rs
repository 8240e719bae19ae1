use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::BackendError;
use crate::handle::Resolver;
use crate::request::{
    CipherArgs, DigestArgs, ExportArgs, ExportedKey, KeyDescriptor, KeyLookupArgs,
};
use crate::session::CallerId;

/// Per-session context handed to the backend alongside each request.
#[derive(Debug, Clone)]
pub struct SessionContext {
    caller: CallerId,
    active: Arc<AtomicBool>,
}

impl SessionContext {
    pub(crate) fn new(caller: CallerId, active: Arc<AtomicBool>) -> Self {
        Self { caller, active }
    }

    pub fn caller(&self) -> CallerId {
        self.caller
    }

    /// False once the owning session has been torn down. Backends check this
    /// before reporting into a handle.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// The privileged side of the boundary.
///
/// Every operation must return quickly and do its work elsewhere. Exactly one
/// of `resolve` / `reject` is eventually called on the resolver, from a thread
/// or task other than the caller's. An `Err` return means the request could
/// not be dispatched at all; the gateway fails the handle with it.
pub trait CryptoBackend: Send + Sync {
    fn decrypt(
        &self,
        args: CipherArgs,
        resolver: Resolver<Vec<u8>>,
        ctx: &SessionContext,
    ) -> Result<(), BackendError>;

    fn sign(
        &self,
        args: CipherArgs,
        resolver: Resolver<Vec<u8>>,
        ctx: &SessionContext,
    ) -> Result<(), BackendError>;

    fn export_key(
        &self,
        args: ExportArgs,
        resolver: Resolver<ExportedKey>,
        ctx: &SessionContext,
    ) -> Result<(), BackendError>;

    fn get_key_by_name(
        &self,
        args: KeyLookupArgs,
        resolver: Resolver<KeyDescriptor>,
        ctx: &SessionContext,
    ) -> Result<(), BackendError>;

    /// Hex-encoded SHA-256 of the plaintext.
    fn digest(
        &self,
        args: DigestArgs,
        resolver: Resolver<String>,
        ctx: &SessionContext,
    ) -> Result<(), BackendError>;

    /// Stop accepting work. Called exactly once, on session teardown.
    fn shutdown(&self);
}
