use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::backend::{CryptoBackend, SessionContext};
use crate::error::{BackendError, OperationError, ValidationError};
use crate::exposure::ExposedApi;
use crate::handle::{Resolver, ResultHandle};
use crate::request::{ExportedKey, KeyDescriptor, NormalizedArgs, OperationKind};
use crate::session::{
    CallerContext, CallerId, Session, SessionPhase, TeardownListener, TeardownSource,
};
use crate::validator;

/// Binds one caller session to one backend and runs every request through
/// validation before it reaches that backend.
///
/// Callers never see this type; they get the `ExposedApi` built at init.
pub struct Gateway {
    session: Session,
    exposure: Mutex<Option<ExposedApi>>,
}

impl Gateway {
    /// Creates the session, subscribes it for teardown and builds a fresh
    /// exposure object. Fails if `caller` already has an active session.
    pub fn init(
        caller: CallerContext,
        backend: Box<dyn CryptoBackend>,
        teardown: Arc<dyn TeardownSource>,
    ) -> Result<Arc<Gateway>, OperationError> {
        let gateway = Arc::new(Gateway {
            session: Session::new(caller, backend, teardown),
            exposure: Mutex::new(None),
        });
        let weak = Arc::downgrade(&gateway);
        // Stored before activation so a teardown racing with init clears it.
        *gateway.exposure.lock() = Some(ExposedApi::build(weak.clone()));
        let listener: Weak<dyn TeardownListener> = weak;
        if let Err(err) = gateway.session.activate(listener) {
            gateway.exposure.lock().take();
            return Err(err.into());
        }
        Ok(gateway)
    }

    /// The caller-visible object for this session. `None` once terminated.
    pub fn exposed(&self) -> Option<ExposedApi> {
        self.exposure.lock().clone()
    }

    pub fn caller(&self) -> CallerId {
        self.session.caller()
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    fn terminate(&self) -> bool {
        if !self.session.terminate() {
            return false;
        }
        self.exposure.lock().take();
        true
    }

    /// Lifecycle check, then validation.
    fn admit(
        &self,
        kind: OperationKind,
        args: &[Value],
    ) -> Result<(Arc<dyn CryptoBackend>, NormalizedArgs), OperationError> {
        let caller = self.session.caller();
        let backend = self.session.backend().map_err(|err| {
            warn!(%caller, op = %kind, error = %err, "call on inactive session");
            err
        })?;
        let args = validator::validate(kind, args).map_err(|err| {
            debug!(%caller, op = %kind, error = %err, "rejected at boundary");
            err
        })?;
        Ok((backend, args))
    }

    /// Shared request pipeline: admit, then hand the normalized arguments to
    /// `call` together with a fresh resolver.
    fn dispatch<T, D>(&self, kind: OperationKind, args: &[Value], call: D) -> ResultHandle<T>
    where
        D: FnOnce(&dyn CryptoBackend, NormalizedArgs, Resolver<T>, &SessionContext) -> Result<(), BackendError>,
    {
        let (backend, args) = match self.admit(kind, args) {
            Ok(admitted) => admitted,
            Err(err) => return ResultHandle::failed(err),
        };
        let caller = self.session.caller();
        let (handle, resolver) = ResultHandle::pending();
        let ctx = self.session.context();
        if let Err(err) = call(backend.as_ref(), args, resolver.clone(), &ctx) {
            warn!(%caller, op = %kind, error = %err, "backend dispatch failed");
            resolver.reject(err);
        } else {
            debug!(%caller, op = %kind, "dispatched");
        }
        handle
    }

    pub(crate) fn decrypt(&self, args: &[Value]) -> ResultHandle<Vec<u8>> {
        self.dispatch(OperationKind::Decrypt, args, |backend, args, resolver, ctx| match args {
            NormalizedArgs::Decrypt(args) => backend.decrypt(args, resolver, ctx),
            other => Err(mismatched(OperationKind::Decrypt, &other)),
        })
    }

    pub(crate) fn sign(&self, args: &[Value]) -> ResultHandle<Vec<u8>> {
        self.dispatch(OperationKind::Sign, args, |backend, args, resolver, ctx| match args {
            NormalizedArgs::Sign(args) => backend.sign(args, resolver, ctx),
            other => Err(mismatched(OperationKind::Sign, &other)),
        })
    }

    pub(crate) fn export_key(&self, args: &[Value]) -> ResultHandle<ExportedKey> {
        self.dispatch(OperationKind::ExportKey, args, |backend, args, resolver, ctx| match args {
            NormalizedArgs::ExportKey(args) => backend.export_key(args, resolver, ctx),
            other => Err(mismatched(OperationKind::ExportKey, &other)),
        })
    }

    pub(crate) fn get_key_by_name(&self, args: &[Value]) -> ResultHandle<KeyDescriptor> {
        self.dispatch(OperationKind::GetKeyByName, args, |backend, args, resolver, ctx| match args {
            NormalizedArgs::GetKeyByName(args) => backend.get_key_by_name(args, resolver, ctx),
            other => Err(mismatched(OperationKind::GetKeyByName, &other)),
        })
    }

    /// Legacy callback-style digest. Bad arguments, a dead session and a
    /// failed dispatch are reported synchronously; everything after that
    /// goes through `callback`, exactly once.
    pub(crate) fn digest<F>(&self, args: &[Value], callback: Option<F>) -> Result<(), OperationError>
    where
        F: FnOnce(Result<String, OperationError>) + Send + 'static,
    {
        let caller = self.session.caller();
        let (backend, args) = self.admit(OperationKind::Digest, args)?;
        let args = match args {
            NormalizedArgs::Digest(args) => args,
            other => return Err(mismatched(OperationKind::Digest, &other).into()),
        };
        let callback = callback.ok_or(ValidationError::InvalidArgumentType {
            argument: "callback",
            expected: "a function",
        })?;

        let (handle, resolver) = ResultHandle::<String>::pending();
        backend
            .digest(args, resolver, &self.session.context())
            .map_err(|err| {
                warn!(%caller, op = %OperationKind::Digest, error = %err, "backend dispatch failed");
                err
            })?;

        let callback = Arc::new(Mutex::new(Some(callback)));
        let on_err = callback.clone();
        handle
            .on_success(move |digest| {
                if let Some(cb) = callback.lock().take() {
                    cb(Ok(digest.clone()));
                }
            })
            .on_failure(move |err| {
                if let Some(cb) = on_err.lock().take() {
                    cb(Err(err.clone()));
                }
            });
        Ok(())
    }
}

fn mismatched(kind: OperationKind, args: &NormalizedArgs) -> BackendError {
    BackendError::new(format!("{kind} cannot take {} arguments", args.kind()))
}

impl TeardownListener for Gateway {
    fn on_teardown(&self, caller: CallerId) {
        if caller != self.session.caller() {
            return;
        }
        if self.terminate() {
            info!(%caller, "gateway released on caller teardown");
        }
    }
}
