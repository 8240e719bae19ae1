use anyhow::Result;
use gateway_core::{
    CallerContext, CallerId, Gateway, GatewaySettings, KeyStore, SoftToken, TeardownSignals,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Process-wide state shared by every connection: the key store, the
/// teardown hub and the caller id counter. Sessions themselves are owned by
/// their connections.
pub struct GatewayHost {
    keys: Arc<KeyStore>,
    signals: Arc<TeardownSignals>,
    next_caller: AtomicU64,
}

impl GatewayHost {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self {
            keys,
            signals: Arc::new(TeardownSignals::new()),
            next_caller: AtomicU64::new(1),
        }
    }

    pub fn from_settings(settings: &GatewaySettings) -> Result<Self> {
        settings.validate()?;
        let keys = KeyStore::from_settings(&settings.soft_token)?;
        Ok(Self::new(Arc::new(keys)))
    }

    pub fn signals(&self) -> &Arc<TeardownSignals> {
        &self.signals
    }

    pub fn next_caller(&self) -> CallerId {
        CallerId::new(self.next_caller.fetch_add(1, Ordering::Relaxed))
    }

    /// Starts a soft token for `caller` and binds a gateway session to it.
    pub fn open_session(&self, caller: CallerContext) -> Result<Arc<Gateway>> {
        let token = SoftToken::start(self.keys.clone())?;
        let id = caller.id;
        let gateway = Gateway::init(caller, Box::new(token), self.signals.clone())?;
        debug!(caller = %id, "gateway session opened");
        Ok(gateway)
    }

    pub fn active_sessions(&self) -> usize {
        self.signals.subscriber_count()
    }
}
