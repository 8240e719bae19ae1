//! Capability gateway between an untrusted caller and a privileged crypto token.

pub mod backend;
pub mod crypto;
pub mod error;
pub mod exposure;
pub mod gateway;
pub mod handle;
pub mod paths;
pub mod request;
pub mod session;
pub mod settings;
pub mod soft_token;
pub mod validator;

pub use backend::{CryptoBackend, SessionContext};
pub use error::{
    BackendError, ErrorView, InvokeError, LifecycleError, OperationError, ValidationError,
};
pub use exposure::{ExposedApi, Member, MEMBERS};
pub use gateway::Gateway;
pub use handle::{HandleState, Resolver, ResultHandle};
pub use request::{ExportedKey, KeyDescriptor, KeyId, OperationKind};
pub use session::{CallerContext, CallerId, SessionPhase, TeardownSignals, TeardownSource};
pub use settings::GatewaySettings;
pub use soft_token::{KeyStore, SoftToken};
