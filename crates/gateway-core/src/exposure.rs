use serde_json::{json, Value};
use std::sync::{Arc, Weak};

use crate::error::{InvokeError, LifecycleError, OperationError};
use crate::gateway::Gateway;
use crate::handle::ResultHandle;
use crate::request::{ExportedKey, KeyDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    Decrypt,
    ExportKey,
    Sign,
    GetKeyByName,
    Digest,
}

/// Every member path reachable from the caller side.
pub const MEMBERS: [(&str, Member); 5] = [
    ("crypto.subtle.decrypt", Member::Decrypt),
    ("crypto.subtle.exportKey", Member::ExportKey),
    ("crypto.subtle.sign", Member::Sign),
    ("cryptokeys.getKeyByName", Member::GetKeyByName),
    ("digest", Member::Digest),
];

impl Member {
    pub fn from_path(path: &str) -> Option<Member> {
        MEMBERS
            .iter()
            .find(|(name, _)| *name == path)
            .map(|(_, member)| *member)
    }

    pub fn path(self) -> &'static str {
        MEMBERS
            .iter()
            .find(|(_, member)| *member == self)
            .map(|(name, _)| *name)
            .unwrap_or_default()
    }
}

pub fn member_paths() -> Vec<&'static str> {
    MEMBERS.iter().map(|(name, _)| *name).collect()
}

fn upgrade(gateway: &Weak<Gateway>) -> Result<Arc<Gateway>, LifecycleError> {
    gateway.upgrade().ok_or(LifecycleError::Terminated)
}

fn call<T, F>(gateway: &Weak<Gateway>, f: F) -> ResultHandle<T>
where
    F: FnOnce(&Gateway) -> ResultHandle<T>,
{
    match upgrade(gateway) {
        Ok(gateway) => f(&gateway),
        Err(err) => ResultHandle::failed(err),
    }
}

#[derive(Clone)]
pub struct SubtleView {
    gateway: Weak<Gateway>,
}

impl SubtleView {
    pub fn decrypt(&self, algorithm: &Value, key: &Value, data: &Value) -> ResultHandle<Vec<u8>> {
        let args = [algorithm.clone(), key.clone(), data.clone()];
        call(&self.gateway, |gateway| gateway.decrypt(&args))
    }

    pub fn sign(&self, algorithm: &Value, key: &Value, data: &Value) -> ResultHandle<Vec<u8>> {
        let args = [algorithm.clone(), key.clone(), data.clone()];
        call(&self.gateway, |gateway| gateway.sign(&args))
    }

    pub fn export_key(&self, format: &Value, key: &Value) -> ResultHandle<ExportedKey> {
        let args = [format.clone(), key.clone()];
        call(&self.gateway, |gateway| gateway.export_key(&args))
    }
}

#[derive(Clone)]
pub struct CryptoView {
    pub subtle: SubtleView,
}

#[derive(Clone)]
pub struct CryptoKeysView {
    gateway: Weak<Gateway>,
}

impl CryptoKeysView {
    /// `name` may be null for the backend's default key.
    pub fn get_key_by_name(&self, name: &Value) -> ResultHandle<KeyDescriptor> {
        call(&self.gateway, |gateway| {
            gateway.get_key_by_name(std::slice::from_ref(name))
        })
    }
}

/// Root of the caller-visible object. Rebuilt for every session.
#[derive(Clone)]
pub struct ExposedApi {
    pub crypto: CryptoView,
    pub cryptokeys: CryptoKeysView,
    gateway: Weak<Gateway>,
}

impl ExposedApi {
    pub(crate) fn build(gateway: Weak<Gateway>) -> Self {
        Self {
            crypto: CryptoView {
                subtle: SubtleView {
                    gateway: gateway.clone(),
                },
            },
            cryptokeys: CryptoKeysView {
                gateway: gateway.clone(),
            },
            gateway,
        }
    }

    /// Hex SHA-256 of `plaintext`, delivered to `callback`. Fails
    /// synchronously on a non-string plaintext, a missing callback or a dead
    /// session.
    pub fn digest<F>(&self, plaintext: &Value, callback: Option<F>) -> Result<(), OperationError>
    where
        F: FnOnce(Result<String, OperationError>) + Send + 'static,
    {
        upgrade(&self.gateway)?.digest(std::slice::from_ref(plaintext), callback)
    }

    /// Calls an allow-listed member by path with JSON arguments. Success
    /// payloads come back as JSON.
    pub fn invoke(&self, path: &str, args: &[Value]) -> Result<ResultHandle<Value>, InvokeError> {
        let member =
            Member::from_path(path).ok_or_else(|| InvokeError::UnknownMember(path.to_string()))?;
        let handle = match member {
            Member::Decrypt => {
                call(&self.gateway, |gateway| gateway.decrypt(args)).map(|bytes| json!(bytes))
            }
            Member::Sign => {
                call(&self.gateway, |gateway| gateway.sign(args)).map(|bytes| json!(bytes))
            }
            Member::ExportKey => call(&self.gateway, |gateway| gateway.export_key(args))
                .map(|key| serde_json::to_value(key).unwrap_or(Value::Null)),
            Member::GetKeyByName => call(&self.gateway, |gateway| gateway.get_key_by_name(args))
                .map(KeyDescriptor::to_value),
            Member::Digest => {
                let (handle, resolver) = ResultHandle::pending();
                upgrade(&self.gateway)
                    .map_err(OperationError::from)?
                    .digest(
                        args,
                        Some(move |res: Result<String, OperationError>| match res {
                            Ok(hex) => {
                                resolver.resolve(Value::String(hex));
                            }
                            Err(err) => {
                                resolver.reject(err);
                            }
                        }),
                    )?;
                handle
            }
        };
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_table_round_trips() {
        for (path, member) in MEMBERS {
            assert_eq!(Member::from_path(path), Some(member));
            assert_eq!(member.path(), path);
        }
    }

    #[test]
    fn unlisted_paths_resolve_to_nothing() {
        for path in [
            "",
            "crypto",
            "crypto.subtle",
            "crypto.subtle.encrypt",
            "crypto.subtle.generateKey",
            "cryptokeys.getKeyByName.call",
            "shutdown",
            "SHA256",
        ] {
            assert_eq!(Member::from_path(path), None, "{path}");
        }
    }

    #[test]
    fn dead_views_fail_with_lifecycle_error() {
        let api = ExposedApi::build(Weak::new());
        let handle = api.cryptokeys.get_key_by_name(&Value::Null);
        assert_eq!(
            handle.outcome().unwrap().unwrap_err(),
            OperationError::Lifecycle(LifecycleError::Terminated)
        );
        let res = api.digest(&json!("abc"), Some(|_: Result<String, OperationError>| {}));
        assert_eq!(res, Err(OperationError::Lifecycle(LifecycleError::Terminated)));
    }
}
