use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::request::{
    Algorithm, CipherArgs, DigestArgs, ExportArgs, KeyId, KeyLookupArgs, KeyReference,
    NormalizedArgs, OperationKind,
};

pub const KEY_ID_FIELD: &str = "cs_pkcs11id";

static NULL: Value = Value::Null;

/// Validates positional arguments for `kind`. Arguments past the end of
/// `args` are treated as null.
pub fn validate(kind: OperationKind, args: &[Value]) -> Result<NormalizedArgs, ValidationError> {
    let arg = |i: usize| args.get(i).unwrap_or(&NULL);
    match kind {
        OperationKind::Decrypt => validate_cipher(arg(0), arg(1), arg(2)).map(NormalizedArgs::Decrypt),
        OperationKind::Sign => validate_cipher(arg(0), arg(1), arg(2)).map(NormalizedArgs::Sign),
        OperationKind::ExportKey => validate_export(arg(0), arg(1)).map(NormalizedArgs::ExportKey),
        OperationKind::GetKeyByName => validate_lookup(arg(0)).map(NormalizedArgs::GetKeyByName),
        OperationKind::Digest => validate_plaintext(arg(0)).map(NormalizedArgs::Digest),
    }
}

/// `decrypt` and `sign` share one shape: algorithm, key, data, checked in
/// that order.
pub fn validate_cipher(
    algorithm: &Value,
    key: &Value,
    data: &Value,
) -> Result<CipherArgs, ValidationError> {
    Ok(CipherArgs {
        algorithm: validate_algorithm(algorithm)?,
        key: validate_key(key)?,
        data: validate_payload(data)?,
    })
}

pub fn validate_export(format: &Value, key: &Value) -> Result<ExportArgs, ValidationError> {
    let format = format
        .as_str()
        .ok_or(ValidationError::InvalidArgumentType {
            argument: "format",
            expected: "a string",
        })?
        .to_string();
    Ok(ExportArgs {
        format,
        key: validate_key(key)?,
    })
}

pub fn validate_lookup(name: &Value) -> Result<KeyLookupArgs, ValidationError> {
    match name {
        Value::Null => Ok(KeyLookupArgs { name: None }),
        Value::String(s) => Ok(KeyLookupArgs {
            name: Some(s.clone()),
        }),
        _ => Err(ValidationError::InvalidArgumentType {
            argument: "name",
            expected: "a string or null",
        }),
    }
}

pub fn validate_plaintext(plaintext: &Value) -> Result<DigestArgs, ValidationError> {
    match plaintext {
        Value::String(s) => Ok(DigestArgs {
            plaintext: s.clone(),
        }),
        _ => Err(ValidationError::InvalidArgumentType {
            argument: "plaintext",
            expected: "a string",
        }),
    }
}

pub fn validate_algorithm(algorithm: &Value) -> Result<Algorithm, ValidationError> {
    let obj = algorithm
        .as_object()
        .ok_or(ValidationError::MissingAlgorithmName)?;
    let name = match obj.get("name") {
        Some(Value::String(name)) if !name.is_empty() => name.clone(),
        _ => return Err(ValidationError::MissingAlgorithmName),
    };
    let params: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| k.as_str() != "name")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(Algorithm { name, params })
}

pub fn validate_key(key: &Value) -> Result<KeyReference, ValidationError> {
    let obj = key.as_object().ok_or(ValidationError::InvalidKeyReference)?;
    let id = match obj.get(KEY_ID_FIELD) {
        Some(Value::String(s)) if !s.is_empty() => KeyId::new(s.clone()),
        Some(Value::Number(n)) => KeyId::new(n.to_string()),
        _ => return Err(ValidationError::InvalidKeyReference),
    };
    let attributes: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| k.as_str() != KEY_ID_FIELD)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(KeyReference { id, attributes })
}

pub fn validate_payload(data: &Value) -> Result<Vec<u8>, ValidationError> {
    match data {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or(ValidationError::MissingPayload)
            })
            .collect(),
        _ => Err(ValidationError::MissingPayload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn algorithm_requires_non_empty_name() {
        assert!(validate_algorithm(&json!({"name": "Ed25519"})).is_ok());
        for bad in [
            json!(null),
            json!("Ed25519"),
            json!({}),
            json!({"name": ""}),
            json!({"name": 7}),
            json!({"name": null}),
        ] {
            assert_eq!(
                validate_algorithm(&bad).unwrap_err(),
                ValidationError::MissingAlgorithmName,
                "{bad}"
            );
        }
    }

    #[test]
    fn algorithm_params_are_kept() {
        let algo = validate_algorithm(&json!({"name": "XChaCha20-Poly1305", "iv": [1, 2]})).unwrap();
        assert_eq!(algo.name, "XChaCha20-Poly1305");
        assert_eq!(algo.param("iv"), Some(&json!([1, 2])));
        assert!(algo.param("name").is_none());
    }

    #[test]
    fn key_requires_backend_id() {
        let key = validate_key(&json!({"cs_pkcs11id": "slot1:0", "type": "private"})).unwrap();
        assert_eq!(key.id.as_str(), "slot1:0");
        assert_eq!(key.attributes.get("type"), Some(&json!("private")));
        assert_eq!(validate_key(&json!({"cs_pkcs11id": 42})).unwrap().id.as_str(), "42");

        for bad in [
            json!(null),
            json!("slot1"),
            json!({}),
            json!({"cs_pkcs11id": null}),
            json!({"cs_pkcs11id": ""}),
            json!({"cs_pkcs11id": true}),
            json!({"cs_pkcs11id": {"nested": 1}}),
        ] {
            assert_eq!(
                validate_key(&bad).unwrap_err(),
                ValidationError::InvalidKeyReference,
                "{bad}"
            );
        }
    }

    #[test]
    fn payload_must_be_bytes() {
        assert_eq!(validate_payload(&json!([1, 2, 255])).unwrap(), vec![1, 2, 255]);
        assert_eq!(validate_payload(&json!("hi")).unwrap(), b"hi".to_vec());
        assert_eq!(validate_payload(&json!([])).unwrap(), Vec::<u8>::new());
        for bad in [json!(null), json!([256]), json!([-1]), json!([1.5]), json!({"0": 1}), json!(false)] {
            assert_eq!(validate_payload(&bad).unwrap_err(), ValidationError::MissingPayload, "{bad}");
        }
    }

    #[test]
    fn cipher_checks_run_in_argument_order() {
        let err = validate_cipher(&json!(null), &json!(null), &json!(null)).unwrap_err();
        assert_eq!(err, ValidationError::MissingAlgorithmName);
        let err = validate_cipher(&json!({"name": "Ed25519"}), &json!(null), &json!(null)).unwrap_err();
        assert_eq!(err, ValidationError::InvalidKeyReference);
        let err = validate_cipher(
            &json!({"name": "Ed25519"}),
            &json!({"cs_pkcs11id": "k"}),
            &json!(null),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::MissingPayload);
    }

    #[test]
    fn lookup_accepts_null_or_string() {
        assert_eq!(validate_lookup(&json!(null)).unwrap().name, None);
        assert_eq!(
            validate_lookup(&json!("token-slot-1")).unwrap().name.as_deref(),
            Some("token-slot-1")
        );
        assert!(matches!(
            validate_lookup(&json!(3)),
            Err(ValidationError::InvalidArgumentType { argument: "name", .. })
        ));
    }

    #[test]
    fn export_format_must_be_string() {
        assert!(matches!(
            validate_export(&json!(null), &json!({"cs_pkcs11id": "k"})),
            Err(ValidationError::InvalidArgumentType { argument: "format", .. })
        ));
        assert_eq!(
            validate_export(&json!("raw"), &json!({})).unwrap_err(),
            ValidationError::InvalidKeyReference
        );
    }

    #[test]
    fn validate_dispatches_by_kind() {
        let args = [json!({"name": "Ed25519"}), json!({"cs_pkcs11id": "k"}), json!([1, 2, 3])];
        assert!(matches!(validate(OperationKind::Sign, &args), Ok(NormalizedArgs::Sign(_))));
        assert!(matches!(validate(OperationKind::Decrypt, &args), Ok(NormalizedArgs::Decrypt(_))));
        assert!(matches!(
            validate(OperationKind::GetKeyByName, &[]),
            Ok(NormalizedArgs::GetKeyByName(KeyLookupArgs { name: None }))
        ));
        assert!(matches!(
            validate(OperationKind::Digest, &[json!(1)]),
            Err(ValidationError::InvalidArgumentType { .. })
        ));
        assert_eq!(
            validate(OperationKind::Sign, &[]).unwrap_err(),
            ValidationError::MissingAlgorithmName
        );
    }
}
