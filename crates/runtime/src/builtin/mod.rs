//! Operators every worker registers at startup.

pub mod basic;
pub mod blob;

mod args;

use crate::error::RuntimeError;
use crate::operator::OperatorRegistry;

/// Register `basic_ops.*` and `storage.Blob`. Fails on the first reference
/// that is already taken.
pub fn register_all(registry: &mut OperatorRegistry) -> Result<(), RuntimeError> {
    basic::register(registry)?;
    blob::register(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::OperatorInfo;

    #[test]
    fn builtins_fill_an_empty_registry() {
        let mut registry = OperatorRegistry::new();
        register_all(&mut registry).unwrap();
        assert!(registry.contains(basic::MUL));
        assert!(registry.contains(blob::BLOB));
    }

    #[test]
    fn taken_reference_is_reported() {
        let mut registry = OperatorRegistry::new();
        registry
            .register_stateless(OperatorInfo::new(blob::BLOB, "custom"), || blob::BlobOperator)
            .unwrap();
        let err = register_all(&mut registry).unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateOperator(r) if r == blob::BLOB));
        assert_eq!(registry.describe(blob::BLOB).unwrap().description, "custom");
    }
}
