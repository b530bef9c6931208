use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::{Device, DispatchKey, DispatchKeyError, DispatchKeySet};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Minimal tensor stand-in carried on boxed stacks: the payload, the backend
/// it lives on, and the id of the dynamic layer that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    id: u64,
    data: Vec<f64>,
    backend: DispatchKey,
    level: Option<i64>,
}

impl TensorValue {
    pub fn new(data: Vec<f64>, backend: DispatchKey) -> Result<Self, DispatchKeyError> {
        if backend == DispatchKey::Undefined {
            return Err(DispatchKeyError::UndefinedKey);
        }
        if !backend.is_backend() {
            return Err(DispatchKeyError::NotABackendKey(backend));
        }
        Ok(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            data,
            backend,
            level: None,
        })
    }

    #[must_use]
    pub fn cpu(data: Vec<f64>) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            data,
            backend: DispatchKey::CPU,
            level: None,
        }
    }

    #[must_use]
    pub fn cuda(data: Vec<f64>) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            data,
            backend: DispatchKey::CUDA,
            level: None,
        }
    }

    /// A fresh tensor on the same backend and level holding `data`.
    #[must_use]
    pub fn with_data(&self, data: Vec<f64>) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            data,
            backend: self.backend,
            level: self.level,
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: i64) -> Self {
        self.level = Some(level);
        self
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[must_use]
    pub fn backend(&self) -> DispatchKey {
        self.backend
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.backend.device().unwrap_or(Device::Cpu)
    }

    #[must_use]
    pub fn level(&self) -> Option<i64> {
        self.level
    }

    /// Backend key plus the autograd key of the tensor's device.
    #[must_use]
    pub fn key_set(&self) -> DispatchKeySet {
        DispatchKeySet::EMPTY
            .with(self.backend)
            .with(self.device().autograd_key())
    }

    #[must_use]
    pub fn evidence_fingerprint64(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.id.hash(&mut hasher);
        self.backend.hash(&mut hasher);
        self.level.hash(&mut hasher);
        for value in &self.data {
            value.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Largest integer magnitude a float holds exactly.
pub const MAX_EXACT_DOUBLE_INT: u64 = 1 << 53;

/// Dynamically typed entry of a boxed stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IValue {
    None,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Tensor(TensorValue),
    List(Vec<IValue>),
}

impl IValue {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Double(_) => "float",
            Self::Str(_) => "str",
            Self::Tensor(_) => "Tensor",
            Self::List(_) => "List",
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_tensor(self) -> Option<TensorValue> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Ints widen only while every value in range maps to a distinct
    /// float, i.e. `|value| <= 2^53`.
    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(value) => Some(*value),
            Self::Int(value) if value.unsigned_abs() <= MAX_EXACT_DOUBLE_INT => Some(*value as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Union of the key sets of every tensor reachable from `values`,
    /// or `None` when no tensor is present.
    #[must_use]
    pub fn tensor_key_set(values: &[IValue]) -> Option<DispatchKeySet> {
        let mut found = false;
        let mut keys = DispatchKeySet::EMPTY;
        for value in values {
            match value {
                Self::Tensor(tensor) => {
                    found = true;
                    keys = keys.union(tensor.key_set());
                }
                Self::List(items) => {
                    if let Some(inner) = Self::tensor_key_set(items) {
                        found = true;
                        keys = keys.union(inner);
                    }
                }
                _ => {}
            }
        }
        found.then_some(keys)
    }
}

impl From<bool> for IValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for IValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for IValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for IValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for IValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<TensorValue> for IValue {
    fn from(value: TensorValue) -> Self {
        Self::Tensor(value)
    }
}

impl From<Vec<IValue>> for IValue {
    fn from(value: Vec<IValue>) -> Self {
        Self::List(value)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Device, DispatchKey, DispatchKeyError, DispatchKeySet};

    use super::{IValue, TensorValue};

    #[test]
    fn tensor_rejects_non_backend_keys() {
        let err = TensorValue::new(vec![1.0], DispatchKey::Batched)
            .expect_err("batched is not a backend");
        assert_eq!(err, DispatchKeyError::NotABackendKey(DispatchKey::Batched));

        let err = TensorValue::new(vec![1.0], DispatchKey::Undefined)
            .expect_err("undefined is never a backend");
        assert_eq!(err, DispatchKeyError::UndefinedKey);
    }

    #[test]
    fn tensor_key_set_pairs_backend_with_device_autograd() {
        let sparse = TensorValue::new(vec![0.0, 2.0], DispatchKey::SparseCUDA)
            .expect("sparse cuda is a backend");
        assert_eq!(sparse.device(), Device::Cuda);
        assert_eq!(
            sparse.key_set(),
            DispatchKeySet::from_keys(&[DispatchKey::SparseCUDA, DispatchKey::AutogradCUDA])
        );
    }

    #[test]
    fn with_data_keeps_backend_and_level_but_not_identity() {
        let base = TensorValue::cpu(vec![1.0]).with_level(3);
        let derived = base.with_data(vec![4.0]);
        assert_eq!(derived.level(), Some(3));
        assert_eq!(derived.backend(), DispatchKey::CPU);
        assert_ne!(derived.id(), base.id());
        assert_ne!(
            derived.evidence_fingerprint64(),
            base.evidence_fingerprint64()
        );
    }

    #[test]
    fn tensor_key_set_walks_nested_lists() {
        let stack = vec![
            IValue::Int(2),
            IValue::List(vec![IValue::Tensor(TensorValue::cuda(vec![1.0]))]),
            IValue::Tensor(TensorValue::cpu(vec![2.0])),
        ];
        let keys = IValue::tensor_key_set(&stack).expect("tensors present");
        assert!(keys.has(DispatchKey::CPU));
        assert!(keys.has(DispatchKey::CUDA));
        assert!(keys.has(DispatchKey::AutogradCUDA));

        assert_eq!(IValue::tensor_key_set(&[IValue::None, 1.5.into()]), None);
    }

    #[test]
    fn accessors_match_variants() {
        assert_eq!(IValue::from(7i64).as_int(), Some(7));
        assert_eq!(IValue::from(7i64).as_double(), Some(7.0));
        assert_eq!(IValue::from(-(1i64 << 53)).as_double(), Some(-9_007_199_254_740_992.0));
        assert_eq!(IValue::from((1i64 << 53) + 1).as_double(), None);
        assert_eq!(IValue::from(i64::MIN).as_double(), None);
        assert_eq!(IValue::from("x").as_str(), Some("x"));
        assert_eq!(IValue::from(true).as_bool(), Some(true));
        assert!(IValue::None.is_none());
        assert_eq!(IValue::from(2.5).type_name(), "float");
        assert!(IValue::from(1i64).as_tensor().is_none());
    }
}
