#![forbid(unsafe_code)]

mod dynamic_layer;
mod registry;
mod schema;
mod stack;
mod tls;

use std::fmt;

pub use lds_core::{DispatchKey, DispatchKeyError, DispatchKeySet, IValue, TensorValue};

pub use dynamic_layer::{
    BACK_FALLBACK_KERNEL, DynamicLayer, DynamicLayerGuard, FRONT_FALLBACK_KERNEL, LayerError,
    TERMINAL_EXCLUDE_SET, TRANSFORMATION_KEYS, current_dynamic_layer_id,
    dynamic_layer_back_fallback, dynamic_layer_depth, dynamic_layer_front_fallback,
    dynamic_layer_stack_snapshot, grad_layer_at_top, layer_exclude_set, pop_dynamic_layer,
    push_dynamic_layer, register_dynamic_layer_fallbacks, tls_transformation_keys_enabled,
    top_dynamic_layer, with_dynamic_layer,
};
pub use registry::{
    DispatchDecision, Dispatcher, KernelFunction, KernelSource, OperatorHandle, Stack,
};
pub use schema::{
    Argument, FunctionSchema, OperatorName, ParsedSchemaInput, SchemaError, parse_schema_or_name,
};
pub use stack::{pop_args, pop_bool, pop_double, pop_int, pop_ivalue, pop_tensor};
pub use tls::{
    ExcludeDispatchKeyGuard, IncludeDispatchKeyGuard, LocalDispatchKeySet,
    LocalDispatchKeySetGuard, force_tls_local_dispatch_key_set, tls_is_dispatch_key_excluded,
    tls_is_dispatch_key_included, tls_local_dispatch_key_set, tls_set_dispatch_key_excluded,
    tls_set_dispatch_key_included,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Key(DispatchKeyError),
    Schema(SchemaError),
    Layer(LayerError),
    UnknownOperator(String),
    DuplicateSchema {
        op: OperatorName,
        existing: String,
        incoming: String,
    },
    MissingKernel {
        op: OperatorName,
        key: DispatchKey,
    },
    NoCandidateKeys {
        op: OperatorName,
    },
    Kernel {
        op: OperatorName,
        message: String,
    },
    ReentrantDepthExceeded {
        current: usize,
        max: usize,
    },
}

impl DispatchError {
    /// Stable snake_case tag for logs and fixtures.
    #[must_use]
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::Key(_) => "key",
            Self::Schema(_) => "schema",
            Self::Layer(_) => "layer",
            Self::UnknownOperator(_) => "unknown_operator",
            Self::DuplicateSchema { .. } => "duplicate_schema",
            Self::MissingKernel { .. } => "missing_kernel",
            Self::NoCandidateKeys { .. } => "no_candidate_keys",
            Self::Kernel { .. } => "kernel",
            Self::ReentrantDepthExceeded { .. } => "reentrant_depth_exceeded",
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(error) => write!(f, "dispatch key failure: {error}"),
            Self::Schema(error) => write!(f, "operator schema failure: {error}"),
            Self::Layer(error) => write!(f, "dynamic layer invariant violated: {error}"),
            Self::UnknownOperator(name) => write!(f, "no operator registered as '{name}'"),
            Self::DuplicateSchema {
                op,
                existing,
                incoming,
            } => write!(
                f,
                "operator {op} already has schema '{existing}', refusing '{incoming}'"
            ),
            Self::MissingKernel { op, key } => {
                write!(f, "operator {op} has no kernel or fallback for key {key}")
            }
            Self::NoCandidateKeys { op } => {
                write!(f, "operator {op} has no candidate dispatch key and no catch-all")
            }
            Self::Kernel { op, message } => write!(f, "kernel for {op} failed: {message}"),
            Self::ReentrantDepthExceeded { current, max } => write!(
                f,
                "boxed call depth {current} exceeds max_dispatch_depth={max}"
            ),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Key(error) => Some(error),
            Self::Schema(error) => Some(error),
            Self::Layer(error) => Some(error),
            _ => None,
        }
    }
}

impl From<DispatchKeyError> for DispatchError {
    fn from(value: DispatchKeyError) -> Self {
        Self::Key(value)
    }
}

impl From<SchemaError> for DispatchError {
    fn from(value: SchemaError) -> Self {
        Self::Schema(value)
    }
}

impl From<LayerError> for DispatchError {
    fn from(value: LayerError) -> Self {
        Self::Layer(value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::error::Error as _;

    use lds_core::{DISPATCH_PRIORITY, DispatchKey, DispatchKeySet, IValue, TensorValue};
    use proptest::prelude::*;

    use super::{
        DispatchError, Dispatcher, ExcludeDispatchKeyGuard, IncludeDispatchKeyGuard,
        KernelFunction, LayerError, LocalDispatchKeySetGuard, OperatorName, SchemaError, Stack,
        push_dynamic_layer,
    };

    fn det_seed(parts: &[u64]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for value in parts {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    fn build_property_log(
        test_id: &str,
        seed: u64,
        input_digest: u64,
        output_digest: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("ts_utc".to_string(), "1970-01-01T00:00:00Z".to_string());
        log.insert("suite_id".to_string(), "lds_dispatch_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert(
            "scenario_id".to_string(),
            format!("dispatch_selection:{test_id}"),
        );
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "input_digest".to_string(),
            format!("det64:{input_digest:016x}"),
        );
        log.insert(
            "output_digest".to_string(),
            format!("det64:{output_digest:016x}"),
        );
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p lds-dispatch {test_id} -- --nocapture"),
        );
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_log_contract(log: &BTreeMap<String, String>) {
        for key in [
            "ts_utc",
            "suite_id",
            "test_id",
            "scenario_id",
            "seed",
            "input_digest",
            "output_digest",
            "replay_command",
            "outcome",
            "reason_code",
        ] {
            assert!(
                log.contains_key(key),
                "property log missing required key '{key}'"
            );
        }
    }

    fn keyset_from_mask(mask: u16) -> DispatchKeySet {
        DispatchKey::all()
            .iter()
            .enumerate()
            .filter(|(idx, _)| mask & (1 << idx) != 0)
            .map(|(_, key)| *key)
            .collect()
    }

    fn noop_kernel() -> KernelFunction {
        KernelFunction::new("noop", |_op, _stack: &mut Stack| Ok(()))
    }

    #[test]
    fn errors_render_and_chain_sources() {
        let op: OperatorName = "test::op".parse().expect("name");
        let err = DispatchError::MissingKernel {
            op: op.clone(),
            key: DispatchKey::Batched,
        };
        assert_eq!(
            err.to_string(),
            "operator test::op has no kernel or fallback for key Batched"
        );
        assert!(err.source().is_none());

        let err = DispatchError::from(LayerError::UndefinedKey);
        assert!(err.to_string().contains("invariant violated"));
        assert!(err.source().is_some());

        let err = DispatchError::from(SchemaError::EmptyName);
        assert!(matches!(err, DispatchError::Schema(SchemaError::EmptyName)));

        let err = DispatchError::ReentrantDepthExceeded { current: 9, max: 8 };
        assert!(err.to_string().contains("max_dispatch_depth=8"));
        assert_eq!(err.reason_code(), "reentrant_depth_exceeded");
        assert_eq!(
            DispatchError::NoCandidateKeys { op }.reason_code(),
            "no_candidate_keys"
        );
    }

    #[test]
    fn push_undefined_surfaces_as_layer_error() {
        let err: DispatchError = push_dynamic_layer(DispatchKey::Undefined)
            .map_err(DispatchError::from)
            .expect_err("undefined rejected");
        assert_eq!(err, DispatchError::Layer(LayerError::UndefinedKey));
    }

    #[test]
    fn selection_log_contract_is_complete() {
        let seed = det_seed(&[1, 2, 3]);
        let log = build_property_log(
            "selection_log_contract_is_complete",
            seed,
            1,
            2,
            "dispatch_selection_ok",
        );
        assert_log_contract(&log);
        assert!(
            log.get("replay_command")
                .is_some_and(|cmd| cmd.contains("cargo test -p lds-dispatch"))
        );
        assert_ne!(det_seed(&[1, 2, 3]), det_seed(&[3, 2, 1]));
    }

    proptest! {
        #[test]
        fn prop_selection_is_maximal_among_allowed_candidates(
            supported_mask in 0u16..(1u16 << 13),
            included_mask in 0u16..(1u16 << 13),
            excluded_mask in 0u16..(1u16 << 13),
            tensor_on_cuda in proptest::option::of(any::<bool>()),
        ) {
            let dispatcher = Dispatcher::default();
            let op = dispatcher.def("test::select").expect("def");
            for key in keyset_from_mask(supported_mask).iter() {
                dispatcher
                    .register_kernel("test::select", key, noop_kernel())
                    .expect("kernel");
            }
            dispatcher
                .register_catch_all("test::select", noop_kernel())
                .expect("catch-all");

            let _restore = LocalDispatchKeySetGuard::new();
            let included = keyset_from_mask(included_mask);
            let excluded = keyset_from_mask(excluded_mask);
            let _include = IncludeDispatchKeyGuard::new(included);
            let _exclude = ExcludeDispatchKeyGuard::new(excluded);

            let stack: Stack = match tensor_on_cuda {
                Some(true) => vec![IValue::Tensor(TensorValue::cuda(vec![1.0]))],
                Some(false) => vec![IValue::Tensor(TensorValue::cpu(vec![1.0]))],
                None => vec![IValue::Int(0)],
            };
            let decision = op.resolve(&stack).expect("catch-all guarantees a kernel");
            let candidates = op.dispatch_key_set(&stack);
            prop_assert_eq!(decision.keyset_bits, candidates.bits());

            match decision.selected_key {
                Some(selected) => {
                    prop_assert!(!excluded.has(selected));
                    prop_assert!(op.supported_keys().union(included).has(selected));
                    let expected = DISPATCH_PRIORITY
                        .iter()
                        .copied()
                        .find(|key| candidates.has(*key))
                        .expect("non-empty candidates");
                    prop_assert_eq!(selected, expected);
                }
                None => {
                    prop_assert!(candidates.is_empty());
                }
            }

            let seed = det_seed(&[
                u64::from(supported_mask),
                u64::from(included_mask),
                u64::from(excluded_mask),
            ]);
            let log = build_property_log(
                "prop_selection_is_maximal_among_allowed_candidates",
                seed,
                candidates.bits(),
                decision.selected_key.map_or(0, DispatchKey::bit),
                "dispatch_selection_maximal",
            );
            assert_log_contract(&log);
        }
    }
}
