//! Thread-local stack of active transformation layers and the two generic
//! kernels that wrap every call in it.
//!
//! The front fallback fires first for any call while the stack holds more
//! than the permanent autograd layer. It hides every key except the top
//! layer's own key(s) and `DynamicLayerBack`, includes the layer's marker
//! key when the operator can serve it, then re-dispatches. Whatever
//! the layer kernel forwards lands on the back fallback, which pops the layer
//! for the duration of the re-dispatch so the call starts over at the front
//! against the next layer down. With the stack exhausted the front fallback
//! routes straight to the backend kernels.

use std::cell::RefCell;
use std::fmt;

use lds_core::{DispatchKey, DispatchKeySet};
use lds_runtime::{EvidenceKind, evidence_capture_active, record_evidence};
use serde::{Deserialize, Serialize};

use crate::DispatchError;
use crate::registry::{Dispatcher, KernelFunction, OperatorHandle, Stack};
use crate::tls::{
    ExcludeDispatchKeyGuard, IncludeDispatchKeyGuard, LocalDispatchKeySet, LocalDispatchKeySetGuard,
    force_tls_local_dispatch_key_set, tls_local_dispatch_key_set, tls_set_dispatch_key_included,
};

pub const FRONT_FALLBACK_KERNEL: &str = "dynamic_layer::front_fallback";
pub const BACK_FALLBACK_KERNEL: &str = "dynamic_layer::back_fallback";

/// The included keys that switch the layer machinery on.
pub const TRANSFORMATION_KEYS: DispatchKeySet = DispatchKeySet::EMPTY
    .with(DispatchKey::DynamicLayerFront)
    .with(DispatchKey::DynamicLayerBack);

/// Excluded by the front fallback once no layer is left: every
/// transformation marker and every autograd key.
pub const TERMINAL_EXCLUDE_SET: DispatchKeySet = TRANSFORMATION_KEYS
    .with(DispatchKey::Batched)
    .with(DispatchKey::Autograd)
    .expand_aliases();

/// Excluded by the front fallback while `layer_key` is on top: everything
/// except the layer's own key (alias members included) and the back key.
#[must_use]
pub const fn layer_exclude_set(layer_key: DispatchKey) -> DispatchKeySet {
    DispatchKeySet::FULL
        .without(DispatchKey::DynamicLayerBack)
        .difference(DispatchKeySet::EMPTY.with(layer_key).expand_aliases())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DynamicLayer {
    key: DispatchKey,
    id: i64,
}

impl DynamicLayer {
    #[must_use]
    pub const fn new(key: DispatchKey, id: i64) -> Self {
        Self { key, id }
    }

    #[must_use]
    pub const fn key(self) -> DispatchKey {
        self.key
    }

    #[must_use]
    pub const fn id(self) -> i64 {
        self.id
    }
}

impl fmt::Display for DynamicLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerError {
    UndefinedKey,
    EmptyStack,
    UndefinedTop,
}

impl fmt::Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedKey => write!(f, "cannot push a dynamic layer keyed Undefined"),
            Self::EmptyStack => write!(f, "cannot pop an empty dynamic layer stack"),
            Self::UndefinedTop => write!(f, "top of the dynamic layer stack is keyed Undefined"),
        }
    }
}

impl std::error::Error for LayerError {}

thread_local! {
    static DYNAMIC_LAYER_STACK: RefCell<Vec<DynamicLayer>> =
        RefCell::new(vec![DynamicLayer::new(DispatchKey::Autograd, 1)]);
}

/// Pushes a layer keyed `key` and returns its id, `1 + depth` before the push.
/// Reaching depth 2 switches the front and back keys on.
pub fn push_dynamic_layer(key: DispatchKey) -> Result<i64, LayerError> {
    if key == DispatchKey::Undefined {
        return Err(LayerError::UndefinedKey);
    }
    Ok(push_checked(key))
}

fn push_checked(key: DispatchKey) -> i64 {
    let (id, depth) = DYNAMIC_LAYER_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let id = i64::try_from(stack.len()).map_or(i64::MAX, |depth| depth + 1);
        stack.push(DynamicLayer::new(key, id));
        (id, stack.len())
    });
    let toggled = depth == 2;
    if toggled {
        set_transformation_keys(true);
    }
    record_layer_change("push", DynamicLayer::new(key, id), depth, toggled);
    id
}

/// Removes and returns the top layer. Falling below depth 2 switches the
/// front and back keys off.
pub fn pop_dynamic_layer() -> Result<DynamicLayer, LayerError> {
    let (layer, depth) = DYNAMIC_LAYER_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let top = *stack.last().ok_or(LayerError::EmptyStack)?;
        if top.key == DispatchKey::Undefined {
            return Err(LayerError::UndefinedTop);
        }
        stack.pop();
        Ok((top, stack.len()))
    })?;
    let toggled = depth < 2;
    if toggled {
        set_transformation_keys(false);
    }
    record_layer_change("pop", layer, depth, toggled);
    Ok(layer)
}

fn set_transformation_keys(enabled: bool) {
    tls_set_dispatch_key_included(DispatchKey::DynamicLayerFront, enabled);
    tls_set_dispatch_key_included(DispatchKey::DynamicLayerBack, enabled);
}

fn record_layer_change(action: &str, layer: DynamicLayer, depth: usize, toggled: bool) {
    if !evidence_capture_active() {
        return;
    }
    record_evidence(
        EvidenceKind::Layer,
        format!("{action} {layer}"),
        [
            ("action", action.to_string()),
            ("key", layer.key.name().to_string()),
            ("id", layer.id.to_string()),
            ("depth", depth.to_string()),
            ("toggled", toggled.to_string()),
        ],
    );
}

#[must_use]
pub fn top_dynamic_layer() -> Option<DynamicLayer> {
    DYNAMIC_LAYER_STACK.with(|stack| stack.borrow().last().copied())
}

#[must_use]
pub fn current_dynamic_layer_id() -> Option<i64> {
    top_dynamic_layer().map(DynamicLayer::id)
}

#[must_use]
pub fn grad_layer_at_top() -> bool {
    top_dynamic_layer().is_some_and(|layer| layer.key == DispatchKey::Autograd)
}

#[must_use]
pub fn dynamic_layer_depth() -> usize {
    DYNAMIC_LAYER_STACK.with(|stack| stack.borrow().len())
}

/// Bottom first.
#[must_use]
pub fn dynamic_layer_stack_snapshot() -> Vec<DynamicLayer> {
    DYNAMIC_LAYER_STACK.with(|stack| stack.borrow().clone())
}

/// True when both the front and back keys are in the included set.
#[must_use]
pub fn tls_transformation_keys_enabled() -> bool {
    TRANSFORMATION_KEYS.is_subset_of(tls_local_dispatch_key_set().included)
}

/// Scoped layer: pushed on construction, popped (with anything pushed above
/// it and left behind) on drop.
#[derive(Debug)]
#[must_use = "the layer is popped as soon as the guard is dropped"]
pub struct DynamicLayerGuard {
    layer: DynamicLayer,
    depth: usize,
}

impl DynamicLayerGuard {
    pub fn push(key: DispatchKey) -> Result<Self, LayerError> {
        let id = push_dynamic_layer(key)?;
        Ok(Self {
            layer: DynamicLayer::new(key, id),
            depth: dynamic_layer_depth(),
        })
    }

    #[must_use]
    pub fn layer(&self) -> DynamicLayer {
        self.layer
    }

    #[must_use]
    pub fn id(&self) -> i64 {
        self.layer.id
    }
}

impl Drop for DynamicLayerGuard {
    fn drop(&mut self) {
        while dynamic_layer_depth() >= self.depth {
            if pop_dynamic_layer().is_err() {
                break;
            }
        }
    }
}

/// Runs `f` with a layer keyed `key` pushed, passing it the layer.
pub fn with_dynamic_layer<R>(
    key: DispatchKey,
    f: impl FnOnce(DynamicLayer) -> R,
) -> Result<R, LayerError> {
    let guard = DynamicLayerGuard::push(key)?;
    Ok(f(guard.layer()))
}

/// Pops the top layer for its lifetime and pushes its key back on drop,
/// which assigns a fresh id.
struct WithoutTop {
    layer: DynamicLayer,
}

impl WithoutTop {
    fn new() -> Result<Self, LayerError> {
        Ok(Self {
            layer: pop_dynamic_layer()?,
        })
    }
}

impl Drop for WithoutTop {
    fn drop(&mut self) {
        push_checked(self.layer.key);
    }
}

pub fn dynamic_layer_front_fallback(
    op: &OperatorHandle,
    stack: &mut Stack,
) -> Result<(), DispatchError> {
    let Some(layer) = top_dynamic_layer() else {
        let _guard = ExcludeDispatchKeyGuard::new(TERMINAL_EXCLUDE_SET);
        record_guard(op, "front_terminal", None, TERMINAL_EXCLUDE_SET);
        return op.call_boxed(stack);
    };

    let exclude = layer_exclude_set(layer.key);
    let _include = IncludeDispatchKeyGuard::new(layer_include_set(op, layer.key));
    let _guard = ExcludeDispatchKeyGuard::new(exclude);
    record_guard(op, "front", Some(layer), exclude);
    op.call_boxed(stack)
}

/// A transformation layer's key is selectable only while the front fallback
/// of that layer is running, and only when something can serve it.
fn layer_include_set(op: &OperatorHandle, layer_key: DispatchKey) -> DispatchKeySet {
    let servable = op.has_kernel_for(layer_key) || op.dispatcher().has_fallback_for(layer_key);
    if layer_key.is_transformation_marker() && servable {
        DispatchKeySet::EMPTY.with(layer_key)
    } else {
        DispatchKeySet::EMPTY
    }
}

/// TLS is reset destructively for the re-dispatch (empty sets plus the
/// front and back keys) and the full prior state comes back on exit.
pub fn dynamic_layer_back_fallback(
    op: &OperatorHandle,
    stack: &mut Stack,
) -> Result<(), DispatchError> {
    // Declared first so it is restored after the layer is pushed back.
    let _restore_tls = LocalDispatchKeySetGuard::new();
    let without_top = WithoutTop::new()?;

    force_tls_local_dispatch_key_set(LocalDispatchKeySet::empty());
    set_transformation_keys(true);
    record_guard(op, "back", Some(without_top.layer), DispatchKeySet::EMPTY);

    op.call_boxed(stack)
}

fn record_guard(
    op: &OperatorHandle,
    action: &str,
    layer: Option<DynamicLayer>,
    excluded: DispatchKeySet,
) {
    if !op.dispatcher().config().record_evidence || !evidence_capture_active() {
        return;
    }
    let (layer_key, layer_id) = layer.map_or_else(
        || ("none".to_string(), "none".to_string()),
        |layer| (layer.key.name().to_string(), layer.id.to_string()),
    );
    record_evidence(
        EvidenceKind::Guard,
        format!("{action} op={}", op.operator_name()),
        [
            ("action", action.to_string()),
            ("op", op.operator_name().to_string()),
            ("layer_key", layer_key),
            ("layer_id", layer_id),
            ("excluded_bits", excluded.bits().to_string()),
            ("layer_depth", dynamic_layer_depth().to_string()),
        ],
    );
}

impl Dispatcher {
    pub fn register_transformation_front_fallback(&self) {
        self.install_backend_fallback(
            DispatchKey::DynamicLayerFront,
            KernelFunction::new(FRONT_FALLBACK_KERNEL, dynamic_layer_front_fallback),
        );
    }

    pub fn register_transformation_back_fallback(&self) {
        self.install_backend_fallback(
            DispatchKey::DynamicLayerBack,
            KernelFunction::new(BACK_FALLBACK_KERNEL, dynamic_layer_back_fallback),
        );
    }
}

pub fn register_dynamic_layer_fallbacks(dispatcher: &Dispatcher) {
    dispatcher.register_transformation_front_fallback();
    dispatcher.register_transformation_back_fallback();
}
