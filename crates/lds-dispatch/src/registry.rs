use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use lds_core::{DispatchKey, DispatchKeyError, DispatchKeySet, IValue};
use lds_runtime::{EvidenceKind, RuntimeConfig, evidence_capture_active, record_evidence};
use serde::{Deserialize, Serialize};

use crate::dynamic_layer::{dynamic_layer_depth, register_dynamic_layer_fallbacks};
use crate::schema::{FunctionSchema, OperatorName, ParsedSchemaInput, parse_schema_or_name};
use crate::tls::tls_local_dispatch_key_set;
use crate::DispatchError;

/// Argument and return vector shared by every boxed kernel.
pub type Stack = Vec<IValue>;

type BoxedKernel =
    dyn Fn(&OperatorHandle, &mut Stack) -> Result<(), DispatchError> + Send + Sync + 'static;

#[derive(Clone)]
pub struct KernelFunction {
    name: String,
    func: Arc<BoxedKernel>,
}

impl KernelFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&OperatorHandle, &mut Stack) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
        (self.func)(op, stack)
    }
}

impl fmt::Debug for KernelFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Where the selected kernel came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelSource {
    Direct,
    Alias,
    BackendFallback,
    CatchAll,
}

impl KernelSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Alias => "alias",
            Self::BackendFallback => "backend_fallback",
            Self::CatchAll => "catch_all",
        }
    }
}

impl fmt::Display for KernelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchDecision {
    pub op: OperatorName,
    /// `None` when no key survived and the catch-all served the call.
    pub selected_key: Option<DispatchKey>,
    pub kernel: String,
    pub source: KernelSource,
    pub keyset_bits: u64,
}

#[derive(Debug)]
struct OperatorEntry {
    name: OperatorName,
    schema: RwLock<Option<FunctionSchema>>,
    kernels: RwLock<BTreeMap<DispatchKey, KernelFunction>>,
    catch_all: RwLock<Option<KernelFunction>>,
}

impl OperatorEntry {
    fn new(name: OperatorName) -> Self {
        Self {
            name,
            schema: RwLock::new(None),
            kernels: RwLock::new(BTreeMap::new()),
            catch_all: RwLock::new(None),
        }
    }
}

#[derive(Debug)]
struct DispatcherState {
    config: RuntimeConfig,
    operators: RwLock<BTreeMap<OperatorName, Arc<OperatorEntry>>>,
    backend_fallbacks: RwLock<BTreeMap<DispatchKey, KernelFunction>>,
}

/// Operator table plus dispatcher-wide per-key fallbacks. Cloning shares the
/// same table.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    state: Arc<DispatcherState>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            state: Arc::new(DispatcherState {
                config,
                operators: RwLock::new(BTreeMap::new()),
                backend_fallbacks: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Process-wide dispatcher with the dynamic-layer fallbacks installed.
    pub fn singleton() -> &'static Dispatcher {
        static SINGLETON: OnceLock<Dispatcher> = OnceLock::new();
        SINGLETON.get_or_init(|| {
            let dispatcher = Dispatcher::default();
            register_dynamic_layer_fallbacks(&dispatcher);
            dispatcher
        })
    }

    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        self.state.config
    }

    fn entry_for(&self, name: &OperatorName) -> Arc<OperatorEntry> {
        if let Some(entry) = read_lock(&self.state.operators).get(name) {
            return Arc::clone(entry);
        }
        let mut operators = write_lock(&self.state.operators);
        Arc::clone(
            operators
                .entry(name.clone())
                .or_insert_with(|| Arc::new(OperatorEntry::new(name.clone()))),
        )
    }

    fn handle(&self, entry: Arc<OperatorEntry>) -> OperatorHandle {
        OperatorHandle {
            entry,
            dispatcher: self.clone(),
        }
    }

    fn entry_from_input(&self, op: &str) -> Result<Arc<OperatorEntry>, DispatchError> {
        match parse_schema_or_name(op)? {
            ParsedSchemaInput::Name(name) => Ok(self.entry_for(&name)),
            ParsedSchemaInput::Schema(schema) => self.define(schema),
        }
    }

    fn define(&self, schema: FunctionSchema) -> Result<Arc<OperatorEntry>, DispatchError> {
        let entry = self.entry_for(&schema.name);
        {
            let mut slot = write_lock(&entry.schema);
            match slot.as_ref() {
                Some(existing) if *existing != schema => {
                    return Err(DispatchError::DuplicateSchema {
                        op: schema.name.clone(),
                        existing: existing.to_string(),
                        incoming: schema.to_string(),
                    });
                }
                Some(_) => {}
                None => *slot = Some(schema),
            }
        }
        Ok(entry)
    }

    /// Declares an operator. A bare name only reserves the entry; a full
    /// schema attaches to it and must agree with any schema already there.
    pub fn def(&self, schema_or_name: &str) -> Result<OperatorHandle, DispatchError> {
        let entry = self.entry_from_input(schema_or_name)?;
        Ok(self.handle(entry))
    }

    /// Installs `kernel` for `key`, replacing any earlier kernel under that key.
    pub fn register_kernel(
        &self,
        op: &str,
        key: DispatchKey,
        kernel: KernelFunction,
    ) -> Result<OperatorHandle, DispatchError> {
        if key == DispatchKey::Undefined {
            return Err(DispatchKeyError::UndefinedKey.into());
        }
        let entry = self.entry_from_input(op)?;
        write_lock(&entry.kernels).insert(key, kernel);
        Ok(self.handle(entry))
    }

    /// Kernel used when no per-key kernel or backend fallback matches.
    pub fn register_catch_all(
        &self,
        op: &str,
        kernel: KernelFunction,
    ) -> Result<OperatorHandle, DispatchError> {
        let entry = self.entry_from_input(op)?;
        *write_lock(&entry.catch_all) = Some(kernel);
        Ok(self.handle(entry))
    }

    /// Dispatcher-wide fallback for `key`, used by every operator that has
    /// no kernel of its own for it.
    pub fn register_fallback(
        &self,
        key: DispatchKey,
        kernel: KernelFunction,
    ) -> Result<(), DispatchError> {
        if key == DispatchKey::Undefined {
            return Err(DispatchKeyError::UndefinedKey.into());
        }
        self.install_backend_fallback(key, kernel);
        Ok(())
    }

    pub(crate) fn install_backend_fallback(&self, key: DispatchKey, kernel: KernelFunction) {
        write_lock(&self.state.backend_fallbacks).insert(key, kernel);
    }

    #[must_use]
    pub fn has_fallback_for(&self, key: DispatchKey) -> bool {
        read_lock(&self.state.backend_fallbacks).contains_key(&key)
    }

    /// Unknown or malformed names are simply absent.
    #[must_use]
    pub fn find_operator(&self, name: &str) -> Option<OperatorHandle> {
        let name: OperatorName = name.parse().ok()?;
        let entry = read_lock(&self.state.operators).get(&name).cloned()?;
        Some(self.handle(entry))
    }

    /// Like [`Dispatcher::find_operator`] but only for operators that carry a schema.
    #[must_use]
    pub fn find_schema(&self, name: &OperatorName) -> Option<OperatorHandle> {
        let entry = read_lock(&self.state.operators).get(name).cloned()?;
        if read_lock(&entry.schema).is_none() {
            return None;
        }
        Some(self.handle(entry))
    }

    pub fn call(&self, name: &str, stack: &mut Stack) -> Result<(), DispatchError> {
        let op = self
            .find_operator(name)
            .ok_or_else(|| DispatchError::UnknownOperator(name.to_string()))?;
        op.call_boxed(stack)
    }

    #[must_use]
    pub fn operator_names(&self) -> Vec<OperatorName> {
        read_lock(&self.state.operators).keys().cloned().collect()
    }

    fn backend_fallback(&self, key: DispatchKey) -> Option<KernelFunction> {
        read_lock(&self.state.backend_fallbacks).get(&key).cloned()
    }
}

#[derive(Clone)]
pub struct OperatorHandle {
    entry: Arc<OperatorEntry>,
    dispatcher: Dispatcher,
}

impl fmt::Debug for OperatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorHandle")
            .field("name", &self.entry.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for OperatorHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Eq for OperatorHandle {}

impl OperatorHandle {
    #[must_use]
    pub fn operator_name(&self) -> &OperatorName {
        &self.entry.name
    }

    #[must_use]
    pub fn schema(&self) -> Option<FunctionSchema> {
        read_lock(&self.entry.schema).clone()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Keys with a registered kernel, alias registrations expanded to their members.
    #[must_use]
    pub fn supported_keys(&self) -> DispatchKeySet {
        read_lock(&self.entry.kernels)
            .keys()
            .copied()
            .collect::<DispatchKeySet>()
            .expand_aliases()
    }

    /// True when `key` has a kernel of its own or through its alias.
    #[must_use]
    pub fn has_kernel_for(&self, key: DispatchKey) -> bool {
        let kernels = read_lock(&self.entry.kernels);
        kernels.contains_key(&key)
            || key
                .alias_parent()
                .is_some_and(|parent| kernels.contains_key(&parent))
    }

    /// Candidate keys for a call with `stack` under the current thread-local
    /// state: supported keys narrowed to the devices of the tensor arguments,
    /// plus the included set, minus the excluded set.
    ///
    /// A kernel registered under a transformation marker never makes its key
    /// a candidate on its own. The marker only enters through the included
    /// set, which the front fallback sets while that layer is on top.
    #[must_use]
    pub fn dispatch_key_set(&self, stack: &[IValue]) -> DispatchKeySet {
        let local = tls_local_dispatch_key_set();
        self.supported_keys()
            .iter()
            .filter(|key| !key.is_transformation_marker())
            .collect::<DispatchKeySet>()
            .intersection(argument_mask(stack))
            .union(local.included)
            .difference(local.excluded)
    }

    /// The decision [`OperatorHandle::call_boxed`] would make right now.
    pub fn resolve(&self, stack: &[IValue]) -> Result<DispatchDecision, DispatchError> {
        self.select(self.dispatch_key_set(stack))
            .map(|(decision, _kernel)| decision)
    }

    pub fn call_boxed(&self, stack: &mut Stack) -> Result<(), DispatchError> {
        let config = self.dispatcher.config();
        let depth = CallDepthGuard::enter(config.max_dispatch_depth).inspect_err(|error| {
            if config.record_evidence && evidence_capture_active() {
                record_refusal(&self.entry.name, error);
            }
        })?;
        let candidates = self.dispatch_key_set(stack);
        let (decision, kernel) = self.select(candidates)?;
        if config.record_evidence && evidence_capture_active() {
            record_dispatch(&decision, depth.depth());
        }
        kernel.call(self, stack)
    }

    /// Failure value for a kernel of this operator.
    pub fn kernel_error(&self, message: impl Into<String>) -> DispatchError {
        DispatchError::Kernel {
            op: self.entry.name.clone(),
            message: message.into(),
        }
    }

    fn select(
        &self,
        candidates: DispatchKeySet,
    ) -> Result<(DispatchDecision, KernelFunction), DispatchError> {
        let keyset_bits = candidates.bits();
        let decide = |selected_key: Option<DispatchKey>, source: KernelSource, kernel: KernelFunction| {
            let decision = DispatchDecision {
                op: self.entry.name.clone(),
                selected_key,
                kernel: kernel.name().to_string(),
                source,
                keyset_bits,
            };
            (decision, kernel)
        };

        let Ok(key) = candidates.highest_priority_type_id() else {
            return match self.catch_all() {
                Some(kernel) => Ok(decide(None, KernelSource::CatchAll, kernel)),
                None => Err(DispatchError::NoCandidateKeys {
                    op: self.entry.name.clone(),
                }),
            };
        };

        let (direct, alias) = {
            let kernels = read_lock(&self.entry.kernels);
            let direct = kernels.get(&key).cloned();
            let alias = key
                .alias_parent()
                .and_then(|parent| kernels.get(&parent).cloned());
            (direct, alias)
        };
        if let Some(kernel) = direct {
            return Ok(decide(Some(key), KernelSource::Direct, kernel));
        }
        if let Some(kernel) = alias {
            return Ok(decide(Some(key), KernelSource::Alias, kernel));
        }
        if let Some(kernel) = self.dispatcher.backend_fallback(key) {
            return Ok(decide(Some(key), KernelSource::BackendFallback, kernel));
        }
        if let Some(kernel) = self.catch_all() {
            return Ok(decide(Some(key), KernelSource::CatchAll, kernel));
        }
        Err(DispatchError::MissingKernel {
            op: self.entry.name.clone(),
            key,
        })
    }

    fn catch_all(&self) -> Option<KernelFunction> {
        read_lock(&self.entry.catch_all).clone()
    }
}

/// Device-bound keys survive only for devices present among the tensor
/// arguments. Without tensor arguments nothing is narrowed.
fn argument_mask(stack: &[IValue]) -> DispatchKeySet {
    match IValue::tensor_key_set(stack) {
        Some(tensor_keys) => DispatchKeySet::FULL
            .difference(DispatchKeySet::DEVICE_KEYS)
            .union(tensor_keys),
        None => DispatchKeySet::FULL,
    }
}

fn record_dispatch(decision: &DispatchDecision, call_depth: usize) {
    let key = decision
        .selected_key
        .map_or_else(|| "none".to_string(), |key| key.name().to_string());
    record_evidence(
        EvidenceKind::Dispatch,
        format!("op={} key={key}", decision.op),
        [
            ("op", decision.op.to_string()),
            ("key", key),
            ("source", decision.source.as_str().to_string()),
            ("kernel", decision.kernel.clone()),
            ("candidate_bits", decision.keyset_bits.to_string()),
            ("call_depth", call_depth.to_string()),
            ("layer_depth", dynamic_layer_depth().to_string()),
        ],
    );
}

/// Calls turned away before selection, such as a nesting-depth refusal.
fn record_refusal(op: &OperatorName, error: &DispatchError) {
    record_evidence(
        EvidenceKind::Policy,
        format!("op={op} refused: {error}"),
        [
            ("op", op.to_string()),
            ("reason_code", error.reason_code().to_string()),
            ("call_depth", CALL_DEPTH.with(Cell::get).to_string()),
            ("layer_depth", dynamic_layer_depth().to_string()),
        ],
    );
}

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Counts nested boxed calls on this thread.
struct CallDepthGuard {
    depth: usize,
}

impl CallDepthGuard {
    fn enter(max: usize) -> Result<Self, DispatchError> {
        let current = CALL_DEPTH.with(Cell::get);
        if current >= max {
            return Err(DispatchError::ReentrantDepthExceeded {
                current: current + 1,
                max,
            });
        }
        CALL_DEPTH.with(|depth| depth.set(current + 1));
        Ok(Self { depth: current + 1 })
    }

    fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for CallDepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|depth| depth.set(self.depth - 1));
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
