#![forbid(unsafe_code)]

mod logging;

use std::collections::BTreeMap;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::thread;

use lds_core::{DispatchKey, DispatchKeySet, IValue, TensorValue};
use lds_dispatch::{
    DispatchError, Dispatcher, DynamicLayer, DynamicLayerGuard, ExcludeDispatchKeyGuard,
    KernelFunction, LocalDispatchKeySet, LocalDispatchKeySetGuard, OperatorHandle,
    ParsedSchemaInput, Stack, current_dynamic_layer_id, dynamic_layer_stack_snapshot, parse_schema_or_name, pop_tensor,
    register_dynamic_layer_fallbacks, tls_local_dispatch_key_set, tls_set_dispatch_key_included,
};
use lds_runtime::{EvidenceKind, EvidenceLedger, RuntimeConfig, capture_evidence};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use logging::{STRUCTURED_LOG_SCHEMA_VERSION, StructuredCaseLog};

const MAX_FIXTURE_BYTES: u64 = 1_048_576;
const DYNAMIC_LAYER_FIXTURE: &str = "dynamic_layer_cases.json";
const OP_SCHEMA_FIXTURE: &str = "op_schema_cases.json";
const CASE_OPERATOR: &str = "conformance::scale";
const CASE_SCHEMA: &str = "conformance::scale(Tensor self) -> Tensor";
const OUTPUT_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub runtime: RuntimeConfig,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub cases_total: usize,
    pub cases_passed: usize,
}

impl HarnessReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.cases_total == self.cases_passed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerCaseReport {
    pub name: String,
    pub routing_ok: bool,
    pub guard_ok: bool,
    pub output_ok: bool,
    pub error_ok: bool,
    pub layers_restored_ok: bool,
    pub tls_restored_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl LayerCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.routing_ok
            && self.guard_ok
            && self.output_ok
            && self.error_ok
            && self.layers_restored_ok
            && self.tls_restored_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpSchemaCaseReport {
    pub name: String,
    pub parse_ok: bool,
    pub name_ok: bool,
    pub variant_ok: bool,
    pub arity_ok: bool,
    pub roundtrip_ok: bool,
    pub registry_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl OpSchemaCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.parse_ok
            && self.name_ok
            && self.variant_ok
            && self.arity_ok
            && self.roundtrip_ok
            && self.registry_ok
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LayerFixtureFile {
    cases: Vec<LayerCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayerCase {
    name: String,
    #[serde(default)]
    contract_ids: Vec<String>,
    #[serde(default)]
    layers: Vec<String>,
    #[serde(default)]
    force_transformation_keys: bool,
    #[serde(default)]
    max_dispatch_depth: Option<usize>,
    kernels: Vec<KernelSpec>,
    #[serde(default)]
    catch_all: Option<KernelRole>,
    backend: String,
    input: Vec<f64>,
    #[serde(default)]
    expected_output: Option<Vec<f64>>,
    #[serde(default)]
    expected_level: Option<i64>,
    expected_keys: Vec<String>,
    #[serde(default)]
    expected_guard_actions: Vec<String>,
    #[serde(default)]
    expected_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct KernelSpec {
    key: String,
    role: KernelRole,
}

/// Kernel behaviours a fixture can install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum KernelRole {
    /// Doubles the tensor argument.
    Scale,
    /// Hides its own key (alias members included), re-dispatches, and tags
    /// the result with the id of the layer it ran under.
    Forward,
    Fail,
    Panic,
}

#[derive(Debug, Clone, Deserialize)]
struct OpSchemaFixtureFile {
    cases: Vec<OpSchemaCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct OpSchemaCase {
    name: String,
    input: String,
    expect_parse_ok: bool,
    #[serde(default)]
    expected_name: Option<String>,
    #[serde(default)]
    expect_schema_variant: Option<bool>,
    #[serde(default)]
    expected_positional_arity: Option<usize>,
}

/// What a single case observed on its own thread.
#[derive(Debug, Clone, PartialEq)]
struct LayerObservation {
    selected_keys: Vec<String>,
    guard_actions: Vec<String>,
    layer_events: usize,
    output: Option<Vec<f64>>,
    output_level: Option<i64>,
    output_fingerprint: Option<u64>,
    error: Option<String>,
    refusals: usize,
    layers_intact: bool,
    tls_intact: bool,
    scope_exit_clean: bool,
    evidence_lines: usize,
}

struct CallOutcome {
    result: Result<Option<TensorValue>, String>,
    layers_intact: bool,
    tls_intact: bool,
}

pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let (layer_total, layer_passed) = run_dynamic_layer_conformance(config)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(LayerCaseReport::passed))
        });
    let (schema_total, schema_passed) = run_op_schema_conformance(config)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(OpSchemaCaseReport::passed))
        });

    HarnessReport {
        suite: "smoke",
        fixture_count,
        cases_total: layer_total + schema_total,
        cases_passed: layer_passed + schema_passed,
    }
}

pub fn run_dynamic_layer_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<LayerCaseReport>), String> {
    let fixture_path = config.fixture_root.join(DYNAMIC_LAYER_FIXTURE);
    let fixture: LayerFixtureFile = load_fixture(&fixture_path)?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_layer_case(case, config.runtime)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(LayerCaseReport::passed));

    let report = HarnessReport {
        suite: "dynamic_layer",
        fixture_count: 1,
        cases_total,
        cases_passed,
    };

    Ok((report, case_reports))
}

pub fn run_op_schema_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<OpSchemaCaseReport>), String> {
    let fixture_path = config.fixture_root.join(OP_SCHEMA_FIXTURE);
    let fixture: OpSchemaFixtureFile = load_fixture(&fixture_path)?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_op_schema_case(case, config.runtime));
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(OpSchemaCaseReport::passed));

    let report = HarnessReport {
        suite: "op_schema",
        fixture_count: 1,
        cases_total,
        cases_passed,
    };

    Ok((report, case_reports))
}

/// Every case log from every suite, in fixture order.
pub fn collect_forensic_logs(config: &HarnessConfig) -> Result<Vec<StructuredCaseLog>, String> {
    let (_, layer_cases) = run_dynamic_layer_conformance(config)?;
    let (_, schema_cases) = run_op_schema_conformance(config)?;
    Ok(layer_cases
        .into_iter()
        .map(|case| case.forensic_log)
        .chain(schema_cases.into_iter().map(|case| case.forensic_log))
        .collect())
}

fn run_layer_case(case: &LayerCase, runtime: RuntimeConfig) -> Result<LayerCaseReport, String> {
    // Layer stack and TLS are per thread; a fresh thread starts from [Autograd#1].
    let observation = thread::scope(|scope| {
        scope
            .spawn(|| observe_layer_case(case, runtime))
            .join()
            .map_err(|_| format!("case '{}' panicked outside the dispatcher", case.name))
    })??;

    let routing_ok = observation.selected_keys == case.expected_keys;
    let guard_ok = observation.guard_actions == case.expected_guard_actions;
    let output_ok = case.expected_output.as_ref().is_none_or(|expected| {
        observation
            .output
            .as_deref()
            .is_some_and(|actual| vec_within(actual, expected, OUTPUT_TOLERANCE))
    }) && case
        .expected_level
        .is_none_or(|expected| observation.output_level == Some(expected));
    let error_ok = observation.error == case.expected_error;
    let layers_restored_ok = observation.layers_intact && observation.scope_exit_clean;
    let tls_restored_ok = observation.tls_intact;

    let passed = routing_ok
        && guard_ok
        && output_ok
        && error_ok
        && layers_restored_ok
        && tls_restored_ok;
    let reason_code = if passed {
        if case.expected_error.is_some() {
            "dynamic_layer_fail_closed_ok"
        } else {
            "dynamic_layer_routing_ok"
        }
    } else if !routing_ok {
        "dynamic_layer_key_sequence_mismatch"
    } else if !guard_ok {
        "dynamic_layer_guard_sequence_mismatch"
    } else if !output_ok {
        "dynamic_layer_output_mismatch"
    } else if !error_ok {
        "dynamic_layer_error_expectation_mismatch"
    } else if !layers_restored_ok {
        "dynamic_layer_stack_not_restored"
    } else {
        "dynamic_layer_tls_not_restored"
    };

    Ok(LayerCaseReport {
        name: case.name.clone(),
        routing_ok,
        guard_ok,
        output_ok,
        error_ok,
        layers_restored_ok,
        tls_restored_ok,
        forensic_log: StructuredCaseLog::new(
            "dynamic_layer",
            DYNAMIC_LAYER_FIXTURE,
            case.name.as_str(),
            vec![format!(
                "crates/lds-conformance/fixtures/{DYNAMIC_LAYER_FIXTURE}"
            )],
            "cargo test -p lds-conformance dynamic_layer_fixture_is_green -- --nocapture"
                .to_string(),
            if passed { "pass" } else { "fail" },
            reason_code,
        )
        .with_extra_fields(layer_forensic_fields(case, &observation)),
    })
}

fn observe_layer_case(
    case: &LayerCase,
    runtime: RuntimeConfig,
) -> Result<LayerObservation, String> {
    let mut runtime = runtime.with_record_evidence(true);
    if let Some(depth) = case.max_dispatch_depth {
        runtime = runtime.with_max_dispatch_depth(depth);
    }
    runtime
        .validate()
        .map_err(|error| format!("case '{}': {error}", case.name))?;

    let dispatcher = build_case_dispatcher(case, runtime)?;
    let layer_keys = case
        .layers
        .iter()
        .map(|raw| parse_key(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let input = TensorValue::new(case.input.clone(), parse_key(&case.backend)?)
        .map_err(|error| format!("case '{}' has a bad input tensor: {error}", case.name))?;

    let baseline_layers = dynamic_layer_stack_snapshot();
    let baseline_tls = tls_local_dispatch_key_set();

    let (outcome, ledger) = capture_evidence(|| {
        invoke_under_layers(&dispatcher, &layer_keys, case.force_transformation_keys, input)
    });

    let scope_exit_clean = dynamic_layer_stack_snapshot() == baseline_layers
        && tls_local_dispatch_key_set() == baseline_tls;
    let (output, error) = match outcome.result {
        Ok(output) => (output, None),
        Err(code) => (None, Some(code)),
    };
    let output_level = output.as_ref().and_then(TensorValue::level);
    let output_fingerprint = output.as_ref().map(TensorValue::evidence_fingerprint64);
    let evidence_lines = ledger
        .to_json_lines()
        .map_err(|error| format!("case '{}': evidence not serializable: {error}", case.name))?
        .lines()
        .count();

    Ok(LayerObservation {
        selected_keys: evidence_field(&ledger, EvidenceKind::Dispatch, "key"),
        guard_actions: evidence_field(&ledger, EvidenceKind::Guard, "action"),
        layer_events: ledger.entries_of(EvidenceKind::Layer).count(),
        output: output.map(|tensor| tensor.data().to_vec()),
        output_level,
        output_fingerprint,
        error,
        refusals: ledger.entries_of(EvidenceKind::Policy).count(),
        layers_intact: outcome.layers_intact,
        tls_intact: outcome.tls_intact,
        scope_exit_clean,
        evidence_lines,
    })
}

/// Pushes the case's layers, makes one boxed call, and checks that the call
/// left the layer stack and TLS exactly as it found them.
fn invoke_under_layers(
    dispatcher: &Dispatcher,
    layer_keys: &[DispatchKey],
    force_transformation_keys: bool,
    input: TensorValue,
) -> CallOutcome {
    let _restore_tls = LocalDispatchKeySetGuard::new();
    let mut layer_guards = Vec::with_capacity(layer_keys.len());
    for key in layer_keys {
        let (layers_before, tls_before) = observe_state();
        match DynamicLayerGuard::push(*key) {
            Ok(guard) => layer_guards.push(guard),
            Err(error) => {
                let (layers_after, tls_after) = observe_state();
                return CallOutcome {
                    result: Err(DispatchError::from(error).reason_code().to_string()),
                    layers_intact: layers_before == layers_after,
                    tls_intact: tls_before == tls_after,
                };
            }
        }
    }
    if force_transformation_keys {
        tls_set_dispatch_key_included(DispatchKey::DynamicLayerFront, true);
        tls_set_dispatch_key_included(DispatchKey::DynamicLayerBack, true);
    }

    let (layers_before, tls_before) = observe_state();
    let mut stack: Stack = vec![IValue::Tensor(input)];
    let call = catch_unwind(AssertUnwindSafe(|| {
        dispatcher.call(CASE_OPERATOR, &mut stack)
    }));
    let (layers_after, tls_after) = observe_state();

    let result = match call {
        Ok(Ok(())) => Ok(stack.pop().and_then(IValue::into_tensor)),
        Ok(Err(error)) => Err(error.reason_code().to_string()),
        Err(_) => Err("panic".to_string()),
    };
    CallOutcome {
        result,
        layers_intact: layers_before == layers_after,
        tls_intact: tls_before == tls_after,
    }
}

fn observe_state() -> (Vec<DynamicLayer>, LocalDispatchKeySet) {
    (dynamic_layer_stack_snapshot(), tls_local_dispatch_key_set())
}

fn build_case_dispatcher(case: &LayerCase, runtime: RuntimeConfig) -> Result<Dispatcher, String> {
    let dispatcher = Dispatcher::new(runtime);
    register_dynamic_layer_fallbacks(&dispatcher);
    let describe = |error: DispatchError| format!("case '{}': {error}", case.name);

    dispatcher.def(CASE_SCHEMA).map_err(describe)?;
    for spec in &case.kernels {
        let key = parse_key(&spec.key)?;
        dispatcher
            .register_kernel(CASE_OPERATOR, key, case_kernel(spec.role, key))
            .map_err(describe)?;
    }
    if let Some(role) = case.catch_all {
        dispatcher
            .register_catch_all(CASE_OPERATOR, case_kernel(role, DispatchKey::Undefined))
            .map_err(describe)?;
    }
    Ok(dispatcher)
}

fn case_kernel(role: KernelRole, key: DispatchKey) -> KernelFunction {
    let name = format!("conformance::{}::{key}", role_label(role));
    match role {
        KernelRole::Scale => KernelFunction::new(name, scale_kernel),
        KernelRole::Forward => {
            let hidden = DispatchKeySet::EMPTY.with(key).expand_aliases();
            KernelFunction::new(name, move |op, stack: &mut Stack| {
                let level = current_dynamic_layer_id();
                {
                    let _hide = ExcludeDispatchKeyGuard::new(hidden);
                    op.call_boxed(stack)?;
                }
                let output = pop_tensor(op, stack)?;
                let tagged = match level {
                    Some(level) => output.with_level(level),
                    None => output,
                };
                stack.push(IValue::Tensor(tagged));
                Ok(())
            })
        }
        KernelRole::Fail => KernelFunction::new(name, move |op, _stack: &mut Stack| {
            Err(op.kernel_error(format!("injected failure under {key}")))
        }),
        KernelRole::Panic => {
            KernelFunction::new(name, move |_op, _stack: &mut Stack| injected_panic(key))
        }
    }
}

fn scale_kernel(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let tensor = pop_tensor(op, stack)?;
    let scaled = tensor.data().iter().map(|value| value * 2.0).collect();
    stack.push(IValue::Tensor(tensor.with_data(scaled)));
    Ok(())
}

fn injected_panic(key: DispatchKey) -> Result<(), DispatchError> {
    panic!("injected panic under {key}")
}

const fn role_label(role: KernelRole) -> &'static str {
    match role {
        KernelRole::Scale => "scale",
        KernelRole::Forward => "forward",
        KernelRole::Fail => "fail",
        KernelRole::Panic => "panic",
    }
}

fn parse_key(raw: &str) -> Result<DispatchKey, String> {
    raw.parse()
        .map_err(|error| format!("fixture names an unknown dispatch key: {error}"))
}

fn evidence_field(ledger: &EvidenceLedger, kind: EvidenceKind, field: &str) -> Vec<String> {
    ledger
        .entries_of(kind)
        .filter_map(|entry| entry.field(field))
        .map(str::to_string)
        .collect()
}

fn layer_forensic_fields(
    case: &LayerCase,
    observation: &LayerObservation,
) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert("contract_ids".to_string(), json!(case.contract_ids));
    fields.insert("layers".to_string(), json!(case.layers));
    fields.insert("backend".to_string(), json!(case.backend));
    fields.insert(
        "force_transformation_keys".to_string(),
        json!(case.force_transformation_keys),
    );
    fields.insert("expected_keys".to_string(), json!(case.expected_keys));
    fields.insert("selected_keys".to_string(), json!(observation.selected_keys));
    fields.insert(
        "expected_guard_actions".to_string(),
        json!(case.expected_guard_actions),
    );
    fields.insert("guard_actions".to_string(), json!(observation.guard_actions));
    fields.insert("layer_events".to_string(), json!(observation.layer_events));
    fields.insert("output".to_string(), json!(observation.output));
    fields.insert("expected_level".to_string(), json!(case.expected_level));
    fields.insert("output_level".to_string(), json!(observation.output_level));
    fields.insert(
        "output_fingerprint".to_string(),
        json!(observation.output_fingerprint),
    );
    fields.insert("error".to_string(), json!(observation.error));
    fields.insert("refusals".to_string(), json!(observation.refusals));
    fields.insert("evidence_lines".to_string(), json!(observation.evidence_lines));
    fields
}

fn run_op_schema_case(case: &OpSchemaCase, runtime: RuntimeConfig) -> OpSchemaCaseReport {
    let parsed = parse_schema_or_name(case.input.as_str());
    let parse_ok = parsed.is_ok() == case.expect_parse_ok;

    let observed_name = parsed
        .as_ref()
        .ok()
        .map(|input| input.operator_name().to_string());
    let name_ok = case
        .expected_name
        .as_ref()
        .is_none_or(|expected| observed_name.as_deref() == Some(expected.as_str()));

    let variant_ok = case.expect_schema_variant.is_none_or(|expected| {
        matches!(parsed.as_ref(), Ok(ParsedSchemaInput::Schema(_))) == expected
    });

    let observed_arity = match parsed.as_ref() {
        Ok(ParsedSchemaInput::Schema(schema)) => Some(schema.positional_arity()),
        _ => None,
    };
    let arity_ok = case
        .expected_positional_arity
        .is_none_or(|expected| observed_arity == Some(expected));

    // A rendered schema must parse back to itself.
    let roundtrip_ok = match parsed.as_ref() {
        Ok(ParsedSchemaInput::Schema(schema)) => {
            parse_schema_or_name(&schema.to_string()).ok()
                == Some(ParsedSchemaInput::Schema(schema.clone()))
        }
        Ok(ParsedSchemaInput::Name(name)) => {
            parse_schema_or_name(&name.to_string()).ok()
                == Some(ParsedSchemaInput::Name(name.clone()))
        }
        Err(_) => true,
    };

    let registry_ok = registry_accepts_def(&case.input, runtime) == parsed.is_ok();

    let passed = parse_ok && name_ok && variant_ok && arity_ok && roundtrip_ok && registry_ok;
    let reason_code = if passed {
        if case.expect_parse_ok {
            "op_schema_parity_ok"
        } else {
            "op_schema_adversarial_fail_closed_ok"
        }
    } else if !parse_ok {
        "op_schema_parse_expectation_mismatch"
    } else if !name_ok {
        "op_schema_name_mismatch"
    } else if !variant_ok {
        "op_schema_variant_mismatch"
    } else if !arity_ok {
        "op_schema_arity_mismatch"
    } else if !roundtrip_ok {
        "op_schema_roundtrip_mismatch"
    } else {
        "op_schema_registry_mismatch"
    };

    let mut extra = BTreeMap::new();
    extra.insert("input".to_string(), json!(case.input));
    extra.insert("operator_name".to_string(), json!(observed_name));
    extra.insert("positional_arity".to_string(), json!(observed_arity));
    extra.insert(
        "parse_error".to_string(),
        json!(parsed.as_ref().err().map(ToString::to_string)),
    );

    OpSchemaCaseReport {
        name: case.name.clone(),
        parse_ok,
        name_ok,
        variant_ok,
        arity_ok,
        roundtrip_ok,
        registry_ok,
        forensic_log: StructuredCaseLog::new(
            "op_schema",
            OP_SCHEMA_FIXTURE,
            case.name.as_str(),
            vec![format!("crates/lds-conformance/fixtures/{OP_SCHEMA_FIXTURE}")],
            "cargo test -p lds-conformance op_schema_fixture_is_green -- --nocapture".to_string(),
            if passed { "pass" } else { "fail" },
            reason_code,
        )
        .with_extra_fields(extra),
    }
}

/// Whether a fresh dispatcher accepts `input` through `def` and can find it
/// again by name.
fn registry_accepts_def(input: &str, runtime: RuntimeConfig) -> bool {
    let dispatcher = Dispatcher::new(runtime);
    let Ok(handle) = dispatcher.def(input) else {
        return false;
    };
    let found = if handle.schema().is_some() {
        dispatcher.find_schema(handle.operator_name())
    } else {
        dispatcher.find_operator(&handle.operator_name().to_string())
    };
    found.is_some_and(|found| found == handle)
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

fn vec_within(actual: &[f64], expected: &[f64], tolerance: f64) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected.iter())
            .all(|(actual, expected)| (actual - expected).abs() <= tolerance)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    use lds_runtime::RuntimeConfig;
    use proptest::prelude::*;
    use serde_json::Value;

    use super::{
        HarnessConfig, KernelRole, KernelSpec, LayerCase, load_fixture, run_layer_case,
        summarize_passes, vec_within,
    };

    fn batched_case(name: &str) -> LayerCase {
        LayerCase {
            name: name.to_string(),
            contract_ids: Vec::new(),
            layers: vec!["Batched".to_string()],
            force_transformation_keys: false,
            max_dispatch_depth: None,
            kernels: vec![
                KernelSpec {
                    key: "CPU".to_string(),
                    role: KernelRole::Scale,
                },
                KernelSpec {
                    key: "Batched".to_string(),
                    role: KernelRole::Forward,
                },
                KernelSpec {
                    key: "Autograd".to_string(),
                    role: KernelRole::Forward,
                },
            ],
            catch_all: None,
            backend: "CPU".to_string(),
            input: vec![1.0, 2.0],
            expected_output: Some(vec![2.0, 4.0]),
            expected_level: Some(2),
            expected_keys: [
                "DynamicLayerFront",
                "Batched",
                "DynamicLayerBack",
                "DynamicLayerFront",
                "AutogradCPU",
                "DynamicLayerBack",
                "DynamicLayerFront",
                "CPU",
            ]
            .map(str::to_string)
            .to_vec(),
            expected_guard_actions: ["front", "back", "front", "back", "front_terminal"]
                .map(str::to_string)
                .to_vec(),
            expected_error: None,
        }
    }

    #[test]
    fn default_paths_point_at_crate_fixtures() {
        let config = HarnessConfig::default_paths();
        assert!(config.fixture_root.ends_with("fixtures"));
        assert_eq!(config.runtime, RuntimeConfig::default());
    }

    #[test]
    fn load_fixture_rejects_oversized_files_fail_closed() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after epoch")
            .as_nanos();
        let fixture_path =
            std::env::temp_dir().join(format!("lds_conformance_oversized_fixture_{stamp}.json"));
        let oversized = "x".repeat((super::MAX_FIXTURE_BYTES + 1) as usize);
        fs::write(&fixture_path, oversized).expect("oversized fixture should be writable");

        let result = load_fixture::<Value>(&fixture_path);
        let _ = fs::remove_file(&fixture_path);

        let err = result.expect_err("oversized fixture must fail");
        assert!(err.contains("exceeds max bytes"));
    }

    #[test]
    fn load_fixture_reports_missing_files() {
        let err = load_fixture::<Value>(std::path::Path::new("/nonexistent/lds_fixture.json"))
            .expect_err("missing fixture must fail");
        assert!(err.contains("failed reading fixture metadata"));
    }

    #[test]
    fn batched_case_routes_through_both_layers() {
        let report =
            run_layer_case(&batched_case("inline_batched"), RuntimeConfig::default())
                .expect("case runs");
        assert!(report.passed(), "{report:?}");
        assert_eq!(report.forensic_log.reason_code, "dynamic_layer_routing_ok");
        assert!(report.forensic_log.passed());
    }

    #[test]
    fn mismatched_expectation_is_reported_not_raised() {
        let mut case = batched_case("inline_mismatch");
        case.expected_keys.pop();
        let report = run_layer_case(&case, RuntimeConfig::default()).expect("case runs");
        assert!(!report.passed());
        assert!(!report.routing_ok);
        assert!(report.guard_ok);
        assert_eq!(
            report.forensic_log.reason_code,
            "dynamic_layer_key_sequence_mismatch"
        );
        assert_eq!(report.forensic_log.outcome, "fail");
    }

    #[test]
    fn depth_limit_fails_closed_and_restores_state() {
        let mut case = batched_case("inline_depth_limit");
        case.max_dispatch_depth = Some(4);
        case.expected_output = None;
        case.expected_keys.truncate(4);
        case.expected_guard_actions.truncate(3);
        case.expected_level = None;
        case.expected_error = Some("reentrant_depth_exceeded".to_string());
        let report = run_layer_case(&case, RuntimeConfig::default()).expect("case runs");
        assert!(report.passed(), "{report:?}");
        assert_eq!(report.forensic_log.reason_code, "dynamic_layer_fail_closed_ok");
        assert_eq!(report.forensic_log.extra_fields["refusals"], 1);
    }

    #[test]
    fn wrong_output_level_is_an_output_mismatch() {
        let mut case = batched_case("inline_wrong_level");
        case.expected_level = Some(1);
        let report = run_layer_case(&case, RuntimeConfig::default()).expect("case runs");
        assert!(report.routing_ok);
        assert!(!report.output_ok);
        assert_eq!(report.forensic_log.reason_code, "dynamic_layer_output_mismatch");
        assert_eq!(report.forensic_log.extra_fields["output_level"], 2);
        assert!(report.forensic_log.extra_fields["output_fingerprint"].is_u64());
    }

    #[test]
    fn invalid_depth_override_is_a_fixture_error() {
        let mut case = batched_case("inline_zero_depth");
        case.max_dispatch_depth = Some(0);
        let err = run_layer_case(&case, RuntimeConfig::default()).expect_err("rejected");
        assert!(err.contains("max_dispatch_depth"));
    }

    #[test]
    fn unknown_key_in_fixture_is_a_fixture_error() {
        let mut case = batched_case("inline_unknown_key");
        case.layers = vec!["Vmap".to_string()];
        let err = run_layer_case(&case, RuntimeConfig::default()).expect_err("rejected");
        assert!(err.contains("unknown dispatch key"));
    }

    proptest! {
        #[test]
        fn prop_summarize_passes_counts_exactly(flags in proptest::collection::vec(any::<bool>(), 0..64)) {
            let (total, passed) = summarize_passes(flags.iter().copied());
            prop_assert_eq!(total, flags.len());
            prop_assert_eq!(passed, flags.iter().filter(|flag| **flag).count());
        }

        #[test]
        fn prop_vec_within_is_reflexive(values in proptest::collection::vec(-1.0e6f64..1.0e6, 0..16)) {
            prop_assert!(vec_within(&values, &values, 0.0));
            let mut longer = values.clone();
            longer.push(0.0);
            prop_assert!(!vec_within(&values, &longer, 1.0));
        }
    }
}
