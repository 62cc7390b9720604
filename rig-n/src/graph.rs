/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Dependency-ordered device construction for one node.
//!
//! [`DeviceGraphBuilder`] turns the `devices` map of a [`NodeConfig`] into
//! built devices.  A device may reference other devices of the same node with
//! `{ ref: uid }`; those are built first and injected into its keyword
//! arguments as live objects.
//!
//! # Failure model
//!
//! | Stage | Error kind | Effect on others |
//! |---|---|---|
//! | reference to a failed / undeclared device | `dependency` | none beyond the dependents |
//! | device on a reference cycle | `circular` | every cycle member fails; waiters get `dependency` |
//! | target not in the registry | `import` | dependents get `dependency` |
//! | constructor error or panic | `instantiation` | dependents get `dependency` |
//!
//! [`build`](DeviceGraphBuilder::build) never fails.  Every declared uid ends up
//! in exactly one of [`BuildOutcome::built`] / [`BuildOutcome::errors`].
//!
//! All per-run state (memo tables, the in-progress stack) is local to one
//! `build()` call, so repeated calls never observe each other.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rig_proto::{BuildErrorKind, DeviceBuildError, DeviceSpec, DeviceType, NodeConfig, SpecValue};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::device::{Arg, Device, Kwargs};
use crate::registry::DeviceRegistry;

// ── Results ───────────────────────────────────────────────────────────────────

/// One successfully constructed device.
#[derive(Debug, Clone)]
pub struct BuiltDevice {
    pub device: Arc<dyn Device>,
    pub device_type: DeviceType,
}

/// Partition of a node's devices into successes and failures.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub built: BTreeMap<String, BuiltDevice>,
    pub errors: BTreeMap<String, DeviceBuildError>,
}

/// Memo tables and the in-progress path of one `build()` call.
struct BuildState<'c> {
    specs: &'c BTreeMap<String, DeviceSpec>,
    stack: Vec<String>,
    outcome: BuildOutcome,
}

// ── DeviceGraphBuilder ────────────────────────────────────────────────────────

pub struct DeviceGraphBuilder<'r> {
    registry: &'r DeviceRegistry,
}

impl<'r> DeviceGraphBuilder<'r> {
    pub fn new(registry: &'r DeviceRegistry) -> Self {
        Self { registry }
    }

    /// Builds every device declared in `config`.
    pub fn build(&self, config: &NodeConfig) -> BuildOutcome {
        info!(
            node = %config.node_id,
            devices = config.devices.len(),
            "Building device graph"
        );

        let mut state = BuildState {
            specs: &config.devices,
            stack: Vec::new(),
            outcome: BuildOutcome::default(),
        };

        // BTreeMap order keeps the pass (and the cycle paths it reports)
        // deterministic.
        for uid in config.devices.keys() {
            // Failures are recorded in `state`; nothing to do with them here.
            let _ = self.build_one(uid, &mut state);
        }

        let outcome = state.outcome;
        if outcome.errors.is_empty() {
            info!(
                node = %config.node_id,
                built = outcome.built.len(),
                "Device graph built"
            );
        } else {
            warn!(
                node = %config.node_id,
                built = outcome.built.len(),
                failed = outcome.errors.len(),
                "Device graph built with failures"
            );
        }
        outcome
    }

    /// Builds `uid` (and its dependencies) or returns the recorded failure.
    fn build_one(
        &self,
        uid: &str,
        state: &mut BuildState<'_>,
    ) -> Result<Arc<dyn Device>, DeviceBuildError> {
        if let Some(built) = state.outcome.built.get(uid) {
            return Ok(Arc::clone(&built.device));
        }
        if let Some(err) = state.outcome.errors.get(uid) {
            return Err(err.clone());
        }

        // Re-entered while still in progress: everything from the first visit
        // to here is a cycle.
        if let Some(pos) = state.stack.iter().position(|u| u == uid) {
            return Err(record_cycle(state, pos));
        }

        let specs = state.specs;
        let Some(spec) = specs.get(uid) else {
            return Err(DeviceBuildError::new(
                uid,
                BuildErrorKind::Dependency,
                "device is not declared on this node",
            ));
        };

        state.stack.push(uid.to_string());
        let result = self.build_declared(uid, spec, state);
        state.stack.pop();

        match result {
            Ok(built) => {
                if let Some(err) = state.outcome.errors.get(uid) {
                    // A cycle was recorded against this uid while it was on the
                    // stack; the cycle verdict wins.
                    if let Err(e) = built.device.close() {
                        warn!(uid = %uid, "device close failed: {e}");
                    }
                    return Err(err.clone());
                }
                debug!(uid = %uid, device_type = %built.device_type, "✓ built");
                let device = Arc::clone(&built.device);
                state.outcome.built.insert(uid.to_string(), built);
                Ok(device)
            }
            Err(err) => {
                let recorded = state
                    .outcome
                    .errors
                    .entry(uid.to_string())
                    .or_insert(err)
                    .clone();
                warn!(
                    uid = %uid,
                    kind = %recorded.kind,
                    error = %recorded.message,
                    "✗ build failed"
                );
                Err(recorded)
            }
        }
    }

    /// Dependencies → target resolution → kwargs injection → instantiation.
    fn build_declared(
        &self,
        uid: &str,
        spec: &DeviceSpec,
        state: &mut BuildState<'_>,
    ) -> Result<BuiltDevice, DeviceBuildError> {
        for dep in spec.dependencies() {
            if !state.specs.contains_key(&dep) {
                return Err(DeviceBuildError::new(
                    uid,
                    BuildErrorKind::Dependency,
                    format!("references device '{dep}' which is not declared on this node"),
                ));
            }
            if let Err(err) = self.build_one(&dep, state) {
                return Err(DeviceBuildError::new(
                    uid,
                    BuildErrorKind::Dependency,
                    format!("dependency '{dep}' failed to build: {}", err.message),
                ));
            }
        }

        let constructor = self.registry.get(&spec.target).ok_or_else(|| {
            DeviceBuildError::new(
                uid,
                BuildErrorKind::Import,
                format!("no device registered for target '{}'", spec.target),
            )
        })?;

        let mut kwargs = Kwargs::new();
        for (name, value) in &spec.kwargs {
            let arg = resolve(value, &state.outcome.built).map_err(|message| {
                DeviceBuildError::new(uid, BuildErrorKind::Dependency, message)
            })?;
            kwargs.insert(name.clone(), arg);
        }
        kwargs
            .entry("uid".to_string())
            .or_insert_with(|| Arg::Value(Value::String(uid.to_string())));

        match panic::catch_unwind(AssertUnwindSafe(|| constructor(uid, kwargs))) {
            Ok(Ok(device)) => Ok(BuiltDevice {
                device_type: device.device_type(),
                device,
            }),
            Ok(Err(err)) => Err(DeviceBuildError::new(
                uid,
                BuildErrorKind::Instantiation,
                err.to_string(),
            )
            .with_trace(format!("{err:?}"))),
            Err(payload) => Err(DeviceBuildError::new(
                uid,
                BuildErrorKind::Instantiation,
                format!("constructor panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Marks every uid of `stack[pos..]` as circular and returns the error of the
/// uid that closed the cycle.
fn record_cycle(state: &mut BuildState<'_>, pos: usize) -> DeviceBuildError {
    let members: Vec<String> = state.stack.iter().skip(pos).cloned().collect();
    let mut path = members.clone();
    path.extend(members.first().cloned());
    let message = format!("circular dependency: {}", path.join(" -> "));

    for member in &members {
        state
            .outcome
            .errors
            .entry(member.clone())
            .or_insert_with(|| {
                DeviceBuildError::new(member.clone(), BuildErrorKind::Circular, message.clone())
            });
    }

    let head = members.first().cloned().unwrap_or_default();
    DeviceBuildError::new(head, BuildErrorKind::Circular, message)
}

/// Replaces every reference in `value` with the built device it names.
fn resolve(value: &SpecValue, built: &BTreeMap<String, BuiltDevice>) -> Result<Arg, String> {
    match value {
        SpecValue::Ref(r) => built
            .get(&r.uid)
            .map(|b| Arg::Device(Arc::clone(&b.device)))
            .ok_or_else(|| format!("reference to '{}' could not be resolved", r.uid)),
        SpecValue::List(items) => items
            .iter()
            .map(|v| resolve(v, built))
            .collect::<Result<Vec<_>, _>>()
            .map(Arg::List),
        SpecValue::Map(map) => map
            .iter()
            .map(|(k, v)| resolve(v, built).map(|arg| (k.clone(), arg)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Arg::Map),
        literal => Ok(Arg::Value(literal.to_json())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn node(devices: &[(&str, DeviceSpec)]) -> NodeConfig {
        devices
            .iter()
            .fold(NodeConfig::new("node01", "localhost"), |cfg, (uid, spec)| {
                cfg.with_device(*uid, spec.clone())
            })
    }

    fn generic() -> DeviceSpec {
        DeviceSpec::new("sim.Generic")
    }

    fn assert_partition(config: &NodeConfig, outcome: &BuildOutcome) {
        let built: BTreeSet<_> = outcome.built.keys().cloned().collect();
        let failed: BTreeSet<_> = outcome.errors.keys().cloned().collect();
        let declared: BTreeSet<_> = config.devices.keys().cloned().collect();
        assert!(built.is_disjoint(&failed), "a uid is both built and failed");
        assert_eq!(
            built.union(&failed).cloned().collect::<BTreeSet<_>>(),
            declared,
            "built ∪ errors must equal the declared uids"
        );
    }

    // ── Partition ─────────────────────────────────────────────────────────────

    #[test]
    fn every_uid_lands_in_exactly_one_map() {
        let registry = DeviceRegistry::with_builtin();
        let config = node(&[
            ("ok", generic()),
            ("ok_dep", generic().with_kwarg("link", SpecValue::reference("ok"))),
            ("bad_target", DeviceSpec::new("vendor.Missing")),
            ("on_bad", generic().with_kwarg("link", SpecValue::reference("bad_target"))),
            ("cyc_a", generic().with_kwarg("x", SpecValue::reference("cyc_b"))),
            ("cyc_b", generic().with_kwarg("x", SpecValue::reference("cyc_a"))),
            ("self_ref", generic().with_kwarg("me", SpecValue::reference("self_ref"))),
            ("faulty", generic().with_kwarg("simulate_fault", true)),
            ("dangling", generic().with_kwarg("x", SpecValue::reference("nowhere"))),
        ]);

        let outcome = DeviceGraphBuilder::new(&registry).build(&config);

        assert_partition(&config, &outcome);
        assert!(outcome.built.contains_key("ok"));
        assert!(outcome.built.contains_key("ok_dep"));
        assert_eq!(outcome.built.len(), 2);
    }

    #[test]
    fn empty_config_builds_nothing() {
        let registry = DeviceRegistry::with_builtin();
        let outcome = DeviceGraphBuilder::new(&registry).build(&node(&[]));
        assert!(outcome.built.is_empty());
        assert!(outcome.errors.is_empty());
    }

    // ── Cycles ────────────────────────────────────────────────────────────────

    #[test]
    fn mutual_reference_is_contained() {
        let registry = DeviceRegistry::with_builtin();
        let config = node(&[
            ("A", generic().with_kwarg("peer", SpecValue::reference("B"))),
            ("B", generic().with_kwarg("peer", SpecValue::reference("A"))),
            ("C", generic()),
        ]);

        let outcome = DeviceGraphBuilder::new(&registry).build(&config);

        assert!(outcome.built.contains_key("C"));
        for uid in ["A", "B"] {
            let err = &outcome.errors[uid];
            assert!(
                matches!(
                    err.kind,
                    BuildErrorKind::Circular | BuildErrorKind::Dependency
                ),
                "{uid}: unexpected kind {}",
                err.kind
            );
        }
        assert_eq!(outcome.errors["A"].kind, BuildErrorKind::Circular);
        assert_eq!(outcome.errors["B"].kind, BuildErrorKind::Circular);
        assert!(outcome.errors["A"].message.contains("A -> B -> A"));
    }

    #[test]
    fn self_reference_is_circular() {
        let registry = DeviceRegistry::with_builtin();
        let config = node(&[("S", generic().with_kwarg("me", SpecValue::reference("S")))]);
        let outcome = DeviceGraphBuilder::new(&registry).build(&config);
        assert_eq!(outcome.errors["S"].kind, BuildErrorKind::Circular);
    }

    #[test]
    fn waiter_on_a_cycle_gets_dependency_error() {
        let registry = DeviceRegistry::with_builtin();
        let config = node(&[
            ("A", generic().with_kwarg("peer", SpecValue::reference("B"))),
            ("B", generic().with_kwarg("peer", SpecValue::reference("A"))),
            ("D", generic().with_kwarg("uses", SpecValue::reference("A"))),
        ]);
        let outcome = DeviceGraphBuilder::new(&registry).build(&config);
        assert_eq!(outcome.errors["D"].kind, BuildErrorKind::Dependency);
        assert!(outcome.errors["D"].message.contains("'A'"));
    }

    // ── Dependency propagation ────────────────────────────────────────────────

    #[test]
    fn import_failure_propagates_to_dependents() {
        let registry = DeviceRegistry::with_builtin();
        let config = node(&[
            ("A", DeviceSpec::new("vendor.DoesNotExist")),
            ("B", generic().with_kwarg("source", SpecValue::reference("A"))),
        ]);

        let outcome = DeviceGraphBuilder::new(&registry).build(&config);

        assert_eq!(outcome.errors["A"].kind, BuildErrorKind::Import);
        let b = &outcome.errors["B"];
        assert_eq!(b.kind, BuildErrorKind::Dependency);
        assert!(b.message.contains("'A'"), "message should name A: {}", b.message);
    }

    #[test]
    fn undeclared_reference_is_a_dependency_error() {
        let registry = DeviceRegistry::with_builtin();
        let config = node(&[("A", generic().with_kwarg("x", SpecValue::reference("ghost")))]);
        let outcome = DeviceGraphBuilder::new(&registry).build(&config);
        assert_eq!(outcome.errors["A"].kind, BuildErrorKind::Dependency);
        assert!(outcome.errors["A"].message.contains("ghost"));
    }

    #[test]
    fn string_equal_to_a_uid_is_not_a_dependency() {
        let registry = DeviceRegistry::with_builtin();
        let config = node(&[
            ("A", DeviceSpec::new("vendor.DoesNotExist")),
            ("B", generic().with_kwarg("label", "A")),
        ]);
        let outcome = DeviceGraphBuilder::new(&registry).build(&config);
        assert!(outcome.built.contains_key("B"));
    }

    // ── Instantiation ─────────────────────────────────────────────────────────

    #[test]
    fn constructor_error_is_instantiation_with_trace() {
        let registry = DeviceRegistry::with_builtin();
        let config = node(&[("cam0", DeviceSpec::new("sim.Camera").with_kwarg("simulate_fault", true))]);
        let outcome = DeviceGraphBuilder::new(&registry).build(&config);
        let err = &outcome.errors["cam0"];
        assert_eq!(err.kind, BuildErrorKind::Instantiation);
        assert!(err.message.contains("simulated hardware fault"));
        assert!(err.trace.is_some());
    }

    #[test]
    fn constructor_panic_is_contained() {
        let mut registry = DeviceRegistry::new();
        registry.register("test.Panics", |_uid: &str, _kwargs: Kwargs| -> anyhow::Result<Arc<dyn Device>> {
            panic!("driver exploded")
        });
        registry.register("test.Fine", |uid: &str, kwargs: Kwargs| {
            let device: Arc<dyn Device> = Arc::new(SimDevice::new(uid, DeviceType::Generic, kwargs)?);
            Ok(device)
        });
        let config = node(&[
            ("boom", DeviceSpec::new("test.Panics")),
            ("fine", DeviceSpec::new("test.Fine")),
        ]);
        let outcome = DeviceGraphBuilder::new(&registry).build(&config);
        assert!(outcome.errors["boom"].message.contains("driver exploded"));
        assert!(outcome.built.contains_key("fine"));
    }

    // ── Injection ─────────────────────────────────────────────────────────────

    #[test]
    fn references_are_injected_as_built_devices() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let mut registry = DeviceRegistry::with_builtin();
        let sink = Arc::clone(&seen);
        registry.register("test.Recorder", move |uid: &str, kwargs: Kwargs| {
            let mut log = sink.lock().unwrap();
            for (name, arg) in &kwargs {
                match arg {
                    Arg::Device(d) => log.push(format!("{name}=device:{}", d.uid())),
                    other => log.push(format!("{name}={}", other.to_json())),
                }
            }
            let device: Arc<dyn Device> = Arc::new(SimDevice::new(uid, DeviceType::Generic, Kwargs::new())?);
            Ok(device)
        });

        let config = node(&[
            ("ctrl", generic()),
            (
                "rec",
                DeviceSpec::new("test.Recorder")
                    .with_kwarg("controller", SpecValue::reference("ctrl"))
                    .with_kwarg("gain", 2i64),
            ),
        ]);
        let outcome = DeviceGraphBuilder::new(&registry).build(&config);
        assert!(outcome.built.contains_key("rec"));

        let log = seen.lock().unwrap();
        assert!(log.contains(&"controller=device:ctrl".to_string()));
        assert!(log.contains(&"gain=2".to_string()));
        assert!(log.contains(&"uid=\"rec\"".to_string()), "uid must be injected: {log:?}");
    }

    #[test]
    fn shared_dependency_is_built_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = DeviceRegistry::with_builtin();
        let counter = Arc::clone(&count);
        registry.register("test.Counted", move |uid: &str, kwargs: Kwargs| {
            counter.fetch_add(1, Ordering::SeqCst);
            let device: Arc<dyn Device> = Arc::new(SimDevice::new(uid, DeviceType::Generic, kwargs)?);
            Ok(device)
        });

        // diamond: left and right both use base
        let config = node(&[
            ("base", DeviceSpec::new("test.Counted")),
            ("left", generic().with_kwarg("b", SpecValue::reference("base"))),
            ("right", generic().with_kwarg("b", SpecValue::reference("base"))),
        ]);
        let outcome = DeviceGraphBuilder::new(&registry).build(&config);
        assert_eq!(outcome.built.len(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_builds_do_not_share_state() {
        let registry = DeviceRegistry::with_builtin();
        let builder = DeviceGraphBuilder::new(&registry);
        let bad = node(&[("A", DeviceSpec::new("vendor.Missing"))]);
        let good = node(&[("A", generic())]);

        assert!(builder.build(&bad).errors.contains_key("A"));
        assert!(builder.build(&good).built.contains_key("A"));
    }
}
