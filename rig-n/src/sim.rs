/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Simulated devices.
//!
//! Registered as `sim.Camera`, `sim.Laser`, `sim.Axis`, `sim.Daq` and
//! `sim.Generic`.  Each one is a property table plus a handful of commands, so a
//! whole rig can be brought up on a laptop.
//!
//! Keyword arguments:
//! * literal values seed (or add) properties,
//! * device arguments are recorded as links and show up in the interface
//!   metadata under `links`,
//! * `simulate_fault: true` makes construction fail.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::bail;
use rig_proto::device::{CommandInfo, PropertyInfo};
use rig_proto::{DeviceInterface, DeviceType};
use serde_json::{json, Value};

use crate::device::{Arg, Device, DeviceError, Kwargs};
use crate::registry::DeviceRegistry;

/// Registry targets provided by this module.
pub const TARGETS: [(&str, DeviceType); 5] = [
    ("sim.Camera", DeviceType::Camera),
    ("sim.Laser", DeviceType::Laser),
    ("sim.Axis", DeviceType::Axis),
    ("sim.Daq", DeviceType::Daq),
    ("sim.Generic", DeviceType::Generic),
];

pub fn register(registry: &mut DeviceRegistry) {
    for (target, device_type) in TARGETS {
        registry.register(target, move |uid: &str, kwargs: Kwargs| {
            let device: Arc<dyn Device> = Arc::new(SimDevice::new(uid, device_type, kwargs)?);
            Ok(device)
        });
    }
}

// ── Property table ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimProp {
    value: Value,
    writable: bool,
    units: Option<&'static str>,
}

impl SimProp {
    fn rw(value: Value, units: Option<&'static str>) -> Self {
        Self {
            value,
            writable: true,
            units,
        }
    }

    fn ro(value: Value, units: Option<&'static str>) -> Self {
        Self {
            value,
            writable: false,
            units,
        }
    }
}

fn default_props(device_type: DeviceType) -> BTreeMap<String, SimProp> {
    let props = match device_type {
        DeviceType::Camera => vec![
            ("exposure_ms", SimProp::rw(json!(10.0), Some("ms"))),
            ("binning", SimProp::rw(json!(1), None)),
            ("frame_count", SimProp::ro(json!(0), None)),
        ],
        DeviceType::Laser => vec![
            ("power_mw", SimProp::rw(json!(0.0), Some("mW"))),
            ("max_power_mw", SimProp::ro(json!(100.0), Some("mW"))),
            ("wavelength_nm", SimProp::ro(json!(488), Some("nm"))),
            ("enabled", SimProp::ro(json!(false), None)),
        ],
        DeviceType::Axis => vec![
            ("position_mm", SimProp::ro(json!(0.0), Some("mm"))),
            ("speed_mm_s", SimProp::rw(json!(1.0), Some("mm/s"))),
        ],
        DeviceType::Daq => vec![
            ("sample_rate_hz", SimProp::rw(json!(1000.0), Some("Hz"))),
            ("running", SimProp::ro(json!(false), None)),
        ],
        DeviceType::Generic => vec![],
    };
    props
        .into_iter()
        .map(|(name, prop)| (name.to_string(), prop))
        .collect()
}

type CommandDef = (&'static str, &'static str, &'static [&'static str]);

const NO_PARAMS: &[&str] = &[];

const CAMERA_COMMANDS: &[CommandDef] = &[("snap", "acquire one frame", NO_PARAMS)];

const LASER_COMMANDS: &[CommandDef] = &[
    ("enable", "turn emission on", NO_PARAMS),
    ("disable", "turn emission off", NO_PARAMS),
];

const AXIS_COMMANDS: &[CommandDef] = &[
    ("move_abs", "move to an absolute position", &["position_mm"]),
    ("move_rel", "move by a relative distance", &["delta_mm"]),
    ("home", "return to zero", NO_PARAMS),
];

const DAQ_COMMANDS: &[CommandDef] = &[
    ("start", "start sampling", NO_PARAMS),
    ("stop", "stop sampling", NO_PARAMS),
];

fn command_table(device_type: DeviceType) -> &'static [CommandDef] {
    match device_type {
        DeviceType::Camera => CAMERA_COMMANDS,
        DeviceType::Laser => LASER_COMMANDS,
        DeviceType::Axis => AXIS_COMMANDS,
        DeviceType::Daq => DAQ_COMMANDS,
        DeviceType::Generic => NO_COMMANDS,
    }
}

const NO_COMMANDS: &[CommandDef] = &[];

// ── SimDevice ─────────────────────────────────────────────────────────────────

pub struct SimDevice {
    uid: String,
    device_type: DeviceType,
    props: Mutex<BTreeMap<String, SimProp>>,
    links: BTreeMap<String, String>,
    closed: AtomicBool,
}

impl SimDevice {
    pub fn new(uid: &str, device_type: DeviceType, kwargs: Kwargs) -> anyhow::Result<Self> {
        let mut props = default_props(device_type);
        let mut links = BTreeMap::new();

        for (name, arg) in kwargs {
            if name == "uid" {
                continue;
            }
            if name == "simulate_fault" {
                if matches!(arg, Arg::Value(Value::Bool(true))) {
                    bail!("simulated hardware fault while opening '{uid}'");
                }
                continue;
            }
            match arg {
                Arg::Device(dep) => {
                    links.insert(name, dep.uid().to_string());
                }
                other => {
                    let value = other.to_json();
                    match props.get_mut(&name) {
                        Some(prop) => prop.value = value,
                        None => {
                            props.insert(name, SimProp::rw(value, None));
                        }
                    }
                }
            }
        }

        Ok(Self {
            uid: uid.to_string(),
            device_type,
            props: Mutex::new(props),
            links,
            closed: AtomicBool::new(false),
        })
    }

    fn table(&self) -> Result<MutexGuard<'_, BTreeMap<String, SimProp>>, DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.fault("device is closed"));
        }
        self.props
            .lock()
            .map_err(|_| self.fault("property table poisoned"))
    }

    fn fault(&self, message: &str) -> DeviceError {
        DeviceError::Fault {
            uid: self.uid.clone(),
            message: message.to_string(),
        }
    }

    fn number(&self, table: &BTreeMap<String, SimProp>, name: &str) -> f64 {
        table
            .get(name)
            .and_then(|p| p.value.as_f64())
            .unwrap_or_default()
    }

    fn put(table: &mut BTreeMap<String, SimProp>, name: &str, value: Value) {
        if let Some(prop) = table.get_mut(name) {
            prop.value = value;
        }
    }
}

fn number_arg(args: &[Value], index: usize, operation: &str) -> Result<f64, DeviceError> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| DeviceError::InvalidArgument {
            operation: operation.to_string(),
            reason: format!("expected a number at position {index}"),
        })
}

impl Device for SimDevice {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn interface(&self) -> DeviceInterface {
        let properties = self
            .props
            .lock()
            .map(|table| {
                table
                    .iter()
                    .map(|(name, prop)| {
                        let info = PropertyInfo {
                            description: String::new(),
                            writable: prop.writable,
                            units: prop.units.map(str::to_string),
                        };
                        (name.clone(), info)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let commands = command_table(self.device_type)
            .iter()
            .map(|(name, description, params)| {
                let info = CommandInfo {
                    description: description.to_string(),
                    params: params.iter().map(|p| p.to_string()).collect(),
                };
                (name.to_string(), info)
            })
            .collect();

        let mut metadata = BTreeMap::new();
        metadata.insert("simulated".to_string(), Value::Bool(true));
        if !self.links.is_empty() {
            metadata.insert("links".to_string(), json!(self.links));
        }

        DeviceInterface {
            uid: self.uid.clone(),
            device_type: self.device_type,
            commands,
            properties,
            metadata,
        }
    }

    fn call(&self, command: &str, args: &[Value]) -> Result<Value, DeviceError> {
        let mut table = self.table()?;

        match (self.device_type, command) {
            (DeviceType::Camera, "snap") => {
                let frame = self.number(&table, "frame_count") as u64 + 1;
                Self::put(&mut table, "frame_count", json!(frame));
                let exposure = self.number(&table, "exposure_ms");
                Ok(json!({ "frame": frame, "exposure_ms": exposure }))
            }
            (DeviceType::Laser, "enable") => {
                Self::put(&mut table, "enabled", json!(true));
                Ok(Value::Null)
            }
            (DeviceType::Laser, "disable") => {
                Self::put(&mut table, "enabled", json!(false));
                Ok(Value::Null)
            }
            (DeviceType::Axis, "move_abs") => {
                let target = number_arg(args, 0, command)?;
                Self::put(&mut table, "position_mm", json!(target));
                Ok(json!(target))
            }
            (DeviceType::Axis, "move_rel") => {
                let target = self.number(&table, "position_mm") + number_arg(args, 0, command)?;
                Self::put(&mut table, "position_mm", json!(target));
                Ok(json!(target))
            }
            (DeviceType::Axis, "home") => {
                Self::put(&mut table, "position_mm", json!(0.0));
                Ok(json!(0.0))
            }
            (DeviceType::Daq, "start") => {
                Self::put(&mut table, "running", json!(true));
                Ok(Value::Null)
            }
            (DeviceType::Daq, "stop") => {
                Self::put(&mut table, "running", json!(false));
                Ok(Value::Null)
            }
            _ => Err(DeviceError::UnknownCommand {
                uid: self.uid.clone(),
                command: command.to_string(),
            }),
        }
    }

    fn get_prop(&self, name: &str) -> Result<Value, DeviceError> {
        let table = self.table()?;
        table
            .get(name)
            .map(|p| p.value.clone())
            .ok_or_else(|| DeviceError::UnknownProperty {
                uid: self.uid.clone(),
                name: name.to_string(),
            })
    }

    fn set_prop(&self, name: &str, value: Value) -> Result<(), DeviceError> {
        let mut table = self.table()?;

        if self.device_type == DeviceType::Laser && name == "power_mw" {
            let max = self.number(&table, "max_power_mw");
            match value.as_f64() {
                Some(p) if (0.0..=max).contains(&p) => {}
                _ => {
                    return Err(DeviceError::InvalidArgument {
                        operation: "set power_mw".to_string(),
                        reason: format!("power must be a number in 0..={max} mW"),
                    })
                }
            }
        }

        let prop = table
            .get_mut(name)
            .ok_or_else(|| DeviceError::UnknownProperty {
                uid: self.uid.clone(),
                name: name.to_string(),
            })?;
        if !prop.writable {
            return Err(DeviceError::ReadOnly {
                uid: self.uid.clone(),
                name: name.to_string(),
            });
        }
        prop.value = value;
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
