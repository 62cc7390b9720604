/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Explicit `target → constructor` registry.
//!
//! A [`DeviceSpec`](rig_proto::DeviceSpec) names its constructor by a string
//! target such as `sim.Camera`.  Resolution is a plain map lookup; an unknown
//! target is an `import` build error, not a crash.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::device::{Device, Kwargs};
use crate::sim;

/// Builds one device from its uid and resolved keyword arguments.
pub type Constructor =
    Arc<dyn Fn(&str, Kwargs) -> anyhow::Result<Arc<dyn Device>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the simulated devices (`sim.*`).
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        sim::register(&mut registry);
        registry
    }

    /// Registers `constructor` under `target`, replacing any previous entry.
    pub fn register<F>(&mut self, target: impl Into<String>, constructor: F)
    where
        F: Fn(&str, Kwargs) -> anyhow::Result<Arc<dyn Device>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(target.into(), Arc::new(constructor));
    }

    pub fn get(&self, target: &str) -> Option<Constructor> {
        self.constructors.get(target).cloned()
    }

    pub fn contains(&self, target: &str) -> bool {
        self.constructors.contains_key(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("targets", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}
