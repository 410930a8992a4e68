// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use astro_core::backend::{Backend, BackendKind};
use astro_core::DynResult;

pub mod ioptron;
pub mod sim;
pub mod sim_mount;
pub mod zwo;

use ioptron::IOptronBackend;
use sim::SimZwoSdk;
use sim_mount::{SimMount, SIM_PORT};
use zwo::ZwoBackend;

/// Connection details for instantiating a device backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendAccess {
    /// Devices found through the vendor SDK's own enumeration.
    Sdk,
    Serial { path: String, baud: u32 },
    Simulated { devices: usize },
}

pub type BackendFactory = fn(BackendAccess) -> DynResult<Box<dyn Backend>>;

/// Context for registering and instantiating device backends.
#[derive(Clone)]
pub struct RegistrationContext {
    factories: HashMap<String, BackendFactory>,
}

impl RegistrationContext {
    /// Create a new empty registration context.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory under a stable name (e.g. "sim-eaf").
    pub fn register_backend(&mut self, name: &str, factory: BackendFactory) {
        let key = normalize_name(name);
        self.factories.insert(key, factory);
    }

    /// Check whether a backend name is registered.
    pub fn is_backend_registered(&self, name: &str) -> bool {
        let key = normalize_name(name);
        self.factories.contains_key(&key)
    }

    /// List registered backend names.
    pub fn registered_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate a backend based on the selected name and access method.
    pub fn build_backend(&self, name: &str, access: BackendAccess) -> DynResult<Box<dyn Backend>> {
        let key = normalize_name(name);
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| format!("Unknown device backend: {}", name))?;
        factory(access)
    }

    /// Merge another registration context into this one.
    pub fn extend_from(&mut self, other: &RegistrationContext) {
        for (name, factory) in &other.factories {
            self.factories.insert(name.clone(), *factory);
        }
    }
}

impl Default for RegistrationContext {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Register all built-in backends enabled by features on a context.
///
/// Real ZWO SDK bindings live outside this crate and register their own
/// factories around `zwo::ZwoBackend`.
pub fn register_builtin_backends_on(context: &mut RegistrationContext) {
    context.register_backend("sim-eaf", sim_eaf_factory);
    context.register_backend("sim-caa", sim_caa_factory);
    context.register_backend("sim-ioptron", sim_ioptron_factory);
    #[cfg(feature = "serial")]
    context.register_backend("ioptron", ioptron_factory);
}

fn simulated_devices(access: &BackendAccess) -> usize {
    match access {
        BackendAccess::Simulated { devices } => (*devices).max(1),
        _ => 1,
    }
}

fn sim_eaf_factory(access: BackendAccess) -> DynResult<Box<dyn Backend>> {
    let sdk = SimZwoSdk::new(BackendKind::ZwoEaf, simulated_devices(&access));
    Ok(Box::new(ZwoBackend::new(sdk)))
}

fn sim_caa_factory(access: BackendAccess) -> DynResult<Box<dyn Backend>> {
    let sdk = SimZwoSdk::new(BackendKind::ZwoCaa, simulated_devices(&access));
    Ok(Box::new(ZwoBackend::new(sdk)))
}

fn sim_ioptron_factory(_access: BackendAccess) -> DynResult<Box<dyn Backend>> {
    let mount = SimMount::new();
    Ok(Box::new(IOptronBackend::new(
        vec![SIM_PORT.to_string()],
        Box::new(mount.connector()),
    )))
}

#[cfg(feature = "serial")]
fn ioptron_factory(access: BackendAccess) -> DynResult<Box<dyn Backend>> {
    match access {
        BackendAccess::Serial { path, baud } => Ok(Box::new(IOptronBackend::new(
            vec![path],
            Box::new(ioptron::SerialConnector::new(baud)),
        ))),
        _ => Err("iOptron mounts only support serial access".into()),
    }
}
