// Variable resolution: layered precedence merge into a per-host inject context

mod hostvars;

pub use hostvars::*;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::inventory::InventorySource;
use crate::value::{combine, to_object, to_plain_string, VarMap};

/// Per-host variable cache (gathered facts, `set_fact` results)
pub type VarCache = DashMap<String, VarMap>;

/// Variable sources in increasing precedence order.
///
/// Later layers always win on key collision. `Inventory`, `Facts`,
/// `RuntimeVars` and `ExtraVars` are filled by the resolver from the run's
/// shared state; the rest come from the caller through [`VarLayers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VarLayer {
    Defaults,
    Inventory,
    Facts,
    PlayVars,
    PlayFileVars,
    RoleVars,
    TaskVars,
    RuntimeVars,
    RoleParams,
    ExtraVars,
}

impl VarLayer {
    pub const ALL: [VarLayer; 10] = [
        VarLayer::Defaults,
        VarLayer::Inventory,
        VarLayer::Facts,
        VarLayer::PlayVars,
        VarLayer::PlayFileVars,
        VarLayer::RoleVars,
        VarLayer::TaskVars,
        VarLayer::RuntimeVars,
        VarLayer::RoleParams,
        VarLayer::ExtraVars,
    ];
}

/// Keys the engine injects last; user variables never shadow them
pub const RESERVED_KEYS: &[&str] = &[
    "group_names",
    "groups",
    "hostvars",
    "omit",
    "playbook_dir",
    "inventory_hostname",
    "inventory_hostname_short",
    "vars",
    "defaults",
];

/// Statically configured variable layers supplied with a task
#[derive(Debug, Clone, Default)]
pub struct VarLayers {
    layers: BTreeMap<VarLayer, VarMap>,
}

impl VarLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, layer: VarLayer, vars: VarMap) -> Self {
        self.set(layer, vars);
        self
    }

    /// Merge `vars` into a layer
    pub fn set(&mut self, layer: VarLayer, vars: VarMap) {
        combine(self.layers.entry(layer).or_default(), &vars);
    }

    pub fn insert(&mut self, layer: VarLayer, key: impl Into<String>, value: Value) {
        self.layers.entry(layer).or_default().insert(key.into(), value);
    }

    pub fn get(&self, layer: VarLayer) -> Option<&VarMap> {
        self.layers.get(&layer)
    }
}

/// The fully merged variable mapping visible to one host/task pair
#[derive(Clone, Default)]
pub struct InjectContext {
    vars: VarMap,
    hostvars: Option<Arc<HostVars>>,
}

impl fmt::Debug for InjectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectContext")
            .field("vars", &self.vars)
            .field("hostvars", &self.hostvars.is_some())
            .finish()
    }
}

impl InjectContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(vars: VarMap) -> Self {
        InjectContext {
            vars,
            hostvars: None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Insert only when the key is not already present
    pub fn set_default(&mut self, key: impl Into<String>, value: Value) {
        self.vars.entry(key.into()).or_insert(value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.vars.shift_remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// String form of a variable; `None` for missing or null values
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.vars.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(to_plain_string(v)),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.vars.keys()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn hostvars(&self) -> Option<&Arc<HostVars>> {
        self.hostvars.as_ref()
    }

    pub fn set_hostvars(&mut self, hostvars: Arc<HostVars>) {
        self.hostvars = Some(hostvars);
    }

    /// Look up another host's variables through `hostvars`
    pub fn host_vars_for(&self, host: &str) -> Option<Value> {
        self.hostvars.as_ref().and_then(|hv| hv.get(host))
    }

    pub fn as_map(&self) -> &VarMap {
        &self.vars
    }
}

/// Reserved values the engine injects into every context
#[derive(Debug, Clone, Default)]
pub struct ReservedVars {
    pub omit: String,
    pub playbook_dir: String,
    pub remote_user: Option<String>,
}

/// Builds inject contexts for hosts of one run.
///
/// The resolver owns the run's single [`HostVars`] view and hands a shared
/// reference to every context it produces.
pub struct VariableResolver {
    inventory: Arc<dyn InventorySource>,
    facts_cache: Arc<VarCache>,
    vars_cache: Arc<VarCache>,
    extra_vars: VarMap,
    reserved: ReservedVars,
    hostvars: Arc<HostVars>,
}

impl VariableResolver {
    pub fn new(
        inventory: Arc<dyn InventorySource>,
        templar: Arc<dyn crate::template::Templar>,
        facts_cache: Arc<VarCache>,
        vars_cache: Arc<VarCache>,
        extra_vars: VarMap,
        reserved: ReservedVars,
    ) -> Self {
        let hostvars = Arc::new(HostVars::new(
            inventory.clone(),
            templar,
            facts_cache.clone(),
            vars_cache.clone(),
            extra_vars.clone(),
        ));

        VariableResolver {
            inventory,
            facts_cache,
            vars_cache,
            extra_vars,
            reserved,
            hostvars,
        }
    }

    pub fn hostvars(&self) -> &Arc<HostVars> {
        &self.hostvars
    }

    /// Merge every layer for `host`, lowest precedence first
    pub fn resolve(&self, host: &str, layers: &VarLayers) -> InjectContext {
        let host_vars = self.inventory.get_variables(host).unwrap_or_default();
        let mut merged = VarMap::new();

        for layer in VarLayer::ALL {
            if let Some(vars) = layers.get(layer) {
                combine(&mut merged, vars);
            }
            match layer {
                VarLayer::Inventory => combine(&mut merged, &host_vars),
                VarLayer::Facts => {
                    if let Some(facts) = self.facts_cache.get(host) {
                        combine(&mut merged, facts.value());
                    }
                }
                VarLayer::RuntimeVars => {
                    if let Some(runtime) = self.vars_cache.get(host) {
                        combine(&mut merged, runtime.value());
                    }
                }
                VarLayer::ExtraVars => combine(&mut merged, &self.extra_vars),
                _ => {}
            }
        }

        let mut inject = InjectContext::from_map(merged);

        if let Some(user) = &self.reserved.remote_user {
            inject.set_default("ansible_ssh_user", Value::String(user.clone()));
        }

        let group_names = host_vars
            .get("group_names")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let groups = serde_json::to_value(self.inventory.groups_list())
            .unwrap_or_else(|_| Value::Object(Default::default()));
        let short = host.split('.').next().unwrap_or(host).to_string();

        inject.insert("group_names", group_names);
        inject.insert("groups", groups);
        inject.insert("omit", Value::String(self.reserved.omit.clone()));
        inject.insert(
            "playbook_dir",
            Value::String(self.reserved.playbook_dir.clone()),
        );
        inject.insert("inventory_hostname", Value::String(host.to_string()));
        inject.insert("inventory_hostname_short", Value::String(short));
        inject.insert(
            "vars",
            Value::Object(to_object(
                layers.get(VarLayer::TaskVars).unwrap_or(&VarMap::new()),
            )),
        );
        inject.insert(
            "defaults",
            Value::Object(to_object(
                layers.get(VarLayer::Defaults).unwrap_or(&VarMap::new()),
            )),
        );
        inject.set_hostvars(self.hostvars.clone());

        inject
    }
}
