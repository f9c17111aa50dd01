// Lazy, memoized per-host variable view exposed as `hostvars`

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::{InjectContext, VarCache};
use crate::inventory::InventorySource;
use crate::template::Templar;
use crate::value::{combine, to_object, VarMap};

/// Variables of every inventory host, computed on first lookup.
///
/// A host's view is inventory variables, then cached facts and runtime
/// variables, then extra vars, templated leniently once and memoized.
pub struct HostVars {
    inventory: Arc<dyn InventorySource>,
    templar: Arc<dyn Templar>,
    facts_cache: Arc<VarCache>,
    vars_cache: Arc<VarCache>,
    extra_vars: VarMap,
    lookup: DashMap<String, Value>,
}

impl fmt::Debug for HostVars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostVars")
            .field("memoized", &self.lookup.len())
            .finish()
    }
}

impl HostVars {
    pub fn new(
        inventory: Arc<dyn InventorySource>,
        templar: Arc<dyn Templar>,
        facts_cache: Arc<VarCache>,
        vars_cache: Arc<VarCache>,
        extra_vars: VarMap,
    ) -> Self {
        HostVars {
            inventory,
            templar,
            facts_cache,
            vars_cache,
            extra_vars,
            lookup: DashMap::new(),
        }
    }

    /// Variables for `host`, or `None` when the host is not in inventory
    pub fn get(&self, host: &str) -> Option<Value> {
        if let Some(cached) = self.lookup.get(host) {
            return Some(cached.value().clone());
        }

        let mut vars = self.inventory.get_variables(host)?;
        if let Some(facts) = self.facts_cache.get(host) {
            combine(&mut vars, facts.value());
        }
        if let Some(runtime) = self.vars_cache.get(host) {
            combine(&mut vars, runtime.value());
        }
        combine(&mut vars, &self.extra_vars);

        let raw = Value::Object(to_object(&vars));
        let ctx = InjectContext::from_map(vars);
        let templated = self.templar.template(&raw, &ctx, false).unwrap_or(raw);

        // Concurrent first lookups may race; the first insert wins
        let entry = self
            .lookup
            .entry(host.to_string())
            .or_insert(templated)
            .value()
            .clone();
        Some(entry)
    }

    /// Drop memoized views, e.g. after facts for a host changed
    pub fn invalidate(&self, host: &str) {
        self.lookup.remove(host);
    }

    pub fn contains(&self, host: &str) -> bool {
        self.lookup.contains_key(host) || self.inventory.get_variables(host).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Host, Inventory};
    use crate::template::JinjaTemplar;
    use serde_json::json;

    fn hostvars() -> (HostVars, Arc<VarCache>) {
        let mut inv = Inventory::new();
        inv.add_host(
            Host::new("web1")
                .with_var("app", json!("shop"))
                .with_var("root", json!("/srv/{{ app }}")),
        );
        let facts = Arc::new(VarCache::new());
        let hv = HostVars::new(
            Arc::new(inv),
            Arc::new(JinjaTemplar::new()),
            facts.clone(),
            Arc::new(VarCache::new()),
            VarMap::new(),
        );
        (hv, facts)
    }

    #[test]
    fn test_templated_on_first_access() {
        let (hv, _) = hostvars();
        let vars = hv.get("web1").unwrap();
        assert_eq!(vars["root"], json!("/srv/shop"));
        assert_eq!(vars["group_names"], json!([]));
        assert!(hv.get("ghost").is_none());
    }

    #[test]
    fn test_memoized_until_invalidated() {
        let (hv, facts) = hostvars();
        assert!(hv.get("web1").unwrap().get("os").is_none());

        let mut f = VarMap::new();
        f.insert("os".into(), json!("linux"));
        facts.insert("web1".into(), f);

        assert!(hv.get("web1").unwrap().get("os").is_none());
        hv.invalidate("web1");
        assert_eq!(hv.get("web1").unwrap()["os"], json!("linux"));
    }
}
