// Inventory module for host management

mod patterns;
mod static_inv;

pub use patterns::*;
pub use static_inv::*;

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexMap;
use serde_json::Value;

use crate::output::errors::RunnerError;
use crate::value::{combine, VarMap};

/// Narrow inventory interface consumed by the engine
pub trait InventorySource: Send + Sync {
    /// Effective variables for a host (group vars, host vars, `group_names`);
    /// `None` for hosts the inventory does not know
    fn get_variables(&self, host: &str) -> Option<VarMap>;

    /// Host names matching a pattern, in inventory order
    fn list_hosts(&self, pattern: &str) -> Vec<String>;

    /// Group name to expanded member host names
    fn groups_list(&self) -> IndexMap<String, Vec<String>>;
}

/// A single host in the inventory
#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub vars: VarMap,
    pub groups: Vec<String>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Host {
            name: name.into(),
            vars: VarMap::new(),
            groups: Vec::new(),
        }
    }

    pub fn with_address(self, address: impl Into<String>) -> Self {
        self.with_var("ansible_ssh_host", Value::String(address.into()))
    }

    pub fn with_port(self, port: u16) -> Self {
        self.with_var("ansible_ssh_port", Value::from(port))
    }

    pub fn with_user(self, user: impl Into<String>) -> Self {
        self.with_var("ansible_ssh_user", Value::String(user.into()))
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.vars.insert(key.into(), value);
        self
    }

    pub fn get_var(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Check if this host should use local connection
    pub fn is_local(&self) -> bool {
        if let Some(Value::String(conn)) = self.vars.get("ansible_connection") {
            return conn == "local";
        }
        is_localhost_name(&self.name)
    }

    /// The implicit localhost used when a pattern names it but inventory does not
    pub fn localhost(name: &str) -> Self {
        Host::new(name).with_var("ansible_connection", Value::String("local".to_string()))
    }
}

fn is_localhost_name(name: &str) -> bool {
    matches!(name, "localhost" | "127.0.0.1" | "::1")
}

/// A group of hosts
#[derive(Debug, Clone, Default)]
pub struct HostGroup {
    pub name: String,
    pub hosts: Vec<String>,
    pub children: Vec<String>,
    pub vars: VarMap,
}

impl HostGroup {
    pub fn new(name: impl Into<String>) -> Self {
        HostGroup {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// The complete inventory
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub hosts: IndexMap<String, Host>,
    pub groups: IndexMap<String, HostGroup>,
}

impl Inventory {
    pub fn new() -> Self {
        let mut inv = Inventory::default();
        // Always have an "all" group
        inv.groups.insert("all".to_string(), HostGroup::new("all"));
        inv
    }

    /// Load an inventory from a YAML file path, or treat the source as a
    /// comma-separated host list when it is not a file
    pub fn load(source: &str) -> Result<Self, RunnerError> {
        let path = Path::new(source);
        if path.is_file() {
            return Self::from_file(path);
        }
        if source.contains(',') {
            return Ok(Self::from_cli_hosts(source));
        }
        Err(RunnerError::Inventory(format!(
            "inventory source '{}' is neither a file nor a comma-separated host list",
            source
        )))
    }

    /// Load inventory from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, RunnerError> {
        parse_inventory_file(path)
    }

    /// Load inventory from a YAML string
    pub fn parse_str(content: &str) -> Result<Self, RunnerError> {
        parse_inventory(content)
    }

    /// Create inventory from CLI hosts string (comma-separated)
    ///
    /// Example: "server1.example.com,server2.example.com,192.168.1.10"
    pub fn from_cli_hosts(hosts_str: &str) -> Self {
        let mut inv = Inventory::new();

        for host_str in hosts_str.split(',') {
            let host_str = host_str.trim();
            if host_str.is_empty() {
                continue;
            }
            inv.add_host(Host::new(host_str));
        }

        inv
    }

    /// Add a host to the inventory
    pub fn add_host(&mut self, host: Host) {
        let name = host.name.clone();

        if let Some(all) = self.groups.get_mut("all") {
            if !all.hosts.contains(&name) {
                all.hosts.push(name.clone());
            }
        }

        for group_name in &host.groups {
            let group = self
                .groups
                .entry(group_name.clone())
                .or_insert_with(|| HostGroup::new(group_name));
            if !group.hosts.contains(&name) {
                group.hosts.push(name.clone());
            }
        }

        match self.hosts.get_mut(&name) {
            Some(existing) => {
                combine(&mut existing.vars, &host.vars);
                for g in host.groups {
                    if !existing.groups.contains(&g) {
                        existing.groups.push(g);
                    }
                }
            }
            None => {
                self.hosts.insert(name, host);
            }
        }
    }

    /// Add a group to the inventory, merging into an existing one
    pub fn add_group(&mut self, group: HostGroup) {
        for host in &group.hosts {
            if let Some(h) = self.hosts.get_mut(host) {
                if !h.groups.contains(&group.name) {
                    h.groups.push(group.name.clone());
                }
            }
        }

        match self.groups.get_mut(&group.name) {
            Some(existing) => {
                for h in group.hosts {
                    if !existing.hosts.contains(&h) {
                        existing.hosts.push(h);
                    }
                }
                for c in group.children {
                    if !existing.children.contains(&c) {
                        existing.children.push(c);
                    }
                }
                combine(&mut existing.vars, &group.vars);
            }
            None => {
                self.groups.insert(group.name.clone(), group);
            }
        }
    }

    /// Get a single host by name
    pub fn get_host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// Expand a group to its host names (including children)
    pub fn expand_group(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen_groups = HashSet::new();
        self.expand_group_into(name, &mut out, &mut seen_groups);

        let mut seen = HashSet::new();
        out.retain(|h| seen.insert(h.clone()));
        out
    }

    fn expand_group_into(&self, name: &str, out: &mut Vec<String>, seen: &mut HashSet<String>) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(group) = self.groups.get(name) else {
            return;
        };

        if name == "all" {
            out.extend(self.hosts.keys().cloned());
            return;
        }

        out.extend(group.hosts.iter().cloned());
        for child in &group.children {
            self.expand_group_into(child, out, seen);
        }
    }

    /// Groups containing a host, directly or through children, ordered
    /// from the outermost ancestor to the most specific group
    pub fn host_groups(&self, host: &str) -> Vec<String> {
        let mut found: Vec<String> = self
            .groups
            .iter()
            .filter(|(name, g)| name.as_str() != "all" && g.hosts.iter().any(|h| h == host))
            .map(|(name, _)| name.clone())
            .collect();
        if let Some(h) = self.hosts.get(host) {
            for g in &h.groups {
                if g != "all" && !found.contains(g) {
                    found.push(g.clone());
                }
            }
        }

        let mut i = 0;
        while i < found.len() {
            for parent in self.parents_of(&found[i]) {
                if !found.contains(&parent) {
                    found.push(parent);
                }
            }
            i += 1;
        }

        let mut ranked: Vec<(usize, String)> = found
            .into_iter()
            .map(|g| (self.group_depth(&g, &mut HashSet::new()), g))
            .collect();
        ranked.sort();
        ranked.into_iter().map(|(_, g)| g).collect()
    }

    fn parents_of(&self, group: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(name, g)| name.as_str() != "all" && g.children.iter().any(|c| c == group))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Distance from the outermost ancestor; cycles are cut
    fn group_depth(&self, group: &str, visiting: &mut HashSet<String>) -> usize {
        if !visiting.insert(group.to_string()) {
            return 0;
        }
        let depth = self
            .parents_of(group)
            .iter()
            .map(|p| self.group_depth(p, visiting) + 1)
            .max()
            .unwrap_or(0);
        visiting.remove(group);
        depth
    }

    /// Effective variables for a host: "all" vars, ancestor groups, the
    /// host's own groups, then host vars
    pub fn host_vars(&self, host: &Host) -> VarMap {
        let mut vars = VarMap::new();

        if let Some(all) = self.groups.get("all") {
            combine(&mut vars, &all.vars);
        }

        let groups = self.host_groups(&host.name);
        for group_name in &groups {
            if let Some(group) = self.groups.get(group_name) {
                combine(&mut vars, &group.vars);
            }
        }

        combine(&mut vars, &host.vars);

        let mut names = groups;
        names.sort();
        vars.insert(
            "group_names".to_string(),
            Value::Array(names.into_iter().map(Value::String).collect()),
        );
        vars.insert("inventory_hostname".to_string(), Value::String(host.name.clone()));
        let short = host.name.split('.').next().unwrap_or(&host.name).to_string();
        vars.insert("inventory_hostname_short".to_string(), Value::String(short));

        vars
    }

    /// Get the total number of hosts
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Get all group names
    pub fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(|s| s.as_str()).collect()
    }
}

impl std::str::FromStr for Inventory {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_inventory(s)
    }
}

impl InventorySource for Inventory {
    fn get_variables(&self, host: &str) -> Option<VarMap> {
        match self.hosts.get(host) {
            Some(h) => Some(self.host_vars(h)),
            None if is_localhost_name(host) => Some(self.host_vars(&Host::localhost(host))),
            None => None,
        }
    }

    fn list_hosts(&self, pattern: &str) -> Vec<String> {
        HostPattern::parse(pattern).resolve(self)
    }

    fn groups_list(&self) -> IndexMap<String, Vec<String>> {
        self.groups
            .keys()
            .map(|name| (name.clone(), self.expand_group(name)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> Inventory {
        let mut inv = Inventory::new();
        inv.add_host(Host::new("web1").with_address("192.168.1.10").with_group("webservers"));
        inv.add_host(Host::new("web2").with_group("webservers"));
        inv.add_host(Host::new("db1").with_group("databases").with_port(2222));

        let mut prod = HostGroup::new("prod");
        prod.children = vec!["webservers".into(), "databases".into()];
        prod.vars.insert("env".into(), json!("prod"));
        prod.vars.insert("tier".into(), json!("generic"));
        inv.add_group(prod);

        let mut web = HostGroup::new("webservers");
        web.vars.insert("tier".into(), json!("web"));
        inv.add_group(web);

        inv.groups.get_mut("all").unwrap().vars.insert("env".into(), json!("none"));
        inv
    }

    #[test]
    fn test_host_builders_set_connection_vars() {
        let host = Host::new("web1").with_address("10.0.0.1").with_port(22).with_user("admin");
        assert_eq!(host.get_var("ansible_ssh_host"), Some(&json!("10.0.0.1")));
        assert_eq!(host.get_var("ansible_ssh_port"), Some(&json!(22)));
        assert_eq!(host.get_var("ansible_ssh_user"), Some(&json!("admin")));
        assert!(!host.is_local());
        assert!(Host::localhost("localhost").is_local());
    }

    #[test]
    fn test_group_var_precedence() {
        let inv = sample();
        let vars = inv.get_variables("web1").unwrap();
        assert_eq!(vars["env"], json!("prod"));
        assert_eq!(vars["tier"], json!("web"));
        assert_eq!(vars["group_names"], json!(["prod", "webservers"]));
        assert_eq!(vars["ansible_ssh_host"], json!("192.168.1.10"));

        let db = inv.get_variables("db1").unwrap();
        assert_eq!(db["tier"], json!("generic"));
        assert_eq!(db["ansible_ssh_port"], json!(2222));
    }

    #[test]
    fn test_unknown_and_implicit_localhost() {
        let inv = sample();
        assert!(inv.get_variables("nope").is_none());
        let local = inv.get_variables("localhost").unwrap();
        assert_eq!(local["ansible_connection"], json!("local"));
    }

    #[test]
    fn test_groups_list_expands_children() {
        let inv = sample();
        let groups = inv.groups_list();
        assert_eq!(groups["prod"], vec!["web1", "web2", "db1"]);
        assert_eq!(groups["all"].len(), 3);
    }

    #[test]
    fn test_cli_host_list() {
        let inv = Inventory::from_cli_hosts("a.example.com, b.example.com,");
        assert_eq!(inv.host_count(), 2);
        assert_eq!(inv.list_hosts("all"), vec!["a.example.com", "b.example.com"]);
    }
}
