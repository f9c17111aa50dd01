// Static YAML inventory parser

use std::path::Path;

use serde_json::{Map, Number, Value};
use serde_yaml::Value as YamlValue;

use super::{Host, HostGroup, Inventory};
use crate::output::errors::RunnerError;

/// Parse inventory from a YAML file
pub fn parse_inventory_file(path: &Path) -> Result<Inventory, RunnerError> {
    let content = std::fs::read_to_string(path).map_err(|e| RunnerError::Io {
        message: format!("Failed to read inventory file: {}", e),
        path: Some(path.to_path_buf()),
    })?;

    parse_inventory(&content)
}

/// Parse inventory from a YAML string
pub fn parse_inventory(content: &str) -> Result<Inventory, RunnerError> {
    let yaml: YamlValue = serde_yaml::from_str(content)
        .map_err(|e| RunnerError::Inventory(format!("Invalid inventory YAML: {}", e)))?;

    let mut inventory = Inventory::new();

    match &yaml {
        YamlValue::Mapping(map) => {
            if let Some(all) = map.get("all") {
                // Nested format rooted at "all"
                parse_nested_group(all, "all", &mut inventory)?;
            } else if map.contains_key("hosts") || map.contains_key("groups") {
                parse_simple_inventory(&yaml, &mut inventory)?;
            } else {
                // Top-level keys are group names
                for (key, value) in map {
                    if let Some(group_name) = key.as_str() {
                        parse_nested_group(value, group_name, &mut inventory)?;
                    }
                }
            }
        }
        YamlValue::Null => {}
        _ => {
            return Err(RunnerError::Inventory(
                "Inventory must be a YAML mapping; start with 'all:' or 'hosts:'".to_string(),
            ));
        }
    }

    Ok(inventory)
}

fn parse_simple_inventory(yaml: &YamlValue, inventory: &mut Inventory) -> Result<(), RunnerError> {
    if let Some(hosts_val) = yaml.get("hosts") {
        parse_hosts_section(hosts_val, None, inventory)?;
    }

    if let Some(groups_map) = yaml.get("groups").and_then(|g| g.as_mapping()) {
        for (group_name, group_val) in groups_map {
            if let Some(name) = group_name.as_str() {
                parse_group_section(name, group_val, inventory)?;
            }
        }
    }

    Ok(())
}

fn parse_nested_group(
    value: &YamlValue,
    group_name: &str,
    inventory: &mut Inventory,
) -> Result<(), RunnerError> {
    let mut group = HostGroup::new(group_name);
    let mut children: Vec<(String, YamlValue)> = Vec::new();

    if let Some(map) = value.as_mapping() {
        if let Some(hosts_map) = map.get("hosts").and_then(|h| h.as_mapping()) {
            for (host_name, host_val) in hosts_map {
                if let Some(name) = host_name.as_str() {
                    let mut host = Host::new(name);
                    if group_name != "all" {
                        host.groups.push(group_name.to_string());
                    }
                    if let Some(host_map) = host_val.as_mapping() {
                        parse_host_vars(&mut host, host_map)?;
                    }
                    group.hosts.push(name.to_string());
                    inventory.add_host(host);
                }
            }
        }

        if let Some(children_map) = map.get("children").and_then(|c| c.as_mapping()) {
            for (child_name, child_val) in children_map {
                if let Some(name) = child_name.as_str() {
                    children.push((name.to_string(), child_val.clone()));
                }
            }
        }

        if let Some(vars_map) = map.get("vars").and_then(|v| v.as_mapping()) {
            for (k, v) in vars_map {
                if let Some(key) = k.as_str() {
                    group.vars.insert(key.to_string(), yaml_to_value(v));
                }
            }
        }
    }

    if group_name != "all" {
        group.children = children.iter().map(|(n, _)| n.clone()).collect();
    }
    inventory.add_group(group);

    for (child_name, child_val) in children {
        parse_nested_group(&child_val, &child_name, inventory)?;
    }

    Ok(())
}

fn parse_hosts_section(
    value: &YamlValue,
    group_name: Option<&str>,
    inventory: &mut Inventory,
) -> Result<(), RunnerError> {
    match value {
        YamlValue::Sequence(hosts) => {
            for host_val in hosts {
                match host_val {
                    YamlValue::String(name) => {
                        let mut host = Host::new(name);
                        if let Some(group) = group_name {
                            host.groups.push(group.to_string());
                        }
                        inventory.add_host(host);
                    }
                    YamlValue::Mapping(map) => {
                        // host with inline vars: { name: host1, address: 192.168.1.1 }
                        if let Some(name) = map.get("name").and_then(|v| v.as_str()) {
                            let mut host = Host::new(name);
                            if let Some(group) = group_name {
                                host.groups.push(group.to_string());
                            }
                            parse_host_vars(&mut host, map)?;
                            inventory.add_host(host);
                        }
                    }
                    _ => {}
                }
            }
        }
        YamlValue::Mapping(hosts_map) => {
            for (host_name, host_vars) in hosts_map {
                if let Some(name) = host_name.as_str() {
                    let mut host = Host::new(name);
                    if let Some(group) = group_name {
                        host.groups.push(group.to_string());
                    }
                    if let Some(vars_map) = host_vars.as_mapping() {
                        parse_host_vars(&mut host, vars_map)?;
                    }
                    inventory.add_host(host);
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn parse_group_section(
    name: &str,
    value: &YamlValue,
    inventory: &mut Inventory,
) -> Result<(), RunnerError> {
    let mut group = HostGroup::new(name);

    if let Some(map) = value.as_mapping() {
        if let Some(hosts) = map.get("hosts") {
            if let Some(hosts_seq) = hosts.as_sequence() {
                for h in hosts_seq {
                    match h {
                        YamlValue::String(n) => group.hosts.push(n.clone()),
                        YamlValue::Mapping(m) => {
                            if let Some(n) = m.get("name").and_then(|v| v.as_str()) {
                                group.hosts.push(n.to_string());
                            }
                        }
                        _ => {}
                    }
                }
            } else if let Some(hosts_map) = hosts.as_mapping() {
                for (k, _) in hosts_map {
                    if let Some(n) = k.as_str() {
                        group.hosts.push(n.to_string());
                    }
                }
            }
            parse_hosts_section(hosts, Some(name), inventory)?;
        }

        if let Some(children_seq) = map.get("children").and_then(|c| c.as_sequence()) {
            for child in children_seq {
                if let Some(child_name) = child.as_str() {
                    group.children.push(child_name.to_string());
                }
            }
        }

        if let Some(vars_map) = map.get("vars").and_then(|v| v.as_mapping()) {
            for (k, v) in vars_map {
                if let Some(key) = k.as_str() {
                    group.vars.insert(key.to_string(), yaml_to_value(v));
                }
            }
        }
    }

    inventory.add_group(group);
    Ok(())
}

/// Host entries accept short aliases for the connection variables
fn parse_host_vars(host: &mut Host, map: &serde_yaml::Mapping) -> Result<(), RunnerError> {
    for (k, v) in map {
        let Some(key) = k.as_str() else {
            continue;
        };
        match key {
            "name" => {}
            "address" | "ansible_host" | "host" => {
                host.vars
                    .insert("ansible_ssh_host".to_string(), yaml_to_value(v));
            }
            "port" | "ansible_port" => {
                host.vars
                    .insert("ansible_ssh_port".to_string(), yaml_to_value(v));
            }
            "user" | "ansible_user" => {
                host.vars
                    .insert("ansible_ssh_user".to_string(), yaml_to_value(v));
            }
            "groups" => {
                let groups = v.as_sequence().ok_or_else(|| {
                    RunnerError::Inventory(format!(
                        "host '{}': 'groups' must be a list",
                        host.name
                    ))
                })?;
                for g in groups.iter().filter_map(|g| g.as_str()) {
                    host.groups.push(g.to_string());
                }
            }
            _ => {
                host.vars.insert(key.to_string(), yaml_to_value(v));
            }
        }
    }

    Ok(())
}

/// Convert a YAML value into JSON; non-string mapping keys are stringified
pub fn yaml_to_value(yaml: &YamlValue) -> Value {
    match yaml {
        YamlValue::Null => Value::Null,
        YamlValue::Bool(b) => Value::Bool(*b),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        YamlValue::String(s) => Value::String(s.clone()),
        YamlValue::Sequence(seq) => Value::Array(seq.iter().map(yaml_to_value).collect()),
        YamlValue::Mapping(map) => {
            let items: Map<String, Value> = map
                .iter()
                .map(|(k, v)| {
                    let key = match k {
                        YamlValue::String(s) => s.clone(),
                        other => crate::value::to_plain_string(&yaml_to_value(other)),
                    };
                    (key, yaml_to_value(v))
                })
                .collect();
            Value::Object(items)
        }
        YamlValue::Tagged(tagged) => yaml_to_value(&tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::InventorySource;
    use serde_json::json;

    #[test]
    fn test_parse_simple_inventory() {
        let yaml = r#"
hosts:
  - name: web1
    address: 192.168.1.10
    user: admin
  - name: web2
    address: 192.168.1.11
    user: admin

groups:
  webservers:
    hosts:
      - web1
      - web2
    vars:
      http_port: 80
"#;

        let inv = parse_inventory(yaml).unwrap();
        assert_eq!(inv.hosts.len(), 2);
        assert!(inv.groups.contains_key("webservers"));

        let vars = inv.get_variables("web1").unwrap();
        assert_eq!(vars["ansible_ssh_host"], json!("192.168.1.10"));
        assert_eq!(vars["ansible_ssh_user"], json!("admin"));
        assert_eq!(vars["http_port"], json!(80));
        assert_eq!(vars["group_names"], json!(["webservers"]));
    }

    #[test]
    fn test_parse_nested_inventory() {
        let yaml = r#"
all:
  vars:
    ntp: pool.ntp.org
  children:
    webservers:
      hosts:
        web1:
          ansible_host: 192.168.1.10
          ansible_port: 2222
        web2:
          ansible_host: 192.168.1.11
      vars:
        http_port: 80
    databases:
      hosts:
        db1:
          ansible_host: 192.168.1.20
"#;

        let inv = parse_inventory(yaml).unwrap();
        assert_eq!(inv.hosts.len(), 3);
        assert!(inv.groups.contains_key("webservers"));
        assert!(inv.groups.contains_key("databases"));

        let web1 = inv.get_variables("web1").unwrap();
        assert_eq!(web1["ansible_ssh_port"], json!(2222));
        assert_eq!(web1["ntp"], json!("pool.ntp.org"));
        assert_eq!(inv.list_hosts("databases"), vec!["db1"]);
    }

    #[test]
    fn test_rejects_non_mapping() {
        assert!(parse_inventory("- just\n- a list\n").is_err());
    }
}
