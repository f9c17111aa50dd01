// Host pattern parsing and filtering

use std::collections::HashSet;

use regex::Regex;

use super::{is_localhost_name, Inventory};

/// One term of a host pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternTerm {
    /// Union: `web`, `db*`, `~db[0-9]+`
    Include(String),
    /// Intersection: `&prod`
    Intersect(String),
    /// Exclusion: `!staging`
    Exclude(String),
}

/// A parsed host pattern such as `webservers:&prod:!web3`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    pub terms: Vec<PatternTerm>,
}

impl HostPattern {
    /// Parse a pattern; terms are separated by `:` or `,`
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return HostPattern {
                terms: vec![PatternTerm::Include("all".to_string())],
            };
        }

        let terms = pattern
            .split([':', ','])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| {
                if let Some(rest) = t.strip_prefix('&') {
                    PatternTerm::Intersect(rest.to_string())
                } else if let Some(rest) = t.strip_prefix('!') {
                    PatternTerm::Exclude(rest.to_string())
                } else {
                    PatternTerm::Include(t.to_string())
                }
            })
            .collect();

        HostPattern { terms }
    }

    /// Resolve against an inventory: unions first, then intersections,
    /// then exclusions
    pub fn resolve(&self, inventory: &Inventory) -> Vec<String> {
        let includes: Vec<&str> = self
            .terms
            .iter()
            .filter_map(|t| match t {
                PatternTerm::Include(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();

        let mut result: Vec<String> = Vec::new();
        if includes.is_empty() {
            result = match_term(inventory, "all");
        }
        for term in includes {
            for host in match_term(inventory, term) {
                if !result.contains(&host) {
                    result.push(host);
                }
            }
        }

        for term in &self.terms {
            match term {
                PatternTerm::Intersect(t) => {
                    let keep: HashSet<String> = match_term(inventory, t).into_iter().collect();
                    result.retain(|h| keep.contains(h));
                }
                PatternTerm::Exclude(t) => {
                    let drop: HashSet<String> = match_term(inventory, t).into_iter().collect();
                    result.retain(|h| !drop.contains(h));
                }
                PatternTerm::Include(_) => {}
            }
        }

        result
    }
}

/// Hosts matched by one term: `all`/`*`, a group, a host, a glob or a `~regex`
fn match_term(inventory: &Inventory, term: &str) -> Vec<String> {
    if term == "all" || term == "*" {
        return inventory.hosts.keys().cloned().collect();
    }
    if inventory.groups.contains_key(term) {
        return inventory.expand_group(term);
    }
    if inventory.hosts.contains_key(term) {
        return vec![term.to_string()];
    }

    let regex = if let Some(re) = term.strip_prefix('~') {
        Regex::new(re).ok()
    } else if term.contains('*') {
        let escaped = regex::escape(term).replace(r"\*", ".*");
        Regex::new(&format!("^{}$", escaped)).ok()
    } else {
        None
    };

    if let Some(re) = regex {
        let mut out = Vec::new();
        for group in inventory.groups.keys().filter(|g| re.is_match(g)) {
            for host in inventory.expand_group(group) {
                if !out.contains(&host) {
                    out.push(host);
                }
            }
        }
        for host in inventory.hosts.keys().filter(|h| re.is_match(h)) {
            if !out.contains(host) {
                out.push(host.clone());
            }
        }
        return out;
    }

    if is_localhost_name(term) {
        return vec![term.to_string()];
    }

    Vec::new()
}

/// Filter options for host selection
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    /// Limit to specific hosts
    pub limit: Option<Vec<String>>,
    /// Exclude specific hosts
    pub exclude: Option<Vec<String>>,
}

impl HostFilter {
    pub fn new() -> Self {
        HostFilter::default()
    }

    pub fn with_limit(mut self, hosts: Vec<String>) -> Self {
        self.limit = Some(hosts);
        self
    }

    pub fn with_exclude(mut self, hosts: Vec<String>) -> Self {
        self.exclude = Some(hosts);
        self
    }

    /// Apply filter to host names
    pub fn apply(&self, hosts: Vec<String>) -> Vec<String> {
        let mut result = hosts;

        if let Some(ref limit) = self.limit {
            result.retain(|h| limit.contains(h));
        }

        if let Some(ref exclude) = self.exclude {
            result.retain(|h| !exclude.contains(h));
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Host, HostGroup};
    use pretty_assertions::assert_eq;

    fn create_test_inventory() -> Inventory {
        let mut inv = Inventory::new();

        inv.add_host(Host::new("web1"));
        inv.add_host(Host::new("web2"));
        inv.add_host(Host::new("db1"));
        inv.add_host(Host::new("staging1"));

        let mut web = HostGroup::new("webservers");
        web.hosts = vec!["web1".into(), "web2".into()];
        inv.add_group(web);

        let mut db = HostGroup::new("databases");
        db.hosts = vec!["db1".into()];
        inv.add_group(db);

        let mut prod = HostGroup::new("prod");
        prod.hosts = vec!["web1".into(), "db1".into()];
        inv.add_group(prod);

        inv
    }

    fn resolve(pattern: &str) -> Vec<String> {
        HostPattern::parse(pattern).resolve(&create_test_inventory())
    }

    #[test]
    fn test_parse_host_pattern() {
        assert_eq!(
            HostPattern::parse("web:&prod,!web3").terms,
            vec![
                PatternTerm::Include("web".into()),
                PatternTerm::Intersect("prod".into()),
                PatternTerm::Exclude("web3".into()),
            ]
        );
        assert_eq!(
            HostPattern::parse("").terms,
            vec![PatternTerm::Include("all".into())]
        );
    }

    #[test]
    fn test_union_intersection_exclusion() {
        assert_eq!(resolve("all").len(), 4);
        assert_eq!(resolve("webservers:databases"), vec!["web1", "web2", "db1"]);
        assert_eq!(resolve("webservers:&prod"), vec!["web1"]);
        assert_eq!(resolve("all:!prod"), vec!["web2", "staging1"]);
        assert_eq!(resolve("!webservers"), vec!["db1", "staging1"]);
    }

    #[test]
    fn test_wildcards_and_regex() {
        assert_eq!(resolve("web*"), vec!["web1", "web2"]);
        assert_eq!(resolve("~(db|staging)[0-9]"), vec!["db1", "staging1"]);
        assert_eq!(resolve("localhost"), vec!["localhost"]);
        assert!(resolve("missing").is_empty());
    }

    #[test]
    fn test_host_filter() {
        let filter = HostFilter::new()
            .with_limit(vec!["web1".into(), "db1".into()])
            .with_exclude(vec!["db1".into()]);
        assert_eq!(filter.apply(resolve("all")), vec!["web1"]);
    }
}
