// Module lookup and payload assembly
//
// A module is an executable file shipped to the remote host. Its style
// decides how arguments reach it:
// - `New` modules get the shared runtime and their arguments inlined and
//   may be piped over stdin
// - `WantJson` modules receive a JSON arguments file
// - `Legacy` modules receive a key=value arguments file

use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::debug;

use crate::executor::args::parse_kv;
use crate::executor::Connection;
use crate::output::errors::RunnerError;
use crate::value::{to_object, to_plain_string};
use crate::vars::InjectContext;

/// Marker replaced by the shared module runtime
pub const REPLACER_COMMON: &str = "#<<INCLUDE_FANOUT_MODULE_COMMON>>";
/// Import line that also marks a module as new style
pub const REPLACER_IMPORT: &str = "from fanout.module_utils.";
pub const REPLACER_ARGS: &str = "\"<<INCLUDE_FANOUT_MODULE_ARGS>>\"";
pub const REPLACER_COMPLEX: &str = "\"<<INCLUDE_FANOUT_MODULE_COMPLEX_ARGS>>\"";
pub const REPLACER_LANG: &str = "\"<<INCLUDE_FANOUT_MODULE_LANG>>\"";
/// Replaced by the merged arguments as a raw JSON object
pub const REPLACER_JSON: &str = "<<INCLUDE_FANOUT_MODULE_JSON_ARGS>>";
pub const WANT_JSON: &str = "WANT_JSON";

/// Always-available module used to tell "one module missing" from "core
/// modules missing"
pub const SENTINEL_MODULE: &str = "ping";

const MODULE_COMMON: &str = include_str!("library/module_common.py");

/// Modules compiled into the binary
const BUILTIN_MODULES: &[(&str, &str)] = &[
    ("ping", include_str!("library/ping.sh")),
    ("command", include_str!("library/command.py")),
    ("async_wrapper", include_str!("library/async_wrapper.sh")),
    ("async_status", include_str!("library/async_status.sh")),
];

/// How a module receives its arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStyle {
    New,
    WantJson,
    Legacy,
}

/// Where a module's source came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    File(PathBuf),
    Builtin(&'static str),
}

/// A module ready for transfer
#[derive(Debug, Clone)]
pub struct ConfiguredModule {
    pub style: ModuleStyle,
    /// First line of the payload, after interpreter overrides
    pub shebang: Option<String>,
    pub data: String,
    pub source: ModuleSource,
}

/// Locates modules and builds their payloads
#[derive(Debug, Clone)]
pub struct ModuleConfigurator {
    paths: Vec<PathBuf>,
    builtins: bool,
    lang: String,
}

impl ModuleConfigurator {
    pub fn new(paths: Vec<PathBuf>, builtins: bool) -> Self {
        ModuleConfigurator {
            paths,
            builtins,
            lang: "C".to_string(),
        }
    }

    /// Locale exported to new-style modules
    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    /// Search path directories first, then the builtin modules
    pub fn find(&self, name: &str, suffixes: &[&str]) -> Option<(ModuleSource, String)> {
        for dir in &self.paths {
            for suffix in suffixes {
                let candidate = dir.join(format!("{}{}", name, suffix));
                if candidate.is_file() {
                    if let Ok(data) = std::fs::read_to_string(&candidate) {
                        return Some((ModuleSource::File(candidate), data));
                    }
                }
            }
        }

        if self.builtins {
            return BUILTIN_MODULES
                .iter()
                .find(|(builtin, _)| *builtin == name)
                .map(|(builtin, data)| (ModuleSource::Builtin(builtin), data.to_string()));
        }
        None
    }

    /// Locate `module_name`, detect its style and build the payload
    pub fn configure(
        &self,
        conn: &dyn Connection,
        module_name: &str,
        module_args: &str,
        inject: &InjectContext,
        complex_args: &Map<String, Value>,
    ) -> Result<ConfiguredModule, RunnerError> {
        let suffixes = conn.module_suffixes();
        let (source, data) = match self.find(module_name, suffixes) {
            Some(found) => found,
            None => return Err(self.not_found(module_name, suffixes)),
        };

        let (style, data) = self.modify_module(&data, module_args, complex_args)?;
        let (shebang, data) = rewrite_interpreter(&data, inject);

        debug!(module = module_name, ?style, ?source, "configured module");

        Ok(ConfiguredModule {
            style,
            shebang,
            data,
            source,
        })
    }

    fn not_found(&self, module_name: &str, suffixes: &[&str]) -> RunnerError {
        let mut message = format!("module {} not found in configured module paths", module_name);
        let core_missing = self.find(SENTINEL_MODULE, suffixes).is_none();
        if core_missing {
            message.push_str(
                ". Additionally, core modules are missing. Enable builtin modules \
                 or add the core module directory to the module path.",
            );
        }
        RunnerError::ModuleNotFound {
            module: module_name.to_string(),
            message,
            core_missing,
        }
    }

    fn modify_module(
        &self,
        data: &str,
        module_args: &str,
        complex_args: &Map<String, Value>,
    ) -> Result<(ModuleStyle, String), RunnerError> {
        if data.contains(REPLACER_COMMON) || data.contains(REPLACER_IMPORT) {
            let mut out = data.replacen(REPLACER_COMMON, MODULE_COMMON, 1);
            // Each value becomes a string literal inside the module source
            let encoded_args = serde_json::to_string(module_args)?;
            let encoded_complex = serde_json::to_string(&serde_json::to_string(complex_args)?)?;
            let encoded_lang = serde_json::to_string(&self.lang)?;
            out = out
                .replace(REPLACER_ARGS, &encoded_args)
                .replace(REPLACER_COMPLEX, &encoded_complex)
                .replace(REPLACER_LANG, &encoded_lang);
            return Ok((ModuleStyle::New, out));
        }

        if data.contains(REPLACER_JSON) {
            let mut merged = complex_args.clone();
            merged.extend(to_object(&parse_kv(module_args)?));
            let encoded = serde_json::to_string(&merged)?;
            return Ok((ModuleStyle::New, data.replace(REPLACER_JSON, &encoded)));
        }

        if data.contains(WANT_JSON) {
            return Ok((ModuleStyle::WantJson, data.to_string()));
        }

        Ok((ModuleStyle::Legacy, data.to_string()))
    }
}

/// Swap the shebang interpreter for `ansible_<name>_interpreter` when set
fn rewrite_interpreter(data: &str, inject: &InjectContext) -> (Option<String>, String) {
    let (first, rest) = match data.split_once('\n') {
        Some((first, rest)) => (first, Some(rest)),
        None => (data, None),
    };
    let Some(line) = first.strip_prefix("#!") else {
        return (None, data.to_string());
    };

    let mut words = line.split_whitespace();
    let Some(interpreter) = words.next() else {
        return (Some(first.to_string()), data.to_string());
    };
    let interpreter_args: Vec<&str> = words.collect();
    let basename = interpreter.rsplit('/').next().unwrap_or(interpreter);
    let key = format!("ansible_{}_interpreter", basename);

    let Some(replacement) = inject.get(&key).map(to_plain_string) else {
        return (Some(first.to_string()), data.to_string());
    };

    let mut shebang = format!("#!{}", replacement);
    if !interpreter_args.is_empty() {
        shebang.push(' ');
        shebang.push_str(&interpreter_args.join(" "));
    }
    let data = match rest {
        Some(rest) => format!("{}\n{}", shebang, rest),
        None => shebang.clone(),
    };
    (Some(shebang), data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalConnection;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    fn configure(
        cfg: &ModuleConfigurator,
        name: &str,
        args: &str,
        inject: &InjectContext,
        complex: Value,
    ) -> Result<ConfiguredModule, RunnerError> {
        let conn = LocalConnection::new("localhost");
        let complex = complex.as_object().cloned().unwrap_or_default();
        cfg.configure(&conn, name, args, inject, &complex)
    }

    #[test]
    fn test_builtin_styles() {
        let cfg = ModuleConfigurator::new(Vec::new(), true);
        let inject = InjectContext::new();

        let ping = configure(&cfg, "ping", "", &inject, json!({})).unwrap();
        assert_eq!(ping.style, ModuleStyle::Legacy);
        assert_eq!(ping.shebang.as_deref(), Some("#!/bin/sh"));
        assert_eq!(ping.source, ModuleSource::Builtin("ping"));

        let command = configure(&cfg, "command", "uptime", &inject, json!({"chdir": "/tmp"})).unwrap();
        assert_eq!(command.style, ModuleStyle::New);
        assert!(command.data.contains("MODULE_ARGS = \"uptime\""));
        assert!(command.data.contains(r#"MODULE_COMPLEX_ARGS = "{\"chdir\":\"/tmp\"}""#));
        assert!(command.data.contains("MODULE_LANG = \"C\""));
        assert!(!command.data.contains("<<INCLUDE_FANOUT"));
    }

    #[test]
    fn test_search_path_wins_and_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("ping.sh")).unwrap();
        writeln!(f, "#!/bin/bash\n# WANT_JSON\necho '{{}}'").unwrap();

        let cfg = ModuleConfigurator::new(vec![dir.path().to_path_buf()], true);
        let module = configure(&cfg, "ping", "", &InjectContext::new(), json!({})).unwrap();
        assert_eq!(module.style, ModuleStyle::WantJson);
        assert_eq!(module.source, ModuleSource::File(dir.path().join("ping.sh")));
    }

    #[test]
    fn test_json_args_replacer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("probe"),
            "#!/bin/sh\nARGS='<<INCLUDE_FANOUT_MODULE_JSON_ARGS>>'\necho \"$ARGS\"\n",
        )
        .unwrap();

        let cfg = ModuleConfigurator::new(vec![dir.path().to_path_buf()], false);
        let module = configure(&cfg, "probe", "b=2", &InjectContext::new(), json!({"a": 1})).unwrap();
        assert_eq!(module.style, ModuleStyle::New);
        assert!(module.data.contains(r#"ARGS='{"a":1,"b":"2"}'"#));
    }

    #[test]
    fn test_interpreter_override() {
        let cfg = ModuleConfigurator::new(Vec::new(), true);
        let mut inject = InjectContext::new();
        inject.insert("ansible_python_interpreter", json!("/opt/py3/bin/python3"));

        let module = configure(&cfg, "command", "ls", &inject, json!({})).unwrap();
        assert_eq!(module.shebang.as_deref(), Some("#!/opt/py3/bin/python3"));
        assert!(module.data.starts_with("#!/opt/py3/bin/python3\n"));
    }

    #[test]
    fn test_missing_module_and_missing_core() {
        let cfg = ModuleConfigurator::new(Vec::new(), true);
        match configure(&cfg, "nosuch", "", &InjectContext::new(), json!({})) {
            Err(RunnerError::ModuleNotFound { core_missing, message, .. }) => {
                assert!(!core_missing);
                assert_eq!(message, "module nosuch not found in configured module paths");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let bare = ModuleConfigurator::new(Vec::new(), false);
        match configure(&bare, "nosuch", "", &InjectContext::new(), json!({})) {
            Err(RunnerError::ModuleNotFound { core_missing, message, .. }) => {
                assert!(core_missing);
                assert!(message.contains("core modules are missing"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
