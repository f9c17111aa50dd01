// Shell dialects used to compose remote commands

use once_cell::sync::Lazy;
use regex::Regex;

static USER_HOME_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^~[_.A-Za-z0-9][-_.A-Za-z0-9]*$").expect("valid regex"));

/// Remote shell dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shell {
    #[default]
    Sh,
    Csh,
}

impl Shell {
    /// Pick a dialect from a shell name or executable path; unknown shells
    /// are treated as POSIX sh
    pub fn from_name(name: &str) -> Self {
        let base = name.rsplit('/').next().unwrap_or(name);
        match base {
            "csh" | "tcsh" => Shell::Csh,
            _ => Shell::Sh,
        }
    }

    /// Locale assignments followed by `env`, each value shell-quoted
    pub fn env_prefix<'a, I>(&self, module_lang: &str, env: I) -> String
    where
        I: IntoIterator<Item = (&'a str, String)>,
    {
        let mut pairs: Vec<(String, String)> = ["LANG", "LC_CTYPE", "LC_MESSAGES"]
            .iter()
            .map(|k| (k.to_string(), module_lang.to_string()))
            .collect();
        for (k, v) in env {
            match pairs.iter_mut().find(|(existing, _)| existing == k) {
                Some(slot) => slot.1 = v,
                None => pairs.push((k.to_string(), v)),
            }
        }

        let assignments = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_words::quote(v)))
            .collect::<Vec<_>>()
            .join(" ");

        match self {
            Shell::Sh => assignments,
            Shell::Csh => format!("env {}", assignments),
        }
    }

    /// Join path components; an absolute component discards everything before it
    pub fn join_path(&self, parts: &[&str]) -> String {
        let mut out = String::new();
        for part in parts {
            if part.starts_with('/') {
                out = part.to_string();
            } else if out.is_empty() || out.ends_with('/') {
                out.push_str(part);
            } else {
                out.push('/');
                out.push_str(part);
            }
        }
        out
    }

    pub fn chmod(&self, mode: &str, path: &str) -> String {
        format!("chmod {} {}", mode, shell_words::quote(path))
    }

    pub fn remove(&self, path: &str, recurse: bool) -> String {
        let flags = if recurse { "-rf" } else { "-f" };
        format!("rm {} {} >/dev/null 2>&1", flags, shell_words::quote(path))
    }

    /// Command that creates `basefile` under the remote tmp root and echoes
    /// the resulting path. The path is left unquoted so `$HOME` expands.
    pub fn mkdtemp(
        &self,
        remote_tmp: &str,
        system_tmp: &str,
        basefile: &str,
        system: bool,
        mode: Option<&str>,
    ) -> String {
        let mut basetmp = self.join_path(&[remote_tmp, basefile]);
        if system && basetmp.starts_with("$HOME") {
            basetmp = self.join_path(&[system_tmp, basefile]);
        }

        let mut cmd = format!("mkdir -p {}", basetmp);
        if let Some(mode) = mode {
            cmd.push_str(&format!(" && chmod {} {}", mode, basetmp));
        }
        cmd.push_str(&format!(" && echo {}", basetmp));
        cmd
    }

    /// Command echoing the expansion of `~` or `~user`; other paths are
    /// quoted and echoed back unchanged
    pub fn expand_user(&self, path: &str) -> String {
        if path == "~" || USER_HOME_PATH.is_match(path) {
            format!("echo {}", path)
        } else {
            format!("echo {}", shell_words::quote(path))
        }
    }

    /// Probe printing `<sha256>  <path>` or a status code in place of the
    /// hash: 1 missing, 2 unreadable, 3 directory, 4 no hashing tool
    pub fn checksum(&self, path: &str) -> String {
        let p = shell_words::quote(path);
        let probe = format!(
            "rc=0; [ -r {p} ] || rc=2; [ -f {p} ] || rc=1; [ -d {p} ] && rc=3; \
             if [ $rc -ne 0 ]; then echo \"$rc  \"{p}; \
             else (sha256sum {p} 2>/dev/null || shasum -a 256 {p} 2>/dev/null || echo \"4  \"{p}); fi",
            p = p
        );
        match self {
            Shell::Sh => probe,
            // csh cannot parse the probe; hand it to sh
            Shell::Csh => format!("sh -c {}", shell_words::quote(&probe)),
        }
    }

    /// `<env> <interpreter> <cmd>`, optionally followed by removal of the tmp dir
    pub fn build_module_command(
        &self,
        env_string: &str,
        shebang: &str,
        cmd: &str,
        rm_tmp: Option<&str>,
    ) -> String {
        let interpreter = shebang.replacen("#!", "", 1);
        let parts = [env_string.trim(), interpreter.trim(), cmd];
        let mut out = parts
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(tmp) = rm_tmp {
            out.push_str(&format!("; rm -rf {} >/dev/null 2>&1", shell_words::quote(tmp)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_name() {
        assert_eq!(Shell::from_name("/bin/tcsh"), Shell::Csh);
        assert_eq!(Shell::from_name("bash"), Shell::Sh);
        assert_eq!(Shell::from_name("fish"), Shell::Sh);
    }

    #[test]
    fn test_env_prefix() {
        let sh = Shell::Sh.env_prefix("C", vec![("PATH", "/opt/bin:$PATH".to_string())]);
        assert_eq!(sh, "LANG=C LC_CTYPE=C LC_MESSAGES=C PATH='/opt/bin:$PATH'");

        let csh = Shell::Csh.env_prefix("en_US.UTF-8", vec![("LANG", "C".to_string())]);
        assert_eq!(csh, "env LANG=C LC_CTYPE=en_US.UTF-8 LC_MESSAGES=en_US.UTF-8");
    }

    #[test]
    fn test_join_path() {
        let sh = Shell::Sh;
        assert_eq!(sh.join_path(&["/tmp/x/", "mod"]), "/tmp/x/mod");
        assert_eq!(sh.join_path(&["$HOME/.fanout/tmp", "f"]), "$HOME/.fanout/tmp/f");
        assert_eq!(sh.join_path(&["/a", "/b"]), "/b");
        assert_eq!(sh.join_path(&["/a/b", ""]), "/a/b/");
    }

    #[test]
    fn test_mkdtemp() {
        let sh = Shell::Sh;
        assert_eq!(
            sh.mkdtemp("$HOME/.fanout/tmp", "/tmp", "fanout-tmp-1-2", false, None),
            "mkdir -p $HOME/.fanout/tmp/fanout-tmp-1-2 && echo $HOME/.fanout/tmp/fanout-tmp-1-2"
        );
        assert_eq!(
            sh.mkdtemp("$HOME/.fanout/tmp", "/tmp", "b", true, Some("a+rx")),
            "mkdir -p /tmp/b && chmod a+rx /tmp/b && echo /tmp/b"
        );
    }

    #[test]
    fn test_expand_user_quotes_other_paths() {
        assert_eq!(Shell::Sh.expand_user("~"), "echo ~");
        assert_eq!(Shell::Sh.expand_user("~deploy"), "echo ~deploy");
        assert_eq!(Shell::Sh.expand_user("~x; rm -rf /"), "echo '~x; rm -rf /'");
    }

    #[test]
    fn test_build_module_command() {
        let cmd = Shell::Sh.build_module_command(
            "LANG=C",
            "#!/usr/bin/python",
            "/tmp/t/ping",
            Some("/tmp/t/"),
        );
        assert_eq!(
            cmd,
            "LANG=C /usr/bin/python /tmp/t/ping; rm -rf /tmp/t/ >/dev/null 2>&1"
        );
        assert!(Shell::Sh.checksum("/etc/hosts").contains("sha256sum /etc/hosts"));
    }
}
