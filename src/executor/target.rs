// Connection target resolution: actual host, credentials, escalation and
// delegation, computed fresh for every host invocation

use serde_json::{Map, Value};
use tracing::debug;

use super::become_cmd::{BecomeMethod, BecomeSpec};
use super::context::RunContext;
use super::task::TaskSpec;
use super::ConnectParams;
use crate::output::errors::RunnerError;
use crate::value::{boolean, from_object, to_plain_string};
use crate::vars::InjectContext;

/// Where and how one host invocation connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub transport: String,
    pub private_key_file: Option<String>,
    pub escalation: Option<BecomeSpec>,
    /// The inventory host acted for, when it differs from `host`
    pub delegate_host: Option<String>,
}

impl Target {
    pub fn connect_params(&self, timeout_secs: u64) -> ConnectParams {
        ConnectParams {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.pass.clone(),
            transport: self.transport.clone(),
            private_key_file: self.private_key_file.clone(),
            delegate_host: self.delegate_host.clone(),
            timeout_secs,
        }
    }

    /// Escalating to a user other than root
    pub fn becomes_unprivileged(&self) -> bool {
        self.escalation
            .as_ref()
            .map(BecomeSpec::is_unprivileged)
            .unwrap_or(false)
    }

    /// Escalation is off, or targets root
    pub fn becomes_root_or_none(&self) -> bool {
        !self.becomes_unprivileged()
    }

    /// Resolve the target for `host`, rewriting `inject` for delegation
    pub fn resolve(
        ctx: &RunContext,
        task: &TaskSpec,
        host: &str,
        inject: &mut InjectContext,
    ) -> Result<Target, RunnerError> {
        let templar = ctx.templar.as_ref();

        let raw_host = inject
            .get_str("ansible_ssh_host")
            .unwrap_or_else(|| host.to_string());
        let mut actual_host = to_plain_string(&templar.render(&raw_host, inject, true)?);

        let mut actual_user = inject
            .get_str("ansible_ssh_user")
            .or_else(|| task.remote_user.clone())
            .or_else(|| ctx.config.remote_user.clone());
        let mut actual_pass = inject
            .get_str("ansible_ssh_pass")
            .or_else(|| task.remote_pass.clone());
        let mut actual_transport = inject
            .get_str("ansible_connection")
            .or_else(|| task.transport.clone())
            .unwrap_or_else(|| ctx.config.transport.clone());
        let mut actual_key_file = match inject
            .get_str("ansible_ssh_private_key_file")
            .or_else(|| task.private_key_file.clone())
            .or_else(|| {
                ctx.config
                    .private_key_file
                    .as_ref()
                    .map(|p| p.display().to_string())
            }) {
            Some(raw) => Some(expand_tilde(&to_plain_string(
                &templar.render(&raw, inject, true)?,
            ))),
            None => None,
        };

        let become_flag = first_of(inject, &["ansible_become", "ansible_sudo", "ansible_su"])
            .map(boolean)
            .unwrap_or(task.become_flag);
        let become_user = first_str(
            inject,
            &["ansible_become_user", "ansible_sudo_user", "ansible_su_user"],
        )
        .or_else(|| task.become_user.clone())
        .unwrap_or_else(|| ctx.config.become_user.clone());
        let mut become_pass = first_str(
            inject,
            &["ansible_become_pass", "ansible_sudo_pass", "ansible_su_pass"],
        )
        .or_else(|| task.become_pass.clone());
        let become_exe = first_str(inject, &["ansible_become_exe", "ansible_sudo_exe"])
            .or_else(|| task.become_exe.clone())
            .or_else(|| ctx.config.become_exe.clone());
        let become_method = inject
            .get_str("ansible_become_method")
            .or_else(|| task.become_method.clone())
            .unwrap_or_else(|| ctx.config.become_method.clone());

        template_credentials(ctx, inject, &mut actual_user, &mut actual_pass, &mut become_pass);

        let delegate_name = match &task.delegate_to {
            Some(raw) => Some(to_plain_string(&templar.render(raw, inject, false)?)),
            None => None,
        };

        let raw_port = match &delegate_name {
            Some(name) => {
                let delegate =
                    DelegateContext::compute(ctx, task, name, actual_pass.clone(), become_pass.clone(), inject)?;
                debug!(host, delegate = %name, ssh_host = %delegate.ssh_host, "delegating");

                actual_transport = delegate.transport;
                actual_host = delegate.ssh_host;
                actual_user = delegate.user;
                actual_pass = delegate.pass;
                actual_key_file = delegate.private_key_file;
                become_pass = delegate.become_pass;
                *inject = delegate.inject;
                inject.insert("delegate_to", Value::String(actual_host.clone()));

                template_credentials(ctx, inject, &mut actual_user, &mut actual_pass, &mut become_pass);
                delegate.port
            }
            None => inject
                .get("ansible_ssh_port")
                .cloned()
                .or_else(|| task.remote_port.map(Value::from))
                .unwrap_or_else(|| Value::from(ctx.config.remote_port)),
        };

        let port = parse_port(ctx, &raw_port, inject).ok_or_else(|| RunnerError::ConnectionFailed {
            host: host.to_string(),
            message: format!(
                "Configured port \"{}\" is not a valid port, expected integer",
                to_plain_string(&raw_port)
            ),
        })?;

        let escalation = if become_flag {
            let method: BecomeMethod = become_method.parse()?;
            Some(
                BecomeSpec::new(method, become_user)
                    .with_password(become_pass)
                    .with_exe(become_exe),
            )
        } else {
            None
        };

        let delegate_host = (delegate_name.is_some() || host != actual_host).then(|| host.to_string());

        Ok(Target {
            host: actual_host,
            port,
            user: actual_user,
            pass: actual_pass,
            transport: actual_transport,
            private_key_file: actual_key_file,
            escalation,
            delegate_host,
        })
    }
}

/// Connection settings of a delegate host, read from its own variables
#[derive(Debug, Clone)]
pub struct DelegateContext {
    pub ssh_host: String,
    /// Raw port value; templated and parsed by the caller
    pub port: Value,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub private_key_file: Option<String>,
    pub transport: String,
    pub become_pass: Option<String>,
    /// The original host's context with the delegate's interpreters swapped in
    pub inject: InjectContext,
}

impl DelegateContext {
    pub fn compute(
        ctx: &RunContext,
        task: &TaskSpec,
        delegate: &str,
        password: Option<String>,
        become_pass: Option<String>,
        remote: &InjectContext,
    ) -> Result<Self, RunnerError> {
        let mut inject = remote.clone();
        let interpreter_keys: Vec<String> = inject
            .keys()
            .filter(|k| is_interpreter_var(k))
            .cloned()
            .collect();
        for key in interpreter_keys {
            inject.remove(&key);
        }

        // Hosts outside inventory have no variables of their own
        let this_info: Map<String, Value> = remote
            .host_vars_for(delegate)
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        let info_str = |key: &str| match this_info.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(to_plain_string(v)),
        };

        let info_ctx = InjectContext::from_map(from_object(&this_info));
        let raw_ssh_host = info_str("ansible_ssh_host").unwrap_or_else(|| delegate.to_string());
        let ssh_host = to_plain_string(&ctx.templar.render(&raw_ssh_host, &info_ctx, false)?);

        let private_key_file = info_str("ansible_ssh_private_key_file")
            .or_else(|| task.private_key_file.clone())
            .or_else(|| {
                ctx.config
                    .private_key_file
                    .as_ref()
                    .map(|p| p.display().to_string())
            })
            .or_else(|| remote.get_str("ansible_ssh_private_key_file"))
            .map(|p| expand_tilde(&p));

        for (key, value) in &this_info {
            if is_interpreter_var(key) {
                inject.insert(key.clone(), value.clone());
            }
        }

        Ok(DelegateContext {
            ssh_host,
            port: this_info
                .get("ansible_ssh_port")
                .cloned()
                .unwrap_or_else(|| Value::from(ctx.config.remote_port)),
            user: compute_delegate_user(ctx, task, delegate, remote),
            pass: info_str("ansible_ssh_pass").or(password),
            private_key_file,
            transport: info_str("ansible_connection")
                .or_else(|| task.transport.clone())
                .unwrap_or_else(|| ctx.config.transport.clone()),
            become_pass: info_str("ansible_become_pass")
                .or_else(|| info_str("ansible_ssh_pass"))
                .or(become_pass),
            inject,
        })
    }
}

/// Delegate inventory user, then the task's remote user, then the original
/// host's user
fn compute_delegate_user(
    ctx: &RunContext,
    task: &TaskSpec,
    delegate: &str,
    inject: &InjectContext,
) -> Option<String> {
    let from_inventory = match inject.host_vars_for(delegate) {
        Some(vars) => vars
            .get("ansible_ssh_user")
            .filter(|v| !v.is_null() && v.as_str() != Some(""))
            .map(to_plain_string),
        None => ctx
            .inventory
            .get_variables(delegate)
            .and_then(|vars| vars.get("ansible_ssh_user").map(to_plain_string)),
    };

    let remote_user = task.remote_user.clone().or_else(|| ctx.config.remote_user.clone());
    from_inventory
        .or_else(|| remote_user.clone())
        .or_else(|| inject.get_str("ansible_ssh_user"))
}

/// Template user and passwords; password templating errors are ignored
/// since passwords may contain template-like characters
fn template_credentials(
    ctx: &RunContext,
    inject: &mut InjectContext,
    user: &mut Option<String>,
    pass: &mut Option<String>,
    become_pass: &mut Option<String>,
) {
    let templar = ctx.templar.as_ref();
    if let Some(u) = user.as_ref() {
        if let Ok(rendered) = templar.render(u, inject, false) {
            *user = Some(to_plain_string(&rendered));
        }
    }
    for secret in [pass, become_pass] {
        if let Some(p) = secret.as_ref() {
            if let Ok(rendered) = templar.render(p, inject, false) {
                *secret = Some(to_plain_string(&rendered));
            }
        }
    }

    if let Some(u) = user.as_ref() {
        inject.insert("ansible_ssh_user", Value::String(u.clone()));
    }
}

fn parse_port(ctx: &RunContext, raw: &Value, inject: &InjectContext) -> Option<u16> {
    match raw {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => {
            let rendered = ctx.templar.render(s, inject, false).ok()?;
            to_plain_string(&rendered).trim().parse().ok()
        }
        _ => None,
    }
}

fn first_of<'a>(inject: &'a InjectContext, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| inject.get(k).filter(|v| !v.is_null()))
}

fn first_str(inject: &InjectContext, keys: &[&str]) -> Option<String> {
    first_of(inject, keys).map(to_plain_string)
}

fn is_interpreter_var(key: &str) -> bool {
    key.starts_with("ansible_") && key.ends_with("_interpreter")
}

fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix('~'), std::env::var("HOME")) {
        (Some(rest), Ok(home)) if rest.is_empty() || rest.starts_with('/') => {
            format!("{}{}", home, rest)
        }
        _ => path.to_string(),
    }
}
