// Per-host execution: conditionals, target resolution, connection, argument
// templating, handler dispatch, retry-until and result shaping

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::args::{count_module_args, filter_omitted_args, filter_omitted_complex};
use super::context::RunContext;
use super::results::ReturnData;
use super::retry::{mark_exhausted, UntilPolicy};
use super::session::HostSession;
use super::shell::Shell;
use super::target::Target;
use super::task::TaskSpec;
use crate::actions::{ActionHandler, ActionInput};
use crate::output::errors::RunnerError;
use crate::template::TemplateError;
use crate::value::{boolean, is_truthy, to_plain_string};
use crate::vars::InjectContext;

/// Marker reserved for the engine; never accepted from templated arguments
const USE_SHELL: &str = "#USE_SHELL";
const NO_LOG_CENSORED: &str = "results hidden due to no_log parameter";

/// Runs one task against one host at a time
#[derive(Clone)]
pub struct HostExecutor {
    ctx: Arc<RunContext>,
    task: Arc<TaskSpec>,
    jid: String,
}

/// Module arguments as they were actually sent
struct SentArgs {
    module_args: String,
    complex_args: Map<String, Value>,
}

impl HostExecutor {
    pub fn new(ctx: Arc<RunContext>, task: Arc<TaskSpec>, jid: impl Into<String>) -> Self {
        HostExecutor {
            ctx,
            task,
            jid: jid.into(),
        }
    }

    /// Execute the task on `host`. Never fails: every error becomes an
    /// unreachable result so one bad host cannot abort the run.
    pub async fn execute(&self, host: &str) -> ReturnData {
        let result = match self.execute_host(host).await {
            Ok(result) => result,
            Err(e) => {
                warn!(host = %host, error = %e, "host execution failed");
                ReturnData::unreachable(host, e.to_string())
            }
        };

        if !result.comm_ok && !self.task.is_chained {
            self.ctx
                .callbacks
                .on_unreachable(host, &Value::Object(result.result.clone()))
                .await;
        }
        result
    }

    async fn execute_host(&self, host: &str) -> Result<ReturnData, RunnerError> {
        let inject = self.ctx.resolver.resolve(host, &self.task.layers);
        match &self.task.loop_items {
            None => self.execute_inner(host, inject, None).await,
            Some(raw) => self.execute_items(host, inject, raw).await,
        }
    }

    async fn execute_items(
        &self,
        host: &str,
        inject: InjectContext,
        raw: &Value,
    ) -> Result<ReturnData, RunnerError> {
        let ctx = &*self.ctx;
        let items = match ctx.templar.template(raw, &inject, true) {
            Ok(items) => items,
            Err(TemplateError::Undefined(msg)) => {
                // The list may legitimately be undefined on hosts the task skips
                let proceed = ctx.templar.check_conditionals(
                    &self.task.conditionals,
                    &inject,
                    ctx.config.error_on_undefined_vars,
                )?;
                if proceed {
                    return Err(RunnerError::UndefinedVariable(msg));
                }
                return Ok(self.skipped(host, None).await);
            }
            Err(e) => return Err(e.into()),
        };

        let Value::Array(items) = items else {
            return Err(RunnerError::Task(format!(
                "with_items expects a list, got {}",
                items
            )));
        };
        if self.task.background > 0 {
            return Err(RunnerError::Task(
                "loops cannot be used with async tasks".to_string(),
            ));
        }

        let items: Vec<Value> = items
            .into_iter()
            .flat_map(|item| match item {
                Value::Array(inner) => inner,
                other => vec![other],
            })
            .collect();

        if items.is_empty() {
            return Ok(self.skipped(host, None).await);
        }

        let mut results = Vec::with_capacity(items.len());
        let mut all_comm_ok = true;
        for item in items {
            let mut item_inject = inject.clone();
            item_inject.insert("item", item.clone());

            let mut result = self.execute_inner(host, item_inject, Some(&item)).await?;
            add_stdout_lines(&mut result.result);
            let comm_ok = result.comm_ok;
            results.push(result);
            if !comm_ok {
                all_comm_ok = false;
                break;
            }
        }

        let changed = results.iter().any(ReturnData::changed);
        let any_failed = results.iter().any(|r| r.comm_ok && !r.is_successful());
        let mut rollup = Map::new();
        rollup.insert("changed".into(), Value::Bool(changed));
        if all_comm_ok {
            if any_failed {
                rollup.insert("failed".into(), Value::Bool(true));
                rollup.insert("msg".into(), json!("One or more items failed."));
            } else {
                rollup.insert("msg".into(), json!("All items completed"));
            }
        }
        rollup.insert(
            "results".into(),
            Value::Array(results.into_iter().map(|r| Value::Object(r.result)).collect()),
        );

        let mut result = ReturnData::new(host, rollup);
        result.comm_ok = all_comm_ok;
        Ok(result)
    }

    async fn skipped(&self, host: &str, item: Option<&Value>) -> ReturnData {
        let mut result = Map::new();
        result.insert("changed".into(), Value::Bool(false));
        result.insert("skipped".into(), Value::Bool(true));
        if let Some(item) = item {
            result.insert("item".into(), item.clone());
        }
        if !self.task.is_chained {
            self.ctx.callbacks.on_skipped(host, item).await;
        }
        ReturnData::new(host, result)
    }

    fn select_handler(&self) -> Result<Arc<dyn ActionHandler>, RunnerError> {
        let actions = &self.ctx.actions;
        match actions.get(&self.task.module_name) {
            Some(_) if self.task.background > 0 => Err(RunnerError::Task(format!(
                "async mode is not supported with the {} module",
                self.task.module_name
            ))),
            Some(handler) => Ok(handler),
            None if self.task.background > 0 => Ok(actions.background()),
            None => Ok(actions.normal()),
        }
    }

    async fn execute_inner(
        &self,
        host: &str,
        mut inject: InjectContext,
        item: Option<&Value>,
    ) -> Result<ReturnData, RunnerError> {
        let ctx = &*self.ctx;
        let task = &*self.task;

        let handler = self.select_handler()?;

        if !ctx
            .templar
            .check_conditionals(&task.conditionals, &inject, ctx.config.error_on_undefined_vars)?
        {
            debug!(host = %host, "conditional false, skipping");
            return Ok(self.skipped(host, item).await);
        }

        handler.setup(&task.module_name, &inject)?;

        let target = match Target::resolve(ctx, task, host, &mut inject) {
            Ok(target) => target,
            Err(e @ RunnerError::ConnectionFailed { .. }) => {
                return Ok(ReturnData::unreachable(host, e.to_string()))
            }
            Err(e) => return Err(e),
        };

        info!(
            host = %host,
            actual = %target.host,
            port = target.port,
            transport = %target.transport,
            "connecting"
        );
        let conn = match ctx
            .connector
            .connect(&target.connect_params(ctx.config.timeout))
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                let err = e.into_runner_error(host);
                return Ok(ReturnData::unreachable(host, err.to_string()));
            }
        };

        let shell_name = inject
            .get_str("ansible_shell_type")
            .or_else(|| conn.default_shell().map(str::to_string))
            .unwrap_or_else(|| ctx.config.executable.clone());

        let mut session = HostSession {
            ctx,
            task,
            jid: &self.jid,
            conn,
            shell: Shell::from_name(&shell_name),
            target,
            host: host.to_string(),
            tmp: None,
        };

        let outcome = self.run_in_session(&mut session, handler.as_ref(), &mut inject).await;
        session.close().await;
        let (mut result, sent) = outcome?;

        if !result.comm_ok {
            return Ok(result);
        }
        self.shape(host, &mut result, &sent, &mut inject, item);

        if task.is_chained {
            return Ok(result);
        }
        self.report(host, &result, item).await;
        Ok(result)
    }

    async fn run_in_session(
        &self,
        session: &mut HostSession<'_>,
        handler: &dyn ActionHandler,
        inject: &mut InjectContext,
    ) -> Result<(ReturnData, SentArgs), RunnerError> {
        let outcome = self.invoke(session, handler, inject).await;
        // Background jobs own their temp path until the wrapper finishes
        if outcome.is_err() || self.task.background == 0 {
            session.cleanup_tmp().await;
        }
        outcome
    }

    async fn invoke(
        &self,
        session: &mut HostSession<'_>,
        handler: &dyn ActionHandler,
        inject: &mut InjectContext,
    ) -> Result<(ReturnData, SentArgs), RunnerError> {
        let ctx = &*self.ctx;
        let task = &*self.task;

        if handler.transfers_files() {
            session.ensure_tmp().await?;
        }

        let sent = self.template_args(inject)?;
        let input = ActionInput {
            module_name: &task.module_name,
            module_args: &sent.module_args,
            inject: &*inject,
            complex_args: &sent.complex_args,
        };
        let mut result = handler.run(session, input).await?;

        if let Some(until) = &task.until {
            let policy = UntilPolicy {
                condition: until,
                register: task.register.as_deref().unwrap_or("result"),
                retries: &task.retries,
                delay: &task.delay,
            };

            if policy.satisfied(ctx, inject, &result.result)? {
                result.result.insert("attempts".into(), json!(0));
            } else {
                let mut attempt: u64 = 0;
                let mut satisfied = false;

                while (attempt as f64) < policy.retries(ctx, inject)? {
                    attempt += 1;
                    let delay = policy.delay(ctx, inject)?;
                    debug!(host = %session.host, attempt, delay = ?delay, "retrying until condition holds");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => return Err(RunnerError::Interrupted),
                    }

                    session.cleanup_tmp().await;
                    if handler.transfers_files() {
                        session.ensure_tmp().await?;
                    }
                    let input = ActionInput {
                        module_name: &task.module_name,
                        module_args: &sent.module_args,
                        inject: &*inject,
                        complex_args: &sent.complex_args,
                    };
                    result = handler.run(session, input).await?;
                    result.result.insert("attempts".into(), json!(attempt));

                    if policy.satisfied(ctx, inject, &result.result)? {
                        satisfied = true;
                        break;
                    }
                }

                if !satisfied {
                    info!(host = %session.host, attempts = attempt, "retries exhausted");
                    result.result.insert("attempts".into(), json!(attempt));
                    mark_exhausted(&mut result.result);
                }
            }
        }

        Ok((result, sent))
    }

    /// Template the argument string and complex args, refusing templated
    /// values that add parameters or engine markers, then drop omitted values
    fn template_args(&self, inject: &InjectContext) -> Result<SentArgs, RunnerError> {
        let ctx = &*self.ctx;
        let task = &*self.task;
        let strict = ctx.config.error_on_undefined_vars;

        let before = count_module_args(&task.module_name, &task.module_args, true)?;
        let module_args = to_plain_string(&ctx.templar.render(&task.module_args, inject, strict)?);
        let after = count_module_args(&task.module_name, &module_args, false)?;
        if before != after {
            return Err(RunnerError::ArgumentInjection { before, after });
        }
        if module_args.contains(USE_SHELL) {
            return Err(RunnerError::ForbiddenArgument(USE_SHELL.to_string()));
        }

        let complex = ctx
            .templar
            .template(&Value::Object(task.complex_args.clone()), inject, strict)?;
        let complex_args = match complex {
            Value::Object(map) => map,
            other => {
                return Err(RunnerError::Contract(format!(
                    "complex args templated to a non-mapping: {}",
                    other
                )))
            }
        };

        Ok(SentArgs {
            module_args: filter_omitted_args(&module_args, &ctx.omit_token)?,
            complex_args: filter_omitted_complex(&complex_args, &ctx.omit_token),
        })
    }

    fn shape(
        &self,
        host: &str,
        result: &mut ReturnData,
        sent: &SentArgs,
        inject: &mut InjectContext,
        item: Option<&Value>,
    ) {
        let ctx = &*self.ctx;
        let task = &*self.task;
        let data = &mut result.result;

        if ctx.scrub_output {
            for key in ["stdout", "stderr"] {
                if let Some(Value::String(s)) = data.get_mut(key) {
                    *s = scrub(s);
                }
            }
        }

        data.insert(
            "invocation".into(),
            json!({
                "module_name": task.module_name,
                "module_args": sent.module_args,
                "module_complex_args": sent.complex_args,
            }),
        );
        if let Some(item) = item {
            data.insert("item".into(), item.clone());
        }

        if task.background > 0 || (task.changed_when.is_empty() && task.failed_when.is_empty()) {
            return;
        }
        if let Some(register) = &task.register {
            add_stdout_lines(data);
            inject.insert(register.as_str(), Value::Object(data.clone()));
        }
        // async_status results are judged only once the job finished
        if task.module_name == "async_status" && !data.get("finished").map(is_truthy).unwrap_or(false) {
            return;
        }
        if data.contains_key("skipped") {
            return;
        }

        let strict = ctx.config.error_on_undefined_vars;
        if !task.changed_when.is_empty() {
            match ctx.templar.check_conditionals(&task.changed_when, inject, strict) {
                Ok(changed) => {
                    data.insert("changed".into(), Value::Bool(changed));
                }
                Err(e) => warn!(host = %host, error = %e, "changed_when could not be evaluated"),
            }
        }
        if !task.failed_when.is_empty() {
            match ctx.templar.check_conditionals(&task.failed_when, inject, strict) {
                Ok(failed) => {
                    data.insert("failed_when_result".into(), Value::Bool(failed));
                    data.insert("failed".into(), Value::Bool(failed));
                }
                Err(e) => {
                    data.insert("failed".into(), Value::Bool(true));
                    data.insert("msg".into(), json!(format!("failed_when could not be evaluated: {}", e)));
                }
            }
        }
    }

    async fn report(&self, host: &str, result: &ReturnData, item: Option<&Value>) {
        let callbacks = &self.ctx.callbacks;

        if result.result.get("skipped").map(boolean).unwrap_or(false) {
            callbacks.on_skipped(host, item).await;
            return;
        }

        let data = if self.task.no_log {
            censor(&result.result)
        } else {
            result.result.clone()
        };

        if !result.is_successful() {
            callbacks.on_failed(host, &data, self.task.ignore_errors).await;
        } else {
            if let Some(diff) = &result.diff {
                if self.task.diff {
                    callbacks.on_file_diff(host, diff).await;
                }
            }
            callbacks.on_ok(host, &data).await;
        }
    }
}

fn add_stdout_lines(data: &mut Map<String, Value>) {
    if data.contains_key("stdout_lines") {
        return;
    }
    if let Some(Value::String(stdout)) = data.get("stdout") {
        let lines: Vec<Value> = stdout.lines().map(|l| Value::String(l.to_string())).collect();
        data.insert("stdout_lines".into(), Value::Array(lines));
    }
}

/// Drop characters a terminal would interpret, keeping line structure
fn scrub(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect()
}

/// Keep only the outcome keys of a `no_log` result
fn censor(data: &Map<String, Value>) -> Map<String, Value> {
    let mut out: Map<String, Value> = data
        .iter()
        .filter(|(k, _)| matches!(k.as_str(), "skipped" | "changed" | "failed" | "rc"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    out.insert("censored".into(), json!(NO_LOG_CENSORED));
    out
}
