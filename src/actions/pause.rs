// Pause the run for a while or until the operator answers a prompt

use std::io::{BufRead, Write};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Value};
use tracing::info;

use super::{merged_args, result_map, ActionHandler, ActionInput};
use crate::executor::{HostSession, ReturnData};
use crate::output::errors::RunnerError;
use crate::value::{as_f64, to_plain_string};

pub struct PauseAction;

enum PauseKind {
    Timed(f64),
    Prompt(String),
}

fn pause_kind(args: &serde_json::Map<String, Value>) -> Result<PauseKind, String> {
    let number = |key: &str| -> Result<Option<f64>, String> {
        match args.get(key) {
            None => Ok(None),
            Some(v) => as_f64(v)
                .map(Some)
                .ok_or_else(|| format!("non-integer value given for prompt duration: {}", to_plain_string(v))),
        }
    };

    if let Some(minutes) = number("minutes")? {
        return Ok(PauseKind::Timed(minutes * 60.0));
    }
    if let Some(seconds) = number("seconds")? {
        return Ok(PauseKind::Timed(seconds));
    }
    let prompt = args
        .get("prompt")
        .map(|p| format!("[pause]\n{}:", to_plain_string(p)))
        .unwrap_or_else(|| "[pause]\nPress enter to continue:".to_string());
    Ok(PauseKind::Prompt(prompt))
}

#[async_trait]
impl ActionHandler for PauseAction {
    fn name(&self) -> &'static str {
        "pause"
    }

    fn bypass_host_loop(&self) -> bool {
        true
    }

    async fn run(
        &self,
        session: &mut HostSession<'_>,
        input: ActionInput<'_>,
    ) -> Result<ReturnData, RunnerError> {
        let args = merged_args(input.module_args, input.complex_args)?;
        let kind = match pause_kind(&args) {
            Ok(kind) => kind,
            Err(msg) => {
                return Ok(ReturnData::new(
                    session.host.clone(),
                    result_map(json!({"failed": true, "msg": msg})),
                ))
            }
        };

        let start = Local::now();
        let mut result = json!({"changed": false});

        match kind {
            PauseKind::Timed(secs) => {
                info!(seconds = secs, "pausing");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))) => {}
                    _ = session.ctx.cancel.cancelled() => return Err(RunnerError::Interrupted),
                }
                result["stdout"] = json!(format!("Paused for {} seconds", secs));
            }
            PauseKind::Prompt(prompt) => {
                let console = session.ctx.locks.console.clone();
                let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
                    let _guard = console.lock();
                    let mut stdout = std::io::stdout();
                    write!(stdout, "{} ", prompt)?;
                    stdout.flush()?;
                    let mut line = String::new();
                    std::io::stdin().lock().read_line(&mut line)?;
                    Ok(line.trim_end_matches(['\r', '\n']).to_string())
                });
                let answer = tokio::select! {
                    answer = answer => answer
                        .map_err(|e| RunnerError::Contract(format!("prompt task failed: {}", e)))??,
                    _ = session.ctx.cancel.cancelled() => return Err(RunnerError::Interrupted),
                };
                result["user_input"] = json!(answer);
            }
        }

        let stop = Local::now();
        result["start"] = json!(start.format("%Y-%m-%d %H:%M:%S").to_string());
        result["stop"] = json!(stop.format("%Y-%m-%d %H:%M:%S").to_string());
        result["delta"] = json!((stop - start).num_seconds());

        Ok(ReturnData::new(session.host.clone(), result_map(result)))
    }
}
