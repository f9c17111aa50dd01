// Polling of background jobs started with `Runner::run_async`

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::context::RunContext;
use super::results::RunResults;
use super::scheduler::Runner;
use super::task::TaskSpec;
use crate::output::errors::RunnerError;
use crate::value::{as_f64, is_truthy, to_plain_string};

/// Outcome of one polling round
#[derive(Debug, Clone, Default)]
pub struct PollResults {
    /// Hosts whose job finished this round
    pub contacted: IndexMap<String, Map<String, Value>>,
    pub dark: IndexMap<String, Map<String, Value>>,
    /// Hosts whose job is still running
    pub polled: IndexMap<String, Map<String, Value>>,
}

/// Tracks the background jobs of one task until they finish
pub struct AsyncPoller {
    ctx: Arc<RunContext>,
    task: Arc<TaskSpec>,
    results: RunResults,
    hosts_to_poll: Vec<String>,
    active: bool,
    completed: bool,
}

fn started(result: &Map<String, Value>) -> bool {
    result.get("started").map(is_truthy).unwrap_or(false)
}

impl AsyncPoller {
    /// Take over the start results of a background run. Hosts that never
    /// started a job are final right away.
    pub fn new(ctx: Arc<RunContext>, task: Arc<TaskSpec>, start: &RunResults) -> Result<Self, RunnerError> {
        let mut results = RunResults::default();
        let mut hosts_to_poll = Vec::new();
        let mut jid = None;

        for (host, res) in &start.contacted {
            if started(res) {
                let job_id = res.get("ansible_job_id").cloned().unwrap_or(Value::Null);
                if !job_id.is_null() {
                    jid = Some(to_plain_string(&job_id));
                }
                ctx.vars_cache
                    .entry(host.clone())
                    .or_default()
                    .insert("ansible_job_id".into(), job_id);
                hosts_to_poll.push(host.clone());
            } else {
                results.contacted.insert(host.clone(), res.clone());
            }
        }
        for (host, res) in &start.dark {
            ctx.vars_cache
                .entry(host.clone())
                .or_default()
                .insert("ansible_job_id".into(), Value::String(String::new()));
            results.dark.insert(host.clone(), res.clone());
        }

        let active = !hosts_to_poll.is_empty();
        if active && jid.is_none() {
            return Err(RunnerError::Contract("unable to determine jid".into()));
        }
        debug!(hosts = hosts_to_poll.len(), "tracking background jobs");

        Ok(AsyncPoller {
            ctx,
            task,
            results,
            hosts_to_poll,
            active,
            completed: !active,
        })
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Hosts whose job has not finished yet
    pub fn pending(&self) -> &[String] {
        &self.hosts_to_poll
    }

    /// Final results gathered so far
    pub fn results(&self) -> &RunResults {
        &self.results
    }

    fn job_id(&self, host: &str) -> String {
        self.ctx
            .vars_cache
            .get(host)
            .and_then(|vars| vars.get("ansible_job_id").map(to_plain_string))
            .unwrap_or_default()
    }

    fn status_task(&self) -> TaskSpec {
        let mut task = (*self.task).clone();
        task.module_name = "async_status".into();
        task.module_args = "jid={{ ansible_job_id }}".into();
        task.complex_args = Map::new();
        task.background = 0;
        task.loop_items = None;
        task.until = None;
        task.register = None;
        task.run_once = false;
        task.run_hosts = Some(self.hosts_to_poll.clone());
        task
    }

    /// Ask every pending host for the state of its job
    pub async fn poll(&mut self) -> Result<PollResults, RunnerError> {
        let runner = Runner::new(self.ctx.clone(), Arc::new(self.status_task()));
        let round = runner.run().await?;

        let mut poll = PollResults::default();
        let mut still_running = Vec::new();

        for (host, res) in round.contacted {
            if started(&res) && !res.get("finished").map(is_truthy).unwrap_or(false) {
                still_running.push(host.clone());
                poll.polled.insert(host, res);
                continue;
            }

            let jid = self.job_id(&host);
            let rc = res.get("rc").and_then(as_f64).unwrap_or(0.0);
            let failed = res.get("failed").map(is_truthy).unwrap_or(false);
            if failed || rc != 0.0 {
                self.ctx.callbacks.on_async_failed(&host, &res, &jid).await;
            } else {
                self.ctx.callbacks.on_async_ok(&host, &res, &jid).await;
            }
            self.results.contacted.insert(host.clone(), res.clone());
            poll.contacted.insert(host, res);
        }

        for (host, res) in round.dark {
            if self.hosts_to_poll.contains(&host) {
                let jid = self.job_id(&host);
                self.ctx.callbacks.on_async_failed(&host, &res, &jid).await;
            }
            self.results.dark.insert(host.clone(), res.clone());
            poll.dark.insert(host, res);
        }

        self.hosts_to_poll = still_running;
        if self.hosts_to_poll.is_empty() {
            self.completed = true;
        }
        Ok(poll)
    }

    /// Poll every `interval` seconds for up to `seconds`, then return what
    /// finished. Hosts still running when time runs out are left out.
    pub async fn wait(&mut self, seconds: u64, interval: u64) -> Result<RunResults, RunnerError> {
        if !self.active {
            return Ok(self.results.clone());
        }

        let interval = interval.max(1);
        let mut clock = seconds as i64 - interval as i64;
        while clock >= 0 && !self.completed {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(RunnerError::Interrupted),
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            }

            let round = self.poll().await?;
            for (host, res) in &round.polled {
                let jid = self.job_id(host);
                self.ctx.callbacks.on_async_poll(host, res, &jid, clock).await;
            }
            clock -= interval as i64;
        }

        if !self.completed {
            info!(pending = self.hosts_to_poll.len(), "background jobs still running at deadline");
        }
        Ok(self.results.clone())
    }
}
