// Dispatcher: fans a task out across hosts through a bounded worker pool,
// or runs it once for the whole group

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::async_jobs::AsyncPoller;
use super::context::RunContext;
use super::host::HostExecutor;
use super::results::{partition, ReturnData, RunResults};
use super::task::TaskSpec;
use crate::inventory::HostFilter;
use crate::output::errors::RunnerError;
use crate::value::to_plain_string;

/// Upper bound for generated job ids
const MAX_JID: u64 = 999_999_999_999;

/// Runs one task across the hosts it targets
pub struct Runner {
    ctx: Arc<RunContext>,
    task: Arc<TaskSpec>,
    jid: String,
    filter: HostFilter,
}

impl Runner {
    pub fn new(ctx: Arc<RunContext>, task: Arc<TaskSpec>) -> Self {
        let jid = ctx.locks.random_up_to(MAX_JID).to_string();
        Runner {
            ctx,
            task,
            jid,
            filter: HostFilter::new(),
        }
    }

    /// Only run against these hosts, even if the pattern matches more
    pub fn restrict_to(mut self, hosts: Vec<String>) -> Self {
        self.filter = self.filter.with_limit(hosts);
        self
    }

    /// Never run against these hosts
    pub fn exclude(mut self, hosts: Vec<String>) -> Self {
        self.filter = self.filter.with_exclude(hosts);
        self
    }

    /// Job id shared by every host of this run
    pub fn jid(&self) -> &str {
        &self.jid
    }

    pub fn task(&self) -> &TaskSpec {
        &self.task
    }

    fn target_hosts(&self) -> Vec<String> {
        let hosts = match &self.task.run_hosts {
            Some(hosts) => hosts.clone(),
            None => self.ctx.inventory.list_hosts(&self.task.pattern),
        };
        self.filter.apply(hosts)
    }

    fn bypasses_host_loop(&self) -> bool {
        self.task.run_once
            || self
                .ctx
                .actions
                .get(&self.task.module_name)
                .map(|h| h.bypass_host_loop())
                .unwrap_or(false)
    }

    /// Run the task and partition the outcomes into contacted and dark hosts
    pub async fn run(&self) -> Result<RunResults, RunnerError> {
        let hosts = self.target_hosts();
        if hosts.is_empty() {
            info!(pattern = %self.task.pattern, "no hosts matched");
            self.ctx.callbacks.on_no_hosts().await;
            return Ok(RunResults::default());
        }

        let executor = HostExecutor::new(self.ctx.clone(), self.task.clone(), self.jid.clone());
        let forks = self.ctx.config.effective_forks().min(hosts.len());
        info!(
            module = %self.task.module_name,
            hosts = hosts.len(),
            forks,
            "running task"
        );

        let results = if self.bypasses_host_loop() {
            self.run_once(&executor, &hosts).await?
        } else if forks > 1 {
            self.run_parallel(&executor, &hosts, forks).await?
        } else {
            self.run_serial(&executor, &hosts).await?
        };

        self.record(&results);
        Ok(partition(results, &hosts))
    }

    /// Run in the background with `time_limit` seconds per job, returning
    /// the start results and a poller for the jobs
    pub async fn run_async(&self, time_limit: u64) -> Result<(RunResults, AsyncPoller), RunnerError> {
        let mut task = (*self.task).clone();
        task.background = time_limit;
        let task = Arc::new(task);

        let runner = Runner {
            ctx: self.ctx.clone(),
            task: task.clone(),
            jid: self.jid.clone(),
            filter: self.filter.clone(),
        };
        let results = runner.run().await?;
        let poller = AsyncPoller::new(self.ctx.clone(), task, &results)?;
        Ok((results, poller))
    }

    /// Host standing in for the group: the delegate when it is one of the
    /// targeted hosts, else the first host
    fn representative(&self, hosts: &[String]) -> String {
        let first = hosts[0].clone();
        let Some(delegate) = &self.task.delegate_to else {
            return first;
        };
        let inject = self.ctx.resolver.resolve(&first, &self.task.layers);
        match self.ctx.templar.render(delegate, &inject, false) {
            Ok(rendered) => {
                let delegate = to_plain_string(&rendered);
                if hosts.contains(&delegate) {
                    delegate
                } else {
                    first
                }
            }
            Err(_) => first,
        }
    }

    async fn run_once(&self, executor: &HostExecutor, hosts: &[String]) -> Result<Vec<ReturnData>, RunnerError> {
        let host = self.representative(hosts);
        debug!(host = %host, "running once for the group");
        let result = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => return Err(RunnerError::Interrupted),
            result = executor.execute(&host) => result,
        };

        // Every host gets the result so none is marked dark
        Ok(hosts
            .iter()
            .map(|h| ReturnData {
                host: h.clone(),
                comm_ok: true,
                result: result.result.clone(),
                diff: result.diff.clone(),
            })
            .collect())
    }

    async fn run_serial(&self, executor: &HostExecutor, hosts: &[String]) -> Result<Vec<ReturnData>, RunnerError> {
        let mut results = Vec::with_capacity(hosts.len());
        for host in hosts {
            let result = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(RunnerError::Interrupted),
                result = executor.execute(host) => result,
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn run_parallel(
        &self,
        executor: &HostExecutor,
        hosts: &[String],
        forks: usize,
    ) -> Result<Vec<ReturnData>, RunnerError> {
        let (job_tx, job_rx) = mpsc::channel::<String>(hosts.len());
        for host in hosts {
            job_tx
                .try_send(host.clone())
                .map_err(|e| RunnerError::Contract(format!("job queue rejected {}: {}", host, e)))?;
        }
        drop(job_tx);

        let jobs = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<ReturnData>(hosts.len());

        let mut workers = JoinSet::new();
        for worker in 0..forks {
            let jobs = jobs.clone();
            let results = result_tx.clone();
            let executor = executor.clone();
            workers.spawn(async move {
                debug!(worker, "worker started");
                loop {
                    // The queue is filled up front; None means it drained
                    let next = jobs.lock().await.recv().await;
                    let Some(host) = next else {
                        break;
                    };
                    let result = executor.execute(&host).await;
                    if results.send(result).await.is_err() {
                        break;
                    }
                }
                debug!(worker, "worker finished");
            });
        }
        drop(result_tx);

        let mut collected = Vec::with_capacity(hosts.len());
        loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    warn!("interrupted, stopping workers");
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    return Err(RunnerError::Interrupted);
                }
                received = result_rx.recv() => match received {
                    Some(result) => collected.push(result),
                    None => break,
                },
            }
        }

        while let Some(joined) = workers.join_next().await {
            // A lost host is forced dark by the partition
            if let Err(e) = joined {
                warn!(error = %e, "worker exited abnormally");
            }
        }
        Ok(collected)
    }

    /// Feed facts and registered results back into the run's caches
    fn record(&self, results: &[ReturnData]) {
        let ctx = &*self.ctx;
        let is_set_fact = self.task.module_name == "set_fact";

        for rd in results.iter().filter(|rd| rd.comm_ok) {
            let mut facts = Vec::new();
            if let Some(Value::Object(f)) = rd.result.get("ansible_facts") {
                facts.push(f);
            }
            if let Some(Value::Array(items)) = rd.result.get("results") {
                for item in items {
                    if let Some(Value::Object(f)) = item.get("ansible_facts") {
                        facts.push(f);
                    }
                }
            }

            let cache = if is_set_fact { &ctx.vars_cache } else { &ctx.facts_cache };
            for f in facts {
                let mut entry = cache.entry(rd.host.clone()).or_default();
                for (k, v) in f {
                    entry.insert(k.clone(), v.clone());
                }
            }

            if let Some(register) = &self.task.register {
                ctx.vars_cache
                    .entry(rd.host.clone())
                    .or_default()
                    .insert(register.clone(), Value::Object(rd.result.clone()));
            }
            ctx.resolver.hostvars().invalidate(&rd.host);
        }
    }
}
