//! Blocking cluster client
//!
//! Drives the router over a [`ConnectionPool`]: resolve the target, send,
//! feed the reply back to the router and follow its verdict.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::connection::{Connection, ConnectionExt, ConnectionPool};
use super::raw_connection::NodePool;
use crate::cluster::{
    Batch, BatchOutcome, Dispatch, NodeAddress, NodeRole, Pipeline, RouteState, Router, SlotMap,
    Step, TopologyManager,
};
use crate::cmd;
use crate::command::Command;
use crate::config::ClusterConfig;
use crate::resp::RespValue;
use crate::utils::Result;

/// Whether a connection can go back to the idle list after `result`
pub(crate) fn keep_connection<T>(result: &Result<T>) -> bool {
    !result.as_ref().is_err_and(|e| e.poisons_connection())
}

pub struct ClusterClient<P: ConnectionPool> {
    router: Router,
    pool: P,
    request_timeout: Duration,
}

impl ClusterClient<NodePool> {
    /// Validate `config`, open a TCP pool and fetch the topology up front
    pub fn connect(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let pool = NodePool::from_config(&config);
        let client = Self::new(&config, pool);
        client.refresh_topology()?;
        Ok(client)
    }
}

impl<P: ConnectionPool> ClusterClient<P> {
    /// Client over `pool`; the topology is fetched on first use
    pub fn new(config: &ClusterConfig, pool: P) -> Self {
        let topology = Arc::new(TopologyManager::from_config(config));
        Self {
            router: Router::from_config(topology, config),
            pool,
            request_timeout: config.request_timeout,
        }
    }

    /// Current slot map snapshot
    pub fn slot_map(&self) -> Arc<SlotMap> {
        self.router.topology().snapshot()
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        self.router.topology()
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Fetch CLUSTER NODES and install the result.
    ///
    /// Runs even when another caller is refreshing; the later install wins.
    pub fn refresh_topology(&self) -> Result<Arc<SlotMap>> {
        let _guard = self.router.topology().try_begin_refresh();
        self.run_refresh(None)
    }

    fn run_refresh(&self, deadline: Option<Instant>) -> Result<Arc<SlotMap>> {
        let topology = self.router.topology();
        let mut attempt = topology.refresh_attempt().with_deadline(deadline);
        while let Some(node) = attempt.next_candidate() {
            let timeout = attempt.fetch_timeout(self.request_timeout);
            match self.fetch_cluster_nodes(&node, timeout) {
                Ok(reply) => {
                    if let Some(map) = attempt.on_reply(&node, &reply, topology.translation()) {
                        return Ok(topology.install(map));
                    }
                }
                Err(e) => attempt.on_error(&node, &e),
            }
        }
        Err(attempt.into_error().into())
    }

    fn fetch_cluster_nodes(&self, node: &NodeAddress, timeout: Duration) -> Result<RespValue> {
        let mut conn = self.pool.checkout(node, NodeRole::Primary)?;
        let result = conn.cluster_nodes(Some(timeout));
        self.pool.checkin(conn, keep_connection(&result));
        result
    }

    /// Route `command`, refreshing first when the map is due and once more
    /// when the map cannot place it. Refresh time counts against `deadline`.
    fn resolve(&self, command: &Command, deadline: Instant) -> Result<RouteState> {
        // No I/O for commands that can never be routed
        Router::slot_for(command)?;
        if let Some(due) = self.router.topology().due_refresh() {
            due.finish(self.run_refresh(Some(deadline)))?;
        }
        match self.router.resolve_at(command, deadline) {
            Err(e) if Router::is_routing_miss(&e) => {
                debug!("Resolve failed for {}: {}, refreshing topology", command.name(), e);
                let _guard = self.router.topology().try_begin_refresh();
                self.run_refresh(Some(deadline))?;
                self.router.resolve_at(command, deadline)
            }
            other => other,
        }
    }

    /// Run one command, following redirects and retrying within the budget.
    ///
    /// Error replies that are not redirects come back as `Ok(RespValue::Error)`.
    pub fn execute(&self, command: &Command) -> Result<RespValue> {
        let mut state = self.resolve(command, self.router.start_deadline())?;
        self.drive(command, &mut state)
    }

    fn drive(&self, command: &Command, state: &mut RouteState) -> Result<RespValue> {
        loop {
            let step = match self.dispatch(command, state.dispatch(), state.remaining()) {
                Ok(reply) => self.router.on_reply(state, reply),
                Err(e) => self.router.on_error(state, e),
            };
            match step {
                Step::Done(value) => return Ok(value),
                Step::Retry { delay } => pause(delay),
                Step::Fatal(e) => return Err(e),
            }
        }
    }

    fn dispatch(
        &self,
        command: &Command,
        target: &Dispatch,
        remaining: Duration,
    ) -> Result<RespValue> {
        let timeout = self.request_timeout.min(remaining);
        let mut conn = self.pool.checkout(&target.node, target.role)?;
        let result = exchange(&mut conn, command, target.asking, timeout);
        self.pool.checkin(conn, keep_connection(&result));
        result
    }

    /// Run `commands` as per-node pipelines; replies come back in input order.
    ///
    /// Every command is resolved before anything is sent, so a cross-slot
    /// command fails the whole call without I/O. Commands redirected out of
    /// a batch, or left without a reply when a batch breaks, are then driven
    /// one by one.
    pub fn execute_pipeline(&self, commands: &[Command]) -> Result<Vec<RespValue>> {
        for command in commands {
            Router::slot_for(command)?;
        }
        let deadline = self.router.start_deadline();
        let states = commands
            .iter()
            .map(|command| self.resolve(command, deadline))
            .collect::<Result<Vec<_>>>()?;

        let mut pipeline = Pipeline::new(states);
        for batch in pipeline.batches() {
            let timeout = pipeline.timeout_for(&batch, self.request_timeout);
            let outcome = self.send_batch(commands, &batch, timeout);
            for followup in pipeline.on_batch(&self.router, &batch, outcome)? {
                pause(followup.delay);
                let index = followup.index;
                let value = self.drive(&commands[index], pipeline.state_mut(index))?;
                pipeline.complete(index, value);
            }
        }
        Ok(pipeline.into_replies())
    }

    fn send_batch(&self, commands: &[Command], batch: &Batch, timeout: Duration) -> BatchOutcome {
        let mut conn = match self.pool.checkout(&batch.target.node, batch.target.role) {
            Ok(conn) => conn,
            Err(e) => return BatchOutcome::failed(e),
        };
        let requests: Vec<&Command> = batch.indices.iter().map(|&i| &commands[i]).collect();
        let outcome = exchange_batch(&mut conn, &requests, timeout);
        self.pool.checkin(conn, outcome.keeps_connection());
        outcome
    }
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

/// Send `command`, preceded by ASKING in the same write when asked to
fn exchange<C: Connection>(
    conn: &mut C,
    command: &Command,
    asking: bool,
    timeout: Duration,
) -> Result<RespValue> {
    if !asking {
        return conn.call(command, Some(timeout));
    }
    let asking_cmd = cmd!("ASKING");
    conn.write_commands(&[&asking_cmd, command])?;
    if let RespValue::Error(e) = conn.read_reply(Some(timeout))? {
        warn!("ASKING rejected by {}: {}", conn.address(), e);
    }
    conn.read_reply(Some(timeout))
}

/// Write the batch, then read replies until all arrive or one read fails
fn exchange_batch<C: Connection>(
    conn: &mut C,
    batch: &[&Command],
    timeout: Duration,
) -> BatchOutcome {
    if let Err(e) = conn.write_commands(batch) {
        return BatchOutcome::failed(e);
    }
    let mut outcome = BatchOutcome::default();
    while outcome.replies.len() < batch.len() {
        match conn.read_reply(Some(timeout)) {
            Ok(reply) => outcome.replies.push(reply),
            Err(e) => {
                outcome.error = Some(e);
                break;
            }
        }
    }
    outcome
}
