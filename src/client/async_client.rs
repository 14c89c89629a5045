//! Async cluster client
//!
//! Same router and refresh state machine as [`super::ClusterClient`]; only
//! the pool and the backoff sleep differ.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::async_connection::{
    AsyncConnection, AsyncConnectionExt, AsyncConnectionPool, AsyncNodePool,
};
use super::cluster_client::keep_connection;
use crate::cluster::{
    Batch, BatchOutcome, Dispatch, NodeAddress, NodeRole, Pipeline, RouteState, Router, SlotMap,
    Step, TopologyManager,
};
use crate::cmd;
use crate::command::Command;
use crate::config::ClusterConfig;
use crate::resp::RespValue;
use crate::utils::Result;

pub struct AsyncClusterClient<P: AsyncConnectionPool> {
    router: Router,
    pool: P,
    request_timeout: Duration,
}

impl AsyncClusterClient<AsyncNodePool> {
    /// Validate `config`, open a tokio pool and fetch the topology up front
    pub async fn connect(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let pool = AsyncNodePool::from_config(&config);
        let client = Self::new(&config, pool);
        client.refresh_topology().await?;
        Ok(client)
    }
}

impl<P: AsyncConnectionPool> AsyncClusterClient<P> {
    pub fn new(config: &ClusterConfig, pool: P) -> Self {
        let topology = Arc::new(TopologyManager::from_config(config));
        Self {
            router: Router::from_config(topology, config),
            pool,
            request_timeout: config.request_timeout,
        }
    }

    pub fn slot_map(&self) -> Arc<SlotMap> {
        self.router.topology().snapshot()
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        self.router.topology()
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub async fn refresh_topology(&self) -> Result<Arc<SlotMap>> {
        let _guard = self.router.topology().try_begin_refresh();
        self.run_refresh(None).await
    }

    async fn run_refresh(&self, deadline: Option<Instant>) -> Result<Arc<SlotMap>> {
        let topology = self.router.topology();
        let mut attempt = topology.refresh_attempt().with_deadline(deadline);
        while let Some(node) = attempt.next_candidate() {
            let timeout = attempt.fetch_timeout(self.request_timeout);
            match self.fetch_cluster_nodes(&node, timeout).await {
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

    async fn fetch_cluster_nodes(
        &self,
        node: &NodeAddress,
        timeout: Duration,
    ) -> Result<RespValue> {
        let mut conn = self.pool.checkout(node, NodeRole::Primary).await?;
        let result = conn.cluster_nodes(Some(timeout)).await;
        self.pool.checkin(conn, keep_connection(&result));
        result
    }

    async fn resolve(&self, command: &Command, deadline: Instant) -> Result<RouteState> {
        Router::slot_for(command)?;
        if let Some(due) = self.router.topology().due_refresh() {
            due.finish(self.run_refresh(Some(deadline)).await)?;
        }
        match self.router.resolve_at(command, deadline) {
            Err(e) if Router::is_routing_miss(&e) => {
                debug!("Resolve failed for {}: {}, refreshing topology", command.name(), e);
                let _guard = self.router.topology().try_begin_refresh();
                self.run_refresh(Some(deadline)).await?;
                self.router.resolve_at(command, deadline)
            }
            other => other,
        }
    }

    pub async fn execute(&self, command: &Command) -> Result<RespValue> {
        let mut state = self.resolve(command, self.router.start_deadline()).await?;
        self.drive(command, &mut state).await
    }

    async fn drive(&self, command: &Command, state: &mut RouteState) -> Result<RespValue> {
        loop {
            let step = match self.dispatch(command, state.dispatch(), state.remaining()).await {
                Ok(reply) => self.router.on_reply(state, reply),
                Err(e) => self.router.on_error(state, e),
            };
            match step {
                Step::Done(value) => return Ok(value),
                Step::Retry { delay } => pause(delay).await,
                Step::Fatal(e) => return Err(e),
            }
        }
    }

    async fn dispatch(
        &self,
        command: &Command,
        target: &Dispatch,
        remaining: Duration,
    ) -> Result<RespValue> {
        let timeout = self.request_timeout.min(remaining);
        let mut conn = self.pool.checkout(&target.node, target.role).await?;
        let result = exchange(&mut conn, command, target.asking, timeout).await;
        self.pool.checkin(conn, keep_connection(&result));
        result
    }

    /// Per-node pipelines with replies in input order
    pub async fn execute_pipeline(&self, commands: &[Command]) -> Result<Vec<RespValue>> {
        for command in commands {
            Router::slot_for(command)?;
        }
        let deadline = self.router.start_deadline();
        let mut states = Vec::with_capacity(commands.len());
        for command in commands {
            states.push(self.resolve(command, deadline).await?);
        }

        let mut pipeline = Pipeline::new(states);
        for batch in pipeline.batches() {
            let timeout = pipeline.timeout_for(&batch, self.request_timeout);
            let outcome = self.send_batch(commands, &batch, timeout).await;
            for followup in pipeline.on_batch(&self.router, &batch, outcome)? {
                pause(followup.delay).await;
                let index = followup.index;
                let value = self.drive(&commands[index], pipeline.state_mut(index)).await?;
                pipeline.complete(index, value);
            }
        }
        Ok(pipeline.into_replies())
    }

    async fn send_batch(
        &self,
        commands: &[Command],
        batch: &Batch,
        timeout: Duration,
    ) -> BatchOutcome {
        let mut conn = match self.pool.checkout(&batch.target.node, batch.target.role).await {
            Ok(conn) => conn,
            Err(e) => return BatchOutcome::failed(e),
        };
        let requests: Vec<&Command> = batch.indices.iter().map(|&i| &commands[i]).collect();
        let outcome = exchange_batch(&mut conn, &requests, timeout).await;
        self.pool.checkin(conn, outcome.keeps_connection());
        outcome
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

async fn exchange<C: AsyncConnection>(
    conn: &mut C,
    command: &Command,
    asking: bool,
    timeout: Duration,
) -> Result<RespValue> {
    if !asking {
        return conn.call(command, Some(timeout)).await;
    }
    let asking_cmd = cmd!("ASKING");
    conn.write_commands(&[&asking_cmd, command]).await?;
    if let RespValue::Error(e) = conn.read_reply(Some(timeout)).await? {
        warn!("ASKING rejected by {}: {}", conn.address(), e);
    }
    conn.read_reply(Some(timeout)).await
}

async fn exchange_batch<C: AsyncConnection>(
    conn: &mut C,
    batch: &[&Command],
    timeout: Duration,
) -> BatchOutcome {
    if let Err(e) = conn.write_commands(batch).await {
        return BatchOutcome::failed(e);
    }
    let mut outcome = BatchOutcome::default();
    while outcome.replies.len() < batch.len() {
        match conn.read_reply(Some(timeout)).await {
            Ok(reply) => outcome.replies.push(reply),
            Err(e) => {
                outcome.error = Some(e);
                break;
            }
        }
    }
    outcome
}
