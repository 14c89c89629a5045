//! Cluster router
//!
//! Sans-IO state machine that picks the node for a command and classifies
//! what came back. Drivers own the I/O loop:
//!
//! ```text
//! resolve ──► dispatch ──► await reply ──► on_reply / on_error
//!                ▲                              │
//!                └──── Step::Retry { delay } ◄──┤
//!                                               ├──► Step::Done(value)
//!                                               └──► Step::Fatal(error)
//! ```
//!
//! Every reply or transport error consumes one attempt, so a cluster that
//! keeps redirecting is cut off after `max_attempts` dispatches.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::node::{ClusterNode, NodeAddress, NodeRole};
use super::redirect::Redirection;
use super::slot_map::{key_slot, SlotMap};
use super::topology_manager::TopologyManager;
use crate::command::Command;
use crate::config::{ClusterConfig, ReadFrom};
use crate::resp::RespValue;
use crate::utils::{ClientError, ClusterError, Result};

/// Attempt, redirect and time budgets for one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_redirects: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub overall_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClusterConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_redirects: config.max_redirects,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            overall_timeout: config.overall_timeout,
        }
    }

    /// Exponential backoff with jitter: a random point in the upper half of
    /// `base * 2^(attempt-1)`, capped at `backoff_max`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ceiling = self
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max);
        let half = ceiling / 2;
        let jitter_us = fastrand::u64(0..=half.as_micros() as u64);
        half + Duration::from_micros(jitter_us)
    }
}

/// Where the next attempt goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub node: NodeAddress,
    pub role: NodeRole,
    /// Send ASKING in the same write, ahead of the command
    pub asking: bool,
}

/// Router verdict after a reply or error
#[derive(Debug)]
pub enum Step {
    Done(RespValue),
    Retry { delay: Duration },
    Fatal(ClientError),
}

/// Per-command routing state
#[derive(Debug, Clone)]
pub struct RouteState {
    slot: Option<u16>,
    dispatch: Dispatch,
    attempts: u32,
    redirects: u32,
    deadline: Instant,
}

impl RouteState {
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn redirects(&self) -> u32 {
        self.redirects
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the overall deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Routes commands over the shared topology
pub struct Router {
    topology: Arc<TopologyManager>,
    policy: RetryPolicy,
    read_from: ReadFrom,
}

impl Router {
    pub fn new(topology: Arc<TopologyManager>, policy: RetryPolicy, read_from: ReadFrom) -> Self {
        Self {
            topology,
            policy,
            read_from,
        }
    }

    pub fn from_config(topology: Arc<TopologyManager>, config: &ClusterConfig) -> Self {
        Self::new(topology, RetryPolicy::from_config(config), config.read_from)
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn read_from(&self) -> ReadFrom {
        self.read_from
    }

    /// Slot shared by every key of `command`; `None` for keyless commands
    pub fn slot_for(command: &Command) -> std::result::Result<Option<u16>, ClusterError> {
        let mut slots = command.keys().map(key_slot);
        let Some(first) = slots.next() else {
            return Ok(None);
        };

        let mut distinct = BTreeSet::new();
        for slot in slots {
            if slot != first {
                distinct.insert(slot);
            }
        }
        if distinct.is_empty() {
            return Ok(Some(first));
        }
        distinct.insert(first);
        Err(ClusterError::CrossSlot {
            slots: distinct.into_iter().collect(),
        })
    }

    /// Overall deadline for a request starting now
    pub fn start_deadline(&self) -> Instant {
        Instant::now() + self.policy.overall_timeout
    }

    /// Compute the slot and first target against the current snapshot
    pub fn resolve(&self, command: &Command) -> Result<RouteState> {
        self.resolve_at(command, self.start_deadline())
    }

    /// Like [`Router::resolve`], under a deadline taken before any refresh
    pub fn resolve_at(&self, command: &Command, deadline: Instant) -> Result<RouteState> {
        let slot = Self::slot_for(command)?;
        if Instant::now() >= deadline {
            return Err(ClientError::DeadlineExceeded {
                last: Box::new(
                    ClusterError::TopologyUnavailable(
                        "deadline passed before the command was routed".to_string(),
                    )
                    .into(),
                ),
            });
        }
        let map = self.topology.snapshot();
        let (node, role) = self.pick(&map, slot, command.is_read_only())?;
        Ok(RouteState {
            slot,
            dispatch: Dispatch {
                node,
                role,
                asking: false,
            },
            attempts: 0,
            redirects: 0,
            deadline,
        })
    }

    /// Resolve failures that a topology refresh may cure
    pub fn is_routing_miss(err: &ClientError) -> bool {
        matches!(
            err,
            ClientError::Cluster(
                ClusterError::SlotNotOwned(_) | ClusterError::TopologyUnavailable(_)
            )
        )
    }

    fn pick(
        &self,
        map: &SlotMap,
        slot: Option<u16>,
        read_only: bool,
    ) -> Result<(NodeAddress, NodeRole)> {
        if map.is_empty() {
            return Err(ClusterError::TopologyUnavailable("slot map is empty".to_string()).into());
        }

        let Some(slot) = slot else {
            let primaries: Vec<&ClusterNode> = map.primaries().collect();
            let available: Vec<&ClusterNode> =
                primaries.iter().copied().filter(|n| n.is_available()).collect();
            let pool = if available.is_empty() { primaries } else { available };
            if pool.is_empty() {
                return Err(ClusterError::NoPrimaries.into());
            }
            let node = pool[fastrand::usize(..pool.len())];
            return Ok((node.address.clone(), NodeRole::Primary));
        };

        let primary = map.node_for_slot(slot)?;
        if !read_only || self.read_from == ReadFrom::Primary {
            return Ok((primary.address.clone(), NodeRole::Primary));
        }

        let replicas: Vec<&ClusterNode> = map
            .replicas_for_slot(slot)
            .into_iter()
            .filter(|n| n.is_available())
            .collect();
        if !replicas.is_empty() {
            let replica = replicas[fastrand::usize(..replicas.len())];
            return Ok((replica.address.clone(), NodeRole::Replica));
        }

        match self.read_from {
            ReadFrom::Replica => Err(ClusterError::NoReplicaAvailable(slot).into()),
            _ => Ok((primary.address.clone(), NodeRole::Primary)),
        }
    }

    /// Classify a reply from `state.dispatch().node`
    pub fn on_reply(&self, state: &mut RouteState, reply: RespValue) -> Step {
        state.attempts += 1;

        let error = match &reply {
            RespValue::Error(e) => e,
            _ => return Step::Done(reply),
        };
        let Some(redirect) = Redirection::parse(error, &state.dispatch.node) else {
            return Step::Done(reply);
        };
        let last = ClientError::Server(error.clone());

        match redirect {
            Redirection::Moved { slot, node } => {
                let node = self.topology.translate(&node);
                debug!(
                    "MOVED slot {} from {} to {} (attempt {})",
                    slot, state.dispatch.node, node, state.attempts
                );
                if self.topology.apply_moved(slot, &node) {
                    debug!("MOVED threshold reached, topology marked for refresh");
                }
                if self.redirect_limit_exceeded(state) {
                    return Step::Fatal(ClientError::TooManyRedirects {
                        redirects: state.redirects,
                        last: Box::new(last),
                    });
                }
                state.dispatch = Dispatch {
                    node,
                    role: NodeRole::Primary,
                    asking: false,
                };
                self.retry(state, last, Duration::ZERO)
            }
            Redirection::Ask { slot, node } => {
                let node = self.topology.translate(&node);
                debug!(
                    "ASK slot {} from {} to {} (attempt {})",
                    slot, state.dispatch.node, node, state.attempts
                );
                if self.redirect_limit_exceeded(state) {
                    return Step::Fatal(ClientError::TooManyRedirects {
                        redirects: state.redirects,
                        last: Box::new(last),
                    });
                }
                state.dispatch = Dispatch {
                    node,
                    role: NodeRole::Primary,
                    asking: true,
                };
                self.retry(state, last, Duration::ZERO)
            }
            Redirection::TryAgain => {
                let delay = self.policy.backoff(state.attempts);
                debug!(
                    "TRYAGAIN from {}, retrying in {:?} (attempt {})",
                    state.dispatch.node, delay, state.attempts
                );
                self.retry(state, last, delay)
            }
            Redirection::ClusterDown(message) => {
                debug!("CLUSTERDOWN from {}: {}", state.dispatch.node, message);
                self.topology.mark_stale();
                Step::Fatal(ClusterError::ClusterDown(message).into())
            }
        }
    }

    /// Classify a transport or protocol failure
    pub fn on_error(&self, state: &mut RouteState, err: ClientError) -> Step {
        state.attempts += 1;
        if !err.is_retryable() {
            return Step::Fatal(err);
        }
        let delay = self.policy.backoff(state.attempts);
        debug!(
            "Request to {} failed: {}, retrying in {:?} (attempt {})",
            state.dispatch.node, err, delay, state.attempts
        );
        self.retry(state, err, delay)
    }

    fn redirect_limit_exceeded(&self, state: &mut RouteState) -> bool {
        state.redirects += 1;
        state.redirects > self.policy.max_redirects
    }

    fn retry(&self, state: &RouteState, last: ClientError, delay: Duration) -> Step {
        if state.attempts >= self.policy.max_attempts {
            return Step::Fatal(ClientError::RetriesExhausted {
                attempts: state.attempts,
                last: Box::new(last),
            });
        }
        if Instant::now() + delay >= state.deadline {
            return Step::Fatal(ClientError::DeadlineExceeded {
                last: Box::new(last),
            });
        }
        Step::Retry { delay }
    }
}
