//! Pipeline bookkeeping
//!
//! Sans-IO state for running many commands as per-node batches. The driver
//! sends each [`Batch`], hands back whatever came off the wire as a
//! [`BatchOutcome`], and drives the returned [`Followup`]s one by one.
//!
//! A batch that breaks partway keeps the replies it already received: those
//! commands are settled, and only commands without a reply are sent again.

use std::time::Duration;

use tracing::debug;

use super::router::{Dispatch, RouteState, Router, Step};
use crate::resp::RespValue;
use crate::utils::{ClientError, ProtocolError, Result};

/// Commands sharing one target, as indices into the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub target: Dispatch,
    pub indices: Vec<usize>,
}

/// What one batch exchange produced
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Replies in send order; may be shorter than the batch
    pub replies: Vec<RespValue>,
    /// Failure that cut the exchange short
    pub error: Option<ClientError>,
}

impl BatchOutcome {
    /// Nothing was sent or nothing was read
    pub fn failed(error: ClientError) -> Self {
        Self {
            replies: Vec::new(),
            error: Some(error),
        }
    }

    /// Whether the connection can go back to the idle list
    pub fn keeps_connection(&self) -> bool {
        !self.error.as_ref().is_some_and(|e| e.poisons_connection())
    }
}

/// Command that still needs a single-command round after its batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Followup {
    pub index: usize,
    pub delay: Duration,
}

/// Routing state and reply slots for one pipeline call
#[derive(Debug)]
pub struct Pipeline {
    states: Vec<RouteState>,
    replies: Vec<Option<RespValue>>,
}

impl Pipeline {
    pub fn new(states: Vec<RouteState>) -> Self {
        let replies = vec![None; states.len()];
        Self { states, replies }
    }

    /// Commands grouped by target, in first-seen order
    pub fn batches(&self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = Vec::new();
        for (index, state) in self.states.iter().enumerate() {
            match batches.iter_mut().find(|b| &b.target == state.dispatch()) {
                Some(batch) => batch.indices.push(index),
                None => batches.push(Batch {
                    target: state.dispatch().clone(),
                    indices: vec![index],
                }),
            }
        }
        batches
    }

    /// Read timeout for `batch`, bounded by the request deadline
    pub fn timeout_for(&self, batch: &Batch, request_timeout: Duration) -> Duration {
        batch
            .indices
            .first()
            .map_or(request_timeout, |&i| request_timeout.min(self.states[i].remaining()))
    }

    pub fn state_mut(&mut self, index: usize) -> &mut RouteState {
        &mut self.states[index]
    }

    /// Settle the commands of `batch` from what the exchange produced.
    ///
    /// Each received reply goes through the router. Commands without a reply
    /// are returned as followups when the failure is retryable; a command
    /// whose reply arrived is never sent again.
    pub fn on_batch(
        &mut self,
        router: &Router,
        batch: &Batch,
        outcome: BatchOutcome,
    ) -> Result<Vec<Followup>> {
        let received = outcome.replies.len().min(batch.indices.len());
        let mut followups = Vec::new();

        for (&index, reply) in batch.indices.iter().zip(outcome.replies) {
            match router.on_reply(&mut self.states[index], reply) {
                Step::Done(value) => self.replies[index] = Some(value),
                Step::Retry { delay } => followups.push(Followup { index, delay }),
                Step::Fatal(e) => return Err(e),
            }
        }

        let unanswered = &batch.indices[received..];
        if unanswered.is_empty() {
            return Ok(followups);
        }
        let error = outcome.error.unwrap_or_else(|| {
            ClientError::Protocol(ProtocolError::Parse(format!(
                "batch to {} ended after {} of {} replies",
                batch.target.node,
                received,
                batch.indices.len()
            )))
        });
        if !error.is_retryable() {
            return Err(error);
        }
        debug!(
            "Pipeline batch to {} failed after {} of {} replies: {}, resending the rest individually",
            batch.target.node,
            received,
            batch.indices.len(),
            error
        );
        followups.extend(unanswered.iter().map(|&index| Followup {
            index,
            delay: Duration::ZERO,
        }));
        Ok(followups)
    }

    /// Record the final reply for a followup
    pub fn complete(&mut self, index: usize, value: RespValue) {
        self.replies[index] = Some(value);
    }

    /// Replies in input order
    pub fn into_replies(self) -> Vec<RespValue> {
        self.replies
            .into_iter()
            .map(|reply| reply.unwrap_or(RespValue::Null))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::topology::{parse_cluster_nodes, HostTranslation};
    use crate::cluster::{NodeAddress, RetryPolicy, TopologyManager};
    use crate::cmd;
    use crate::config::ReadFrom;
    use crate::utils::{ClusterError, ConnectionError};
    use std::sync::Arc;

    const NODES: &str = "\
aaa 10.0.0.1:7000@17000 master - 0 0 1 connected 0-8191
bbb 10.0.0.2:7000@17000 master - 0 0 2 connected 8192-16383
";

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    fn router() -> Router {
        let seed = addr("10.0.0.1:7000");
        let manager = TopologyManager::new(vec![seed.clone()], HostTranslation::new());
        manager.install(parse_cluster_nodes(NODES, &seed, &HostTranslation::new()).unwrap());
        Router::new(Arc::new(manager), RetryPolicy::default(), ReadFrom::Primary)
    }

    fn pipeline(router: &Router, keys: &[&str]) -> Pipeline {
        let states = keys
            .iter()
            .map(|k| router.resolve(&cmd!("INCR", *k)).unwrap())
            .collect();
        Pipeline::new(states)
    }

    fn closed() -> Option<ClientError> {
        Some(ClientError::Connection(ConnectionError::Closed))
    }

    #[test]
    fn test_batches_group_by_target_in_order() {
        let router = router();
        // bar -> slot 5061, foo -> slot 12182
        let pipeline = pipeline(&router, &["foo", "bar", "{foo}1", "{bar}1"]);
        let batches = pipeline.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].target.node, addr("10.0.0.2:7000"));
        assert_eq!(batches[0].indices, vec![0, 2]);
        assert_eq!(batches[1].target.node, addr("10.0.0.1:7000"));
        assert_eq!(batches[1].indices, vec![1, 3]);
    }

    #[test]
    fn test_full_batch_settles_every_command() {
        let router = router();
        let mut pipeline = pipeline(&router, &["bar", "{bar}1"]);
        let batch = pipeline.batches().remove(0);
        let outcome = BatchOutcome {
            replies: vec![RespValue::Integer(1), RespValue::Integer(7)],
            error: None,
        };
        assert!(pipeline.on_batch(&router, &batch, outcome).unwrap().is_empty());
        assert_eq!(
            pipeline.into_replies(),
            vec![RespValue::Integer(1), RespValue::Integer(7)]
        );
    }

    #[test]
    fn test_broken_batch_keeps_received_replies() {
        let router = router();
        let mut pipeline = pipeline(&router, &["bar", "{bar}1", "{bar}2"]);
        let batch = pipeline.batches().remove(0);
        let outcome = BatchOutcome {
            replies: vec![RespValue::Integer(1)],
            error: closed(),
        };

        let followups = pipeline.on_batch(&router, &batch, outcome).unwrap();
        assert_eq!(
            followups,
            vec![
                Followup { index: 1, delay: Duration::ZERO },
                Followup { index: 2, delay: Duration::ZERO },
            ]
        );
        pipeline.complete(1, RespValue::Integer(2));
        pipeline.complete(2, RespValue::Integer(3));
        assert_eq!(
            pipeline.into_replies(),
            vec![RespValue::Integer(1), RespValue::Integer(2), RespValue::Integer(3)]
        );
    }

    #[test]
    fn test_redirected_reply_becomes_followup() {
        let router = router();
        let mut pipeline = pipeline(&router, &["foo", "{foo}1"]);
        let batch = pipeline.batches().remove(0);
        let outcome = BatchOutcome {
            replies: vec![
                RespValue::error("MOVED 12182 10.0.0.1:7000"),
                RespValue::Integer(4),
            ],
            error: None,
        };

        let followups = pipeline.on_batch(&router, &batch, outcome).unwrap();
        assert_eq!(followups, vec![Followup { index: 0, delay: Duration::ZERO }]);
        assert_eq!(pipeline.state_mut(0).dispatch().node, addr("10.0.0.1:7000"));
        assert_eq!(pipeline.state_mut(0).attempts(), 1);
    }

    #[test]
    fn test_timeout_mid_batch_is_surfaced() {
        let router = router();
        let mut pipeline = pipeline(&router, &["bar", "{bar}1"]);
        let batch = pipeline.batches().remove(0);
        let outcome = BatchOutcome {
            replies: vec![RespValue::Integer(1)],
            error: Some(ClientError::Connection(ConnectionError::Timeout(50))),
        };
        assert!(matches!(
            pipeline.on_batch(&router, &batch, outcome),
            Err(ClientError::Connection(ConnectionError::Timeout(50)))
        ));
    }

    #[test]
    fn test_clusterdown_reply_fails_pipeline() {
        let router = router();
        let mut pipeline = pipeline(&router, &["bar"]);
        let batch = pipeline.batches().remove(0);
        let outcome = BatchOutcome {
            replies: vec![RespValue::error("CLUSTERDOWN Hash slot not served")],
            error: None,
        };
        assert!(matches!(
            pipeline.on_batch(&router, &batch, outcome),
            Err(ClientError::Cluster(ClusterError::ClusterDown(_)))
        ));
    }

    #[test]
    fn test_outcome_connection_reuse() {
        assert!(BatchOutcome::default().keeps_connection());
        assert!(!BatchOutcome::failed(ClientError::Connection(ConnectionError::Closed))
            .keeps_connection());
    }
}
