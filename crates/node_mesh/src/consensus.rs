//! Admission voting for join requests.
//!
//! An empty mesh admits its first candidate immediately. Otherwise a
//! `VoteTracker` sized to the current membership collects one vote per member;
//! the request is approved only if every vote approves. A watcher task rejects
//! the request when the vote timeout elapses first. Both completion paths
//! remove the tracker under the lock, and only the path that removed it
//! reports the decision.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use node_proto::mesh::{JoinRequest, NodeDescriptor, Vote};
use node_proto::now_ms;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::ConsensusConfig;
use crate::error::{MeshError, Result};
use crate::topology::Topology;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Approved,
    Rejected { voter_id: String, reason: String },
    TimedOut { received: usize, total: usize },
}

impl JoinOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Approved => "approved".into(),
            Self::Rejected { reason, .. } => reason.clone(),
            Self::TimedOut { received, total } => {
                format!("timeout: {received}/{total} votes received")
            }
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Approved => Ok(()),
            Self::Rejected { voter_id, reason } => Err(MeshError::JoinRejected { voter_id, reason }),
            Self::TimedOut { received, total } => Err(MeshError::JoinTimedOut { received, total }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinDecision {
    pub request: JoinRequest,
    pub outcome: JoinOutcome,
    pub votes_received: usize,
    pub votes_expected: usize,
}

impl JoinDecision {
    pub fn candidate_id(&self) -> &str {
        self.request
            .candidate
            .as_ref()
            .map(|c| c.id.as_str())
            .unwrap_or_default()
    }
}

pub type DecisionCallback = Box<dyn Fn(&JoinDecision) + Send + Sync>;

/// Decision callback that adds every approved candidate to `topology`.
pub fn admit_into(topology: Arc<Topology>) -> DecisionCallback {
    Box::new(move |decision| {
        if !decision.outcome.is_approved() {
            return;
        }
        let Some(candidate) = decision.request.candidate.clone() else {
            return;
        };
        match topology.add_node(candidate) {
            Ok(version) => info!("admitted {} (topology v{version})", decision.candidate_id()),
            Err(e) => warn!("approved {} but could not add it: {e}", decision.candidate_id()),
        }
    })
}

/// Handle returned to whoever initiated a join request.
pub struct JoinTicket {
    pub request_id: String,
    decision: oneshot::Receiver<JoinDecision>,
}

impl JoinTicket {
    /// Wait for the request to be resolved.
    pub async fn decision(self) -> Result<JoinDecision> {
        self.decision
            .await
            .map_err(|_| MeshError::RequestNotFound(self.request_id))
    }

    /// The decision, if it has already been made.
    pub fn try_decision(&mut self) -> Option<JoinDecision> {
        self.decision.try_recv().ok()
    }
}

/// A per-member admission policy hook, run after the built-in checks.
pub trait AdmissionRule: Send + Sync {
    fn evaluate(&self, candidate: &NodeDescriptor, topology: &Topology)
        -> std::result::Result<(), String>;
}

/// Vote against a fixed set of node ids.
pub struct DenyList {
    ids: HashSet<String>,
}

impl DenyList {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl AdmissionRule for DenyList {
    fn evaluate(&self, candidate: &NodeDescriptor, _topology: &Topology) -> std::result::Result<(), String> {
        if self.ids.contains(&candidate.id) {
            return Err(format!("{} is on the deny list", candidate.id));
        }
        Ok(())
    }
}

struct VoteTracker {
    request: JoinRequest,
    /// Arrival order is kept so the first veto is the one reported.
    votes: Vec<Vote>,
    expected: usize,
    created_at: Instant,
    waiter: Option<oneshot::Sender<JoinDecision>>,
}

impl VoteTracker {
    fn has_voted(&self, voter_id: &str) -> bool {
        self.votes.iter().any(|v| v.voter_id == voter_id)
    }

    fn tally(&self) -> JoinOutcome {
        match self.votes.iter().find(|v| !v.approve) {
            Some(veto) => JoinOutcome::Rejected {
                voter_id: veto.voter_id.clone(),
                reason: veto.reason.clone(),
            },
            None => JoinOutcome::Approved,
        }
    }
}

pub struct ConsensusManager {
    local_id: String,
    topology: Arc<Topology>,
    config: ConsensusConfig,
    rules: Vec<Box<dyn AdmissionRule>>,
    trackers: Mutex<HashMap<String, VoteTracker>>,
    on_decision: RwLock<Option<DecisionCallback>>,
}

impl ConsensusManager {
    pub fn new(local_id: impl Into<String>, topology: Arc<Topology>, config: ConsensusConfig) -> Self {
        let mut rules: Vec<Box<dyn AdmissionRule>> = Vec::new();
        if !config.deny_list.is_empty() {
            rules.push(Box::new(DenyList::new(config.deny_list.clone())));
        }
        Self {
            local_id: local_id.into(),
            topology,
            config,
            rules,
            trackers: Mutex::new(HashMap::new()),
            on_decision: RwLock::new(None),
        }
    }

    pub fn with_rule(mut self, rule: impl AdmissionRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Register the callback that runs for every decision, before the
    /// initiator's ticket resolves.
    pub fn set_decision_callback(&self, callback: DecisionCallback) {
        *self
            .on_decision
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    fn trackers(&self) -> MutexGuard<'_, HashMap<String, VoteTracker>> {
        self.trackers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start admission for `candidate` under a fresh request id.
    pub fn initiate_join_request(self: &Arc<Self>, candidate: NodeDescriptor) -> Result<JoinTicket> {
        self.initiate(JoinRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            candidate: Some(candidate),
            timestamp_ms: now_ms(),
        })
    }

    /// Start admission for a request built elsewhere (e.g. by the candidate).
    pub fn initiate(self: &Arc<Self>, request: JoinRequest) -> Result<JoinTicket> {
        if request.request_id.is_empty() {
            return Err(MeshError::InvalidDescriptor("join request has no id".into()));
        }
        if request.candidate.is_none() {
            return Err(MeshError::InvalidDescriptor("join request has no candidate".into()));
        }
        let (tx, rx) = oneshot::channel();
        let ticket = JoinTicket {
            request_id: request.request_id.clone(),
            decision: rx,
        };

        let members = self.topology.node_count();
        if members == 0 {
            info!(
                "bootstrap: admitting {} into an empty mesh",
                request.candidate.as_ref().map(|c| c.id.as_str()).unwrap_or_default()
            );
            let tracker = VoteTracker {
                request,
                votes: vec![],
                expected: 0,
                created_at: Instant::now(),
                waiter: Some(tx),
            };
            self.finish(tracker, JoinOutcome::Approved);
            return Ok(ticket);
        }

        let request_id = request.request_id.clone();
        {
            let mut trackers = self.trackers();
            if trackers.contains_key(&request_id) {
                return Err(MeshError::AlreadyExists(format!("join request {request_id}")));
            }
            trackers.insert(
                request_id.clone(),
                VoteTracker {
                    request,
                    votes: Vec::with_capacity(members),
                    expected: members,
                    created_at: Instant::now(),
                    waiter: Some(tx),
                },
            );
        }
        debug!("join request {request_id}: waiting for {members} vote(s)");

        let weak = Arc::downgrade(self);
        let timeout = self.config.vote_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = weak.upgrade() {
                manager.expire(&request_id);
            }
        });

        Ok(ticket)
    }

    /// Record a vote; finalizes the request once every expected vote is in.
    pub fn submit_vote(&self, vote: Vote) -> Result<()> {
        let finished = {
            let mut trackers = self.trackers();
            let tracker = trackers
                .get_mut(&vote.request_id)
                .ok_or_else(|| MeshError::RequestNotFound(vote.request_id.clone()))?;
            if tracker.has_voted(&vote.voter_id) {
                return Err(MeshError::DuplicateVote {
                    voter_id: vote.voter_id,
                    request_id: vote.request_id,
                });
            }
            debug!(
                "join request {}: {} votes {}",
                vote.request_id,
                vote.voter_id,
                if vote.approve { "approve" } else { "reject" }
            );
            let veto = !vote.approve;
            tracker.votes.push(vote.clone());
            let complete = tracker.votes.len() >= tracker.expected
                || (veto && self.config.short_circuit_veto);
            if complete {
                trackers.remove(&vote.request_id)
            } else {
                None
            }
        };

        if let Some(tracker) = finished {
            let outcome = tracker.tally();
            self.finish(tracker, outcome);
        }
        Ok(())
    }

    fn expire(&self, request_id: &str) {
        let Some(tracker) = self.trackers().remove(request_id) else {
            return;
        };
        let outcome = JoinOutcome::TimedOut {
            received: tracker.votes.len(),
            total: tracker.expected,
        };
        warn!(
            "join request {request_id} timed out after {:?}",
            tracker.created_at.elapsed()
        );
        self.finish(tracker, outcome);
    }

    fn finish(&self, mut tracker: VoteTracker, outcome: JoinOutcome) {
        let decision = JoinDecision {
            votes_received: tracker.votes.len(),
            votes_expected: tracker.expected,
            request: tracker.request.clone(),
            outcome,
        };
        info!(
            "join request {} for {}: {}",
            decision.request.request_id,
            decision.candidate_id(),
            decision.outcome.reason()
        );

        if let Some(callback) = self
            .on_decision
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            callback(&decision);
        }
        if let Some(waiter) = tracker.waiter.take() {
            let _ = waiter.send(decision);
        }
    }

    /// The local admission policy: complete descriptor, unknown id, room left,
    /// then every registered rule.
    pub fn evaluate_join_request(&self, candidate: &NodeDescriptor) -> Result<()> {
        if !candidate.is_complete() {
            return Err(MeshError::InvalidDescriptor(
                "candidate needs an id, name and address".into(),
            ));
        }
        if self.topology.contains(&candidate.id) {
            return Err(MeshError::AlreadyExists(format!("node {}", candidate.id)));
        }
        if self.topology.node_count() >= self.config.max_nodes {
            return Err(MeshError::MeshAtCapacity(self.config.max_nodes));
        }
        for rule in &self.rules {
            rule.evaluate(candidate, &self.topology)
                .map_err(MeshError::AdmissionDenied)?;
        }
        Ok(())
    }

    /// This node's vote on `request`, without submitting it.
    pub fn vote_on(&self, request: &JoinRequest) -> Vote {
        let verdict = match &request.candidate {
            Some(candidate) => self.evaluate_join_request(candidate),
            None => Err(MeshError::InvalidDescriptor("join request has no candidate".into())),
        };
        let (approve, reason) = match verdict {
            Ok(()) => (true, String::new()),
            Err(e) => (false, e.to_string()),
        };
        Vote {
            voter_id: self.local_id.clone(),
            request_id: request.request_id.clone(),
            approve,
            reason,
            timestamp_ms: now_ms(),
        }
    }

    /// Evaluate `request` and submit the verdict as this node's vote.
    pub fn cast_local_vote(&self, request: &JoinRequest) -> Result<Vote> {
        let vote = self.vote_on(request);
        self.submit_vote(vote.clone())?;
        Ok(vote)
    }

    pub fn pending_requests(&self) -> Vec<String> {
        self.trackers().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn node(id: &str) -> NodeDescriptor {
        NodeDescriptor::new(id, id, "worker", format!("{id}.local:9000"))
    }

    fn manager(members: &[&str], config: ConsensusConfig) -> Arc<ConsensusManager> {
        let topology = Arc::new(Topology::new());
        for id in members {
            topology.add_node(node(id)).unwrap();
        }
        let local = members.first().copied().unwrap_or("local");
        Arc::new(ConsensusManager::new(local, topology, config))
    }

    fn vote(voter: &str, request_id: &str, approve: bool, reason: &str) -> Vote {
        Vote {
            voter_id: voter.into(),
            request_id: request_id.into(),
            approve,
            reason: reason.into(),
            timestamp_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn empty_mesh_auto_approves_synchronously() {
        let consensus = manager(&[], ConsensusConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        consensus.set_decision_callback(Box::new(move |decision| {
            assert!(decision.outcome.is_approved());
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let mut ticket = consensus.initiate_join_request(node("a")).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let decision = ticket.try_decision().expect("decided without waiting");
        assert_eq!(decision.outcome, JoinOutcome::Approved);
        assert_eq!(decision.votes_expected, 0);
        assert!(consensus.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn admit_into_adds_only_approved_candidates() {
        let consensus = manager(&["a"], ConsensusConfig::default());
        consensus.set_decision_callback(admit_into(consensus.topology.clone()));

        let ticket = consensus.initiate_join_request(node("b")).unwrap();
        consensus
            .submit_vote(vote("a", &ticket.request_id, true, ""))
            .unwrap();
        ticket.decision().await.unwrap();
        assert!(consensus.topology.contains("b"));
        assert_eq!(consensus.topology.version(), 2);

        // a and b are both members now, so both must vote
        let mut ticket = consensus.initiate_join_request(node("c")).unwrap();
        consensus
            .submit_vote(vote("a", &ticket.request_id, false, "no"))
            .unwrap();
        consensus
            .submit_vote(vote("b", &ticket.request_id, true, ""))
            .unwrap();
        let decision = ticket.try_decision().expect("decided by the last vote");
        assert_eq!(
            decision.outcome,
            JoinOutcome::Rejected {
                voter_id: "a".into(),
                reason: "no".into()
            }
        );
        assert!(!consensus.topology.contains("c"));
        assert_eq!(consensus.topology.version(), 2);
    }

    #[tokio::test]
    async fn unanimous_approval_admits() {
        let consensus = manager(&["a", "b"], ConsensusConfig::default());
        let ticket = consensus.initiate_join_request(node("c")).unwrap();
        let id = ticket.request_id.clone();

        consensus.submit_vote(vote("a", &id, true, "")).unwrap();
        assert_eq!(consensus.pending_requests(), vec![id.clone()]);
        consensus.submit_vote(vote("b", &id, true, "")).unwrap();

        let decision = ticket.decision().await.unwrap();
        assert_eq!(decision.outcome, JoinOutcome::Approved);
        assert_eq!(decision.votes_received, 2);
        assert!(consensus.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn single_veto_rejects_with_voter_and_reason() {
        let consensus = manager(&["a", "b"], ConsensusConfig::default());
        let ticket = consensus.initiate_join_request(node("c")).unwrap();
        let id = ticket.request_id.clone();

        consensus.submit_vote(vote("a", &id, true, "")).unwrap();
        consensus
            .submit_vote(vote("b", &id, false, "version mismatch"))
            .unwrap();

        let decision = ticket.decision().await.unwrap();
        assert_eq!(
            decision.outcome,
            JoinOutcome::Rejected {
                voter_id: "b".into(),
                reason: "version mismatch".into()
            }
        );
        match decision.outcome.into_result() {
            Err(MeshError::JoinRejected { voter_id, .. }) => assert_eq!(voter_id, "b"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn quorum_waits_for_every_vote_after_a_veto() {
        let consensus = manager(&["a", "b"], ConsensusConfig::default());
        let mut ticket = consensus.initiate_join_request(node("c")).unwrap();
        let id = ticket.request_id.clone();

        consensus.submit_vote(vote("a", &id, false, "no")).unwrap();
        assert!(ticket.try_decision().is_none());
    }

    #[tokio::test]
    async fn short_circuit_veto_finalizes_early() {
        let config = ConsensusConfig {
            short_circuit_veto: true,
            ..Default::default()
        };
        let consensus = manager(&["a", "b", "c"], config);
        let mut ticket = consensus.initiate_join_request(node("d")).unwrap();
        let id = ticket.request_id.clone();

        consensus.submit_vote(vote("b", &id, false, "blocked")).unwrap();
        let decision = ticket.try_decision().expect("decided on first veto");
        assert_eq!(decision.votes_received, 1);
        assert!(!decision.outcome.is_approved());
    }

    #[tokio::test]
    async fn duplicate_and_unknown_votes_are_errors() {
        let consensus = manager(&["a", "b"], ConsensusConfig::default());
        let ticket = consensus.initiate_join_request(node("c")).unwrap();
        let id = ticket.request_id.clone();

        consensus.submit_vote(vote("a", &id, true, "")).unwrap();
        assert!(matches!(
            consensus.submit_vote(vote("a", &id, true, "")),
            Err(MeshError::DuplicateVote { .. })
        ));
        assert!(matches!(
            consensus.submit_vote(vote("a", "nope", true, "")),
            Err(MeshError::RequestNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_votes_time_out_only_after_deadline() {
        let config = ConsensusConfig {
            vote_timeout_ms: 500,
            ..Default::default()
        };
        let consensus = manager(&["a", "b"], config);
        let start = tokio::time::Instant::now();
        let mut ticket = consensus.initiate_join_request(node("c")).unwrap();
        let id = ticket.request_id.clone();
        consensus.submit_vote(vote("a", &id, true, "")).unwrap();

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(ticket.try_decision().is_none());

        let decision = ticket.decision().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(
            decision.outcome,
            JoinOutcome::TimedOut {
                received: 1,
                total: 2
            }
        );
        assert_eq!(decision.outcome.reason(), "timeout: 1/2 votes received");
        assert!(consensus.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn timeout_after_quorum_is_a_no_op() {
        let consensus = manager(&["a"], ConsensusConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        consensus.set_decision_callback(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let ticket = consensus.initiate_join_request(node("b")).unwrap();
        let id = ticket.request_id.clone();
        consensus.submit_vote(vote("a", &id, true, "")).unwrap();
        consensus.expire(&id);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ticket.decision().await.unwrap().outcome.is_approved());
    }

    #[tokio::test]
    async fn cast_local_vote_uses_local_id() {
        let consensus = manager(&["a"], ConsensusConfig::default());
        let ticket = consensus.initiate_join_request(node("b")).unwrap();
        let request = JoinRequest {
            request_id: ticket.request_id.clone(),
            candidate: Some(node("b")),
            timestamp_ms: now_ms(),
        };

        let vote = consensus.cast_local_vote(&request).unwrap();
        assert_eq!(vote.voter_id, "a");
        assert!(vote.approve);
        assert!(ticket.decision().await.unwrap().outcome.is_approved());
    }

    #[test]
    fn evaluation_rejects_bad_candidates() {
        let config = ConsensusConfig {
            max_nodes: 2,
            deny_list: vec!["evil".into()],
            ..Default::default()
        };
        let consensus = manager(&["a"], config);

        assert!(matches!(
            consensus.evaluate_join_request(&NodeDescriptor::new("x", "", "worker", "h:1")),
            Err(MeshError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            consensus.evaluate_join_request(&node("a")),
            Err(MeshError::AlreadyExists(_))
        ));
        assert!(matches!(
            consensus.evaluate_join_request(&node("evil")),
            Err(MeshError::AdmissionDenied(_))
        ));
        consensus.evaluate_join_request(&node("b")).unwrap();

        consensus.topology.add_node(node("b")).unwrap();
        assert!(matches!(
            consensus.evaluate_join_request(&node("c")),
            Err(MeshError::MeshAtCapacity(2))
        ));
    }

    #[test]
    fn custom_rules_run_after_builtin_checks() {
        struct RequireType(&'static str);
        impl AdmissionRule for RequireType {
            fn evaluate(&self, candidate: &NodeDescriptor, _: &Topology) -> std::result::Result<(), String> {
                if candidate.node_type == self.0 {
                    Ok(())
                } else {
                    Err(format!("only {} nodes may join", self.0))
                }
            }
        }

        let topology = Arc::new(Topology::new());
        let consensus = ConsensusManager::new("a", topology, ConsensusConfig::default())
            .with_rule(RequireType("storage"));

        let request = JoinRequest {
            request_id: "r1".into(),
            candidate: Some(node("b")),
            timestamp_ms: 0,
        };
        let vote = consensus.vote_on(&request);
        assert!(!vote.approve);
        assert!(vote.reason.contains("only storage nodes"));
    }
}
