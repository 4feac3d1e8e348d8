//! Query orchestration
//!
//! One run walks every requested server through the same steps:
//!
//! 1. **Prepare**: build a fresh definition from the registry, derive the query
//!    port, run the definition's pre-send hook and resolve the host. Lookups run
//!    in the same loop as the exchanges, bounded by the policy timeout, so a
//!    server is scheduled as soon as its own address is known.
//! 2. **Challenge**: if any phase needs a token, only the challenge packet is
//!    sent at first; dependent phases wait in `Challenged` until the token is
//!    applied, and fail together when it can't be obtained.
//! 3. **Exchange**: every (server, phase) pair becomes a job. Jobs wait in a
//!    queue until the session pool has a free slot, then run concurrently on
//!    the current thread, each against its own deadline.
//! 4. **Finalize**: once a server has no pending phase its responses are
//!    parsed in phase order, normalized and filtered into a [`ServerReport`].
//!
//! A failure is always scoped: a bad phase fails that phase, a bad server fails
//! that server, and the run itself never errors.

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use protocol::{
    Filter, Phase, PhaseResponse, Protocol, QueryError, QueryResult, QueryTarget, Registry,
    Result, RunContext, ServerDescriptor,
};
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tokio::time::timeout;

use crate::config::QueryPolicy;
use crate::report::{PhaseFailure, PhaseStatus, ServerReport, ServerStats};
use crate::session::{Request, Session, SessionPool, SessionStats};

/// Drives protocol definitions over the network
pub struct QueryEngine {
    policy: QueryPolicy,
    registry: Registry,
    filters: Vec<Box<dyn Filter>>,
}

/// A (server, phase) exchange waiting for a session
struct Job {
    server: usize,
    phase: Phase,
    request: Request,
}

struct JobOutcome {
    server: usize,
    phase: Phase,
    session: Session,
    stats: SessionStats,
    result: Result<Vec<Vec<u8>>>,
}

/// Everything a run tracks for one server
struct ServerState {
    descriptor: ServerDescriptor,
    protocol: Option<Protocol>,
    target: Option<QueryTarget>,
    address: Option<SocketAddr>,
    phases: BTreeMap<Phase, PhaseStatus>,
    failures: Vec<PhaseFailure>,
    responses: Vec<PhaseResponse>,
    error: Option<QueryError>,
    pending: usize,
    stats: ServerStats,
    report: Option<ServerReport>,
}

impl ServerState {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            protocol: None,
            target: None,
            address: None,
            phases: BTreeMap::new(),
            failures: Vec::new(),
            responses: Vec::new(),
            error: None,
            pending: 0,
            stats: ServerStats::default(),
            report: None,
        }
    }

    fn fail_phase(&mut self, phase: Phase, error: QueryError) {
        let status = if error.is_timeout() {
            PhaseStatus::TimedOut
        } else {
            PhaseStatus::Failed
        };
        warn!("{} {}: {}", self.descriptor.id(), phase, error);
        self.phases.insert(phase, status);
        self.failures.push(PhaseFailure { phase, error });
    }
}

async fn run_job(job: Job, mut session: Session, policy: QueryPolicy) -> JobOutcome {
    let result = session.exchange(&job.request, &policy).await;
    JobOutcome {
        server: job.server,
        phase: job.phase,
        stats: session.stats(),
        session,
        result,
    }
}

/// Resolves a target, giving up after `limit`; IP literals never wait
async fn resolve(target: QueryTarget, limit: Duration) -> Result<SocketAddr> {
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, target.port));
    }
    timeout(limit, lookup_host((target.host.as_str(), target.port)))
        .await
        .map_err(|_| QueryError::InvalidAddress(format!("{}: lookup timed out", target)))?
        .map_err(|e| QueryError::InvalidAddress(format!("{}: {}", target, e)))?
        .next()
        .ok_or_else(|| QueryError::InvalidAddress(format!("{}: no addresses", target)))
}

impl QueryEngine {
    pub fn new(policy: QueryPolicy) -> Self {
        Self {
            policy,
            registry: Registry::with_builtin(),
            filters: Vec::new(),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Filters run after normalization, in the order they were added
    pub fn add_filter(&mut self, filter: impl Filter + 'static) {
        self.filters.push(Box::new(filter));
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Runs one query run on a private single-threaded runtime
    pub fn run_blocking(&self, servers: Vec<ServerDescriptor>) -> std::io::Result<Vec<ServerReport>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(runtime.block_on(self.run(servers)))
    }

    /// Queries every server and returns one report per server, in request order
    pub async fn run(&self, servers: Vec<ServerDescriptor>) -> Vec<ServerReport> {
        let started = Instant::now();
        let total = servers.len();
        info!("Querying {} server(s)", total);

        let mut context = RunContext::new();
        let mut states: Vec<ServerState> = servers.into_iter().map(ServerState::new).collect();
        for state in &mut states {
            if let Err(e) = self.prepare(state, &mut context) {
                warn!("{}: {}", state.descriptor.id(), e);
                state.error = Some(e);
            }
        }

        let limit = self.policy.timeout;
        let mut lookups = FuturesUnordered::new();
        for (index, state) in states.iter_mut().enumerate() {
            if let Some(target) = state.target.clone() {
                state.pending += 1;
                lookups.push(async move { (index, resolve(target, limit).await) });
            }
        }

        let mut queue: VecDeque<Job> = VecDeque::new();
        let mut pool = SessionPool::new(self.policy.max_sockets);
        let mut in_flight = FuturesUnordered::new();

        for state in &mut states {
            self.settle(state, started);
        }

        loop {
            while let Some(job) = queue.pop_front() {
                let Some(session) = pool.checkout(job.request.target) else {
                    queue.push_front(job);
                    break;
                };
                states[job.server].phases.insert(job.phase, PhaseStatus::Sent);
                in_flight.push(run_job(job, session, self.policy.clone()));
            }

            tokio::select! {
                Some((index, address)) = lookups.next() => {
                    let state = &mut states[index];
                    Self::resolved(index, state, address, &mut queue);
                    self.settle(state, started);
                }
                Some(outcome) = in_flight.next() => {
                    let JobOutcome {
                        server,
                        phase,
                        session,
                        stats,
                        result,
                    } = outcome;
                    pool.checkin(session);

                    let state = &mut states[server];
                    state.stats.bytes_sent += stats.bytes_sent;
                    state.stats.bytes_received += stats.bytes_received;
                    state.stats.attempts += stats.attempts;
                    if phase == Phase::Challenge {
                        Self::complete_challenge(server, state, result, &mut queue);
                    } else {
                        Self::complete_phase(state, phase, result);
                    }
                    self.settle(state, started);
                }
                else => break,
            }
        }

        let reports: Vec<ServerReport> = states
            .into_iter()
            .map(|mut state| match state.report.take() {
                Some(report) => report,
                None => self.finalize(state, started),
            })
            .collect();

        let online = reports.iter().filter(|report| report.online).count();
        info!(
            "{} of {} server(s) online after {:.2?} ({} socket(s) used)",
            online,
            total,
            started.elapsed(),
            pool.open()
        );
        reports
    }

    /// Schedules a server once its own lookup has finished
    fn resolved(
        index: usize,
        state: &mut ServerState,
        address: Result<SocketAddr>,
        queue: &mut VecDeque<Job>,
    ) {
        state.pending = state.pending.saturating_sub(1);
        match address {
            Ok(address) => {
                debug!("{} resolved to {}", state.descriptor.id(), address);
                state.address = Some(address);
                if let Some(protocol) = state.protocol.as_mut() {
                    protocol.bind_target(address);
                }
                Self::schedule(index, state, queue);
            }
            Err(e) => {
                warn!("{}: {}", state.descriptor.id(), e);
                state.error = Some(e);
            }
        }
    }

    /// Builds the definition instance and works out where to send
    fn prepare(&self, state: &mut ServerState, context: &mut RunContext) -> Result<()> {
        let mut protocol = self.registry.create(&state.descriptor.protocol)?;
        let port = protocol.find_query_port(&state.descriptor)?;
        let mut target = QueryTarget::new(state.descriptor.host.clone(), port);
        protocol.prepare(&state.descriptor, &mut target, context)?;

        state.protocol = Some(protocol);
        state.target = Some(target);
        Ok(())
    }

    /// Queues the first wave of jobs; phases needing a token wait for the challenge
    fn schedule(index: usize, state: &mut ServerState, queue: &mut VecDeque<Job>) {
        let (Some(protocol), Some(address)) = (state.protocol.as_ref(), state.address) else {
            return;
        };

        let phases = protocol.packets().query_phases();
        let waiting: Vec<Phase> = phases
            .iter()
            .copied()
            .filter(|phase| protocol.packets().requires_challenge(*phase))
            .collect();
        let challenge = protocol.has_challenge() && !waiting.is_empty();

        let mut jobs = Vec::new();
        let mut failed = Vec::new();
        for phase in phases {
            if challenge && waiting.contains(&phase) {
                state.phases.insert(phase, PhaseStatus::Challenged);
                continue;
            }
            match Self::job(index, phase, protocol, address) {
                Ok(job) => jobs.push(job),
                Err(e) => failed.push((phase, e)),
            }
        }
        if challenge {
            match Self::job(index, Phase::Challenge, protocol, address) {
                Ok(job) => jobs.insert(0, job),
                Err(e) => failed.push((Phase::Challenge, e)),
            }
        }

        state.pending = jobs.len()
            + state
                .phases
                .values()
                .filter(|status| **status == PhaseStatus::Challenged)
                .count();
        for job in jobs {
            state.phases.insert(job.phase, PhaseStatus::Idle);
            queue.push_back(job);
        }
        for (phase, error) in failed {
            let reason = error.to_string();
            state.fail_phase(phase, error);
            if phase == Phase::Challenge {
                Self::release_waiting(index, state, Some(reason), queue);
            }
        }
    }

    fn job(server: usize, phase: Phase, protocol: &Protocol, target: SocketAddr) -> Result<Job> {
        Ok(Job {
            server,
            phase,
            request: Request {
                target,
                transport: protocol.transport(),
                packet: protocol.packets().render(phase)?,
                completion: protocol.completion(),
            },
        })
    }

    fn complete_phase(state: &mut ServerState, phase: Phase, result: Result<Vec<Vec<u8>>>) {
        state.pending = state.pending.saturating_sub(1);
        match result {
            Ok(packets) => {
                debug!("{} {}: {} datagram(s)", state.descriptor.id(), phase, packets.len());
                state.phases.insert(phase, PhaseStatus::Complete);
                state.responses.push(PhaseResponse { phase, packets });
            }
            Err(e) => state.fail_phase(phase, e),
        }
    }

    fn complete_challenge(
        index: usize,
        state: &mut ServerState,
        result: Result<Vec<Vec<u8>>>,
        queue: &mut VecDeque<Job>,
    ) {
        state.pending = state.pending.saturating_sub(1);
        let applied = match (result, state.protocol.as_mut()) {
            (Ok(packets), Some(protocol)) => protocol.challenge_parse_and_apply(&packets),
            (Ok(_), None) => Err(QueryError::ChallengeFailed("no protocol instance".into())),
            (Err(e), _) => Err(e),
        };
        match applied {
            Ok(()) => {
                state.phases.insert(Phase::Challenge, PhaseStatus::Complete);
                Self::release_waiting(index, state, None, queue);
            }
            Err(e) => {
                let reason = e.to_string();
                state.fail_phase(Phase::Challenge, e);
                Self::release_waiting(index, state, Some(reason), queue);
            }
        }
    }

    /// Sends the phases that were waiting for a token, or fails them all
    /// with the reason the challenge failed
    fn release_waiting(
        index: usize,
        state: &mut ServerState,
        failure: Option<String>,
        queue: &mut VecDeque<Job>,
    ) {
        let waiting: Vec<Phase> = state
            .phases
            .iter()
            .filter(|(_, status)| **status == PhaseStatus::Challenged)
            .map(|(phase, _)| *phase)
            .collect();

        for phase in waiting {
            let job = match (&failure, state.protocol.as_ref(), state.address) {
                (None, Some(protocol), Some(address)) => Self::job(index, phase, protocol, address),
                (Some(reason), _, _) => Err(QueryError::ChallengeFailed(reason.clone())),
                _ => Err(QueryError::ChallengeFailed("server not prepared".into())),
            };
            match job {
                Ok(job) => {
                    state.phases.insert(phase, PhaseStatus::Idle);
                    queue.push_back(job);
                }
                Err(e) => {
                    state.pending = state.pending.saturating_sub(1);
                    state.fail_phase(phase, e);
                }
            }
        }
    }

    /// Finalizes a server as soon as nothing is pending for it
    fn settle(&self, state: &mut ServerState, started: Instant) {
        if state.pending > 0 || state.report.is_some() {
            return;
        }
        let placeholder = ServerState::new(state.descriptor.clone());
        let finished = std::mem::replace(state, placeholder);
        state.report = Some(self.finalize(finished, started));
    }

    fn finalize(&self, state: ServerState, started: Instant) -> ServerReport {
        let ServerState {
            descriptor,
            protocol,
            target,
            mut phases,
            mut failures,
            responses,
            error,
            mut stats,
            ..
        } = state;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;

        let mut online = false;
        let mut result = QueryResult::new();

        if let Some(protocol) = protocol.as_ref() {
            let processed = protocol.process_response(responses);
            for (phase, error) in processed.failures {
                warn!("{} {}: {}", descriptor.id(), phase, error);
                phases.insert(phase, PhaseStatus::Failed);
                failures.push(PhaseFailure { phase, error });
            }

            online = !processed.completed.is_empty();
            if online {
                result = protocol.normalization().apply(&processed.result);
                for filter in &self.filters {
                    debug!("{}: applying filter {}", descriptor.id(), filter.name());
                    result = filter.apply(result, protocol);
                }
            }
        }
        failures.sort_by_key(|failure| failure.phase);

        if online {
            debug!("{} online", descriptor.id());
        } else {
            debug!("{} offline", descriptor.id());
        }

        ServerReport {
            id: descriptor.id(),
            protocol: descriptor.protocol.clone(),
            name: protocol.as_ref().map(|p| p.title().to_string()),
            address: descriptor.host.clone(),
            port_client: descriptor.port,
            port_query: target.as_ref().map(|t| t.port),
            online,
            join_link: protocol.as_ref().and_then(|p| p.join_link_for(&descriptor)),
            phases,
            failed_phases: failures,
            error,
            stats,
            result,
        }
    }
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new(QueryPolicy::default())
    }
}
