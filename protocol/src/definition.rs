//! Protocol definitions
//!
//! A [`Protocol`] is a plain value: a packet map, a signature → parser table and
//! a handful of optional hooks, all stored as function pointers. Families share
//! parsers by handing the same function to several definitions; a title that
//! differs in one step swaps in a different function for that entry.
//!
//! Each query gets its own `Protocol` instance (see [`crate::Registry`]), which
//! owns the per-server state: the challenge token and the bound target.

use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use crate::buffer::{Buffer, Endian};
use crate::context::RunContext;
use crate::error::{QueryError, Result};
use crate::normalize::Normalization;
use crate::phase::{Phase, Transport};
use crate::reassembly::{self, Datagram, Fragment, JoinFn};
use crate::result::QueryResult;
use crate::server::{QueryTarget, ServerDescriptor};
use crate::template::{Packets, Template};

/// Parses one payload (cursor placed after its signature) into the result
pub type ParseFn = fn(&mut Buffer, &mut QueryResult) -> Result<()>;
/// Extracts the challenge token from a challenge response
pub type ChallengeFn = fn(&mut Buffer) -> Result<Vec<u8>>;
/// Runs before anything is sent; may rewrite packets or the target
pub type BeforeSendFn =
    fn(&mut Protocol, &ServerDescriptor, &mut QueryTarget, &mut RunContext) -> Result<()>;
/// Classifies a raw datagram as a whole payload or a fragment
pub type SplitFn = fn(&[u8]) -> Result<Datagram>;
/// Decides whether the datagrams received so far form a full answer
pub type CompleteFn = fn(&[Vec<u8>]) -> bool;
/// Derives the query port from the client port and the definition's offset
pub type QueryPortFn = fn(u16, i32) -> Option<u16>;

/// Client port shifted by a (possibly negative) offset
pub fn offset_port(client_port: u16, offset: i32) -> Option<u16> {
    u16::try_from(i32::from(client_port) + offset).ok()
}

/// Raw datagrams collected for one (server, phase)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResponse {
    pub phase: Phase,
    pub packets: Vec<Vec<u8>>,
}

/// Outcome of [`Protocol::process_response`]
#[derive(Debug, Default)]
pub struct ProcessedResponse {
    pub result: QueryResult,
    pub completed: Vec<Phase>,
    pub failures: Vec<(Phase, QueryError)>,
}

/// Everything the engine needs to decide when a receive is finished,
/// detached from the definition so it can travel with a socket job
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    transport: Transport,
    split: Option<SplitFn>,
    complete: Option<CompleteFn>,
}

impl Completion {
    pub fn is_complete(&self, packets: &[Vec<u8>]) -> bool {
        if let Some(complete) = self.complete {
            return complete(packets);
        }
        if packets.is_empty() {
            return false;
        }
        // stream protocols without a completion rule read until EOF
        if self.transport == Transport::Tcp {
            return false;
        }
        let Some(split) = self.split else {
            return true;
        };

        let mut groups: BTreeMap<u32, (BTreeSet<u32>, Option<u32>)> = BTreeMap::new();
        for packet in packets {
            match split(packet) {
                Ok(Datagram::Whole(_)) => return true,
                Ok(Datagram::Fragment(fragment)) => {
                    let entry = groups.entry(fragment.group).or_default();
                    entry.0.insert(fragment.number);
                    if fragment.total.is_some() {
                        entry.1 = fragment.total;
                    }
                }
                Err(_) => continue,
            }
        }

        groups.values().any(|(numbers, total)| {
            total.is_some_and(|t| numbers.range(..t).count() as u32 >= t)
        })
    }
}

#[derive(Debug, Clone)]
pub struct Protocol {
    name: &'static str,
    family: &'static str,
    long_name: &'static str,
    transport: Transport,
    endian: Endian,
    port_diff: i32,
    query_port: QueryPortFn,
    requires_query_port: bool,
    join_link: Option<&'static str>,
    packets: Packets,
    responses: Vec<(Vec<u8>, ParseFn)>,
    challenge: Option<ChallengeFn>,
    before_send: Option<BeforeSendFn>,
    split: Option<SplitFn>,
    join: JoinFn,
    complete: Option<CompleteFn>,
    normalize: Normalization,
}

impl Protocol {
    /// Starts a definition; `name` is the registry id, `family` the wire protocol
    pub fn new(name: &'static str, family: &'static str, transport: Transport) -> Self {
        Self {
            name,
            family,
            long_name: name,
            transport,
            endian: Endian::Little,
            port_diff: 0,
            query_port: offset_port,
            requires_query_port: false,
            join_link: None,
            packets: Packets::new(),
            responses: Vec::new(),
            challenge: None,
            before_send: None,
            split: None,
            join: reassembly::concat,
            complete: None,
            normalize: Normalization::new(),
        }
    }

    pub fn long_name(mut self, long_name: &'static str) -> Self {
        self.long_name = long_name;
        self
    }

    /// Renames a family definition for one title
    pub fn named(mut self, name: &'static str, long_name: &'static str) -> Self {
        self.name = name;
        self.long_name = long_name;
        self
    }

    pub fn endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn port_diff(mut self, port_diff: i32) -> Self {
        self.port_diff = port_diff;
        self
    }

    pub fn query_port_with(mut self, query_port: QueryPortFn) -> Self {
        self.query_port = query_port;
        self
    }

    /// The query port can't be derived and must come from the server options
    pub fn requires_query_port(mut self) -> Self {
        self.requires_query_port = true;
        self
    }

    /// Join link template, `{ip}` and `{port}` are substituted
    pub fn join_link(mut self, template: &'static str) -> Self {
        self.join_link = Some(template);
        self
    }

    pub fn packet(mut self, phase: Phase, template: Template) -> Self {
        self.packets.insert(phase, template);
        self
    }

    /// Declares the challenge round: the packet that asks for a token and the
    /// function that pulls the token out of the answer
    pub fn challenge(mut self, template: Template, parse: ChallengeFn) -> Self {
        self.packets.insert(Phase::Challenge, template);
        self.challenge = Some(parse);
        self
    }

    /// Routes payloads starting with `signature` to `parse`; an empty
    /// signature matches anything and belongs at the end of the table
    pub fn response(mut self, signature: &[u8], parse: ParseFn) -> Self {
        self.responses.push((signature.to_vec(), parse));
        self
    }

    pub fn before_send(mut self, hook: BeforeSendFn) -> Self {
        self.before_send = Some(hook);
        self
    }

    pub fn split(mut self, split: SplitFn) -> Self {
        self.split = Some(split);
        self
    }

    pub fn join(mut self, join: JoinFn) -> Self {
        self.join = join;
        self
    }

    pub fn complete(mut self, complete: CompleteFn) -> Self {
        self.complete = Some(complete);
        self
    }

    pub fn normalize(mut self, normalize: Normalization) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn family(&self) -> &'static str {
        self.family
    }

    pub fn title(&self) -> &'static str {
        self.long_name
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn packets(&self) -> &Packets {
        &self.packets
    }

    pub fn packets_mut(&mut self) -> &mut Packets {
        &mut self.packets
    }

    pub fn normalization(&self) -> &Normalization {
        &self.normalize
    }

    pub fn has_challenge(&self) -> bool {
        self.challenge.is_some() && self.packets.contains(Phase::Challenge)
    }

    pub fn completion(&self) -> Completion {
        Completion {
            transport: self.transport,
            split: self.split,
            complete: self.complete,
        }
    }

    pub fn is_complete(&self, packets: &[Vec<u8>]) -> bool {
        self.completion().is_complete(packets)
    }

    /// Port to query: the explicit option, else the derived one
    pub fn find_query_port(&self, server: &ServerDescriptor) -> Result<u16> {
        if let Some(port) = server.options.query_port {
            return Ok(port);
        }
        if self.requires_query_port {
            return Err(QueryError::MissingRequiredOption("query_port"));
        }
        (self.query_port)(server.port, self.port_diff).ok_or_else(|| {
            QueryError::InvalidAddress(format!(
                "{} shifted by {} is not a valid port",
                server.port, self.port_diff
            ))
        })
    }

    pub fn join_link_for(&self, server: &ServerDescriptor) -> Option<String> {
        self.join_link.map(|link| {
            link.replace("{ip}", &server.host)
                .replace("{port}", &server.port.to_string())
        })
    }

    /// Runs the pre-send hook, if any
    pub fn prepare(
        &mut self,
        server: &ServerDescriptor,
        target: &mut QueryTarget,
        context: &mut RunContext,
    ) -> Result<()> {
        match self.before_send {
            Some(hook) => hook(self, server, target, context),
            None => Ok(()),
        }
    }

    pub fn bind_target(&mut self, target: SocketAddr) {
        self.packets.bind_target(target);
    }

    /// Extracts the token from a challenge response and applies it to every
    /// pending template
    pub fn challenge_parse_and_apply(&mut self, packets: &[Vec<u8>]) -> Result<()> {
        let parse = self
            .challenge
            .ok_or_else(|| QueryError::ChallengeFailed(format!("{} has no challenge step", self.name)))?;
        let payload = self
            .assemble(packets)?
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::ChallengeFailed("empty challenge response".into()))?;

        let mut buffer = Buffer::with_endian(payload, self.endian);
        let token = parse(&mut buffer)?;
        debug!("{}: challenge token {}", self.name, hex::encode(&token));
        self.packets.apply_challenge(&token);
        Ok(())
    }

    /// Turns the raw datagrams of one phase into logical payloads
    ///
    /// Stream transports yield one payload; datagram transports yield one per
    /// whole datagram plus one per reassembled fragment group. A group that is
    /// incomplete or fails decompression is dropped; the phase only fails when
    /// no payload is left.
    pub fn assemble(&self, packets: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if self.transport == Transport::Tcp {
            return Ok(vec![packets.concat()]);
        }
        let Some(split) = self.split else {
            return Ok(packets.to_vec());
        };

        let mut payloads = Vec::new();
        let mut groups: BTreeMap<u32, Vec<Fragment>> = BTreeMap::new();
        for packet in packets {
            match split(packet)? {
                Datagram::Whole(payload) => payloads.push(payload),
                Datagram::Fragment(fragment) => groups.entry(fragment.group).or_default().push(fragment),
            }
        }

        let mut last_error = None;
        for (group, fragments) in groups {
            match reassembly::reassemble(fragments, self.join) {
                Ok(payload) => payloads.push(payload),
                Err(err) => {
                    debug!("{}: dropping split group {:#x}: {}", self.name, group, err);
                    last_error = Some(err);
                }
            }
        }

        match (payloads.is_empty(), last_error) {
            (true, Some(err)) => Err(err),
            _ => Ok(payloads),
        }
    }

    /// Routes one payload to the parser registered for its signature
    pub fn dispatch(&self, payload: Vec<u8>, result: &mut QueryResult) -> Result<()> {
        let Some((signature, parse)) = self
            .responses
            .iter()
            .find(|(signature, _)| payload.starts_with(signature))
        else {
            let width = self
                .responses
                .iter()
                .map(|(signature, _)| signature.len())
                .max()
                .unwrap_or(1)
                .max(1);
            let shown = &payload[..payload.len().min(width)];
            return Err(QueryError::UnknownResponseType(hex::encode(shown)));
        };

        let mut buffer = Buffer::with_endian(payload, self.endian);
        buffer.skip(signature.len())?;
        parse(&mut buffer, result)
    }

    /// Parses one phase into a fresh accumulator
    pub fn process_phase(&self, packets: &[Vec<u8>]) -> Result<QueryResult> {
        let mut result = QueryResult::new();
        for payload in self.assemble(packets)? {
            self.dispatch(payload, &mut result)?;
        }
        Ok(result)
    }

    /// Parses every phase and merges the successful ones in phase order
    ///
    /// A phase that fails leaves nothing behind in the merged result.
    pub fn process_response(&self, mut responses: Vec<PhaseResponse>) -> ProcessedResponse {
        responses.sort_by_key(|response| response.phase);

        let mut processed = ProcessedResponse::default();
        for response in responses {
            match self.process_phase(&response.packets) {
                Ok(result) => {
                    processed.result.merge(result);
                    processed.completed.push(response.phase);
                }
                Err(err) => processed.failures.push((response.phase, err)),
            }
        }
        processed
    }
}
