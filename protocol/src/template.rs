//! Outbound packet templates
//!
//! A template is a byte string with optional substitution points. The challenge
//! point is filled by the token a server hands out during the challenge phase,
//! the others by values derived from the query target.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::error::{QueryError, Result};
use crate::phase::Phase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Bytes(Vec<u8>),
    Challenge,
    /// The four octets of the target's IPv4 address
    Ipv4Octets,
    QueryPortLe,
    QueryPortBe,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn new(bytes: &[u8]) -> Self {
        Self::default().then_bytes(bytes)
    }

    pub fn then_bytes(mut self, bytes: &[u8]) -> Self {
        if let Some(Segment::Bytes(last)) = self.segments.last_mut() {
            last.extend_from_slice(bytes);
        } else if !bytes.is_empty() {
            self.segments.push(Segment::Bytes(bytes.to_vec()));
        }
        self
    }

    pub fn then_challenge(mut self) -> Self {
        self.segments.push(Segment::Challenge);
        self
    }

    pub fn then_ipv4(mut self) -> Self {
        self.segments.push(Segment::Ipv4Octets);
        self
    }

    pub fn then_port_le(mut self) -> Self {
        self.segments.push(Segment::QueryPortLe);
        self
    }

    pub fn then_port_be(mut self) -> Self {
        self.segments.push(Segment::QueryPortBe);
        self
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn needs_challenge(&self) -> bool {
        self.segments.contains(&Segment::Challenge)
    }

    /// Produces wire bytes, failing if any placeholder has no value yet
    pub fn render(
        &self,
        phase: Phase,
        challenge: Option<&[u8]>,
        target: Option<SocketAddr>,
    ) -> Result<Vec<u8>> {
        let unresolved = || QueryError::UnresolvedPlaceholder(phase.to_string());
        let mut out = Vec::new();

        for segment in &self.segments {
            match segment {
                Segment::Bytes(bytes) => out.extend_from_slice(bytes),
                Segment::Challenge => out.extend_from_slice(challenge.ok_or_else(unresolved)?),
                Segment::Ipv4Octets => match target {
                    Some(SocketAddr::V4(addr)) => out.extend_from_slice(&addr.ip().octets()),
                    _ => return Err(unresolved()),
                },
                Segment::QueryPortLe => {
                    let port = target.ok_or_else(unresolved)?.port();
                    out.extend_from_slice(&port.to_le_bytes());
                }
                Segment::QueryPortBe => {
                    let port = target.ok_or_else(unresolved)?.port();
                    out.extend_from_slice(&port.to_be_bytes());
                }
            }
        }

        Ok(out)
    }
}

/// The phase → template map of one protocol instance, plus the values
/// gathered for its substitution points
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packets {
    templates: BTreeMap<Phase, Template>,
    challenge: Option<Vec<u8>>,
    target: Option<SocketAddr>,
}

impl Packets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, phase: Phase, template: Template) {
        self.templates.insert(phase, template);
    }

    pub fn get(&self, phase: Phase) -> Option<&Template> {
        self.templates.get(&phase)
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.templates.contains_key(&phase)
    }

    /// Query phases in send order, without the challenge round
    pub fn query_phases(&self) -> Vec<Phase> {
        self.templates
            .keys()
            .copied()
            .filter(|phase| *phase != Phase::Challenge)
            .collect()
    }

    /// True when `phase` cannot be sent before a challenge token is known
    pub fn requires_challenge(&self, phase: Phase) -> bool {
        self.challenge.is_none()
            && self
                .templates
                .get(&phase)
                .is_some_and(Template::needs_challenge)
    }

    /// Stores the challenge token; every template renders with it from now on.
    /// Templates themselves are left intact, so applying the same token twice
    /// changes nothing.
    pub fn apply_challenge(&mut self, token: &[u8]) {
        self.challenge = Some(token.to_vec());
    }

    pub fn challenge_token(&self) -> Option<&[u8]> {
        self.challenge.as_deref()
    }

    pub fn bind_target(&mut self, target: SocketAddr) {
        self.target = Some(target);
    }

    pub fn render(&self, phase: Phase) -> Result<Vec<u8>> {
        let template = self
            .templates
            .get(&phase)
            .ok_or_else(|| QueryError::UnresolvedPlaceholder(phase.to_string()))?;
        template.render(phase, self.challenge.as_deref(), self.target)
    }

    /// Renders every template that can be rendered right now
    pub fn render_all(&self) -> BTreeMap<Phase, Vec<u8>> {
        self.templates
            .keys()
            .filter_map(|phase| self.render(*phase).ok().map(|bytes| (*phase, bytes)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_like() -> Packets {
        let mut packets = Packets::new();
        packets.insert(Phase::Details, Template::new(b"\xFF\xFF\xFF\xFFTSource Engine Query\x00"));
        packets.insert(Phase::Players, Template::new(b"\xFF\xFF\xFF\xFF\x55").then_challenge());
        packets.insert(Phase::Challenge, Template::new(b"\xFF\xFF\xFF\xFF\x56\xFF\xFF\xFF\xFF"));
        packets
    }

    #[test]
    fn test_adjacent_bytes_merge() {
        let template = Template::new(b"ab").then_bytes(b"cd");
        assert_eq!(template.segments(), &[Segment::Bytes(b"abcd".to_vec())]);
    }

    #[test]
    fn test_challenge_placeholder_blocks_render() {
        let packets = source_like();
        assert!(packets.requires_challenge(Phase::Players));
        assert!(!packets.requires_challenge(Phase::Details));
        assert!(matches!(
            packets.render(Phase::Players),
            Err(QueryError::UnresolvedPlaceholder(_))
        ));
    }

    #[test]
    fn test_apply_challenge() {
        let mut packets = source_like();
        packets.apply_challenge(&[1, 2, 3, 4]);

        assert!(!packets.requires_challenge(Phase::Players));
        assert_eq!(
            packets.render(Phase::Players).unwrap(),
            b"\xFF\xFF\xFF\xFF\x55\x01\x02\x03\x04".to_vec()
        );
    }

    #[test]
    fn test_apply_challenge_twice_is_idempotent() {
        let mut once = source_like();
        once.apply_challenge(b"tokn");

        let mut twice = source_like();
        twice.apply_challenge(b"tokn");
        twice.apply_challenge(b"tokn");

        assert_eq!(once, twice);
        assert_eq!(once.render_all(), twice.render_all());
    }

    #[test]
    fn test_query_phases_skip_challenge() {
        assert_eq!(source_like().query_phases(), vec![Phase::Details, Phase::Players]);
    }

    #[test]
    fn test_target_placeholders() {
        let template = Template::new(b"q").then_ipv4().then_port_le().then_port_be();
        let target: SocketAddr = "10.1.2.3:27015".parse().unwrap();

        let bytes = template.render(Phase::Status, None, Some(target)).unwrap();
        assert_eq!(bytes, vec![b'q', 10, 1, 2, 3, 0x87, 0x69, 0x69, 0x87]);

        let v6: SocketAddr = "[::1]:27015".parse().unwrap();
        assert!(template.render(Phase::Status, None, Some(v6)).is_err());
        assert!(template.render(Phase::Status, None, None).is_err());
    }
}
