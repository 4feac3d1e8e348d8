//! Integration tests for the query engine against fake game servers
//!
//! Every fake server is a std UDP (or TCP) socket answering on its own thread,
//! so the engine runs against real sockets on the loopback interface.

use bzip2::write::BzEncoder;
use bzip2::Compression;
use engine::{PhaseStatus, QueryEngine, QueryPolicy};
use protocol::{
    canonical, Buffer, Normalization, Phase, Protocol, QueryError, QueryResult, ServerDescriptor,
    StripColors, Template, Transport, Value,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::thread;
use std::time::Duration;

const TOKEN: [u8; 4] = [0x0A, 0x0B, 0x0C, 0x0D];

/// CUSTOM DEFINITION TESTS
mod custom_protocol_tests {
    use super::*;

    /// A definition registered at runtime is queried and normalized like a bundled one
    #[tokio::test]
    async fn single_phase_definition_is_normalized() {
        let addr = spawn_udp_server(|request| {
            if request == b"ROSTER?" {
                vec![b"ROSTER\x03alice\0bob\0carol\0".to_vec()]
            } else {
                Vec::new()
            }
        });

        let mut engine = QueryEngine::new(fast_policy());
        engine.registry_mut().register("roster", roster);
        let reports = engine.run(vec![descriptor("roster", addr)]).await;
        let report = &reports[0];

        assert!(report.online);
        assert_eq!(report.result.get(canonical::NUMPLAYERS), Some(&Value::Int(3)));
        assert_eq!(report.result.get("online_count"), Some(&Value::Int(3)));
        assert_eq!(report.result.players().len(), 3);
        assert_eq!(report.result.players()[2].get("name"), Some(&Value::from("carol")));
        assert_eq!(report.status(Phase::Status), Some(PhaseStatus::Complete));
        assert!(report.failed_phases.is_empty());
    }

    /// Stream transports read until the server closes the connection
    #[tokio::test]
    async fn tcp_definition_reads_until_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind tcp server");
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 64];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(b"BANNER line ");
                thread::sleep(Duration::from_millis(20));
                let _ = stream.write_all(b"one\n");
            }
        });

        let mut engine = QueryEngine::new(fast_policy());
        engine.registry_mut().register("banner", banner);
        let reports = engine.run(vec![descriptor("banner", addr)]).await;

        assert!(reports[0].online);
        assert_eq!(reports[0].result.get("banner"), Some(&Value::from("line one")));
        assert_eq!(reports[0].stats.bytes_sent, 6);
    }

    /// A definition that cannot derive its query port fails before sending anything
    #[tokio::test]
    async fn missing_query_port_is_reported() {
        let addr = spawn_udp_server(|_| vec![b"ROSTER\x00".to_vec()]);

        let mut engine = QueryEngine::new(fast_policy());
        engine.registry_mut().register("voice", voice);
        let without = ServerDescriptor::new("voice", "127.0.0.1:9987").unwrap();
        let with = ServerDescriptor::new("voice", "127.0.0.1:9987")
            .unwrap()
            .with_query_port(addr.port());

        let reports = engine.run(vec![without, with]).await;
        assert!(matches!(
            reports[0].error,
            Some(QueryError::MissingRequiredOption("query_port"))
        ));
        assert!(reports[0].phases.is_empty());
        assert!(reports[1].online);
        assert_eq!(reports[1].port_query, Some(addr.port()));
    }
}

/// PARTIAL FAILURE TESTS
mod failure_tests {
    use super::*;

    /// A server that never answers ends offline with every phase timed out
    #[tokio::test]
    async fn silent_server_is_offline() {
        let silent = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind silent socket");
        let addr = silent.local_addr().unwrap();

        let engine = QueryEngine::new(
            QueryPolicy::new()
                .with_timeout(Duration::from_millis(150))
                .with_retries(1),
        );
        let reports = engine.run(vec![descriptor("source", addr)]).await;
        let report = &reports[0];

        assert!(!report.online);
        assert!(report.result.is_empty());
        assert!(!report.failed_phases.is_empty());
        assert_eq!(report.status(Phase::Details), Some(PhaseStatus::TimedOut));
        assert!(matches!(
            report.failed(Phase::Details),
            Some(QueryError::SocketTimeout { attempts: 2 })
        ));
        // players and rules never got a token
        assert!(matches!(
            report.failed(Phase::Players),
            Some(QueryError::ChallengeFailed(_))
        ));
        assert_eq!(report.stats.bytes_received, 0);
        drop(silent);
    }

    /// An unknown reply type fails only its own phase
    #[tokio::test]
    async fn unknown_reply_type_keeps_other_phases() {
        let addr = source_server(PlayersReply::UnknownType, RulesReply::Plain);
        let reports = QueryEngine::new(fast_policy())
            .run(vec![descriptor("source", addr)])
            .await;
        let report = &reports[0];

        assert!(report.online);
        assert_eq!(report.result.get("hostname"), Some(&Value::from("Integration")));
        assert_eq!(report.result.get(canonical::MAPNAME), Some(&Value::from("de_inferno")));
        assert!(report.result.players().is_empty());
        match report.failed(Phase::Players) {
            Some(QueryError::UnknownResponseType(signature)) => assert_eq!(signature, "ffffffff7a"),
            other => panic!("unexpected players outcome {:?}", other),
        }
        assert_eq!(report.status(Phase::Players), Some(PhaseStatus::Failed));
        assert_eq!(report.status(Phase::Rules), Some(PhaseStatus::Complete));
    }

    /// One broken server never takes the rest of the run down
    #[test]
    fn failures_are_scoped_per_server() {
        let live = source_server(PlayersReply::List, RulesReply::Plain);
        let servers = vec![
            ServerDescriptor::new("nosuchgame", "127.0.0.1:1").unwrap(),
            descriptor("source", live),
            ServerDescriptor::new("source", "host.invalid:27015").unwrap(),
        ];

        let engine = QueryEngine::new(fast_policy());
        let reports = tokio_test::block_on(engine.run(servers));

        assert_eq!(reports.len(), 3);
        assert!(matches!(reports[0].error, Some(QueryError::UnknownProtocol(_))));
        assert!(reports[1].online);
        assert!(matches!(reports[2].error, Some(QueryError::InvalidAddress(_))));
    }
}

/// BUNDLED PROTOCOL TESTS
mod bundled_protocol_tests {
    use super::*;

    /// Full Source exchange: details, challenge, players and rules
    #[tokio::test]
    async fn source_challenge_flow() {
        let addr = source_server(PlayersReply::List, RulesReply::Plain);
        let reports = QueryEngine::new(fast_policy())
            .run(vec![descriptor("css", addr)])
            .await;
        let report = &reports[0];

        assert!(report.online, "failures: {:?}", report.failed_phases);
        assert_eq!(report.status(Phase::Challenge), Some(PhaseStatus::Complete));
        assert_eq!(report.result.players().len(), 2);
        assert_eq!(report.result.players()[0].get("name"), Some(&Value::from("alice")));
        assert_eq!(report.result.get("sv_gravity"), Some(&Value::from("800")));
        assert_eq!(report.result.get(canonical::NUMPLAYERS), Some(&Value::Int(3)));
        assert_eq!(report.name.as_deref(), Some("Counter-Strike: Source"));
        assert_eq!(
            report.join_link.as_deref(),
            Some(format!("steam://connect/127.0.0.1:{}/", addr.port()).as_str())
        );
    }

    /// Compressed split replies give the same record whatever the arrival order
    #[tokio::test]
    async fn compressed_split_reply_order_is_irrelevant() {
        let in_order = source_server(PlayersReply::List, RulesReply::Split { reversed: false });
        let reversed = source_server(PlayersReply::List, RulesReply::Split { reversed: true });

        let reports = QueryEngine::new(fast_policy())
            .run(vec![descriptor("source", in_order), descriptor("source", reversed)])
            .await;

        assert!(reports[0].online && reports[1].online);
        assert!(reports[0].failed_phases.is_empty(), "{:?}", reports[0].failed_phases);
        assert!(reports[1].failed_phases.is_empty(), "{:?}", reports[1].failed_phases);
        assert_eq!(reports[0].result, reports[1].result);
        assert_eq!(reports[1].result.get("sv_gravity"), Some(&Value::from("800")));
        assert_eq!(reports[1].result.get("mp_friendlyfire"), Some(&Value::from("1")));
    }

    /// Quake 3 status with colour codes removed by a filter
    #[tokio::test]
    async fn quake3_status_with_color_filter() {
        let addr = spawn_udp_server(|request| {
            if request != b"\xFF\xFF\xFF\xFFgetstatus\n" {
                return Vec::new();
            }
            let mut reply = b"\xFF\xFF\xFF\xFFstatusResponse\n".to_vec();
            reply.extend_from_slice(b"\\sv_hostname\\^1Frag ^7Fest\\mapname\\q3dm17\\sv_maxclients\\8\n");
            reply.extend_from_slice(b"5 40 \"^3Doom\"\n");
            vec![reply]
        });

        let mut engine = QueryEngine::new(fast_policy());
        engine.add_filter(StripColors);
        let reports = engine.run(vec![descriptor("quake3", addr)]).await;
        let report = &reports[0];

        assert!(report.online);
        assert_eq!(report.result.get(canonical::HOSTNAME), Some(&Value::from("Frag Fest")));
        assert_eq!(report.result.get(canonical::NUMPLAYERS), Some(&Value::Int(1)));
        assert_eq!(report.result.players()[0].get("name"), Some(&Value::from("Doom")));
    }

    /// GameSpy 3 challenge plus a split reply whose fragments cut a player name
    #[tokio::test]
    async fn gamespy3_split_reply() {
        let addr = spawn_udp_server(|request| {
            let session = match request.get(3..7) {
                Some(session) => session.to_vec(),
                None => return Vec::new(),
            };
            match request.get(2).copied() {
                Some(0x09) => {
                    let mut reply = vec![0x09];
                    reply.extend_from_slice(&session);
                    reply.extend_from_slice(b"4242\0");
                    vec![reply]
                }
                Some(0x00) if request.get(7..11) == Some(&4242u32.to_be_bytes()[..]) => {
                    let fragment = |id: u8, body: &[u8]| {
                        let mut data = vec![0x00];
                        data.extend_from_slice(&session);
                        data.extend_from_slice(b"splitnum\0");
                        data.push(id);
                        data.push(0);
                        data.extend_from_slice(body);
                        data
                    };
                    vec![
                        fragment(0x81, b"player_\0\0Bob\0Carol\0\0\0"),
                        fragment(
                            0x00,
                            b"hostname\0GS3\0numplayers\x003\0\0\x01player_\0\0Alice\0Bo\0",
                        ),
                    ]
                }
                _ => Vec::new(),
            }
        });

        let reports = QueryEngine::new(fast_policy())
            .run(vec![descriptor("gamespy3", addr)])
            .await;
        let report = &reports[0];

        assert!(report.online, "failures: {:?}", report.failed_phases);
        let names: Vec<&str> = report
            .result
            .players()
            .iter()
            .filter_map(|player| player.get("name").and_then(Value::as_str))
            .collect();
        assert_eq!(names, vec!["Alice", "Bob", "Carol"]);
        assert_eq!(report.result.get(canonical::NUMPLAYERS), Some(&Value::from("3")));
    }
}

/// ENGINE BEHAVIOUR TESTS
mod engine_tests {
    use super::*;

    /// A single socket is enough for many servers; jobs just wait their turn
    #[tokio::test]
    async fn single_socket_pool_serves_every_server() {
        let servers: Vec<ServerDescriptor> = (0..5)
            .map(|_| source_server(PlayersReply::List, RulesReply::Plain))
            .map(|addr| descriptor("source", addr))
            .collect();

        let engine = QueryEngine::new(fast_policy().with_max_sockets(1));
        let reports = engine.run(servers.clone()).await;

        assert_eq!(reports.len(), 5);
        for (report, server) in reports.iter().zip(&servers) {
            assert_eq!(report.id, server.id());
            assert!(report.online, "{} failed: {:?}", report.id, report.failed_phases);
            assert_eq!(report.result.players().len(), 2);
        }
    }

    /// A server that drops the first request still answers on the retry
    #[tokio::test]
    async fn retry_recovers_from_a_lost_request() {
        let seen = std::sync::atomic::AtomicUsize::new(0);
        let addr = spawn_udp_server(move |request| {
            let count = seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if request == b"ROSTER?" && count > 0 {
                vec![b"ROSTER\x01alice\0".to_vec()]
            } else {
                Vec::new()
            }
        });

        let mut engine = QueryEngine::new(
            QueryPolicy::new()
                .with_timeout(Duration::from_millis(200))
                .with_retries(2),
        );
        engine.registry_mut().register("roster", roster);
        let reports = engine.run(vec![descriptor("roster", addr)]).await;
        let report = &reports[0];

        assert!(report.online);
        assert_eq!(report.status(Phase::Status), Some(PhaseStatus::Complete));
        assert_eq!(report.stats.attempts, 2);
        assert_eq!(report.stats.bytes_sent, 14);
        assert_eq!(report.result.get(canonical::NUMPLAYERS), Some(&Value::Int(1)));
    }

    /// A stream server that accepts but never answers times out on every attempt
    #[tokio::test]
    async fn tcp_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind tcp server");
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let mut open = Vec::new();
            for stream in listener.incoming().flatten() {
                open.push(stream);
            }
        });

        let mut engine = QueryEngine::new(
            QueryPolicy::new()
                .with_timeout(Duration::from_millis(150))
                .with_retries(1),
        );
        engine.registry_mut().register("banner", banner);
        let reports = engine.run(vec![descriptor("banner", addr)]).await;
        let report = &reports[0];

        assert!(!report.online);
        assert_eq!(report.status(Phase::Info), Some(PhaseStatus::TimedOut));
        assert!(matches!(
            report.failed(Phase::Info),
            Some(QueryError::SocketTimeout { attempts: 2 })
        ));
        assert_eq!(report.stats.attempts, 2);
    }

    /// Reports serialize to the JSON the command line prints
    #[tokio::test]
    async fn reports_render_as_json() {
        let addr = source_server(PlayersReply::UnknownType, RulesReply::Plain);
        let reports = QueryEngine::new(fast_policy())
            .run(vec![descriptor("source", addr).with_id("main")])
            .await;

        let json = cli::render_reports(&reports, false).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["id"], "main");
        assert_eq!(value[0]["online"], true);
        assert_eq!(value[0]["phases"]["players"], "failed");
        assert_eq!(value[0]["failed_phases"][0]["phase"], "players");
        assert_eq!(
            value[0]["failed_phases"][0]["error"],
            "response type 'ffffffff7a' is not valid"
        );
        assert_eq!(value[0]["result"]["hostname"], "Integration");
        assert!(value[0]["stats"]["bytes_received"].as_u64().unwrap() > 0);
    }
}

#[derive(Debug, Clone, Copy)]
enum PlayersReply {
    List,
    UnknownType,
}

#[derive(Debug, Clone, Copy)]
enum RulesReply {
    Plain,
    Split { reversed: bool },
}

fn fast_policy() -> QueryPolicy {
    QueryPolicy::new()
        .with_timeout(Duration::from_millis(500))
        .with_retries(1)
}

fn descriptor(protocol: &str, addr: SocketAddr) -> ServerDescriptor {
    ServerDescriptor::new(protocol, &addr.to_string()).expect("valid loopback address")
}

/// Binds a loopback UDP socket and answers each datagram with `handler`'s replies
fn spawn_udp_server<F>(handler: F) -> SocketAddr
where
    F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind fake server");
    let addr = socket.local_addr().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((len, peer)) = socket.recv_from(&mut buf) {
            for datagram in handler(&buf[..len]) {
                let _ = socket.send_to(&datagram, peer);
            }
        }
    });
    addr
}

/// Fake Source server that hands out [`TOKEN`] and ignores token-less requests
fn source_server(players: PlayersReply, rules: RulesReply) -> SocketAddr {
    spawn_udp_server(move |request| {
        if request.starts_with(b"\xFF\xFF\xFF\xFFTSource Engine Query\0") {
            return vec![details_payload()];
        }
        let token = request.get(5..9);
        match (request.get(4).copied(), token) {
            (Some(0x55), Some(t)) if t == [0xFFu8; 4] => {
                let mut reply = b"\xFF\xFF\xFF\xFFA".to_vec();
                reply.extend_from_slice(&TOKEN);
                vec![reply]
            }
            (Some(0x55), Some(t)) if t == TOKEN => match players {
                PlayersReply::List => vec![players_payload()],
                PlayersReply::UnknownType => vec![b"\xFF\xFF\xFF\xFF\x7A\x00".to_vec()],
            },
            (Some(0x56), Some(t)) if t == TOKEN => match rules {
                RulesReply::Plain => vec![rules_payload()],
                RulesReply::Split { reversed } => {
                    let mut fragments = compressed_fragments(&rules_payload(), 0x42);
                    if reversed {
                        fragments.reverse();
                    }
                    fragments
                }
            },
            _ => Vec::new(),
        }
    })
}

fn details_payload() -> Vec<u8> {
    let mut data = b"\xFF\xFF\xFF\xFFI\x11".to_vec();
    data.extend_from_slice(b"Integration\0de_inferno\0cstrike\0Counter-Strike: Source\0");
    data.extend_from_slice(&240u16.to_le_bytes());
    data.extend_from_slice(&[3, 16, 0, b'd', b'l', 0, 1]);
    data.extend_from_slice(b"1.0.0.1\0");
    data
}

fn players_payload() -> Vec<u8> {
    let mut data = b"\xFF\xFF\xFF\xFFD\x02".to_vec();
    for (index, name) in ["alice", "bob"].iter().enumerate() {
        data.push(index as u8);
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        data.extend_from_slice(&(index as i32 * 10).to_le_bytes());
        data.extend_from_slice(&12.5f32.to_le_bytes());
    }
    data
}

fn rules_payload() -> Vec<u8> {
    let mut data = b"\xFF\xFF\xFF\xFFE".to_vec();
    data.extend_from_slice(&3u16.to_le_bytes());
    data.extend_from_slice(b"sv_gravity\0800\0mp_friendlyfire\x001\0sv_tags\0alltalk,nocrits\0");
    data
}

/// Splits a bzip2-compressed payload into two Source fragments
fn compressed_fragments(payload: &[u8], group: u32) -> Vec<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(payload).unwrap();
    let packed = encoder.finish().unwrap();
    let (head, tail) = packed.split_at(packed.len() / 2);
    let group = group | 0x8000_0000;

    let header = |number: u8| {
        let mut data = b"\xFE\xFF\xFF\xFF".to_vec();
        data.extend_from_slice(&group.to_le_bytes());
        data.extend_from_slice(&[2, number]);
        data.extend_from_slice(&1248u16.to_le_bytes());
        data
    };

    let mut first = header(0);
    first.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    first.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    first.extend_from_slice(head);

    let mut second = header(1);
    second.extend_from_slice(tail);
    vec![first, second]
}

fn parse_roster(buffer: &mut Buffer, result: &mut QueryResult) -> protocol::Result<()> {
    let count = buffer.read_u8()?;
    result.add("online_count", count);
    for _ in 0..count {
        result.new_player().insert("nick", buffer.read_string()?);
    }
    Ok(())
}

fn roster() -> Protocol {
    Protocol::new("roster", "roster", Transport::Udp)
        .packet(Phase::Status, Template::new(b"ROSTER?"))
        .response(b"ROSTER", parse_roster)
        .normalize(
            Normalization::new()
                .general(canonical::NUMPLAYERS, &["online_count"])
                .player("name", &["nick"]),
        )
}

fn voice() -> Protocol {
    roster().named("voice", "Voice Server").requires_query_port()
}

fn parse_banner(buffer: &mut Buffer, result: &mut QueryResult) -> protocol::Result<()> {
    let text = String::from_utf8_lossy(buffer.remaining()).trim().to_string();
    result.add("banner", text);
    Ok(())
}

fn banner() -> Protocol {
    Protocol::new("banner", "banner", Transport::Tcp)
        .packet(Phase::Info, Template::new(b"HELLO\n"))
        .response(b"BANNER ", parse_banner)
}

