//! Quake 3 `getstatus` protocol
//!
//! One request, one reply: a `\key\value` settings line followed by one line
//! per player holding `score ping "name"`.

use crate::buffer::Buffer;
use crate::definition::Protocol;
use crate::error::{QueryError, Result};
use crate::normalize::{canonical, Normalization};
use crate::phase::{Phase, Transport};
use crate::result::QueryResult;
use crate::template::Template;

pub fn quake3() -> Protocol {
    Protocol::new("quake3", "quake3", Transport::Udp)
        .long_name("Quake 3")
        .packet(Phase::Status, Template::new(b"\xFF\xFF\xFF\xFFgetstatus\x0A"))
        .response(b"\xFF\xFF\xFF\xFFstatusResponse\x0A", parse_status)
        .normalize(
            Normalization::new()
                .general(canonical::GAMETYPE, &["g_gametype"])
                .general(canonical::HOSTNAME, &["sv_hostname", "hostname"])
                .general(canonical::MAPNAME, &["mapname"])
                .general(canonical::MAXPLAYERS, &["sv_maxclients"])
                .general(canonical::MOD, &["gamename"])
                .general(canonical::NUMPLAYERS, &["clients"])
                .general(canonical::PASSWORD, &["g_needpass", "pswrd"])
                .player("name", &["name"])
                .player("score", &["frags"])
                .player("ping", &["ping"]),
        )
}

pub fn urbanterror() -> Protocol {
    quake3().named("urbanterror", "Urban Terror")
}

fn parse_status(buffer: &mut Buffer, result: &mut QueryResult) -> Result<()> {
    let body = String::from_utf8_lossy(buffer.remaining()).into_owned();
    let mut lines = body.split('\n');

    let settings = lines.next().unwrap_or_default();
    let mut fields = settings.strip_prefix('\\').unwrap_or(settings).split('\\');
    while let Some(key) = fields.next() {
        let value = fields.next().unwrap_or_default();
        if !key.is_empty() {
            result.add(key, value);
        }
    }

    let mut clients = 0u32;
    for line in lines.map(str::trim).filter(|line| !line.is_empty()) {
        parse_player(line, result)?;
        clients += 1;
    }
    result.add("clients", clients);
    Ok(())
}

fn parse_player(line: &str, result: &mut QueryResult) -> Result<()> {
    let bad = || QueryError::malformed(format!("bad player line '{}'", line));
    let mut parts = line.splitn(3, ' ');
    let frags: i64 = parts.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
    let ping: i64 = parts.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
    let name = parts.next().unwrap_or_default().trim().trim_matches('"');

    let player = result.new_player();
    player.insert("frags", frags);
    player.insert("ping", ping);
    player.insert("name", name);
    Ok(())
}
