//! GameSpy 3 query protocol
//!
//! A challenge round (`FE FD 09`) returns an ASCII number that is sent back as
//! a big-endian 32-bit integer with the full query. Large replies come in
//! `splitnum` fragments whose last one carries the high bit; fragment borders
//! may cut a player record in half, hence the de-duplicating join.

use crate::buffer::{Buffer, Endian};
use crate::definition::Protocol;
use crate::error::{QueryError, Result};
use crate::normalize::{canonical, Normalization};
use crate::phase::{Phase, Transport};
use crate::reassembly::{join_deduplicated, Datagram, Fragment};
use crate::result::{QueryResult, SubGroup};
use crate::template::Template;

const SESSION_MASK: u32 = 0x0F0F_0F0F;
const SPLITNUM: &[u8] = b"splitnum\x00";
const LAST_FRAGMENT: u8 = 0x80;

pub fn gamespy3() -> Protocol {
    let session = (rand::random::<u32>() & SESSION_MASK).to_be_bytes();

    Protocol::new("gamespy3", "gamespy3", Transport::Udp)
        .long_name("GameSpy3")
        .endian(Endian::Big)
        .challenge(
            Template::new(&[0xFE, 0xFD, 0x09]).then_bytes(&session),
            parse_challenge,
        )
        .packet(
            Phase::All,
            Template::new(&[0xFE, 0xFD, 0x00])
                .then_bytes(&session)
                .then_challenge()
                .then_bytes(&[0xFF, 0xFF, 0xFF, 0x01]),
        )
        .split(split)
        .join(join_deduplicated)
        .response(b"", parse_all)
        .normalize(
            Normalization::new()
                .general(canonical::GAMETYPE, &["gametype"])
                .general(canonical::HOSTNAME, &["hostname"])
                .general(canonical::MAPNAME, &["mapname"])
                .general(canonical::MAXPLAYERS, &["maxplayers"])
                .general(canonical::MOD, &["game_id"])
                .general(canonical::NUMPLAYERS, &["numplayers"])
                .general(canonical::PASSWORD, &["password"])
                .player("name", &["player"])
                .player("score", &["score"])
                .player("ping", &["ping"])
                .team("name", &["team"])
                .team("score", &["score"]),
        )
}

/// Strips the type byte and session id; fragments also lose their `splitnum` header
fn split(packet: &[u8]) -> Result<Datagram> {
    let mut buffer = Buffer::with_endian(packet, Endian::Big);
    buffer.skip(5)?;

    if !buffer.remaining().starts_with(SPLITNUM) {
        return Ok(Datagram::Whole(buffer.into_remaining()));
    }
    buffer.skip(SPLITNUM.len())?;
    let id = buffer.read_u8()?;
    // section number
    buffer.skip(1)?;

    let number = u32::from(id & !LAST_FRAGMENT);
    Ok(Datagram::Fragment(Fragment {
        group: 0,
        number,
        total: (id & LAST_FRAGMENT != 0).then_some(number + 1),
        compression: None,
        payload: buffer.into_remaining(),
    }))
}

fn parse_challenge(buffer: &mut Buffer) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(buffer.remaining()).into_owned();
    let digits = text.trim_end_matches('\0').trim();
    let value: i64 = digits
        .parse()
        .map_err(|_| QueryError::ChallengeFailed(format!("bad challenge '{}'", digits)))?;
    Ok((value as u32).to_be_bytes().to_vec())
}

/// Reads up to the next NUL, or to the end when there is none
fn read_field(buffer: &mut Buffer) -> Result<String> {
    if buffer.remaining().contains(&0) {
        buffer.read_string()
    } else {
        let rest = buffer.read(buffer.remaining_length())?;
        Ok(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn parse_all(buffer: &mut Buffer, result: &mut QueryResult) -> Result<()> {
    while buffer.remaining_length() > 0 {
        let key = read_field(buffer)?;
        if key.is_empty() {
            break;
        }
        let value = read_field(buffer)?;
        result.add(key, value);
    }

    parse_players_and_teams(buffer.remaining(), result);
    Ok(())
}

/// Column-oriented player and team sections
///
/// The data is cut at every `\0\0`: a piece ending in `_` opens a player
/// column (`player_`, `score_`), one ending in `_t` a team column, and the
/// piece after it lists the column values. The final piece is trailing padding.
fn parse_players_and_teams(data: &[u8], result: &mut QueryResult) {
    let items = explode(data, b"\x00\x00");
    let mut group = None;
    let mut column = String::new();

    for item in &items[..items.len().saturating_sub(1)] {
        if item.is_empty() || *item == b"\x00" {
            continue;
        }

        if item.ends_with(b"_") {
            group = Some(SubGroup::Players);
            let name: Vec<u8> = item.iter().copied().filter(|b| *b != 0x01).collect();
            column = String::from_utf8_lossy(&name).trim_end_matches('_').to_string();
        } else if item.ends_with(b"_t") {
            group = Some(SubGroup::Teams);
            let name: Vec<u8> = item
                .iter()
                .copied()
                .filter(|b| *b != 0x00 && *b != 0x02)
                .collect();
            column = String::from_utf8_lossy(&name)
                .trim_end_matches(|c: char| c == '_' || c == 't')
                .to_string();
        } else if let Some(group) = group {
            for value in item.split(|b| *b == 0) {
                if value.is_empty() {
                    break;
                }
                let value = String::from_utf8_lossy(value);
                result.add_column(group, column.as_str(), value.trim());
            }
        }
    }
}

fn explode<'a>(data: &'a [u8], separator: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + separator.len() <= data.len() {
        if data[i..].starts_with(separator) {
            parts.push(&data[start..i]);
            i += separator.len();
            start = i;
        } else {
            i += 1;
        }
    }
    parts.push(&data[start..]);
    parts
}
