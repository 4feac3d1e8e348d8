//! Valve A2S query protocol (Source and GoldSource engines)
//!
//! Every datagram starts with a 32-bit little-endian header: `-1` for a whole
//! payload, `-2` for one fragment of a split payload. Source fragments carry
//! the fragment count and number in separate bytes and may be bzip2 compressed
//! (top bit of the group id); GoldSource packs both into one byte.
//!
//! Players and rules need a challenge token, which the server hands out in an
//! `A` reply to a player request carrying `-1` as its token.

use crate::buffer::Buffer;
use crate::definition::{Protocol, SplitFn};
use crate::error::{QueryError, Result};
use crate::normalize::{canonical, Normalization};
use crate::phase::{Phase, Transport};
use crate::reassembly::{is_compressed, CompressionHeader, Datagram, Fragment};
use crate::result::QueryResult;
use crate::template::Template;

const WHOLE: i32 = -1;
const SPLIT: i32 = -2;

const A2S_INFO: &[u8] = b"\xFF\xFF\xFF\xFFTSource Engine Query\x00";
const A2S_PLAYER: &[u8] = b"\xFF\xFF\xFF\xFF\x55";
const A2S_RULES: &[u8] = b"\xFF\xFF\xFF\xFF\x56";
const S2C_CHALLENGE: &[u8] = b"\xFF\xFF\xFF\xFFA";

const THE_SHIP_APPID: u16 = 2400;

/// Source engine servers
pub fn source() -> Protocol {
    base("source", "Source Engine", split)
}

/// GoldSource (Half-Life 1) servers
pub fn halflife() -> Protocol {
    base("halflife", "Half-Life", split_goldsource)
}

pub fn css() -> Protocol {
    source().named("css", "Counter-Strike: Source")
}

pub fn csgo() -> Protocol {
    source().named("csgo", "Counter-Strike: Global Offensive")
}

pub fn tf2() -> Protocol {
    source().named("tf2", "Team Fortress 2")
}

pub fn gmod() -> Protocol {
    source().named("gmod", "Garry's Mod")
}

/// Arma 3 answers A2S on the game port plus one
pub fn arma3() -> Protocol {
    source().named("arma3", "Arma3").port_diff(1)
}

fn base(name: &'static str, long_name: &'static str, split: SplitFn) -> Protocol {
    Protocol::new(name, "source", Transport::Udp)
        .long_name(long_name)
        .join_link("steam://connect/{ip}:{port}/")
        .packet(Phase::Details, Template::new(A2S_INFO))
        .packet(Phase::Players, Template::new(A2S_PLAYER).then_challenge())
        .packet(Phase::Rules, Template::new(A2S_RULES).then_challenge())
        .challenge(
            Template::new(A2S_PLAYER).then_bytes(b"\xFF\xFF\xFF\xFF"),
            parse_challenge,
        )
        .response(b"\xFF\xFF\xFF\xFFI", parse_details)
        .response(b"\xFF\xFF\xFF\xFFm", parse_details_goldsource)
        .response(b"\xFF\xFF\xFF\xFFD", parse_players)
        .response(b"\xFF\xFF\xFF\xFFE", parse_rules)
        .split(split)
        .normalize(
            Normalization::new()
                .general(canonical::DEDICATED, &["dedicated"])
                .general(canonical::GAMETYPE, &["game_descr"])
                .general(canonical::HOSTNAME, &["hostname"])
                .general(canonical::MAPNAME, &["map"])
                .general(canonical::MAXPLAYERS, &["max_players"])
                .general(canonical::MOD, &["game_dir"])
                .general(canonical::NUMPLAYERS, &["num_players"])
                .general(canonical::PASSWORD, &["password"])
                .player("name", &["name"])
                .player("score", &["score"])
                .player("time", &["time"]),
        )
}

fn parse_challenge(buffer: &mut Buffer) -> Result<Vec<u8>> {
    let header = buffer.read(S2C_CHALLENGE.len())?;
    if header != S2C_CHALLENGE {
        return Err(QueryError::ChallengeFailed(format!(
            "unexpected reply {}",
            hex::encode(header)
        )));
    }
    buffer.read(4)
}

/// Split header for Source engine servers
pub fn split(packet: &[u8]) -> Result<Datagram> {
    let mut buffer = Buffer::new(packet);
    match buffer.read_i32()? {
        WHOLE => Ok(Datagram::Whole(packet.to_vec())),
        SPLIT => {
            let group = buffer.read_u32()?;
            let total = buffer.read_u8()?;
            let number = buffer.read_u8()?;
            // maximum fragment size, unused
            buffer.skip(2)?;

            let compression = if is_compressed(group) && number == 0 {
                let decompressed_len = buffer.read_u32()?;
                let crc32 = buffer.read_u32()?;
                Some(CompressionHeader {
                    decompressed_len,
                    crc32: Some(crc32),
                })
            } else {
                None
            };

            Ok(Datagram::Fragment(Fragment {
                group,
                number: u32::from(number),
                total: Some(u32::from(total)),
                compression,
                payload: buffer.into_remaining(),
            }))
        }
        other => Err(QueryError::malformed(format!(
            "unknown packet header {:#010x}",
            other
        ))),
    }
}

/// Split header for GoldSource servers: number in the high nibble, total in the low one
pub fn split_goldsource(packet: &[u8]) -> Result<Datagram> {
    let mut buffer = Buffer::new(packet);
    match buffer.read_i32()? {
        WHOLE => Ok(Datagram::Whole(packet.to_vec())),
        SPLIT => {
            let group = buffer.read_u32()?;
            let packed = buffer.read_u8()?;
            Ok(Datagram::Fragment(Fragment {
                group,
                number: u32::from(packed >> 4),
                total: Some(u32::from(packed & 0x0F)),
                compression: None,
                payload: buffer.into_remaining(),
            }))
        }
        other => Err(QueryError::malformed(format!(
            "unknown packet header {:#010x}",
            other
        ))),
    }
}

fn read_char(buffer: &mut Buffer) -> Result<String> {
    Ok(char::from(buffer.read_u8()?).to_string())
}

fn parse_details(buffer: &mut Buffer, result: &mut QueryResult) -> Result<()> {
    result.add("protocol", buffer.read_u8()?);
    result.add("hostname", buffer.read_string()?);
    result.add("map", buffer.read_string()?);
    result.add("game_dir", buffer.read_string()?);
    result.add("game_descr", buffer.read_string()?);
    let appid = buffer.read_u16()?;
    result.add("steamappid", appid);
    result.add("num_players", buffer.read_u8()?);
    result.add("max_players", buffer.read_u8()?);
    result.add("num_bots", buffer.read_u8()?);
    result.add("dedicated", read_char(buffer)?);
    result.add("os", read_char(buffer)?);
    result.add("password", buffer.read_u8()?);
    result.add("secure", buffer.read_u8()?);

    if appid == THE_SHIP_APPID {
        result.add("game_mode", buffer.read_u8()?);
        result.add("witness_count", buffer.read_u8()?);
        result.add("witness_time", buffer.read_u8()?);
    }

    result.add("version", buffer.read_string()?);

    // extra data flag, absent on old servers
    if buffer.remaining_length() == 0 {
        return Ok(());
    }
    let edf = buffer.read_u8()?;
    if edf & 0x80 != 0 {
        result.add("port", buffer.read_u16()?);
    }
    if edf & 0x10 != 0 {
        result.add("steam_id", buffer.read_u64()?);
    }
    if edf & 0x40 != 0 {
        result.add("sourcetv_port", buffer.read_u16()?);
        result.add("sourcetv_name", buffer.read_string()?);
    }
    if edf & 0x20 != 0 {
        result.add("keywords", buffer.read_string()?);
    }
    if edf & 0x01 != 0 {
        result.add("game_id", buffer.read_u64()?);
    }
    Ok(())
}

fn parse_details_goldsource(buffer: &mut Buffer, result: &mut QueryResult) -> Result<()> {
    result.add("address", buffer.read_string()?);
    result.add("hostname", buffer.read_string()?);
    result.add("map", buffer.read_string()?);
    result.add("game_dir", buffer.read_string()?);
    result.add("game_descr", buffer.read_string()?);
    result.add("num_players", buffer.read_u8()?);
    result.add("max_players", buffer.read_u8()?);
    result.add("protocol", buffer.read_u8()?);
    result.add("dedicated", read_char(buffer)?);
    result.add("os", read_char(buffer)?);
    result.add("password", buffer.read_u8()?);

    let is_mod = buffer.read_u8()?;
    result.add("ismod", is_mod);
    if is_mod == 1 {
        result.add("mod_urlinfo", buffer.read_string()?);
        result.add("mod_urldl", buffer.read_string()?);
        buffer.skip(1)?;
        result.add("mod_version", buffer.read_i32()?);
        result.add("mod_size", buffer.read_i32()?);
        result.add("mod_type", buffer.read_u8()?);
        result.add("mod_cldll", buffer.read_u8()?);
    }

    result.add("secure", buffer.read_u8()?);
    result.add("num_bots", buffer.read_u8()?);
    Ok(())
}

fn parse_players(buffer: &mut Buffer, result: &mut QueryResult) -> Result<()> {
    // declared count, can disagree with the entries that follow
    buffer.read_u8()?;

    while buffer.remaining_length() > 0 {
        let player = result.new_player();
        player.insert("id", buffer.read_u8()?);
        player.insert("name", buffer.read_string()?);
        player.insert("score", buffer.read_i32()?);
        player.insert("time", buffer.read_f32()?);
    }
    Ok(())
}

fn parse_rules(buffer: &mut Buffer, result: &mut QueryResult) -> Result<()> {
    result.add("num_rules", buffer.read_u16()?);

    while buffer.remaining_length() > 0 {
        let key = buffer.read_string()?;
        let value = buffer.read_string()?;
        result.add(key, value);
    }
    Ok(())
}
