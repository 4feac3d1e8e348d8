//! Alias tables that map protocol-specific field names onto a shared schema

use crate::result::{QueryResult, Record};

/// Canonical general fields every bundled definition maps onto
pub mod canonical {
    pub const DEDICATED: &str = "dedicated";
    pub const GAMETYPE: &str = "gametype";
    pub const HOSTNAME: &str = "hostname";
    pub const MAPNAME: &str = "mapname";
    pub const MAXPLAYERS: &str = "maxplayers";
    pub const MOD: &str = "mod";
    pub const NUMPLAYERS: &str = "numplayers";
    pub const PASSWORD: &str = "password";
}

type AliasTable = Vec<(&'static str, Vec<&'static str>)>;

/// Per-definition alias tables for general settings, players and teams
///
/// Each canonical name lists the source fields to try in order; the first one
/// present is copied under the canonical name. Source fields stay in place, so
/// protocol-specific extras survive normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalization {
    general: AliasTable,
    player: AliasTable,
    team: AliasTable,
}

impl Normalization {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn general(mut self, canonical: &'static str, aliases: &[&'static str]) -> Self {
        self.general.push((canonical, aliases.to_vec()));
        self
    }

    pub fn player(mut self, canonical: &'static str, aliases: &[&'static str]) -> Self {
        self.player.push((canonical, aliases.to_vec()));
        self
    }

    pub fn team(mut self, canonical: &'static str, aliases: &[&'static str]) -> Self {
        self.team.push((canonical, aliases.to_vec()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.general.is_empty() && self.player.is_empty() && self.team.is_empty()
    }

    /// Applies the tables once, producing the canonical record
    pub fn apply(&self, result: &QueryResult) -> QueryResult {
        let general = apply_table(&self.general, result.general());
        let players = result
            .players()
            .iter()
            .map(|player| apply_table(&self.player, player))
            .collect();
        let teams = result
            .teams()
            .iter()
            .map(|team| apply_table(&self.team, team))
            .collect();

        QueryResult::from_parts(general, players, teams)
    }
}

fn apply_table(table: &AliasTable, source: &Record) -> Record {
    let mut out = source.clone();
    for (canonical, aliases) in table {
        if let Some(value) = aliases.iter().find_map(|alias| source.get(alias)) {
            out.insert(*canonical, value.clone());
        }
    }
    out
}
