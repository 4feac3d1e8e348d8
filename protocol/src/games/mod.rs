//! Bundled protocol definitions

pub mod gamespy3;
pub mod quake3;
pub mod source;

use crate::registry::Constructor;

/// Every bundled definition under its registry id
pub fn builtin() -> Vec<(&'static str, Constructor)> {
    vec![
        ("source", source::source as Constructor),
        ("halflife", source::halflife),
        ("css", source::css),
        ("csgo", source::csgo),
        ("tf2", source::tf2),
        ("gmod", source::gmod),
        ("arma3", source::arma3),
        ("quake3", quake3::quake3),
        ("urbanterror", quake3::urbanterror),
        ("gamespy3", gamespy3::gamespy3),
    ]
}
