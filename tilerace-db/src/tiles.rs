//! The static tile catalogue.

use crate::models::{EffectTrigger, Matter, Tile, TileEffect};
use EffectTrigger::{Any, Bump, Init};
use Matter::{Air, Stone};

type TileRow = (
    &'static str,
    Matter,
    bool,
    f32,
    &'static [(EffectTrigger, &'static str)],
);

const CATALOGUE: &[TileRow] = &[
    ("Air", Air, false, 1.0, &[]),
    ("Stone", Stone, true, 1.0, &[]),
    ("Bad Stone", Stone, false, 1.0, &[(Bump, "break")]),
    ("Spawn", Air, false, 1.0, &[]),
    ("Vanish", Stone, false, 1.0, &[(Any, "vanish")]),
    ("Finish", Stone, true, 1.0, &[(Bump, "finish")]),
    ("Ice", Stone, true, 0.1, &[]),
    ("Chocolate", Stone, true, 3.0, &[]),
    ("Left", Stone, true, 1.0, &[(Any, "boost_left")]),
    ("Right", Stone, true, 1.0, &[(Any, "boost_right")]),
    ("Up", Stone, true, 1.0, &[(Any, "boost_up")]),
    ("Down", Stone, true, 1.0, &[(Any, "boost_down")]),
    ("Teleport", Stone, false, 1.0, &[(Any, "teleport")]),
    ("Crumble", Stone, false, 1.0, &[(Any, "crumble")]),
    ("Push", Stone, false, 1.0, &[(Any, "push")]),
    ("Net", Stone, false, 1.0, &[(Any, "respawn")]),
    (
        "Mine",
        Stone,
        false,
        1.0,
        &[(Any, "break"), (Any, "launch"), (Any, "stun")],
    ),
    ("Move", Stone, false, 2.0, &[(Init, "wander")]),
];

/// Build the tile catalogue. Tile ids and atlas columns follow catalogue order.
pub fn catalogue() -> Vec<Tile> {
    CATALOGUE
        .iter()
        .enumerate()
        .map(|(index, &(name, matter, safe, friction, effects))| Tile {
            id: index as u32,
            name,
            atlas_x: index as u32,
            atlas_y: 0,
            matter,
            safe,
            friction,
            listed: true,
            effects: effects
                .iter()
                .map(|&(trigger, effect)| TileEffect { trigger, effect })
                .collect(),
        })
        .collect()
}
