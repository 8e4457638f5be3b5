//! Routing topics derived from spatial position.
//!
//! Peers are grouped into *islands*: square blocks of
//! [`ISLAND_SIZE_PARCELS`] × [`ISLAND_SIZE_PARCELS`] parcels. Everyone standing
//! on the same island shares a topic, so small movements inside an island
//! never change topic membership.

use crate::types::{Parcel, Position};

/// Parcels per island side.
pub const ISLAND_SIZE_PARCELS: i32 = 4;

/// Offset that moves the expected parcel range (-150..=150) into the
/// positive range before bucketing.
pub const PARCEL_RANGE_OFFSET: i32 = 150;

/// Largest neighbourhood radius [`island_topics`] will expand.
pub const MAX_ISLAND_RADIUS: u32 = 16;

/// Prefix for scene-scoped topics.
pub const SCENE_TOPIC_PREFIX: &str = "scene:";

/// Island cell containing `parcel`.
pub fn island_cell(parcel: Parcel) -> (i32, i32) {
    (island_axis(parcel.x), island_axis(parcel.y))
}

fn island_axis(parcel: i32) -> i32 {
    // Widened so parcels saturated at the i32 edges still bucket cleanly.
    let cell = (i64::from(parcel) + i64::from(PARCEL_RANGE_OFFSET))
        .div_euclid(i64::from(ISLAND_SIZE_PARCELS));
    cell as i32
}

fn cell_topic(cx: i32, cz: i32) -> String {
    format!("{}:{}", cx, cz)
}

/// Island topic for a world position.
pub fn position_hash(position: &Position) -> String {
    let (cx, cz) = island_cell(position.parcel());
    cell_topic(cx, cz)
}

/// The island topic for `position` followed by every neighbouring island
/// within `radius` cells, nearest ring first.
pub fn island_topics(position: &Position, radius: u32) -> Vec<String> {
    let (cx, cz) = island_cell(position.parcel());
    let r = radius.min(MAX_ISLAND_RADIUS) as i32;
    let side = 2 * r as usize + 1;
    let mut cells = Vec::with_capacity(side * side);
    for dx in -r..=r {
        for dz in -r..=r {
            cells.push((
                dx.abs().max(dz.abs()),
                cx.saturating_add(dx),
                cz.saturating_add(dz),
            ));
        }
    }
    cells.sort();
    cells
        .into_iter()
        .map(|(_, x, z)| cell_topic(x, z))
        .collect()
}

pub fn scene_topic(scene_id: &str) -> String {
    format!("{}{}", SCENE_TOPIC_PREFIX, scene_id)
}

/// Scene id for a scene topic, `None` for island topics.
pub fn scene_id_of(topic: &str) -> Option<&str> {
    topic.strip_prefix(SCENE_TOPIC_PREFIX)
}
