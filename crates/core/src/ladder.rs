//! Canary percentage ladder.

/// Traffic percentages a lane climbs through, in order.
pub const CANARY_LADDER: [u8; 5] = [0, 5, 25, 50, 100];

/// Full rollout.
pub const CEILING: u8 = 100;

/// Next rung above `current`.
///
/// 0→5, 5→25, 25→50, 50→100, and 100 stays at 100. A value between rungs
/// climbs to the next rung above it, so a lane can never skip one.
pub fn calculate_canary_step(current: u8) -> u8 {
    CANARY_LADDER
        .iter()
        .copied()
        .find(|&rung| rung > current)
        .unwrap_or(CEILING)
}

/// True when `percent` is one of the ladder's rungs.
pub fn is_rung(percent: u8) -> bool {
    CANARY_LADDER.contains(&percent)
}
