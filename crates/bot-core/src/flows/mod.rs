//! UI flows composed from Waiter operations: event dialogs, the skills shop,
//! the race day state machine, and the lobby turn driver.
//!
//! Flows never call each other; the scenario policy mediates (the Raceday
//! handler runs Skills, inspects its tri-state result, then runs Race).

pub mod event;
pub mod lobby;
pub mod race;
pub mod skills;
