//! Persistent cross-turn memories owned by the agent loop.
//!
//! Writes are write-through: every mutation that matters lands on disk before
//! the tick continues, so a mid-career restart cannot double-buy a skill or
//! forget a PAL chain.

pub mod pal;
pub mod planned;
pub mod skill;

pub use pal::PalMemory;
pub use planned::PlannedRaceIndex;
pub use skill::SkillMemory;
