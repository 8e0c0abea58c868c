//! Training-turn scoring and the tile/race/rest selection policy.

pub mod evaluator;
pub mod policy;
pub mod scan;

pub use evaluator::{
    evaluate_tiles, EvalContext, GaugeColor, SupportEntry, SupportKind, TileScore, TrainingTile,
};
pub use policy::{choose_training_action, PolicyInputs, TrainingAction};
pub use scan::scan_training_screen;
