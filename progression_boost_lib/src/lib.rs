pub mod checkpoint;
pub mod config;
pub mod detect;
pub mod encode;
pub mod error;
pub mod logging;
pub mod math;
pub mod metric;
pub mod pipeline;
pub mod probe;
pub mod sample;
pub mod scenes;
pub mod segment;
pub mod signal;
pub mod solver;
pub mod summarize;
pub mod vapoursynth;
pub mod zones;
