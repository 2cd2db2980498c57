mod engine;
mod postprocessing;

#[cfg(test)]
mod engine_tests;

pub use engine::DfsEngine;
pub use postprocessing::Postprocessing;
