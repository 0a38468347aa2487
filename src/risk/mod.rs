pub mod metrics;
pub mod normalize;
