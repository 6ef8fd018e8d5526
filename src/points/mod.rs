//! Sparse map points: immature inverse-depth hypotheses and activated points.

pub mod hessian;
pub mod immature;
pub mod projections;

pub use hessian::{PointFrameResidual, PointHessian, PointStatus, ResState};
pub use immature::{ImmaturePoint, TemporaryResidual, TraceStatus};
