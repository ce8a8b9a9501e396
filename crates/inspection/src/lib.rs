//! Real-time roller inspection.
//!
//! Frames from several cameras are queued for inference, combined per roller
//! into a single ACCEPT / REJECT / INCONCLUSIVE verdict, and turned into a
//! reject command that reaches the PLC before the roller reaches the
//! actuator. [`InspectionCoordinator`] owns the whole pipeline; cameras, the
//! detector, the PLC, and the record store are injected through
//! [`LineAdapters`].

pub mod pipeline;

pub use pipeline::*;
