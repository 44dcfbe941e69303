//! Weighted Consensus Engine
//! Mission: Many opinions in, at most one committed signal out

mod calibration;
mod engine;

pub use calibration::{CalibrationCurve, CalibratorHandle};
pub use engine::{
    live_signal_id, ConsensusEngine, ConsensusOutcome, NoSignalReason, SignalDraft, TrackWeights,
};
