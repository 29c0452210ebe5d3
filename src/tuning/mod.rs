pub mod engine;
pub mod sandbox;

pub use engine::{
    run_and_persist_tuning, tune_strategy, CandidateRunner, TuneRequest, TuningConstraints,
};
pub use sandbox::SandboxCandidateRunner;
