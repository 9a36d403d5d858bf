pub mod config;
pub mod executor;
pub mod fuzzer;
pub mod input;
pub mod mutator;
pub mod sanitizer;

pub use config::FlipperConfig;
pub use executor::{
    CommandExecutor, CommandExecutorConfig, ExecutionResult, Executor, Invocation, Termination,
};
pub use fuzzer::{
    CampaignStats, FuzzLoop, FuzzOptions, FuzzerError, InputDelivery, IterationReport,
    LogReporter, Reporter, TargetSpec, Verdict,
};
pub use input::{Input, InputBuffer};
pub use mutator::{BitFlipMutator, MutationMode, Mutator};
pub use sanitizer::{Sanitizer, SanitizerClassifier, SanitizerFinding, classify};
