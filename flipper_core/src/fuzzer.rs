use crate::executor::{ExecutionResult, Executor, Invocation, Termination};
use crate::input::{Input, InputBuffer};
use crate::mutator::{BitFlipMutator, MutationMode, Mutator};
use crate::sanitizer::{SanitizerClassifier, SanitizerFinding};
use log::{debug, info, trace, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::io::Write;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use thiserror::Error;

const PREVIEW_BYTES: usize = 16;
/// Placeholder replaced by the input file path in `InputDelivery::File` templates.
pub const FILE_PLACEHOLDER: &str = "{}";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FuzzerError {
    #[error("iteration count must be a positive integer")]
    ZeroIterations,
    #[error("target command is empty, argv[0] must name the program")]
    EmptyCommand,
}

/// How the fuzzed bytes reach the target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InputDelivery {
    /// Appended as the last argument, with an empty stdin. The argument is
    /// cut at the first NUL byte.
    #[default]
    Argument,
    /// Written to standard input, argv stays fixed.
    Stdin,
    /// Written to a temporary file whose path replaces `{}` in the template,
    /// which is appended as the last argument.
    File { template: String },
}

/// The program under test and how to feed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// `command[0]` is the program path and also its `argv[0]`.
    pub command: Vec<String>,
    pub delivery: InputDelivery,
    pub env: Option<BTreeMap<String, String>>,
}

impl TargetSpec {
    pub fn new(command: Vec<String>, delivery: InputDelivery) -> Self {
        Self {
            command,
            delivery,
            env: None,
        }
    }

    fn program(&self) -> PathBuf {
        PathBuf::from(&self.command[0])
    }

    /// Builds the invocation for `input`. The returned temp file, if any, must
    /// outlive the execution.
    fn invocation_for(
        &self,
        input: &InputBuffer,
    ) -> std::io::Result<(Invocation, Option<NamedTempFile>)> {
        let mut invocation = Invocation::new(self.program(), self.command.iter());
        invocation.env = self.env.clone();

        let temp_file = match &self.delivery {
            InputDelivery::Argument => {
                // An argument ends at the first NUL, as it would for execve.
                let bytes = input.as_bytes();
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                invocation.argv.push(OsString::from_vec(bytes[..end].to_vec()));
                None
            }
            InputDelivery::Stdin => {
                invocation.stdin = input.as_bytes().to_vec();
                None
            }
            InputDelivery::File { template } => {
                let mut file = NamedTempFile::new()?;
                file.write_all(input.as_bytes())?;
                file.flush()?;
                let path = file.path().to_string_lossy().into_owned();
                invocation.argv.push(template.replace(FILE_PLACEHOLDER, &path).into());
                Some(file)
            }
        };
        Ok((invocation, temp_file))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzOptions {
    pub iterations: u64,
    pub mutation_mode: MutationMode,
    /// Seed for the mutation generator. `None` draws a fresh one, which is
    /// logged so the run can be replayed.
    pub rng_seed: Option<u64>,
}

impl Default for FuzzOptions {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            mutation_mode: MutationMode::default(),
            rng_seed: None,
        }
    }
}

pub fn default_iterations() -> u64 {
    100
}

/// Overall classification of one iteration, strongest signal first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verdict {
    HarnessFailure,
    ExecFailure,
    SanitizerDetected,
    Signaled,
    TimedOut,
    NonZeroExit,
    Clean,
}

impl Verdict {
    pub fn derive(result: &ExecutionResult, finding: &SanitizerFinding) -> Self {
        match result.termination {
            Termination::HarnessFailure => Verdict::HarnessFailure,
            Termination::ExecFailure => Verdict::ExecFailure,
            _ if finding.detected => Verdict::SanitizerDetected,
            Termination::Signaled(_) => Verdict::Signaled,
            Termination::TimedOut => Verdict::TimedOut,
            Termination::Exited(0) => Verdict::Clean,
            Termination::Exited(_) => Verdict::NonZeroExit,
        }
    }

    /// Whether this outcome points at a possible defect in the target.
    pub fn is_interesting(self) -> bool {
        matches!(
            self,
            Verdict::SanitizerDetected | Verdict::Signaled | Verdict::TimedOut | Verdict::NonZeroExit
        )
    }
}

/// Everything known about one iteration.
#[derive(Debug, Clone)]
pub struct IterationReport {
    /// 1-based.
    pub iteration: u64,
    pub input: InputBuffer,
    /// MD5 of the input bytes, the key a future crash store would use.
    pub input_digest: String,
    pub result: ExecutionResult,
    pub finding: SanitizerFinding,
    pub verdict: Verdict,
}

impl IterationReport {
    /// First bytes of the input, printable ASCII verbatim and `\xNN` otherwise.
    pub fn preview(&self) -> String {
        preview_bytes(self.input.as_bytes())
    }
}

pub fn preview_bytes(bytes: &[u8]) -> String {
    let mut preview = String::new();
    for &byte in bytes.iter().take(PREVIEW_BYTES) {
        if byte.is_ascii_graphic() || byte == b' ' {
            preview.push(byte as char);
        } else {
            preview.push_str(&format!("\\x{byte:02x}"));
        }
    }
    if bytes.len() > PREVIEW_BYTES {
        preview.push_str("...");
    }
    preview
}

/// Totals for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignStats {
    pub iterations: u64,
    pub verdicts: HashMap<Verdict, u64>,
    pub elapsed: Duration,
}

impl CampaignStats {
    pub fn count(&self, verdict: Verdict) -> u64 {
        self.verdicts.get(&verdict).copied().unwrap_or_default()
    }

    pub fn interesting(&self) -> u64 {
        self.verdicts
            .iter()
            .filter(|(verdict, _)| verdict.is_interesting())
            .map(|(_, count)| count)
            .sum()
    }

    fn record(&mut self, verdict: Verdict) {
        self.iterations += 1;
        *self.verdicts.entry(verdict).or_default() += 1;
    }
}

/// Receives every iteration's outcome. Nothing is filtered or deduplicated.
pub trait Reporter {
    fn report(&mut self, report: &IterationReport);

    fn finish(&mut self, _stats: &CampaignStats) {}
}

/// Writes reports through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, report: &IterationReport) {
        let result = &report.result;
        debug!(
            "[Iteration {}] input {} ({} bytes): {} -> exit code {} ({})",
            report.iteration,
            report.input_digest,
            report.input.len(),
            report.preview(),
            result.exit_code,
            if result.success { "success" } else { "failure" },
        );
        if !result.stdout.is_empty() {
            trace!("stdout:\n{}", result.stdout_lossy());
        }
        if !result.stderr.is_empty() {
            trace!("stderr:\n{}", result.stderr_lossy());
        }

        match report.verdict {
            Verdict::SanitizerDetected => {
                let finding = &report.finding;
                info!(
                    "[Iteration {}] SANITIZER ISSUE: {} {} (input {})",
                    report.iteration,
                    finding.sanitizer_name(),
                    finding.error_kind,
                    report.input_digest
                );
                if !finding.evidence.is_empty() {
                    info!("  key line: {}", finding.evidence);
                }
            }
            Verdict::Signaled | Verdict::TimedOut | Verdict::NonZeroExit => info!(
                "[Iteration {}] potential error: {:?}, exit code {} (input {})",
                report.iteration, report.verdict, result.exit_code, report.input_digest
            ),
            Verdict::HarnessFailure | Verdict::ExecFailure => warn!(
                "[Iteration {}] {:?}: {}",
                report.iteration,
                report.verdict,
                result.stderr_lossy().trim_end()
            ),
            Verdict::Clean => {}
        }
    }

    fn finish(&mut self, stats: &CampaignStats) {
        info!(
            "Fuzzing completed: {} iterations in {:.2?}, {} interesting",
            stats.iterations,
            stats.elapsed,
            stats.interesting()
        );
    }
}

/// Drives `Seed -> {Mutate -> Execute -> Classify -> Report} x N`.
///
/// The loop owns the evolving buffer and the generator but no OS resources;
/// running the target is delegated to an `Executor`.
pub struct FuzzLoop<M: Mutator = BitFlipMutator> {
    target: TargetSpec,
    seed: InputBuffer,
    options: FuzzOptions,
    mutator: M,
    classifier: SanitizerClassifier,
    rng: ChaCha8Rng,
    rng_seed: u64,
}

impl FuzzLoop<BitFlipMutator> {
    pub fn new(
        target: TargetSpec,
        seed: InputBuffer,
        options: FuzzOptions,
    ) -> Result<Self, FuzzerError> {
        Self::with_mutator(target, seed, options, BitFlipMutator)
    }
}

impl<M: Mutator> FuzzLoop<M> {
    pub fn with_mutator(
        target: TargetSpec,
        seed: InputBuffer,
        options: FuzzOptions,
        mutator: M,
    ) -> Result<Self, FuzzerError> {
        if options.iterations == 0 {
            return Err(FuzzerError::ZeroIterations);
        }
        if target.command.first().is_none_or(|program| program.is_empty()) {
            return Err(FuzzerError::EmptyCommand);
        }
        let rng_seed = options.rng_seed.unwrap_or_else(rand::random);
        Ok(Self {
            target,
            seed,
            options,
            mutator,
            classifier: SanitizerClassifier::default(),
            rng: ChaCha8Rng::seed_from_u64(rng_seed),
            rng_seed,
        })
    }

    pub fn with_classifier(mut self, classifier: SanitizerClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// The generator seed in use; pass it back through `FuzzOptions::rng_seed`
    /// to replay this run.
    pub fn rng_seed(&self) -> u64 {
        self.rng_seed
    }

    pub fn run<E, R>(&mut self, executor: &mut E, reporter: &mut R) -> CampaignStats
    where
        E: Executor + ?Sized,
        R: Reporter + ?Sized,
    {
        info!(
            "Starting fuzzing on target: {} for {} iterations ({:?}, mutator {}, rng seed {})",
            self.target.command[0],
            self.options.iterations,
            self.options.mutation_mode,
            self.mutator.name(),
            self.rng_seed
        );
        let started = Instant::now();
        let mut stats = CampaignStats::default();
        let mut current = self.seed.clone();

        for iteration in 1..=self.options.iterations {
            if self.options.mutation_mode == MutationMode::SeedRelative {
                current.clone_from(&self.seed);
            }
            self.mutator.mutate(&mut current, &mut self.rng);

            let report = self.run_iteration(iteration, &current, &mut *executor);
            stats.record(report.verdict);
            reporter.report(&report);
        }

        stats.elapsed = started.elapsed();
        reporter.finish(&stats);
        stats
    }

    fn run_iteration<E>(
        &self,
        iteration: u64,
        input: &InputBuffer,
        executor: &mut E,
    ) -> IterationReport
    where
        E: Executor + ?Sized,
    {
        let result = match self.target.invocation_for(input) {
            Ok((invocation, _temp_file)) => executor.execute(&invocation),
            Err(e) => ExecutionResult::harness_failure(format!(
                "Failed to prepare input file: {e}\n"
            )),
        };
        let finding = self.classifier.classify_bytes(&result.stderr);
        let verdict = Verdict::derive(&result, &finding);

        IterationReport {
            iteration,
            input_digest: input.digest(),
            input: input.clone(),
            result,
            finding,
            verdict,
        }
    }
}
