use crate::input::InputBuffer;
use rand_core::RngCore;
use serde::Deserialize;

/// A `Mutator` perturbs an `InputBuffer` in place.
///
/// The random generator is always passed in by the caller, never held by the
/// mutator, so one seed drives every random decision of a run.
pub trait Mutator: Send {
    /// Short identifier used in log output.
    fn name(&self) -> &'static str;

    /// Applies one mutation step to `input`. Must not change `input.len()`.
    fn mutate(&mut self, input: &mut InputBuffer, rng: &mut dyn RngCore);
}

/// Flips a single random bit per step. See [`InputBuffer::mutate`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BitFlipMutator;

impl Mutator for BitFlipMutator {
    fn name(&self) -> &'static str {
        "BitFlipMutator"
    }

    fn mutate(&mut self, input: &mut InputBuffer, rng: &mut dyn RngCore) {
        input.mutate(rng);
    }
}

/// What the mutator is applied to at the start of each iteration.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MutationMode {
    /// Keep mutating the buffer produced by the previous iteration. Drift from
    /// the seed grows without bound over a long run.
    #[default]
    Cumulative,
    /// Restart from a fresh copy of the seed every iteration, so each input is
    /// exactly one mutation step away from it.
    SeedRelative,
}
