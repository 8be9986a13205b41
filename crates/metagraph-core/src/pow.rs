//! Proof-of-work admission control for synapse records
//!
//! The proof is the synapse digest itself. The required number of leading
//! zero bits grows with the age of the record's block anchor, so an attacker
//! cannot stockpile cheap records against an old anchor; past
//! `max_block_age` the anchor is refused outright.

use crate::crypto::{leading_zero_bits, synapse_digest};
use crate::error::{Error, Result};
use crate::types::Synapse;
use serde::{Deserialize, Serialize};

/// Upper bound on any difficulty (digest width in bits)
pub const MAX_DIFFICULTY_BITS: u32 = 256;

/// Difficulty schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyParams {
    /// Bits required for an anchor of age zero
    pub base_bits: u32,
    /// Extra bits per elapsed step
    pub bits_per_step: u32,
    /// Blocks per step (at least 1)
    pub step_blocks: u64,
    /// Oldest acceptable anchor, in blocks
    pub max_block_age: u64,
}

impl Default for DifficultyParams {
    fn default() -> Self {
        Self {
            base_bits: 12,
            bits_per_step: 1,
            step_blocks: 10,
            max_block_age: 100,
        }
    }
}

impl DifficultyParams {
    /// Required leading zero bits for an anchor `age` blocks old.
    ///
    /// Non-decreasing in `age`, capped at [`MAX_DIFFICULTY_BITS`].
    pub fn required_bits(&self, age: u64) -> u32 {
        let steps = age / self.step_blocks.max(1);
        let extra = steps.saturating_mul(self.bits_per_step as u64);
        (self.base_bits as u64)
            .saturating_add(extra)
            .min(MAX_DIFFICULTY_BITS as u64) as u32
    }

    /// Difficulty demanded at the oldest admissible age
    pub fn max_required_bits(&self) -> u32 {
        self.required_bits(self.max_block_age)
    }
}

/// Validates synapse proofs against caller-supplied chain heights
#[derive(Clone, Debug, Default)]
pub struct ProofOfWorkValidator {
    params: DifficultyParams,
}

impl ProofOfWorkValidator {
    pub fn new(params: DifficultyParams) -> Self {
        Self { params }
    }

    /// Validate a record's proof of work.
    ///
    /// Returns the achieved leading zero bits on success.
    pub fn validate(&self, record: &Synapse, current_height: u64, anchor_height: u64) -> Result<u32> {
        let age = current_height.saturating_sub(anchor_height);
        if age > self.params.max_block_age {
            return Err(Error::StaleBlockReference(format!(
                "anchor {} is {} blocks old (max {})",
                record.block_hash, age, self.params.max_block_age
            )));
        }
        self.check_work(record, self.params.required_bits(age))
    }

    /// Check the digest equality and the difficulty without any age logic.
    pub fn check_work(&self, record: &Synapse, required: u32) -> Result<u32> {
        let digest = synapse_digest(record)?;
        if digest != record.proof_of_work {
            return Err(Error::InvalidProofOfWork {
                required,
                achieved: 0,
            });
        }

        let achieved = leading_zero_bits(&digest);
        if achieved < required {
            return Err(Error::InvalidProofOfWork { required, achieved });
        }
        Ok(achieved)
    }
}

/// Search for a nounce whose digest has at least `difficulty` leading zero
/// bits, starting from the record's current nounce.
///
/// On success `nounce` and `proof_of_work` are updated and the achieved bit
/// count is returned. The signature is not touched and must be recomputed.
pub fn mine(record: &mut Synapse, difficulty: u32, max_attempts: u64) -> Result<Option<u32>> {
    for _ in 0..max_attempts {
        let digest = synapse_digest(record)?;
        let bits = leading_zero_bits(&digest);
        if bits >= difficulty {
            record.proof_of_work = digest;
            return Ok(Some(bits));
        }
        record.nounce = match record.nounce.checked_add(1) {
            Some(next) => next,
            None => return Ok(None),
        };
    }
    Ok(None)
}
