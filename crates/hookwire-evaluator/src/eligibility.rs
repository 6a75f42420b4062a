//! Honours eligibility rules.

use std::fmt;
use thiserror::Error;

/// Marks below this count as a fail.
pub const PASS_MARK: f64 = 50.0;
/// Number of best marks averaged for the top-N rule.
pub const TOP_N: usize = 12;

#[derive(Debug, Error, PartialEq)]
pub enum EligibilityError {
    #[error("cannot evaluate an empty list of units")]
    NoUnits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    DoesNotQualify,
    Qualified,
    GoodChance,
    Chance,
    TryMasters,
}

impl Verdict {
    pub fn message(self) -> &'static str {
        match self {
            Verdict::DoesNotQualify => "DOES NOT QUALIFY FOR HONOURS STUDY!",
            Verdict::Qualified => "QUALIFIED FOR HONOURS STUDY!",
            Verdict::GoodChance => "MAY HAVE A GOOD CHANCE! Need further assessment!",
            Verdict::Chance => {
                "MAY HAVE A CHANCE!\nMust be carefully reassessed and get the coordinator's special permission!"
            }
            Verdict::TryMasters => "DOES NOT QUALIFY FOR HONOURS STUDY!\nTry masters by course work.",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub average: f64,
    /// Sum of the best twelve marks divided by twelve, even when fewer
    /// units were taken.
    pub top_average: f64,
    pub fails: usize,
    pub verdict: Verdict,
}

pub fn evaluate(marks: &[f64]) -> Result<Evaluation, EligibilityError> {
    if marks.is_empty() {
        return Err(EligibilityError::NoUnits);
    }

    let fails = marks.iter().filter(|&&m| m < PASS_MARK).count();
    let average = marks.iter().sum::<f64>() / marks.len() as f64;

    let mut sorted = marks.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let top_average = sorted.iter().take(TOP_N).sum::<f64>() / TOP_N as f64;

    let verdict = if fails >= 6 || marks.len() < TOP_N {
        Verdict::DoesNotQualify
    } else if average >= 70.0 {
        Verdict::Qualified
    } else if top_average >= 80.0 {
        Verdict::GoodChance
    } else if top_average >= 70.0 {
        Verdict::Chance
    } else {
        Verdict::TryMasters
    };

    Ok(Evaluation {
        average,
        top_average,
        fails,
        verdict,
    })
}
