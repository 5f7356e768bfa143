use std::path::{Path, PathBuf};

use accurate::{sum::Klein, traits::*};

use crate::TagwpResult;

/// Enumerations for tagger variants, calibration strata and report categories.
pub mod enums;

/// Expand `~` and environment variables in a user-supplied path without requiring it to exist.
pub fn expand_path<P: AsRef<Path>>(path: P) -> TagwpResult<PathBuf> {
    let path = path.as_ref().to_string_lossy();
    Ok(PathBuf::from(&*shellexpand::full(&path)?))
}

/// Compensated sum of a sequence of weights.
pub fn weighted_sum<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    values.into_iter().sum_with_accumulator::<Klein<f64>>()
}

/// Index of the first element of `values` closest to `target`.
///
/// Returns `None` for an empty slice.
pub fn argmin_distance(values: &[f64], target: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, value) in values.iter().enumerate() {
        let distance = (value - target).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((index, distance)),
        }
    }
    best.map(|(index, _)| index)
}
