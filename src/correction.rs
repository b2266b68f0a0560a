//! Multiple-testing correction computed on demand.
//!
//! The denominator is the live count of successful result rows for the
//! task, fetched from the store at call time rather than cached, so
//! thresholds always track what was actually tested.

use log::debug;

use crate::error::{PhenoscanError, Result};
use crate::store::ResultStore;

/// A correction method maps (alpha, number of tests) to a p-value cutoff.
pub trait CorrectionMethod {
    fn name(&self) -> &'static str;
    fn threshold(&self, alpha: f64, n_tests: u64) -> f64;
}

pub struct Bonferroni;

impl CorrectionMethod for Bonferroni {
    fn name(&self) -> &'static str {
        "bonferroni"
    }

    fn threshold(&self, alpha: f64, n_tests: u64) -> f64 {
        alpha / n_tests as f64
    }
}

pub struct Sidak;

impl CorrectionMethod for Sidak {
    fn name(&self) -> &'static str {
        "sidak"
    }

    fn threshold(&self, alpha: f64, n_tests: u64) -> f64 {
        1.0 - (1.0 - alpha).powf(1.0 / n_tests as f64)
    }
}

/// Closed selection over the available methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Correction {
    #[default]
    Bonferroni,
    Sidak,
}

impl Correction {
    fn method(&self) -> &'static dyn CorrectionMethod {
        match self {
            Correction::Bonferroni => &Bonferroni,
            Correction::Sidak => &Sidak,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.method().name()
    }
}

/// Computes corrected significance thresholds against a result store.
pub struct CorrectionEngine<'a> {
    store: &'a ResultStore,
}

impl<'a> CorrectionEngine<'a> {
    pub fn new(store: &'a ResultStore) -> Self {
        Self { store }
    }

    /// Corrected p-value cutoff for a task at significance level `alpha`.
    pub fn threshold(&self, task: &str, alpha: f64, method: Correction) -> Result<f64> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(PhenoscanError::config(format!(
                "significance level must lie in (0, 1), got {}",
                alpha
            )));
        }
        let n_tests = self.store.count_successful(task)?;
        if n_tests == 0 {
            return Err(PhenoscanError::config(format!(
                "task '{}' has no successful results to correct over",
                task
            )));
        }
        let threshold = method.method().threshold(alpha, n_tests);
        debug!(
            "Correction for task '{}': {} over {} tests at alpha {} -> {:.3e}.",
            task,
            method.as_str(),
            n_tests,
            alpha,
            threshold
        );
        Ok(threshold)
    }

    /// Bonferroni threshold, the engine's default method.
    pub fn get_threshold(&self, task: &str, alpha: f64) -> Result<f64> {
        self.threshold(task, alpha, Correction::Bonferroni)
    }
}
