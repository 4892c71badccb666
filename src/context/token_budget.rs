//! Token budget arithmetic for a single optimization call
//!
//! The budget covers the assembled context plus tokens reserved for the
//! query and the model's response:
//! - Available: budget - reserve
//! - Compression trigger: usage above the compression threshold
//! - Compression target: a fraction of the available tokens

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Budget allocation snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub used: usize,
    pub available: usize,
    pub remaining: usize,
}

/// Token budget errors
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Budget exceeded: {used} tokens used, {max} tokens allowed")]
    BudgetExceeded { used: usize, max: usize },

    #[error("Budget unsatisfiable: budget {budget} does not exceed reserve {reserve}")]
    Unsatisfiable { budget: usize, reserve: usize },
}

/// Token budget for one optimization call
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    budget: usize,
    reserve: usize,
    compression_threshold: usize,
    compression_ratio: f32,
}

impl TokenBudget {
    /// Create a budget; the compression threshold defaults to 70% of `budget`
    pub fn new(budget: usize, reserve: usize) -> Self {
        Self {
            budget,
            reserve,
            compression_threshold: scale(budget, 0.7),
            compression_ratio: 0.7,
        }
    }

    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Fraction of the available tokens compression aims for
    pub fn with_compression_ratio(mut self, ratio: f32) -> Self {
        self.compression_ratio = ratio;
        self
    }

    /// Tokens available for content
    pub fn available(&self) -> usize {
        self.budget.saturating_sub(self.reserve)
    }

    pub fn check_satisfiable(&self) -> Result<(), BudgetError> {
        if self.available() == 0 {
            return Err(BudgetError::Unsatisfiable {
                budget: self.budget,
                reserve: self.reserve,
            });
        }
        Ok(())
    }

    /// Whether `tokens` more fit on top of `used`
    pub fn fits(&self, used: usize, tokens: usize) -> bool {
        used.checked_add(tokens)
            .map(|total| total <= self.available())
            .unwrap_or(false)
    }

    /// Check a token count against the available budget
    pub fn check_budget(&self, used: usize) -> Result<(), BudgetError> {
        if used > self.available() {
            return Err(BudgetError::BudgetExceeded {
                used,
                max: self.available(),
            });
        }
        Ok(())
    }

    /// Whether usage is high enough that compression may be attempted
    pub fn should_compress(&self, used: usize) -> bool {
        used > self.compression_threshold
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    /// Token total compression tries to reach
    pub fn compression_target(&self) -> usize {
        scale(self.available(), self.compression_ratio)
    }

    pub fn allocation(&self, used: usize) -> BudgetAllocation {
        BudgetAllocation {
            used,
            available: self.available(),
            remaining: self.available().saturating_sub(used),
        }
    }
}

fn scale(tokens: usize, ratio: f32) -> usize {
    (tokens as f64 * ratio as f64).floor() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_subtracts_reserve() {
        let budget = TokenBudget::new(1000, 200);
        assert_eq!(budget.available(), 800);
        assert!(budget.check_satisfiable().is_ok());
    }

    #[test]
    fn test_reserve_exceeding_budget_is_unsatisfiable() {
        let budget = TokenBudget::new(500, 800);
        assert_eq!(budget.available(), 0);
        assert!(matches!(
            budget.check_satisfiable(),
            Err(BudgetError::Unsatisfiable { .. })
        ));
    }

    #[test]
    fn test_fits() {
        let budget = TokenBudget::new(1000, 200);
        assert!(budget.fits(500, 300));
        assert!(!budget.fits(500, 301));
        assert!(!budget.fits(usize::MAX, 1));
    }

    #[test]
    fn test_check_budget() {
        let budget = TokenBudget::new(1000, 200);
        assert!(budget.check_budget(800).is_ok());
        assert!(budget.check_budget(801).is_err());
    }

    #[test]
    fn test_compression_defaults() {
        let budget = TokenBudget::new(2000, 200);
        assert_eq!(budget.compression_threshold(), 1400);
        assert_eq!(budget.compression_target(), 1260);
        assert!(budget.should_compress(1401));
        assert!(!budget.should_compress(1400));
    }

    #[test]
    fn test_allocation_snapshot() {
        let alloc = TokenBudget::new(1000, 200).allocation(500);
        assert_eq!(alloc.remaining, 300);
        assert_eq!(alloc.available, 800);
    }
}
