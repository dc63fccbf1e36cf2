use anyhow::{bail, Result};

use crate::types::Task;

/// Turns a prose requirement into an ordered list of pending tasks with
/// non-empty acceptance criteria.
pub trait Decomposer: Send + Sync {
    fn decompose(&self, requirements: &str) -> Result<Vec<Task>>;
}

/// Line-oriented reference decomposer: bullet or numbered lines become one
/// task each; anything else becomes a single task for the whole requirement.
pub struct SimpleDecomposer;

impl SimpleDecomposer {
    fn derive_criteria(description: &str) -> Vec<String> {
        vec![
            format!("{description} is implemented"),
            "Automated tests cover the new behavior".to_string(),
            "New public functions are documented".to_string(),
        ]
    }
}

impl Decomposer for SimpleDecomposer {
    fn decompose(&self, requirements: &str) -> Result<Vec<Task>> {
        let requirements = requirements.trim();
        if requirements.is_empty() {
            bail!("requirements text is empty");
        }

        let mut descriptions: Vec<String> = requirements
            .lines()
            .map(str::trim)
            .filter_map(|line| {
                line.strip_prefix("- ")
                    .or_else(|| line.strip_prefix("* "))
                    .or_else(|| {
                        line.split_once(". ")
                            .filter(|(n, _)| n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty())
                            .map(|(_, rest)| rest)
                    })
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
            })
            .collect();

        if descriptions.is_empty() {
            descriptions.push(requirements.to_string());
        }

        Ok(descriptions
            .into_iter()
            .enumerate()
            .map(|(i, description)| {
                let criteria = Self::derive_criteria(&description);
                Task::new(format!("task_{:03}", i + 1), description, criteria)
            })
            .collect())
    }
}
