//! Human-in-the-loop questions.
//!
//! Workflows never read the terminal directly; they ask an [`Operator`]. The terminal
//! implementation prompts through `dialoguer`, the non-interactive one answers with defaults,
//! and tests replay canned answers.

use std::fmt;

use anyhow::{Context, Result};
use dialoguer::{Confirm, Input, Password, Select, theme::ColorfulTheme};

pub trait Operator: Send + Sync {
    /// Whether answers come from a human. Non-interactive runs never take destructive paths.
    fn is_interactive(&self) -> bool;

    fn ask_yes_no(&self, question: &str, default: bool) -> Result<bool>;

    /// Pick one of `options`, returning its index.
    fn ask_choice(&self, question: &str, options: &[String], default: usize) -> Result<usize>;

    fn ask_text(&self, question: &str, default: Option<&str>) -> Result<String>;

    /// Like [`Operator::ask_text`] but for values that must not be echoed or logged.
    fn ask_secret(&self, question: &str) -> Result<String>;

    /// Show a message to the operator.
    fn notify(&self, message: &str);
}

/// Prompts on the controlling terminal.
#[derive(Default)]
pub struct TerminalOperator {
    theme: ColorfulTheme,
}

impl fmt::Debug for TerminalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalOperator")
            .field("theme", &"ColorfulTheme")
            .finish()
    }
}

impl Operator for TerminalOperator {
    fn is_interactive(&self) -> bool {
        true
    }

    fn ask_yes_no(&self, question: &str, default: bool) -> Result<bool> {
        Confirm::with_theme(&self.theme)
            .with_prompt(question)
            .default(default)
            .interact()
            .with_context(|| format!("Failed to read an answer to '{}'", question))
    }

    fn ask_choice(&self, question: &str, options: &[String], default: usize) -> Result<usize> {
        Select::with_theme(&self.theme)
            .with_prompt(question)
            .items(options)
            .default(default.min(options.len().saturating_sub(1)))
            .interact()
            .with_context(|| format!("Failed to read a choice for '{}'", question))
    }

    fn ask_text(&self, question: &str, default: Option<&str>) -> Result<String> {
        let mut input = Input::<String>::with_theme(&self.theme).with_prompt(question);
        if let Some(default) = default {
            input = input.default(default.to_string());
        }
        let answer = input
            .interact_text()
            .with_context(|| format!("Failed to read an answer to '{}'", question))?;
        Ok(answer.trim().to_string())
    }

    /// Input is hidden while typed. Empty answers are asked again.
    fn ask_secret(&self, question: &str) -> Result<String> {
        Password::with_theme(&self.theme)
            .with_prompt(question)
            .interact()
            .with_context(|| format!("Failed to read an answer to '{}'", question))
    }

    fn notify(&self, message: &str) {
        eprintln!("{}", message);
    }
}

/// Answers every question with its default. Used for `--non-interactive` and CI.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractiveOperator;

impl Operator for NonInteractiveOperator {
    fn is_interactive(&self) -> bool {
        false
    }

    fn ask_yes_no(&self, question: &str, default: bool) -> Result<bool> {
        tracing::debug!(question, answer = default, "Answering with default");
        Ok(default)
    }

    fn ask_choice(&self, question: &str, options: &[String], default: usize) -> Result<usize> {
        let option = options
            .get(default)
            .with_context(|| format!("No default option for '{}'", question))?;
        tracing::debug!(question, answer = %option, "Answering with default");
        Ok(default)
    }

    fn ask_text(&self, question: &str, default: Option<&str>) -> Result<String> {
        default
            .map(String::from)
            .with_context(|| format!("'{}' needs an answer but the session is non-interactive", question))
    }

    fn ask_secret(&self, question: &str) -> Result<String> {
        anyhow::bail!("'{}' needs an answer but the session is non-interactive", question)
    }

    fn notify(&self, message: &str) {
        tracing::info!("{}", message);
    }
}
