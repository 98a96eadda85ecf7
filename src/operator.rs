//! Human-action gate.
//!
//! Some steps need a person: closing the beam shutter for a dark reading, or
//! turning the source back on. The routines only see [`OperatorGate`]; whether
//! that blocks on a terminal or confirms automatically is up to the caller.

use async_trait::async_trait;
use std::io::BufRead;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{AppResult, DaqError};

/// Display an instruction, let the setup settle, then wait for confirmation.
///
/// No timeout and no device side effects.
#[async_trait]
pub trait OperatorGate: Send + Sync {
    /// Show `message`, wait `settle`, then block until confirmed.
    async fn prompt(&self, message: &str, settle: Duration) -> AppResult<()>;
}

/// Prints to stdout and waits for Enter on stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePrompt;

#[async_trait]
impl OperatorGate for ConsolePrompt {
    async fn prompt(&self, message: &str, settle: Duration) -> AppResult<()> {
        println!("{message}");
        tokio::time::sleep(settle).await;
        println!("press enter to continue");
        tokio::task::spawn_blocking(|| wait_for_enter(&mut std::io::stdin().lock()))
            .await
            .map_err(|e| DaqError::OperatorNotConfirmed(format!("prompt task failed: {e}")))?
    }
}

/// Block until a line is read. End of input is not a confirmation.
fn wait_for_enter(input: &mut impl BufRead) -> AppResult<()> {
    let mut line = String::new();
    match input.read_line(&mut line)? {
        0 => Err(DaqError::OperatorNotConfirmed(
            "input closed before the step was confirmed".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Confirms immediately after the settle time, remembering what was asked.
#[derive(Debug, Default)]
pub struct AutoConfirm {
    prompts: Mutex<Vec<String>>,
}

impl AutoConfirm {
    /// Gate with no prompts recorded yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages shown so far, in order.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl OperatorGate for AutoConfirm {
    async fn prompt(&self, message: &str, settle: Duration) -> AppResult<()> {
        info!(message, "Operator step (auto-confirmed)");
        self.prompts.lock().await.push(message.to_string());
        tokio::time::sleep(settle).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_auto_confirm_waits_settle_time() {
        let gate = AutoConfirm::new();
        let started = tokio::time::Instant::now();
        gate.prompt("close shutter", Duration::from_secs(3)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(gate.prompts().await, vec!["close shutter".to_string()]);
    }

    #[test]
    fn test_enter_confirms() {
        let mut input = std::io::Cursor::new(b"\n".to_vec());
        assert!(wait_for_enter(&mut input).is_ok());
    }

    #[test]
    fn test_closed_input_is_not_confirmation() {
        let mut input = std::io::Cursor::new(Vec::new());
        assert!(matches!(
            wait_for_enter(&mut input),
            Err(DaqError::OperatorNotConfirmed(_))
        ));
    }
}
