//! What a connection status indicator should say, derived from the live
//! connection status and the reconnection supervisor's snapshot.

use crate::reconnect::{ReconnectSnapshot, ReconnectionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Init,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnStatus {
    pub state: ConnState,
    pub error: Option<String>,
    /// Failure to install or use the remote shell helper on an otherwise
    /// working connection.
    pub wsh_error: Option<String>,
    pub wsh_enabled: bool,
}

impl ConnStatus {
    pub fn new(state: ConnState) -> Self {
        Self {
            state,
            wsh_enabled: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSummary {
    pub text: String,
    pub offer_reconnect: bool,
    pub offer_cancel: bool,
    /// Turn the shell helper off for this connection.
    pub offer_disable_wsh: bool,
    /// Dismiss the shell helper error without changing config.
    pub offer_dismiss_wsh: bool,
    pub error: Option<String>,
    pub wsh_error: Option<String>,
    /// False when there is nothing worth showing.
    pub visible: bool,
}

impl StatusSummary {
    pub fn derive(
        conn_name: &str,
        status: &ConnStatus,
        reconnect: &ReconnectSnapshot,
        max_attempts: u32,
    ) -> Self {
        let mut text = format!("Disconnected from \"{conn_name}\"");
        let mut offer_reconnect = true;
        let mut offer_cancel = false;

        match reconnect.state {
            ReconnectionState::Pending if reconnect.countdown_secs > 0 => {
                text = format!(
                    "Connection lost. Reconnecting in {}s...",
                    reconnect.countdown_secs
                );
                offer_reconnect = false;
                offer_cancel = true;
            }
            ReconnectionState::Attempting => {
                let attempt = if reconnect.attempts > 0 {
                    format!(" (attempt {}/{max_attempts})", reconnect.attempts)
                } else {
                    String::new()
                };
                text = format!("Reconnecting to \"{conn_name}\"{attempt}...");
                offer_reconnect = false;
                offer_cancel = true;
            }
            ReconnectionState::Failed => {
                text = format!(
                    "Failed to reconnect to \"{conn_name}\" after {max_attempts} attempts"
                );
            }
            _ => match status.state {
                ConnState::Connecting => {
                    text = format!("Connecting to \"{conn_name}\"...");
                    offer_reconnect = false;
                }
                ConnState::Connected => offer_reconnect = false,
                _ => {}
            },
        }

        let error = non_blank(&status.error).filter(|_| status.state == ConnState::Error);
        let wsh_error = non_blank(&status.wsh_error)
            .filter(|_| status.state == ConnState::Connected && status.wsh_enabled);
        let reconnect_active = reconnect.state != ReconnectionState::Idle;
        let visible =
            wsh_error.is_some() || reconnect_active || status.state != ConnState::Connected;

        Self {
            text,
            offer_reconnect,
            offer_cancel,
            offer_disable_wsh: wsh_error.is_some(),
            offer_dismiss_wsh: wsh_error.is_some(),
            error,
            wsh_error,
            visible,
        }
    }

    /// Error lines in the form a user would copy out of the indicator.
    pub fn error_report(&self) -> String {
        let mut lines = Vec::new();
        if let Some(error) = &self.error {
            lines.push(format!("error: {error}"));
        }
        if let Some(wsh_error) = &self.wsh_error {
            lines.push(format!("unable to use wsh: {wsh_error}"));
        }
        lines.join("\n")
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
}
