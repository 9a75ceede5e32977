use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conn_coalesce::{
    CoalescingEnsurer, ConnState, ConnStatus, ConnectionEnsurer, ReconnectPolicy,
    ReconnectionState, Reconnector, StatusSummary,
};
use futures::future::join_all;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
}

/// Treats a successful TCP connect as "connection ensured".
pub struct TcpEnsurer {
    connect_timeout: Duration,
    connects: AtomicUsize,
}

impl TcpEnsurer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            connects: AtomicUsize::new(0),
        }
    }

    /// Underlying connects issued so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConnectionEnsurer for TcpEnsurer {
    type Error = ProbeError;

    async fn ensure_connection(&self, conn_name: &str) -> Result<(), ProbeError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        debug!(conn = %conn_name, "tcp connect");
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(conn_name)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(source)) => Err(ProbeError::Connect {
                addr: conn_name.to_string(),
                source,
            }),
            Err(_) => Err(ProbeError::Timeout {
                addr: conn_name.to_string(),
                timeout: self.connect_timeout,
            }),
        }
    }
}

#[derive(Debug)]
pub struct HostReport {
    pub host: String,
    pub callers: usize,
    pub outcome: Result<(), String>,
}

impl HostReport {
    pub fn reachable(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Issue `repeat` concurrent ensures per host. Hosts proceed in parallel;
/// callers for the same host share one connect.
pub async fn probe_all(
    ensurer: &CoalescingEnsurer<TcpEnsurer>,
    hosts: &[String],
    repeat: usize,
) -> Vec<HostReport> {
    let pending: Vec<_> = hosts
        .iter()
        .map(|host| {
            let calls: Vec<_> = (0..repeat).map(|_| ensurer.ensure(host)).collect();
            (host.clone(), join_all(calls))
        })
        .collect();

    let mut reports = Vec::with_capacity(pending.len());
    for (host, calls) in pending {
        let outcomes = calls.await;
        let callers = outcomes.len();
        let outcome = outcomes
            .into_iter()
            .next()
            .unwrap_or(Ok(()))
            .map_err(|err| err.to_string());
        reports.push(HostReport {
            host,
            callers,
            outcome,
        });
    }
    reports
}

/// Run a reconnector per host until each one reconnects or gives up, logging
/// every status change.
pub async fn watch_until_settled(
    ensurer: &CoalescingEnsurer<TcpEnsurer>,
    hosts: &[String],
    policy: &ReconnectPolicy,
) -> Vec<(String, ReconnectionState)> {
    let followers = hosts.iter().map(|host| {
        let reconnector = Reconnector::new(host.clone(), ensurer.clone(), policy.clone());
        async move {
            let state = follow(&reconnector).await;
            (host.clone(), state)
        }
    });
    join_all(followers).await
}

async fn follow(reconnector: &Reconnector<TcpEnsurer>) -> ReconnectionState {
    let mut rx = reconnector.subscribe();
    reconnector.connection_lost();
    let status = ConnStatus::new(ConnState::Disconnected);
    let max_attempts = reconnector.policy().max_attempts;

    loop {
        let snapshot = *rx.borrow_and_update();
        let summary =
            StatusSummary::derive(reconnector.conn_name(), &status, &snapshot, max_attempts);
        match snapshot.state {
            ReconnectionState::Idle => {
                info!(conn = %reconnector.conn_name(), "reconnected");
                return snapshot.state;
            }
            ReconnectionState::Failed => {
                warn!(conn = %reconnector.conn_name(), "{}", summary.text);
                return snapshot.state;
            }
            ReconnectionState::Pending | ReconnectionState::Attempting => {
                info!(conn = %reconnector.conn_name(), "{}", summary.text);
            }
        }
        if rx.changed().await.is_err() {
            return snapshot.state;
        }
    }
}
