use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::config::{CandidateList, NetworkCandidate};

const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_ROUNDS: u32 = 3;
const DEFAULT_ROUND_BACKOFF_MS: u64 = 3_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("no wifi network available after {attempted} attempt(s)")]
    NoNetworkAvailable { attempted: usize },
}

/// How a single join attempt ended, as reported by the radio driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Rejected,
    TimedOut,
}

/// Platform seam for joining one access point.
pub trait CandidateConnector {
    fn try_join(&mut self, candidate: &NetworkCandidate, timeout: Duration) -> JoinOutcome;

    /// Called between full passes over the list.
    fn backoff(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedNetwork {
    pub index: usize,
    pub name: String,
    pub attempts: usize,
}

/// Tries candidates in list order and adopts the first one that joins.
pub fn connect_first_available<C>(
    candidates: &CandidateList,
    connector: &mut C,
    timeout: Duration,
) -> Result<ConnectedNetwork, ConnectError>
where
    C: CandidateConnector + ?Sized,
{
    let total = candidates.len();
    let mut attempted = 0;

    for (index, candidate) in candidates.iter().enumerate() {
        attempted += 1;
        info!(
            "wifi attempt {}/{total}: joining `{}`",
            index + 1,
            candidate.name
        );

        match connector.try_join(candidate, timeout) {
            JoinOutcome::Joined => {
                info!("wifi joined `{}` on attempt {attempted}", candidate.name);
                return Ok(ConnectedNetwork {
                    index,
                    name: candidate.name.clone(),
                    attempts: attempted,
                });
            }
            JoinOutcome::Rejected => {
                warn!("wifi `{}` rejected the join", candidate.name);
            }
            JoinOutcome::TimedOut => {
                warn!(
                    "wifi `{}` did not come up within {}ms",
                    candidate.name,
                    timeout.as_millis()
                );
            }
        }
    }

    warn!("no wifi network available ({attempted} of {total} candidate(s) tried)");
    Err(ConnectError::NoNetworkAvailable { attempted })
}

/// Retry policy around [`connect_first_available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionPolicy {
    pub attempt_timeout: Duration,
    pub max_rounds: u32,
    pub round_backoff: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(DEFAULT_ATTEMPT_TIMEOUT_MS),
            max_rounds: DEFAULT_MAX_ROUNDS,
            round_backoff: Duration::from_millis(DEFAULT_ROUND_BACKOFF_MS),
        }
    }
}

impl ConnectionPolicy {
    pub fn run<C>(
        &self,
        candidates: &CandidateList,
        connector: &mut C,
    ) -> Result<ConnectedNetwork, ConnectError>
    where
        C: CandidateConnector + ?Sized,
    {
        let rounds = self.max_rounds.max(1);

        // Nothing to retry with an empty list.
        if candidates.is_empty() {
            return connect_first_available(candidates, connector, self.attempt_timeout);
        }

        let mut round = 1;
        loop {
            match connect_first_available(candidates, connector, self.attempt_timeout) {
                Ok(network) => return Ok(network),
                Err(err) if round >= rounds => {
                    warn!("giving up on wifi after {rounds} round(s): {err}");
                    return Err(err);
                }
                Err(_) => {
                    info!(
                        "wifi round {round}/{rounds} failed; retrying in {}ms",
                        self.round_backoff.as_millis()
                    );
                    connector.backoff(self.round_backoff);
                    round += 1;
                }
            }
        }
    }
}
