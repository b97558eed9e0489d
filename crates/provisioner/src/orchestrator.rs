use std::{fmt, future::Future, time::Duration};

use garde::Validate;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{Level, instrument};

use crate::{
    api::VirtualServer,
    builder::VmIdentity,
    client::{ClientError, DeleteOutcome, VirtualServerClient},
    config::humantime_duration,
};

/// How the orchestrator waits for a created server to reach its target state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessPolicy {
    #[garde(length(min = 1))]
    pub expected_state: String,
    /// Wait between the first two checks.
    #[garde(custom(non_zero))]
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
    #[garde(custom(non_zero))]
    #[serde(with = "humantime_duration")]
    pub max_interval: Duration,
    /// Growth of the wait after each check; 1.0 polls at a fixed interval.
    #[garde(custom(sane_backoff))]
    pub backoff_factor: f64,
    /// Overall deadline, counted from the end of the create call.
    #[garde(custom(non_zero))]
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            expected_state: "Running".to_string(),
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            backoff_factor: 1.5,
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Largest accepted `backoffFactor`.
pub const MAX_BACKOFF_FACTOR: f64 = 10.0;

/// Stand-in deadline for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

impl ReadinessPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        let cap = self.max_interval.max(self.interval);
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_factor)
            .map_or(cap, |next| next.min(cap))
    }

    fn deadline(&self, started: Instant) -> Instant {
        started
            .checked_add(self.timeout)
            .unwrap_or_else(|| started + FAR_FUTURE)
    }
}

fn sane_backoff(value: &f64, _context: &()) -> garde::Result {
    if !(1.0..=MAX_BACKOFF_FACTOR).contains(value) {
        return Err(garde::Error::new(format!(
            "must be a number between 1.0 and {MAX_BACKOFF_FACTOR}"
        )));
    }
    Ok(())
}

fn non_zero(value: &Duration, _context: &()) -> garde::Result {
    if value.is_zero() {
        return Err(garde::Error::new("must be greater than zero"));
    }
    Ok(())
}

/// Terminal result of one provisioning run.
#[derive(Debug)]
pub enum ProvisionOutcome {
    Ready {
        uid: Option<String>,
        state: String,
        polls: u32,
        elapsed: Duration,
    },
    /// The server exists but hasn't reached the expected state; it may still converge.
    ///
    /// `last_state` is `None` when no check ever returned a state. `last_error`
    /// holds the error of the final check when that check failed.
    TimedOut {
        last_state: Option<String>,
        last_error: Option<ClientError>,
        polls: u32,
        elapsed: Duration,
    },
    /// The server vanished while waiting for it.
    ReadyCheckFailed { error: ClientError, polls: u32 },
    DeleteFailed(ClientError),
    CreateFailed(ClientError),
}

impl ProvisionOutcome {
    /// 0 when ready, 1 when the run failed, 2 when the server is not ready yet.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ready { .. } => 0,
            Self::DeleteFailed(_) | Self::CreateFailed(_) => 1,
            Self::TimedOut { .. } | Self::ReadyCheckFailed { .. } => 2,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

impl fmt::Display for ProvisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready {
                state,
                polls,
                elapsed,
                ..
            } => write!(
                f,
                "ready: {state} after {polls} checks ({})",
                humantime::format_duration(*elapsed)
            ),
            Self::TimedOut {
                last_state,
                last_error,
                polls,
                elapsed,
            } => {
                match last_state {
                    Some(state) => write!(f, "not ready: still {state}")?,
                    None => write!(f, "not ready: no state observed")?,
                }
                write!(
                    f,
                    " after {polls} checks ({})",
                    humantime::format_duration(*elapsed)
                )?;
                match last_error {
                    Some(error) => write!(f, ", last check failed: {error}"),
                    None => Ok(()),
                }
            }
            Self::ReadyCheckFailed { error, polls } => {
                write!(f, "not ready: readiness check failed after {polls} checks: {error}")
            }
            Self::DeleteFailed(error) => write!(f, "failed: delete: {error}"),
            Self::CreateFailed(error) => write!(f, "failed: create: {error}"),
        }
    }
}

/// Drives delete, create and the readiness wait for one server.
pub struct Orchestrator<C> {
    client: C,
    policy: ReadinessPolicy,
}

impl<C: VirtualServerClient> Orchestrator<C> {
    pub fn new(client: C, policy: ReadinessPolicy) -> Self {
        Self { client, policy }
    }

    /// Replace whatever server currently holds `identity` with `server`.
    ///
    /// Safe to rerun: a server that doesn't exist yet is not a delete failure.
    #[instrument(level = Level::INFO, skip_all, fields(vs = %identity))]
    pub async fn provision(&self, identity: &VmIdentity, server: &VirtualServer) -> ProvisionOutcome {
        if let Err(e) = self.teardown(identity).await {
            tracing::error!("VirtualServer delete failed: {}", e);
            return ProvisionOutcome::DeleteFailed(e);
        }

        let created = match self.client.create(server).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!("VirtualServer create failed: {}", e);
                return ProvisionOutcome::CreateFailed(e);
            }
        };
        let uid = created.metadata.uid;
        tracing::info!(
            "VirtualServer {} created (uid {})",
            identity,
            uid.as_deref().unwrap_or("unknown")
        );

        self.await_ready(identity, uid).await
    }

    /// Like [`Orchestrator::provision`], but gives up as soon as `cancel` completes.
    ///
    /// Returns `None` when cancelled. Nothing already submitted is rolled back.
    pub async fn provision_until<F>(
        &self,
        identity: &VmIdentity,
        server: &VirtualServer,
        cancel: F,
    ) -> Option<ProvisionOutcome>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            outcome = self.provision(identity, server) => Some(outcome),
            () = cancel => {
                tracing::warn!("Interrupted, VirtualServer {} left as last submitted", identity);
                None
            }
        }
    }

    /// Delete the server, treating an absent one as already deleted.
    #[instrument(level = Level::DEBUG, skip_all, fields(vs = %identity))]
    pub async fn teardown(&self, identity: &VmIdentity) -> Result<DeleteOutcome, ClientError> {
        let outcome = self
            .client
            .delete(&identity.namespace, &identity.name)
            .await?;

        match outcome {
            DeleteOutcome::Deleted => tracing::info!("VirtualServer {} deleted", identity),
            DeleteOutcome::NotFound => tracing::info!(
                "VirtualServer {} in namespace {} already deleted",
                identity.name,
                identity.namespace
            ),
        }

        Ok(outcome)
    }

    async fn await_ready(&self, identity: &VmIdentity, uid: Option<String>) -> ProvisionOutcome {
        let expected = self.policy.expected_state.as_str();
        let started = Instant::now();
        let deadline = self.policy.deadline(started);
        let mut interval = self.policy.interval;
        let mut polls = 0;
        let mut last_state: Option<String> = None;
        let mut last_error = None;

        tracing::info!(
            "Waiting up to {} for VirtualServer {} to be {}",
            humantime::format_duration(self.policy.timeout),
            identity,
            expected
        );

        loop {
            let check = self.client.state(&identity.namespace, &identity.name);
            let Ok(result) = tokio::time::timeout_at(deadline, check).await else {
                break;
            };
            polls += 1;

            match result {
                Ok(state) if state == expected => {
                    return ProvisionOutcome::Ready {
                        uid,
                        state,
                        polls,
                        elapsed: started.elapsed(),
                    };
                }
                Ok(state) => {
                    if last_state.as_deref() != Some(state.as_str()) {
                        tracing::info!("VirtualServer {} is {}", identity, state);
                    }
                    last_state = Some(state);
                    last_error = None;
                }
                Err(error) if error.is_not_found() => {
                    tracing::error!("VirtualServer {} disappeared while waiting", identity);
                    return ProvisionOutcome::ReadyCheckFailed { error, polls };
                }
                Err(error) => {
                    tracing::warn!("Readiness check for {} failed, retrying: {}", identity, error);
                    last_error = Some(error);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = self.policy.next_interval(interval);
        }

        tracing::warn!(
            "VirtualServer {} not {} after {}, last state {}",
            identity,
            expected,
            humantime::format_duration(self.policy.timeout),
            last_state.as_deref().unwrap_or("unknown")
        );
        ProvisionOutcome::TimedOut {
            last_state,
            last_error,
            polls,
            elapsed: started.elapsed(),
        }
    }
}
