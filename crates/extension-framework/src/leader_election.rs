//! Leader election on top of `coordination.k8s.io/v1` leases.
//!
//! Updates use the lease's resourceVersion, so two candidates racing for the same lease can never
//! both win: the slower write fails with 409 Conflict and is retried.
use std::time::Duration;

use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
    jiff::{SignedDuration, Timestamp},
};
use kube::{
    Api, Client,
    api::PostParams,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get lease {name:?}"))]
    GetLease { source: kube::Error, name: String },

    #[snafu(display("failed to create lease {name:?}"))]
    CreateLease { source: kube::Error, name: String },

    #[snafu(display("failed to update lease {name:?}"))]
    UpdateLease { source: kube::Error, name: String },

    #[snafu(display("lease {name:?} has no resourceVersion"))]
    MissingResourceVersion { name: String },

    #[snafu(display("{identity:?} lost leadership of lease {name:?}"))]
    LeadershipLost { identity: String, name: String },
}

/// Timing of the election.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// How long non-leaders wait before they take over a lease which was not renewed.
    pub lease_duration: Duration,

    /// How long the leader keeps retrying to renew before it gives up leadership.
    pub renew_deadline: Duration,

    /// Interval between acquire and renew attempts.
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Returns a unique identity for this process, `<hostname>_<random hex>`.
pub fn default_identity() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned());
    format!("{hostname}_{suffix:016x}", suffix = rand::random::<u64>())
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Create,
    Renew,
    TakeOver { transitions: i32 },
    Wait,
}

fn next_action(lease: Option<&Lease>, identity: &str, now: Timestamp) -> Action {
    let Some(lease) = lease else {
        return Action::Create;
    };
    let spec = lease.spec.as_ref();

    if spec.and_then(|spec| spec.holder_identity.as_deref()) == Some(identity) {
        return Action::Renew;
    }

    let renew_time = spec.and_then(|spec| spec.renew_time.as_ref());
    let lease_duration = spec.and_then(|spec| spec.lease_duration_seconds);
    let expired = match (renew_time, lease_duration) {
        (Some(MicroTime(renewed)), Some(seconds)) => renewed
            .checked_add(SignedDuration::from_secs(seconds.into()))
            .map_or(true, |expiry| now > expiry),
        _ => true,
    };

    if expired {
        Action::TakeOver {
            transitions: spec
                .and_then(|spec| spec.lease_transitions)
                .unwrap_or_default(),
        }
    } else {
        Action::Wait
    }
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    config: LeaderElectionConfig,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.into(),
            identity: default_identity(),
            config: LeaderElectionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LeaderElectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Blocks until the lease is acquired. Returns `false` if `cancel` fired first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        tracing::info!(
            identity = self.identity,
            lease = self.lease_name,
            "waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    tracing::info!(identity = self.identity, "leadership acquired");
                    return true;
                }
                Ok(false) => {
                    tracing::debug!(identity = self.identity, "lease is held by another candidate");
                }
                Err(error) => {
                    tracing::warn!(
                        identity = self.identity,
                        error = &error as &dyn std::error::Error,
                        "failed to acquire lease, retrying"
                    );
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keeps renewing the lease until `cancel` fires.
    ///
    /// Fails with [`Error::LeadershipLost`] if the lease could not be renewed within the renew
    /// deadline or was taken over by another candidate.
    pub async fn hold(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut last_renewal = tokio::time::Instant::now();

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.config.retry_period) => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = tokio::time::Instant::now(),
                Ok(false) => {
                    return LeadershipLostSnafu {
                        identity: self.identity.clone(),
                        name: self.lease_name.clone(),
                    }
                    .fail();
                }
                Err(error) => {
                    tracing::warn!(
                        identity = self.identity,
                        error = &error as &dyn std::error::Error,
                        "failed to renew lease"
                    );
                }
            }

            if last_renewal.elapsed() > self.config.renew_deadline {
                return LeadershipLostSnafu {
                    identity: self.identity.clone(),
                    name: self.lease_name.clone(),
                }
                .fail();
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let now = Timestamp::now();
        let existing = self
            .api
            .get_opt(&self.lease_name)
            .await
            .context(GetLeaseSnafu {
                name: &self.lease_name,
            })?;

        let lease = match next_action(existing.as_ref(), &self.identity, now) {
            Action::Wait => return Ok(false),
            Action::Create => {
                let lease = self.lease(None, now, 0);
                return match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(error) if is_conflict(&error) => Ok(false),
                    Err(error) => Err(error).context(CreateLeaseSnafu {
                        name: &self.lease_name,
                    }),
                };
            }
            Action::Renew => {
                let mut lease = existing.context(MissingResourceVersionSnafu {
                    name: &self.lease_name,
                })?;
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                lease
            }
            Action::TakeOver { transitions } => {
                let resource_version = existing
                    .and_then(|lease| lease.metadata.resource_version)
                    .context(MissingResourceVersionSnafu {
                        name: &self.lease_name,
                    })?;
                tracing::info!(
                    identity = self.identity,
                    lease = self.lease_name,
                    "taking over expired lease"
                );
                self.lease(Some(resource_version), now, transitions + 1)
            }
        };

        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if is_conflict(&error) => Ok(false),
            Err(error) => Err(error).context(UpdateLeaseSnafu {
                name: &self.lease_name,
            }),
        }
    }

    fn lease(&self, resource_version: Option<String>, now: Timestamp, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version,
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..LeaseSpec::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn lease(holder: &str, renewed_secs_ago: i64, transitions: i32) -> Lease {
        let now = Timestamp::now();
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_owned()),
                lease_duration_seconds: Some(15),
                renew_time: Some(MicroTime(
                    now.checked_sub(SignedDuration::from_secs(renewed_secs_ago))
                        .expect("timestamp in range"),
                )),
                lease_transitions: Some(transitions),
                ..LeaseSpec::default()
            }),
        }
    }

    #[rstest]
    #[case(None, Action::Create)]
    #[case(Some(lease("me", 60, 3)), Action::Renew)]
    #[case(Some(lease("other", 1, 3)), Action::Wait)]
    #[case(Some(lease("other", 60, 3)), Action::TakeOver { transitions: 3 })]
    fn next_action_follows_lease_state(#[case] existing: Option<Lease>, #[case] expected: Action) {
        assert_eq!(next_action(existing.as_ref(), "me", Timestamp::now()), expected);
    }

    #[test]
    fn lease_without_renew_time_counts_as_expired() {
        let existing = Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: Some("other".to_owned()),
                ..LeaseSpec::default()
            }),
        };

        assert_eq!(
            next_action(Some(&existing), "me", Timestamp::now()),
            Action::TakeOver { transitions: 0 }
        );
    }

    #[test]
    fn identities_are_unique() {
        assert_ne!(default_identity(), default_identity());
    }
}
