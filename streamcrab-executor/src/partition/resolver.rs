use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use super::{
    ExponentialBackoff, InputChannelDescriptor, InputChannelId, PartitionError, PartitionLocation,
    PartitionLocationProvider, PartitionLookup,
};
use crate::config::BackoffConfig;
use crate::types::ResultPartitionId;

/// Progress of one input channel's lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelResolutionState {
    Unresolved,
    Retrying { lookups: u32, next_delay: Duration },
    Resolved(PartitionLocation),
    Failed,
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChannel {
    pub channel_id: InputChannelId,
    pub partition_id: ResultPartitionId,
    pub location: PartitionLocation,
    /// Lookups issued, including the successful one. Zero when the location was
    /// known at deployment.
    pub lookups: u32,
    /// Backoff delays waited between lookups, in order.
    pub delays: Vec<Duration>,
}

#[derive(Clone)]
pub struct PartitionResolver {
    provider: Arc<dyn PartitionLocationProvider>,
    backoff: BackoffConfig,
}

impl PartitionResolver {
    pub fn new(provider: Arc<dyn PartitionLocationProvider>, backoff: BackoffConfig) -> Self {
        Self { provider, backoff }
    }

    /// Resolve one channel, waiting out "not found" answers.
    ///
    /// The wait between lookups is abandoned as soon as `cancel` turns true or
    /// its sender goes away.
    pub async fn resolve(
        &self,
        channel: &InputChannelDescriptor,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ResolvedChannel, PartitionError> {
        let channel_id = channel.channel;
        let partition_id = channel.partition_id;
        if let Some(location) = &channel.known_location {
            return Ok(ResolvedChannel {
                channel_id,
                partition_id,
                location: location.clone(),
                lookups: 0,
                delays: Vec::new(),
            });
        }

        let mut backoff = ExponentialBackoff::new(&self.backoff);
        let mut state = ChannelResolutionState::Unresolved;
        let mut lookups = 0u32;
        let mut delays = Vec::new();

        loop {
            if *cancel.borrow() {
                tracing::debug!("resolution of {partition_id} for channel {channel_id} canceled in state {state:?}");
                return Err(PartitionError::Canceled {
                    channel: channel_id,
                    partition_id,
                });
            }

            lookups += 1;
            let lookup = self.provider.lookup(&partition_id).map_err(|err| {
                PartitionError::LookupFailed {
                    channel: channel_id,
                    partition_id,
                    source: err,
                }
            });
            match lookup {
                Ok(PartitionLookup::Found(location)) => {
                    state = ChannelResolutionState::Resolved(location.clone());
                    tracing::debug!(
                        "resolved {partition_id} for channel {channel_id} after {lookups} lookups: {state:?}"
                    );
                    return Ok(ResolvedChannel {
                        channel_id,
                        partition_id,
                        location,
                        lookups,
                        delays,
                    });
                }
                Ok(PartitionLookup::NotFound) => {
                    let Some(delay) = backoff.next_delay() else {
                        tracing::warn!(
                            "partition {partition_id} for channel {channel_id} still not found after {lookups} lookups, giving up"
                        );
                        return Err(PartitionError::RetryBudgetExhausted {
                            channel: channel_id,
                            partition_id,
                            attempts: lookups,
                            waited: backoff.total_wait(),
                            last: Box::new(PartitionError::NotFound {
                                channel: channel_id,
                                partition_id,
                            }),
                        });
                    };
                    state = ChannelResolutionState::Retrying {
                        lookups,
                        next_delay: delay,
                    };
                    tracing::debug!(
                        "partition {partition_id} for channel {channel_id} not found (lookup {lookups}), retrying in {delay:?}"
                    );
                    delays.push(delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = cancel.changed() => {
                            if changed.is_err() {
                                return Err(PartitionError::Canceled {
                                    channel: channel_id,
                                    partition_id,
                                });
                            }
                        }
                    }
                }
                Err(err) => {
                    state = ChannelResolutionState::Failed;
                    tracing::warn!("lookup for channel {channel_id} failed in state {state:?}: {err}");
                    return Err(err);
                }
            }
        }
    }

    /// Resolve every channel concurrently. The first failure aborts the rest.
    /// Results are ordered by channel id.
    pub async fn resolve_all(
        &self,
        channels: Vec<InputChannelDescriptor>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<ResolvedChannel>, PartitionError> {
        let mut pending = JoinSet::new();
        for channel in channels {
            let resolver = self.clone();
            let mut cancel = cancel.clone();
            pending.spawn(async move { resolver.resolve(&channel, &mut cancel).await });
        }

        let mut resolved = Vec::with_capacity(pending.len());
        while let Some(joined) = pending.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    std::panic::resume_unwind(join_err.into_panic())
                }
                Err(_) => continue,
            };
            match result {
                Ok(channel) => resolved.push(channel),
                Err(err) => {
                    tracing::debug!("aborting resolution of remaining input channels: {err}");
                    pending.abort_all();
                    return Err(err);
                }
            }
        }
        resolved.sort_by_key(|channel| channel.channel_id);
        Ok(resolved)
    }
}
