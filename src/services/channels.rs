use crate::services::dispatcher::DeliveryError;

/// Who a delivery is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryIntent {
    /// Specific device tokens, usually on other devices.
    RemoteTokens,
    /// The session issuing the request, e.g. the settings page test button.
    OwnSession,
}

/// Snapshot of what the current session can actually do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCapabilities {
    pub notifications_supported: bool,
    pub permission_granted: bool,
    pub worker_active: bool,
    pub relay_reachable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryChannel {
    /// The authenticated push relay; reaches devices in the background.
    Relay,
    /// A notification rendered directly by the current session. Only ever
    /// reaches the session itself.
    ForegroundDisplay,
}

/// Pick the channel that may satisfy `intent` with the given capabilities.
///
/// Remote-token sends either go through the relay or fail. Showing a
/// notification on the sender's own screen instead of the target devices
/// would report success for a delivery that never happened, so that
/// downgrade is never taken.
pub fn select_channel(
    caps: ChannelCapabilities,
    intent: DeliveryIntent,
) -> Result<DeliveryChannel, DeliveryError> {
    match intent {
        DeliveryIntent::RemoteTokens => {
            if caps.relay_reachable {
                Ok(DeliveryChannel::Relay)
            } else {
                Err(DeliveryError::ChannelUnavailable)
            }
        }
        DeliveryIntent::OwnSession => {
            if !caps.notifications_supported || !caps.permission_granted {
                return Err(DeliveryError::ChannelUnavailable);
            }
            if caps.relay_reachable && caps.worker_active {
                Ok(DeliveryChannel::Relay)
            } else {
                Ok(DeliveryChannel::ForegroundDisplay)
            }
        }
    }
}
