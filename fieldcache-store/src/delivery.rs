//! Notifications for a single field request.
//!
//! Each request owns a [`Delivery`] that walks a fixed state machine:
//!
//! ```text
//! Idle ──stalled──▶ AwaitingFresh ──finish──▶ Delivered
//!   └──────────────────finish─────────────────▲
//! ```
//!
//! so a request emits either one terminal event or one `Stalled` event
//! followed by one terminal event, never anything else.

use fieldcache_core::{FetchError, FieldData};

/// One notification delivered to a `with_fields` callback.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldsEvent {
    /// Cached data that is partial or stale; a terminal event follows.
    Stalled(FieldData),
    /// Authoritative data for the request.
    Fresh(FieldData),
    /// The refresh failed. `cached` holds the pre-request snapshot when the
    /// cache is configured to hand it back.
    Failed {
        error: FetchError,
        cached: Option<FieldData>,
    },
}

impl FieldsEvent {
    pub fn is_stalled(&self) -> bool {
        matches!(self, Self::Stalled(_))
    }

    /// True for `Fresh` and `Failed`; exactly one terminal event is
    /// delivered per request.
    pub fn is_terminal(&self) -> bool {
        !self.is_stalled()
    }

    pub fn data(&self) -> Option<&FieldData> {
        match self {
            Self::Stalled(data) | Self::Fresh(data) => Some(data),
            Self::Failed { cached, .. } => cached.as_ref(),
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Collapse a terminal event into its outcome. `None` for `Stalled`,
    /// which is not an outcome.
    pub fn into_result(self) -> Option<Result<FieldData, FetchError>> {
        match self {
            Self::Stalled(_) => None,
            Self::Fresh(data) => Some(Ok(data)),
            Self::Failed { error, .. } => Some(Err(error)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryState {
    /// Nothing emitted yet.
    Idle,
    /// A stalled snapshot went out; the terminal event is owed.
    AwaitingFresh,
    /// The terminal event went out.
    Delivered,
}

pub(crate) struct Delivery<F> {
    callback: F,
    state: DeliveryState,
}

impl<F> Delivery<F>
where
    F: FnMut(FieldsEvent),
{
    pub(crate) fn new(callback: F) -> Self {
        Self {
            callback,
            state: DeliveryState::Idle,
        }
    }

    pub(crate) fn state(&self) -> DeliveryState {
        self.state
    }

    /// Emit the stalled snapshot. Only the first event of a request may be
    /// stalled; later calls are dropped.
    pub(crate) fn stalled(&mut self, data: FieldData) {
        match self.state {
            DeliveryState::Idle => {
                (self.callback)(FieldsEvent::Stalled(data));
                self.state = DeliveryState::AwaitingFresh;
            }
            DeliveryState::AwaitingFresh | DeliveryState::Delivered => {
                tracing::error!(state = ?self.state, "stalled event out of order, dropped");
            }
        }
    }

    pub(crate) fn fresh(&mut self, data: FieldData) {
        self.finish(FieldsEvent::Fresh(data));
    }

    pub(crate) fn fail(&mut self, error: FetchError, cached: Option<FieldData>) {
        self.finish(FieldsEvent::Failed { error, cached });
    }

    fn finish(&mut self, event: FieldsEvent) {
        match self.state {
            DeliveryState::Idle | DeliveryState::AwaitingFresh => {
                (self.callback)(event);
                self.state = DeliveryState::Delivered;
            }
            DeliveryState::Delivered => {
                tracing::error!("terminal event already delivered, dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: i64) -> FieldData {
        [("n".to_string(), json!(value))].into_iter().collect()
    }

    #[test]
    fn test_single_terminal_event() {
        let mut events = Vec::new();
        let mut delivery = Delivery::new(|e| events.push(e));
        delivery.fresh(data(1));
        assert_eq!(delivery.state(), DeliveryState::Delivered);
        drop(delivery);

        assert_eq!(events, vec![FieldsEvent::Fresh(data(1))]);
    }

    #[test]
    fn test_stalled_then_terminal() {
        let mut events = Vec::new();
        let mut delivery = Delivery::new(|e| events.push(e));
        delivery.stalled(data(1));
        assert_eq!(delivery.state(), DeliveryState::AwaitingFresh);
        delivery.fresh(data(2));
        drop(delivery);

        assert_eq!(
            events,
            vec![FieldsEvent::Stalled(data(1)), FieldsEvent::Fresh(data(2))]
        );
    }

    #[test]
    fn test_out_of_order_events_are_dropped() {
        let mut events = Vec::new();
        let mut delivery = Delivery::new(|e| events.push(e));
        delivery.stalled(data(1));
        delivery.stalled(data(2));
        delivery.fail(FetchError::network("video/x1", "down"), None);
        delivery.fresh(data(3));
        delivery.stalled(data(4));
        drop(delivery);

        assert_eq!(events.len(), 2);
        assert!(events[0].is_stalled());
        assert!(events[1].error().is_some());
    }

    #[test]
    fn test_event_accessors() {
        let failed = FieldsEvent::Failed {
            error: FetchError::network("video/x1", "down"),
            cached: Some(data(1)),
        };
        assert!(failed.is_terminal());
        assert_eq!(failed.data(), Some(&data(1)));
        assert!(matches!(failed.clone().into_result(), Some(Err(_))));

        let stalled = FieldsEvent::Stalled(data(5));
        assert!(!stalled.is_terminal());
        assert!(stalled.error().is_none());
        assert_eq!(stalled.into_result(), None);
        assert_eq!(FieldsEvent::Fresh(data(6)).into_result(), Some(Ok(data(6))));
    }
}
