#[cfg(feature = "cloud-events")]
mod cloud_events;
#[cfg(feature = "cloud-events")]
pub use cloud_events::{
    CLOUD_EVENTS_CONTENT_TYPE, CloudEventsLayer, CloudEventsMessage, CloudEventsService,
};
