//! Notification channels and the retrying dispatcher.

pub mod channels;
pub mod dispatcher;

pub use channels::{ChannelConfig, channel_from_row};
pub use dispatcher::{Dispatcher, HttpTransport, NotificationMessage, Transport};
