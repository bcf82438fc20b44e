//! Set of running channels, for reuse by domain and bulk shutdown

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{Channel, ChannelError};
use crate::config::ChannelConfig;
use crate::transport::TransportFactory;

#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<Vec<Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by the whole process
    pub fn global() -> &'static Arc<ChannelRegistry> {
        static GLOBAL: OnceLock<Arc<ChannelRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ChannelRegistry::new()))
    }

    pub fn register(self: &Arc<Self>, channel: &Arc<Channel>) {
        {
            let mut channels = self.channels.lock();
            if !channels.iter().any(|c| Arc::ptr_eq(c, channel)) {
                channels.push(channel.clone());
            }
        }
        *channel.registry.lock() = Arc::downgrade(self);
    }

    /// Returns false if the channel was not registered
    pub fn unregister(&self, channel: &Channel) -> bool {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|c| !std::ptr::eq(Arc::as_ptr(c), channel));
        channels.len() != before
    }

    /// First registered channel matching `predicate`
    pub fn find(&self, predicate: impl Fn(&Channel) -> bool) -> Option<Arc<Channel>> {
        self.channels
            .lock()
            .iter()
            .find(|c| predicate(c))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Hand out a started channel in `config.domain`, creating, starting
    /// and registering one when none exists or reuse is disabled.
    pub async fn get_or_create(
        self: &Arc<Self>,
        config: ChannelConfig,
        transports: &TransportFactory,
    ) -> Result<Arc<Channel>, ChannelError> {
        if config.reuse_channels {
            let existing = self.find(|c| c.is_started() && c.domain() == config.domain);
            if let Some(channel) = existing {
                debug!("Reusing channel {} for '{}'", channel.self_id(), config.domain);
                return Ok(channel);
            }
        }

        let channel = Channel::new(config, transports)?;
        channel.start().await?;
        self.register(&channel);
        Ok(channel)
    }

    /// Close every registered channel
    pub async fn close_all(&self) {
        let channels = std::mem::take(&mut *self.channels.lock());
        if channels.is_empty() {
            return;
        }
        info!("Closing {} channel(s)", channels.len());
        for channel in channels {
            channel.close().await;
        }
    }
}
