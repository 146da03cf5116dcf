//! A topic that does nothing.

use async_trait::async_trait;

use super::{Topic, TopicDelivery};
use crate::error::TopicError;
use crate::schemas::TopicMessage;

pub struct NullTopic {
    name: String,
}

impl NullTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Topic for NullTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), TopicError> {
        Ok(())
    }

    async fn publish(&self, _message: &TopicMessage, _wait: bool) -> Result<bool, TopicError> {
        Ok(true)
    }

    async fn next(&self) -> Result<Option<TopicDelivery>, TopicError> {
        Ok(None)
    }

    async fn close(&self) -> Result<(), TopicError> {
        Ok(())
    }
}
