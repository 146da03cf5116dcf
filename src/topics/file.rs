//! File-backed topic, one JSON message per line.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::sync::Mutex;

use super::{Topic, TopicDelivery};
use crate::error::TopicError;
use crate::schemas::TopicMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FileMode {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "w")]
    Write,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileTopicOptions {
    pub path: PathBuf,
    pub mode: FileMode,
}

enum FileState {
    Unopened,
    Reading(Lines<BufReader<File>>),
    Writing(BufWriter<File>),
    Closed,
}

pub struct FileTopic {
    name: String,
    options: FileTopicOptions,
    state: Mutex<FileState>,
}

impl FileTopic {
    pub fn from_options(name: impl Into<String>, options: FileTopicOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: Mutex::new(FileState::Unopened),
        }
    }

    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, mode: FileMode) -> Self {
        Self::from_options(
            name,
            FileTopicOptions {
                path: path.into(),
                mode,
            },
        )
    }
}

#[async_trait]
impl Topic for FileTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), TopicError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, FileState::Unopened) {
            return Ok(());
        }
        *state = match self.options.mode {
            FileMode::Read => {
                let file = File::open(&self.options.path).await?;
                FileState::Reading(BufReader::new(file).lines())
            }
            FileMode::Write => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.options.path)
                    .await?;
                FileState::Writing(BufWriter::new(file))
            }
        };
        Ok(())
    }

    async fn publish(&self, message: &TopicMessage, _wait: bool) -> Result<bool, TopicError> {
        self.open().await?;
        let mut state = self.state.lock().await;
        match &mut *state {
            FileState::Writing(writer) => {
                let mut line = serde_json::to_vec(message)?;
                line.push(b'\n');
                writer.write_all(&line).await?;
                writer.flush().await?;
                Ok(true)
            }
            FileState::Closed => Err(TopicError::Closed),
            _ => Err(TopicError::Io(std::io::Error::new(
                ErrorKind::Unsupported,
                "topic opened in read mode",
            ))),
        }
    }

    async fn next(&self) -> Result<Option<TopicDelivery>, TopicError> {
        self.open().await?;
        let mut state = self.state.lock().await;
        match &mut *state {
            FileState::Reading(lines) => loop {
                match lines.next_line().await? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => {
                        let message: TopicMessage = serde_json::from_str(&line)?;
                        return Ok(Some(TopicDelivery::new(message)));
                    }
                    None => return Ok(None),
                }
            },
            FileState::Closed => Ok(None),
            _ => Err(TopicError::Io(std::io::Error::new(
                ErrorKind::Unsupported,
                "topic opened in write mode",
            ))),
        }
    }

    async fn close(&self) -> Result<(), TopicError> {
        let mut state = self.state.lock().await;
        if let FileState::Writing(writer) = &mut *state {
            writer.flush().await?;
        }
        *state = FileState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_file_topic_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topic.json");

        let mut second = TopicMessage::new("1", HashMap::from([("n".to_string(), json!(2))]));
        second.tags.insert("origin".into(), "backfill".into());
        second
            .metadata
            .insert("tracing".into(), json!({"traceparent": "00-aa-bb-01"}));
        let messages = vec![
            TopicMessage::new("0", HashMap::from([("n".to_string(), json!(1))])),
            second,
        ];

        let topic = FileTopic::new("t", &path, FileMode::Write);
        for message in &messages {
            assert!(topic.publish(message, true).await.unwrap());
        }
        topic.close().await.unwrap();

        let topic = FileTopic::new("t", &path, FileMode::Read);
        let mut items = Vec::new();
        while let Some(delivery) = topic.next().await.unwrap() {
            items.push(delivery.message);
        }
        assert_eq!(items, messages);
        topic.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_topic_rejects_publish() {
        let dir = tempfile::tempdir().unwrap();
        let topic = FileTopic::new("t", dir.path().join("topic.json"), FileMode::Write);
        topic.open().await.unwrap();
        topic.close().await.unwrap();
        // close is idempotent
        topic.close().await.unwrap();

        let message = TopicMessage::new("0", HashMap::new());
        assert!(matches!(
            topic.publish(&message, true).await,
            Err(TopicError::Closed)
        ));
    }
}
