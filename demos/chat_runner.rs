//! Summarises every line of `prompts.txt` with a chat model.
//!
//! The first run submits the batch and registers a periodic re-invocation of
//! this binary; later runs collect answers into `answers/<custom_id>.txt`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use tracing::warn;

use batchwork::app::{RunOutcome, launch};
use batchwork::clients::batch_api::models::{
    BatchInputItem, ChatCompletionRequest, ChatMessage, OutputStatus,
};
use batchwork::runner::{BatchRunner, ErrorStream, InputStream, OutputStream, RunnerRegistry};
use batchwork::store::models::WorkConfig;

const MODEL: &str = "gpt-4o-mini";

struct ChatRunner {
    prompts: Vec<String>,
    answers_dir: PathBuf,
}

impl ChatRunner {
    fn load(prompts_path: &str, answers_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(prompts_path)
            .with_context(|| format!("failed to read {prompts_path}"))?;
        Ok(Self {
            prompts: text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToString::to_string)
                .collect(),
            answers_dir: answers_dir.into(),
        })
    }
}

#[async_trait]
impl BatchRunner for ChatRunner {
    fn work_config(&self) -> WorkConfig {
        WorkConfig::default()
            .with_name("prompt-summaries")
            .with_check_interval(Duration::from_secs(60 * 60))
    }

    fn upload(&self) -> InputStream<'_> {
        let items = self.prompts.iter().enumerate().map(|(index, prompt)| {
            let request = ChatCompletionRequest::new(
                MODEL,
                vec![
                    ChatMessage::system("Summarise the user's text in one sentence."),
                    ChatMessage::user(prompt.clone()),
                ],
            );
            BatchInputItem::chat(format!("prompt-{index}"), &request).map_err(anyhow::Error::from)
        });
        stream::iter(items).boxed()
    }

    async fn download(&self, items: OutputStream<'_>) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.answers_dir).await?;
        items
            .try_for_each(|item| async move {
                if item.status == OutputStatus::Failed {
                    warn!(custom_id = %item.custom_id, error = ?item.error, "request failed");
                    return Ok(());
                }
                // One file per custom id keeps repeated deliveries harmless.
                let path = self.answers_dir.join(format!("{}.txt", item.custom_id));
                tokio::fs::write(&path, item.content.unwrap_or_default())
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))
            })
            .await
    }

    async fn download_error(&self, items: ErrorStream<'_>) -> anyhow::Result<()> {
        items
            .try_for_each(|item| async move {
                warn!(
                    custom_id = %item.custom_id,
                    code = ?item.code,
                    message = ?item.message,
                    "request rejected"
                );
                Ok(())
            })
            .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runner = ChatRunner::load("prompts.txt", "answers")?;
    let runners = RunnerRegistry::new().with_runner("chat", Arc::new(runner));

    match launch(runners, "chat").await? {
        RunOutcome::Finished(work) => println!("{} is {}", work.id, work.status),
        RunOutcome::AlreadyRunning { work_id, .. } => println!("{work_id} is busy"),
    }
    Ok(())
}
