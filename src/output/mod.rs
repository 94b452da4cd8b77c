//! Output router: fans one execution result out to its configured sinks.
//! Destinations are attempted independently; one failing sink never
//! prevents delivery to its siblings.


use crate::config::Config;
use crate::error::DeliveryError;
use crate::executor::ExecutionResult;
use crate::gateway::api::TelegramApi;
use crate::jobs::OutputDestination;
use crate::util::write_atomic;
use std::path::PathBuf;

/// Telegram caps messages at 4096 chars; leave margin for safety.
const MAX_CHAT_CHUNK: usize = 4000;

#[derive(Debug)]
pub struct DeliveryOutcome {
    pub destination: OutputDestination,
    pub delivery: Result<Delivered, DeliveryError>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Delivered {
    File(PathBuf),
    Chat(i64),
}

pub struct Router {
    output_dir: PathBuf,
    chat: Option<TelegramApi>,
}

impl Router {
    pub fn new(config: &Config) -> Self {
        let chat = config
            .gateway
            .is_available()
            .then(|| TelegramApi::new(&config.gateway.bot_token));
        Self {
            output_dir: config.paths.output_dir(),
            chat,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_parts(output_dir: PathBuf, chat: Option<TelegramApi>) -> Self {
        Self { output_dir, chat }
    }

    /// Deliver `result` to each destination, returning one outcome per
    /// destination in order. Failure reports are routed exactly like
    /// successes so the operator sees them without polling logs.
    pub async fn route(
        &self,
        result: &ExecutionResult,
        destinations: &[OutputDestination],
    ) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let delivery = match destination {
                OutputDestination::File => self.deliver_file(result).map(Delivered::File),
                OutputDestination::Chat(chat_id) => self
                    .deliver_chat(result, *chat_id)
                    .await
                    .map(|()| Delivered::Chat(*chat_id)),
            };
            if let Err(ref error) = delivery {
                tracing::warn!(
                    reference = %result.reference,
                    destination = %destination,
                    %error,
                    "delivery failed"
                );
            }
            outcomes.push(DeliveryOutcome {
                destination: *destination,
                delivery,
            });
        }
        outcomes
    }

    /// One directory per job id, one file per execution named by its start
    /// timestamp. Written atomically so a concurrent reader never sees a
    /// partial file.
    fn deliver_file(&self, result: &ExecutionResult) -> Result<PathBuf, DeliveryError> {
        let dir = self.output_dir.join(&result.reference);
        let filename = format!("{}.md", result.started_at.format("%Y-%m-%d_%H-%M-%S"));
        let path = dir.join(filename);

        write_atomic(&path, &render_report(result))
            .map_err(|e| DeliveryError::Io(std::io::Error::other(e.to_string())))?;
        tracing::info!(path = %path.display(), "output saved");
        Ok(path)
    }

    async fn deliver_chat(
        &self,
        result: &ExecutionResult,
        chat_id: i64,
    ) -> Result<(), DeliveryError> {
        let Some(ref api) = self.chat else {
            return Err(DeliveryError::GatewayUnavailable(
                "gateway disabled or bot token unset".into(),
            ));
        };

        let text = render_chat_message(result);
        for chunk in split_chunks(&text, MAX_CHAT_CHUNK) {
            api.send_message(chat_id, &chunk)
                .await
                .map_err(|e| DeliveryError::Send(e.to_string()))?;
        }
        tracing::info!(chat_id, reference = %result.reference, "output sent to chat");
        Ok(())
    }
}

fn render_report(result: &ExecutionResult) -> String {
    let mut report = format!(
        "# {}\n\nStatus: {}\nStarted: {}\nEnded: {}\n",
        result.reference,
        result.status.label(),
        result.started_at.to_rfc3339(),
        result.ended_at.to_rfc3339(),
    );
    if let Some(cost) = result.cost_usd {
        report.push_str(&format!("Cost: ${cost:.4}\n"));
    }
    if let Some(turns) = result.turns_used {
        report.push_str(&format!("Turns: {turns}\n"));
    }
    report.push_str("\n---\n\n");
    report.push_str(&result.output_text);
    report.push('\n');
    report
}

fn render_chat_message(result: &ExecutionResult) -> String {
    if result.status.is_success() {
        format!("{}\n\n{}", result.reference, result.output_text)
    } else {
        format!(
            "{} failed ({})\n\n{}",
            result.reference,
            result.status.label(),
            result.output_text
        )
    }
}

/// Split on char boundaries, preferring the last newline inside a chunk.
fn split_chunks(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if rest.chars().count() <= max_len {
            chunks.push(rest.to_string());
            break;
        }

        let hard_end = rest
            .char_indices()
            .nth(max_len)
            .map_or(rest.len(), |(i, _)| i);
        let cut = rest[..hard_end]
            .rfind('\n')
            .map_or(hard_end, |i| i + 1);

        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    chunks
}
