//! Mailbox adapter over the durable event log (spec §4.1): send/recv/
//! drain/register/unregister, plus summary mirroring so monitors and
//! external status readers can query progress without replaying mail.

use std::sync::Arc;

use eyre::{Context, Result};
use eventlog::{RecvResult, Store};

/// Prefixes whose outbound mail is also appended as a `summary` event
/// (spec §4.1).
const SUMMARY_PREFIXES: &[&str] = &["summary:", "done:", "complete", "status:", "fail:", "pause:"];

#[derive(Clone)]
pub struct Mailbox {
    store: Arc<Store>,
}

impl Mailbox {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub async fn register(&self, box_name: &str) -> Result<()> {
        let store = self.store.clone();
        let box_name = box_name.to_string();
        tokio::task::spawn_blocking(move || store.register(&box_name))
            .await
            .context("join register task")?
            .context("register mailbox")
    }

    pub async fn unregister(&self, box_name: &str) -> Result<()> {
        let store = self.store.clone();
        let box_name = box_name.to_string();
        tokio::task::spawn_blocking(move || store.unregister(&box_name))
            .await
            .context("join unregister task")?
            .context("unregister mailbox")
    }

    /// Sends `body` to `box_name` and, if `body`'s prefix matches one of
    /// the summary-worthy prefixes, mirrors it as a `summary` event
    /// tagged `derive_tag(box_name, body)`. A mirroring failure is logged
    /// but never fails the send itself.
    pub async fn send(&self, box_name: &str, from: &str, body: &str) -> Result<()> {
        let store = self.store.clone();
        let box_name_owned = box_name.to_string();
        let from_owned = from.to_string();
        let body_owned = body.to_string();
        tokio::task::spawn_blocking(move || store.send(&box_name_owned, Some(&from_owned), &body_owned))
            .await
            .context("join send task")?
            .context("send mail")?;

        if let Some(prefix) = SUMMARY_PREFIXES.iter().find(|p| body.starts_with(**p)) {
            let tag = derive_summary_tag(prefix, body);
            let store = self.store.clone();
            let body_owned = body.to_string();
            let from_owned = from.to_string();
            let mirrored = tokio::task::spawn_blocking(move || store.log("summary", Some(&tag), &body_owned, Some(&from_owned))).await;
            if let Err(e) = mirrored {
                tracing::warn!(error = %e, "summary mirroring join failed");
            } else if let Ok(Err(e)) = mirrored {
                tracing::warn!(error = %e, "summary mirroring write failed");
            }
        }
        Ok(())
    }

    pub async fn recv(&self, box_name: &str, timeout_secs: u64) -> Result<Option<String>> {
        let store = self.store.clone();
        let box_name = box_name.to_string();
        let result = tokio::task::spawn_blocking(move || store.recv(&box_name, timeout_secs))
            .await
            .context("join recv task")?
            .context("recv mail")?;
        Ok(match result {
            RecvResult::Message(body) => Some(body),
            RecvResult::Timeout => None,
        })
    }

    pub async fn drain(&self, box_name: &str) -> Result<Vec<String>> {
        let store = self.store.clone();
        let box_name = box_name.to_string();
        tokio::task::spawn_blocking(move || store.drain(&box_name))
            .await
            .context("join drain task")?
            .context("drain mailbox")
    }

    pub async fn log(&self, kind: &str, tag: Option<&str>, body: &str, agent: Option<&str>) -> Result<i64> {
        let store = self.store.clone();
        let kind = kind.to_string();
        let tag = tag.map(str::to_string);
        let body = body.to_string();
        let agent = agent.map(str::to_string);
        tokio::task::spawn_blocking(move || store.log(&kind, tag.as_deref(), &body, agent.as_deref()))
            .await
            .context("join log task")?
            .context("log event")
    }

    pub async fn query(
        &self,
        kind: Option<&str>,
        tag: Option<&str>,
        since_id: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<eventlog::Event>> {
        let store = self.store.clone();
        let kind = kind.map(str::to_string);
        let tag = tag.map(str::to_string);
        tokio::task::spawn_blocking(move || store.query(kind.as_deref(), tag.as_deref(), since_id, limit))
            .await
            .context("join query task")?
            .context("query events")
    }
}

/// Derives a summary tag from a mail body, e.g. `proposal-align:03` or
/// `coordination:round-2`. Falls back to the matched prefix (without its
/// trailing colon) when the body has no further structure.
fn derive_summary_tag(prefix: &str, body: &str) -> String {
    let rest = &body[prefix.len()..];
    let parts: Vec<&str> = rest.splitn(3, ':').collect();
    match parts.as_slice() {
        [stage, section, ..] if !stage.is_empty() && !section.is_empty() => format!("{stage}:{section}"),
        [single, ..] if !single.is_empty() => single.to_string(),
        _ => prefix.trim_end_matches(':').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_stage_section_tag() {
        assert_eq!(derive_summary_tag("summary:", "summary:proposal-align:03:ALIGNED"), "proposal-align:03");
    }

    #[test]
    fn derives_tag_for_bare_complete() {
        assert_eq!(derive_summary_tag("complete", "complete"), "complete");
    }

    #[test]
    fn derives_tag_for_done() {
        assert_eq!(derive_summary_tag("done:", "done:03:2 files modified"), "03:2 files modified");
    }
}
