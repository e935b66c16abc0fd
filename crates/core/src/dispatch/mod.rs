//! Hands a finished analysis to notification channels. Formatting and delivery details live in
//! the channels; the dispatcher only guarantees that every channel gets its own attempt.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::domain::AnalysisResult;
use crate::ingest::FetchError;
use crate::retry::RetryPolicy;

#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, result: &AnalysisResult) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub channel: String,
    pub delivered: bool,
    pub error: Option<String>,
}

#[derive(Clone, Default)]
pub struct Dispatcher {
    channels: Vec<Arc<dyn Channel>>,
}

impl Dispatcher {
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self { channels }
    }

    /// Structured log output always; a webhook when `DISPATCH_WEBHOOK_URL` is set.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut channels: Vec<Arc<dyn Channel>> = vec![Arc::new(LogChannel)];
        if let Some(url) = settings.dispatch_webhook_url.as_deref() {
            channels.push(Arc::new(WebhookChannel::new(
                url,
                settings.provider.timeout,
                settings.provider.retry,
            )?));
        }
        Ok(Self::new(channels))
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// Attempts every channel once, in order. A failing channel is recorded and skipped.
    pub async fn dispatch(&self, result: &AnalysisResult) -> Vec<ChannelOutcome> {
        let mut outcomes = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let outcome = match channel.deliver(result).await {
                Ok(()) => ChannelOutcome {
                    channel: channel.name().to_string(),
                    delivered: true,
                    error: None,
                },
                Err(err) => {
                    tracing::warn!(
                        market = %result.market,
                        as_of_date = %result.as_of_date,
                        run_id = %result.meta.run_id,
                        channel = channel.name(),
                        error = %format!("{err:#}"),
                        "dispatch channel failed"
                    );
                    ChannelOutcome {
                        channel: channel.name().to_string(),
                        delivered: false,
                        error: Some(format!("{err:#}")),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Writes a one-line summary per run to the tracing output.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait::async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, result: &AnalysisResult) -> anyhow::Result<()> {
        let top: Vec<&str> = result
            .ranking
            .entries
            .iter()
            .take(3)
            .map(|e| e.sector_code.as_str())
            .collect();
        let entered: Vec<&str> = result
            .rotation
            .iter()
            .flat_map(|r| r.entered.iter().map(String::as_str))
            .collect();

        tracing::info!(
            market = %result.market,
            as_of_date = %result.as_of_date,
            run_id = %result.meta.run_id,
            currency = %result.meta.currency,
            sectors = result.meta.sectors_fetched,
            degraded_sectors = result.meta.degraded_sectors,
            top = ?top,
            entered = ?entered,
            trends = result.trends.len(),
            trend_gaps = result.trend_gaps.len(),
            "sector flow analysis"
        );
        Ok(())
    }
}

/// POSTs the JSON bundle to a fixed URL, retrying transient failures.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    http: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl WebhookChannel {
    pub fn new(url: &str, timeout: Duration, retry: RetryPolicy) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook http client")?;
        Ok(Self {
            http,
            url: url.to_string(),
            retry,
        })
    }

    async fn post_once(&self, result: &AnalysisResult) -> Result<(), FetchError> {
        let res = self.http.post(&self.url).json(result).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status, &body));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, result: &AnalysisResult) -> anyhow::Result<()> {
        self.retry
            .run("dispatch webhook", || self.post_once(result))
            .await
            .with_context(|| format!("webhook delivery to {} failed", self.url))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingChannel;
    use super::*;
    use crate::domain::{Currency, Market, RankingResult, RunMetadata};
    use chrono::{NaiveDate, Utc};

    fn result() -> AnalysisResult {
        let date = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();
        AnalysisResult {
            market: Market::Us,
            as_of_date: date,
            ranking: RankingResult {
                market: Market::Us,
                as_of_date: date,
                top_n: 10,
                entries: Vec::new(),
            },
            rotation: None,
            rotation_signals: Vec::new(),
            trends: Vec::new(),
            trend_gaps: Vec::new(),
            meta: RunMetadata {
                run_id: uuid::Uuid::new_v4(),
                provider: "test".to_string(),
                currency: Currency::Usd,
                generated_at: Utc::now(),
                sectors_fetched: 0,
                degraded_sectors: 0,
                provider_degraded: false,
                previous_date: None,
                store_error: None,
            },
        }
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let broken = Arc::new(RecordingChannel {
            fail: true,
            ..Default::default()
        });
        let good = Arc::new(RecordingChannel::default());
        let channels: Vec<Arc<dyn Channel>> = vec![broken, good.clone(), Arc::new(LogChannel)];
        let dispatcher = Dispatcher::new(channels);

        let outcomes = dispatcher.dispatch(&result()).await;
        assert_eq!(outcomes.len(), 3);
        assert!(!outcomes[0].delivered);
        assert_eq!(outcomes[0].error.as_deref(), Some("channel offline"));
        assert!(outcomes[1].delivered);
        assert!(outcomes[2].delivered);
        assert_eq!(good.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn webhook_is_added_only_when_configured() {
        let plain = Settings::from_lookup(|_| None).unwrap();
        assert_eq!(Dispatcher::from_settings(&plain).unwrap().channel_names(), vec!["log"]);

        let hooked = Settings::from_lookup(|k| {
            (k == "DISPATCH_WEBHOOK_URL").then(|| "http://127.0.0.1:9/hook".to_string())
        })
        .unwrap();
        assert_eq!(
            Dispatcher::from_settings(&hooked).unwrap().channel_names(),
            vec!["log", "webhook"]
        );
    }
}
