//! The periodic tick and the trait every resource analyser implements.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub name: String,
    pub source: Option<String>,
    pub time: std::time::Instant,
}

#[async_trait]
pub trait ResourceAnalyser: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    async fn analyse(&self, event: &ResourceEvent) -> anyhow::Result<()>;
    async fn query(&self, arg: f64) -> anyhow::Result<f64>;
}
