use crate::error::ReadinessError;
use crate::mux::{OutputEvent, StreamKind};
use cip_manifest::{Readiness, ReadinessMethod};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Decides when a started server counts as ready.
pub trait ReadinessStrategy: Send + Sync {
    fn describe(&self) -> String;

    /// Ready as soon as the process exists; no output is awaited.
    fn ready_on_start(&self) -> bool {
        false
    }

    fn is_ready(&self, event: &OutputEvent) -> bool;
}

/// Ready once a line contains the marker, optionally only on one stream.
#[derive(Debug, Clone)]
pub struct MarkerLine {
    marker: String,
    stream: Option<StreamKind>,
}

impl MarkerLine {
    pub fn new(marker: impl Into<String>, stream: Option<StreamKind>) -> Self {
        Self {
            marker: marker.into(),
            stream,
        }
    }
}

impl ReadinessStrategy for MarkerLine {
    fn describe(&self) -> String {
        match self.stream {
            Some(stream) => format!("line containing '{}' on {}", self.marker, stream),
            None => format!("line containing '{}'", self.marker),
        }
    }

    fn is_ready(&self, event: &OutputEvent) -> bool {
        self.stream.map_or(true, |stream| stream == event.stream)
            && event.line.contains(&self.marker)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl ReadinessStrategy for Immediate {
    fn describe(&self) -> String {
        "immediate".to_string()
    }

    fn ready_on_start(&self) -> bool {
        true
    }

    fn is_ready(&self, _event: &OutputEvent) -> bool {
        true
    }
}

pub fn strategy_for(readiness: &Readiness) -> Box<dyn ReadinessStrategy> {
    match readiness.method {
        ReadinessMethod::StructuredStdout => Box::new(MarkerLine::new(
            readiness.marker.clone(),
            Some(StreamKind::Stdout),
        )),
        ReadinessMethod::LogMarker => Box::new(MarkerLine::new(readiness.marker.clone(), None)),
        ReadinessMethod::None => Box::new(Immediate),
    }
}

/// Reads the server's tapped stream until `strategy` accepts a line.
pub async fn wait_ready(
    cancel: &CancellationToken,
    events: &mut mpsc::UnboundedReceiver<OutputEvent>,
    strategy: &dyn ReadinessStrategy,
    timeout: Duration,
) -> Result<(), ReadinessError> {
    if strategy.ready_on_start() {
        return Ok(());
    }
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReadinessError::Cancelled),
            event = events.recv() => match event {
                Some(event) if strategy.is_ready(&event) => {
                    tracing::debug!(line = %event.line, "server reported ready");
                    return Ok(());
                }
                Some(_) => {}
                None => return Err(ReadinessError::ServerExited),
            },
            _ = &mut deadline => return Err(ReadinessError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cip_core::Role;

    fn line(stream: StreamKind, text: &str) -> OutputEvent {
        OutputEvent::new(Role::Server, stream, text)
    }

    #[test]
    fn strategies_follow_the_readiness_method() {
        let mut readiness = Readiness::default();
        let strategy = strategy_for(&readiness);
        assert!(strategy.is_ready(&line(StreamKind::Stdout, "server READY on 0.0.0.0")));
        assert!(!strategy.is_ready(&line(StreamKind::Stderr, "READY")));
        assert!(!strategy.is_ready(&line(StreamKind::Stdout, "starting")));

        readiness.method = ReadinessMethod::LogMarker;
        readiness.marker = "listening".to_string();
        let strategy = strategy_for(&readiness);
        assert!(strategy.is_ready(&line(StreamKind::Stderr, "listening on 44818")));

        readiness.method = ReadinessMethod::None;
        assert!(strategy_for(&readiness).ready_on_start());
    }

    #[tokio::test]
    async fn wait_ready_reports_each_outcome() {
        let cancel = CancellationToken::new();
        let marker = MarkerLine::new("READY", None);

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(line(StreamKind::Stdout, "booting")).expect("send");
        tx.send(line(StreamKind::Stdout, "READY")).expect("send");
        wait_ready(&cancel, &mut rx, &marker, Duration::from_secs(5))
            .await
            .expect("ready");

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(line(StreamKind::Stdout, "booting")).expect("send");
        drop(tx);
        assert_eq!(
            wait_ready(&cancel, &mut rx, &marker, Duration::from_secs(5)).await,
            Err(ReadinessError::ServerExited)
        );

        let (_tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(
            wait_ready(&cancel, &mut rx, &marker, Duration::from_millis(50)).await,
            Err(ReadinessError::Timeout(Duration::from_millis(50)))
        );

        cancel.cancel();
        let (_tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(
            wait_ready(&cancel, &mut rx, &marker, Duration::from_secs(5)).await,
            Err(ReadinessError::Cancelled)
        );
    }
}
