//! Background memory sampler.
//!
//! Polls the accounting group at a fixed period and writes one table row per
//! successful poll, flushing after each so partial output survives an abrupt
//! end of the run. A failed poll is logged and the loop carries on.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use crate::accounting::AccountingGroup;
use crate::sample::StatsLayout;

/// Periodic reader of one accounting group.
#[derive(Debug)]
pub struct Sampler {
    group: Arc<dyn AccountingGroup>,
    layout: StatsLayout,
    period: Duration,
    started: Instant,
}

impl Sampler {
    /// Sampler for `group`, rendering `layout` columns every `period`, with
    /// elapsed time measured from `started`.
    #[must_use]
    pub fn new(
        group: Arc<dyn AccountingGroup>,
        layout: StatsLayout,
        period: Duration,
        started: Instant,
    ) -> Self {
        Self {
            group,
            layout,
            period,
            started,
        }
    }

    /// Run the sampler on its own task until `cancel` fires.
    #[must_use]
    pub fn spawn<W>(self, out: W, cancel: CancellationToken) -> JoinHandle<()>
    where
        W: Write + Send + 'static,
    {
        tokio::spawn(self.run(out, cancel).in_current_span())
    }

    /// Write the header, then one row per tick until `cancel` fires.
    pub async fn run<W: Write>(self, mut out: W, cancel: CancellationToken) {
        emit(&mut out, &self.layout.header());

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("sampler stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            // Reads go through the filesystem; keep them off the runtime workers.
            let group = Arc::clone(&self.group);
            match tokio::task::spawn_blocking(move || group.stats()).await {
                Ok(Ok(stats)) => {
                    let sample = self.layout.sample(self.started.elapsed(), &stats);
                    emit(&mut out, &sample.row());
                }
                Ok(Err(err)) => error!(%err, "failed to get stats"),
                Err(err) => error!(%err, "stats task failed"),
            }
        }
    }
}

fn emit<W: Write>(out: &mut W, line: &str) {
    if let Err(err) = writeln!(out, "{line}").and_then(|()| out.flush()) {
        warn!(%err, "failed to write sample row");
    }
}
