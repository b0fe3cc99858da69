use std::sync::Arc;

use sluice_core::PeerId;
use sluice_transport::{PeerDisconnector, RequestTransport};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::announce::AnnouncedItem;
use crate::config::FetcherConfig;
use crate::error::FetcherError;
use crate::fetcher::Fetcher;
use crate::policy::{AbusePolicy, WindowedAbusePolicy};
use crate::runtime::{run_event_loop, Command};
use crate::sink::{AdmissionOutcome, AdmissionSink, PoolItem, RejectClassifier};
use crate::stats::FetcherStats;

/// Cloneable entry point used by protocol session tasks.
pub struct FetcherHandle<I> {
    tx: mpsc::Sender<Command<I>>,
}

impl<I> Clone for FetcherHandle<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<I> FetcherHandle<I> {
    async fn send(&self, cmd: Command<I>) -> Result<(), FetcherError> {
        self.tx.send(cmd).await.map_err(|_| FetcherError::Stopped)
    }

    /// Records announced hashes. Returns how many were accepted.
    pub async fn announce(
        &self,
        peer: PeerId,
        items: Vec<AnnouncedItem>,
    ) -> Result<usize, FetcherError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Announce { peer, items, reply }).await?;
        rx.await.map_err(|_| FetcherError::Stopped)
    }

    /// Submits a delivery and waits until every item has an outcome.
    pub async fn deliver(
        &self,
        peer: PeerId,
        items: Vec<I>,
        solicited: bool,
    ) -> Result<Vec<AdmissionOutcome>, FetcherError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Deliver {
            peer,
            items,
            solicited,
            reply,
        })
        .await?;
        rx.await.map_err(|_| FetcherError::Stopped)
    }

    /// Tells the loop that `peer` went away.
    pub async fn disconnect_peer(&self, peer: PeerId) -> Result<(), FetcherError> {
        self.send(Command::Disconnect { peer }).await
    }

    /// Snapshot of counters and gauges.
    pub async fn stats(&self) -> Result<FetcherStats, FetcherError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| FetcherError::Stopped)
    }
}

/// Owns the event loop task. Must be started inside a tokio runtime.
pub struct FetcherService<I> {
    handle: FetcherHandle<I>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl<I: PoolItem + Send + 'static> FetcherService<I> {
    /// Validates `config` and spawns the event loop with the default abuse
    /// policy.
    pub fn start<S, C, T, D>(
        config: FetcherConfig,
        sink: S,
        classifier: C,
        transport: T,
        disconnector: D,
    ) -> Result<Self, FetcherError>
    where
        S: AdmissionSink<Item = I>,
        C: RejectClassifier<S::Error>,
        T: RequestTransport + Send + 'static,
        D: PeerDisconnector + Send + 'static,
    {
        let policy = WindowedAbusePolicy::new(config.abuse.clone(), config.peer_record_cache_size);
        Self::start_with_policy(config, sink, classifier, transport, disconnector, policy)
    }

    /// Like [`FetcherService::start`], with a custom abuse policy.
    pub fn start_with_policy<S, C, T, D, P>(
        config: FetcherConfig,
        sink: S,
        classifier: C,
        transport: T,
        disconnector: D,
        policy: P,
    ) -> Result<Self, FetcherError>
    where
        S: AdmissionSink<Item = I>,
        C: RejectClassifier<S::Error>,
        T: RequestTransport + Send + 'static,
        D: PeerDisconnector + Send + 'static,
        P: AbusePolicy + Send + 'static,
    {
        let capacity = config.command_queue_capacity.max(1);
        let fetcher = Fetcher::with_policy(config, transport, disconnector, policy)?;
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = tokio::spawn(run_event_loop(
            fetcher,
            Arc::new(sink),
            Arc::new(classifier),
            rx,
            shutdown_rx,
        ));
        Ok(Self {
            handle: FetcherHandle { tx },
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    /// Cloneable handle for submitting events.
    pub fn handle(&self) -> FetcherHandle<I> {
        self.handle.clone()
    }

    /// Signals shutdown and waits for the loop to exit. Pending `deliver`
    /// calls resolve with [`FetcherError::Stopped`].
    pub async fn stop(mut self) -> Result<(), FetcherError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.worker.take() {
            Some(worker) => worker
                .await
                .map_err(|err| FetcherError::TaskFailed(err.to_string())),
            None => Ok(()),
        }
    }
}

impl<I> Drop for FetcherService<I> {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
