use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use sluice_core::PeerId;
use sluice_transport::{PeerDisconnector, RequestTransport};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::announce::AnnouncedItem;
use crate::fetcher::{Fetcher, ValidationJob};
use crate::policy::AbusePolicy;
use crate::sink::{run_admission, AdmissionOutcome, AdmissionSink, RejectClassifier};
use crate::state::{DeliveryId, JobId};
use crate::stats::FetcherStats;

/// Events accepted by the fetcher event loop.
#[derive(Debug)]
pub enum Command<I> {
    Announce {
        peer: PeerId,
        items: Vec<AnnouncedItem>,
        reply: oneshot::Sender<usize>,
    },
    Deliver {
        peer: PeerId,
        items: Vec<I>,
        solicited: bool,
        reply: oneshot::Sender<Vec<AdmissionOutcome>>,
    },
    Disconnect {
        peer: PeerId,
    },
    Stats {
        reply: oneshot::Sender<FetcherStats>,
    },
}

type JobDone = (JobId, Vec<AdmissionOutcome>);

/// Moves one sink call onto the blocking pool. A panicking sink rejects the
/// whole batch instead of taking the loop down.
fn dispatch_job<S, C>(
    job: ValidationJob<S::Item>,
    sink: &Arc<S>,
    classifier: &Arc<C>,
    done_tx: &mpsc::UnboundedSender<JobDone>,
) where
    S: AdmissionSink,
    C: RejectClassifier<S::Error>,
{
    let sink = Arc::clone(sink);
    let classifier = Arc::clone(classifier);
    let done_tx = done_tx.clone();
    tokio::task::spawn_blocking(move || {
        let n = job.items.len();
        let items = job.items;
        let outcomes = catch_unwind(AssertUnwindSafe(|| {
            run_admission(sink.as_ref(), classifier.as_ref(), items)
        }))
        .unwrap_or_else(|_| {
            warn!("fetcher: admission sink panicked on a batch of {} items", n);
            vec![AdmissionOutcome::OtherReject; n]
        });
        // Loop gone means shutdown; the outcome has nowhere to go.
        let _ = done_tx.send((job.id, outcomes));
    });
}

/// Runs the fetcher until `shutdown` fires or every command sender is gone.
///
/// All tracking state stays on this task. After each event the loop
/// schedules requests, starts runnable validation jobs, and answers
/// deliveries whose items all have outcomes.
pub async fn run_event_loop<S, C, T, D, P>(
    mut fetcher: Fetcher<S::Item, T, D, P>,
    sink: Arc<S>,
    classifier: Arc<C>,
    mut commands: mpsc::Receiver<Command<S::Item>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    S: AdmissionSink,
    C: RejectClassifier<S::Error>,
    T: RequestTransport,
    D: PeerDisconnector,
    P: AbusePolicy,
{
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<JobDone>();
    let mut waiters: HashMap<DeliveryId, oneshot::Sender<Vec<AdmissionOutcome>>> = HashMap::new();
    let mut ticker = tokio::time::interval(fetcher.config().tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "fetcher: event loop started (workers={}, tick={:?})",
        fetcher.config().max_validation_workers,
        fetcher.config().tick_interval
    );

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            maybe_cmd = commands.recv() => {
                let Some(cmd) = maybe_cmd else {
                    break;
                };
                let now = Instant::now();
                match cmd {
                    Command::Announce { peer, items, reply } => {
                        let accepted = fetcher.announce(&peer, &items, now);
                        let _ = reply.send(accepted);
                    }
                    Command::Deliver { peer, items, solicited, reply } => {
                        let id = fetcher.deliver(&peer, items, solicited);
                        waiters.insert(id, reply);
                    }
                    Command::Disconnect { peer } => fetcher.disconnect_peer(&peer),
                    Command::Stats { reply } => {
                        let _ = reply.send(fetcher.stats());
                    }
                }
            }
            Some((job, outcomes)) = done_rx.recv() => {
                fetcher.complete_job(job, outcomes, Instant::now());
            }
            _ = ticker.tick() => {
                fetcher.sweep_timeouts(Instant::now());
            }
        }

        let now = Instant::now();
        fetcher.schedule(now);
        for job in fetcher.next_jobs(now) {
            dispatch_job(job, &sink, &classifier, &done_tx);
        }
        for report in fetcher.take_completed() {
            if let Some(reply) = waiters.remove(&report.id) {
                let _ = reply.send(report.outcomes);
            }
        }
    }

    // Dropping the waiters resolves pending deliver calls with `Stopped`.
    debug!(
        "fetcher: event loop stopping with {} pending deliveries, {} jobs in flight",
        waiters.len(),
        fetcher.in_flight_jobs()
    );
    info!("fetcher: event loop stopped");
}
