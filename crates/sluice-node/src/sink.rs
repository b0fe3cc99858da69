use serde::{Deserialize, Serialize};
use sluice_core::{ItemHash, ItemKind};
use tracing::warn;

/// Metadata the fetcher needs from a delivered item.
pub trait PoolItem {
    fn hash(&self) -> ItemHash;
    fn kind(&self) -> ItemKind;
    /// Encoded size in bytes; used for sub-batch byte limits.
    fn size(&self) -> usize;
}

/// Classifier output for one sink error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectClass {
    Duplicate,
    Underpriced,
    Invalid,
    Other,
}

/// Per-item result of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdmissionOutcome {
    Accepted,
    Duplicate,
    Underpriced,
    Invalid,
    OtherReject,
    /// Never validated: unsolicited kind denied, or the peer's delivery
    /// quota was full.
    Dropped,
}

impl AdmissionOutcome {
    /// Rejects that cost real validation work and feed abuse accounting.
    pub fn is_expensive_reject(self) -> bool {
        matches!(self, AdmissionOutcome::Invalid | AdmissionOutcome::OtherReject)
    }

    /// Lowercase tag used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            AdmissionOutcome::Accepted => "accepted",
            AdmissionOutcome::Duplicate => "duplicate",
            AdmissionOutcome::Underpriced => "underpriced",
            AdmissionOutcome::Invalid => "invalid",
            AdmissionOutcome::OtherReject => "otherreject",
            AdmissionOutcome::Dropped => "dropped",
        }
    }
}

impl From<RejectClass> for AdmissionOutcome {
    fn from(class: RejectClass) -> Self {
        match class {
            RejectClass::Duplicate => AdmissionOutcome::Duplicate,
            RejectClass::Underpriced => AdmissionOutcome::Underpriced,
            RejectClass::Invalid => AdmissionOutcome::Invalid,
            RejectClass::Other => AdmissionOutcome::OtherReject,
        }
    }
}

/// Batch validator/store the fetcher admits items into.
///
/// `add` may be called concurrently from several worker threads and is
/// expected to be slow. It returns one result per input item, in order.
pub trait AdmissionSink: Send + Sync + 'static {
    type Item: PoolItem + Send + 'static;
    type Error: Send + 'static;

    fn add(&self, items: Vec<Self::Item>) -> Vec<Result<(), Self::Error>>;
}

/// Maps a sink error onto a [`RejectClass`].
pub trait RejectClassifier<E>: Send + Sync + 'static {
    fn classify(&self, err: &E) -> RejectClass;
}

impl<E, F> RejectClassifier<E> for F
where
    F: Fn(&E) -> RejectClass + Send + Sync + 'static,
{
    fn classify(&self, err: &E) -> RejectClass {
        self(err)
    }
}

/// Runs one sink call and classifies its results.
///
/// A sink returning the wrong number of results is a bug on its side; the
/// gap is filled with `OtherReject` so every item still gets an outcome.
pub fn run_admission<S, C>(sink: &S, classifier: &C, items: Vec<S::Item>) -> Vec<AdmissionOutcome>
where
    S: AdmissionSink + ?Sized,
    C: RejectClassifier<S::Error> + ?Sized,
{
    let expected = items.len();
    let results = sink.add(items);
    if results.len() != expected {
        warn!(
            "fetcher: admission sink returned {} results for {} items",
            results.len(),
            expected
        );
    }
    let mut outcomes: Vec<AdmissionOutcome> = results
        .iter()
        .take(expected)
        .map(|r| match r {
            Ok(()) => AdmissionOutcome::Accepted,
            Err(err) => classifier.classify(err).into(),
        })
        .collect();
    outcomes.resize(expected, AdmissionOutcome::OtherReject);
    outcomes
}
