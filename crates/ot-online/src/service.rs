//! Async front end: one task owns the tuner and serves requests in order.

use ot_types::{Sample, TuneError, TuneResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::tuner::{AutoTuner, TunerSnapshot};

/// Queue depth used by [`TunerService::spawn`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

enum Command {
    Predict {
        sample: Sample,
        reply: oneshot::Sender<TuneResult<f64>>,
    },
    Learn {
        sample: Sample,
        reply: oneshot::Sender<TuneResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<TunerSnapshot>,
    },
}

/// Cloneable client of a running [`TunerService`].
///
/// Requests from all clones are applied one at a time in arrival order. A
/// full queue makes callers wait; nothing is dropped.
#[derive(Clone)]
pub struct TunerHandle {
    tx: mpsc::Sender<Command>,
}

impl TunerHandle {
    pub async fn predict(&self, sample: Sample) -> TuneResult<f64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Predict { sample, reply }).await?;
        rx.await.map_err(|_| TuneError::ServiceClosed)?
    }

    pub async fn learn(&self, sample: Sample) -> TuneResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Learn { sample, reply }).await?;
        rx.await.map_err(|_| TuneError::ServiceClosed)?
    }

    pub async fn snapshot(&self) -> TuneResult<TunerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| TuneError::ServiceClosed)
    }

    async fn send(&self, command: Command) -> TuneResult<()> {
        self.tx.send(command).await.map_err(|_| TuneError::ServiceClosed)
    }
}

/// Runs an [`AutoTuner`] on a dedicated task fed by a bounded queue.
pub struct TunerService;

impl TunerService {
    pub fn spawn(tuner: AutoTuner) -> (TunerHandle, JoinHandle<AutoTuner>) {
        Self::spawn_with_capacity(tuner, DEFAULT_QUEUE_CAPACITY)
    }

    /// The task finishes and hands the tuner back once every handle is
    /// dropped.
    pub fn spawn_with_capacity(tuner: AutoTuner, capacity: usize) -> (TunerHandle, JoinHandle<AutoTuner>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(serve(tuner, rx));
        (TunerHandle { tx }, task)
    }
}

async fn serve(mut tuner: AutoTuner, mut rx: mpsc::Receiver<Command>) -> AutoTuner {
    info!(session = %tuner.session_id(), "tuner service started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Predict { sample, reply } => {
                let _ = reply.send(tuner.predict(&sample));
            }
            Command::Learn { sample, reply } => {
                let _ = reply.send(tuner.learn(&sample));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(tuner.snapshot());
            }
        }
        debug!(session = %tuner.session_id(), iteration = tuner.iteration(), "request served");
    }
    info!(session = %tuner.session_id(), iteration = tuner.iteration(), "tuner service stopped");
    tuner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunerConfig;
    use crate::runner::tests::sample;
    use crate::trial::tests::factory;
    use ot_learner::INTERACTIONS_KEY;
    use ot_search::SearchSpace;

    fn tuner() -> AutoTuner {
        let config = TunerConfig::new(3, SearchSpace::new().add_auto_interactions(INTERACTIONS_KEY));
        AutoTuner::new(config, factory()).unwrap()
    }

    #[tokio::test]
    async fn serves_predict_and_learn_in_order() {
        let (handle, task) = TunerService::spawn(tuner());
        for i in 0..50 {
            let value = handle.predict(sample(i)).await.unwrap();
            assert!(value.is_finite());
            handle.learn(sample(i)).await.unwrap();
        }
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.iteration, 50);
        assert!(snapshot.champion.is_some());

        drop(handle);
        let tuner = task.await.unwrap();
        assert_eq!(tuner.iteration(), 50);
    }

    #[tokio::test]
    async fn clones_share_one_tuner() {
        let (handle, task) = TunerService::spawn_with_capacity(tuner(), 2);
        let mut joins = Vec::new();
        for worker in 0..4 {
            let handle = handle.clone();
            joins.push(tokio::spawn(async move {
                for i in 0..10 {
                    handle.learn(sample(worker * 10 + i)).await.unwrap();
                }
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        assert_eq!(handle.snapshot().await.unwrap().total_steps, 40);
        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn tuner_errors_reach_the_caller() {
        let (handle, _task) = TunerService::spawn(tuner());
        let unlabeled = Sample::new(None).with_feature('a', "x", 1.0);
        assert!(handle.learn(unlabeled).await.is_err());
        assert_eq!(handle.snapshot().await.unwrap().iteration, 0);
    }

    #[tokio::test]
    async fn closed_service_reports_service_closed() {
        let (handle, task) = TunerService::spawn(tuner());
        task.abort();
        let _ = task.await;
        assert!(matches!(
            handle.predict(sample(0)).await,
            Err(TuneError::ServiceClosed)
        ));
    }
}
