//! Pipeline stage delegate and the fixed-size worker pools that run it.
//!
//! Each stage owns a bounded queue and a handful of worker threads; results
//! re-enter the owning channel as replica messages through the shard's step
//! queue, never directly. Backpressure surfaces to the dispatcher as
//! `QueueFull`.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;

use crate::metrics;

use super::channel::Channel;
use super::error::ClusterError;
use super::key::{NO_LEADER, NodeId};
use super::message::{ChannelMessage, PipelineStage, ReplicaMessage};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Failed(String),
}

impl PipelineError {
    pub fn failed(reason: impl Into<String>) -> Self {
        PipelineError::Failed(reason.into())
    }
}

/// Channel info loaded by the init stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelInit {
    /// Subscriber tag used to address the channel's receiver set during
    /// delivery.
    pub tag_key: Option<String>,
}

/// Result of a permission check: messages that may proceed and the ids of
/// those that may not.
#[derive(Clone, Debug, Default)]
pub struct PermissionVerdict {
    pub allowed: Vec<ChannelMessage>,
    pub denied: Vec<u64>,
}

/// Downstream hooks for the message pipeline. Every method has a pass-through
/// default so tests and partial deployments only implement what they use.
pub trait PipelineDelegate: Send + Sync {
    fn init(&self, _channel_id: &str, _channel_type: u8) -> Result<ChannelInit, PipelineError> {
        Ok(ChannelInit::default())
    }

    /// Replaces each message's payload with its decrypted form.
    fn decrypt(
        &self,
        messages: Vec<ChannelMessage>,
    ) -> Result<Vec<ChannelMessage>, PipelineError> {
        Ok(messages)
    }

    fn check_permission(
        &self,
        _from_uid: &str,
        messages: Vec<ChannelMessage>,
    ) -> Result<PermissionVerdict, PipelineError> {
        Ok(PermissionVerdict {
            allowed: messages,
            denied: Vec::new(),
        })
    }

    /// Persists messages to the message store, assigning sequence numbers.
    fn store(
        &self,
        _channel: &Arc<Channel>,
        messages: Vec<ChannelMessage>,
    ) -> Result<Vec<ChannelMessage>, PipelineError> {
        Ok(messages)
    }

    fn deliver(
        &self,
        _messages: &[ChannelMessage],
        _tag_key: Option<&str>,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    fn send_ack(&self, _messages: &[ChannelMessage]) -> Result<(), PipelineError> {
        Ok(())
    }

    fn forward(
        &self,
        _leader_id: NodeId,
        _messages: &[ChannelMessage],
    ) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Accepts everything and delivers nowhere.
#[derive(Default)]
pub struct NoopPipeline;

impl PipelineDelegate for NoopPipeline {}

/// Routes a stage completion back into the owning channel's shard.
pub(crate) type StepRouter = Arc<dyn Fn(&Arc<Channel>, ReplicaMessage) + Send + Sync>;

/// One stage request as dispatched from a shard's ready drain.
pub(crate) struct StageReq {
    pub ch: Arc<Channel>,
    pub messages: Vec<ChannelMessage>,
    pub leader_id: NodeId,
    pub tag_key: Option<String>,
}

impl StageReq {
    pub(crate) fn new(ch: Arc<Channel>, messages: Vec<ChannelMessage>) -> Self {
        Self {
            ch,
            messages,
            leader_id: NO_LEADER,
            tag_key: None,
        }
    }
}

/// Bounded worker pool for one pipeline stage.
pub(crate) struct StagePool {
    stage: PipelineStage,
    tx: Mutex<Option<Sender<StageReq>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StagePool {
    pub(crate) fn new(
        stage: PipelineStage,
        concurrency: usize,
        queue_depth: usize,
        delegate: Arc<dyn PipelineDelegate>,
        router: StepRouter,
    ) -> Self {
        let (tx, rx) = bounded::<StageReq>(queue_depth.max(1));
        let mut workers = Vec::new();
        for _ in 0..concurrency.max(1) {
            let rx: Receiver<StageReq> = rx.clone();
            let delegate = delegate.clone();
            let router = router.clone();
            workers.push(thread::spawn(move || {
                while let Ok(req) = rx.recv() {
                    let (ch, resp) = execute_stage(stage, delegate.as_ref(), req);
                    router(&ch, resp);
                    ch.advance();
                }
            }));
        }
        Self {
            stage,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    pub(crate) fn submit(&self, req: StageReq) -> Result<(), ClusterError> {
        let guard = self.tx.lock().expect("stage pool lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.try_send(req).map_err(|err| match err {
                TrySendError::Full(_) => ClusterError::QueueFull,
                TrySendError::Disconnected(_) => ClusterError::ReactorStopped,
            }),
            None => Err(ClusterError::ReactorStopped),
        }
    }

    pub(crate) fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub(crate) fn shutdown(&self) {
        let tx = self.tx.lock().expect("stage pool lock poisoned").take();
        drop(tx);
        let workers = std::mem::take(&mut *self.workers.lock().expect("stage pool lock poisoned"));
        for join in workers {
            let _ = join.join();
        }
    }
}

fn execute_stage(
    stage: PipelineStage,
    delegate: &dyn PipelineDelegate,
    req: StageReq,
) -> (Arc<Channel>, ReplicaMessage) {
    let StageReq {
        ch,
        messages,
        leader_id,
        tag_key,
    } = req;
    let message_ids: Vec<u64> = messages.iter().map(|msg| msg.message_id).collect();

    let result = match stage {
        PipelineStage::Init => delegate
            .init(ch.channel_id(), ch.channel_type())
            .map(|init| ReplicaMessage::InitResp {
                tag_key: init.tag_key,
            }),
        PipelineStage::PayloadDecrypt => delegate
            .decrypt(messages)
            .map(|messages| ReplicaMessage::PayloadDecryptResp { messages }),
        PipelineStage::PermissionCheck => {
            let from_uid = messages
                .first()
                .map(|msg| msg.from_uid.clone())
                .unwrap_or_default();
            delegate
                .check_permission(&from_uid, messages)
                .map(|verdict| ReplicaMessage::PermissionCheckResp {
                    messages: verdict.allowed,
                    denied: verdict.denied,
                })
        }
        PipelineStage::Storage => delegate
            .store(&ch, messages)
            .map(|messages| ReplicaMessage::StorageResp { messages }),
        PipelineStage::Deliver => delegate
            .deliver(&messages, tag_key.as_deref())
            .map(|()| ReplicaMessage::DeliverResp {
                message_ids: message_ids.clone(),
            }),
        PipelineStage::Sendack => {
            delegate
                .send_ack(&messages)
                .map(|()| ReplicaMessage::SendackResp {
                    message_ids: message_ids.clone(),
                })
        }
        PipelineStage::Forward => delegate.forward(leader_id, &messages).map(|()| {
            ReplicaMessage::ForwardResp {
                message_ids: message_ids.clone(),
            }
        }),
    };

    let resp = match result {
        Ok(resp) => {
            metrics::pipeline_stage_ok(stage.as_str());
            resp
        }
        Err(err) => {
            metrics::pipeline_stage_err(stage.as_str());
            tracing::warn!(
                target: "cluster",
                channel = %ch.key(),
                stage = stage.as_str(),
                "pipeline stage failed: {err}"
            );
            ReplicaMessage::PipelineFailed { stage, message_ids }
        }
    };
    (ch, resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::channel::ChannelClusterConfig;
    use crate::cluster::storage::{MemoryLogStorage, MemoryMetadataStorage};
    use crate::config::{Config, Options};
    use bytes::Bytes;
    use std::time::Duration;

    fn channel() -> Arc<Channel> {
        let opts = Arc::new(Options::new(
            Config {
                node_id: 1,
                ..Default::default()
            },
            Arc::new(MemoryLogStorage::new()),
            Arc::new(MemoryMetadataStorage::new()),
        ));
        Channel::new(
            ChannelClusterConfig {
                channel_id: "general".to_string(),
                channel_type: 2,
                term: 1,
                leader_id: 1,
                replicas: vec![1],
            },
            opts,
        )
        .unwrap()
    }

    struct RecordingRouter {
        tx: Sender<ReplicaMessage>,
    }

    fn recording_router() -> (StepRouter, Receiver<ReplicaMessage>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let router = RecordingRouter { tx };
        (
            Arc::new(move |_ch: &Arc<Channel>, msg: ReplicaMessage| {
                let _ = router.tx.send(msg);
            }),
            rx,
        )
    }

    struct UpperCaseDecrypt;

    impl PipelineDelegate for UpperCaseDecrypt {
        fn decrypt(
            &self,
            mut messages: Vec<ChannelMessage>,
        ) -> Result<Vec<ChannelMessage>, PipelineError> {
            for msg in &mut messages {
                let upper = msg
                    .payload
                    .iter()
                    .map(|byte| byte.to_ascii_uppercase())
                    .collect::<Vec<u8>>();
                msg.payload = Bytes::from(upper);
            }
            Ok(messages)
        }
    }

    #[test]
    fn worker_runs_delegate_and_routes_response() {
        let (router, rx) = recording_router();
        let pool = StagePool::new(
            PipelineStage::PayloadDecrypt,
            1,
            8,
            Arc::new(UpperCaseDecrypt),
            router,
        );

        let msg = ChannelMessage::new(1, "alice", Bytes::from_static(b"hi"));
        pool.submit(StageReq::new(channel(), vec![msg])).unwrap();

        let resp = rx.recv_timeout(Duration::from_secs(1)).expect("response");
        match resp {
            ReplicaMessage::PayloadDecryptResp { messages } => {
                assert_eq!(messages[0].payload.as_ref(), b"HI");
            }
            other => panic!("expected decrypt resp, got {other:?}"),
        }
        pool.shutdown();
    }

    struct FailingDeliver;

    impl PipelineDelegate for FailingDeliver {
        fn deliver(
            &self,
            _messages: &[ChannelMessage],
            _tag_key: Option<&str>,
        ) -> Result<(), PipelineError> {
            Err(PipelineError::failed("subscriber registry down"))
        }
    }

    #[test]
    fn failed_stage_reports_pipeline_failed() {
        let (router, rx) = recording_router();
        let pool = StagePool::new(
            PipelineStage::Deliver,
            1,
            8,
            Arc::new(FailingDeliver),
            router,
        );
        pool.submit(StageReq::new(
            channel(),
            vec![ChannelMessage::new(42, "bob", Bytes::from_static(b"x"))],
        ))
        .unwrap();

        let resp = rx.recv_timeout(Duration::from_secs(1)).expect("response");
        assert_eq!(
            resp,
            ReplicaMessage::PipelineFailed {
                stage: PipelineStage::Deliver,
                message_ids: vec![42],
            }
        );
        pool.shutdown();
    }

    struct GatedStore {
        gate: Receiver<()>,
    }

    impl PipelineDelegate for GatedStore {
        fn store(
            &self,
            _channel: &Arc<Channel>,
            messages: Vec<ChannelMessage>,
        ) -> Result<Vec<ChannelMessage>, PipelineError> {
            let _ = self.gate.recv_timeout(Duration::from_secs(2));
            Ok(messages)
        }
    }

    #[test]
    fn full_queue_surfaces_queue_full() {
        let (gate_tx, gate_rx) = crossbeam::channel::unbounded();
        let (router, _rx) = recording_router();
        let pool = StagePool::new(
            PipelineStage::Storage,
            1,
            1,
            Arc::new(GatedStore { gate: gate_rx }),
            router,
        );
        let ch = channel();
        let req = || StageReq::new(ch.clone(), Vec::new());

        // First occupies the worker, second fills the queue slot.
        pool.submit(req()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        pool.submit(req()).unwrap();
        assert_eq!(pool.submit(req()).unwrap_err(), ClusterError::QueueFull);

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        pool.shutdown();
    }
}
