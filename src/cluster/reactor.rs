//! The channel reactor: owns the shards, routes channels to them by key
//! hash, and runs the stage and storage worker pools.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Sender, bounded, unbounded};

use crate::config::Options;
use crate::metrics;

use super::channel::{Channel, ChannelClusterConfig, ShardBinding, StoreJob, run_store_job};
use super::error::ClusterError;
use super::key::{ChannelKey, NodeId};
use super::message::{ChannelMessage, PipelineStage, ReplicaMessage};
use super::pipeline::{StagePool, StageReq, StepRouter};
use super::proto::WireEnvelope;
use super::reactor_sub::{SubHandle, run_sub_loop};

struct StagePools {
    init: StagePool,
    payload_decrypt: StagePool,
    permission: StagePool,
    storage: StagePool,
    deliver: StagePool,
    sendack: StagePool,
    forward: StagePool,
}

impl StagePools {
    fn new(opts: &Arc<Options>, router: StepRouter) -> Self {
        let concurrency = opts.config.stage_concurrency;
        let depth = opts.config.stage_queue_depth;
        let pool = |stage: PipelineStage| {
            StagePool::new(
                stage,
                concurrency,
                depth,
                opts.pipeline.clone(),
                router.clone(),
            )
        };
        Self {
            init: pool(PipelineStage::Init),
            payload_decrypt: pool(PipelineStage::PayloadDecrypt),
            permission: pool(PipelineStage::PermissionCheck),
            storage: pool(PipelineStage::Storage),
            deliver: pool(PipelineStage::Deliver),
            sendack: pool(PipelineStage::Sendack),
            forward: pool(PipelineStage::Forward),
        }
    }

    fn shutdown(&self) {
        self.init.shutdown();
        self.payload_decrypt.shutdown();
        self.permission.shutdown();
        self.storage.shutdown();
        self.deliver.shutdown();
        self.sendack.shutdown();
        self.forward.shutdown();
    }
}

/// State shared between the reactor, its shards and the worker pools.
pub(crate) struct ReactorShared {
    opts: Arc<Options>,
    pools: StagePools,
}

impl ReactorShared {
    pub(crate) fn opts(&self) -> &Arc<Options> {
        &self.opts
    }

    pub(crate) fn add_init_req(&self, ch: Arc<Channel>) {
        self.submit(&self.pools.init, StageReq::new(ch, Vec::new()));
    }

    pub(crate) fn add_payload_decrypt_req(&self, ch: Arc<Channel>, messages: Vec<ChannelMessage>) {
        self.submit(&self.pools.payload_decrypt, StageReq::new(ch, messages));
    }

    pub(crate) fn add_permission_req(&self, ch: Arc<Channel>, messages: Vec<ChannelMessage>) {
        self.submit(&self.pools.permission, StageReq::new(ch, messages));
    }

    pub(crate) fn add_storage_req(&self, ch: Arc<Channel>, messages: Vec<ChannelMessage>) {
        self.submit(&self.pools.storage, StageReq::new(ch, messages));
    }

    pub(crate) fn add_deliver_req(
        &self,
        ch: Arc<Channel>,
        messages: Vec<ChannelMessage>,
        tag_key: Option<String>,
    ) {
        let mut req = StageReq::new(ch, messages);
        req.tag_key = tag_key;
        self.submit(&self.pools.deliver, req);
    }

    pub(crate) fn add_sendack_req(&self, ch: Arc<Channel>, messages: Vec<ChannelMessage>) {
        self.submit(&self.pools.sendack, StageReq::new(ch, messages));
    }

    pub(crate) fn add_forward_req(
        &self,
        ch: Arc<Channel>,
        messages: Vec<ChannelMessage>,
        leader_id: NodeId,
    ) {
        let mut req = StageReq::new(ch, messages);
        req.leader_id = leader_id;
        self.submit(&self.pools.forward, req);
    }

    fn submit(&self, pool: &StagePool, req: StageReq) {
        let stage = pool.stage();
        let message_ids: Vec<u64> = req.messages.iter().map(|msg| msg.message_id).collect();
        let ch = req.ch.clone();
        if let Err(err) = pool.submit(req) {
            tracing::warn!(
                target: "cluster",
                channel = %ch.key(),
                stage = stage.as_str(),
                "stage submit shed: {err}"
            );
            // Return the batch to the replica so a later ready retries it.
            let _ = ch.step_lock(ReplicaMessage::PipelineFailed { stage, message_ids });
        }
    }

    pub(crate) fn send_wire(&self, ch: &Arc<Channel>, to: NodeId, mut message: ReplicaMessage) {
        ch.enrich_wire(&mut message);
        let envelope = WireEnvelope {
            channel_id: ch.channel_id().to_string(),
            channel_type: ch.channel_type(),
            to,
            message,
        };
        self.opts.transport.send(to, envelope);
    }
}

/// Sharded, tick-driven scheduler for every channel this node hosts.
pub struct ChannelReactor {
    opts: Arc<Options>,
    shared: Arc<ReactorShared>,
    handles: Arc<Vec<SubHandle>>,
    store_txs: Vec<Sender<StoreJob>>,
    store_workers: Vec<JoinHandle<()>>,
    sub_workers: Vec<JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
    stopped: Arc<AtomicBool>,
    started: bool,
}

impl ChannelReactor {
    pub fn new(options: Options) -> Result<Self, ClusterError> {
        options.config.validate()?;
        let opts = Arc::new(options);
        let stopped = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = unbounded::<()>();

        let handles: Arc<Vec<SubHandle>> = Arc::new(
            (0..opts.config.shard_count)
                .map(|index| SubHandle::new(index, stopped.clone(), stop_rx.clone()))
                .collect(),
        );

        // Storage workers: one queue per worker, channels pinned by key so
        // a channel's appends and applies execute in issue order.
        let mut store_txs = Vec::new();
        let mut store_workers = Vec::new();
        for _ in 0..opts.config.storage_worker_count.max(1) {
            let (tx, rx) = bounded::<StoreJob>(opts.config.stage_queue_depth.max(1));
            store_txs.push(tx);
            // Channels keep sender clones in their shard binding, so the
            // queue never disconnects on its own; shutdown rides stop_rx.
            let stop_rx = stop_rx.clone();
            store_workers.push(thread::spawn(move || {
                loop {
                    crossbeam::select! {
                        recv(rx) -> job => match job {
                            Ok(job) => run_store_job(job),
                            Err(_) => return,
                        },
                        recv(stop_rx) -> _ => return,
                    }
                }
            }));
        }

        let router: StepRouter = {
            let handles = handles.clone();
            Arc::new(move |ch: &Arc<Channel>, msg: ReplicaMessage| {
                let shard = shard_index(ch.key(), handles.len());
                if let Err(err) = handles[shard].step(ch.clone(), msg) {
                    tracing::debug!(
                        target: "cluster",
                        channel = %ch.key(),
                        "stage completion dropped: {err}"
                    );
                }
            })
        };

        let shared = Arc::new(ReactorShared {
            opts: opts.clone(),
            pools: StagePools::new(&opts, router),
        });

        Ok(Self {
            opts,
            shared,
            handles,
            store_txs,
            store_workers,
            sub_workers: Vec::new(),
            stop_tx: Some(stop_tx),
            stopped,
            started: false,
        })
    }

    /// Spawns the shard loops. Channels may be added before or after.
    pub fn start(&mut self) {
        if self.started || self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.started = true;
        for handle in self.handles.iter() {
            let handle = handle.clone();
            let shared = self.shared.clone();
            self.sub_workers
                .push(thread::spawn(move || run_sub_loop(handle, shared)));
        }
        tracing::info!(
            target: "cluster",
            shards = self.handles.len(),
            "channel reactor started"
        );
    }

    /// Stops every shard loop and worker pool, joining them all. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_tx = None;
        for handle in self.handles.iter() {
            handle.advance();
        }
        for join in self.sub_workers.drain(..) {
            let _ = join.join();
        }
        self.shared.pools.shutdown();
        self.store_txs.clear();
        for join in self.store_workers.drain(..) {
            let _ = join.join();
        }
        tracing::info!(target: "cluster", "channel reactor stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// The shard that owns `key`, fixed for the channel's lifetime.
    pub fn shard_for(&self, key: &ChannelKey) -> usize {
        shard_index(key, self.handles.len())
    }

    /// Creates the channel (or returns the existing one) and homes it on
    /// its shard.
    pub fn add_channel(
        &self,
        config: ChannelClusterConfig,
    ) -> Result<Arc<Channel>, ClusterError> {
        let key = ChannelKey::new(&config.channel_id, config.channel_type);
        let shard = self.shard_for(&key);
        let handle = &self.handles[shard];
        if let Some(existing) = handle.channels.get(&key) {
            return Ok(existing);
        }

        let ch = Channel::new(config, self.opts.clone())?;
        let store_tx =
            self.store_txs[key.shard_hash() as usize % self.store_txs.len()].clone();
        ch.bind(ShardBinding {
            advance_tx: handle.advance_tx(),
            store_tx,
        });
        if !handle.channels.add(ch.clone()) {
            // Raced with a concurrent add; the list kept the winner.
            if let Some(existing) = handle.channels.get(&key) {
                return Ok(existing);
            }
        }
        metrics::set_channel_count(self.channel_count());
        handle.advance();
        Ok(ch)
    }

    pub fn channel(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.handles[self.shard_for(key)].channels.get(key)
    }

    pub fn channel_count(&self) -> usize {
        self.handles.iter().map(|handle| handle.channels.len()).sum()
    }

    /// Fire-and-forget step through the owning shard's loop.
    pub fn step(&self, ch: &Arc<Channel>, msg: ReplicaMessage) -> Result<(), ClusterError> {
        self.handles[self.shard_for(ch.key())].step(ch.clone(), msg)
    }

    /// Step and wait for the replica's verdict, capped by the configured
    /// step-wait timeout.
    pub fn step_wait(&self, ch: &Arc<Channel>, msg: ReplicaMessage) -> Result<(), ClusterError> {
        self.handles[self.shard_for(ch.key())].step_wait(
            ch.clone(),
            msg,
            self.opts.config.step_wait_timeout(),
        )
    }

    /// Wakes the shard owning `key`.
    pub fn advance(&self, key: &ChannelKey) {
        self.handles[self.shard_for(key)].advance();
    }

    /// Routes an inbound wire envelope to its channel.
    pub fn deliver_envelope(&self, envelope: WireEnvelope) -> Result<(), ClusterError> {
        let key = ChannelKey::new(&envelope.channel_id, envelope.channel_type);
        match self.channel(&key) {
            Some(ch) => ch.handle_message(envelope.message),
            None => Err(ClusterError::invalid_message(format!(
                "no channel {key} on this node"
            ))),
        }
    }
}

impl Drop for ChannelReactor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn shard_index(key: &ChannelKey, shard_count: usize) -> usize {
    key.shard_hash() as usize % shard_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::storage::{MemoryLogStorage, MemoryMetadataStorage};
    use crate::config::Config;
    use bytes::Bytes;
    use std::time::{Duration, Instant};

    fn reactor(node_id: NodeId) -> ChannelReactor {
        let config = Config {
            node_id,
            shard_count: 4,
            heartbeat_ms: 20,
            step_wait_timeout_ms: 500,
            stage_concurrency: 1,
            storage_worker_count: 2,
            ..Default::default()
        };
        ChannelReactor::new(Options::new(
            config,
            Arc::new(MemoryLogStorage::new()),
            Arc::new(MemoryMetadataStorage::new()),
        ))
        .unwrap()
    }

    fn config_for(id: &str, leader: NodeId) -> ChannelClusterConfig {
        ChannelClusterConfig {
            channel_id: id.to_string(),
            channel_type: 2,
            term: 1,
            leader_id: leader,
            replicas: vec![1],
        }
    }

    #[test]
    fn new_requires_valid_config() {
        let result = ChannelReactor::new(Options::new(
            Config::default(),
            Arc::new(MemoryLogStorage::new()),
            Arc::new(MemoryMetadataStorage::new()),
        ));
        assert!(result.is_err());
    }

    #[test]
    fn added_channel_is_found_again() {
        let reactor = reactor(1);
        let ch = reactor.add_channel(config_for("general", 1)).unwrap();
        let found = reactor.channel(ch.key()).expect("lookup");
        assert!(Arc::ptr_eq(&ch, &found));

        // Adding the same identity returns the existing channel.
        let again = reactor.add_channel(config_for("general", 1)).unwrap();
        assert!(Arc::ptr_eq(&ch, &again));
        assert_eq!(reactor.channel_count(), 1);
    }

    #[test]
    fn propose_commits_through_the_reactor() {
        let mut reactor = reactor(1);
        reactor.start();
        let ch = reactor.add_channel(config_for("general", 1)).unwrap();
        let indices = ch
            .propose_and_wait_commits(vec![Bytes::from_static(b"hello")], Duration::from_secs(2))
            .expect("commit");
        assert_eq!(indices, vec![1]);
        reactor.stop();
    }

    #[test]
    fn step_wait_after_stop_returns_reactor_stopped() {
        let mut reactor = reactor(1);
        reactor.start();
        let ch = reactor.add_channel(config_for("general", 1)).unwrap();
        reactor.stop();

        let started = Instant::now();
        let err = reactor
            .step_wait(
                &ch,
                ReplicaMessage::Heartbeat {
                    from: 2,
                    term: 1,
                    committed_index: 0,
                },
            )
            .unwrap_err();
        assert_eq!(err, ClusterError::ReactorStopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut reactor = reactor(1);
        reactor.start();
        reactor.stop();
        reactor.stop();
    }
}
