//! Single-node end-to-end scenarios driven through the reactor.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use huddle_cluster::cluster::pipeline::{PipelineError, PipelineDelegate};
use huddle_cluster::{
    Channel, ChannelClusterConfig, ChannelMessage, ChannelReactor, ClusterError, Config,
    MemoryLogStorage, MemoryMetadataStorage, MessageLogStorage, MetadataStorage, Options,
    ReplicaMessage,
};

struct Fixture {
    reactor: ChannelReactor,
    log: Arc<MemoryLogStorage>,
    meta: Arc<MemoryMetadataStorage>,
}

fn fixture_with(pipeline: Option<Arc<dyn PipelineDelegate>>) -> Fixture {
    let log = Arc::new(MemoryLogStorage::new());
    let meta = Arc::new(MemoryMetadataStorage::new());
    let config = Config {
        node_id: 1,
        shard_count: 2,
        heartbeat_ms: 20,
        stage_concurrency: 1,
        storage_worker_count: 2,
        ..Default::default()
    };
    let mut options = Options::new(config, log.clone(), meta.clone());
    if let Some(pipeline) = pipeline {
        options = options.with_pipeline(pipeline);
    }
    let mut reactor = ChannelReactor::new(options).unwrap();
    reactor.start();
    Fixture { reactor, log, meta }
}

fn fixture() -> Fixture {
    fixture_with(None)
}

fn channel_config(id: &str) -> ChannelClusterConfig {
    ChannelClusterConfig {
        channel_id: id.to_string(),
        channel_type: 2,
        term: 1,
        leader_id: 1,
        replicas: vec![1],
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[test]
fn single_node_propose_commits_applies_and_persists() {
    let mut fixture = fixture();
    let ch = fixture.reactor.add_channel(channel_config("general")).unwrap();

    let indices = ch
        .propose_and_wait_commits(
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
            ],
            Duration::from_secs(2),
        )
        .expect("commit");
    assert_eq!(indices, vec![1, 2, 3]);
    assert_eq!(ch.committed_index(), 3);

    let key = ch.key().clone();
    assert!(wait_until(Duration::from_secs(2), || {
        fixture.meta.get_applied_index(&key).unwrap() == 3 && ch.applied_index() == 3
    }));
    assert_eq!(fixture.log.last_index(&key).unwrap(), 3);
    fixture.reactor.stop();
}

#[test]
fn destroyed_channel_rejects_transport_messages() {
    let mut fixture = fixture();
    let ch = fixture.reactor.add_channel(channel_config("doomed")).unwrap();
    ch.make_destroy();
    assert_eq!(
        ch.handle_message(ReplicaMessage::Heartbeat {
            from: 2,
            term: 1,
            committed_index: 0,
        })
        .unwrap_err(),
        ClusterError::Destroyed
    );
    fixture.reactor.stop();
}

#[derive(Default)]
struct RecordingPipeline {
    events: Mutex<Vec<String>>,
}

impl RecordingPipeline {
    fn record(&self, event: &str) {
        self.events.lock().expect("events lock").push(event.to_string());
    }

    fn snapshot(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }
}

impl PipelineDelegate for RecordingPipeline {
    fn decrypt(
        &self,
        messages: Vec<ChannelMessage>,
    ) -> Result<Vec<ChannelMessage>, PipelineError> {
        self.record("decrypt");
        Ok(messages)
    }

    fn check_permission(
        &self,
        _from_uid: &str,
        messages: Vec<ChannelMessage>,
    ) -> Result<huddle_cluster::cluster::pipeline::PermissionVerdict, PipelineError> {
        self.record("permission");
        Ok(huddle_cluster::cluster::pipeline::PermissionVerdict {
            allowed: messages,
            denied: Vec::new(),
        })
    }

    fn store(
        &self,
        _channel: &Arc<Channel>,
        mut messages: Vec<ChannelMessage>,
    ) -> Result<Vec<ChannelMessage>, PipelineError> {
        self.record("storage");
        for (i, msg) in messages.iter_mut().enumerate() {
            msg.message_seq = i as u64 + 1;
        }
        Ok(messages)
    }

    fn deliver(
        &self,
        messages: &[ChannelMessage],
        _tag_key: Option<&str>,
    ) -> Result<(), PipelineError> {
        assert!(messages.iter().all(|msg| msg.message_seq > 0));
        self.record("deliver");
        Ok(())
    }

    fn send_ack(&self, _messages: &[ChannelMessage]) -> Result<(), PipelineError> {
        self.record("sendack");
        Ok(())
    }
}

#[test]
fn submitted_messages_run_the_full_pipeline_in_stage_order() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let mut fixture = fixture_with(Some(pipeline.clone()));
    let ch = fixture.reactor.add_channel(channel_config("general")).unwrap();

    ch.submit_messages(vec![
        ChannelMessage::new(1, "alice", Bytes::from_static(b"hello")),
        ChannelMessage::new(2, "bob", Bytes::from_static(b"there")),
    ])
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        pipeline.snapshot().iter().any(|event| event == "sendack")
    }));

    let events = pipeline.snapshot();
    let position = |name: &str| {
        events
            .iter()
            .position(|event| event == name)
            .unwrap_or_else(|| panic!("stage {name} never ran: {events:?}"))
    };
    assert!(position("decrypt") < position("permission"));
    assert!(position("permission") < position("storage"));
    assert!(position("storage") < position("deliver"));
    assert!(position("deliver") < position("sendack"));
    fixture.reactor.stop();
}
