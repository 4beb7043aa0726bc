use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use serial_test::serial;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testbench::bus::{
    AbortExperiment, Message, MessageBus, MemoryBus, ReadyForRestart, ThroughputStart, Topic,
};
use testbench::config::{ControlSettings, StreamSettings};
use testbench::control::{
    ControlService, ControlState, Image, ImageSpec, Instance, LocalVmProvider, VmProvider,
};
use testbench::experiment::{ExperimentConfig, Role};
use testbench::net::announce_boot;
use testbench::protocol::{Tuple, TupleFormat};
use testbench::sink::SinkService;
use testbench::source::SourceService;
use testbench::store::MemoryStore;
use tokio::time::timeout;

/// Provisions fine but never boots anything.
#[derive(Default)]
struct SilentVm {
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl VmProvider for SilentVm {
    async fn find_image(&self, _spec: &ImageSpec) -> Result<Option<Image>> {
        Ok(None)
    }

    async fn build_image(&self, spec: &ImageSpec) -> Result<Image> {
        Ok(Image {
            id: "silent-0".into(),
            name: spec.image.to_string(),
            labels: spec.labels(),
            created: 0,
            deprecated: false,
        })
    }

    async fn boot(&self, image: &Image, instance_name: &str) -> Result<Instance> {
        Ok(Instance {
            name: instance_name.to_string(),
            image_id: image.id.clone(),
        })
    }

    async fn reset(&self, _instance: &Instance) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, instance: &Instance) -> Result<()> {
        self.deleted.lock().unwrap().push(instance.name.clone());
        Ok(())
    }

    async fn serial_log(&self, _instance: &Instance) -> Result<String> {
        Ok("no output\n".into())
    }
}

/// Boots with a duplicated beacon and never comes back from a reset.
struct EchoingVm {
    boot_target: std::net::SocketAddr,
}

#[async_trait]
impl VmProvider for EchoingVm {
    async fn find_image(&self, spec: &ImageSpec) -> Result<Option<Image>> {
        SilentVm::default().build_image(spec).await.map(Some)
    }

    async fn build_image(&self, spec: &ImageSpec) -> Result<Image> {
        SilentVm::default().build_image(spec).await
    }

    async fn boot(&self, image: &Image, instance_name: &str) -> Result<Instance> {
        for _ in 0..2 {
            announce_boot::<tokio::net::UdpSocket>(self.boot_target).await?;
        }
        SilentVm::default().boot(image, instance_name).await
    }

    async fn reset(&self, _instance: &Instance) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _instance: &Instance) -> Result<()> {
        Ok(())
    }

    async fn serial_log(&self, _instance: &Instance) -> Result<String> {
        Ok(String::new())
    }
}

fn config(test_id: &str, base_port: u16) -> ExperimentConfig {
    ExperimentConfig {
        test_id: test_id.to_string(),
        image_name: "unikraft-filter".into(),
        dataset_id: "small".into(),
        evaluation_id: None,
        delay: 0.0,
        ramp_factor: 1.0,
        iterations: 2,
        sample_rate: 1,
        restarts: 1,
        tuple_format: TupleFormat::Json,
        batch_size: 1,
        control_address: "127.0.0.1".into(),
        control_port: base_port,
        source_address: "127.0.0.1".into(),
        source_port: base_port + 1,
        sink_address: "127.0.0.1".into(),
        sink_port: base_port + 2,
        force_rebuild: false,
    }
}

fn control_settings(boot_port: u16, first_boot: Duration) -> ControlSettings {
    ControlSettings {
        boot_listen: ([127, 0, 0, 1], boot_port).into(),
        first_boot_timeout: first_boot,
        reset_boot_timeout: Duration::from_secs(10),
        instance_prefix: "test".into(),
    }
}

async fn wait_for_result(store: &MemoryStore, key: String) -> Value {
    loop {
        if let Some(bundle) = store.result(&key) {
            return bundle;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn second_start_is_rejected_while_one_runs() {
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let vms = Arc::new(SilentVm::default());
    let control = ControlService::new(
        bus.clone(),
        vms.clone(),
        store.clone(),
        control_settings(0, Duration::from_secs(30)),
    );
    control.spawn().await.unwrap();
    let mut states = control.watch_state();

    bus.publish(Topic::Control, &Message::StartExperiment(config("first", 0)))
        .await
        .unwrap();
    bus.publish(Topic::Control, &Message::StartExperiment(config("second", 0)))
        .await
        .unwrap();
    timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ControlState::AwaitingBoot),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(control.slot().current().unwrap().test_id, "first");

    let abort = AbortExperiment {
        test_id: Some("first".into()),
        reason: "operator".into(),
    };
    bus.publish(Topic::Control, &Message::AbortExperiment(abort))
        .await
        .unwrap();
    let bundle = timeout(
        Duration::from_secs(5),
        wait_for_result(&store, Role::Control.result_key("first")),
    )
    .await
    .unwrap();

    assert_eq!(bundle["outcome"], "aborted");
    assert_eq!(bundle["error_kind"], "aborted");
    assert!(store.result(&Role::Control.result_key("second")).is_none());
    assert!(control.slot().is_empty());
    assert_eq!(control.state(), ControlState::Idle);
    assert_eq!(vms.deleted.lock().unwrap().len(), 1);

    // the released slot takes the next start right away
    bus.publish(Topic::Control, &Message::StartExperiment(config("third", 0)))
        .await
        .unwrap();
    timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ControlState::AwaitingBoot),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(control.slot().current().unwrap().test_id, "third");
    let abort = AbortExperiment {
        test_id: None,
        reason: "operator".into(),
    };
    bus.publish(Topic::Control, &Message::AbortExperiment(abort))
        .await
        .unwrap();
    timeout(
        Duration::from_secs(5),
        wait_for_result(&store, Role::Control.result_key("third")),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn boot_timeout_fails_and_unwinds_everyone() {
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    store.put_dataset("small", vec![Tuple::from_fields([1, 0, 0, 0, 0])]);
    let vms = Arc::new(SilentVm::default());
    let control = ControlService::new(
        bus.clone(),
        vms.clone(),
        store.clone(),
        control_settings(0, Duration::from_millis(300)),
    );
    let source = SourceService::new(
        bus.clone(),
        store.clone(),
        store.clone(),
        StreamSettings {
            listen: ([127, 0, 0, 1], 0).into(),
        },
    );
    let sink = SinkService::new(
        bus.clone(),
        store.clone(),
        StreamSettings {
            listen: ([127, 0, 0, 1], 0).into(),
        },
    );
    control.spawn().await.unwrap();
    source.spawn().await.unwrap();
    sink.spawn().await.unwrap();
    let mut streams = bus.subscribe(Topic::Streams).await.unwrap();

    // Source and Sink already hold a run for this test when Control gives up
    let start = ThroughputStart {
        test_id: "late".into(),
        dataset_id: "small".into(),
        params: config("late", 0).stream_params(),
    };
    bus.publish(Topic::Streams, &Message::ThroughputStart(start))
        .await
        .unwrap();
    bus.publish(Topic::Control, &Message::StartExperiment(config("late", 0)))
        .await
        .unwrap();

    let bundles = timeout(
        Duration::from_secs(5),
        join_all(
            [Role::Control, Role::Source, Role::Sink]
                .map(|role| wait_for_result(&store, role.result_key("late"))),
        ),
    )
    .await
    .unwrap();
    let (control_bundle, source_bundle, sink_bundle) = (&bundles[0], &bundles[1], &bundles[2]);
    assert_eq!(control_bundle["outcome"], "failed");
    assert_eq!(control_bundle["error_kind"], "boot_timeout");
    assert_eq!(control_bundle["error_or_aborted"], true);
    assert_eq!(control_bundle["measurements"].as_array().unwrap().len(), 1);
    assert!(control_bundle["measurements"][0]["boot_packet_timestamp"].is_null());
    assert_eq!(control_bundle["measurements"][0]["serial_log"], "no output\n");
    assert_eq!(source_bundle["error_kind"], "aborted");
    assert_eq!(sink_bundle["error_kind"], "aborted");
    assert_eq!(sink_bundle["measurements"].as_array().unwrap().len(), 1);

    let mut saw_abort = false;
    while let Ok(Some(next)) = timeout(Duration::from_millis(100), streams.next()).await {
        if let Ok(Message::AbortExperiment(abort)) = next {
            assert!(abort.matches("late"));
            saw_abort = true;
        }
    }
    assert!(saw_abort);
    assert!(control.slot().is_empty());
    assert!(source.slot().is_empty());
    assert!(sink.slot().is_empty());
    assert_eq!(vms.deleted.lock().unwrap().as_slice(), ["test-unikraft-late"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn full_experiment_with_one_restart() {
    let base = 39081;
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    store.put_dataset(
        "small",
        vec![
            Tuple::from_fields([1, 0, 10, 0, 0]),
            Tuple::from_fields([-1, 0, 11, 0, 0]),
            Tuple::from_fields([2, 0, 12, 0, 0]),
            Tuple::from_fields([-3, 0, 13, 0, 0]),
        ],
    );
    let vms = Arc::new(LocalVmProvider::new());
    let control = ControlService::new(
        bus.clone(),
        vms.clone(),
        store.clone(),
        control_settings(base, Duration::from_secs(10)),
    );
    let source = SourceService::new(
        bus.clone(),
        store.clone(),
        store.clone(),
        StreamSettings {
            listen: ([127, 0, 0, 1], base + 1).into(),
        },
    );
    let sink = SinkService::new(
        bus.clone(),
        store.clone(),
        StreamSettings {
            listen: ([127, 0, 0, 1], base + 2).into(),
        },
    );
    control.spawn().await.unwrap();
    source.spawn().await.unwrap();
    sink.spawn().await.unwrap();

    bus.publish(Topic::Control, &Message::StartExperiment(config("e2e-0001", base)))
        .await
        .unwrap();

    let bundles = timeout(
        Duration::from_secs(60),
        join_all(
            [Role::Control, Role::Source, Role::Sink]
                .map(|role| wait_for_result(&store, role.result_key("e2e-0001"))),
        ),
    )
    .await
    .unwrap();
    let by_role: BTreeMap<&str, &Value> = ["control", "source", "sink"]
        .into_iter()
        .zip(bundles.iter())
        .collect();

    let control_bundle = by_role["control"];
    assert_eq!(control_bundle["outcome"], "done", "{:#}", control_bundle);
    assert_eq!(control_bundle["error_or_aborted"], false);
    let rounds = control_bundle["measurements"].as_array().unwrap();
    assert_eq!(rounds.len(), 2);
    assert_eq!(rounds[0]["was_reset"], false);
    assert_eq!(rounds[1]["was_reset"], true);
    assert!(rounds.iter().all(|r| r["boot_packet_timestamp"].is_number()));
    assert!(rounds[1]["serial_log"].as_str().unwrap().contains("--- reset ---"));
    assert_eq!(control_bundle["source"]["rounds"], 2);
    assert_eq!(control_bundle["sink"]["number_of_tuples_recv"], serde_json::json!([4, 4]));

    let source_rounds = by_role["source"]["measurements"].as_array().unwrap();
    assert_eq!(source_rounds.len(), 2);
    for round in source_rounds {
        assert_eq!(round["number_of_tuples_sent"], 8);
        assert_eq!(round["number_of_tuples_passing_the_filter"], 4);
        assert_eq!(round["tuples_passing_the_filter_ids"], serde_json::json!([0, 2, 4, 6]));
        assert!(round["ack_timestamp"].is_number());
    }
    let sink_rounds = by_role["sink"]["measurements"].as_array().unwrap();
    assert!(sink_rounds.iter().all(|r| r["terminated_by"] == "done"));
    assert_eq!(sink_rounds[0]["tuples_processing_timestamps"].as_array().unwrap().len(), 4);

    assert!(control.slot().is_empty());
    assert!(source.slot().is_empty());
    assert!(sink.slot().is_empty());
    assert_eq!(vms.running(), 0);
}

#[tokio::test]
#[serial]
async fn leftover_boot_beacon_does_not_release_the_next_round() {
    let boot_port = 39181;
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let vms = Arc::new(EchoingVm {
        boot_target: ([127, 0, 0, 1], boot_port).into(),
    });
    let mut settings = control_settings(boot_port, Duration::from_secs(5));
    settings.reset_boot_timeout = Duration::from_millis(500);
    let control = ControlService::new(bus.clone(), vms, store.clone(), settings);
    control.spawn().await.unwrap();
    let mut states = control.watch_state();
    let mut streams = bus.subscribe(Topic::Streams).await.unwrap();

    bus.publish(Topic::Control, &Message::StartExperiment(config("echo", 0)))
        .await
        .unwrap();
    timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ControlState::RestartBarrier),
    )
    .await
    .unwrap()
    .unwrap();
    for role in [Role::Source, Role::Sink] {
        let ready = Message::ReadyForRestart(ReadyForRestart {
            test_id: "echo".into(),
            source_or_sink: role,
            round: 0,
        });
        bus.publish(Topic::Control, &ready).await.unwrap();
    }

    let bundle = timeout(
        Duration::from_secs(5),
        wait_for_result(&store, Role::Control.result_key("echo")),
    )
    .await
    .unwrap();
    assert_eq!(bundle["error_kind"], "boot_timeout", "{:#}", bundle);
    let rounds = bundle["measurements"].as_array().unwrap();
    assert_eq!(rounds.len(), 2);
    assert!(rounds[0]["boot_packet_timestamp"].is_number());
    assert!(rounds[1]["boot_packet_timestamp"].is_null());

    let mut restarted = false;
    while let Ok(Some(next)) = timeout(Duration::from_millis(100), streams.next()).await {
        if let Ok(Message::RestartExperiment(_)) = next {
            restarted = true;
        }
    }
    assert!(!restarted);
    assert!(control.slot().is_empty());
}
