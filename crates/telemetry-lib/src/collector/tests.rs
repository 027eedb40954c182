//! Collector tests
//!
//! The hot-path handlers are driven directly with synthetic events; the
//! procfs source runs against a mock procfs tree and the tcp_info source
//! against captured `ss -tin` output.

use super::*;
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::models::{EventKind, NodeId, TelemetryEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const MS: u64 = 1_000_000;

/// Samples every n-th call, for exact stream assertions
struct EveryNth {
    calls: AtomicU64,
}

impl EveryNth {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
        }
    }
}

impl Sampler for EveryNth {
    fn hit(&self, one_in: u32) -> bool {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        one_in <= 1 || call % one_in as u64 == 0
    }
}

fn program_with(
    maps: MapsConfig,
    ring_capacity: usize,
    sampler: Box<dyn Sampler>,
) -> (TelemetryProgram, mpsc::Receiver<TelemetryEvent>) {
    let (tx, rx) = mpsc::channel(ring_capacity);
    let program = TelemetryProgram::with_sampler(
        Arc::new(TelemetryMaps::new(&maps)),
        tx,
        NodeId(0),
        SamplingPolicy::default(),
        sampler,
    );
    (program, rx)
}

fn drain(rx: &mut mpsc::Receiver<TelemetryEvent>) -> Vec<TelemetryEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Kernel srtt units for a whole-millisecond RTT
fn srtt_for_ms(ms: u32) -> u32 {
    (ms * 1000) << 3
}

mod hot_path_tests {
    use super::*;

    #[test]
    fn test_srtt_conversion() {
        assert_eq!(srtt_to_ms(srtt_for_ms(12)), 12);
        assert_eq!(srtt_to_ms(7999), 0);
        assert_eq!(srtt_to_ms(8000), 1);
    }

    #[test]
    fn test_rtt_updates_histogram_and_aggregate() {
        let (program, _rx) = program_with(MapsConfig::default(), 16, Box::new(EveryNth::new()));
        let node = NodeId(3);

        for ms in [1u32, 2, 3, 100, 1000] {
            program.on_tcp_ack(node, srtt_for_ms(ms), 10);
        }

        let record = program.maps().nodes.get(3).unwrap();
        let agg = record.aggregate.snapshot();
        assert_eq!(agg.rtt_count, 5);
        assert_eq!(agg.rtt_sum, 1106);
        assert_eq!(agg.last_update_ns, 10);

        let hist = record.rtt_hist.snapshot();
        assert_eq!(hist.total(), agg.rtt_count);
        assert_eq!(hist.slots[0], 1);
        assert_eq!(hist.slots[1], 2);
        assert_eq!(hist.slots[6], 1);
        assert_eq!(hist.slots[9], 1);
    }

    #[test]
    fn test_node_table_exhaustion_drops_event() {
        let maps = MapsConfig {
            max_nodes: 2,
            ..Default::default()
        };
        let (program, _rx) = program_with(maps, 16, Box::new(EveryNth::new()));

        program.on_retransmit(NodeId(1), 1);
        program.on_retransmit(NodeId(2), 1);
        program.on_retransmit(NodeId(3), 1);
        program.on_retransmit(NodeId(1), 2);

        let maps = program.maps();
        assert_eq!(maps.nodes.len(), 2);
        assert!(maps.nodes.get(3).is_none());
        assert_eq!(maps.lost.snapshot().node_table_full, 1);
        assert_eq!(
            maps.nodes.get(1).unwrap().aggregate.snapshot().retrans_count,
            2
        );
    }

    #[test]
    fn test_drop_updates_node_and_reason_tables() {
        let (program, _rx) = program_with(MapsConfig::default(), 16, Box::new(EveryNth::new()));

        program.on_drop(NodeId(0), 2, 1);
        program.on_drop(NodeId(0), 2, 2);
        program.on_drop(NodeId(0), 77, 3);

        let maps = program.maps();
        assert_eq!(maps.nodes.get(0).unwrap().aggregate.snapshot().drop_count, 3);
        assert_eq!(maps.drop_reasons(), vec![(2, 2), (77, 1)]);
    }

    #[test]
    fn test_reason_table_exhaustion_still_counts_node_drop() {
        let maps = MapsConfig {
            max_drop_reasons: 1,
            ..Default::default()
        };
        let (program, _rx) = program_with(maps, 16, Box::new(EveryNth::new()));

        program.on_drop(NodeId(0), 1, 1);
        program.on_drop(NodeId(0), 2, 1);

        let maps = program.maps();
        assert_eq!(maps.nodes.get(0).unwrap().aggregate.snapshot().drop_count, 2);
        assert_eq!(maps.lost.snapshot().reason_table_full, 1);
    }

    #[test]
    fn test_retransmits_always_mirrored() {
        let (program, mut rx) =
            program_with(MapsConfig::default(), 64, Box::new(RandomSampler));

        for i in 0..20 {
            program.on_retransmit(NodeId(0), i);
        }

        let events = drain(&mut rx);
        assert_eq!(events.len(), 20);
        assert!(events.iter().all(|e| e.kind == EventKind::Retransmit));
    }

    #[test]
    fn test_drop_sampling_carries_reason() {
        let (program, mut rx) = program_with(MapsConfig::default(), 64, Box::new(EveryNth::new()));

        for i in 0..30 {
            program.on_drop(NodeId(0), 5, i);
        }

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.kind == EventKind::Drop && e.reason == 5));
    }

    #[test]
    fn test_rtt_sampling_is_statistically_one_percent() {
        let (program, mut rx) =
            program_with(MapsConfig::default(), 20_000, Box::new(RandomSampler));

        for i in 0..10_000u64 {
            program.on_tcp_ack(NodeId(0), srtt_for_ms((i % 50) as u32), i);
        }

        // Aggregates reflect every event exactly
        let agg = program.maps().nodes.get(0).unwrap().aggregate.snapshot();
        assert_eq!(agg.rtt_count, 10_000);
        let expected_sum: u64 = (0..10_000u64).map(|i| i % 50).sum();
        assert_eq!(agg.rtt_sum, expected_sum);

        // Binomial(10000, 0.01): mean 100, sd ~9.95; allow six sigma
        let sampled = drain(&mut rx).len();
        assert!(
            (40..=160).contains(&sampled),
            "sampled {} events, expected about 100",
            sampled
        );
    }

    #[test]
    fn test_full_ring_never_affects_aggregates() {
        let (program, mut rx) = program_with(MapsConfig::default(), 4, Box::new(RandomSampler));

        for i in 0..100 {
            program.on_retransmit(NodeId(0), i);
        }

        let maps = program.maps();
        assert_eq!(
            maps.nodes.get(0).unwrap().aggregate.snapshot().retrans_count,
            100
        );
        assert_eq!(maps.lost.snapshot().ring_full, 96);
        assert_eq!(drain(&mut rx).len(), 4);
    }

    #[test]
    fn test_concurrent_handlers_lose_nothing() {
        let (program, _rx) = program_with(MapsConfig::default(), 1, Box::new(EveryNth::new()));
        let program = Arc::new(program);

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let program = program.clone();
                std::thread::spawn(move || {
                    for i in 0..5_000u64 {
                        program.on_tcp_ack(NodeId(t % 2), srtt_for_ms(4), i);
                        program.on_retransmit(NodeId(t % 2), i);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let maps = program.maps();
        for node in [0, 1] {
            let record = maps.nodes.get(node).unwrap();
            let agg = record.aggregate.snapshot();
            assert_eq!(agg.rtt_count, 10_000);
            assert_eq!(agg.retrans_count, 10_000);
            assert_eq!(record.rtt_hist.snapshot().total(), 10_000);
        }
    }
}

mod runqueue_tests {
    use super::*;

    #[test]
    fn test_wakeup_switch_pairing() {
        let (program, _rx) = program_with(MapsConfig::default(), 16, Box::new(EveryNth::new()));

        program.on_sched_wakeup(42, 10 * MS);
        program.on_sched_switch(NodeId(0), 42, 13 * MS);

        let record = program.maps().nodes.get(0).unwrap();
        let agg = record.aggregate.snapshot();
        assert_eq!(agg.runqlat_count, 1);
        assert_eq!(agg.runqlat_sum, 3);
        assert_eq!(record.runqlat_hist.snapshot().slots[1], 1);

        // The entry is consumed by the pairing
        assert_eq!(program.maps().wakeups.occupied(), 0);
    }

    #[test]
    fn test_switch_without_wakeup_records_nothing() {
        let (program, _rx) = program_with(MapsConfig::default(), 16, Box::new(EveryNth::new()));

        program.on_sched_switch(NodeId(0), 7, 5 * MS);

        assert!(program.maps().nodes.get(0).is_none());
    }

    #[test]
    fn test_stale_wakeup_is_discarded_at_dispatch() {
        let maps = MapsConfig {
            wakeup_ttl: Duration::from_millis(100),
            ..Default::default()
        };
        let (program, _rx) = program_with(maps, 16, Box::new(EveryNth::new()));

        program.on_sched_wakeup(9, MS);
        program.on_sched_switch(NodeId(0), 9, 500 * MS);

        assert!(program.maps().nodes.get(0).is_none());
        assert_eq!(program.maps().wakeups.evicted(), 1);
    }

    #[test]
    fn test_unpaired_wakeups_are_bounded_and_evicted() {
        let table = WakeupTable::new(16, Duration::from_millis(10));

        // Far more exiting tasks than slots: memory stays fixed
        for pid in 0..1_000 {
            table.record(pid, MS);
        }
        assert!(table.occupied() <= 16);

        let cleared = table.evict_expired(100 * MS);
        assert_eq!(cleared as usize, 16);
        assert_eq!(table.occupied(), 0);
        assert_eq!(table.evicted(), 16);
    }

    #[test]
    fn test_colliding_pid_overwrites_slot() {
        let table = WakeupTable::new(8, Duration::from_secs(1));

        table.record(1, MS);
        table.record(9, 2 * MS);

        assert_eq!(table.take(1, 3 * MS), None);
        assert_eq!(table.take(9, 3 * MS), Some(MS));
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_attach_feed_and_detach() {
        let (source, tx) = ChannelSource::new(64);
        let (handle, mut events) =
            Collector::attach(CollectorConfig::new(NodeId(5)), Box::new(source))
                .await
                .unwrap();
        assert!(handle.is_running());
        assert_eq!(handle.source_name(), "channel");

        for ts in 0..10 {
            tx.send(KernelEvent::Retransmit { timestamp_ns: ts }).await.unwrap();
        }
        tx.send(KernelEvent::SchedWakeup {
            pid: 11,
            timestamp_ns: 100,
        })
        .await
        .unwrap();
        tx.send(KernelEvent::SchedSwitch {
            next_pid: 11,
            timestamp_ns: 100 + 2 * MS,
        })
        .await
        .unwrap();

        // Every retransmit is mirrored onto the stream
        for _ in 0..10 {
            let event = events.recv().await.unwrap();
            assert_eq!(event.node_id, NodeId(5));
        }

        // Closing the feed lets the source drain and exit on its own
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let maps = handle.maps();
        handle.detach().await.unwrap();

        let agg = maps.nodes.get(5).unwrap().aggregate.snapshot();
        assert_eq!(agg.retrans_count, 10);
        assert_eq!(agg.runqlat_count, 1);
        assert_eq!(agg.runqlat_sum, 2);
    }

    /// Source whose task dies right after attaching
    struct PanickingSource;

    #[async_trait::async_trait]
    impl TelemetrySource for PanickingSource {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn probe(&self) -> Result<(), CollectorError> {
            Ok(())
        }

        async fn run(
            self: Box<Self>,
            _program: Arc<TelemetryProgram>,
            _shutdown: tokio::sync::broadcast::Receiver<()>,
        ) -> Result<(), CollectorError> {
            panic!("source crashed");
        }
    }

    #[tokio::test]
    async fn test_watchdog_marks_collector_unhealthy_when_source_dies() {
        let health = HealthRegistry::new("telemetry-agent");
        health.register(components::COLLECTOR).await;

        let (handle, _events) =
            Collector::attach(CollectorConfig::new(NodeId(0)), Box::new(PanickingSource))
                .await
                .unwrap();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        tokio::time::timeout(
            Duration::from_secs(2),
            watch_source(
                handle.liveness(),
                handle.source_name(),
                health.clone(),
                Duration::from_millis(10),
                shutdown_rx,
            ),
        )
        .await
        .unwrap();

        assert!(!handle.is_running());
        assert_eq!(
            health.status_of(components::COLLECTOR).await,
            Some(ComponentStatus::Unhealthy)
        );
        assert!(matches!(handle.detach().await, Err(CollectorError::Source(_))));
    }

    #[tokio::test]
    async fn test_watchdog_leaves_running_source_alone() {
        let health = HealthRegistry::new("telemetry-agent");
        health.register(components::COLLECTOR).await;

        let (source, _tx) = ChannelSource::new(8);
        let (handle, _events) = Collector::attach(CollectorConfig::new(NodeId(0)), Box::new(source))
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let watcher = tokio::spawn(watch_source(
            handle.liveness(),
            handle.source_name(),
            health.clone(),
            Duration::from_millis(10),
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        watcher.await.unwrap();

        assert_eq!(
            health.status_of(components::COLLECTOR).await,
            Some(ComponentStatus::Healthy)
        );
        handle.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_source_set_stops_when_a_member_dies() {
        let health = HealthRegistry::new("telemetry-agent");
        health.register(components::COLLECTOR).await;

        let (channel, _tx) = ChannelSource::new(8);
        let set = SourceSet::new()
            .with(Box::new(channel))
            .with(Box::new(PanickingSource));
        assert_eq!(set.names(), vec!["channel", "panicking"]);

        let (handle, _events) = Collector::attach(CollectorConfig::new(NodeId(0)), Box::new(set))
            .await
            .unwrap();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        tokio::time::timeout(
            Duration::from_secs(2),
            watch_source(
                handle.liveness(),
                handle.source_name(),
                health.clone(),
                Duration::from_millis(10),
                shutdown_rx,
            ),
        )
        .await
        .unwrap();

        assert_eq!(
            health.status_of(components::COLLECTOR).await,
            Some(ComponentStatus::Unhealthy)
        );
        assert!(matches!(handle.detach().await, Err(CollectorError::Source(_))));
    }

    #[tokio::test]
    async fn test_source_set_detaches_all_members() {
        let (first, first_tx) = ChannelSource::new(8);
        let (second, second_tx) = ChannelSource::new(8);
        let set = SourceSet::new().with(Box::new(first)).with(Box::new(second));

        let (handle, _events) = Collector::attach(CollectorConfig::new(NodeId(2)), Box::new(set))
            .await
            .unwrap();
        assert_eq!(handle.source_name(), "source_set");

        first_tx
            .send(KernelEvent::Retransmit { timestamp_ns: 1 })
            .await
            .unwrap();
        second_tx
            .send(KernelEvent::Retransmit { timestamp_ns: 2 })
            .await
            .unwrap();

        let maps = handle.maps();
        tokio::time::timeout(Duration::from_secs(2), async {
            while maps
                .nodes
                .get(2)
                .map_or(0, |record| record.aggregate.snapshot().retrans_count)
                < 2
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(handle.is_running());
        handle.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_source_set_fails_attach() {
        let result =
            Collector::attach(CollectorConfig::new(NodeId(0)), Box::new(SourceSet::new())).await;
        assert!(matches!(result, Err(CollectorError::Attach(_))));
    }

    #[tokio::test]
    async fn test_procfs_attach_fails_without_counters() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = ProcfsSource::new(dir.path(), Duration::from_millis(10));

        let result = Collector::attach(CollectorConfig::new(NodeId(0)), Box::new(source)).await;
        assert!(matches!(result, Err(CollectorError::Attach(_))));
    }
}

mod procfs_tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;

    const SNMP: &str = "Ip: Forwarding DefaultTTL\n\
Ip: 1 64\n\
Tcp: RtoAlgorithm RtoMin RtoMax MaxConn ActiveOpens PassiveOpens AttemptFails EstabResets CurrEstab InSegs OutSegs RetransSegs InErrs OutRsts InCsumErrors\n\
Tcp: 1 200 120000 -1 100 50 3 2 10 5000 6000 RETRANS 0 4 0\n";

    const DEV: &str = "Inter-|   Receive                                                |  Transmit\n \
face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    \
lo: 1000 10 0 50 0 0 0 0 1000 10 0 50 0 0 0 0\n  \
eth0: 9000 90 0 RXDROP 0 0 0 0 8000 80 0 TXDROP 0 0 0 0\n";

    const SCHEDSTAT: &str = "version 15\n\
timestamp 4295000000\n\
cpu0 0 0 100 10 50 20 DELAY0 RUNDELAY0 SLICES0\n\
domain0 3 1 2 3 4 5 6 7 8 9\n\
cpu1 0 0 100 10 50 20 5000 RUNDELAY1 SLICES1\n";

    fn snmp(retrans: u64) -> String {
        SNMP.replace("RETRANS", &retrans.to_string())
    }

    fn dev(rx: u64, tx: u64) -> String {
        DEV.replace("RXDROP", &rx.to_string())
            .replace("TXDROP", &tx.to_string())
    }

    fn schedstat(cpu0: (u64, u64), cpu1: (u64, u64)) -> String {
        SCHEDSTAT
            .replace("RUNDELAY0", &cpu0.0.to_string())
            .replace("DELAY0", "5000")
            .replace("SLICES0", &cpu0.1.to_string())
            .replace("RUNDELAY1", &cpu1.0.to_string())
            .replace("SLICES1", &cpu1.1.to_string())
    }

    /// Replace a file atomically so a concurrent poll never sees it empty
    async fn replace(path: std::path::PathBuf, content: String) {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content).await.unwrap();
        fs::rename(&tmp, &path).await.unwrap();
    }

    async fn write_proc(root: &std::path::Path, retrans: u64, drops: (u64, u64), sched: String) {
        fs::create_dir_all(root.join("net")).await.unwrap();
        replace(root.join("net/snmp"), snmp(retrans)).await;
        replace(root.join("net/dev"), dev(drops.0, drops.1)).await;
        replace(root.join("schedstat"), sched).await;
    }

    #[test]
    fn test_parse_retrans_segs() {
        assert_eq!(ProcfsSource::parse_retrans_segs(&snmp(321)), Some(321));
        assert_eq!(ProcfsSource::parse_retrans_segs("Ip: 1 2\n"), None);
    }

    #[test]
    fn test_parse_dev_drops_skips_loopback() {
        assert_eq!(ProcfsSource::parse_dev_drops(&dev(7, 3)), 10);
    }

    #[test]
    fn test_parse_schedstat() {
        let stats = ProcfsSource::parse_schedstat(&schedstat((4_000_000, 4), (0, 0)));
        assert_eq!(stats.len(), 2);
        assert_eq!(
            stats["cpu0"],
            CpuSchedStat {
                run_delay_ns: 4_000_000,
                timeslices: 4
            }
        );
    }

    #[test]
    fn test_delta_between_samples() {
        let prev = ProcSample {
            retrans_segs: Some(10),
            dev_drops: Some(100),
            sched: ProcfsSource::parse_schedstat(&schedstat((1_000_000, 10), (0, 5))),
        };
        let next = ProcSample {
            retrans_segs: Some(15),
            dev_drops: Some(90),
            sched: ProcfsSource::parse_schedstat(&schedstat((21_000_000, 20), (0, 5))),
        };

        let delta = ProcfsSource::delta(&prev, &next);
        assert_eq!(delta.retransmits, 5);
        // Counter went backwards: treated as a reset
        assert_eq!(delta.drops, 0);
        // cpu0: 20ms over 10 slices; cpu1 did not run
        assert_eq!(delta.runqueue_latencies_ns, vec![2_000_000]);
    }

    #[tokio::test]
    async fn test_zero_poll_interval_fails_attach() {
        let dir = TempDir::new().unwrap();
        write_proc(dir.path(), 100, (0, 0), schedstat((0, 0), (0, 0))).await;

        let source = ProcfsSource::new(dir.path(), Duration::ZERO);
        let result = Collector::attach(CollectorConfig::new(NodeId(0)), Box::new(source)).await;
        assert!(matches!(result, Err(CollectorError::Attach(ref e)) if e.contains("poll interval")));
    }

    #[tokio::test]
    async fn test_procfs_source_feeds_collector() {
        let dir = TempDir::new().unwrap();
        write_proc(dir.path(), 100, (0, 0), schedstat((0, 0), (0, 0))).await;

        let source = ProcfsSource::new(dir.path(), Duration::from_millis(20));
        let (handle, mut events) = Collector::attach(CollectorConfig::new(NodeId(1)), Box::new(source))
            .await
            .unwrap();

        // Let the baseline poll happen, then move the counters
        tokio::time::sleep(Duration::from_millis(50)).await;
        write_proc(
            dir.path(),
            103,
            (4, 6),
            schedstat((8_000_000, 2), (0, 0)),
        )
        .await;

        // Sampled drops may interleave; wait for all three retransmits
        let mut retransmits = 0;
        while retransmits < 3 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.node_id, NodeId(1));
            if event.kind == EventKind::Retransmit {
                retransmits += 1;
            }
        }

        let maps = handle.maps();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.detach().await.unwrap();

        let agg = maps.nodes.get(1).unwrap().aggregate.snapshot();
        assert_eq!(agg.retrans_count, 3);
        assert_eq!(agg.drop_count, 10);
        assert_eq!(agg.runqlat_count, 1);
        assert_eq!(agg.runqlat_sum, 4);
        assert_eq!(maps.drop_reasons(), vec![(DROP_REASON_UNSPECIFIED, 10)]);
    }
}

mod tcp_info_tests {
    use super::*;

    const SS_OUTPUT: &str = "\
Recv-Q Send-Q Local Address:Port  Peer Address:Port Process
0      0      10.0.0.5:22         10.0.0.9:51234
\t cubic wscale:7,7 rto:204 rtt:3.5/1.75 ato:40 mss:1448 rcv_rtt:4 minrtt:0.5
0      0      10.0.0.5:443        10.0.0.7:40000
\t cubic rto:201 rtt:0.25/0.1 mss:1448 minrtt:0.2
0      0      10.0.0.5:8080       10.0.0.8:40100
\t cubic rto:1200 rtt:120/60 mss:1448
";

    #[test]
    fn test_parse_connection_rtts() {
        assert_eq!(TcpInfoSource::parse_rtts_ms(SS_OUTPUT), vec![3.5, 0.25, 120.0]);
        assert!(TcpInfoSource::parse_rtts_ms("").is_empty());
        assert!(TcpInfoSource::parse_rtts_ms("rtt:nan/1 rtt:-1/0 rtt:").is_empty());
    }

    #[test]
    fn test_ms_to_kernel_srtt() {
        assert_eq!(TcpInfoSource::ms_to_srtt(12.0), srtt_for_ms(12));
        assert_eq!(srtt_to_ms(TcpInfoSource::ms_to_srtt(12.0)), 12);
        assert_eq!(TcpInfoSource::ms_to_srtt(0.25), 250 << 3);
        assert_eq!(TcpInfoSource::ms_to_srtt(1e12), (u32::MAX >> 3) << 3);
    }

    #[test]
    fn test_rtts_flow_through_ack_handler() {
        let (program, _rx) = program_with(MapsConfig::default(), 16, Box::new(EveryNth::new()));

        let rtts = TcpInfoSource::parse_rtts_ms(SS_OUTPUT);
        TcpInfoSource::replay(&program, &rtts);

        let record = program.maps().nodes.get(0).unwrap();
        let agg = record.aggregate.snapshot();
        assert_eq!(agg.rtt_count, 3);
        // 3.5ms and 0.25ms truncate to whole milliseconds
        assert_eq!(agg.rtt_sum, 3 + 120);
        assert_eq!(record.rtt_hist.snapshot().total(), 3);
    }

    #[test]
    fn test_replay_caps_sockets_per_poll() {
        let (program, _rx) = program_with(MapsConfig::default(), 16, Box::new(EveryNth::new()));

        let rtts = vec![1.0; MAX_SOCKETS_PER_POLL + 5];
        TcpInfoSource::replay(&program, &rtts);

        let agg = program.maps().nodes.get(0).unwrap().aggregate.snapshot();
        assert_eq!(agg.rtt_count, MAX_SOCKETS_PER_POLL as u64);
        assert_eq!(program.maps().lost.source_overflow.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_missing_command_fails_attach() {
        let source = TcpInfoSource::new("/nonexistent/bin/ss", Duration::from_millis(10));
        let result = Collector::attach(CollectorConfig::new(NodeId(0)), Box::new(source)).await;
        assert!(matches!(result, Err(CollectorError::Attach(_))));
    }

    #[tokio::test]
    async fn test_zero_poll_interval_fails_attach() {
        let source = TcpInfoSource::with_command("true", Vec::new(), Duration::ZERO);
        let result = Collector::attach(CollectorConfig::new(NodeId(0)), Box::new(source)).await;
        assert!(matches!(result, Err(CollectorError::Attach(ref e)) if e.contains("poll interval")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tcp_info_source_feeds_collector() {
        let dir = tempfile::TempDir::new().unwrap();
        let fixture = dir.path().join("ss.out");
        tokio::fs::write(&fixture, SS_OUTPUT).await.unwrap();

        let source = TcpInfoSource::with_command(
            "cat",
            vec![fixture.display().to_string()],
            Duration::from_millis(20),
        );
        let (handle, _events) = Collector::attach(CollectorConfig::new(NodeId(4)), Box::new(source))
            .await
            .unwrap();
        assert_eq!(handle.source_name(), "tcp_info");

        let maps = handle.maps();
        tokio::time::timeout(Duration::from_secs(2), async {
            while maps
                .nodes
                .get(4)
                .map_or(0, |record| record.aggregate.snapshot().rtt_count)
                < 6
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.detach().await.unwrap();

        // Whole polls only: three connections per pass
        let record = maps.nodes.get(4).unwrap();
        let agg = record.aggregate.snapshot();
        assert_eq!(agg.rtt_count % 3, 0);
        assert_eq!(record.rtt_hist.snapshot().total(), agg.rtt_count);
    }
}
