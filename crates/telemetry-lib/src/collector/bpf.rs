//! libbpf-backed telemetry source
//!
//! Loads the compiled `netsched.bpf.o` object (see `bpf/netsched.bpf.c`),
//! attaches every program in it and drains its `events` ring buffer into
//! the collector handlers. The kernel side pairs wake-ups with dispatches
//! itself, so runqueue latency arrives pre-paired.

use super::lifecycle::TelemetrySource;
use super::probes::{KernelEvent, TelemetryProgram};
use super::CollectorError;
use async_trait::async_trait;
use libbpf_rs::{ErrorKind, MapCore, Object, ObjectBuilder, RingBufferBuilder};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Size of one ring buffer record
pub const RAW_EVENT_SIZE: usize = 24;

const EVENTS_MAP: &str = "events";
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

const KIND_TCP_ACK: u32 = 1;
const KIND_RETRANSMIT: u32 = 2;
const KIND_DROP: u32 = 3;
const KIND_RUNQUEUE_LATENCY: u32 = 4;

/// One `struct raw_event` as written by the kernel programs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: u32,
    /// Drop reason for drops, zero otherwise
    pub aux: u32,
    /// srtt in kernel units for acks, nanoseconds for runqueue latency
    pub value: u64,
    pub timestamp_ns: u64,
}

impl RawEvent {
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < RAW_EVENT_SIZE {
            return None;
        }
        let u32_at = |at: usize| data[at..at + 4].try_into().ok().map(u32::from_ne_bytes);
        let u64_at = |at: usize| data[at..at + 8].try_into().ok().map(u64::from_ne_bytes);

        Some(Self {
            kind: u32_at(0)?,
            aux: u32_at(4)?,
            value: u64_at(8)?,
            timestamp_ns: u64_at(16)?,
        })
    }

    /// The collector event for this record, stamped with the collector's
    /// own clock
    pub fn into_kernel_event(self, now_ns: u64) -> Option<KernelEvent> {
        let event = match self.kind {
            KIND_TCP_ACK => KernelEvent::TcpAck {
                srtt: u32::try_from(self.value).unwrap_or(u32::MAX),
                timestamp_ns: now_ns,
            },
            KIND_RETRANSMIT => KernelEvent::Retransmit {
                timestamp_ns: now_ns,
            },
            KIND_DROP => KernelEvent::Drop {
                reason: self.aux,
                timestamp_ns: now_ns,
            },
            KIND_RUNQUEUE_LATENCY => KernelEvent::RunqueueLatency {
                latency_ns: self.value,
                timestamp_ns: now_ns,
            },
            _ => return None,
        };
        Some(event)
    }
}

fn attach_error(path: &Path, e: libbpf_rs::Error) -> CollectorError {
    CollectorError::Attach(format!("cannot load {}: {}", path.display(), e))
}

fn source_error(e: libbpf_rs::Error) -> CollectorError {
    CollectorError::Source(e.to_string())
}

/// Collector source fed by the kernel programs
pub struct BpfSource {
    object_path: PathBuf,
    poll_timeout: Duration,
}

impl BpfSource {
    pub fn new(object_path: impl Into<PathBuf>) -> Self {
        Self {
            object_path: object_path.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    fn load(path: &Path) -> Result<Object, CollectorError> {
        ObjectBuilder::default()
            .open_file(path)
            .map_err(|e| attach_error(path, e))?
            .load()
            .map_err(|e| attach_error(path, e))
    }

    /// Attach, then poll the ring until `stop` is set. Dropping the links
    /// on return detaches the programs.
    fn poll_ring(
        path: PathBuf,
        program: Arc<TelemetryProgram>,
        stop: Arc<AtomicBool>,
        poll_timeout: Duration,
    ) -> Result<(), CollectorError> {
        let mut object = Self::load(&path)?;

        let mut links = Vec::new();
        for prog in object.progs_mut() {
            let link = prog.attach().map_err(|e| {
                CollectorError::Source(format!(
                    "cannot attach {}: {}",
                    prog.name().to_string_lossy(),
                    e
                ))
            })?;
            links.push(link);
        }

        let events = object
            .maps()
            .find(|map| map.name() == EVENTS_MAP)
            .ok_or_else(|| {
                CollectorError::Source(format!("{} has no {} map", path.display(), EVENTS_MAP))
            })?;

        let handler = program;
        let mut malformed: u64 = 0;
        let mut builder = RingBufferBuilder::new();
        builder
            .add(&events, move |data: &[u8]| {
                match RawEvent::decode(data).and_then(|raw| raw.into_kernel_event(handler.now_ns()))
                {
                    Some(event) => handler.handle(&event),
                    None => {
                        malformed += 1;
                        if malformed.is_power_of_two() {
                            warn!(malformed = malformed, "Malformed BPF ring records");
                        }
                    }
                }
                0
            })
            .map_err(source_error)?;
        let ring = builder.build().map_err(source_error)?;

        info!(
            object = %path.display(),
            programs = links.len(),
            "BPF programs attached"
        );

        while !stop.load(Ordering::Acquire) {
            if let Err(e) = ring.poll(poll_timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(source_error(e));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySource for BpfSource {
    fn name(&self) -> &'static str {
        "bpf"
    }

    async fn probe(&self) -> Result<(), CollectorError> {
        let path = self.object_path.clone();
        tokio::task::spawn_blocking(move || Self::load(&path).map(drop))
            .await
            .map_err(|e| CollectorError::Attach(format!("BPF loader failed: {}", e)))?
    }

    async fn run(
        self: Box<Self>,
        program: Arc<TelemetryProgram>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), CollectorError> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut poller = tokio::task::spawn_blocking({
            let stop = stop.clone();
            let path = self.object_path.clone();
            let poll_timeout = self.poll_timeout;
            move || Self::poll_ring(path, program, stop, poll_timeout)
        });

        let joined = tokio::select! {
            joined = &mut poller => joined,
            _ = shutdown.recv() => {
                info!("Stopping BPF telemetry source");
                stop.store(true, Ordering::Release);
                (&mut poller).await
            }
        };
        joined.map_err(|e| CollectorError::Source(format!("BPF poller failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: u32, aux: u32, value: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(RAW_EVENT_SIZE);
        data.extend_from_slice(&kind.to_ne_bytes());
        data.extend_from_slice(&aux.to_ne_bytes());
        data.extend_from_slice(&value.to_ne_bytes());
        data.extend_from_slice(&7u64.to_ne_bytes());
        data
    }

    #[test]
    fn test_decode_records() {
        let raw = RawEvent::decode(&record(KIND_DROP, 2, 0)).unwrap();
        assert_eq!(raw.timestamp_ns, 7);
        assert_eq!(
            raw.into_kernel_event(99),
            Some(KernelEvent::Drop {
                reason: 2,
                timestamp_ns: 99
            })
        );

        let ack = RawEvent::decode(&record(KIND_TCP_ACK, 0, 12_000 << 3)).unwrap();
        assert_eq!(
            ack.into_kernel_event(1),
            Some(KernelEvent::TcpAck {
                srtt: 12_000 << 3,
                timestamp_ns: 1
            })
        );
    }

    #[test]
    fn test_rejects_short_and_unknown_records() {
        assert!(RawEvent::decode(&[0u8; 10]).is_none());
        let unknown = RawEvent::decode(&record(42, 0, 0)).unwrap();
        assert!(unknown.into_kernel_event(0).is_none());
    }
}
