//! Structured event logging
//!
//! The radio emits time-series records (slots transmitted, packets received,
//! sent, and dropped, plus free-form events) through an injected
//! [`RadioLogger`] sink. [`NullLogger`] discards everything;
//! [`TracingLogger`] forwards to the `tracing` subscriber. An absent logger
//! is a no-op.

use std::sync::Arc;

use crate::clock::MonoTime;
use crate::types::{NodeId, Seq};

/// A single log record.
#[derive(Debug, Clone)]
pub struct RadioLog {
    /// Monotonic time of the event.
    pub t: MonoTime,
    /// The event itself.
    pub event: RadioEvent,
}

/// Log record payloads.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// A slot went to the device.
    SlotTx {
        deadline: MonoTime,
        nsamples: usize,
        npackets: usize,
    },
    /// A packet was received from the radio.
    Recv {
        node: NodeId,
        seq: Seq,
        evm: f64,
        rssi: f64,
        header_valid: bool,
        payload_valid: bool,
    },
    /// A packet went out over the air.
    Send {
        node: NodeId,
        seq: Seq,
        mcsidx: usize,
        nretrans: usize,
    },
    /// The ARQ gave up on a packet.
    Drop { node: NodeId, seq: Seq },
    /// Free-form event.
    Event { msg: String },
}

/// A sink for radio log records.
pub trait RadioLogger: Send + Sync {
    fn log(&self, record: RadioLog);

    /// Attributes recorded once at startup.
    fn set_attributes(&self, _tx_bandwidth: f64, _rx_bandwidth: f64, _start: MonoTime) {}
}

/// Shared handle to an optional logger.
pub type LoggerRef = Option<Arc<dyn RadioLogger>>;

/// Log to a sink if one is present.
pub fn log_event(logger: &LoggerRef, event: RadioEvent) {
    if let Some(logger) = logger {
        logger.log(RadioLog {
            t: crate::clock::MonoClock::now(),
            event,
        });
    }
}

/// Discards all records.
pub struct NullLogger;

impl RadioLogger for NullLogger {
    fn log(&self, _record: RadioLog) {}
}

/// Forwards records to the `tracing` subscriber.
pub struct TracingLogger;

impl RadioLogger for TracingLogger {
    fn log(&self, record: RadioLog) {
        match record.event {
            RadioEvent::SlotTx {
                deadline,
                nsamples,
                npackets,
            } => {
                tracing::debug!(t = record.t.secs(), deadline = deadline.secs(), nsamples, npackets, "slot tx");
            }
            RadioEvent::Recv {
                node,
                seq,
                evm,
                rssi,
                header_valid,
                payload_valid,
            } => {
                tracing::debug!(t = record.t.secs(), node, seq = seq.0, evm, rssi, header_valid, payload_valid, "recv");
            }
            RadioEvent::Send {
                node,
                seq,
                mcsidx,
                nretrans,
            } => {
                tracing::debug!(t = record.t.secs(), node, seq = seq.0, mcsidx, nretrans, "send");
            }
            RadioEvent::Drop { node, seq } => {
                tracing::info!(t = record.t.secs(), node, seq = seq.0, "drop");
            }
            RadioEvent::Event { msg } => {
                tracing::info!(t = record.t.secs(), "{msg}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct VecLogger(Mutex<Vec<RadioLog>>);

    impl RadioLogger for VecLogger {
        fn log(&self, record: RadioLog) {
            self.0.lock().unwrap().push(record);
        }
    }

    #[test]
    fn test_log_event_with_sink() {
        let sink = Arc::new(VecLogger(Mutex::new(Vec::new())));
        let logger: LoggerRef = Some(sink.clone());
        log_event(&logger, RadioEvent::Drop { node: 1, seq: Seq(2) });
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_log_event_without_sink_is_noop() {
        let logger: LoggerRef = None;
        log_event(&logger, RadioEvent::Event { msg: "x".into() });
    }
}
