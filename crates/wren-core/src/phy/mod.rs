//! The physical layer
//!
//! [`Phy`] is the factory for per-thread [`Modulator`]s and [`Demodulator`]s
//! over a shared MCS table, plus the modulated-size oracle the MAC and the
//! ARQ controller use to count samples per slot without modulating anything.
//! Construction validates the EVM-threshold vector against the MCS table;
//! a size mismatch is a configuration error.

pub mod autogain;
pub mod channelizer;
pub mod framing;
pub mod modem;
pub mod synthesizer;

use std::sync::Arc;

use crate::clock::{MonoClock, MonoTime};
use crate::iqbuf::IQBuf;
use crate::mcs::{Mcs, McsEntry};
use crate::packet::{NetPacket, Packet, RadioPacket};
use crate::types::{Channel, IQSample, NodeId, RadioError, RadioResult};
use crate::workqueue::WorkQueue;

use self::framing::{FrameSync, PhyHeader};

/// A modulated packet: the source packet paired with its IQ samples.
#[derive(Debug)]
pub struct ModPacket {
    /// The packet that was modulated.
    pub pkt: NetPacket,
    /// Modulated samples.
    pub samples: Arc<IQBuf>,
    /// Offset of the first real sample (filter transients precede it).
    pub offset: usize,
    /// Number of real samples.
    pub nsamples: usize,
    /// Set once the packet is fully modulated and resampled.
    pub complete: bool,
    /// Wall-clock modulation latency in seconds.
    pub mod_latency: f64,
    /// Channel the packet is bound for.
    pub channel: Channel,
}

/// Work item for the auto-gain estimator.
type AutoGainItem = (Arc<McsEntry>, f64, Arc<IQBuf>);

/// The PHY: MCS table, framing parameters, and mod/demod factories.
pub struct Phy {
    node_id: NodeId,
    mcs_table: Vec<Arc<McsEntry>>,
    max_payload_len: usize,
    min_rx_oversample: usize,
    min_tx_oversample: usize,
    autogain_workq: WorkQueue<AutoGainItem>,
}

impl Phy {
    /// Create a PHY for `node_id` over `mcs_table`.
    ///
    /// `evm_thresholds`, when given, must have exactly one (possibly absent)
    /// threshold per MCS table row.
    pub fn new(
        node_id: NodeId,
        mcs_table: Vec<Mcs>,
        evm_thresholds: Option<Vec<Option<f64>>>,
        max_payload_len: usize,
    ) -> RadioResult<Phy> {
        if mcs_table.is_empty() {
            return Err(RadioError::Config("MCS table is empty".into()));
        }

        let thresholds = match evm_thresholds {
            Some(t) if t.len() != mcs_table.len() => {
                return Err(RadioError::Config(format!(
                    "EVM threshold count {} does not match MCS table size {}",
                    t.len(),
                    mcs_table.len()
                )));
            }
            Some(t) => t,
            None => vec![None; mcs_table.len()],
        };

        let mcs_table: Vec<Arc<McsEntry>> = mcs_table
            .into_iter()
            .zip(thresholds)
            .map(|(mcs, evm_threshold)| {
                let mut entry = McsEntry::new(mcs);
                entry.evm_threshold = evm_threshold;
                Arc::new(entry)
            })
            .collect();

        let autogain_workq = WorkQueue::new(1, |(entry, g, buf): AutoGainItem| {
            entry.autogain.estimate(g, &buf);
        });

        Ok(Phy {
            node_id,
            mcs_table,
            max_payload_len,
            min_rx_oversample: 1,
            min_tx_oversample: 1,
            autogain_workq,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The MCS table.
    pub fn mcs_table(&self) -> &[Arc<McsEntry>] {
        &self.mcs_table
    }

    /// One MCS table row.
    pub fn mcs(&self, mcsidx: usize) -> RadioResult<&Arc<McsEntry>> {
        self.mcs_table
            .get(mcsidx)
            .ok_or(RadioError::InvalidMcs(mcsidx))
    }

    /// Largest payload body accepted by the framer.
    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    /// Exact number of channel-rate samples needed to modulate a packet body
    /// of `n` bytes at MCS `mcsidx`.
    pub fn modulated_size(&self, mcsidx: usize, n: usize) -> RadioResult<usize> {
        let entry = self.mcs(mcsidx)?;
        Ok(framing::frame_syms(&entry.mcs, n))
    }

    /// Minimum RX oversample ratio with respect to channel bandwidth.
    pub fn min_rx_rate_oversample(&self) -> usize {
        self.min_rx_oversample
    }

    /// Minimum TX oversample ratio with respect to channel bandwidth.
    pub fn min_tx_rate_oversample(&self) -> usize {
        self.min_tx_oversample
    }

    /// Create a modulator for this PHY.
    pub fn mk_modulator(phy: &Arc<Phy>) -> Modulator {
        Modulator {
            phy: phy.clone(),
            payload_mcsidx: 0,
            pending: Vec::new(),
            pos: 0,
        }
    }

    /// Create a demodulator for this PHY.
    pub fn mk_demodulator(phy: &Arc<Phy>) -> Demodulator {
        let table: Vec<Mcs> = phy.mcs_table.iter().map(|e| e.mcs).collect();
        Demodulator {
            phy: phy.clone(),
            sync: FrameSync::new(table, phy.max_payload_len),
            t0: MonoTime::default(),
            offset: 0.0,
            delay: 0.0,
            rate: 1.0,
            rx_rate: 1.0,
            sample_start: 0,
            channel: Channel::default(),
        }
    }
}

/// A stateful packet modulator.
pub struct Modulator {
    phy: Arc<Phy>,
    payload_mcsidx: usize,
    pending: Vec<IQSample>,
    pos: usize,
}

impl Modulator {
    /// Reconfigure the payload MCS if it changed.
    pub fn set_payload_mcs(&mut self, mcsidx: usize) -> RadioResult<()> {
        self.phy.mcs(mcsidx)?;
        self.payload_mcsidx = mcsidx;
        Ok(())
    }

    /// Largest number of samples one `modulate_samples` call can produce.
    pub fn max_modulated_samples(&self) -> usize {
        512
    }

    /// Assemble a packet into pending frame symbols.
    pub fn assemble(&mut self, pkt: &NetPacket) -> RadioResult<()> {
        let entry = self.phy.mcs(self.payload_mcsidx)?;
        let body = pkt.body();
        if body.len() > self.phy.max_payload_len {
            return Err(RadioError::Config(format!(
                "packet body of {} bytes exceeds max payload {}",
                body.len(),
                self.phy.max_payload_len
            )));
        }

        let phdr = PhyHeader {
            hdr: pkt.pkt.hdr,
            mcsidx: self.payload_mcsidx as u8,
            payload_len: (body.len() + entry.mcs.check.len()) as u16,
        };

        self.pending.clear();
        self.pos = 0;
        framing::assemble(&phdr, &entry.mcs, body, &mut self.pending);
        Ok(())
    }

    /// Generate up to `out.len()` samples of the assembled frame. Returns the
    /// number written and whether the frame is finished.
    pub fn modulate_samples(&mut self, out: &mut [IQSample]) -> (usize, bool) {
        let remaining = self.pending.len() - self.pos;
        let nw = remaining.min(out.len()).min(self.max_modulated_samples());
        out[..nw].copy_from_slice(&self.pending[self.pos..self.pos + nw]);
        self.pos += nw;
        (nw, self.pos == self.pending.len())
    }

    /// Modulate a whole packet at soft gain `g`.
    pub fn modulate(&mut self, pkt: NetPacket, g: f64) -> RadioResult<ModPacket> {
        let start = MonoClock::now();

        self.set_payload_mcs(pkt.mcsidx)?;
        self.assemble(&pkt)?;

        // Generate into a growable buffer, doubling whenever the remaining
        // space cannot hold a full generation step.
        let mut buf = vec![IQSample::new(0.0, 0.0); 16384];
        let mut n = 0;
        loop {
            if buf.len() - n < self.max_modulated_samples() {
                buf.resize(buf.len() * 2, IQSample::new(0.0, 0.0));
            }
            let (nw, last) = self.modulate_samples(&mut buf[n..]);
            n += nw;
            if last {
                break;
            }
        }
        buf.truncate(n);

        if g != 1.0 {
            for x in buf.iter_mut() {
                *x *= g;
            }
        }

        let iqbuf = Arc::new(IQBuf::from_samples(buf));
        let entry = self.phy.mcs(pkt.mcsidx)?.clone();
        if entry.autogain.needs_estimate() {
            self.phy
                .autogain_workq
                .submit((entry, g, iqbuf.clone()));
        }

        let delay = iqbuf.delay;
        let nsamples = iqbuf.len() - delay;

        Ok(ModPacket {
            pkt,
            samples: iqbuf,
            offset: delay,
            nsamples,
            complete: false,
            mod_latency: MonoClock::now() - start,
            channel: Channel::default(),
        })
    }
}

/// A stateful packet demodulator.
pub struct Demodulator {
    phy: Arc<Phy>,
    sync: FrameSync,
    t0: MonoTime,
    offset: f64,
    delay: f64,
    rate: f64,
    rx_rate: f64,
    sample_start: u64,
    channel: Channel,
}

impl Demodulator {
    /// Reset demodulation state for a new burst on `channel`.
    pub fn reset(&mut self, channel: Channel) {
        self.channel = channel;
        self.sync.reset();
    }

    /// Anchor subsequent frames to wall-clock time.
    ///
    /// `t0` is the timestamp of the sample at `offset` samples into the
    /// source buffer, `delay` is the front-end filter delay in source
    /// samples, `rate` converts demodulator samples back to source samples,
    /// and `rx_rate` is the source sample rate.
    pub fn timestamp(&mut self, t0: MonoTime, offset: f64, delay: f64, rate: f64, rx_rate: f64) {
        self.t0 = t0;
        self.offset = offset;
        self.delay = delay;
        self.rate = rate;
        self.rx_rate = rx_rate;
        self.sample_start = self.sync.sample_counter();
    }

    /// Demodulate samples, invoking `callback` with each decoded packet.
    pub fn demodulate<F: FnMut(RadioPacket)>(&mut self, samples: &[IQSample], mut callback: F) {
        let phy = self.phy.clone();
        let t0 = self.t0;
        let offset = self.offset;
        let delay = self.delay;
        let rate = self.rate;
        let rx_rate = self.rx_rate;
        let sample_start = self.sample_start;
        let channel = self.channel;

        self.sync.feed(samples, |frame| {
            let timestamp = t0
                + (offset - delay + rate * (frame.start_counter as f64 - sample_start as f64))
                    / rx_rate;

            if !frame.header_valid {
                tracing::debug!(rssi = frame.rssi, "invalid header");
                let mut pkt = RadioPacket::new(Packet::new());
                pkt.pkt.internal_flags.invalid_header = true;
                pkt.evm = frame.evm;
                pkt.rssi = frame.rssi;
                pkt.cfo = frame.cfo;
                pkt.timestamp = timestamp;
                pkt.channel = channel;
                callback(pkt);
                return;
            }

            let phdr = frame.phdr.unwrap();

            // Skip our own transmissions.
            if phdr.hdr.curhop == phy.node_id() {
                return;
            }

            let mut pkt = match frame.body {
                Some(body) => {
                    let mut pkt = RadioPacket::new(Packet::from_body(phdr.hdr, body));
                    if !pkt.integrity_intact() {
                        pkt.internal_flags.invalid_payload = true;
                    }
                    pkt
                }
                None => {
                    let mut pkt = RadioPacket::new(Packet::from_body(phdr.hdr, Vec::new()));
                    pkt.internal_flags.invalid_payload = true;
                    pkt
                }
            };

            pkt.pkt.hdr = phdr.hdr;
            pkt.evm = frame.evm;
            pkt.rssi = frame.rssi;
            pkt.cfo = frame.cfo;
            pkt.timestamp = timestamp;
            pkt.channel = channel;
            callback(pkt);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcs::default_mcs_table;
    use crate::types::Seq;

    fn mk_phy() -> Arc<Phy> {
        Arc::new(Phy::new(1, default_mcs_table(), None, 2048).unwrap())
    }

    fn mk_pkt(data: &[u8], mcsidx: usize) -> NetPacket {
        let mut pkt = NetPacket::with_data(data);
        pkt.pkt.hdr.curhop = 1;
        pkt.pkt.hdr.nexthop = 2;
        pkt.pkt.hdr.seq = Seq(5);
        pkt.mcsidx = mcsidx;
        pkt
    }

    #[test]
    fn test_evm_threshold_size_mismatch_fails() {
        let err = Phy::new(1, default_mcs_table(), Some(vec![None; 2]), 2048);
        assert!(matches!(err, Err(RadioError::Config(_))));
    }

    #[test]
    fn test_modulated_size_matches_modulator() {
        let phy = mk_phy();
        let mut modulator = Phy::mk_modulator(&phy);

        for mcsidx in 0..phy.mcs_table().len() {
            let pkt = mk_pkt(b"oracle check payload", mcsidx);
            let n = phy.modulated_size(mcsidx, pkt.size()).unwrap();
            let mpkt = modulator.modulate(pkt, 1.0).unwrap();
            assert_eq!(mpkt.nsamples, n, "mcsidx {}", mcsidx);
        }
    }

    #[test]
    fn test_modulate_demodulate_round_trip() {
        // Demodulate at a different node so the own-transmission filter
        // doesn't eat the packet.
        let tx_phy = mk_phy();
        let rx_phy = Arc::new(Phy::new(2, default_mcs_table(), None, 2048).unwrap());

        let mut modulator = Phy::mk_modulator(&tx_phy);
        let mut demod = Phy::mk_demodulator(&rx_phy);
        demod.reset(Channel::default());
        demod.timestamp(MonoTime(0.0), 0.0, 0.0, 1.0, 1.0);

        let mpkt = modulator.modulate(mk_pkt(b"over the air", 2), 0.5).unwrap();

        let mut got = Vec::new();
        demod.demodulate(mpkt.samples.samples(), |p| got.push(p));

        assert_eq!(got.len(), 1);
        let rp = &got[0];
        assert!(!rp.internal_flags.invalid_header);
        assert!(!rp.internal_flags.invalid_payload);
        assert_eq!(rp.data(), b"over the air");
        assert_eq!(rp.pkt.hdr.seq, Seq(5));
    }

    #[test]
    fn test_own_transmission_filtered() {
        let phy = mk_phy();
        let mut modulator = Phy::mk_modulator(&phy);
        let mut demod = Phy::mk_demodulator(&phy);
        demod.reset(Channel::default());
        demod.timestamp(MonoTime(0.0), 0.0, 0.0, 1.0, 1.0);

        let mpkt = modulator.modulate(mk_pkt(b"self", 0), 1.0).unwrap();
        let mut got = Vec::new();
        demod.demodulate(mpkt.samples.samples(), |p| got.push(p));
        assert!(got.is_empty());
    }

    #[test]
    fn test_timestamp_formula() {
        let tx_phy = mk_phy();
        let rx_phy = Arc::new(Phy::new(2, default_mcs_table(), None, 2048).unwrap());

        let mut modulator = Phy::mk_modulator(&tx_phy);
        let mut demod = Phy::mk_demodulator(&rx_phy);
        demod.reset(Channel::default());

        let rx_rate = 200e3;
        demod.timestamp(MonoTime(10.0), 100.0, 0.0, 1.0, rx_rate);

        // Lead the frame with 250 samples of silence.
        let mpkt = modulator.modulate(mk_pkt(b"ts", 0), 1.0).unwrap();
        let mut samples = vec![IQSample::new(0.0, 0.0); 250];
        samples.extend_from_slice(mpkt.samples.samples());

        let mut got = Vec::new();
        demod.demodulate(&samples, |p| got.push(p));

        assert_eq!(got.len(), 1);
        let expected = 10.0 + (100.0 + 250.0) / rx_rate;
        assert!(
            (got[0].timestamp.secs() - expected).abs() < 1e-9,
            "timestamp {} != expected {}",
            got[0].timestamp.secs(),
            expected
        );
    }
}
