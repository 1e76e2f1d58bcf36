//! On-air framing and frame synchronization
//!
//! Frame layout, one sample per symbol at the channel rate:
//!
//! ```text
//! [ preamble: 63-chip PN, BPSK | PHY header: 10 bytes, BPSK/Rep3 | payload: body per MCS ]
//! ```
//!
//! The PHY header carries the wire MAC header, the payload MCS index, the
//! payload length, and a CRC-16. The payload is the packet body (extended
//! header, data, control) with the MCS's check trailer, passed through the
//! MCS's FEC chain and constellation.
//!
//! [`FrameSync`] is the receive-side engine: it consumes an arbitrary stream
//! of samples, detects the preamble by normalized correlation, estimates
//! channel phase/gain, CFO, and RSSI from the preamble, then decodes the
//! header and payload, reporting per-frame statistics and absolute sample
//! counters for timestamping. After a declined frame, the carry-over counter
//! resumes from the frame end.

use num_complex::Complex64;

use crate::coding::{self, bits_to_bytes, bytes_to_bits};
use crate::header::{Header, HEADER_LEN};
use crate::mcs::{FecType, Mcs, ModulationType};
use crate::phy::modem::Modem;
use crate::types::IQSample;

/// Preamble length in symbols.
pub const PREAMBLE_LEN: usize = 63;

/// PHY header length in bytes: wire header, MCS index, payload length, CRC-16.
pub const PHY_HEADER_LEN: usize = HEADER_LEN + 1 + 2 + 2;

/// PHY header symbols on the air (BPSK, Rep3).
pub const HEADER_SYMS: usize = coding::fec_encoded_len(FecType::Rep3, PHY_HEADER_LEN) * 8;

const fn preamble_taps() -> [bool; PREAMBLE_LEN] {
    // 63-chip m-sequence from the 6-stage LFSR x^6 + x^5 + 1.
    let mut taps = [false; PREAMBLE_LEN];
    let mut state: u8 = 0x3f;
    let mut i = 0;
    while i < PREAMBLE_LEN {
        taps[i] = state & 1 != 0;
        let fb = (state ^ (state >> 1)) & 1;
        state = (state >> 1) | (fb << 5);
        i += 1;
    }
    taps
}

/// The preamble as BPSK symbols.
pub fn preamble() -> [IQSample; PREAMBLE_LEN] {
    let taps = preamble_taps();
    let mut syms = [Complex64::new(0.0, 0.0); PREAMBLE_LEN];
    for (i, &bit) in taps.iter().enumerate() {
        syms[i] = if bit {
            Complex64::new(-1.0, 0.0)
        } else {
            Complex64::new(1.0, 0.0)
        };
    }
    syms
}

/// The decoded PHY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhyHeader {
    /// The wire MAC header.
    pub hdr: Header,
    /// Payload MCS index.
    pub mcsidx: u8,
    /// Payload length in bytes (body + check trailer, before FEC).
    pub payload_len: u16,
}

impl PhyHeader {
    fn to_bytes(self) -> [u8; PHY_HEADER_LEN] {
        let mut bytes = [0u8; PHY_HEADER_LEN];
        bytes[..HEADER_LEN].copy_from_slice(&self.hdr.to_bytes());
        bytes[HEADER_LEN] = self.mcsidx;
        bytes[HEADER_LEN + 1..HEADER_LEN + 3].copy_from_slice(&self.payload_len.to_le_bytes());
        let crc = coding::Crc16::compute(&bytes[..PHY_HEADER_LEN - 2]);
        bytes[PHY_HEADER_LEN - 2..].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; PHY_HEADER_LEN]) -> Option<PhyHeader> {
        let crc = u16::from_le_bytes([bytes[PHY_HEADER_LEN - 2], bytes[PHY_HEADER_LEN - 1]]);
        if coding::Crc16::compute(&bytes[..PHY_HEADER_LEN - 2]) != crc {
            return None;
        }
        Some(PhyHeader {
            hdr: Header::from_bytes(&bytes[..HEADER_LEN]).ok()?,
            mcsidx: bytes[HEADER_LEN],
            payload_len: u16::from_le_bytes([bytes[HEADER_LEN + 1], bytes[HEADER_LEN + 2]]),
        })
    }
}

/// Payload symbols for an encoded body of `payload_len` bytes at `mcs`.
///
/// `payload_len` counts the body plus check trailer, before FEC.
pub fn payload_syms(mcs: &Mcs, payload_len: usize) -> usize {
    let enc = coding::fec_encoded_len(mcs.fec1, coding::fec_encoded_len(mcs.fec0, payload_len));
    let bps = mcs.modulation.bits_per_symbol();
    (8 * enc + bps - 1) / bps
}

/// Total frame symbols for a packet body of `body_len` bytes at `mcs`.
pub fn frame_syms(mcs: &Mcs, body_len: usize) -> usize {
    PREAMBLE_LEN + HEADER_SYMS + payload_syms(mcs, body_len + mcs.check.len())
}

/// Assemble a complete frame into symbols.
pub fn assemble(phdr: &PhyHeader, mcs: &Mcs, body: &[u8], out: &mut Vec<IQSample>) {
    out.extend_from_slice(&preamble());

    // Header: BPSK over Rep3-coded bytes.
    let hdr_modem = Modem::new(ModulationType::Bpsk);
    let hdr_enc = coding::fec_encode(FecType::Rep3, &phdr.to_bytes());
    hdr_modem.modulate_bits(&bytes_to_bits(&hdr_enc), out);

    // Payload: check trailer, FEC chain, constellation.
    let mut payload = body.to_vec();
    coding::check_append(mcs.check, &mut payload);
    let enc = coding::fec_encode(mcs.fec1, &coding::fec_encode(mcs.fec0, &payload));
    let modem = Modem::new(mcs.modulation);
    modem.modulate_bits(&bytes_to_bits(&enc), out);
}

/// Per-frame statistics reported by the synchronizer.
#[derive(Debug, Clone)]
pub struct SyncedFrame {
    /// Absolute sample index of the frame start (first preamble sample).
    pub start_counter: u64,
    /// Absolute sample index one past the frame end.
    pub end_counter: u64,
    /// Decoded PHY header, if the header check passed.
    pub phdr: Option<PhyHeader>,
    /// Decoded payload body (check trailer stripped), if valid.
    pub body: Option<Vec<u8>>,
    /// True if the header check passed.
    pub header_valid: bool,
    /// True if the payload check passed.
    pub payload_valid: bool,
    /// Error vector magnitude over payload symbols [dB].
    pub evm: f64,
    /// Received signal strength over the preamble [dB].
    pub rssi: f64,
    /// Carrier frequency offset estimate (f/Fs).
    pub cfo: f64,
}

#[derive(Clone, Copy)]
enum SyncState {
    Search,
    /// Preamble found at buffer offset `.0`; channel estimate `.1`, CFO
    /// radians/sample `.2`.
    Frame(usize, Complex64, f64),
}

/// Streaming frame synchronizer.
pub struct FrameSync {
    mcs_table: Vec<Mcs>,
    max_payload_len: usize,
    threshold: f64,
    buf: Vec<IQSample>,
    /// Absolute sample index of `buf[0]`.
    buf_base: u64,
    /// Total samples consumed.
    sample_counter: u64,
    state: SyncState,
    preamble: [IQSample; PREAMBLE_LEN],
    preamble_energy: f64,
}

impl FrameSync {
    pub fn new(mcs_table: Vec<Mcs>, max_payload_len: usize) -> FrameSync {
        let preamble = preamble();
        FrameSync {
            mcs_table,
            max_payload_len,
            threshold: 0.6,
            buf: Vec::new(),
            buf_base: 0,
            sample_counter: 0,
            state: SyncState::Search,
            preamble,
            preamble_energy: PREAMBLE_LEN as f64,
        }
    }

    /// Total samples consumed so far.
    pub fn sample_counter(&self) -> u64 {
        self.sample_counter
    }

    /// Reset synchronizer state, keeping the absolute sample counter.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf_base = self.sample_counter;
        self.state = SyncState::Search;
    }

    /// Feed samples, invoking `callback` for each synchronized frame.
    pub fn feed<F: FnMut(SyncedFrame)>(&mut self, samples: &[IQSample], mut callback: F) {
        self.buf.extend_from_slice(samples);
        self.sample_counter += samples.len() as u64;

        loop {
            match self.state {
                SyncState::Search => {
                    if !self.search() {
                        break;
                    }
                }
                SyncState::Frame(off, h, cfo) => {
                    if !self.decode_frame(off, h, cfo, &mut callback) {
                        break;
                    }
                }
            }
        }
    }

    /// Scan for the preamble. Returns true if found (state advances).
    fn search(&mut self) -> bool {
        if self.buf.len() < PREAMBLE_LEN {
            return false;
        }

        for off in 0..=self.buf.len() - PREAMBLE_LEN {
            let window = &self.buf[off..off + PREAMBLE_LEN];

            let mut dot = Complex64::new(0.0, 0.0);
            let mut energy = 0.0;
            for (x, p) in window.iter().zip(self.preamble.iter()) {
                dot += x * p.conj();
                energy += x.norm_sqr();
            }

            if energy < 1e-12 {
                continue;
            }

            let corr = dot.norm() / (energy.sqrt() * self.preamble_energy.sqrt());
            if corr >= self.threshold {
                let (h, cfo) = self.estimate_channel(off);
                self.state = SyncState::Frame(off, h, cfo);
                return true;
            }
        }

        // Keep a preamble's worth of tail for the next feed.
        let keep = PREAMBLE_LEN - 1;
        if self.buf.len() > keep {
            let drop = self.buf.len() - keep;
            self.buf.drain(..drop);
            self.buf_base += drop as u64;
        }
        false
    }

    /// Estimate channel gain/phase and CFO over the preamble at `off`.
    fn estimate_channel(&self, off: usize) -> (Complex64, f64) {
        let window = &self.buf[off..off + PREAMBLE_LEN];

        // CFO: average phase advance of the modulation-stripped preamble.
        let mut acc = Complex64::new(0.0, 0.0);
        for k in 1..PREAMBLE_LEN {
            let a = window[k - 1] * self.preamble[k - 1].conj();
            let b = window[k] * self.preamble[k].conj();
            acc += b * a.conj();
        }
        let cfo = acc.arg();

        // Channel estimate after CFO removal.
        let mut h = Complex64::new(0.0, 0.0);
        for (k, (x, p)) in window.iter().zip(self.preamble.iter()).enumerate() {
            let derot = x * Complex64::from_polar(1.0, -cfo * k as f64);
            h += derot * p.conj();
        }
        h /= PREAMBLE_LEN as f64;

        (h, cfo)
    }

    /// Equalized symbols at `[off, off+n)` relative to the frame start.
    fn equalize(&self, frame_off: usize, off: usize, n: usize, h: Complex64, cfo: f64) -> Vec<IQSample> {
        let mut out = Vec::with_capacity(n);
        for k in 0..n {
            let idx = off + k;
            let rel = (idx - frame_off) as f64;
            let derot = self.buf[idx] * Complex64::from_polar(1.0, -cfo * rel);
            out.push(derot / h);
        }
        out
    }

    /// Try to decode the frame whose preamble starts at `off`. Returns false
    /// if more samples are needed.
    fn decode_frame<F: FnMut(SyncedFrame)>(
        &mut self,
        off: usize,
        h: Complex64,
        cfo: f64,
        callback: &mut F,
    ) -> bool {
        let hdr_end = off + PREAMBLE_LEN + HEADER_SYMS;
        if self.buf.len() < hdr_end {
            return false;
        }

        let rssi = {
            let p: f64 = self.buf[off..off + PREAMBLE_LEN]
                .iter()
                .map(|x| x.norm_sqr())
                .sum::<f64>()
                / PREAMBLE_LEN as f64;
            10.0 * p.max(1e-20).log10()
        };
        let cfo_norm = cfo / (2.0 * std::f64::consts::PI);

        // Decode the header.
        let hdr_modem = Modem::new(ModulationType::Bpsk);
        let hdr_samples = self.equalize(off, off + PREAMBLE_LEN, HEADER_SYMS, h, cfo);
        let mut hdr_bits = Vec::with_capacity(HEADER_SYMS);
        hdr_modem.demodulate(&hdr_samples, &mut hdr_bits);
        let hdr_enc = bits_to_bytes(&hdr_bits);
        let hdr_bytes = coding::fec_decode(FecType::Rep3, &hdr_enc, PHY_HEADER_LEN);

        let phdr = hdr_bytes
            .as_slice()
            .try_into()
            .ok()
            .and_then(|b: &[u8; PHY_HEADER_LEN]| PhyHeader::from_bytes(b))
            .filter(|p| {
                (p.mcsidx as usize) < self.mcs_table.len()
                    && (p.payload_len as usize) <= self.max_payload_len
            });

        let phdr = match phdr {
            Some(p) => p,
            None => {
                // Declined frame: resume the search from the frame end.
                callback(SyncedFrame {
                    start_counter: self.buf_base + off as u64,
                    end_counter: self.buf_base + hdr_end as u64,
                    phdr: None,
                    body: None,
                    header_valid: false,
                    payload_valid: false,
                    evm: 0.0,
                    rssi,
                    cfo: cfo_norm,
                });
                self.consume(hdr_end);
                return true;
            }
        };

        // Decode the payload.
        let mcs = self.mcs_table[phdr.mcsidx as usize];
        let nsyms = payload_syms(&mcs, phdr.payload_len as usize);
        let frame_end = hdr_end + nsyms;
        if self.buf.len() < frame_end {
            // Remember the lock while we wait for the tail.
            self.state = SyncState::Frame(off, h, cfo);
            return false;
        }

        let payload_samples = self.equalize(off, hdr_end, nsyms, h, cfo);
        let modem = Modem::new(mcs.modulation);
        let mut bits = Vec::with_capacity(nsyms * modem.bits_per_symbol());
        let mse = modem.demodulate(&payload_samples, &mut bits);
        let evm = 10.0 * mse.max(1e-12).log10();

        let enc = bits_to_bytes(&bits);
        let fec0_len = coding::fec_encoded_len(mcs.fec0, phdr.payload_len as usize);
        let inner = coding::fec_decode(mcs.fec1, &enc, fec0_len);
        let payload = coding::fec_decode(mcs.fec0, &inner, phdr.payload_len as usize);

        let body = coding::check_strip(mcs.check, &payload).map(|b| b.to_vec());
        let payload_valid = body.is_some();

        callback(SyncedFrame {
            start_counter: self.buf_base + off as u64,
            end_counter: self.buf_base + frame_end as u64,
            phdr: Some(phdr),
            body,
            header_valid: true,
            payload_valid,
            evm,
            rssi,
            cfo: cfo_norm,
        });

        self.consume(frame_end);
        true
    }

    fn consume(&mut self, end: usize) {
        self.buf.drain(..end);
        self.buf_base += end as u64;
        self.state = SyncState::Search;
    }
}
