//! Full-stack node harness
//!
//! Assembles the complete radio pipeline for one node over a simulated
//! device: packet filter, net queue, smart controller, slot synthesizer,
//! channelizer, and a slotted MAC (TDMA or slotted ALOHA). Delivered
//! packets surface on a channel so tests can wait on them.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use wren_core::config::RadioConfig;
use wren_core::controller::{Controller, PacketSink};
use wren_core::device::RadioDevice;
use wren_core::mac::aloha::SlottedAloha;
use wren_core::mac::schedule::Schedule;
use wren_core::mac::slotted::SlottedMac;
use wren_core::mac::tdma::Tdma;
use wren_core::mac::Mac;
use wren_core::netfilter::NetFilter;
use wren_core::netqueue::NetQueue;
use wren_core::packet::{NetPacket, RadioPacket};
use wren_core::phy::channelizer::Channelizer;
use wren_core::phy::synthesizer::SlotSynthesizer;
use wren_core::phy::Phy;
use wren_core::radionet::RadioNet;
use wren_core::types::{NodeId, RadioResult};
use wren_core::SmartController;

use crate::device::SimRadioDevice;
use crate::medium::SimMedium;

struct ChannelSink(Sender<RadioPacket>);

impl PacketSink for ChannelSink {
    fn deliver(&self, pkt: RadioPacket) {
        let _ = self.0.send(pkt);
    }
}

/// Which MAC a node runs.
pub enum MacKind {
    /// TDMA over the given slot-ownership bitmap.
    Tdma { schedule: Vec<bool> },
    /// Slotted ALOHA transmitting with probability `p`.
    Aloha { p: f64 },
}

/// One complete radio node over the simulated medium.
pub struct RadioNode {
    pub id: NodeId,
    pub net: Arc<RadioNet>,
    pub netq: Arc<NetQueue>,
    pub controller: SmartController,
    mac: Box<dyn Mac>,
    filter: NetFilter,
    synthesizer: Arc<SlotSynthesizer>,
    channelizer: Arc<Channelizer>,
    delivered: Receiver<RadioPacket>,
}

impl RadioNode {
    /// Bring up a TDMA node owning the slots marked true in `schedule`.
    pub fn new(
        id: NodeId,
        medium: Arc<SimMedium>,
        rc: &RadioConfig,
        schedule: Vec<bool>,
    ) -> RadioResult<RadioNode> {
        Self::with_mac(id, medium, rc, MacKind::Tdma { schedule })
    }

    /// Bring up a node with an explicit MAC choice.
    pub fn with_mac(
        id: NodeId,
        medium: Arc<SimMedium>,
        rc: &RadioConfig,
        mac_kind: MacKind,
    ) -> RadioResult<RadioNode> {
        let device = Arc::new(SimRadioDevice::new(medium.clone()));
        device.set_tx_rate(medium.rate())?;
        device.set_rx_rate(medium.rate())?;

        let net = Arc::new(RadioNet::new(id));
        let netq = Arc::new(NetQueue::new(rc.queue_order));
        let phy = Arc::new(Phy::new(
            id,
            rc.phy.mcs_table.clone(),
            rc.phy.evm_thresholds.clone(),
            rc.mtu + rc.arq.mcu + 64,
        )?);

        let (tx, delivered) = unbounded();
        let sink: Arc<dyn PacketSink> = Arc::new(ChannelSink(tx));

        let controller =
            SmartController::new(net.clone(), phy.clone(), netq.clone(), sink, rc, None)?;
        controller.start();
        let ctrl: Arc<dyn Controller> = Arc::new(controller.clone());

        let channel = rc.phy.channels.first().copied().unwrap_or_default();
        let synthesizer = Arc::new(SlotSynthesizer::new(
            phy.clone(),
            ctrl.clone(),
            medium.rate(),
            channel,
            rc.phy.resampler.clone(),
            rc.mac.num_synthesizer_threads,
        ));
        let channelizer = Arc::new(Channelizer::new(
            phy.clone(),
            ctrl.clone(),
            medium.rate(),
            rc.phy.channels.clone(),
            0.0,
            0.0,
            rc.phy.resampler.clone(),
            rc.mac.num_channelizer_threads,
        ));

        let core = SlottedMac::new(
            device,
            ctrl,
            channelizer.clone(),
            synthesizer.clone(),
            rc.phy.channels.clone(),
            rc.mac.clone(),
            None,
        );

        let mac: Box<dyn Mac> = match mac_kind {
            MacKind::Tdma { schedule } => {
                let tdma = Tdma::new(core, schedule.len());
                tdma.set_schedule(Schedule::from_slots(schedule));
                Box::new(tdma)
            }
            MacKind::Aloha { p } => {
                let aloha = SlottedAloha::new(core, p);
                aloha.reconfigure();
                Box::new(aloha)
            }
        };

        let filter = NetFilter::new(net.clone(), rc.net.clone());

        Ok(RadioNode {
            id,
            net,
            netq,
            controller,
            mac,
            filter,
            synthesizer,
            channelizer,
            delivered,
        })
    }

    /// Queue application data for `dest`.
    pub fn send(&self, dest: NodeId, data: &[u8]) {
        let mut pkt = NetPacket::with_data(data);
        pkt.pkt.hdr.curhop = self.id;
        pkt.pkt.hdr.nexthop = dest;
        let mut ehdr = pkt.pkt.ehdr();
        ehdr.src = self.id;
        ehdr.dest = dest;
        pkt.pkt.set_ehdr(ehdr);
        self.netq.push(pkt);
    }

    /// Feed a raw ethernet frame through the packet filter, as the tap
    /// bridge would. Returns false if the filter dropped it.
    pub fn send_frame(&self, frame: &[u8]) -> bool {
        match self.filter.process(frame) {
            Some(pkt) => {
                self.netq.push(pkt);
                true
            }
            None => false,
        }
    }

    /// The MAC, for reconfiguration and load queries.
    pub fn mac(&self) -> &dyn Mac {
        self.mac.as_ref()
    }

    /// Wait for the next delivered packet.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<RadioPacket> {
        self.delivered.recv_timeout(timeout).ok()
    }

    /// Tear the node down, joining threads in dependency-reverse order:
    /// the MAC first, then the DSP pools, then the controller's timers.
    pub fn stop(&self) {
        self.mac.stop();
        self.netq.stop();
        self.synthesizer.stop();
        self.channelizer.stop();
        self.controller.stop();
    }
}
