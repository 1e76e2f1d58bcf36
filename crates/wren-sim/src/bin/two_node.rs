//! Run two TDMA nodes against each other on the simulated medium and print
//! what arrives.

use std::sync::Arc;
use std::time::Duration;

use wren_core::config::RadioConfig;
use wren_core::types::Channel;
use wren_sim::{RadioNode, SimMedium};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut rc = RadioConfig::new();
    rc.mtu = 64;
    rc.arq.mcu = 16;
    rc.arq.max_sendwin = 8;
    rc.arq.recvwin = 8;
    rc.mac.slot_size = 0.1;
    rc.mac.guard_size = 0.01;
    rc.mac.slot_send_lead_time = 0.01;
    rc.mac.slot_modulate_lead_time = 0.06;
    rc.phy.channels = vec![Channel::default()];

    let medium = Arc::new(SimMedium::new(100e3));
    let n1 = RadioNode::new(1, medium.clone(), &rc, vec![true, false]).expect("node 1");
    let n2 = RadioNode::new(2, medium.clone(), &rc, vec![false, true]).expect("node 2");

    for i in 0..5u32 {
        n1.send(2, format!("packet {i}").as_bytes());
    }

    let mut delivered = 0;
    while delivered < 5 {
        match n2.recv_timeout(Duration::from_secs(10)) {
            Some(pkt) => {
                delivered += 1;
                println!(
                    "node 2 <- {:?} (evm {:.1} dB, rssi {:.1} dB)",
                    String::from_utf8_lossy(pkt.data()),
                    pkt.evm,
                    pkt.rssi
                );
            }
            None => {
                eprintln!("timed out waiting for delivery");
                break;
            }
        }
    }

    n1.stop();
    n2.stop();
}
