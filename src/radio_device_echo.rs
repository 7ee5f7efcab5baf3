//! Loopback radio device for testing the stack without hardware.
//!
//! Every frame handed to the transmit queue is echoed straight back into
//! the receive queue with perfect signal quality, as if a neighbor had
//! transmitted it. Single-node smoke testing only.

use crate::{NodeAddress, ReceivedPacket, RxPacketSender, TxRequestReceiver};
use log::log;

pub struct RadioDevice {
    echo_source: NodeAddress,
}

impl RadioDevice {
    /// `echo_source` is the address stamped on echoed frames as the
    /// transmitting neighbor.
    pub const fn new(echo_source: NodeAddress) -> Self {
        RadioDevice { echo_source }
    }
}

#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 10))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub async fn radio_device_task(radio_device: RadioDevice, tx_receiver: TxRequestReceiver, rx_sender: RxPacketSender) -> ! {
    loop {
        let request = tx_receiver.receive().await;
        let echoed = ReceivedPacket {
            src: radio_device.echo_source,
            packet: request.packet,
            rssi_dbm: Some(-30),
            snr_db: 10,
        };
        if rx_sender.try_send(echoed).is_err() {
            log!(log::Level::Warn, "Echo device: RX queue full, dropping frame");
        }
    }
}
