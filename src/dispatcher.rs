//! # Packet Dispatcher
//!
//! Role-aware transmit/receive/forward orchestration and the long-lived
//! tasks driving the mesh:
//!
//! - **Receive handler** (priority of the radio path): blocks on the
//!   receive queue, drains it in one pass, classifies each frame as a
//!   routing advertisement or an application packet, and routes it to
//!   route maintenance, local delivery, or forwarding.
//! - **Sensor transmit**: periodic telemetry cycle
//!   (Idle -> Sampling -> Composing -> Admitting -> Transmitting), with
//!   duty-cycle admission gating every transmission.
//! - **HELLO**: fixed-interval advertisements in hop-count mode; a 1 Hz
//!   Trickle poll with suppression, reset events, and the safety override
//!   in cost mode.
//! - **Maintenance**: 30 s sweeps of route expiry, neighbor health, the
//!   duty-cycle window, and periodic diagnostics.
//!
//! Every transmission passes the duty-cycle ledger first; a denied
//! admission drops the packet and increments a counter. Radio send
//! failures are best-effort: logged, never retried.

use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant, Timer};
use log::log;
use rand_core::RngCore;
use rand_core::SeedableRng;
use rand_wyrand::WyRand;

use crate::cost::{CostModel, RouteCandidate};
use crate::flood::FloodDecision;
use crate::messages::route_advert::RouteAdvert;
use crate::messages::{DataPacket, PacketKind, RadioPacket};
use crate::route_maintenance;
use crate::trickle::{TrickleAction, TrickleTimer};
use crate::{
    DeliveredSender, MeshConfig, NodeAddress, ReceivedPacket, Role, RoutingMode, RxPacketReceiver, SharedState,
    TelemetryReceiver, TrickleEvent, TrickleEventReceiver, TrickleEventSender, TxRequest, TxRequestSender,
    BROADCAST_ADDRESS, GATEWAY_LOAD_MAX, GATEWAY_LOAD_UNKNOWN, MAX_ADVERT_FRAMES, MAX_GATEWAYS,
    NEIGHBOR_TABLE_SIZE, PRIORITY_DATA, PRIORITY_ROUTING, ROUTING_TABLE_SIZE,
};

/// Samples this gateway's own received-data rate for the load hint
/// advertised in HELLO packets. The rate is packets/minute over the last
/// completed window, saturated to [`GATEWAY_LOAD_MAX`].
pub(crate) struct GatewayActivitySampler {
    window_start: Instant,
    count: u32,
    rate_per_minute: f32,
}

impl GatewayActivitySampler {
    pub const fn new() -> Self {
        GatewayActivitySampler {
            window_start: Instant::from_ticks(0),
            count: 0,
            rate_per_minute: 0.0,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.roll(now);
        self.count += 1;
    }

    pub fn sample(&mut self, now: Instant) -> u8 {
        self.roll(now);
        let encoded = self.rate_per_minute + 0.5;
        if encoded >= GATEWAY_LOAD_MAX as f32 {
            GATEWAY_LOAD_MAX
        } else {
            encoded as u8
        }
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Duration::from_secs(60) {
            self.rate_per_minute = self.count as f32 * 60_000.0 / elapsed.as_millis() as f32;
            self.count = 0;
            self.window_start = now;
        }
    }
}

/// Classifies and processes one frame from the radio driver.
pub(crate) fn handle_received(
    shared: &SharedState,
    config: &MeshConfig,
    received: ReceivedPacket,
    tx_sender: &TxRequestSender,
    delivered_sender: &DeliveredSender,
    trickle_sender: &TrickleEventSender,
    now: Instant,
) {
    let ReceivedPacket {
        src: transmitter,
        packet,
        rssi_dbm,
        snr_db,
    } = received;

    match packet.kind() {
        None => {
            shared.counters.increment_malformed_frames();
            log!(
                log::Level::Warn,
                "[{:04X}] Dropping frame with unknown kind from {:04X}",
                config.own_address,
                transmitter
            );
        }
        Some(PacketKind::RouteAdvertisement) => {
            let advert = match RouteAdvert::parse(packet.payload()) {
                Ok(advert) => advert,
                Err(_) => {
                    shared.counters.increment_malformed_frames();
                    log!(log::Level::Warn, "[{:04X}] Invalid route packet size", config.own_address);
                    return;
                }
            };
            shared.counters.increment_adverts_received();
            shared.health.lock(|h| h.borrow_mut().on_heard(advert.src, now));

            let outcome = route_maintenance::process_advert(
                &shared.routing_table,
                &shared.links,
                &config.cost,
                config.mode,
                config.own_address,
                &advert,
                rssi_dbm,
                snr_db,
                &shared.counters,
                now,
            );
            if config.mode == RoutingMode::GatewayCost {
                let event = if outcome.inconsistent {
                    TrickleEvent::Inconsistent
                } else {
                    TrickleEvent::Consistent
                };
                let _ = trickle_sender.try_send(event);
            }
        }
        Some(PacketKind::Data) => {
            shared.counters.increment_rx_data();
            let data = match DataPacket::parse(packet.payload()) {
                Ok(data) => data,
                Err(_) => {
                    shared.counters.increment_malformed_frames();
                    log!(log::Level::Warn, "[{:04X}] Malformed data packet", config.own_address);
                    return;
                }
            };

            if config.mode == RoutingMode::GatewayCost {
                // Sequence-gap inference only applies to traffic the
                // transmitter originated itself; forwarded packets carry
                // the originator's sequence.
                let sequence = if data.src == transmitter { Some(data.sequence) } else { None };
                shared.links.lock(|l| {
                    l.borrow_mut().observe_data(
                        transmitter,
                        rssi_dbm.unwrap_or(-120 + 3 * snr_db as i16),
                        snr_db,
                        sequence,
                        now,
                    )
                });
            }
            if config.mode != RoutingMode::Flooding {
                shared.routing_table.lock(|t| t.borrow_mut().mark_heard(transmitter, now));
            }

            match config.mode {
                RoutingMode::Flooding => handle_flood(shared, config, data, tx_sender, delivered_sender, now),
                RoutingMode::HopCount | RoutingMode::GatewayCost => {
                    handle_unicast(shared, config, data, tx_sender, delivered_sender, now)
                }
            }
        }
    }
}

fn handle_flood(
    shared: &SharedState,
    config: &MeshConfig,
    data: DataPacket,
    tx_sender: &TxRequestSender,
    delivered_sender: &DeliveredSender,
    now: Instant,
) {
    let decision = shared
        .flood
        .lock(|f| f.borrow_mut().handle(data.src, data.sequence, data.ttl, config.role, now));

    match decision {
        FloodDecision::Duplicate => {
            shared.counters.increment_duplicates();
            log!(
                log::Level::Debug,
                "[{:04X}] Duplicate packet seq {} from {:04X}",
                config.own_address,
                data.sequence,
                data.src
            );
        }
        FloodDecision::Deliver => deliver_local(shared, config, data, delivered_sender, now),
        FloodDecision::Rebroadcast => {
            let mut forwarded = data;
            forwarded.ttl -= 1;
            transmit_data(shared, config, BROADCAST_ADDRESS, &forwarded, tx_sender, true, now);
        }
        FloodDecision::Discard => {}
    }
}

fn handle_unicast(
    shared: &SharedState,
    config: &MeshConfig,
    data: DataPacket,
    tx_sender: &TxRequestSender,
    delivered_sender: &DeliveredSender,
    now: Instant,
) {
    if data.dest == config.own_address || data.dest == BROADCAST_ADDRESS {
        deliver_local(shared, config, data, delivered_sender, now);
        return;
    }

    if data.ttl == 0 {
        log!(
            log::Level::Debug,
            "[{:04X}] TTL exhausted for packet to {:04X}",
            config.own_address,
            data.dest
        );
        return;
    }

    let next_hop = shared.routing_table.lock(|t| t.borrow().next_hop(data.dest));
    let Some(next_hop) = next_hop else {
        shared.counters.increment_drops_no_route();
        log!(
            log::Level::Warn,
            "[{:04X}] No route to {:04X}, dropping packet",
            config.own_address,
            data.dest
        );
        return;
    };

    let mut forwarded = data;
    forwarded.ttl -= 1;
    transmit_data(shared, config, next_hop, &forwarded, tx_sender, true, now);
}

fn deliver_local(shared: &SharedState, config: &MeshConfig, data: DataPacket, delivered_sender: &DeliveredSender, now: Instant) {
    shared.counters.increment_delivered();
    if config.role.contains(Role::GATEWAY) {
        shared.gateway_activity.lock(|g| g.borrow_mut().record(now));
    }
    log!(
        log::Level::Info,
        "[{:04X}] Delivered packet seq {} from {:04X}",
        config.own_address,
        data.sequence,
        data.src
    );
    if delivered_sender.try_send(data).is_err() {
        log!(
            log::Level::Warn,
            "[{:04X}] Delivered queue full, dropping packet",
            config.own_address
        );
    }
}

/// Admission-then-transmit for one data frame. `forwarding` selects the
/// forwarded counter over the originated one.
fn transmit_data(
    shared: &SharedState,
    config: &MeshConfig,
    dest: NodeAddress,
    data: &DataPacket,
    tx_sender: &TxRequestSender,
    forwarding: bool,
    now: Instant,
) -> bool {
    let packet = data.to_packet();
    let length = packet.length;

    let admitted = shared.duty.lock(|d| d.borrow_mut().may_transmit(length, now));
    if !admitted {
        shared.counters.increment_drops_duty_cycle();
        return false;
    }

    let request = TxRequest {
        dest,
        priority: PRIORITY_DATA,
        packet,
    };
    match tx_sender.try_send(request) {
        Ok(()) => {
            shared.duty.lock(|d| d.borrow_mut().record(length, now));
            if forwarding {
                shared.counters.increment_forwarded();
            } else {
                shared.counters.increment_tx_data();
            }
            true
        }
        Err(_) => {
            shared.counters.increment_drops_queue_full();
            log!(log::Level::Warn, "[{:04X}] TX queue full, dropping packet", config.own_address);
            false
        }
    }
}

/// Picks the telemetry destination for this node's routing mode.
pub(crate) fn select_destination(shared: &SharedState, config: &MeshConfig) -> Option<NodeAddress> {
    match config.mode {
        RoutingMode::Flooding => Some(BROADCAST_ADDRESS),
        RoutingMode::HopCount => shared
            .routing_table
            .lock(|t| t.borrow().best_for_role_by_hops(Role::GATEWAY))
            .map(|entry| entry.dest),
        RoutingMode::GatewayCost => select_gateway_cost(shared, config),
    }
}

/// Gateway selection under cost routing: a load-bias pass first (pick the
/// clearly least-loaded gateway), falling back to the cost function.
fn select_gateway_cost(shared: &SharedState, config: &MeshConfig) -> Option<NodeAddress> {
    let mut loads = [(0u16, 0u8); MAX_GATEWAYS];
    let load_count = shared.routing_table.lock(|t| t.borrow().gateway_load_snapshot(&mut loads));

    if load_count >= 2 {
        let mut min = loads[0];
        let mut second_load = f32::MAX;
        for &(address, load) in &loads[1..load_count] {
            if load < min.1 {
                second_load = min.1 as f32;
                min = (address, load);
            } else if (load as f32) < second_load {
                second_load = load as f32;
            }
        }
        if min.1 as f32 + config.load_switch_threshold <= second_load {
            log!(
                log::Level::Debug,
                "[{:04X}] Load-bias selection: gateway {:04X} at {} pkt/min",
                config.own_address,
                min.0,
                min.1
            );
            return Some(min.0);
        }
    }

    // Two-phase cost selection: copy candidates under the guard, evaluate
    // the cost function over the copies with the guard released.
    let mut candidates = [RouteCandidate {
        dest: 0,
        via: 0,
        metric: 0,
        role: Role::NONE,
        gateway_load: GATEWAY_LOAD_UNKNOWN,
    }; ROUTING_TABLE_SIZE];
    let count = shared
        .routing_table
        .lock(|t| t.borrow().candidates_for_role(Role::GATEWAY, &mut candidates));
    if count == 0 {
        return None;
    }

    let model = CostModel::new(&config.cost, &loads[..load_count]);
    let mut best: Option<(NodeAddress, f32)> = None;
    for candidate in &candidates[..count] {
        let link = shared.links.lock(|l| l.borrow().snapshot(candidate.via));
        let cost = model.route_cost(candidate.metric, &link, candidate.dest, candidate.role);
        match best {
            Some((_, best_cost)) if cost >= best_cost => {}
            _ => best = Some((candidate.dest, cost)),
        }
    }
    best.map(|(address, _)| address)
}

/// Broadcasts the routing table as advertisement frames. Returns true
/// when at least one frame was handed to the radio.
pub(crate) fn emit_adverts(shared: &SharedState, config: &MeshConfig, tx_sender: &TxRequestSender, now: Instant) -> bool {
    let own_load = if config.role.contains(Role::GATEWAY) {
        shared.gateway_activity.lock(|g| g.borrow_mut().sample(now))
    } else {
        GATEWAY_LOAD_UNKNOWN
    };

    let mut frames = [const { RadioPacket::empty() }; MAX_ADVERT_FRAMES];
    let count = route_maintenance::build_table_adverts(
        &shared.routing_table,
        config.own_address,
        config.role,
        own_load,
        &mut frames,
    );

    let mut sent_any = false;
    for frame in frames.into_iter().take(count) {
        let length = frame.length;
        let admitted = shared.duty.lock(|d| d.borrow_mut().may_transmit(length, now));
        if !admitted {
            shared.counters.increment_drops_duty_cycle();
            continue;
        }
        let request = TxRequest {
            dest: BROADCAST_ADDRESS,
            priority: PRIORITY_ROUTING,
            packet: frame,
        };
        match tx_sender.try_send(request) {
            Ok(()) => {
                shared.duty.lock(|d| d.borrow_mut().record(length, now));
                shared.counters.increment_adverts_sent();
                sent_any = true;
            }
            Err(_) => {
                shared.counters.increment_drops_queue_full();
                log!(
                    log::Level::Warn,
                    "[{:04X}] TX queue full, dropping advertisement",
                    config.own_address
                );
            }
        }
    }
    sent_any
}

/// Receive handler: blocks on the radio driver's packet notification and
/// drains the whole receive queue in one pass.
#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 10))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn receive_handler_task(
    shared: &'static SharedState,
    config: MeshConfig,
    rx_receiver: RxPacketReceiver,
    tx_sender: TxRequestSender,
    delivered_sender: DeliveredSender,
    trickle_sender: TrickleEventSender,
) -> ! {
    log!(log::Level::Info, "[{:04X}] Receive handler started", config.own_address);
    loop {
        let received = rx_receiver.receive().await;
        handle_received(shared, &config, received, &tx_sender, &delivered_sender, &trickle_sender, Instant::now());
        while let Ok(more) = rx_receiver.try_receive() {
            handle_received(shared, &config, more, &tx_sender, &delivered_sender, &trickle_sender, Instant::now());
        }
    }
}

/// Sensor transmit cycle: sample, compose, admit, transmit, sleep.
#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 10))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn sensor_task(
    shared: &'static SharedState,
    config: MeshConfig,
    telemetry_receiver: TelemetryReceiver,
    tx_sender: TxRequestSender,
    rng_seed: u64,
) -> ! {
    let mut rng = WyRand::seed_from_u64(rng_seed);
    let mut sequence: u32 = 0;
    let interval_ms = config.sensor_interval.as_millis();
    let jitter_ms = config.sensor_jitter.as_millis();
    log!(log::Level::Info, "[{:04X}] Sensor transmit task started", config.own_address);

    loop {
        let offset = rng.next_u64() % (2 * jitter_ms + 1);
        Timer::after(Duration::from_millis(interval_ms - jitter_ms + offset)).await;

        // Sampling: take the most recent telemetry record.
        let mut sample = telemetry_receiver.try_receive().ok();
        while let Ok(next) = telemetry_receiver.try_receive() {
            sample = Some(next);
        }
        let Some(record) = sample else {
            log!(log::Level::Debug, "[{:04X}] No telemetry sample this cycle", config.own_address);
            continue;
        };

        // Composing.
        let Some(dest) = select_destination(shared, &config) else {
            log!(
                log::Level::Info,
                "[{:04X}] No gateway in routing table yet, skipping transmission",
                config.own_address
            );
            continue;
        };
        let now = Instant::now();
        let data = DataPacket::new(
            dest,
            config.own_address,
            sequence,
            config.initial_ttl,
            record.data_type,
            now.as_millis() as u32,
            record.payload(),
        );
        sequence = sequence.wrapping_add(1);

        // Admitting and transmitting; a denial drops this cycle's packet.
        if transmit_data(shared, &config, dest, &data, &tx_sender, false, now) {
            if config.mode == RoutingMode::Flooding {
                // Flooded copies of this packet will echo back; make sure
                // the duplicate cache recognizes them.
                shared
                    .flood
                    .lock(|f| f.borrow_mut().note_sent(config.own_address, data.sequence, now));
            }
            log!(
                log::Level::Info,
                "[{:04X}] TX seq {} to {:04X}",
                config.own_address,
                data.sequence,
                dest
            );
        }
    }
}

/// Routing advertisement scheduler. Hop-count mode sends at a fixed
/// interval; cost mode runs the Trickle timer at a 1 Hz poll.
#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 10))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn hello_task(
    shared: &'static SharedState,
    config: MeshConfig,
    tx_sender: TxRequestSender,
    trickle_receiver: TrickleEventReceiver,
    rng_seed: u64,
) -> ! {
    let mut rng = WyRand::seed_from_u64(rng_seed);
    log!(log::Level::Info, "[{:04X}] HELLO task started", config.own_address);

    match config.mode {
        RoutingMode::HopCount => loop {
            Timer::after(config.hello_interval).await;
            emit_adverts(shared, &config, &tx_sender, Instant::now());
        },
        RoutingMode::GatewayCost => {
            let mut timer = TrickleTimer::new(config.trickle);
            timer.start(Instant::now(), &mut rng);
            loop {
                match select(Timer::after(Duration::from_secs(1)), trickle_receiver.receive()).await {
                    Either::First(_) => {
                        let now = Instant::now();
                        match timer.poll(now, &mut rng) {
                            TrickleAction::Transmit | TrickleAction::SafetyTransmit => {
                                if emit_adverts(shared, &config, &tx_sender, now) {
                                    timer.record_transmission(now);
                                }
                            }
                            TrickleAction::None => {}
                        }
                    }
                    Either::Second(event) => match event {
                        TrickleEvent::Consistent => timer.heard_consistent(),
                        TrickleEvent::Inconsistent => timer.reset(Instant::now(), &mut rng),
                    },
                }
            }
        }
        // Flooding runs no advertisement scheduler; this task is not
        // spawned in that mode.
        RoutingMode::Flooding => loop {
            Timer::after(Duration::from_secs(3600)).await;
        },
    }
}

/// Periodic sweeps: route expiry, neighbor health, duty-cycle window,
/// diagnostics.
#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 10))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn maintenance_task(shared: &'static SharedState, config: MeshConfig, trickle_sender: TrickleEventSender) -> ! {
    log!(log::Level::Info, "[{:04X}] Maintenance task started", config.own_address);
    loop {
        Timer::after(Duration::from_secs(30)).await;
        let now = Instant::now();

        shared.routing_table.lock(|t| t.borrow_mut().sweep(now));

        let mut failed = [0u16; NEIGHBOR_TABLE_SIZE];
        let failed_count = shared.health.lock(|h| h.borrow_mut().check(now, &mut failed));
        for &neighbor in &failed[..failed_count] {
            let removed = shared.routing_table.lock(|t| t.borrow_mut().remove(neighbor));
            if removed {
                log!(
                    log::Level::Warn,
                    "[{:04X}] Fault: evicted route to failed neighbor {:04X}",
                    config.own_address,
                    neighbor
                );
            }
            if config.mode == RoutingMode::GatewayCost {
                let _ = trickle_sender.try_send(TrickleEvent::Inconsistent);
            }
        }

        shared.duty.lock(|d| d.borrow_mut().maintain(now));

        let (table_len, utilization) = (
            shared.routing_table.lock(|t| t.borrow().len()),
            shared.duty.lock(|d| d.borrow().utilization_percent()),
        );
        let counters = shared.counters.snapshot();
        log!(
            log::Level::Info,
            "[{:04X}] Stats: routes {}, duty {:.3}%, tx {}, rx {}, fwd {}, dup {}, duty-drops {}",
            config.own_address,
            table_len,
            utilization,
            counters.tx_data,
            counters.rx_data,
            counters.forwarded,
            counters.duplicates,
            counters.drops_duty_cycle
        );
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::messages::route_advert::{build_advert_frames, NetworkNodeRecord};
    use crate::{DeliveredQueue, TrickleEventQueue, TxQueue};

    const SELF: NodeAddress = 0x0001;
    const NEIGHBOR: NodeAddress = 0x0002;
    const GATEWAY: NodeAddress = 0x0005;

    struct Harness {
        shared: &'static SharedState,
        config: MeshConfig,
        tx_queue: &'static TxQueue,
        delivered_queue: &'static DeliveredQueue,
        trickle_queue: &'static TrickleEventQueue,
    }

    impl Harness {
        fn new(role: Role, mode: RoutingMode) -> Self {
            let shared: &'static SharedState = Box::leak(Box::new(SharedState::new()));
            let config = MeshConfig::new(SELF, role, mode);
            shared.duty.lock(|d| d.borrow_mut().configure(config.duty_cycle, config.radio, now()));
            Harness {
                shared,
                config,
                tx_queue: Box::leak(Box::new(embassy_sync::channel::Channel::new())),
                delivered_queue: Box::leak(Box::new(embassy_sync::channel::Channel::new())),
                trickle_queue: Box::leak(Box::new(embassy_sync::channel::Channel::new())),
            }
        }

        fn receive(&self, src: NodeAddress, packet: RadioPacket, at: Instant) {
            handle_received(
                self.shared,
                &self.config,
                ReceivedPacket {
                    src,
                    packet,
                    rssi_dbm: Some(-90),
                    snr_db: 5,
                },
                &self.tx_queue.sender(),
                &self.delivered_queue.sender(),
                &self.trickle_queue.sender(),
                at,
            );
        }

        fn receive_advert(&self, src: NodeAddress, role: Role, records: &[NetworkNodeRecord], at: Instant) {
            let mut frames = [const { RadioPacket::empty() }; MAX_ADVERT_FRAMES];
            let count = build_advert_frames(src, role, GATEWAY_LOAD_UNKNOWN, records, crate::RADIO_PACKET_SIZE, &mut frames);
            assert_eq!(count, 1);
            self.receive(src, frames[0].clone(), at);
        }
    }

    fn now() -> Instant {
        Instant::from_ticks(0)
    }

    fn data_packet(dest: NodeAddress, src: NodeAddress, sequence: u32, ttl: u8) -> RadioPacket {
        DataPacket::new(dest, src, sequence, ttl, 1, 0, &[1, 2, 3]).to_packet()
    }

    #[test]
    fn test_flood_relay_rebroadcasts_once() {
        let harness = Harness::new(Role::RELAY, RoutingMode::Flooding);

        harness.receive(0x0011, data_packet(BROADCAST_ADDRESS, 0x0011, 0, 5), now());

        let request = harness.tx_queue.receiver().try_receive().unwrap();
        assert_eq!(request.dest, BROADCAST_ADDRESS);
        let forwarded = DataPacket::parse(request.packet.payload()).unwrap();
        assert_eq!(forwarded.ttl, 4);
        assert_eq!(forwarded.src, 0x0011);

        let counters = harness.shared.counters.snapshot();
        assert_eq!(counters.rx_data, 1);
        assert_eq!(counters.forwarded, 1);

        // The same packet heard again (its own rebroadcast echoed back) is
        // suppressed by the duplicate cache.
        harness.receive(NEIGHBOR, data_packet(BROADCAST_ADDRESS, 0x0011, 0, 4), now() + Duration::from_secs(1));
        assert!(harness.tx_queue.receiver().try_receive().is_err());
        let counters = harness.shared.counters.snapshot();
        assert_eq!(counters.rx_data, 2);
        assert_eq!(counters.duplicates, 1);
        assert_eq!(counters.forwarded, 1);
    }

    #[test]
    fn test_flood_gateway_delivers_and_terminates() {
        let harness = Harness::new(Role::GATEWAY, RoutingMode::Flooding);

        harness.receive(0x0011, data_packet(BROADCAST_ADDRESS, 0x0011, 7, 5), now());

        assert!(harness.tx_queue.receiver().try_receive().is_err());
        let delivered = harness.delivered_queue.receiver().try_receive().unwrap();
        assert_eq!(delivered.sequence, 7);
        let counters = harness.shared.counters.snapshot();
        assert_eq!(counters.delivered, 1);
        assert_eq!(counters.forwarded, 0);
    }

    #[test]
    fn test_flood_sensor_consumes_without_rebroadcast() {
        let harness = Harness::new(Role::SENSOR, RoutingMode::Flooding);
        harness.receive(NEIGHBOR, data_packet(BROADCAST_ADDRESS, NEIGHBOR, 0, 5), now());
        assert!(harness.tx_queue.receiver().try_receive().is_err());
        assert!(harness.delivered_queue.receiver().try_receive().is_err());
    }

    #[test]
    fn test_unicast_forward_via_routing_table() {
        let harness = Harness::new(Role::RELAY, RoutingMode::HopCount);

        // Learn: GATEWAY is two hops away via NEIGHBOR.
        let records = [NetworkNodeRecord {
            address: GATEWAY,
            metric: 1,
            role: Role::GATEWAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        harness.receive_advert(NEIGHBOR, Role::RELAY, &records, now());

        // A packet for the gateway is forwarded to the next hop.
        harness.receive(0x0011, data_packet(GATEWAY, 0x0011, 3, 5), now());
        let request = harness.tx_queue.receiver().try_receive().unwrap();
        assert_eq!(request.dest, NEIGHBOR);
        let forwarded = DataPacket::parse(request.packet.payload()).unwrap();
        assert_eq!(forwarded.dest, GATEWAY);
        assert_eq!(forwarded.ttl, 4);
        assert_eq!(harness.shared.counters.snapshot().forwarded, 1);
    }

    #[test]
    fn test_unicast_no_route_drops() {
        let harness = Harness::new(Role::RELAY, RoutingMode::HopCount);
        harness.receive(0x0011, data_packet(GATEWAY, 0x0011, 3, 5), now());
        assert!(harness.tx_queue.receiver().try_receive().is_err());
        assert_eq!(harness.shared.counters.snapshot().drops_no_route, 1);
    }

    #[test]
    fn test_unicast_delivery_to_self() {
        let harness = Harness::new(Role::GATEWAY, RoutingMode::GatewayCost);
        harness.receive(NEIGHBOR, data_packet(SELF, NEIGHBOR, 9, 5), now());
        let delivered = harness.delivered_queue.receiver().try_receive().unwrap();
        assert_eq!(delivered.sequence, 9);
        assert_eq!(harness.shared.counters.snapshot().delivered, 1);
    }

    #[test]
    fn test_malformed_advert_is_counted_and_dropped() {
        let harness = Harness::new(Role::RELAY, RoutingMode::HopCount);
        let mut packet = RadioPacket::empty();
        packet.data[0] = PacketKind::RouteAdvertisement as u8;
        packet.data[3] = 9; // claims 9 bytes: 3 bytes of records, not a multiple of 5
        packet.length = 9;
        harness.receive(NEIGHBOR, packet, now());

        assert_eq!(harness.shared.counters.snapshot().malformed_frames, 1);
        assert!(harness.shared.routing_table.lock(|t| t.borrow().is_empty()));
    }

    #[test]
    fn test_advert_feeds_trickle_classification() {
        let harness = Harness::new(Role::RELAY, RoutingMode::GatewayCost);

        harness.receive_advert(NEIGHBOR, Role::RELAY, &[], now());
        assert!(matches!(
            harness.trickle_queue.receiver().try_receive(),
            Ok(TrickleEvent::Inconsistent)
        ));

        // The same advertisement again changes nothing: consistent.
        harness.receive_advert(NEIGHBOR, Role::RELAY, &[], now() + Duration::from_secs(1));
        assert!(matches!(
            harness.trickle_queue.receiver().try_receive(),
            Ok(TrickleEvent::Consistent)
        ));
    }

    #[test]
    fn test_duty_cycle_denial_drops_rebroadcast() {
        let harness = Harness::new(Role::RELAY, RoutingMode::Flooding);
        // Exhaust the budget.
        harness.shared.duty.lock(|d| d.borrow_mut().record_airtime(36_000, now()));

        harness.receive(0x0011, data_packet(BROADCAST_ADDRESS, 0x0011, 0, 5), now());
        assert!(harness.tx_queue.receiver().try_receive().is_err());
        assert_eq!(harness.shared.counters.snapshot().drops_duty_cycle, 1);
    }

    #[test]
    fn test_hop_count_convergence_two_gateways() {
        // Two gateways, both two hops away via the same relay: the sensor
        // sees both with metric 2 and ties break to the lower address.
        let harness = Harness::new(Role::SENSOR, RoutingMode::HopCount);
        let records = [
            NetworkNodeRecord {
                address: 0x0006,
                metric: 1,
                role: Role::GATEWAY.bits(),
                gateway_load: GATEWAY_LOAD_UNKNOWN,
            },
            NetworkNodeRecord {
                address: 0x0005,
                metric: 1,
                role: Role::GATEWAY.bits(),
                gateway_load: GATEWAY_LOAD_UNKNOWN,
            },
        ];
        harness.receive_advert(NEIGHBOR, Role::RELAY, &records, now());

        harness.shared.routing_table.lock(|t| {
            let t = t.borrow();
            assert_eq!(t.find(0x0005).unwrap().metric, 2);
            assert_eq!(t.find(0x0006).unwrap().metric, 2);
        });
        assert_eq!(select_destination(harness.shared, &harness.config), Some(0x0005));
    }

    #[test]
    fn test_gateway_selection_prefers_clearly_less_loaded() {
        let harness = Harness::new(Role::SENSOR, RoutingMode::GatewayCost);
        let records = [
            NetworkNodeRecord {
                address: 0x0005,
                metric: 1,
                role: Role::GATEWAY.bits(),
                gateway_load: 10,
            },
            NetworkNodeRecord {
                address: 0x0006,
                metric: 1,
                role: Role::GATEWAY.bits(),
                gateway_load: 2,
            },
        ];
        harness.receive_advert(NEIGHBOR, Role::RELAY, &records, now());

        assert_eq!(select_destination(harness.shared, &harness.config), Some(0x0006));
    }

    #[test]
    fn test_gateway_selection_falls_back_to_cost_on_even_load() {
        let harness = Harness::new(Role::SENSOR, RoutingMode::GatewayCost);
        let records = [
            NetworkNodeRecord {
                address: 0x0006,
                metric: 3,
                role: Role::GATEWAY.bits(),
                gateway_load: 5,
            },
            NetworkNodeRecord {
                address: 0x0005,
                metric: 1,
                role: Role::GATEWAY.bits(),
                gateway_load: 5,
            },
        ];
        harness.receive_advert(NEIGHBOR, Role::RELAY, &records, now());

        // Loads are even, so the cheaper (fewer hops over the same link)
        // gateway wins under the cost function.
        assert_eq!(select_destination(harness.shared, &harness.config), Some(0x0005));
    }

    #[test]
    fn test_gateway_activity_sampler_rates() {
        let mut sampler = GatewayActivitySampler::new();
        let start = Instant::from_ticks(0);

        // 30 packets in the first minute.
        for i in 0..30u64 {
            sampler.record(start + Duration::from_secs(i * 2));
        }
        let load = sampler.sample(start + Duration::from_secs(61));
        assert_eq!(load, 30);

        // Quiet next minute: rate decays to zero.
        let load = sampler.sample(start + Duration::from_secs(125));
        assert_eq!(load, 0);
    }
}
