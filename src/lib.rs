#![cfg_attr(not(feature = "std"), no_std)]

//! # LoRa Mesh Routing Library
//!
//! Firmware-level multi-hop mesh routing for low-power SX1262-class LoRa
//! radios under strict regional duty-cycle regulation. Nodes play sensor,
//! relay, and gateway roles and cooperatively deliver small periodic
//! telemetry packets from sensors to gateways while staying under a hard
//! 1 % channel-occupancy ceiling.
//!
//! Three progressively richer routing modes ship in this crate:
//!
//! 1. **Flooding** - duplicate-suppressed broadcast baseline.
//! 2. **Hop-count** - HELLO-built distance-vector table with
//!    shortest-path next-hop unicast.
//! 3. **Gateway-aware cost routing** - multi-metric cost function (hops,
//!    RSSI, SNR, ETX, gateway load), sliding-window ETX with sequence-gap
//!    loss inference, Trickle-scheduled HELLOs, hysteresis-guarded route
//!    switching, proactive neighbor-health fault detection, and gateway
//!    load balancing.
//!
//! The physical radio driver stays outside this crate: it consumes
//! [`TxRequest`]s from the transmit queue and feeds [`ReceivedPacket`]s
//! into the receive queue. Everything else - routing, link quality,
//! duty-cycle admission, scheduling - lives here, owned by a [`MeshCore`]
//! value that spawns the long-lived tasks on an embassy executor.

#[cfg(all(feature = "std", feature = "embedded"))]
compile_error!("Features `std` and `embedded` are mutually exclusive");

#[cfg(all(not(test), not(any(feature = "std", feature = "embedded"))))]
compile_error!("Either the `std` or `embedded` feature must be enabled");

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant};
use log::log;
use rand_core::RngCore;
use rand_core::SeedableRng;
use rand_wyrand::WyRand;

pub mod airtime;
pub mod cost;
pub mod duty_cycle;
pub mod flood;
pub mod link_quality;
pub mod messages;
pub mod neighbor_health;
pub mod route_maintenance;
pub mod routing_table;
pub mod trickle;

mod dispatcher;

#[cfg(feature = "radio-device-echo")]
pub mod radio_device_echo;

pub use messages::{DataPacket, PacketKind, RadioPacket};

use dispatcher::GatewayActivitySampler;
use duty_cycle::DutyCycleLedger;
use flood::FloodForwarder;
use link_quality::LinkQualityTracker;
use neighbor_health::NeighborHealthMonitor;
use routing_table::RoutingTable;

/// 16-bit node address. Derived once at boot from a hardware identifier.
pub type NodeAddress = u16;

/// Reserved broadcast address.
pub const BROADCAST_ADDRESS: NodeAddress = 0xFFFF;

/// Gateway-load marker for "unknown". Measured loads saturate at
/// [`GATEWAY_LOAD_MAX`]; 255 is strictly reserved for unknown, so a
/// saturated gateway and an unknown one are never confused.
pub const GATEWAY_LOAD_UNKNOWN: u8 = 255;

/// Largest representable measured gateway load, in packets/minute.
pub const GATEWAY_LOAD_MAX: u8 = 254;

// Hardware-dependent constant that affects node compatibility.
pub const RADIO_PACKET_SIZE: usize = 200;

// Capacity constants; these only affect how much topology a node can
// track, not wire compatibility.
pub const ROUTING_TABLE_SIZE: usize = 16;
pub const MAX_TRACKED_LINKS: usize = 10;
pub const NEIGHBOR_TABLE_SIZE: usize = 10;
pub const DUPLICATE_CACHE_SIZE: usize = 5;
pub const MAX_GATEWAYS: usize = 5;
pub(crate) const MAX_ADVERT_FRAMES: usize = 4;
pub(crate) const DUTY_LEDGER_CAPACITY: usize = 1024;

/// Telemetry payload capacity inside the application envelope.
pub const MAX_DATA_PAYLOAD: usize = 20;

// ETX bounds and seed value.
pub const ETX_WINDOW_SIZE: usize = 10;
pub(crate) const ETX_MIN: f32 = 1.0;
pub(crate) const ETX_MAX: f32 = 10.0;
pub(crate) const ETX_DEFAULT: f32 = 1.5;

pub(crate) const PRIORITY_DATA: u8 = 10;
pub(crate) const PRIORITY_ROUTING: u8 = 14;

/// Role bitmask. A node can hold several role bits at once (e.g. a relay
/// that is also a gateway).
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct Role(u8);

impl Role {
    pub const NONE: Role = Role(0);
    pub const SENSOR: Role = Role(0b0000_0001);
    pub const RELAY: Role = Role(0b0000_0010);
    pub const GATEWAY: Role = Role(0b0000_0100);

    pub const fn from_bits(bits: u8) -> Role {
        Role(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Role) -> Role {
        Role(self.0 | other.0)
    }

    /// Membership test by bitmask: all bits of `other` must be present.
    pub const fn contains(self, other: Role) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for Role {
    type Output = Role;

    fn bitor(self, rhs: Role) -> Role {
        self.union(rhs)
    }
}

/// Which routing protocol this node runs.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum RoutingMode {
    Flooding,
    HopCount,
    GatewayCost,
}

/// LoRa modem parameters, used for airtime calculation and exposed to the
/// radio driver glue.
#[derive(Clone, Copy)]
pub struct RadioParams {
    pub frequency_hz: u32,
    pub bandwidth_khz: u16,
    pub spreading_factor: u8,
    /// Coding-rate denominator: 5..8 for 4/5..4/8.
    pub coding_rate_denom: u8,
    pub preamble_symbols: u8,
    pub tx_power_dbm: i8,
    pub sync_word: u8,
    pub crc_enabled: bool,
    pub low_data_rate_optimize: bool,
}

impl RadioParams {
    pub const fn new() -> Self {
        RadioParams {
            frequency_hz: 868_100_000,
            bandwidth_khz: 125,
            spreading_factor: 7,
            coding_rate_denom: 5,
            preamble_symbols: 8,
            tx_power_dbm: 10,
            sync_word: 0x12,
            crc_enabled: true,
            low_data_rate_optimize: false,
        }
    }
}

/// Duty-cycle window and ceiling. Defaults implement the 1 % EU868/AS923
/// budget: 36 s of airtime per sliding hour, warning at 30 s (~83 %),
/// critical at 34 s (~94 %).
#[derive(Clone, Copy)]
pub struct DutyCycleConfig {
    pub window_ms: u64,
    pub max_airtime_ms: u64,
    pub warning_airtime_ms: u64,
    pub critical_airtime_ms: u64,
    pub enforce: bool,
}

impl DutyCycleConfig {
    pub const fn new() -> Self {
        DutyCycleConfig {
            window_ms: 3_600_000,
            max_airtime_ms: 36_000,
            warning_airtime_ms: 30_000,
            critical_airtime_ms: 34_000,
            enforce: true,
        }
    }
}

/// Trickle timer parameters for the cost-routing HELLO scheduler.
#[derive(Clone, Copy)]
pub struct TrickleConfig {
    pub i_min: Duration,
    pub i_max: Duration,
    /// Redundancy constant: suppress when this many consistent
    /// advertisements were heard in the interval.
    pub k: u8,
    /// Force a transmission when nothing was sent for this long.
    pub safety_interval: Duration,
}

impl TrickleConfig {
    pub const fn new() -> Self {
        TrickleConfig {
            i_min: Duration::from_secs(60),
            i_max: Duration::from_secs(600),
            k: 1,
            safety_interval: Duration::from_secs(180),
        }
    }
}

/// Cost-function weights and thresholds.
#[derive(Clone, Copy)]
pub struct CostConfig {
    pub w_hops: f32,
    pub w_rssi: f32,
    pub w_snr: f32,
    pub w_etx: f32,
    pub w_gateway_bias: f32,
    /// A candidate must undercut the incumbent by this factor to replace
    /// it in place.
    pub hysteresis_update: f32,
    /// Stricter factor applied when the replacement would increase the
    /// hop count.
    pub hysteresis_extra_hop: f32,
    pub weak_rssi_dbm: i16,
    pub weak_snr_db: i8,
    pub weak_link_penalty: f32,
    /// Minimum mean gateway load (pkt/min) before the bias term engages.
    pub min_gateway_mean_load: f32,
}

impl CostConfig {
    pub const fn new() -> Self {
        CostConfig {
            w_hops: 1.0,
            w_rssi: 0.3,
            w_snr: 0.2,
            w_etx: 0.4,
            w_gateway_bias: 1.0,
            hysteresis_update: 0.85,
            hysteresis_extra_hop: 0.80,
            weak_rssi_dbm: -125,
            weak_snr_db: -12,
            weak_link_penalty: 1.5,
            min_gateway_mean_load: 0.2,
        }
    }
}

/// Top-level node configuration.
#[derive(Clone, Copy)]
pub struct MeshConfig {
    pub own_address: NodeAddress,
    pub role: Role,
    pub mode: RoutingMode,
    pub radio: RadioParams,
    pub duty_cycle: DutyCycleConfig,
    pub trickle: TrickleConfig,
    pub cost: CostConfig,
    /// EWMA smoothing factor for RSSI/SNR/ETX updates.
    pub link_ewma_alpha: f32,
    pub route_timeout: Duration,
    /// Fixed HELLO interval for hop-count mode.
    pub hello_interval: Duration,
    pub sensor_interval: Duration,
    pub sensor_jitter: Duration,
    pub duplicate_cache_timeout: Duration,
    /// Load difference (pkt/min) before a sensor switches to the
    /// least-loaded gateway outright.
    pub load_switch_threshold: f32,
    pub initial_ttl: u8,
}

impl MeshConfig {
    pub const fn new(own_address: NodeAddress, role: Role, mode: RoutingMode) -> Self {
        MeshConfig {
            own_address,
            role,
            mode,
            radio: RadioParams::new(),
            duty_cycle: DutyCycleConfig::new(),
            trickle: TrickleConfig::new(),
            cost: CostConfig::new(),
            link_ewma_alpha: 0.3,
            route_timeout: Duration::from_secs(600),
            hello_interval: Duration::from_secs(120),
            sensor_interval: Duration::from_secs(60),
            sensor_jitter: Duration::from_secs(5),
            duplicate_cache_timeout: Duration::from_secs(30),
            load_switch_threshold: 0.25,
            initial_ttl: 5,
        }
    }
}

/// One telemetry sample handed to the mesh by the application. Sensor
/// parsers live outside this crate; the payload is opaque here.
#[derive(Clone)]
pub struct TelemetryRecord {
    pub data_type: u8,
    payload: [u8; MAX_DATA_PAYLOAD],
    payload_len: u8,
}

impl TelemetryRecord {
    /// Builds a record, truncating the payload to the envelope capacity.
    pub fn new(data_type: u8, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_DATA_PAYLOAD);
        let mut buffer = [0u8; MAX_DATA_PAYLOAD];
        buffer[..len].copy_from_slice(&payload[..len]);
        TelemetryRecord {
            data_type,
            payload: buffer,
            payload_len: len as u8,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }
}

/// Outbound frame handed to the radio driver.
pub struct TxRequest {
    pub dest: NodeAddress,
    pub priority: u8,
    pub packet: RadioPacket,
}

/// Inbound frame handed over by the radio driver, together with the
/// transmitting neighbor's address and the measured signal quality.
/// Ownership of the packet transfers to this crate on enqueue.
pub struct ReceivedPacket {
    pub src: NodeAddress,
    pub packet: RadioPacket,
    /// Measured RSSI, or `None` when the radio only exposes SNR; the link
    /// tracker then estimates RSSI from SNR.
    pub rssi_dbm: Option<i16>,
    pub snr_db: i8,
}

/// Events feeding the Trickle task from the receive and maintenance paths.
pub(crate) enum TrickleEvent {
    Consistent,
    Inconsistent,
}

const TX_QUEUE_SIZE: usize = 16;
pub(crate) type TxQueue = Channel<CriticalSectionRawMutex, TxRequest, TX_QUEUE_SIZE>;
pub type TxRequestReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, TxRequest, TX_QUEUE_SIZE>;
pub(crate) type TxRequestSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, TxRequest, TX_QUEUE_SIZE>;

const RX_QUEUE_SIZE: usize = 16;
pub(crate) type RxQueue = Channel<CriticalSectionRawMutex, ReceivedPacket, RX_QUEUE_SIZE>;
pub type RxPacketSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ReceivedPacket, RX_QUEUE_SIZE>;
pub(crate) type RxPacketReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ReceivedPacket, RX_QUEUE_SIZE>;

const TELEMETRY_QUEUE_SIZE: usize = 8;
pub(crate) type TelemetryQueue = Channel<CriticalSectionRawMutex, TelemetryRecord, TELEMETRY_QUEUE_SIZE>;
pub(crate) type TelemetrySender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, TelemetryRecord, TELEMETRY_QUEUE_SIZE>;
pub(crate) type TelemetryReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, TelemetryRecord, TELEMETRY_QUEUE_SIZE>;

const DELIVERED_QUEUE_SIZE: usize = 8;
pub(crate) type DeliveredQueue = Channel<CriticalSectionRawMutex, DataPacket, DELIVERED_QUEUE_SIZE>;
pub(crate) type DeliveredSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, DataPacket, DELIVERED_QUEUE_SIZE>;
pub(crate) type DeliveredReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, DataPacket, DELIVERED_QUEUE_SIZE>;

const TRICKLE_EVENT_QUEUE_SIZE: usize = 8;
pub(crate) type TrickleEventQueue = Channel<CriticalSectionRawMutex, TrickleEvent, TRICKLE_EVENT_QUEUE_SIZE>;
pub(crate) type TrickleEventSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, TrickleEvent, TRICKLE_EVENT_QUEUE_SIZE>;
pub(crate) type TrickleEventReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, TrickleEvent, TRICKLE_EVENT_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static TX_QUEUE: TxQueue = Channel::new();
#[cfg(feature = "embedded")]
static RX_QUEUE: RxQueue = Channel::new();
#[cfg(feature = "embedded")]
static TELEMETRY_QUEUE: TelemetryQueue = Channel::new();
#[cfg(feature = "embedded")]
static DELIVERED_QUEUE: DeliveredQueue = Channel::new();
#[cfg(feature = "embedded")]
static TRICKLE_EVENT_QUEUE: TrickleEventQueue = Channel::new();
#[cfg(feature = "embedded")]
static SHARED_STATE: SharedState = SharedState::new();

pub(crate) type GuardedRoutingTable = BlockingMutex<CriticalSectionRawMutex, RefCell<RoutingTable>>;
pub(crate) type GuardedLinks = BlockingMutex<CriticalSectionRawMutex, RefCell<LinkQualityTracker>>;
pub(crate) type GuardedDuty = BlockingMutex<CriticalSectionRawMutex, RefCell<DutyCycleLedger>>;
pub(crate) type GuardedHealth = BlockingMutex<CriticalSectionRawMutex, RefCell<NeighborHealthMonitor>>;
pub(crate) type GuardedActivity = BlockingMutex<CriticalSectionRawMutex, RefCell<GatewayActivitySampler>>;
pub(crate) type GuardedFlood = BlockingMutex<CriticalSectionRawMutex, RefCell<FloodForwarder>>;

/// All routing state, owned in one place and shared with the tasks.
///
/// The routing table has its own guard; holders release it before the
/// cost function runs (two-phase snapshot pattern). The link table is
/// written only by the receive handler. The duty-cycle ledger takes a
/// short-held guard around append and sweep.
pub struct SharedState {
    pub(crate) routing_table: GuardedRoutingTable,
    pub(crate) links: GuardedLinks,
    pub(crate) duty: GuardedDuty,
    pub(crate) health: GuardedHealth,
    pub(crate) gateway_activity: GuardedActivity,
    pub(crate) flood: GuardedFlood,
    pub(crate) counters: Counters,
}

impl SharedState {
    pub const fn new() -> Self {
        SharedState {
            routing_table: BlockingMutex::new(RefCell::new(RoutingTable::new())),
            links: BlockingMutex::new(RefCell::new(LinkQualityTracker::new())),
            duty: BlockingMutex::new(RefCell::new(DutyCycleLedger::new())),
            health: BlockingMutex::new(RefCell::new(NeighborHealthMonitor::new())),
            gateway_activity: BlockingMutex::new(RefCell::new(GatewayActivitySampler::new())),
            flood: BlockingMutex::new(RefCell::new(FloodForwarder::new())),
            counters: Counters::new(),
        }
    }
}

/// Operational counters; operators reason about faults from these plus
/// the structured logs.
pub struct Counters {
    tx_data: AtomicU32,
    rx_data: AtomicU32,
    forwarded: AtomicU32,
    delivered: AtomicU32,
    duplicates: AtomicU32,
    drops_duty_cycle: AtomicU32,
    drops_no_route: AtomicU32,
    drops_queue_full: AtomicU32,
    adverts_sent: AtomicU32,
    adverts_received: AtomicU32,
    malformed_frames: AtomicU32,
    route_table_full: AtomicU32,
}

/// Point-in-time copy of [`Counters`].
#[derive(Clone, Copy, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct CountersSnapshot {
    pub tx_data: u32,
    pub rx_data: u32,
    pub forwarded: u32,
    pub delivered: u32,
    pub duplicates: u32,
    pub drops_duty_cycle: u32,
    pub drops_no_route: u32,
    pub drops_queue_full: u32,
    pub adverts_sent: u32,
    pub adverts_received: u32,
    pub malformed_frames: u32,
    pub route_table_full: u32,
}

impl Counters {
    pub const fn new() -> Self {
        Counters {
            tx_data: AtomicU32::new(0),
            rx_data: AtomicU32::new(0),
            forwarded: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
            duplicates: AtomicU32::new(0),
            drops_duty_cycle: AtomicU32::new(0),
            drops_no_route: AtomicU32::new(0),
            drops_queue_full: AtomicU32::new(0),
            adverts_sent: AtomicU32::new(0),
            adverts_received: AtomicU32::new(0),
            malformed_frames: AtomicU32::new(0),
            route_table_full: AtomicU32::new(0),
        }
    }

    pub(crate) fn increment_tx_data(&self) {
        self.tx_data.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_rx_data(&self) {
        self.rx_data.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_duplicates(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_drops_duty_cycle(&self) {
        self.drops_duty_cycle.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_drops_no_route(&self) {
        self.drops_no_route.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_drops_queue_full(&self) {
        self.drops_queue_full.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_adverts_sent(&self) {
        self.adverts_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_adverts_received(&self) {
        self.adverts_received.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_malformed_frames(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn increment_route_table_full(&self) {
        self.route_table_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            tx_data: self.tx_data.load(Ordering::Relaxed),
            rx_data: self.rx_data.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            drops_duty_cycle: self.drops_duty_cycle.load(Ordering::Relaxed),
            drops_no_route: self.drops_no_route.load(Ordering::Relaxed),
            drops_queue_full: self.drops_queue_full.load(Ordering::Relaxed),
            adverts_sent: self.adverts_sent.load(Ordering::Relaxed),
            adverts_received: self.adverts_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            route_table_full: self.route_table_full.load(Ordering::Relaxed),
        }
    }
}

pub enum SendTelemetryError {
    QueueFull,
    NotInited,
}

pub enum ReceiveError {
    NotInited,
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum InitializeError {
    SpawnFailed,
}

/// Queue endpoints handed to the radio driver glue: the driver drains
/// `tx` and feeds `rx`.
pub struct RadioQueueHandles {
    pub tx: TxRequestReceiver,
    pub rx: RxPacketSender,
}

enum MeshCoreState {
    Uninitialized,
    Initialized {
        telemetry_sender: TelemetrySender,
        delivered_receiver: DeliveredReceiver,
        counters: &'static Counters,
    },
}

/// Owns the routing stack: spawns the long-lived tasks and exposes the
/// application-facing telemetry API.
pub struct MeshCore {
    state: MeshCoreState,
}

impl MeshCore {
    pub const fn new() -> Self {
        MeshCore {
            state: MeshCoreState::Uninitialized,
        }
    }

    #[cfg(feature = "embedded")]
    pub fn initialize(&mut self, config: MeshConfig, spawner: Spawner, rng_seed: u64) -> Result<RadioQueueHandles, InitializeError> {
        self.initialize_common(
            config,
            spawner,
            &SHARED_STATE,
            &TX_QUEUE,
            &RX_QUEUE,
            &TELEMETRY_QUEUE,
            &DELIVERED_QUEUE,
            &TRICKLE_EVENT_QUEUE,
            rng_seed,
        )
    }

    #[cfg(feature = "std")]
    pub fn initialize(&mut self, config: MeshConfig, spawner: Spawner, rng_seed: u64) -> Result<RadioQueueHandles, InitializeError> {
        let shared: &'static SharedState = Box::leak(Box::new(SharedState::new()));
        let tx_queue: &'static TxQueue = Box::leak(Box::new(Channel::new()));
        let rx_queue: &'static RxQueue = Box::leak(Box::new(Channel::new()));
        let telemetry_queue: &'static TelemetryQueue = Box::leak(Box::new(Channel::new()));
        let delivered_queue: &'static DeliveredQueue = Box::leak(Box::new(Channel::new()));
        let trickle_event_queue: &'static TrickleEventQueue = Box::leak(Box::new(Channel::new()));

        self.initialize_common(
            config,
            spawner,
            shared,
            tx_queue,
            rx_queue,
            telemetry_queue,
            delivered_queue,
            trickle_event_queue,
            rng_seed,
        )
    }

    #[cfg(any(feature = "std", feature = "embedded"))]
    #[allow(clippy::too_many_arguments)]
    fn initialize_common(
        &mut self,
        config: MeshConfig,
        spawner: Spawner,
        shared: &'static SharedState,
        tx_queue: &'static TxQueue,
        rx_queue: &'static RxQueue,
        telemetry_queue: &'static TelemetryQueue,
        delivered_queue: &'static DeliveredQueue,
        trickle_event_queue: &'static TrickleEventQueue,
        rng_seed: u64,
    ) -> Result<RadioQueueHandles, InitializeError> {
        let mut rng = WyRand::seed_from_u64(rng_seed);
        let now = Instant::now();

        shared.duty.lock(|d| d.borrow_mut().configure(config.duty_cycle, config.radio, now));
        shared.links.lock(|l| l.borrow_mut().configure(config.link_ewma_alpha));
        shared.routing_table.lock(|t| t.borrow_mut().configure(config.route_timeout));
        shared.flood.lock(|f| f.borrow_mut().configure(config.duplicate_cache_timeout));

        spawner
            .spawn(dispatcher::receive_handler_task(
                shared,
                config,
                rx_queue.receiver(),
                tx_queue.sender(),
                delivered_queue.sender(),
                trickle_event_queue.sender(),
            ))
            .map_err(|_| InitializeError::SpawnFailed)?;
        log!(log::Level::Debug, "[{:04X}] Receive handler task spawned", config.own_address);

        spawner
            .spawn(dispatcher::maintenance_task(shared, config, trickle_event_queue.sender()))
            .map_err(|_| InitializeError::SpawnFailed)?;
        log!(log::Level::Debug, "[{:04X}] Maintenance task spawned", config.own_address);

        if config.role.contains(Role::SENSOR) {
            spawner
                .spawn(dispatcher::sensor_task(
                    shared,
                    config,
                    telemetry_queue.receiver(),
                    tx_queue.sender(),
                    rng.next_u64(),
                ))
                .map_err(|_| InitializeError::SpawnFailed)?;
            log!(log::Level::Debug, "[{:04X}] Sensor transmit task spawned", config.own_address);
        }

        if config.mode != RoutingMode::Flooding {
            spawner
                .spawn(dispatcher::hello_task(
                    shared,
                    config,
                    tx_queue.sender(),
                    trickle_event_queue.receiver(),
                    rng.next_u64(),
                ))
                .map_err(|_| InitializeError::SpawnFailed)?;
            log!(log::Level::Debug, "[{:04X}] HELLO task spawned", config.own_address);
        }

        log!(
            log::Level::Info,
            "[{:04X}] Mesh core initialized: role {}, mode {}",
            config.own_address,
            config.role.bits(),
            match config.mode {
                RoutingMode::Flooding => "flooding",
                RoutingMode::HopCount => "hop-count",
                RoutingMode::GatewayCost => "gateway-cost",
            }
        );

        self.state = MeshCoreState::Initialized {
            telemetry_sender: telemetry_queue.sender(),
            delivered_receiver: delivered_queue.receiver(),
            counters: &shared.counters,
        };

        Ok(RadioQueueHandles {
            tx: tx_queue.receiver(),
            rx: rx_queue.sender(),
        })
    }

    /// Hands a telemetry sample to the sensor transmit cycle.
    pub fn send_telemetry(&self, record: TelemetryRecord) -> Result<(), SendTelemetryError> {
        let sender = match &self.state {
            MeshCoreState::Uninitialized => return Err(SendTelemetryError::NotInited),
            MeshCoreState::Initialized { telemetry_sender, .. } => telemetry_sender,
        };
        sender.try_send(record).map_err(|_| SendTelemetryError::QueueFull)
    }

    /// Awaits the next application packet delivered to this node.
    pub async fn receive_delivered(&self) -> Result<DataPacket, ReceiveError> {
        let receiver = match &self.state {
            MeshCoreState::Uninitialized => return Err(ReceiveError::NotInited),
            MeshCoreState::Initialized { delivered_receiver, .. } => delivered_receiver,
        };
        Ok(receiver.receive().await)
    }

    pub fn counters(&self) -> Option<CountersSnapshot> {
        match &self.state {
            MeshCoreState::Uninitialized => None,
            MeshCoreState::Initialized { counters, .. } => Some(counters.snapshot()),
        }
    }
}
