//! Routing-advertisement ingestion and outbound advertisement assembly.
//!
//! On reception, the advertising neighbor itself is treated as a one-hop
//! entry, then every carried record is re-costed with one more hop and
//! installed, replaced, or refreshed against the table. Route switching is
//! hysteresis-guarded: a candidate must undercut the incumbent's cost by
//! 15 % to displace it in place, and by 20 % when it would increase the
//! hop count. Hop-count mode falls back to plain shortest-path comparison.
//!
//! Cost evaluation never runs while the routing-table guard is held: each
//! comparison snapshots the current entry, the gateway loads, and the link
//! metrics first, computes costs over the copies, and re-acquires the
//! guard only to apply the decision.

use embassy_time::Instant;
use log::log;

use crate::cost::CostModel;
use crate::messages::route_advert::{build_advert_frames, NetworkNodeRecord, RouteAdvert};
use crate::messages::RadioPacket;
use crate::routing_table::RouteEntry;
use crate::{
    CostConfig, Counters, GuardedLinks, GuardedRoutingTable, NodeAddress, Role, RoutingMode,
    GATEWAY_LOAD_UNKNOWN, MAX_ADVERT_FRAMES, MAX_GATEWAYS, RADIO_PACKET_SIZE, ROUTING_TABLE_SIZE,
};

/// What an advertisement did to the table, for Trickle classification.
pub(crate) struct AdvertOutcome {
    /// True when the table size changed or any destination's next hop
    /// changed; such an advertisement is inconsistent in Trickle terms.
    pub inconsistent: bool,
}

/// Processes one received routing advertisement.
pub(crate) fn process_advert(
    routing_table: &GuardedRoutingTable,
    links: &GuardedLinks,
    cost_config: &CostConfig,
    mode: RoutingMode,
    own_address: NodeAddress,
    advert: &RouteAdvert,
    rssi_dbm: Option<i16>,
    snr_db: i8,
    counters: &Counters,
    now: Instant,
) -> AdvertOutcome {
    links.lock(|l| l.borrow_mut().observe_advert(advert.src, rssi_dbm, snr_db, now));

    let mut inconsistent = false;

    // The sender itself is a direct neighbor: metric 1, advertised role.
    let sender_record = NetworkNodeRecord {
        address: advert.src,
        metric: 1,
        role: advert.node_role.bits(),
        gateway_load: advert.gateway_load,
    };
    inconsistent |= apply_candidate(
        routing_table,
        links,
        cost_config,
        mode,
        own_address,
        advert.src,
        &sender_record,
        counters,
        now,
    );

    routing_table.lock(|t| {
        if let Some(entry) = t.borrow_mut().find_mut(advert.src) {
            entry.received_snr = snr_db;
        }
    });

    for node in advert.nodes() {
        // One more hop from our perspective than from the advertiser's.
        let mut candidate = *node;
        candidate.metric = candidate.metric.saturating_add(1);
        inconsistent |= apply_candidate(
            routing_table,
            links,
            cost_config,
            mode,
            own_address,
            advert.src,
            &candidate,
            counters,
            now,
        );
    }

    AdvertOutcome { inconsistent }
}

/// Applies one candidate route. Returns true when the table size or a next
/// hop changed.
fn apply_candidate(
    routing_table: &GuardedRoutingTable,
    links: &GuardedLinks,
    cost_config: &CostConfig,
    mode: RoutingMode,
    own_address: NodeAddress,
    via: NodeAddress,
    candidate: &NetworkNodeRecord,
    counters: &Counters,
    now: Instant,
) -> bool {
    if candidate.address == own_address {
        return false;
    }
    let candidate_role = Role::from_bits(candidate.role);

    // Copy phase: current entry and hop ceiling under the guard.
    let (current, max_metric, table_full) = routing_table.lock(|t| {
        let t = t.borrow();
        (t.find(candidate.address).copied(), t.max_metric(), t.is_full())
    });

    let Some(current) = current else {
        // New destination.
        if table_full {
            counters.increment_route_table_full();
            log!(
                log::Level::Warn,
                "Routing table full, dropping advertisement for {:04X}",
                candidate.address
            );
            return false;
        }
        if mode != RoutingMode::GatewayCost && candidate.metric > max_metric.saturating_add(1) {
            log!(
                log::Level::Warn,
                "Dropping route to {:04X}: metric {} above table maximum",
                candidate.address,
                candidate.metric
            );
            return false;
        }
        let entry = RouteEntry {
            dest: candidate.address,
            via,
            metric: candidate.metric,
            role: candidate_role,
            gateway_load: candidate.gateway_load,
            received_snr: 0,
            expires_at: now,
        };
        let installed = routing_table.lock(|t| t.borrow_mut().insert(entry, now).is_ok());
        return installed;
    };

    let mut via_changed = false;

    match mode {
        RoutingMode::GatewayCost => {
            // Evaluate phase: costs over snapshots, outside the guard.
            let mut loads = [(0u16, 0u8); MAX_GATEWAYS];
            let load_count = routing_table.lock(|t| t.borrow().gateway_load_snapshot(&mut loads));
            let candidate_link = links.lock(|l| l.borrow().snapshot(via));
            let current_link = links.lock(|l| l.borrow().snapshot(current.via));

            let model = CostModel::new(cost_config, &loads[..load_count]);
            let candidate_cost = model.route_cost(candidate.metric, &candidate_link, candidate.address, candidate_role);
            let current_cost = model.route_cost(current.metric, &current_link, current.dest, current.role);

            let threshold = if candidate.metric > current.metric {
                cost_config.hysteresis_extra_hop
            } else {
                cost_config.hysteresis_update
            };

            if candidate_cost < current_cost * threshold {
                via_changed = via != current.via;
                routing_table.lock(|t| {
                    let mut t = t.borrow_mut();
                    if let Some(entry) = t.find_mut(candidate.address) {
                        entry.metric = candidate.metric;
                        entry.via = via;
                    }
                    t.refresh(candidate.address, now);
                });
                log!(
                    log::Level::Info,
                    "Better route for {:04X} via {:04X}: cost {} < {} (metric {} -> {})",
                    candidate.address,
                    via,
                    candidate_cost,
                    current_cost,
                    current.metric,
                    candidate.metric
                );
            } else if candidate_cost < current_cost {
                log!(
                    log::Level::Debug,
                    "Route for {:04X} via {:04X} is better (cost {} vs {}) but below the hysteresis threshold",
                    candidate.address,
                    via,
                    candidate_cost,
                    current_cost
                );
            } else if candidate.metric == current.metric && via == current.via {
                routing_table.lock(|t| t.borrow_mut().refresh(candidate.address, now));
            }
        }
        RoutingMode::HopCount | RoutingMode::Flooding => {
            if candidate.metric < current.metric {
                via_changed = via != current.via;
                routing_table.lock(|t| {
                    let mut t = t.borrow_mut();
                    if let Some(entry) = t.find_mut(candidate.address) {
                        entry.metric = candidate.metric;
                        entry.via = via;
                    }
                    t.refresh(candidate.address, now);
                });
                log!(
                    log::Level::Info,
                    "Found better route for {:04X} via {:04X} metric {}",
                    candidate.address,
                    via,
                    candidate.metric
                );
            } else if candidate.metric == current.metric && via == current.via {
                routing_table.lock(|t| t.borrow_mut().refresh(candidate.address, now));
            }
        }
    }

    // Side metadata updates apply regardless of the routing decision.
    routing_table.lock(|t| {
        let mut t = t.borrow_mut();
        let next_hop = t.next_hop(candidate.address);
        if let Some(entry) = t.find_mut(candidate.address) {
            if candidate.gateway_load != GATEWAY_LOAD_UNKNOWN && candidate.gateway_load != entry.gateway_load {
                entry.gateway_load = candidate.gateway_load;
            }
            if next_hop == Some(via) && candidate_role != entry.role {
                log!(
                    log::Level::Info,
                    "Updating role of {:04X} to {}",
                    candidate.address,
                    candidate.role
                );
                entry.role = candidate_role;
            }
        }
    });

    via_changed
}

/// Packs the current routing table into advertisement frames. Returns the
/// number of frames written.
pub(crate) fn build_table_adverts(
    routing_table: &GuardedRoutingTable,
    own_address: NodeAddress,
    own_role: Role,
    own_gateway_load: u8,
    frames: &mut [RadioPacket; MAX_ADVERT_FRAMES],
) -> usize {
    let mut entries = [RouteEntry {
        dest: 0,
        via: 0,
        metric: 0,
        role: Role::NONE,
        gateway_load: GATEWAY_LOAD_UNKNOWN,
        received_snr: 0,
        expires_at: Instant::from_ticks(0),
    }; ROUTING_TABLE_SIZE];
    let count = routing_table.lock(|t| t.borrow().snapshot_all(&mut entries));

    let mut records = [NetworkNodeRecord::empty(); ROUTING_TABLE_SIZE];
    for i in 0..count {
        records[i] = NetworkNodeRecord {
            address: entries[i].dest,
            metric: entries[i].metric,
            role: entries[i].role.bits(),
            gateway_load: entries[i].gateway_load,
        };
    }

    build_advert_frames(own_address, own_role, own_gateway_load, &records[..count], RADIO_PACKET_SIZE, frames)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::link_quality::LinkQualityTracker;
    use crate::routing_table::RoutingTable;
    use core::cell::RefCell;
    use embassy_sync::blocking_mutex::Mutex;

    const SELF: NodeAddress = 0x0001;
    const NEIGHBOR: NodeAddress = 0x0002;

    struct Fixture {
        table: GuardedRoutingTable,
        links: GuardedLinks,
        counters: Counters,
        cost: CostConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                table: Mutex::new(RefCell::new(RoutingTable::new())),
                links: Mutex::new(RefCell::new(LinkQualityTracker::new())),
                counters: Counters::new(),
                cost: CostConfig::new(),
            }
        }

        fn process(&self, mode: RoutingMode, advert: &RouteAdvert, snr: i8, now: Instant) -> AdvertOutcome {
            process_advert(
                &self.table,
                &self.links,
                &self.cost,
                mode,
                SELF,
                advert,
                None,
                snr,
                &self.counters,
                now,
            )
        }
    }

    fn advert_from(src: NodeAddress, role: Role, gateway_load: u8, records: &[NetworkNodeRecord]) -> RouteAdvert {
        let mut frames = [const { RadioPacket::empty() }; MAX_ADVERT_FRAMES];
        let count = build_advert_frames(src, role, gateway_load, records, RADIO_PACKET_SIZE, &mut frames);
        assert_eq!(count, 1);
        RouteAdvert::parse(frames[0].payload()).unwrap()
    }

    fn now() -> Instant {
        Instant::from_ticks(0)
    }

    #[test]
    fn test_sender_installed_as_direct_neighbor() {
        let fixture = Fixture::new();
        let advert = advert_from(NEIGHBOR, Role::RELAY, GATEWAY_LOAD_UNKNOWN, &[]);

        let outcome = fixture.process(RoutingMode::HopCount, &advert, 5, now());
        assert!(outcome.inconsistent);

        fixture.table.lock(|t| {
            let t = t.borrow();
            let entry = t.find(NEIGHBOR).unwrap();
            assert_eq!(entry.via, NEIGHBOR);
            assert_eq!(entry.metric, 1);
            assert_eq!(entry.role, Role::RELAY);
            assert_eq!(entry.received_snr, 5);
        });
    }

    #[test]
    fn test_carried_records_gain_one_hop() {
        let fixture = Fixture::new();
        let records = [NetworkNodeRecord {
            address: 0x0005,
            metric: 1,
            role: Role::GATEWAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        let advert = advert_from(NEIGHBOR, Role::RELAY, GATEWAY_LOAD_UNKNOWN, &records);

        fixture.process(RoutingMode::HopCount, &advert, 5, now());

        fixture.table.lock(|t| {
            let t = t.borrow();
            let entry = t.find(0x0005).unwrap();
            assert_eq!(entry.metric, 2);
            assert_eq!(entry.via, NEIGHBOR);
        });
    }

    #[test]
    fn test_own_address_is_never_installed() {
        let fixture = Fixture::new();
        let records = [NetworkNodeRecord {
            address: SELF,
            metric: 1,
            role: Role::SENSOR.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        let advert = advert_from(NEIGHBOR, Role::RELAY, GATEWAY_LOAD_UNKNOWN, &records);

        fixture.process(RoutingMode::HopCount, &advert, 5, now());
        fixture.table.lock(|t| assert!(t.borrow().find(SELF).is_none()));
    }

    #[test]
    fn test_hop_mode_shorter_path_replaces() {
        let fixture = Fixture::new();
        let far = [NetworkNodeRecord {
            address: 0x0005,
            metric: 3,
            role: Role::GATEWAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        fixture.process(RoutingMode::HopCount, &advert_from(NEIGHBOR, Role::RELAY, 255, &far), 5, now());

        let near = [NetworkNodeRecord {
            address: 0x0005,
            metric: 1,
            role: Role::GATEWAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        let outcome = fixture.process(RoutingMode::HopCount, &advert_from(0x0003, Role::RELAY, 255, &near), 5, now());
        assert!(outcome.inconsistent);

        fixture.table.lock(|t| {
            let t = t.borrow();
            let entry = t.find(0x0005).unwrap();
            assert_eq!(entry.metric, 2);
            assert_eq!(entry.via, 0x0003);
        });
    }

    #[test]
    fn test_hop_mode_equal_metric_same_via_refreshes() {
        let fixture = Fixture::new();
        let records = [NetworkNodeRecord {
            address: 0x0005,
            metric: 1,
            role: Role::GATEWAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        let advert = advert_from(NEIGHBOR, Role::RELAY, 255, &records);
        fixture.process(RoutingMode::HopCount, &advert, 5, now());

        let first_expiry = fixture.table.lock(|t| t.borrow().find(0x0005).unwrap().expires_at);
        let later = now() + embassy_time::Duration::from_secs(100);
        let outcome = fixture.process(RoutingMode::HopCount, &advert, 5, later);
        assert!(!outcome.inconsistent);

        let second_expiry = fixture.table.lock(|t| t.borrow().find(0x0005).unwrap().expires_at);
        assert!(second_expiry > first_expiry);
    }

    #[test]
    fn test_hop_mode_rejects_metric_above_table_maximum() {
        let fixture = Fixture::new();
        // Only the direct neighbor is known: max metric 1.
        fixture.process(RoutingMode::HopCount, &advert_from(NEIGHBOR, Role::RELAY, 255, &[]), 5, now());

        let distant = [NetworkNodeRecord {
            address: 0x0009,
            metric: 5,
            role: Role::RELAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        fixture.process(RoutingMode::HopCount, &advert_from(NEIGHBOR, Role::RELAY, 255, &distant), 5, now());
        fixture.table.lock(|t| assert!(t.borrow().find(0x0009).is_none()));
    }

    #[test]
    fn test_cost_mode_requires_hysteresis_margin_to_switch() {
        let fixture = Fixture::new();
        let gw = [NetworkNodeRecord {
            address: 0x0005,
            metric: 1,
            role: Role::GATEWAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        // Install via NEIGHBOR over a decent link.
        fixture.links.lock(|l| l.borrow_mut().observe_data(NEIGHBOR, -80, 5, Some(0), now()));
        fixture.process(RoutingMode::GatewayCost, &advert_from(NEIGHBOR, Role::RELAY, 255, &gw), 5, now());

        // A second neighbor with a barely better link: 2-hop candidate
        // cannot undercut a 2-hop incumbent by 15%, no switch.
        fixture.links.lock(|l| l.borrow_mut().observe_data(0x0003, -75, 6, Some(0), now()));
        fixture.process(RoutingMode::GatewayCost, &advert_from(0x0003, Role::RELAY, 255, &gw), 6, now());

        fixture.table.lock(|t| {
            assert_eq!(t.borrow().find(0x0005).unwrap().via, NEIGHBOR);
        });
    }

    #[test]
    fn test_cost_mode_clean_two_hop_displaces_marginal_direct() {
        let fixture = Fixture::new();

        // Direct but marginal link to the gateway (weak-link penalty).
        for seq in 0..5u32 {
            fixture.links.lock(|l| l.borrow_mut().observe_data(0x0005, -128, -13, Some(seq), now()));
        }
        fixture.process(RoutingMode::GatewayCost, &advert_from(0x0005, Role::GATEWAY, 255, &[]), -13, now());

        // Clean relay that also reaches the gateway in one hop.
        for seq in 0..10u32 {
            fixture.links.lock(|l| l.borrow_mut().observe_data(NEIGHBOR, -95, 0, Some(seq), now()));
        }
        let via_relay = [NetworkNodeRecord {
            address: 0x0005,
            metric: 1,
            role: Role::GATEWAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        let outcome = fixture.process(RoutingMode::GatewayCost, &advert_from(NEIGHBOR, Role::RELAY, 255, &via_relay), 0, now());
        assert!(outcome.inconsistent);

        fixture.table.lock(|t| {
            let t = t.borrow();
            let entry = t.find(0x0005).unwrap();
            assert_eq!(entry.via, NEIGHBOR);
            assert_eq!(entry.metric, 2);
        });
    }

    #[test]
    fn test_gateway_load_updates_without_route_change() {
        let fixture = Fixture::new();
        let gw = [NetworkNodeRecord {
            address: 0x0005,
            metric: 1,
            role: Role::GATEWAY.bits(),
            gateway_load: 10,
        }];
        fixture.process(RoutingMode::HopCount, &advert_from(NEIGHBOR, Role::RELAY, 255, &gw), 5, now());

        let gw_updated = [NetworkNodeRecord {
            address: 0x0005,
            metric: 1,
            role: Role::GATEWAY.bits(),
            gateway_load: 42,
        }];
        fixture.process(RoutingMode::HopCount, &advert_from(NEIGHBOR, Role::RELAY, 255, &gw_updated), 5, now());

        fixture.table.lock(|t| {
            assert_eq!(t.borrow().find(0x0005).unwrap().gateway_load, 42);
        });
    }

    #[test]
    fn test_role_updates_only_from_current_next_hop() {
        let fixture = Fixture::new();
        let dest = [NetworkNodeRecord {
            address: 0x0005,
            metric: 1,
            role: Role::RELAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        fixture.process(RoutingMode::HopCount, &advert_from(NEIGHBOR, Role::RELAY, 255, &dest), 5, now());

        // Another neighbor claims a different role for 0x0005 but is not
        // our next hop towards it: ignored.
        let conflicting = [NetworkNodeRecord {
            address: 0x0005,
            metric: 3,
            role: Role::GATEWAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        fixture.process(RoutingMode::HopCount, &advert_from(0x0003, Role::RELAY, 255, &conflicting), 5, now());
        fixture.table.lock(|t| {
            assert_eq!(t.borrow().find(0x0005).unwrap().role, Role::RELAY);
        });

        // The current next hop reporting a role change is accepted.
        let promoted = [NetworkNodeRecord {
            address: 0x0005,
            metric: 1,
            role: Role::GATEWAY.bits(),
            gateway_load: GATEWAY_LOAD_UNKNOWN,
        }];
        fixture.process(RoutingMode::HopCount, &advert_from(NEIGHBOR, Role::RELAY, 255, &promoted), 5, now());
        fixture.table.lock(|t| {
            assert_eq!(t.borrow().find(0x0005).unwrap().role, Role::GATEWAY);
        });
    }

    #[test]
    fn test_consistent_advert_reports_no_change() {
        let fixture = Fixture::new();
        let advert = advert_from(NEIGHBOR, Role::RELAY, 255, &[]);
        assert!(fixture.process(RoutingMode::HopCount, &advert, 5, now()).inconsistent);
        // Same information again: pure refresh.
        assert!(!fixture.process(RoutingMode::HopCount, &advert, 5, now()).inconsistent);
    }

    #[test]
    fn test_build_adverts_round_trip_table() {
        let fixture = Fixture::new();
        let records = [
            NetworkNodeRecord {
                address: 0x0005,
                metric: 1,
                role: Role::GATEWAY.bits(),
                gateway_load: 9,
            },
            NetworkNodeRecord {
                address: 0x0006,
                metric: 2,
                role: Role::RELAY.bits(),
                gateway_load: GATEWAY_LOAD_UNKNOWN,
            },
        ];
        fixture.process(RoutingMode::HopCount, &advert_from(NEIGHBOR, Role::RELAY, 255, &records), 5, now());

        let mut frames = [const { RadioPacket::empty() }; MAX_ADVERT_FRAMES];
        let count = build_table_adverts(&fixture.table, SELF, Role::SENSOR, GATEWAY_LOAD_UNKNOWN, &mut frames);
        assert_eq!(count, 1);

        let advert = RouteAdvert::parse(frames[0].payload()).unwrap();
        assert_eq!(advert.src, SELF);
        // NEIGHBOR + the two carried destinations.
        assert_eq!(advert.nodes().len(), 3);
    }
}
