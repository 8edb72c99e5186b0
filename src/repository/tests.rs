use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use super::*;
use crate::deps::ManualClock;
use crate::error::MdnsError;
use crate::network_order::message::parse_packet;
use crate::rfc6762::{
    FLAGS_AUTHORITATIVE_RESPONSE, FLAGS_STANDARD_QUERY, MDNS_IPV4_GROUP, MDNS_PORT, TYPE_NSEC,
    TYPE_PTR,
};

const HOSTNAME: &str = "Android_000102030405060708090A0B0C0D0E0F.local";
const INSTANCE: &str = "MyTestService._testservice._tcp.local";
const TYPE: &str = "_testservice._tcp.local";

fn test_addresses() -> Vec<IpAddr> {
    vec![
        "192.0.2.111".parse().unwrap(),
        "2001:db8::111".parse().unwrap(),
        "2001:db8::222".parse().unwrap(),
    ]
}

fn v4_src() -> SocketAddr {
    "192.0.2.99:5353".parse().unwrap()
}

fn svc_info() -> NsdServiceInfo {
    NsdServiceInfo {
        service_name: "MyTestService".to_string(),
        service_type: DnsName::try_from("_testservice._tcp").unwrap(),
        port: 12345,
        txt: vec![TxtEntry::new("key", "value")],
        ..Default::default()
    }
}

fn setup() -> (Rc<ManualClock>, RecordRepository) {
    let clock = Rc::new(ManualClock::new(1_000));
    let mut repo = RecordRepository::new(
        clock.clone(),
        DnsName::try_from(HOSTNAME).unwrap(),
        EngineFeatures::default(),
    );
    repo.update_addresses(test_addresses());
    (clock, repo)
}

fn ptr_query(type_name: &str) -> MdnsPacket {
    let mut q = MdnsPacket::query();
    q.questions.push(MdnsQuestion::new(
        DnsName::try_from(type_name).unwrap(),
        TYPE_PTR,
    ));
    q
}

#[test]
fn probe_packet_shape() {
    let (_clock, mut repo) = setup();
    assert_eq!(repo.add_service(42, svc_info(), None).unwrap(), -1);

    let probing = repo.set_service_probing(42).unwrap();
    let packet = &probing.packet;

    assert_eq!(packet.flags, FLAGS_STANDARD_QUERY);
    assert_eq!(packet.questions.len(), 1);
    let q = &packet.questions[0];
    assert_eq!(q.name.to_string(), INSTANCE);
    assert_eq!(q.qtype, TYPE_ANY);
    assert!(!q.unicast_reply);

    assert_eq!(packet.authority.len(), 1);
    let auth = &packet.authority[0];
    assert_eq!(auth.ttl_ms, 120_000);
    match &auth.rdata {
        RData::Srv(srv) => {
            assert_eq!(srv.priority, 0);
            assert_eq!(srv.weight, 0);
            assert_eq!(srv.port, 12345);
            assert_eq!(srv.target.to_string(), HOSTNAME);
        }
        other => panic!("expected SRV authority, got {:?}", other),
    }
    assert!(repo.is_probing(42));
}

#[test]
fn announcement_is_complete_and_ordered() {
    let (_clock, mut repo) = setup();
    let mut info = svc_info();
    info.subtypes = vec!["_printer".to_string()];
    repo.add_service(42, info, None).unwrap();

    let probing = repo.set_service_probing(42).unwrap();
    let ann = repo.on_probing_succeeded(&probing).unwrap();
    let packet = &ann.packet;

    assert_eq!(packet.flags, FLAGS_AUTHORITATIVE_RESPONSE);
    assert!(packet.questions.is_empty());
    assert!(!repo.is_probing(42));

    // answers: (revPTR, addr) per address, then PTR, subtype PTR, SRV, TXT,
    // enumeration PTR
    let shapes: Vec<(String, u16, u64)> = packet
        .answers
        .iter()
        .map(|r| (r.name.to_string(), r.rtype(), r.ttl_ms))
        .collect();
    assert_eq!(shapes.len(), 11);
    assert_eq!(
        shapes[0],
        (
            "111.2.0.192.in-addr.arpa".to_string(),
            TYPE_PTR,
            120_000
        )
    );
    assert_eq!(shapes[1], (HOSTNAME.to_string(), TYPE_A, 120_000));
    assert_eq!(shapes[2].1, TYPE_PTR); // 1.1.1.0...ip6.arpa
    assert_eq!(shapes[3], (HOSTNAME.to_string(), TYPE_AAAA, 120_000));
    assert_eq!(shapes[4].1, TYPE_PTR);
    assert_eq!(shapes[5], (HOSTNAME.to_string(), TYPE_AAAA, 120_000));
    assert_eq!(shapes[6], (TYPE.to_string(), TYPE_PTR, 4_500_000));
    assert_eq!(
        shapes[7],
        (
            format!("_printer._sub.{}", TYPE),
            TYPE_PTR,
            4_500_000
        )
    );
    assert_eq!(shapes[8], (INSTANCE.to_string(), TYPE_SRV, 120_000));
    assert_eq!(shapes[9], (INSTANCE.to_string(), TYPE_TXT, 4_500_000));
    assert_eq!(
        shapes[10],
        (
            "_services._dns-sd._udp.local".to_string(),
            TYPE_PTR,
            4_500_000
        )
    );

    // cache-flush: set on unique names, never on shared PTRs
    for rec in &packet.answers {
        let shared = rec.rtype() == TYPE_PTR && !rec.name.to_string().contains("arpa");
        assert_eq!(rec.cache_flush, !shared, "flush wrong for {}", rec.name);
    }

    // additionals: NSEC per reverse-PTR owner, host, instance
    assert_eq!(packet.additional.len(), 5);
    assert!(packet.additional.iter().all(|r| r.rtype() == TYPE_NSEC));
    let nsec_types = |i: usize| match &packet.additional[i].rdata {
        RData::Nsec(n) => n.types.clone(),
        _ => unreachable!(),
    };
    assert_eq!(nsec_types(0), vec![TYPE_PTR]);
    assert_eq!(nsec_types(3), vec![TYPE_A, TYPE_AAAA]);
    assert_eq!(nsec_types(4), vec![TYPE_TXT, TYPE_SRV]);
    assert_eq!(packet.additional[4].name.to_string(), INSTANCE);
}

#[test]
fn goodbye_zeroes_the_shared_ptrs() {
    let (_clock, mut repo) = setup();
    let mut info = svc_info();
    info.subtypes = vec!["_printer".to_string()];
    repo.add_service(42, info, None).unwrap();
    repo.on_advertisement_sent(42, 2);

    let goodbye = repo.exit_service(42).expect("announced service must say goodbye");
    let packet = &goodbye.packet;

    assert_eq!(packet.flags, FLAGS_AUTHORITATIVE_RESPONSE);
    assert_eq!(packet.answers.len(), 2);
    for rec in &packet.answers {
        assert_eq!(rec.rtype(), TYPE_PTR);
        assert_eq!(rec.ttl_ms, 0);
        match &rec.rdata {
            RData::Ptr(target) => assert_eq!(target.to_string(), INSTANCE),
            _ => unreachable!(),
        }
    }
    // the enumeration pointer is not taken back by name
    assert!(packet
        .answers
        .iter()
        .all(|r| !r.name.to_string().starts_with("_services")));
}

#[test]
fn exit_before_any_announcement_is_silent() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();
    assert!(repo.exit_service(42).is_none());
}

#[test]
fn exited_name_is_resurrected_under_its_old_id() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();
    repo.on_advertisement_sent(42, 2);
    assert!(repo.exit_service(42).is_some());

    // same name again: the old id is reported, the new id takes over
    assert_eq!(repo.add_service(77, svc_info(), None).unwrap(), 42);
    assert!(repo.replied_requests(42).is_none());
    assert!(repo.replied_requests(77).is_some());
}

#[test]
fn duplicate_id_and_name_conflicts_are_rejected() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();

    assert!(matches!(
        repo.add_service(42, svc_info(), None),
        Err(MdnsError::DuplicateId(42))
    ));

    // same instance name, different casing, still taken
    let mut clashing = svc_info();
    clashing.service_name = "MYTESTSERVICE".to_string();
    assert!(matches!(
        repo.add_service(43, clashing, None),
        Err(MdnsError::NameConflict(_))
    ));
}

#[test]
fn reply_echoes_the_senders_casing() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();

    let query = ptr_query("_TESTSERVICE._TCP.local");
    let reply = repo.get_reply(&query, v4_src()).expect("reply expected");

    assert_eq!(reply.packet.answers.len(), 1);
    let answer = &reply.packet.answers[0];
    assert_eq!(answer.name.to_string(), "_TESTSERVICE._TCP.local");
    match &answer.rdata {
        RData::Ptr(target) => assert_eq!(target.to_string(), INSTANCE),
        other => panic!("expected the service PTR, got {:?}", other),
    }

    // additionals: SRV, TXT, three addresses, NSEC(instance), NSEC(host)
    assert_eq!(reply.packet.additional.len(), 7);
    let types: Vec<u16> = reply.packet.additional.iter().map(|r| r.rtype()).collect();
    assert_eq!(
        types,
        vec![TYPE_SRV, TYPE_TXT, TYPE_A, TYPE_AAAA, TYPE_AAAA, TYPE_NSEC, TYPE_NSEC]
    );

    // shared-name answers are jittered into the 20-120 ms window
    assert!((20..=120).contains(&reply.send_delay_ms));

    // destination is the IPv4 group for an IPv4 querier
    assert_eq!(
        reply.destination,
        SocketAddr::new(IpAddr::V4(MDNS_IPV4_GROUP), MDNS_PORT)
    );

    assert_eq!(repo.replied_requests(42), Some(1));
}

#[test]
fn reply_throttling_per_destination_group() {
    let (clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();

    assert!(repo.get_reply(&ptr_query(TYPE), v4_src()).is_some());

    // 500 ms later the same answer is suppressed by the 1 s rate limit
    clock.advance(500);
    assert!(repo.get_reply(&ptr_query(TYPE), v4_src()).is_none());

    // past the window both replies go out
    clock.advance(621);
    assert!(repo.get_reply(&ptr_query(TYPE), v4_src()).is_some());
}

#[test]
fn throttle_covers_distinct_records_to_the_same_group() {
    let (clock, mut repo) = setup();
    repo.add_service(1, svc_info(), None).unwrap();

    let mut other = svc_info();
    other.service_name = "OtherService".to_string();
    other.service_type = DnsName::try_from("_otherservice._tcp").unwrap();
    repo.add_service(2, other, None).unwrap();

    assert!(repo.get_reply(&ptr_query(TYPE), v4_src()).is_some());

    // a never-sent record of the other service, same group, inside the
    // window: the whole reply is still held back
    clock.advance(500);
    assert!(repo
        .get_reply(&ptr_query("_otherservice._tcp.local"), v4_src())
        .is_none());

    // once the group window reopens it goes out
    clock.advance(600);
    assert!(repo
        .get_reply(&ptr_query("_otherservice._tcp.local"), v4_src())
        .is_some());
}

#[test]
fn unicast_replies_bypass_the_throttle() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();

    let mut query = ptr_query(TYPE);
    query.questions[0].unicast_reply = true;

    let first = repo.get_reply(&query, v4_src()).unwrap();
    assert_eq!(first.destination, v4_src());
    // immediately again: unicast replies are not rate limited
    assert!(repo.get_reply(&query, v4_src()).is_some());
}

#[test]
fn known_answer_suppression_honors_half_ttl() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();

    let our_ptr = RData::Ptr(DnsName::try_from(INSTANCE).unwrap());

    // remaining TTL above half of 4500 s: suppressed entirely
    let mut query = ptr_query(TYPE);
    query.answers.push(MdnsRecord::new(
        DnsName::try_from(TYPE).unwrap(),
        false,
        3_000_000,
        our_ptr.clone(),
    ));
    assert!(repo.get_reply(&query, v4_src()).is_none());

    // remaining TTL below half: the answer must be refreshed
    let mut query = ptr_query(TYPE);
    query.answers.push(MdnsRecord::new(
        DnsName::try_from(TYPE).unwrap(),
        false,
        1_000_000,
        our_ptr,
    ));
    assert!(repo.get_reply(&query, v4_src()).is_some());
}

#[test]
fn truncated_query_waits_for_its_continuation() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();

    let mut first = ptr_query(TYPE);
    first.flags |= crate::rfc6762::FLAG_TRUNCATED;
    assert!(repo.get_reply(&first, v4_src()).is_none());

    // continuation carries no questions; the held ones are replayed
    let continuation = MdnsPacket::query();
    let reply = repo.get_reply(&continuation, v4_src()).expect("merged reply");
    assert_eq!(reply.packet.answers.len(), 1);
}

#[test]
fn probing_services_do_not_answer() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();
    repo.set_service_probing(42).unwrap();
    assert!(repo.get_reply(&ptr_query(TYPE), v4_src()).is_none());
}

#[test]
fn identical_records_never_conflict() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();

    let mut packet = MdnsPacket::authoritative_response();
    // byte-identical SRV and TXT, deliberately at a different TTL
    packet.answers.push(MdnsRecord::new(
        DnsName::try_from(INSTANCE).unwrap(),
        true,
        999_000,
        RData::Srv(SrvData {
            priority: 0,
            weight: 0,
            port: 12345,
            target: DnsName::try_from(HOSTNAME).unwrap(),
        }),
    ));
    packet.answers.push(MdnsRecord::new(
        DnsName::try_from(INSTANCE).unwrap(),
        true,
        999_000,
        RData::Txt(vec![TxtEntry::new("key", "value")]),
    ));

    assert!(repo.get_conflicting_services(&packet).is_empty());
}

#[test]
fn different_rdata_conflicts() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();

    let mut packet = MdnsPacket::authoritative_response();
    packet.answers.push(MdnsRecord::new(
        DnsName::try_from(INSTANCE).unwrap(),
        true,
        120_000,
        RData::Srv(SrvData {
            priority: 0,
            weight: 0,
            port: 5555, // not our port
            target: DnsName::try_from("other-host.local").unwrap(),
        }),
    ));

    let conflicts = repo.get_conflicting_services(&packet);
    assert_eq!(conflicts.get(&42), Some(&CONFLICT_SERVICE));
}

#[test]
fn probing_conflicts_even_on_identical_content() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();
    repo.set_service_probing(42).unwrap();

    let mut packet = MdnsPacket::query();
    packet.authority.push(MdnsRecord::new(
        DnsName::try_from(INSTANCE).unwrap(),
        true,
        120_000,
        RData::Srv(SrvData {
            priority: 0,
            weight: 0,
            port: 12345,
            target: DnsName::try_from(HOSTNAME).unwrap(),
        }),
    ));

    let conflicts = repo.get_conflicting_services(&packet);
    assert_eq!(conflicts.get(&42), Some(&CONFLICT_SERVICE));
}

#[test]
fn custom_host_subset_is_not_a_conflict() {
    let (_clock, mut repo) = setup();
    let mut info = svc_info();
    info.custom_hostname = Some(DnsName::try_from("MyHost").unwrap());
    info.host_addresses = vec![
        "192.0.2.1".parse().unwrap(),
        "192.0.2.2".parse().unwrap(),
    ];
    repo.add_service(42, info, None).unwrap();

    // a subset of our own addresses: someone echoing us
    let mut packet = MdnsPacket::authoritative_response();
    packet.answers.push(MdnsRecord::new(
        DnsName::try_from("MyHost.local").unwrap(),
        true,
        120_000,
        RData::A("192.0.2.1".parse().unwrap()),
    ));
    assert!(repo.get_conflicting_services(&packet).is_empty());

    // a disagreeing address: a competing host
    let mut packet = MdnsPacket::authoritative_response();
    packet.answers.push(MdnsRecord::new(
        DnsName::try_from("MyHost.local").unwrap(),
        true,
        120_000,
        RData::A("198.51.100.7".parse().unwrap()),
    ));
    let conflicts = repo.get_conflicting_services(&packet);
    assert_eq!(conflicts.get(&42), Some(&CONFLICT_HOST));
}

#[test]
fn key_records_conflict_only_when_bytes_differ() {
    let (_clock, mut repo) = setup();
    let mut info = svc_info();
    info.public_key = Some(vec![1, 2, 3, 4]);
    repo.add_service(42, info, None).unwrap();

    let mut same = MdnsPacket::authoritative_response();
    same.answers.push(MdnsRecord::new(
        DnsName::try_from(INSTANCE).unwrap(),
        true,
        120_000,
        RData::Key(vec![1, 2, 3, 4]),
    ));
    assert!(repo.get_conflicting_services(&same).is_empty());

    let mut differs = MdnsPacket::authoritative_response();
    differs.answers.push(MdnsRecord::new(
        DnsName::try_from(INSTANCE).unwrap(),
        true,
        120_000,
        RData::Key(vec![9, 9, 9, 9]),
    ));
    let conflicts = repo.get_conflicting_services(&differs);
    assert_eq!(conflicts.get(&42), Some(&CONFLICT_SERVICE));
}

#[test]
fn offload_packet_has_no_nsec_and_no_questions() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();

    let bytes = repo.get_offload_packet(42).unwrap();
    let packet = parse_packet(&bytes, 0).unwrap();

    assert_eq!(packet.flags, FLAGS_AUTHORITATIVE_RESPONSE);
    assert!(packet.questions.is_empty());
    assert!(packet.additional.is_empty());
    let types: Vec<u16> = packet.answers.iter().map(|r| r.rtype()).collect();
    assert_eq!(
        types,
        vec![TYPE_PTR, TYPE_SRV, TYPE_TXT, TYPE_A, TYPE_AAAA, TYPE_AAAA]
    );
    assert!(packet.answers.iter().all(|r| r.rtype() != TYPE_NSEC));

    assert!(matches!(
        repo.get_offload_packet(99),
        Err(MdnsError::UnknownId(99))
    ));
}

#[test]
fn hostname_restarts_cover_only_matching_services() {
    let (_clock, mut repo) = setup();
    repo.add_service(1, svc_info(), None).unwrap();

    let mut other = svc_info();
    other.service_name = "OtherService".to_string();
    other.custom_hostname = Some(DnsName::try_from("Elsewhere").unwrap());
    other.host_addresses = vec!["192.0.2.50".parse().unwrap()];
    repo.add_service(2, other, None).unwrap();

    let hostname = DnsName::try_from(HOSTNAME).unwrap();
    let probes = repo.restart_probing_for_hostname(&hostname);
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].service_id, 1);
    assert!(repo.is_probing(1));

    let announcements =
        repo.restart_announcing_for_hostname(&DnsName::try_from("Elsewhere.local").unwrap());
    assert_eq!(announcements.len(), 1);
    assert_eq!(announcements[0].service_id, 2);
}

#[test]
fn update_service_swaps_subtype_ptrs() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), None).unwrap();
    repo.update_service(42, vec!["_color".to_string()]).unwrap();

    let probing = repo.set_service_probing(42).unwrap();
    let ann = repo.on_probing_succeeded(&probing).unwrap();
    let subtype_owner = format!("_color._sub.{}", TYPE);
    assert!(ann
        .packet
        .answers
        .iter()
        .any(|r| r.name.to_string() == subtype_owner));

    assert!(matches!(
        repo.update_service(99, Vec::new()),
        Err(MdnsError::UnknownId(99))
    ));
}

#[test]
fn ttl_override_applies_to_every_service_record() {
    let (_clock, mut repo) = setup();
    repo.add_service(42, svc_info(), Some(10_000)).unwrap();

    let probing = repo.set_service_probing(42).unwrap();
    let ann = repo.on_probing_succeeded(&probing).unwrap();
    for rec in &ann.packet.answers {
        if rec.name.to_string().contains("_testservice")
            || rec.name.to_string().starts_with("_services")
        {
            assert_eq!(rec.ttl_ms, 10_000, "override missed {}", rec.name);
        }
    }
}
