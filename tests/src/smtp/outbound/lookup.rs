/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::{Duration, Instant};

use common::config::smtp::resolver::{
    CertUsage, SecurityPolicy, Tlsa, TlsaEntry, TlsaMatching, TlsaSelector,
};
use mail_auth::MX;
use smtp::outbound::lookup::MxLookup;

use crate::smtp::{DnsCache, TestSMTP};

fn in_one_hour() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

fn spki_tlsa() -> Tlsa {
    Tlsa {
        entries: vec![TlsaEntry {
            usage: CertUsage::DaneEe,
            selector: TlsaSelector::Spki,
            matching: TlsaMatching::Sha256,
            data: vec![1u8; 32],
        }],
        has_end_entities: true,
        has_intermediates: false,
    }
}

#[tokio::test]
#[serial_test::serial]
async fn dane_takes_precedence_over_mta_sts() {
    let test = TestSMTP::new("smtp_lookup_dane");
    let core = &test.server;

    core.mx_add(
        "secure.test",
        vec![
            MX {
                preference: 10,
                exchanges: vec!["mx1.secure.test".to_string()],
            },
            MX {
                preference: 20,
                exchanges: vec!["mx2.secure.test".to_string()],
            },
        ],
        in_one_hour(),
    );
    // Only mx1 publishes a usable TLSA set.
    core.tlsa_add("_25._tcp.mx1.secure.test", spki_tlsa(), in_one_hour());
    // An MTA-STS policy that covers neither host: were it consulted, both
    // hosts would be dropped.
    core.txt_add(
        "_mta-sts.secure.test",
        vec!["v=STSv1; id=20240101".to_string()],
        in_one_hour(),
    );
    smtp::outbound::mta_sts::STS_TEST_POLICY.lock().clear();
    smtp::outbound::mta_sts::STS_TEST_POLICY.lock().extend_from_slice(
        b"version: STSv1\nmode: enforce\nmx: unrelated.example\n",
    );

    let policies = test.server.resolve_policies("secure.test").await.unwrap();
    assert_eq!(policies.len(), 2);
    match &policies[0] {
        SecurityPolicy::Dane { mx, tlsa } => {
            assert_eq!(mx, "mx1.secure.test");
            assert!(tlsa.has_entries());
        }
        other => panic!("expected DANE for mx1, got {other:?}"),
    }
    match &policies[1] {
        SecurityPolicy::Opportunistic { mx } => assert_eq!(mx, "mx2.secure.test"),
        other => panic!("expected opportunistic for mx2, got {other:?}"),
    }
    assert!(policies[0].tls_mandatory());
    assert!(!policies[1].tls_mandatory());
}

#[tokio::test]
#[serial_test::serial]
async fn plain_domains_are_opportunistic() {
    let test = TestSMTP::new("smtp_lookup_opportunistic");
    test.server.mx_add(
        "plain.test",
        vec![MX {
            preference: 5,
            exchanges: vec!["mx.plain.test".to_string()],
        }],
        in_one_hour(),
    );
    test.server.txt_add_none("_mta-sts.plain.test", in_one_hour());

    let policies = test.server.resolve_policies("plain.test").await.unwrap();
    assert_eq!(policies.len(), 1);
    assert!(matches!(
        &policies[0],
        SecurityPolicy::Opportunistic { mx } if mx == "mx.plain.test"
    ));
}

#[tokio::test]
#[serial_test::serial]
async fn missing_mx_synthesizes_an_implicit_host() {
    let test = TestSMTP::new("smtp_lookup_implicit");
    test.server.mx_add("bare.test", Vec::new(), in_one_hour());
    test.server.txt_add_none("_mta-sts.bare.test", in_one_hour());

    let servers = test.server.canonical_mx_set("bare.test").await.unwrap();
    assert_eq!(servers, vec![(0, "bare.test".to_string())]);
}

#[tokio::test]
#[serial_test::serial]
async fn routes_group_domains_by_canonical_mx_set() {
    let test = TestSMTP::new("smtp_lookup_routes");
    let core = &test.server;

    for domain in ["d1.test", "d2.test"] {
        core.mx_add(
            domain,
            vec![MX {
                preference: 10,
                exchanges: vec!["mxa.shared.test".to_string()],
            }],
            in_one_hour(),
        );
    }
    core.mx_add(
        "d3.test",
        vec![MX {
            preference: 10,
            exchanges: vec!["mxb.shared.test".to_string()],
        }],
        in_one_hour(),
    );
    core.ipv4_add(
        "mxa.shared.test",
        vec!["192.0.2.10".parse().unwrap()],
        in_one_hour(),
    );
    core.ipv4_add(
        "mxb.shared.test",
        vec!["192.0.2.11".parse().unwrap()],
        in_one_hour(),
    );

    let domains = vec![
        "d1.test".to_string(),
        "d2.test".to_string(),
        "d3.test".to_string(),
    ];
    let resolution = test.server.resolve_routes(&domains).await;
    assert!(resolution.failed.is_empty());
    assert_eq!(resolution.routes.len(), 2);

    let first = &resolution.routes[0];
    assert_eq!(first.domains, vec!["d1.test", "d2.test"]);
    assert_eq!(first.servers[0].hostname, "mxa.shared.test");
    assert_eq!(
        first.servers[0].ips,
        vec!["192.0.2.10".parse::<std::net::IpAddr>().unwrap()]
    );

    let second = &resolution.routes[1];
    assert_eq!(second.domains, vec!["d3.test"]);

    // Route identity is stable across resolutions.
    let again = test.server.resolve_routes(&domains).await;
    assert_eq!(again.routes[0].hash, first.hash);
    assert_ne!(first.hash, second.hash);
    assert_eq!(first.hash.len(), 64);
}
