/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::{Duration, Instant};

use common::config::smtp::resolver::{Mode, SecurityPolicy};
use mail_auth::MX;
use smtp::outbound::{
    lookup::MxLookup,
    mta_sts::{lookup::MtaStsLookup, STS_TEST_POLICY},
};

use crate::smtp::{DnsCache, TestSMTP};

fn in_one_hour() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

fn set_test_policy(policy: &str) {
    let mut lock = STS_TEST_POLICY.lock();
    lock.clear();
    lock.extend_from_slice(policy.as_bytes());
}

#[tokio::test]
#[serial_test::serial]
async fn policy_is_discovered_and_cached() {
    let test = TestSMTP::new("smtp_sts_lookup");
    test.server.txt_add(
        "_mta-sts.sts.test",
        vec!["v=STSv1; id=20240101T000000".to_string()],
        in_one_hour(),
    );
    set_test_policy("version: STSv1\nmode: enforce\nmx: mx.sts.test\nmax_age: 604800\n");

    let policy = test
        .server
        .lookup_mta_sts_policy("sts.test", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(policy.id, "20240101T000000");
    assert_eq!(policy.mode, Mode::Enforce);
    assert!(policy.verify("mx.sts.test"));

    // Same record id: the cached policy is reused even when the body on
    // the policy host changes.
    set_test_policy("version: STSv1\nmode: none\nmx: other.test\n");
    let cached = test
        .server
        .lookup_mta_sts_policy("sts.test", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(cached.mode, Mode::Enforce);
}

#[tokio::test]
#[serial_test::serial]
async fn multiple_sts_records_mean_no_policy() {
    let test = TestSMTP::new("smtp_sts_multiple");
    test.server.txt_add(
        "_mta-sts.dup.test",
        vec![
            "v=STSv1; id=1".to_string(),
            "v=STSv1; id=2".to_string(),
        ],
        in_one_hour(),
    );
    assert!(test
        .server
        .lookup_mta_sts_policy("dup.test", Duration::from_secs(5))
        .await
        .is_err());
}

#[tokio::test]
#[serial_test::serial]
async fn sts_filters_non_matching_mx_hosts() {
    let test = TestSMTP::new("smtp_sts_filter");
    test.server.mx_add(
        "filtered.test",
        vec![
            MX {
                preference: 10,
                exchanges: vec!["mx1.filtered.test".to_string()],
            },
            MX {
                preference: 20,
                exchanges: vec!["rogue.elsewhere.test".to_string()],
            },
        ],
        in_one_hour(),
    );
    test.server.txt_add(
        "_mta-sts.filtered.test",
        vec!["v=STSv1; id=77".to_string()],
        in_one_hour(),
    );
    set_test_policy("version: STSv1\nmode: enforce\nmx: *.filtered.test\n");

    let policies = test.server.resolve_policies("filtered.test").await.unwrap();
    assert_eq!(policies.len(), 1);
    match &policies[0] {
        SecurityPolicy::MtaSts { mx, mode } => {
            assert_eq!(mx, "mx1.filtered.test");
            assert_eq!(*mode, Mode::Enforce);
        }
        other => panic!("expected MTA-STS policy, got {other:?}"),
    }
    assert!(policies[0].tls_mandatory());
}

#[tokio::test]
#[serial_test::serial]
async fn testing_mode_is_not_enforcing() {
    let test = TestSMTP::new("smtp_sts_testing");
    test.server.mx_add(
        "soft.test",
        vec![MX {
            preference: 10,
            exchanges: vec!["mx.soft.test".to_string()],
        }],
        in_one_hour(),
    );
    test.server.txt_add(
        "_mta-sts.soft.test",
        vec!["v=STSv1; id=5".to_string()],
        in_one_hour(),
    );
    set_test_policy("version: STSv1\nmode: testing\nmx: mx.soft.test\n");

    let policies = test.server.resolve_policies("soft.test").await.unwrap();
    assert!(matches!(
        &policies[0],
        SecurityPolicy::MtaSts { mode: Mode::Testing, .. }
    ));
    assert!(!policies[0].tls_mandatory());
}

#[tokio::test]
#[serial_test::serial]
async fn no_matching_mx_falls_back_to_opportunistic() {
    let test = TestSMTP::new("smtp_sts_fallthrough");
    test.server.mx_add(
        "mismatch.test",
        vec![MX {
            preference: 10,
            exchanges: vec!["mx.mismatch.test".to_string()],
        }],
        in_one_hour(),
    );
    test.server.txt_add(
        "_mta-sts.mismatch.test",
        vec!["v=STSv1; id=9".to_string()],
        in_one_hour(),
    );
    set_test_policy("version: STSv1\nmode: enforce\nmx: mx.somewhere-else.test\n");

    let policies = test.server.resolve_policies("mismatch.test").await.unwrap();
    assert_eq!(policies.len(), 1);
    assert!(matches!(
        &policies[0],
        SecurityPolicy::Opportunistic { mx } if mx == "mx.mismatch.test"
    ));
}
