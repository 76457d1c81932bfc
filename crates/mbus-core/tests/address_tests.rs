//! Address matching and canonicalization tests

use mbus_core::Address;

#[test]
fn test_canonical_form_is_sorted() {
    let a = Address::parse("(zone:3 app:mixer id:9-9@10.0.0.1)").unwrap();
    let b = Address::parse("(id:9-9@10.0.0.1 zone:3 app:mixer)").unwrap();
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(a, b);
}

#[test]
fn test_wildcard_matching_is_symmetric() {
    let wild = Address::parse("(app:*)").unwrap();
    let concrete = Address::parse("(app:mixer)").unwrap();

    assert!(wild.matches(&concrete));
    assert!(concrete.matches(&wild));
    // structural equality stays strict
    assert_ne!(wild, concrete);
}

#[test]
fn test_subset_vacuous_on_empty_constraint() {
    let mine = Address::parse("(app:mixer id:1-0@127.0.0.1)").unwrap();
    assert!(mine.is_subset_of(&Address::new()));
}

#[test]
fn test_subset_fails_on_missing_key() {
    let mine = Address::parse("(app:mixer)").unwrap();
    let constraint = Address::parse("(zone:3)").unwrap();
    assert!(!mine.is_subset_of(&constraint));
}

#[test]
fn test_subset_with_wildcard_value() {
    let mine = Address::parse("(app:mixer zone:3)").unwrap();
    let constraint = Address::parse("(zone:*)").unwrap();
    assert!(mine.is_subset_of(&constraint));
}

#[test]
fn test_different_element_counts_never_match() {
    let small = Address::parse("(app:mixer)").unwrap();
    let big = Address::parse("(app:mixer zone:3)").unwrap();
    assert!(!small.matches(&big));
    assert!(!big.matches(&small));
}

#[test]
fn test_disambiguate_shape() {
    let mut addr = Address::parse("(app:test)").unwrap();
    assert!(!addr.is_unique());
    addr.disambiguate();
    assert!(addr.is_unique());

    let id = addr.identity().unwrap();
    // pid-counter@ipv4
    let (pid_counter, host) = id.split_once('@').expect("missing '@'");
    assert!(pid_counter.split_once('-').is_some());
    assert!(host.parse::<std::net::IpAddr>().is_ok());
}

#[test]
fn test_identity_lookup() {
    let addr = Address::parse("(app:a id:42-0@10.1.1.1)").unwrap();
    assert_eq!(addr.identity(), Some("42-0@10.1.1.1"));
    assert_eq!(Address::parse("(app:a)").unwrap().identity(), None);
}
