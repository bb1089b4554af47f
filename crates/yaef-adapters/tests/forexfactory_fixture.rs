use chrono::NaiveDate;
use yaef_adapters::{group_economic_events, parse_economic_page};
use yaef_core::{DayKey, Impact};

fn fixture() -> String {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    std::fs::read_to_string(root.join("fixtures/forexfactory/calendar_week.html"))
        .expect("calendar fixture")
}

#[test]
fn fixture_week_groups_into_two_days() {
    let events = parse_economic_page(&fixture()).expect("parse fixture");
    let reference = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
    let grouped = group_economic_events(events, reference);

    assert_eq!(grouped.dropped, 0);
    let keys: Vec<_> = grouped
        .calendar
        .day_keys()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(keys, vec!["Tuesday, 03/05/2024", "Monday, 03/04/2024"]);

    let tuesday = grouped
        .calendar
        .get(&DayKey::new(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()))
        .unwrap();
    assert_eq!(tuesday.len(), 2);
    assert_eq!(tuesday[0].impact, Some(Impact::NonEconomic));
    assert_eq!(tuesday[1].currency.as_deref(), Some("JPY"));
}
